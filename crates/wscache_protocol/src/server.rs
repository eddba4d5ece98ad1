//! Server capability flags.

use serde::{Deserialize, Serialize};

/// Capabilities advertised by the remote repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// The server accepts multi-instance changeset requests.
    pub supports_changesets: bool,
    /// The server accepts file content separately from instance creation.
    pub supports_file_upload_url: bool,
    /// The server can answer a query restricted to a list of instance ids.
    pub supports_instance_queries: bool,
}

impl ServerInfo {
    /// A server with every capability enabled.
    pub fn full() -> Self {
        Self {
            supports_changesets: true,
            supports_file_upload_url: true,
            supports_instance_queries: true,
        }
    }

    /// A server that only understands single-instance requests.
    pub fn basic() -> Self {
        Self::default()
    }

    /// Sets changeset support.
    pub fn with_changesets(mut self, enabled: bool) -> Self {
        self.supports_changesets = enabled;
        self
    }

    /// Sets separate file upload support.
    pub fn with_file_upload_url(mut self, enabled: bool) -> Self {
        self.supports_file_upload_url = enabled;
        self
    }

    /// Sets instance query support.
    pub fn with_instance_queries(mut self, enabled: bool) -> Self {
        self.supports_instance_queries = enabled;
        self
    }
}
