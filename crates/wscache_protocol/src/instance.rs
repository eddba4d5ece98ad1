//! Pulled data: instances, query responses and file responses.

use crate::ids::RemoteId;
use crate::Properties;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata of a file attached to a remote instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileInfo {
    /// File name.
    pub name: String,
    /// Size in bytes, if the server reports it.
    pub size: Option<u64>,
}

/// An instance returned by the remote repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteInstance {
    /// Remote identifier.
    pub id: RemoteId,
    /// Display label.
    pub label: Option<String>,
    /// Instance properties (possibly partial).
    pub properties: Properties,
    /// Attached file, for file-backed objects.
    pub file: Option<RemoteFileInfo>,
}

impl RemoteInstance {
    /// Creates an instance with no properties.
    pub fn new(id: RemoteId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Sets the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets a property.
    pub fn with_property(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Marks the instance as file-backed.
    pub fn with_file(mut self, name: impl Into<String>, size: Option<u64>) -> Self {
        self.file = Some(RemoteFileInfo {
            name: name.into(),
            size,
        });
        self
    }

    /// Returns true if the instance carries a file.
    pub fn is_file_backed(&self) -> bool {
        self.file.is_some()
    }
}

/// Response to a get-object or query request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectsResponse {
    /// Returned instances. Empty when `not_modified` is set.
    pub instances: Vec<RemoteInstance>,
    /// Cache validation tag for the whole response.
    pub cache_tag: Option<String>,
    /// Continuation token when more pages are available.
    pub skip_token: Option<String>,
    /// The server confirmed the cached copy is still current.
    pub not_modified: bool,
}

impl ObjectsResponse {
    /// Creates a complete (single page) response.
    pub fn new(instances: Vec<RemoteInstance>, cache_tag: Option<String>) -> Self {
        Self {
            instances,
            cache_tag,
            skip_token: None,
            not_modified: false,
        }
    }

    /// Creates a "not modified" response.
    pub fn not_modified() -> Self {
        Self {
            not_modified: true,
            ..Self::default()
        }
    }

    /// Sets the continuation token.
    pub fn with_skip_token(mut self, token: impl Into<String>) -> Self {
        self.skip_token = Some(token.into());
        self
    }

    /// Returns true if more pages follow.
    pub fn has_more(&self) -> bool {
        self.skip_token.is_some()
    }
}

/// Response to a get-file request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResponse {
    /// Where the downloaded file was written.
    pub path: PathBuf,
    /// Cache validation tag of the file.
    pub cache_tag: Option<String>,
    /// The server confirmed the cached copy is still current; nothing was
    /// written to `path`.
    pub not_modified: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_builder() {
        let instance = RemoteInstance::new(RemoteId::parse("S.C", "A"))
            .with_label("Alpha")
            .with_property("Name", serde_json::json!("a"))
            .with_file("a.txt", Some(3));

        assert_eq!(instance.label.as_deref(), Some("Alpha"));
        assert_eq!(instance.properties["Name"], serde_json::json!("a"));
        assert!(instance.is_file_backed());
    }

    #[test]
    fn paging() {
        let page = ObjectsResponse::new(vec![], Some("tag".into())).with_skip_token("next");
        assert!(page.has_more());
        assert!(!ObjectsResponse::not_modified().has_more());
    }
}
