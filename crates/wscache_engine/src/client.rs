//! Remote repository client abstraction.

use crate::progress::TransferProgress;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use wscache_protocol::{
    Changeset, ChangesetResponse, ClientResult, FileResponse, ObjectsResponse, Properties, Query,
    RemoteId, ServerInfo,
};

/// A client for the remote object repository.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, mock for testing, etc.). Implementations classify
/// every failure into a [`ClientError`](wscache_protocol::ClientError) and
/// return [`ClientErrorKind::Canceled`](wscache_protocol::ClientErrorKind)
/// when `cancel` fires before the request completes.
#[async_trait]
pub trait RepositoryClient: Send + Sync + 'static {
    /// Reads the server capabilities.
    async fn server_info(&self) -> ClientResult<ServerInfo>;

    /// Fetches one instance. Passing the cached tag allows a "not modified"
    /// answer.
    async fn get_object(
        &self,
        id: &RemoteId,
        cache_tag: Option<&str>,
        cancel: &CancellationToken,
    ) -> ClientResult<ObjectsResponse>;

    /// Runs a query. `skip_token` continues a paged response.
    async fn query(
        &self,
        query: &Query,
        cache_tag: Option<&str>,
        skip_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> ClientResult<ObjectsResponse>;

    /// Sends several writes in one request.
    async fn send_changeset(
        &self,
        changeset: &Changeset,
        cancel: &CancellationToken,
    ) -> ClientResult<ChangesetResponse>;

    /// Creates one instance, its relationship and optionally its file.
    async fn create_object(
        &self,
        changeset: &Changeset,
        file: Option<&Path>,
        progress: Option<TransferProgress>,
        cancel: &CancellationToken,
    ) -> ClientResult<ChangesetResponse>;

    /// Updates properties of one instance.
    async fn update_object(
        &self,
        id: &RemoteId,
        properties: &Properties,
        cancel: &CancellationToken,
    ) -> ClientResult<()>;

    /// Deletes one instance.
    async fn delete_object(&self, id: &RemoteId, cancel: &CancellationToken) -> ClientResult<()>;

    /// Replaces the file of an instance.
    async fn update_file(
        &self,
        id: &RemoteId,
        path: &Path,
        progress: Option<TransferProgress>,
        cancel: &CancellationToken,
    ) -> ClientResult<()>;

    /// Downloads the file of an instance to `destination`.
    async fn get_file(
        &self,
        id: &RemoteId,
        destination: &Path,
        cache_tag: Option<&str>,
        progress: Option<TransferProgress>,
        cancel: &CancellationToken,
    ) -> ClientResult<FileResponse>;
}
