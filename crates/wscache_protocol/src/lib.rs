//! # wscache Protocol
//!
//! Types exchanged between the wscache sync engine and a remote object
//! repository.
//!
//! This crate provides:
//! - `RemoteId` and `ClassKey` for naming remote entities
//! - `Query` for navigation and filtered queries
//! - `RemoteInstance` / `ObjectsResponse` / `FileResponse` for pulled data
//! - `Changeset` for multi-instance writes
//! - `ClientError` for classified request failures
//! - `ServerInfo` for server capability flags
//!
//! This is a pure protocol crate with no I/O operations. How these types are
//! put on the wire is up to the repository client implementation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changeset;
mod error;
mod ids;
mod instance;
mod query;
mod server;

pub use changeset::{
    ChangeState, Changeset, ChangesetResponse, InstanceEntry, InstanceRef, RelationshipEntry,
};
pub use error::{ClientError, ClientErrorKind, ClientResult};
pub use ids::{ClassKey, RemoteId};
pub use instance::{FileResponse, ObjectsResponse, RemoteFileInfo, RemoteInstance};
pub use query::Query;
pub use server::ServerInfo;

/// Property map carried by instances and changeset entries.
pub type Properties = serde_json::Map<String, serde_json::Value>;
