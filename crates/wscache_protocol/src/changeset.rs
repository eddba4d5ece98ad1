//! Multi-instance write requests.

use crate::ids::RemoteId;
use crate::Properties;
use serde::{Deserialize, Serialize};

/// How an entry in a changeset affects the remote repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeState {
    /// Create the instance.
    New,
    /// Update the given properties.
    Modified,
    /// Delete the instance.
    Deleted,
    /// Reference an existing instance without changing it.
    Existing,
}

/// An object instance in a changeset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceEntry {
    /// Change to apply.
    pub change_state: ChangeState,
    /// Instance id. The remote identifier is empty for new instances.
    pub id: RemoteId,
    /// Properties to write. Only changed properties for modifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
}

impl InstanceEntry {
    /// Creates an entry.
    pub fn new(change_state: ChangeState, id: RemoteId, properties: Option<Properties>) -> Self {
        Self {
            change_state,
            id,
            properties,
        }
    }
}

/// Reference to a relationship endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceRef {
    /// An instance that already exists on the server.
    Existing(RemoteId),
    /// An instance created by the same request, by index into
    /// [`Changeset::instances`].
    New(usize),
}

/// A relationship instance in a changeset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipEntry {
    /// Change to apply.
    pub change_state: ChangeState,
    /// Relationship id. The remote identifier is empty for new relationships.
    pub id: RemoteId,
    /// Source endpoint.
    pub source: InstanceRef,
    /// Target endpoint.
    pub target: InstanceRef,
}

/// A request that writes several instances at once.
///
/// The serialized JSON length is the size checked against changeset limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    /// Object instances in request order.
    pub instances: Vec<InstanceEntry>,
    /// Relationship instances in request order.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub relationships: Vec<RelationshipEntry>,
}

impl Changeset {
    /// Creates an empty changeset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an instance entry and returns its index.
    pub fn add_instance(&mut self, entry: InstanceEntry) -> usize {
        self.instances.push(entry);
        self.instances.len() - 1
    }

    /// Appends a relationship entry and returns its index.
    pub fn add_relationship(&mut self, entry: RelationshipEntry) -> usize {
        self.relationships.push(entry);
        self.relationships.len() - 1
    }

    /// Number of entries, relationships included.
    pub fn instance_count(&self) -> usize {
        self.instances.len() + self.relationships.len()
    }

    /// Returns true if the changeset has no entries.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.relationships.is_empty()
    }

    /// Serializes the changeset to JSON.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Length of the serialized request body in bytes.
    pub fn encoded_len(&self) -> serde_json::Result<usize> {
        self.to_json().map(|bytes| bytes.len())
    }
}

/// Server answer to a changeset or a single create request.
///
/// Identifiers are listed in the same order as the request entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetResponse {
    /// Identifiers of the object entries.
    pub instances: Vec<RemoteId>,
    /// Identifiers of the relationship entries.
    pub relationships: Vec<RemoteId>,
}
