//! Rows and change records exchanged with the local store.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use wscache_protocol::{Properties, RemoteFileInfo, RemoteId};

/// Opaque key of a row in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LocalKey(pub u64);

impl LocalKey {
    /// Key of the virtual navigation root.
    pub const ROOT: LocalKey = LocalKey(0);

    /// Creates a key.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a cached query response: the parent it belongs to and a
/// query name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CachedQueryKey {
    /// Instance the response hangs off, [`LocalKey::ROOT`] for the root.
    pub parent: LocalKey,
    /// Query name, unique per parent.
    pub name: String,
}

impl CachedQueryKey {
    /// Creates a key.
    pub fn new(parent: LocalKey, name: impl Into<String>) -> Self {
        Self {
            parent,
            name: name.into(),
        }
    }
}

impl fmt::Display for CachedQueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, self.name)
    }
}

/// Local edit state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChangeStatus {
    /// Unchanged.
    #[default]
    NoChange,
    /// Created locally.
    Created,
    /// Modified locally.
    Modified,
    /// Deleted locally.
    Deleted,
}

/// A pending change of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectChange {
    /// Object row.
    pub key: LocalKey,
    /// Edit state.
    pub status: ChangeStatus,
    /// Order in which the change was made.
    pub change_number: u64,
}

/// A pending change of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipChange {
    /// Relationship row.
    pub key: LocalKey,
    /// Edit state.
    pub status: ChangeStatus,
    /// Order in which the change was made.
    pub change_number: u64,
    /// Source object row.
    pub source: LocalKey,
    /// Target object row.
    pub target: LocalKey,
}

impl RelationshipChange {
    /// Returns true if `key` is one of the endpoints.
    pub fn touches(&self, key: LocalKey) -> bool {
        self.source == key || self.target == key
    }

    /// The endpoint opposite to `key`.
    pub fn other_endpoint(&self, key: LocalKey) -> LocalKey {
        if self.source == key {
            self.target
        } else {
            self.source
        }
    }
}

/// A pending change of the file attached to an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Row of the object owning the file.
    pub key: LocalKey,
    /// Edit state.
    pub status: ChangeStatus,
    /// Order in which the change was made.
    pub change_number: u64,
    /// Local path of the new content.
    pub path: PathBuf,
}

/// Snapshot of every pending local change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    /// Object changes.
    pub objects: Vec<ObjectChange>,
    /// Relationship changes.
    pub relationships: Vec<RelationshipChange>,
    /// File changes.
    pub files: Vec<FileChange>,
}

impl PendingChanges {
    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.relationships.is_empty() && self.files.is_empty()
    }

    /// Restricts the changes to the given rows.
    ///
    /// Relationship creations pull in the creations of their endpoints, which
    /// have to reach the server first.
    pub fn filter_to(mut self, keys: &[LocalKey]) -> Self {
        let mut wanted: HashSet<LocalKey> = keys.iter().copied().collect();
        for relationship in &self.relationships {
            if wanted.contains(&relationship.key) && relationship.status == ChangeStatus::Created {
                wanted.insert(relationship.source);
                wanted.insert(relationship.target);
            }
        }
        self.objects.retain(|change| wanted.contains(&change.key));
        self.relationships.retain(|change| wanted.contains(&change.key));
        self.files.retain(|change| wanted.contains(&change.key));
        self
    }
}

/// Data of one changed entity, as needed to send it to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    /// Remote id. Pending (empty identifier) for local creations.
    pub remote_id: RemoteId,
    /// Edit state.
    pub status: ChangeStatus,
    /// All properties for creations, the changed ones for modifications,
    /// `None` for deletions.
    pub properties: Option<Properties>,
    /// Display label.
    pub label: String,
}

/// An instance as stored in the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedInstance {
    /// Row key.
    pub key: LocalKey,
    /// Remote id.
    pub id: RemoteId,
    /// Display label.
    pub label: String,
    /// Cached properties.
    pub properties: Properties,
    /// Attached file, for file-backed objects.
    pub file: Option<RemoteFileInfo>,
}

impl CachedInstance {
    /// Returns true if the instance carries a file.
    pub fn is_file_backed(&self) -> bool {
        self.file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(key: u64, status: ChangeStatus) -> ObjectChange {
        ObjectChange {
            key: LocalKey(key),
            status,
            change_number: key,
        }
    }

    #[test]
    fn other_endpoint() {
        let rel = RelationshipChange {
            key: LocalKey(10),
            status: ChangeStatus::Created,
            change_number: 3,
            source: LocalKey(1),
            target: LocalKey(2),
        };
        assert!(rel.touches(LocalKey(1)));
        assert!(!rel.touches(LocalKey(3)));
        assert_eq!(rel.other_endpoint(LocalKey(1)), LocalKey(2));
        assert_eq!(rel.other_endpoint(LocalKey(2)), LocalKey(1));
    }

    #[test]
    fn filter_keeps_endpoint_creations() {
        let changes = PendingChanges {
            objects: vec![
                object(1, ChangeStatus::Created),
                object(2, ChangeStatus::Created),
                object(3, ChangeStatus::Modified),
            ],
            relationships: vec![RelationshipChange {
                key: LocalKey(10),
                status: ChangeStatus::Created,
                change_number: 4,
                source: LocalKey(1),
                target: LocalKey(2),
            }],
            files: vec![FileChange {
                key: LocalKey(3),
                status: ChangeStatus::Modified,
                change_number: 5,
                path: PathBuf::from("a.txt"),
            }],
        };

        let filtered = changes.filter_to(&[LocalKey(10)]);
        let keys: Vec<_> = filtered.objects.iter().map(|c| c.key).collect();
        assert_eq!(keys, vec![LocalKey(1), LocalKey(2)]);
        assert_eq!(filtered.relationships.len(), 1);
        assert!(filtered.files.is_empty());
    }
}
