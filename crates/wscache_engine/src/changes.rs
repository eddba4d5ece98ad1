//! Change dependency graph.
//!
//! Pending local changes are grouped into [`ChangeGroup`]s, the units the push
//! engine sends to the server. A group that creates a relationship depends on
//! the groups creating its endpoints.
//!
//! ## Grouping
//!
//! 1. Objects are visited in change order.
//! 2. A created object takes the first unclaimed relationship touching it
//!    whose other endpoint is not being created, or is created by an earlier
//!    group, or is the object itself. A file change of the object joins the
//!    same group.
//! 3. Every remaining relationship change and file change gets a group of
//!    its own.
//! 4. Relationship creations depend on the groups creating their endpoints.
//!
//! Every dependency edge points at an earlier group, so the graph cannot
//! contain cycles. Two objects created together that reference each other
//! end up as two object groups plus a trailing relationship group that
//! depends on both.

use crate::error::{SyncError, SyncResult};
use crate::store::{ChangeStatus, FileChange, LocalKey, ObjectChange, PendingChanges, RelationshipChange};
use std::collections::{HashMap, HashSet};

/// Handle of a group inside its [`ChangeGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(usize);

impl GroupId {
    /// Position of the group in change order.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One unit of local-change synchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeGroup {
    object: Option<ObjectChange>,
    relationship: Option<RelationshipChange>,
    file: Option<FileChange>,
    synced: bool,
    dependencies: Vec<GroupId>,
}

impl ChangeGroup {
    /// The object change, if any.
    pub fn object(&self) -> Option<&ObjectChange> {
        self.object.as_ref()
    }

    /// The relationship change, if any.
    pub fn relationship(&self) -> Option<&RelationshipChange> {
        self.relationship.as_ref()
    }

    /// The file change, if any.
    pub fn file(&self) -> Option<&FileChange> {
        self.file
            .as_ref()
            .filter(|file| file.status != ChangeStatus::NoChange)
    }

    /// Returns true once the group reached the server.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Groups that have to be synced first.
    pub fn dependencies(&self) -> &[GroupId] {
        &self.dependencies
    }

    /// Row the group is reported under: its object, else its relationship,
    /// else the owner of its file.
    pub fn key(&self) -> LocalKey {
        self.object
            .map(|c| c.key)
            .or(self.relationship.map(|c| c.key))
            .or(self.file.as_ref().map(|c| c.key))
            .unwrap_or_default()
    }

    /// Returns true if the group creates the object at `key`.
    pub fn creates(&self, key: LocalKey) -> bool {
        self.object
            .is_some_and(|c| c.key == key && c.status == ChangeStatus::Created)
    }

    fn rebind(&mut self, old: LocalKey, new: LocalKey) {
        let swap = |key: &mut LocalKey| {
            if *key == old {
                *key = new;
            }
        };
        if let Some(object) = &mut self.object {
            swap(&mut object.key);
        }
        if let Some(relationship) = &mut self.relationship {
            swap(&mut relationship.key);
            swap(&mut relationship.source);
            swap(&mut relationship.target);
        }
        if let Some(file) = &mut self.file {
            swap(&mut file.key);
        }
    }
}

/// Groups of one push run and their dependency edges.
#[derive(Debug, Clone, Default)]
pub struct ChangeGraph {
    groups: Vec<ChangeGroup>,
}

impl ChangeGraph {
    /// Groups `changes` and computes the dependencies.
    pub fn build(changes: PendingChanges) -> SyncResult<Self> {
        let PendingChanges {
            mut objects,
            mut relationships,
            mut files,
        } = changes;
        objects.sort_by_key(|c| c.change_number);
        relationships.sort_by_key(|c| c.change_number);
        files.sort_by_key(|c| c.change_number);

        let created: HashSet<LocalKey> = objects
            .iter()
            .filter(|c| c.status == ChangeStatus::Created)
            .map(|c| c.key)
            .collect();
        let mut relationship_claimed = vec![false; relationships.len()];
        let mut file_claimed = vec![false; files.len()];
        let mut processed = HashSet::new();
        let mut groups = Vec::with_capacity(objects.len());

        for object in &objects {
            let mut group = ChangeGroup {
                object: Some(*object),
                ..ChangeGroup::default()
            };

            if object.status == ChangeStatus::Created {
                let claim = relationships.iter().enumerate().position(|(i, rel)| {
                    if relationship_claimed[i] || !rel.touches(object.key) {
                        return false;
                    }
                    let other = rel.other_endpoint(object.key);
                    other == object.key || !created.contains(&other) || processed.contains(&other)
                });
                if let Some(i) = claim {
                    relationship_claimed[i] = true;
                    group.relationship = Some(relationships[i]);
                }
            }

            if let Some(i) = files
                .iter()
                .enumerate()
                .position(|(i, file)| !file_claimed[i] && file.key == object.key)
            {
                file_claimed[i] = true;
                group.file = Some(files[i].clone());
            }

            processed.insert(object.key);
            groups.push(group);
        }

        for (relationship, _) in relationships
            .into_iter()
            .zip(relationship_claimed)
            .filter(|(_, claimed)| !claimed)
        {
            groups.push(ChangeGroup {
                relationship: Some(relationship),
                ..ChangeGroup::default()
            });
        }
        for (file, _) in files
            .into_iter()
            .zip(file_claimed)
            .filter(|(_, claimed)| !claimed)
        {
            groups.push(ChangeGroup {
                file: Some(file),
                ..ChangeGroup::default()
            });
        }

        let creators: HashMap<LocalKey, usize> = groups
            .iter()
            .enumerate()
            .filter_map(|(i, g)| {
                g.object
                    .filter(|c| c.status == ChangeStatus::Created)
                    .map(|c| (c.key, i))
            })
            .collect();

        for i in 0..groups.len() {
            let Some(rel) = groups[i]
                .relationship
                .filter(|r| r.status == ChangeStatus::Created)
            else {
                continue;
            };
            for endpoint in [rel.source, rel.target] {
                let Some(&creator) = creators.get(&endpoint) else {
                    continue;
                };
                if creator == i || groups[i].dependencies.contains(&GroupId(creator)) {
                    continue;
                }
                if creator > i {
                    return Err(SyncError::Internal(format!(
                        "change group {i} depends on later group {creator}"
                    )));
                }
                groups[i].dependencies.push(GroupId(creator));
            }
        }

        Ok(Self { groups })
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if there is nothing to sync.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group handles in change order.
    pub fn ids(&self) -> impl Iterator<Item = GroupId> + '_ {
        (0..self.groups.len()).map(GroupId)
    }

    /// Returns a group.
    pub fn get(&self, id: GroupId) -> &ChangeGroup {
        &self.groups[id.0]
    }

    /// Returns true if every dependency of `id` is synced.
    pub fn are_all_dependencies_synced(&self, id: GroupId) -> bool {
        self.groups[id.0]
            .dependencies
            .iter()
            .all(|dep| self.groups[dep.0].synced)
    }

    /// Marks a group as synced.
    pub fn mark_synced(&mut self, id: GroupId) {
        self.groups[id.0].synced = true;
    }

    /// Replaces `old` with `new` in every group.
    pub fn rebind(&mut self, old: LocalKey, new: LocalKey) {
        if old == new {
            return;
        }
        for group in &mut self.groups {
            group.rebind(old, new);
        }
    }
}
