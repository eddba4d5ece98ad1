//! Property-based test generators using proptest.
//!
//! Generates offline edit sessions: objects that already exist on the
//! server or were created locally, and relationships created between them
//! in an arbitrary order.

use crate::fixtures::{name_properties, test_instance, TEST_CLASS, TEST_RELATIONSHIP};
use crate::memory_store::MemoryStore;
use proptest::prelude::*;
use wscache_engine::LocalKey;
use wscache_protocol::RemoteInstance;

/// One offline edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Create object number `n`.
    CreateObject(usize),
    /// Create a relationship between two objects, by number.
    CreateRelationship(usize, usize),
    /// Modify object number `n`.
    ModifyObject(usize),
}

/// An edit session over `existing` server objects followed by `created`
/// local ones.
#[derive(Debug, Clone)]
pub struct EditSession {
    /// Objects cached from the server before the session.
    pub existing: usize,
    /// Edits in the order they were made.
    pub edits: Vec<Edit>,
}

impl EditSession {
    /// Seeds `server` and `store` and replays the edits.
    ///
    /// Returns the local key of every object by number and of every
    /// relationship in creation order.
    pub fn apply(
        &self,
        store: &MemoryStore,
        mut seed_server: impl FnMut(RemoteInstance),
    ) -> (Vec<Option<LocalKey>>, Vec<LocalKey>) {
        let total = self.existing
            + self
                .edits
                .iter()
                .filter(|e| matches!(e, Edit::CreateObject(_)))
                .count();
        let mut objects: Vec<Option<LocalKey>> = vec![None; total];
        let mut relationships = Vec::new();

        for (n, slot) in objects.iter_mut().enumerate().take(self.existing) {
            let instance = test_instance(&format!("E{n}"));
            seed_server(instance.clone());
            *slot = Some(store.insert_cached(instance));
        }
        for edit in &self.edits {
            match *edit {
                Edit::CreateObject(n) => {
                    let label = format!("N{n}");
                    objects[n] =
                        Some(store.create_object(TEST_CLASS, &label, name_properties(&label)));
                }
                Edit::CreateRelationship(a, b) => {
                    if let (Some(source), Some(target)) = (objects[a], objects[b]) {
                        relationships.push(store.create_relationship(
                            TEST_RELATIONSHIP,
                            source,
                            target,
                        ));
                    }
                }
                Edit::ModifyObject(n) => {
                    if let Some(key) = objects[n] {
                        store.modify_object(key, name_properties(&format!("M{n}")));
                    }
                }
            }
        }
        (objects, relationships)
    }
}

/// Strategy for edit sessions with up to `max_objects` created objects.
///
/// Relationships and modifications only name objects that exist at the
/// time of the edit.
pub fn edit_session_strategy(max_objects: usize) -> impl Strategy<Value = EditSession> {
    (0usize..3, 1..=max_objects.max(1)).prop_flat_map(|(existing, created)| {
        let step = (
            0u8..3,
            any::<prop::sample::Index>(),
            any::<prop::sample::Index>(),
        );
        let steps = prop::collection::vec(step, 0..created * 3);
        steps.prop_map(move |steps| {
            let mut edits: Vec<Edit> = Vec::new();
            let mut next = existing;
            let mut pending: Vec<usize> = (existing..existing + created).collect();
            for (kind, a, b) in steps {
                let available = next;
                match kind {
                    0 if !pending.is_empty() => {
                        edits.push(Edit::CreateObject(pending.remove(0)));
                        next += 1;
                    }
                    1 if available > 0 => {
                        edits.push(Edit::CreateRelationship(
                            a.index(available),
                            b.index(available),
                        ));
                    }
                    2 if available > 0 => edits.push(Edit::ModifyObject(a.index(available))),
                    _ => {}
                }
            }
            for n in pending {
                edits.push(Edit::CreateObject(n));
            }
            EditSession { existing, edits }
        })
    })
}
