//! Local-change push engine.
//!
//! A run moves through `Preparing → Syncing → Done`. While syncing it keeps
//! picking the first pending group whose dependencies are synced. Groups
//! without file content are folded into changesets when the server supports
//! them; everything else goes out one request per group. After each success
//! the new keys are rebound in every remaining group before the next pick.

use crate::changes::{ChangeGraph, GroupId};
use crate::client::RepositoryClient;
use crate::config::{ChangesetLimits, SyncOptions};
use crate::error::{FailedObject, ObjectError, SyncError, SyncResult};
use crate::progress::{ByteAggregator, ByteProgress, ProgressReporter, TransferProgress};
use crate::store::{CacheAccess, CacheStore, ChangeStatus, FileChange, LocalKey, Revision};
use crate::task::SyncTask;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wscache_protocol::{
    ChangeState, Changeset, ClientError, InstanceEntry, InstanceRef, RelationshipEntry, RemoteId,
    RemoteInstance, ServerInfo,
};

/// Stage of a push run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    /// Reading pending changes and building the dependency graph.
    Preparing,
    /// Sending groups to the server.
    Syncing,
    /// Finished, successfully or not.
    Done,
}

/// Everything needed to send one group, read from the store in one go.
#[derive(Debug, Clone)]
struct GroupPayload {
    id: RemoteId,
    label: String,
    object: Option<(LocalKey, Revision)>,
    relationship: Option<RelationshipPayload>,
    file: Option<FileChange>,
}

#[derive(Debug, Clone)]
struct RelationshipPayload {
    key: LocalKey,
    revision: Revision,
    source: (LocalKey, RemoteId),
    target: (LocalKey, RemoteId),
}

/// Indexes of a group's entries inside a changeset.
#[derive(Debug, Clone, Copy, Default)]
struct EntrySlots {
    object: Option<usize>,
    relationship: Option<usize>,
}

struct BatchMember {
    group: GroupId,
    payload: GroupPayload,
    slots: EntrySlots,
}

/// What to mark as synced in the store after the server accepted a group.
#[derive(Debug, Default)]
struct Commit {
    object: Option<(LocalKey, RemoteId, Option<RemoteInstance>)>,
    relationship: Option<(LocalKey, RemoteId)>,
    file: Option<LocalKey>,
}

/// One push run over the pending local changes.
pub struct LocalChangesSync<'a, S: CacheStore, C: RepositoryClient> {
    cache: &'a CacheAccess<S>,
    client: &'a C,
    task: &'a SyncTask,
    progress: &'a Arc<ProgressReporter>,
    options: SyncOptions,
    limits: ChangesetLimits,
    state: PushState,
    uploads: Arc<ByteAggregator<u64>>,
}

impl<'a, S: CacheStore, C: RepositoryClient> LocalChangesSync<'a, S, C> {
    /// Creates a run.
    pub fn new(
        cache: &'a CacheAccess<S>,
        client: &'a C,
        task: &'a SyncTask,
        progress: &'a Arc<ProgressReporter>,
        options: SyncOptions,
        default_limits: ChangesetLimits,
    ) -> Self {
        let limits = options.changeset_limits.unwrap_or(default_limits);
        Self {
            cache,
            client,
            task,
            progress,
            options,
            limits,
            state: PushState::Preparing,
            uploads: Arc::new(ByteAggregator::new()),
        }
    }

    /// Current stage.
    pub fn state(&self) -> PushState {
        self.state
    }

    /// Syncs the pending changes, or only those of `only` when given.
    ///
    /// Per-object failures are recorded on the task. The returned error is
    /// the one that stopped the run.
    pub async fn run(&mut self, only: Option<Vec<LocalKey>>) -> SyncResult<()> {
        let result = self.sync(only).await;
        self.state = PushState::Done;
        result
    }

    async fn sync(&mut self, only: Option<Vec<LocalKey>>) -> SyncResult<()> {
        self.state = PushState::Preparing;
        let server = self.client.server_info().await?;
        let mut graph = self
            .cache
            .read(move |store| {
                let mut changes = store.read_pending_changes()?;
                if let Some(keys) = only {
                    changes = changes.filter_to(&keys);
                }
                ChangeGraph::build(changes)
            })
            .await?;

        let total = graph.len();
        info!(
            groups = total,
            changesets = self.use_changesets(&server),
            "syncing local changes"
        );
        self.state = PushState::Syncing;

        let mut pending: Vec<GroupId> = graph.ids().collect();
        while let Some(pos) = pending
            .iter()
            .position(|id| graph.are_all_dependencies_synced(*id))
        {
            self.task.check_canceled()?;
            let first = pending[pos];

            let batch = if self.is_batchable(&graph, first, &server) {
                self.collect_batch(&graph, &pending[pos..], &server).await?
            } else {
                None
            };

            let label = match batch {
                Some((members, changeset)) => {
                    let label = members
                        .last()
                        .map(|m| m.payload.label.clone())
                        .unwrap_or_default();
                    let sent: HashSet<GroupId> = members.iter().map(|m| m.group).collect();
                    pending.retain(|id| !sent.contains(id));
                    self.send_batch(&mut graph, members, changeset).await?;
                    label
                }
                None => {
                    pending.remove(pos);
                    let payload = self.read_payload(&graph, first).await?;
                    let label = payload.label.clone();
                    self.sync_group(&mut graph, first, payload, &server).await?;
                    label
                }
            };

            let handled = total - pending.len();
            self.progress
                .set_fraction(handled as f64 / total as f64, Some(label));
        }

        if !pending.is_empty() {
            self.fail_blocked(&graph, &pending).await?;
        }
        info!(
            groups = total,
            failed = self.task.failed_count(),
            "local changes synced"
        );
        Ok(())
    }

    fn use_changesets(&self, server: &ServerInfo) -> bool {
        self.options.use_changesets && server.supports_changesets
    }

    fn is_batchable(&self, graph: &ChangeGraph, id: GroupId, server: &ServerInfo) -> bool {
        self.use_changesets(server) && graph.get(id).file().is_none()
    }

    /// Folds consecutive batchable groups into one changeset.
    ///
    /// Returns `None` when the first group alone exceeds the entry limit; it
    /// is then sent on its own.
    async fn collect_batch(
        &self,
        graph: &ChangeGraph,
        candidates: &[GroupId],
        server: &ServerInfo,
    ) -> SyncResult<Option<(Vec<BatchMember>, Changeset)>> {
        let mut changeset = Changeset::new();
        let mut created = HashMap::new();
        let mut members: Vec<BatchMember> = Vec::new();
        let mut in_batch = HashSet::new();

        for &id in candidates {
            if !self.is_batchable(graph, id, server) {
                break;
            }
            let ready = graph
                .get(id)
                .dependencies()
                .iter()
                .all(|dep| graph.get(*dep).is_synced() || in_batch.contains(dep));
            if !ready {
                continue;
            }

            let payload = self.read_payload(graph, id).await?;
            let mut candidate = changeset.clone();
            let mut candidate_created = created.clone();
            let slots = add_entries(&mut candidate, &payload, &mut candidate_created);
            let size = candidate
                .encoded_len()
                .map_err(|err| SyncError::Internal(format!("changeset encoding: {err}")))?;

            if self.limits.exceeded_by(size, candidate.instance_count()) {
                if members.is_empty() {
                    if let Some(limit) = self.limits.max_size.filter(|max| size > *max) {
                        return Err(SyncError::ChangesetTooLarge { size, limit });
                    }
                    return Ok(None);
                }
                debug!(
                    groups = members.len(),
                    "changeset limit reached, deferring the rest"
                );
                break;
            }

            changeset = candidate;
            created = candidate_created;
            in_batch.insert(id);
            members.push(BatchMember {
                group: id,
                payload,
                slots,
            });
        }

        if members.is_empty() {
            return Ok(None);
        }
        Ok(Some((members, changeset)))
    }

    async fn send_batch(
        &self,
        graph: &mut ChangeGraph,
        members: Vec<BatchMember>,
        changeset: Changeset,
    ) -> SyncResult<()> {
        debug!(
            groups = members.len(),
            entries = changeset.instance_count(),
            "sending changeset"
        );
        let response = match self
            .client
            .send_changeset(&changeset, self.task.token())
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_rejected() => {
                for member in &members {
                    self.record_rejected(&member.payload, err.clone());
                }
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut commits = Vec::with_capacity(members.len());
        for member in members {
            let mut commit = Commit::default();
            if let (Some((key, revision)), Some(slot)) = (&member.payload.object, member.slots.object)
            {
                let assigned = assigned_id(&response.instances, slot, revision)?;
                commit.object = Some((*key, assigned, None));
            }
            if let (Some(rel), Some(slot)) =
                (&member.payload.relationship, member.slots.relationship)
            {
                let assigned = assigned_id(&response.relationships, slot, &rel.revision)?;
                commit.relationship = Some((rel.key, assigned));
            }
            commits.push((member.group, commit));
        }
        self.commit(graph, commits).await
    }

    async fn sync_group(
        &self,
        graph: &mut ChangeGraph,
        id: GroupId,
        payload: GroupPayload,
        server: &ServerInfo,
    ) -> SyncResult<()> {
        match &payload.object {
            Some((_, revision)) if revision.status == ChangeStatus::Created => {
                self.create_object(graph, id, &payload, server).await
            }
            Some((key, revision)) => {
                self.update_object(graph, id, &payload, *key, revision)
                    .await
            }
            None if payload.relationship.is_some() => {
                self.sync_relationship(graph, id, &payload).await
            }
            None => self.upload_file(graph, id, &payload).await,
        }
    }

    async fn create_object(
        &self,
        graph: &mut ChangeGraph,
        id: GroupId,
        payload: &GroupPayload,
        server: &ServerInfo,
    ) -> SyncResult<()> {
        let cancel = self.task.token();
        let mut changeset = Changeset::new();
        let slots = add_entries(&mut changeset, payload, &mut HashMap::new());
        let two_phase = payload.file.is_some() && server.supports_file_upload_url;
        let embedded_file = payload.file.as_ref().filter(|_| !two_phase);
        let embedded = embedded_file.map(|file| file.path.as_path());

        let response = match self
            .client
            .create_object(
                &changeset,
                embedded,
                embedded_file.map(|file| self.upload_progress(file)),
                cancel,
            )
            .await
        {
            Ok(response) => response,
            Err(err) => return self.reject(payload, err),
        };

        let Some((key, revision)) = &payload.object else {
            return Err(SyncError::Internal("creation without an object".into()));
        };
        let assigned = assigned_id(&response.instances, slots.object.unwrap_or(0), revision)?;
        let relationship = match (&payload.relationship, slots.relationship) {
            (Some(rel), Some(slot)) => Some((
                rel.key,
                assigned_id(&response.relationships, slot, &rel.revision)?,
            )),
            _ => None,
        };

        // The object exists on the server from here on, so it is committed
        // whatever happens to the file upload or the refresh.
        let mut file_synced = embedded.is_some();
        let mut upload_error = None;
        if let Some(file) = payload.file.as_ref().filter(|_| two_phase) {
            if self.task.is_canceled() {
                upload_error = Some(ClientError::canceled());
            } else {
                match self
                    .client
                    .update_file(
                        &assigned,
                        &file.path,
                        Some(self.upload_progress(file)),
                        cancel,
                    )
                    .await
                {
                    Ok(()) => file_synced = true,
                    Err(err) => upload_error = Some(err),
                }
            }
        }

        let mut refresh_error = None;
        let refreshed = if self.task.is_canceled() {
            None
        } else {
            match self.client.get_object(&assigned, None, cancel).await {
                Ok(response) => response.instances.into_iter().next(),
                Err(err) if err.is_server_response() => {
                    debug!(id = %assigned, error = %err, "could not refresh created object");
                    None
                }
                Err(err) => {
                    refresh_error = Some(err);
                    None
                }
            }
        };

        let commit = Commit {
            object: Some((*key, assigned.clone(), refreshed)),
            relationship,
            file: file_synced.then_some(*key),
        };
        self.commit(graph, vec![(id, commit)]).await?;

        if let Some(err) = upload_error {
            if err.is_rejected() {
                self.task.add_failed_object(FailedObject::rejected(
                    assigned,
                    payload.label.clone(),
                    err,
                ));
            } else {
                return Err(err.into());
            }
        }
        match refresh_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn update_object(
        &self,
        graph: &mut ChangeGraph,
        id: GroupId,
        payload: &GroupPayload,
        key: LocalKey,
        revision: &Revision,
    ) -> SyncResult<()> {
        let cancel = self.task.token();
        if revision.status == ChangeStatus::Deleted {
            if let Err(err) = self.client.delete_object(&revision.remote_id, cancel).await {
                return self.reject(payload, err);
            }
            let commit = Commit {
                object: Some((key, revision.remote_id.clone(), None)),
                ..Commit::default()
            };
            return self.commit(graph, vec![(id, commit)]).await;
        }

        if let Some(properties) = revision.properties.as_ref().filter(|p| !p.is_empty()) {
            if let Err(err) = self
                .client
                .update_object(&revision.remote_id, properties, cancel)
                .await
            {
                return self.reject(payload, err);
            }
        }

        let mut upload_error = None;
        let mut file_synced = false;
        if let Some(file) = &payload.file {
            match self
                .client
                .update_file(
                    &revision.remote_id,
                    &file.path,
                    Some(self.upload_progress(file)),
                    cancel,
                )
                .await
            {
                Ok(()) => file_synced = true,
                Err(err) => upload_error = Some(err),
            }
        }

        let commit = Commit {
            object: Some((key, revision.remote_id.clone(), None)),
            relationship: None,
            file: file_synced.then_some(key),
        };
        self.commit(graph, vec![(id, commit)]).await?;

        match upload_error {
            Some(err) => self.reject(payload, err),
            None => Ok(()),
        }
    }

    async fn sync_relationship(
        &self,
        graph: &mut ChangeGraph,
        id: GroupId,
        payload: &GroupPayload,
    ) -> SyncResult<()> {
        let Some(rel) = &payload.relationship else {
            return Ok(());
        };
        let cancel = self.task.token();
        let revision = &rel.revision;

        let result = match revision.status {
            ChangeStatus::Created => {
                let mut changeset = Changeset::new();
                let slots = add_entries(&mut changeset, payload, &mut HashMap::new());
                match self.client.create_object(&changeset, None, None, cancel).await {
                    Ok(response) => Ok(assigned_id(
                        &response.relationships,
                        slots.relationship.unwrap_or(0),
                        revision,
                    )?),
                    Err(err) => Err(err),
                }
            }
            ChangeStatus::Deleted => self
                .client
                .delete_object(&revision.remote_id, cancel)
                .await
                .map(|()| revision.remote_id.clone()),
            ChangeStatus::Modified | ChangeStatus::NoChange => {
                let properties = revision.properties.clone().unwrap_or_default();
                self.client
                    .update_object(&revision.remote_id, &properties, cancel)
                    .await
                    .map(|()| revision.remote_id.clone())
            }
        };

        match result {
            Ok(assigned) => {
                let commit = Commit {
                    relationship: Some((rel.key, assigned)),
                    ..Commit::default()
                };
                self.commit(graph, vec![(id, commit)]).await
            }
            Err(err) => self.reject(payload, err),
        }
    }

    async fn upload_file(
        &self,
        graph: &mut ChangeGraph,
        id: GroupId,
        payload: &GroupPayload,
    ) -> SyncResult<()> {
        let Some(file) = &payload.file else {
            graph.mark_synced(id);
            return Ok(());
        };
        if let Err(err) = self
            .client
            .update_file(
                &payload.id,
                &file.path,
                Some(self.upload_progress(file)),
                self.task.token(),
            )
            .await
        {
            return self.reject(payload, err);
        }
        let commit = Commit {
            file: Some(file.key),
            ..Commit::default()
        };
        self.commit(graph, vec![(id, commit)]).await
    }

    /// Marks accepted groups as synced in the store and in the graph, in one
    /// transaction, and rebinds moved keys in every group.
    async fn commit(&self, graph: &mut ChangeGraph, commits: Vec<(GroupId, Commit)>) -> SyncResult<()> {
        let groups: Vec<GroupId> = commits.iter().map(|(id, _)| *id).collect();
        let rebinds = self
            .cache
            .write(move |store| {
                let mut rebinds = Vec::new();
                for (_, commit) in commits {
                    let mut object_key = None;
                    if let Some((key, assigned, refreshed)) = commit.object {
                        let new_key = store.commit_revision(key, &assigned, refreshed.as_ref())?;
                        object_key = Some((key, new_key));
                        rebinds.push((key, new_key));
                    }
                    if let Some((key, assigned)) = commit.relationship {
                        rebinds.push((key, store.commit_revision(key, &assigned, None)?));
                    }
                    if let Some(key) = commit.file {
                        let key = match object_key {
                            Some((old, new)) if old == key => new,
                            _ => key,
                        };
                        store.commit_file_revision(key)?;
                    }
                }
                Ok(rebinds)
            })
            .await?;

        for (old, new) in rebinds {
            graph.rebind(old, new);
        }
        for id in groups {
            graph.mark_synced(id);
        }
        Ok(())
    }

    fn reject(&self, payload: &GroupPayload, err: ClientError) -> SyncResult<()> {
        if err.is_rejected() {
            self.record_rejected(payload, err);
            Ok(())
        } else {
            Err(err.into())
        }
    }

    fn record_rejected(&self, payload: &GroupPayload, err: ClientError) {
        warn!(id = %payload.id, label = %payload.label, error = %err, "change rejected");
        self.task.add_failed_object(FailedObject::rejected(
            payload.id.clone(),
            payload.label.clone(),
            err,
        ));
    }

    /// Reports every group that never became ready.
    async fn fail_blocked(&self, graph: &ChangeGraph, blocked: &[GroupId]) -> SyncResult<()> {
        let keys: Vec<LocalKey> = blocked.iter().map(|id| graph.get(*id).key()).collect();
        let described = self
            .cache
            .read(move |store| {
                keys.into_iter()
                    .map(|key| describe(&*store, key))
                    .collect::<SyncResult<Vec<_>>>()
            })
            .await?;
        for (id, label) in described {
            self.task
                .add_failed_object(FailedObject::new(id, label, ObjectError::DependencyNotSynced));
        }
        Ok(())
    }

    async fn read_payload(&self, graph: &ChangeGraph, id: GroupId) -> SyncResult<GroupPayload> {
        let group = graph.get(id).clone();
        self.cache
            .read(move |store| {
                let object = match group.object() {
                    Some(change) => Some((change.key, store.read_revision(change.key)?)),
                    None => None,
                };
                let relationship = match group.relationship() {
                    Some(change) => Some(RelationshipPayload {
                        key: change.key,
                        revision: store.read_revision(change.key)?,
                        source: (change.source, endpoint_id(&*store, change.source)?),
                        target: (change.target, endpoint_id(&*store, change.target)?),
                    }),
                    None => None,
                };
                let key = group.key();
                let (id, label) = match (&object, &relationship) {
                    (Some((_, revision)), _) => (revision.remote_id.clone(), revision.label.clone()),
                    (None, Some(rel)) => (rel.revision.remote_id.clone(), rel.revision.label.clone()),
                    (None, None) => describe(&*store, key)?,
                };
                Ok(GroupPayload {
                    id,
                    label,
                    object,
                    relationship,
                    file: group.file().cloned(),
                })
            })
            .await
    }

    /// Byte progress of one upload, summed with every other upload of the run.
    fn upload_progress(&self, file: &FileChange) -> TransferProgress {
        let reporter = Arc::clone(self.progress);
        let uploads = Arc::clone(&self.uploads);
        let change = file.change_number;
        Arc::new(move |bytes: ByteProgress| reporter.set_bytes(uploads.update(change, bytes)))
    }
}

fn change_state(status: ChangeStatus) -> ChangeState {
    match status {
        ChangeStatus::Created => ChangeState::New,
        ChangeStatus::Modified => ChangeState::Modified,
        ChangeStatus::Deleted => ChangeState::Deleted,
        ChangeStatus::NoChange => ChangeState::Existing,
    }
}

/// Appends the entries of a group. Endpoints created earlier in the same
/// changeset are referenced by index.
fn add_entries(
    changeset: &mut Changeset,
    payload: &GroupPayload,
    created: &mut HashMap<LocalKey, usize>,
) -> EntrySlots {
    let mut slots = EntrySlots::default();
    if let Some((key, revision)) = &payload.object {
        let properties = match revision.status {
            ChangeStatus::Deleted => None,
            _ => revision.properties.clone(),
        };
        let index = changeset.add_instance(InstanceEntry::new(
            change_state(revision.status),
            revision.remote_id.clone(),
            properties,
        ));
        if revision.status == ChangeStatus::Created {
            created.insert(*key, index);
        }
        slots.object = Some(index);
    }
    if let Some(rel) = &payload.relationship {
        let endpoint = |(key, id): &(LocalKey, RemoteId)| match created.get(key) {
            Some(index) => InstanceRef::New(*index),
            None => InstanceRef::Existing(id.clone()),
        };
        let entry = RelationshipEntry {
            change_state: change_state(rel.revision.status),
            id: rel.revision.remote_id.clone(),
            source: endpoint(&rel.source),
            target: endpoint(&rel.target),
        };
        slots.relationship = Some(changeset.add_relationship(entry));
    }
    slots
}

/// The id the server assigned to the entry at `index`, falling back to the
/// known id of entries that already existed.
fn assigned_id(ids: &[RemoteId], index: usize, revision: &Revision) -> SyncResult<RemoteId> {
    match ids.get(index) {
        Some(id) if !id.remote_id.is_empty() => Ok(id.clone()),
        _ if !revision.remote_id.is_pending() => Ok(revision.remote_id.clone()),
        _ => Err(SyncError::Internal(format!(
            "server assigned no id to {}",
            revision.label
        ))),
    }
}

fn endpoint_id<S: CacheStore>(store: &S, key: LocalKey) -> SyncResult<RemoteId> {
    Ok(store.find_remote_id(key)?.unwrap_or_default())
}

fn describe<S: CacheStore>(store: &S, key: LocalKey) -> SyncResult<(RemoteId, String)> {
    let id = store.find_remote_id(key)?.unwrap_or_default();
    let label = store
        .read_instance(key)?
        .map(|instance| instance.label)
        .unwrap_or_default();
    Ok((id, label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wscache_protocol::{ClassKey, Properties};

    fn revision(status: ChangeStatus, remote_id: &str) -> Revision {
        let mut properties = Properties::new();
        properties.insert("Name".into(), serde_json::json!("x"));
        Revision {
            remote_id: RemoteId::new(ClassKey::new("S", "C"), remote_id),
            status,
            properties: Some(properties),
            label: "x".into(),
        }
    }

    fn payload(object: Option<(u64, Revision)>, rel: Option<(u64, u64, u64)>) -> GroupPayload {
        let relationship = rel.map(|(key, source, target)| RelationshipPayload {
            key: LocalKey(key),
            revision: Revision {
                remote_id: RemoteId::new(ClassKey::new("S", "Rel"), ""),
                status: ChangeStatus::Created,
                properties: None,
                label: "rel".into(),
            },
            source: (LocalKey(source), RemoteId::parse("S.C", format!("R{source}"))),
            target: (LocalKey(target), RemoteId::parse("S.C", format!("R{target}"))),
        });
        GroupPayload {
            id: RemoteId::default(),
            label: String::new(),
            object: object.map(|(key, rev)| (LocalKey(key), rev)),
            relationship,
            file: None,
        }
    }

    #[test]
    fn entries_reference_batch_creations() {
        let mut changeset = Changeset::new();
        let mut created = HashMap::new();

        let first = add_entries(
            &mut changeset,
            &payload(Some((1, revision(ChangeStatus::Created, ""))), None),
            &mut created,
        );
        let second = add_entries(
            &mut changeset,
            &payload(Some((2, revision(ChangeStatus::Created, ""))), Some((10, 1, 3))),
            &mut created,
        );

        assert_eq!(first.object, Some(0));
        assert_eq!(second.object, Some(1));
        assert_eq!(second.relationship, Some(0));
        let rel = &changeset.relationships[0];
        assert_eq!(rel.source, InstanceRef::New(0));
        assert_eq!(rel.target, InstanceRef::Existing(RemoteId::parse("S.C", "R3")));
    }

    #[test]
    fn deletions_carry_no_properties() {
        let mut changeset = Changeset::new();
        add_entries(
            &mut changeset,
            &payload(Some((1, revision(ChangeStatus::Deleted, "A"))), None),
            &mut HashMap::new(),
        );
        assert_eq!(changeset.instances[0].change_state, ChangeState::Deleted);
        assert!(changeset.instances[0].properties.is_none());
    }

    #[test]
    fn assigned_id_fallbacks() {
        let created = revision(ChangeStatus::Created, "");
        let modified = revision(ChangeStatus::Modified, "A");
        let ids = vec![RemoteId::parse("S.C", "NEW")];

        assert_eq!(assigned_id(&ids, 0, &created).unwrap().remote_id, "NEW");
        assert_eq!(assigned_id(&[], 0, &modified).unwrap().remote_id, "A");
        assert!(assigned_id(&[], 0, &created).is_err());
    }
}
