//! In-memory [`CacheStore`].
//!
//! Transactions snapshot the whole store on begin and restore the snapshot
//! on rollback. The store is a cheap handle: clones share state, so a test
//! keeps one clone for inspection and hands another to the cache.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use wscache_engine::{
    CacheStore, CachedInstance, CachedQueryKey, ChangeStatus, FileChange, LocalKey, ObjectChange,
    PendingChanges, RelationshipChange, Revision, StoreError, StoreResult,
};
use wscache_protocol::{ObjectsResponse, Properties, Query, RemoteFileInfo, RemoteId, RemoteInstance};

#[derive(Debug, Clone, Default)]
struct Row {
    id: RemoteId,
    label: String,
    properties: Properties,
    file: Option<RemoteFileInfo>,
    cache_tag: Option<String>,
    partial: bool,
    status: ChangeStatus,
    changed: Option<Properties>,
    change_number: u64,
    endpoints: Option<(LocalKey, LocalKey)>,
    file_change: Option<(ChangeStatus, u64, PathBuf)>,
}

impl Row {
    fn to_cached(&self, key: LocalKey) -> CachedInstance {
        CachedInstance {
            key,
            id: self.id.clone(),
            label: self.label.clone(),
            properties: self.properties.clone(),
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CachedResponse {
    ids: Vec<RemoteId>,
    cache_tag: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct CachedFile {
    path: PathBuf,
    cache_tag: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Data {
    next_key: u64,
    next_change: u64,
    rows: BTreeMap<LocalKey, Row>,
    by_id: HashMap<RemoteId, LocalKey>,
    responses: HashMap<CachedQueryKey, CachedResponse>,
    files: HashMap<RemoteId, CachedFile>,
    writes: u64,
}

impl Data {
    fn allocate_key(&mut self) -> LocalKey {
        self.next_key += 1;
        LocalKey::new(self.next_key)
    }

    fn next_change(&mut self) -> u64 {
        self.next_change += 1;
        self.next_change
    }

    fn row(&self, key: LocalKey) -> StoreResult<&Row> {
        self.rows
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(format!("row {key}")))
    }

    fn row_mut(&mut self, key: LocalKey) -> StoreResult<&mut Row> {
        self.rows
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("row {key}")))
    }

    fn insert_row(&mut self, row: Row) -> LocalKey {
        let key = self.allocate_key();
        if !row.id.is_pending() {
            self.by_id.insert(row.id.clone(), key);
        }
        self.rows.insert(key, row);
        key
    }

    fn upsert(&mut self, instance: &RemoteInstance, cache_tag: Option<&str>) -> LocalKey {
        self.writes += 1;
        let cache_tag = cache_tag.map(str::to_string);
        if let Some(&key) = self.by_id.get(&instance.id) {
            if let Some(row) = self.rows.get_mut(&key) {
                row.label = instance.label.clone().unwrap_or_default();
                row.properties = instance.properties.clone();
                row.file = instance.file.clone();
                row.cache_tag = cache_tag;
                row.partial = false;
                return key;
            }
        }
        self.insert_row(Row {
            id: instance.id.clone(),
            label: instance.label.clone().unwrap_or_default(),
            properties: instance.properties.clone(),
            file: instance.file.clone(),
            cache_tag,
            ..Row::default()
        })
    }

    /// Moves a row to a new key, rewriting references to it.
    fn rekey(&mut self, old: LocalKey) -> StoreResult<LocalKey> {
        let row = self
            .rows
            .remove(&old)
            .ok_or_else(|| StoreError::NotFound(format!("row {old}")))?;
        let new = self.allocate_key();
        for other in self.rows.values_mut() {
            if let Some((source, target)) = &mut other.endpoints {
                if *source == old {
                    *source = new;
                }
                if *target == old {
                    *target = new;
                }
            }
        }
        self.rows.insert(new, row);
        Ok(new)
    }
}

#[derive(Debug, Default)]
struct State {
    data: Data,
    snapshot: Option<Data>,
    fail_commits: bool,
    commits: u64,
}

/// Shared-state in-memory cache.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    file_dir: PathBuf,
}

impl MemoryStore {
    /// Creates an empty store that downloads files into `file_dir`.
    pub fn new(file_dir: impl Into<PathBuf>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            file_dir: file_dir.into(),
        }
    }

    /// Caches a remote instance as if it had been pulled.
    pub fn insert_cached(&self, instance: RemoteInstance) -> LocalKey {
        self.state.lock().data.upsert(&instance, None)
    }

    /// Records the local creation of an object.
    pub fn create_object(&self, class: &str, label: &str, properties: Properties) -> LocalKey {
        let mut state = self.state.lock();
        let change_number = state.data.next_change();
        state.data.insert_row(Row {
            id: RemoteId::parse(class, ""),
            label: label.into(),
            properties,
            status: ChangeStatus::Created,
            change_number,
            ..Row::default()
        })
    }

    /// Records the local creation of an object together with its file.
    pub fn create_object_with_file(
        &self,
        class: &str,
        label: &str,
        properties: Properties,
        path: impl Into<PathBuf>,
    ) -> LocalKey {
        let key = self.create_object(class, label, properties);
        self.modify_file(key, path);
        key
    }

    /// Records the local creation of a relationship between two rows.
    pub fn create_relationship(&self, class: &str, source: LocalKey, target: LocalKey) -> LocalKey {
        let mut state = self.state.lock();
        let change_number = state.data.next_change();
        state.data.insert_row(Row {
            id: RemoteId::parse(class, ""),
            label: format!("{class} {source}->{target}"),
            status: ChangeStatus::Created,
            change_number,
            endpoints: Some((source, target)),
            ..Row::default()
        })
    }

    /// Records a local modification of a cached object.
    pub fn modify_object(&self, key: LocalKey, changed: Properties) {
        let mut state = self.state.lock();
        let change_number = state.data.next_change();
        if let Some(row) = state.data.rows.get_mut(&key) {
            for (name, value) in &changed {
                row.properties.insert(name.clone(), value.clone());
            }
            if row.status == ChangeStatus::Created {
                return;
            }
            row.changed.get_or_insert_with(Properties::new).extend(changed);
            row.status = ChangeStatus::Modified;
            row.change_number = change_number;
        }
    }

    /// Records the local deletion of a cached object.
    pub fn delete_object(&self, key: LocalKey) {
        let mut state = self.state.lock();
        let change_number = state.data.next_change();
        if let Some(row) = state.data.rows.get_mut(&key) {
            row.status = ChangeStatus::Deleted;
            row.change_number = change_number;
        }
    }

    /// Records a new local file for an object.
    pub fn modify_file(&self, key: LocalKey, path: impl Into<PathBuf>) {
        let mut state = self.state.lock();
        let change_number = state.data.next_change();
        if let Some(row) = state.data.rows.get_mut(&key) {
            let status = if row.status == ChangeStatus::Created {
                ChangeStatus::Created
            } else {
                ChangeStatus::Modified
            };
            row.file_change = Some((status, change_number, path.into()));
        }
    }

    /// Makes every following commit fail.
    pub fn fail_commits(&self, fail: bool) {
        self.state.lock().fail_commits = fail;
    }

    /// Number of entity writes committed so far.
    pub fn write_count(&self) -> u64 {
        self.state.lock().data.writes
    }

    /// Number of committed transactions.
    pub fn commit_count(&self) -> u64 {
        self.state.lock().commits
    }

    /// Reads a row.
    pub fn instance(&self, key: LocalKey) -> Option<CachedInstance> {
        let state = self.state.lock();
        state.data.rows.get(&key).map(|row| row.to_cached(key))
    }

    /// Reads a row by remote id.
    pub fn instance_by_id(&self, id: &RemoteId) -> Option<CachedInstance> {
        let state = self.state.lock();
        let key = *state.data.by_id.get(id)?;
        state.data.rows.get(&key).map(|row| row.to_cached(key))
    }

    /// Remote id of a row.
    pub fn remote_id(&self, key: LocalKey) -> Option<RemoteId> {
        self.state.lock().data.rows.get(&key).map(|row| row.id.clone())
    }

    /// Edit state of a row, `None` if the row is gone.
    pub fn status(&self, key: LocalKey) -> Option<ChangeStatus> {
        self.state.lock().data.rows.get(&key).map(|row| row.status)
    }

    /// Returns true if a file change is pending for the row.
    pub fn has_file_change(&self, key: LocalKey) -> bool {
        self.state
            .lock()
            .data
            .rows
            .get(&key)
            .is_some_and(|row| row.file_change.is_some())
    }

    /// Number of rows with a pending change of any kind.
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .data
            .rows
            .values()
            .filter(|row| row.status != ChangeStatus::NoChange || row.file_change.is_some())
            .count()
    }

    /// Remote ids listed in a cached response.
    pub fn response_ids(&self, key: &CachedQueryKey) -> Option<Vec<RemoteId>> {
        self.state
            .lock()
            .data
            .responses
            .get(key)
            .map(|response| response.ids.clone())
    }

    /// Path of a cached file.
    pub fn cached_file(&self, id: &RemoteId) -> Option<PathBuf> {
        self.state.lock().data.files.get(id).map(|f| f.path.clone())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.state.lock().data.rows.len()
    }

    /// Returns true if the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_data<T>(&self, f: impl FnOnce(&Data) -> StoreResult<T>) -> StoreResult<T> {
        let state = self.state.lock();
        if state.snapshot.is_none() {
            return Err(StoreError::Other("no active transaction".into()));
        }
        f(&state.data)
    }

    fn with_data_mut<T>(&self, f: impl FnOnce(&mut Data) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self.state.lock();
        if state.snapshot.is_none() {
            return Err(StoreError::Other("no active transaction".into()));
        }
        f(&mut state.data)
    }
}

impl CacheStore for MemoryStore {
    fn begin(&mut self) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.snapshot.is_some() {
            return Err(StoreError::Constraint("transaction already active".into()));
        }
        state.snapshot = Some(state.data.clone());
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.fail_commits {
            return Err(StoreError::Other("commit failed".into()));
        }
        if state.snapshot.take().is_none() {
            return Err(StoreError::Other("no active transaction".into()));
        }
        state.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) {
        let mut state = self.state.lock();
        if let Some(snapshot) = state.snapshot.take() {
            state.data = snapshot;
        }
    }

    fn find_instance(&self, id: &RemoteId) -> StoreResult<Option<LocalKey>> {
        self.with_data(|data| Ok(data.by_id.get(id).copied()))
    }

    fn find_remote_id(&self, key: LocalKey) -> StoreResult<Option<RemoteId>> {
        self.with_data(|data| Ok(data.rows.get(&key).map(|row| row.id.clone())))
    }

    fn read_instance(&self, key: LocalKey) -> StoreResult<Option<CachedInstance>> {
        self.with_data(|data| Ok(data.rows.get(&key).map(|row| row.to_cached(key))))
    }

    fn read_instance_cache_tag(&self, key: LocalKey) -> StoreResult<Option<String>> {
        self.with_data(|data| Ok(data.rows.get(&key).and_then(|row| row.cache_tag.clone())))
    }

    fn update_instance(
        &mut self,
        instance: &RemoteInstance,
        cache_tag: Option<&str>,
    ) -> StoreResult<LocalKey> {
        self.with_data_mut(|data| Ok(data.upsert(instance, cache_tag)))
    }

    fn remove_instance(&mut self, key: LocalKey) -> StoreResult<()> {
        self.with_data_mut(|data| {
            let row = data
                .rows
                .remove(&key)
                .ok_or_else(|| StoreError::NotFound(format!("row {key}")))?;
            data.by_id.remove(&row.id);
            for response in data.responses.values_mut() {
                response.ids.retain(|id| *id != row.id);
            }
            data.writes += 1;
            Ok(())
        })
    }

    fn read_response_cache_tag(&self, key: &CachedQueryKey) -> StoreResult<Option<String>> {
        self.with_data(|data| Ok(data.responses.get(key).and_then(|r| r.cache_tag.clone())))
    }

    fn read_response_instances(&self, key: &CachedQueryKey) -> StoreResult<Option<Vec<LocalKey>>> {
        self.with_data(|data| {
            Ok(data.responses.get(key).map(|response| {
                response
                    .ids
                    .iter()
                    .filter_map(|id| data.by_id.get(id).copied())
                    .collect()
            }))
        })
    }

    fn cache_response(
        &mut self,
        key: &CachedQueryKey,
        response: &ObjectsResponse,
        query: Option<&Query>,
    ) -> StoreResult<Vec<RemoteId>> {
        let partial = query.is_some_and(Query::is_partial);
        self.with_data_mut(|data| {
            let mut rejected = Vec::new();
            for instance in &response.instances {
                if !partial {
                    data.upsert(instance, None);
                    continue;
                }
                let full = data
                    .by_id
                    .get(&instance.id)
                    .and_then(|key| data.rows.get_mut(key))
                    .filter(|row| !row.partial);
                match full {
                    Some(row) => {
                        row.properties.extend(instance.properties.clone());
                        data.writes += 1;
                    }
                    None => rejected.push(instance.id.clone()),
                }
            }
            data.responses.insert(
                key.clone(),
                CachedResponse {
                    ids: response.instances.iter().map(|i| i.id.clone()).collect(),
                    cache_tag: response.cache_tag.clone(),
                },
            );
            data.writes += 1;
            Ok(rejected)
        })
    }

    fn read_file_path(&self, id: &RemoteId) -> StoreResult<Option<PathBuf>> {
        self.with_data(|data| Ok(data.files.get(id).map(|f| f.path.clone())))
    }

    fn read_file_cache_tag(&self, id: &RemoteId) -> StoreResult<Option<String>> {
        self.with_data(|data| Ok(data.files.get(id).and_then(|f| f.cache_tag.clone())))
    }

    fn file_download_path(&self, id: &RemoteId) -> StoreResult<PathBuf> {
        Ok(self
            .file_dir
            .join(format!("{}_{}.bin", id.class.name, id.remote_id)))
    }

    fn cache_file(
        &mut self,
        id: &RemoteId,
        path: &Path,
        cache_tag: Option<&str>,
    ) -> StoreResult<PathBuf> {
        self.with_data_mut(|data| {
            data.files.insert(
                id.clone(),
                CachedFile {
                    path: path.to_path_buf(),
                    cache_tag: cache_tag.map(str::to_string),
                },
            );
            data.writes += 1;
            Ok(path.to_path_buf())
        })
    }

    fn read_pending_changes(&self) -> StoreResult<PendingChanges> {
        self.with_data(|data| {
            let mut changes = PendingChanges::default();
            for (&key, row) in &data.rows {
                if row.status != ChangeStatus::NoChange {
                    match row.endpoints {
                        Some((source, target)) => changes.relationships.push(RelationshipChange {
                            key,
                            status: row.status,
                            change_number: row.change_number,
                            source,
                            target,
                        }),
                        None => changes.objects.push(ObjectChange {
                            key,
                            status: row.status,
                            change_number: row.change_number,
                        }),
                    }
                }
                if let Some((status, change_number, path)) = &row.file_change {
                    changes.files.push(FileChange {
                        key,
                        status: *status,
                        change_number: *change_number,
                        path: path.clone(),
                    });
                }
            }
            Ok(changes)
        })
    }

    fn read_revision(&self, key: LocalKey) -> StoreResult<Revision> {
        self.with_data(|data| {
            let row = data.row(key)?;
            let properties = match row.status {
                ChangeStatus::Created => Some(row.properties.clone()),
                ChangeStatus::Modified => Some(row.changed.clone().unwrap_or_default()),
                ChangeStatus::Deleted | ChangeStatus::NoChange => None,
            };
            Ok(Revision {
                remote_id: row.id.clone(),
                status: row.status,
                properties,
                label: row.label.clone(),
            })
        })
    }

    fn commit_revision(
        &mut self,
        key: LocalKey,
        assigned: &RemoteId,
        refreshed: Option<&RemoteInstance>,
    ) -> StoreResult<LocalKey> {
        self.with_data_mut(|data| {
            data.writes += 1;
            if data.row(key)?.status == ChangeStatus::Deleted {
                if let Some(row) = data.rows.remove(&key) {
                    data.by_id.remove(&row.id);
                }
                return Ok(key);
            }

            let mut key = key;
            let class_changed = match refreshed {
                Some(instance) => instance.id.class != data.row(key)?.id.class,
                None => false,
            };
            if class_changed {
                key = data.rekey(key)?;
            }

            let row = data.row_mut(key)?;
            let old_id = row.id.clone();
            row.status = ChangeStatus::NoChange;
            row.changed = None;
            row.id = assigned.clone();
            if let Some(instance) = refreshed {
                row.id = instance.id.clone();
                if let Some(label) = &instance.label {
                    row.label = label.clone();
                }
                row.properties = instance.properties.clone();
                row.file = instance.file.clone();
            }
            let new_id = row.id.clone();
            if !old_id.is_pending() {
                data.by_id.remove(&old_id);
            }
            data.by_id.insert(new_id, key);
            Ok(key)
        })
    }

    fn commit_file_revision(&mut self, key: LocalKey) -> StoreResult<()> {
        self.with_data_mut(|data| {
            data.row_mut(key)?.file_change = None;
            data.writes += 1;
            Ok(())
        })
    }
}
