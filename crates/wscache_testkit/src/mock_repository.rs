//! In-memory remote repository.
//!
//! Serves objects, navigation children and files, applies writes, and
//! records every request so tests can assert on what reached the server.
//! Failures can be injected per operation and target.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, trace};
use uuid::Uuid;
use wscache_engine::{ByteProgress, CancellationToken, RepositoryClient, TransferProgress};
use wscache_protocol::{
    ChangeState, Changeset, ChangesetResponse, ClassKey, ClientError, ClientErrorKind,
    ClientResult, FileResponse, InstanceRef, ObjectsResponse, Properties, Query, RemoteId,
    RemoteInstance, ServerInfo,
};

/// Repository operations, for failure injection and request counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `server_info`
    ServerInfo,
    /// `get_object`
    GetObject,
    /// `query`
    Query,
    /// `send_changeset`
    Changeset,
    /// `create_object`
    Create,
    /// `update_object`
    Update,
    /// `delete_object`
    Delete,
    /// `update_file`
    UpdateFile,
    /// `get_file`
    GetFile,
}

/// What a failure rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every request of the operation.
    Any,
    /// Requests touching this id.
    Id(RemoteId),
    /// Requests touching an instance of this class.
    Class(ClassKey),
}

/// A request as received by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `get_object`
    GetObject(RemoteId),
    /// `query`
    Query(Query),
    /// `send_changeset`
    Changeset(Changeset),
    /// `create_object`
    Create(Changeset),
    /// `update_object`
    Update(RemoteId),
    /// `delete_object`
    Delete(RemoteId),
    /// `update_file`
    UpdateFile(RemoteId),
    /// `get_file`
    GetFile(RemoteId),
}

impl Request {
    /// The operation of the request.
    pub fn op(&self) -> Op {
        match self {
            Request::GetObject(_) => Op::GetObject,
            Request::Query(_) => Op::Query,
            Request::Changeset(_) => Op::Changeset,
            Request::Create(_) => Op::Create,
            Request::Update(_) => Op::Update,
            Request::Delete(_) => Op::Delete,
            Request::UpdateFile(_) => Op::UpdateFile,
            Request::GetFile(_) => Op::GetFile,
        }
    }
}

#[derive(Debug, Clone)]
struct FailureRule {
    op: Op,
    target: Target,
    error: ClientError,
    remaining: Option<usize>,
}

/// Concurrency observed by `get_file`.
#[derive(Debug, Clone, Default)]
pub struct FileStats {
    /// Transfers running right now.
    pub active: usize,
    /// Highest number of transfers running at once.
    pub max_active: usize,
    /// Files in the order their transfer started.
    pub started: Vec<RemoteId>,
    /// Files in the order their transfer finished.
    pub finished: Vec<RemoteId>,
    /// Files whose transfer was canceled.
    pub canceled: Vec<RemoteId>,
    /// Transfers per file.
    pub calls: HashMap<RemoteId, usize>,
}

#[derive(Debug, Clone)]
struct StoredFile {
    content: Vec<u8>,
    tag: String,
}

#[derive(Debug, Default)]
struct ServerState {
    info: ServerInfo,
    objects: BTreeMap<RemoteId, RemoteInstance>,
    tags: HashMap<RemoteId, String>,
    relationships: BTreeMap<RemoteId, (RemoteId, RemoteId)>,
    children: HashMap<RemoteId, Vec<RemoteId>>,
    child_tags: HashMap<RemoteId, String>,
    query_results: HashMap<Query, (Vec<RemoteId>, Option<String>)>,
    files: HashMap<RemoteId, StoredFile>,
    failures: Vec<FailureRule>,
    requests: Vec<Request>,
    created: Vec<RemoteId>,
    page_size: Option<usize>,
    file_stats: FileStats,
    revision: u64,
}

impl ServerState {
    fn next_tag(&mut self) -> String {
        self.revision += 1;
        format!("r{}", self.revision)
    }

    fn take_failure(&mut self, op: Op, targets: &[&RemoteId]) -> Option<ClientError> {
        let index = self.failures.iter().position(|rule| {
            rule.op == op
                && match &rule.target {
                    Target::Any => true,
                    Target::Id(id) => targets.iter().any(|t| *t == id),
                    Target::Class(class) => targets.iter().any(|t| t.class == *class),
                }
        })?;
        let rule = &mut self.failures[index];
        let error = rule.error.clone();
        if let Some(remaining) = &mut rule.remaining {
            *remaining -= 1;
            if *remaining == 0 {
                self.failures.remove(index);
            }
        }
        Some(error)
    }

    fn exists(&self, id: &RemoteId) -> bool {
        self.objects.contains_key(id) || self.relationships.contains_key(id)
    }

    fn new_id(class: &ClassKey) -> RemoteId {
        RemoteId::new(class.clone(), Uuid::new_v4().simple().to_string())
    }

    /// Applies a changeset atomically.
    fn apply(&mut self, changeset: &Changeset) -> ClientResult<ChangesetResponse> {
        let mut objects = self.objects.clone();
        let mut relationships = self.relationships.clone();
        let mut response = ChangesetResponse::default();

        for entry in &changeset.instances {
            let id = match entry.change_state {
                ChangeState::New => {
                    let id = Self::new_id(&entry.id.class);
                    let mut instance = RemoteInstance::new(id.clone());
                    instance.properties = entry.properties.clone().unwrap_or_default();
                    instance.label = instance
                        .properties
                        .get("Name")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    objects.insert(id.clone(), instance);
                    id
                }
                ChangeState::Modified => {
                    let instance = objects
                        .get_mut(&entry.id)
                        .ok_or_else(|| ClientError::not_found(entry.id.to_string()))?;
                    if let Some(properties) = &entry.properties {
                        instance.properties.extend(properties.clone());
                    }
                    entry.id.clone()
                }
                ChangeState::Deleted => {
                    objects
                        .remove(&entry.id)
                        .ok_or_else(|| ClientError::not_found(entry.id.to_string()))?;
                    entry.id.clone()
                }
                ChangeState::Existing => {
                    if !objects.contains_key(&entry.id) {
                        return Err(ClientError::not_found(entry.id.to_string()));
                    }
                    entry.id.clone()
                }
            };
            response.instances.push(id);
        }

        for entry in &changeset.relationships {
            let resolve = |reference: &InstanceRef| -> ClientResult<RemoteId> {
                match reference {
                    InstanceRef::New(index) => response
                        .instances
                        .get(*index)
                        .cloned()
                        .ok_or_else(|| {
                            ClientError::new(
                                ClientErrorKind::BadRequest,
                                format!("no instance at index {index}"),
                            )
                        }),
                    InstanceRef::Existing(id) if objects.contains_key(id) => Ok(id.clone()),
                    InstanceRef::Existing(id) => Err(ClientError::not_found(id.to_string())),
                }
            };
            let id = match entry.change_state {
                ChangeState::New => {
                    let source = resolve(&entry.source)?;
                    let target = resolve(&entry.target)?;
                    let id = Self::new_id(&entry.id.class);
                    relationships.insert(id.clone(), (source, target));
                    id
                }
                ChangeState::Deleted => {
                    relationships
                        .remove(&entry.id)
                        .ok_or_else(|| ClientError::not_found(entry.id.to_string()))?;
                    entry.id.clone()
                }
                ChangeState::Modified | ChangeState::Existing => {
                    if !relationships.contains_key(&entry.id) {
                        return Err(ClientError::not_found(entry.id.to_string()));
                    }
                    entry.id.clone()
                }
            };
            response.relationships.push(id);
        }

        let created: Vec<RemoteId> = changeset
            .instances
            .iter()
            .zip(&response.instances)
            .filter(|(entry, _)| entry.change_state == ChangeState::New)
            .map(|(_, id)| id.clone())
            .chain(
                changeset
                    .relationships
                    .iter()
                    .zip(&response.relationships)
                    .filter(|(entry, _)| entry.change_state == ChangeState::New)
                    .map(|(_, id)| id.clone()),
            )
            .collect();
        for id in &created {
            let tag = self.next_tag();
            self.tags.insert(id.clone(), tag);
        }
        self.created.extend(created);
        self.objects = objects;
        self.relationships = relationships;
        Ok(response)
    }

    fn page(
        &self,
        ids: &[RemoteId],
        offset: usize,
        select: Option<&Vec<String>>,
    ) -> (Vec<RemoteInstance>, Option<String>) {
        let end = match self.page_size {
            Some(size) => (offset + size).min(ids.len()),
            None => ids.len(),
        };
        let instances = ids
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.objects.get(id))
            .map(|instance| match select {
                Some(names) => {
                    let mut partial = instance.clone();
                    partial.properties.retain(|name, _| names.contains(name));
                    partial
                }
                None => instance.clone(),
            })
            .collect();
        let skip_token = (end < ids.len()).then(|| end.to_string());
        (instances, skip_token)
    }
}

/// In-memory repository server implementing [`RepositoryClient`].
#[derive(Debug, Default)]
pub struct MockRepository {
    state: Mutex<ServerState>,
    file_gate: Mutex<Option<Arc<Semaphore>>>,
    file_delay: Mutex<Duration>,
    query_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockRepository {
    /// Creates a server with the given capabilities.
    pub fn new(info: ServerInfo) -> Self {
        let repository = Self::default();
        repository.state.lock().info = info;
        repository
    }

    /// Stores an object.
    pub fn insert(&self, instance: RemoteInstance) -> RemoteId {
        let mut state = self.state.lock();
        let id = instance.id.clone();
        let tag = state.next_tag();
        state.tags.insert(id.clone(), tag);
        state.objects.insert(id.clone(), instance);
        id
    }

    /// Sets the navigation children of `parent` and gives the level a new tag.
    pub fn set_children(&self, parent: &RemoteId, children: Vec<RemoteInstance>) {
        let ids: Vec<RemoteId> = children.into_iter().map(|c| self.insert(c)).collect();
        let mut state = self.state.lock();
        let tag = state.next_tag();
        state.child_tags.insert(parent.clone(), tag);
        state.children.insert(parent.clone(), ids);
    }

    /// Gives the navigation level of `parent` a new tag.
    pub fn touch_children(&self, parent: &RemoteId) {
        let mut state = self.state.lock();
        let tag = state.next_tag();
        state.child_tags.insert(parent.clone(), tag);
    }

    /// Sets the answer to a query.
    pub fn set_query_result(&self, query: Query, ids: Vec<RemoteId>, cache_tag: Option<&str>) {
        self.state
            .lock()
            .query_results
            .insert(query, (ids, cache_tag.map(str::to_string)));
    }

    /// Stores the file of an object.
    pub fn set_file(&self, id: &RemoteId, content: impl Into<Vec<u8>>) {
        let mut state = self.state.lock();
        let tag = state.next_tag();
        state.files.insert(
            id.clone(),
            StoredFile {
                content: content.into(),
                tag,
            },
        );
    }

    /// Splits query answers into pages of `size` instances.
    pub fn set_page_size(&self, size: usize) {
        self.state.lock().page_size = Some(size.max(1));
    }

    /// Changes the capabilities.
    pub fn set_server_info(&self, info: ServerInfo) {
        self.state.lock().info = info;
    }

    /// Fails every matching request with `error`.
    pub fn fail(&self, op: Op, target: Target, error: ClientError) {
        self.state.lock().failures.push(FailureRule {
            op,
            target,
            error,
            remaining: None,
        });
    }

    /// Fails the next matching request with `error`.
    pub fn fail_once(&self, op: Op, target: Target, error: ClientError) {
        self.state.lock().failures.push(FailureRule {
            op,
            target,
            error,
            remaining: Some(1),
        });
    }

    /// Makes `get_file` wait for a permit of `gate` before transferring.
    pub fn gate_files(&self, gate: Arc<Semaphore>) {
        *self.file_gate.lock() = Some(gate);
    }

    /// Makes every `query` use up one permit of `gate` before answering.
    pub fn gate_queries(&self, gate: Arc<Semaphore>) {
        *self.query_gate.lock() = Some(gate);
    }

    /// Makes `get_file` take at least `delay`.
    pub fn delay_files(&self, delay: Duration) {
        *self.file_delay.lock() = delay;
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().requests.clone()
    }

    /// Number of requests of one operation.
    pub fn request_count(&self, op: Op) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.op() == op)
            .count()
    }

    /// Ids created by the server, in creation order.
    pub fn created(&self) -> Vec<RemoteId> {
        self.state.lock().created.clone()
    }

    /// Reads a stored object.
    pub fn object(&self, id: &RemoteId) -> Option<RemoteInstance> {
        self.state.lock().objects.get(id).cloned()
    }

    /// Finds a stored object by label.
    pub fn object_by_label(&self, label: &str) -> Option<RemoteInstance> {
        self.state
            .lock()
            .objects
            .values()
            .find(|o| o.label.as_deref() == Some(label))
            .cloned()
    }

    /// Endpoints of a stored relationship.
    pub fn relationship(&self, id: &RemoteId) -> Option<(RemoteId, RemoteId)> {
        self.state.lock().relationships.get(id).cloned()
    }

    /// Number of stored relationships.
    pub fn relationship_count(&self) -> usize {
        self.state.lock().relationships.len()
    }

    /// Content of a stored file.
    pub fn file(&self, id: &RemoteId) -> Option<Vec<u8>> {
        self.state.lock().files.get(id).map(|f| f.content.clone())
    }

    /// Concurrency observed by `get_file`.
    pub fn file_stats(&self) -> FileStats {
        self.state.lock().file_stats.clone()
    }

    fn begin(&self, request: Request, op: Op, targets: &[&RemoteId]) -> ClientResult<()> {
        let mut state = self.state.lock();
        trace!(?request, "mock request");
        state.requests.push(request);
        match state.take_failure(op, targets) {
            Some(error) => {
                debug!(?op, error = %error, "injected failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn changeset_targets(changeset: &Changeset) -> Vec<&RemoteId> {
        changeset
            .instances
            .iter()
            .map(|e| &e.id)
            .chain(changeset.relationships.iter().map(|e| &e.id))
            .collect()
    }

    fn store_file(&self, id: &RemoteId, path: &Path) -> ClientResult<()> {
        let content = std::fs::read(path).map_err(|err| {
            ClientError::new(
                ClientErrorKind::BadRequest,
                format!("cannot read {}: {err}", path.display()),
            )
        })?;
        self.set_file(id, content);
        Ok(())
    }
}

fn canceled_if(cancel: &CancellationToken) -> ClientResult<()> {
    if cancel.is_cancelled() {
        Err(ClientError::canceled())
    } else {
        Ok(())
    }
}

#[async_trait]
impl RepositoryClient for MockRepository {
    async fn server_info(&self) -> ClientResult<ServerInfo> {
        let mut state = self.state.lock();
        match state.take_failure(Op::ServerInfo, &[]) {
            Some(error) => Err(error),
            None => Ok(state.info),
        }
    }

    async fn get_object(
        &self,
        id: &RemoteId,
        cache_tag: Option<&str>,
        cancel: &CancellationToken,
    ) -> ClientResult<ObjectsResponse> {
        canceled_if(cancel)?;
        self.begin(Request::GetObject(id.clone()), Op::GetObject, &[id])?;
        let state = self.state.lock();
        let instance = state
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::not_found(id.to_string()))?;
        let tag = state.tags.get(id).cloned();
        if tag.is_some() && tag.as_deref() == cache_tag {
            return Ok(ObjectsResponse::not_modified());
        }
        Ok(ObjectsResponse::new(vec![instance], tag))
    }

    async fn query(
        &self,
        query: &Query,
        cache_tag: Option<&str>,
        skip_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> ClientResult<ObjectsResponse> {
        canceled_if(cancel)?;
        let targets: Vec<&RemoteId> = query.parent.iter().chain(&query.ids).collect();
        self.begin(Request::Query(query.clone()), Op::Query, &targets)?;
        let gate = self.query_gate.lock().clone();
        if let Some(gate) = gate {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ClientError::canceled()),
                permit = gate.acquire() => permit
                    .map_err(|_| ClientError::connection("gate closed"))?
                    .forget(),
            }
        }

        let state = self.state.lock();
        let (ids, tag) = if let Some(parent) = &query.parent {
            if !parent.is_root() && !state.objects.contains_key(parent) {
                return Err(ClientError::not_found(parent.to_string()));
            }
            (
                state.children.get(parent).cloned().unwrap_or_default(),
                Some(
                    state
                        .child_tags
                        .get(parent)
                        .cloned()
                        .unwrap_or_else(|| "r0".into()),
                ),
            )
        } else if !query.ids.is_empty() {
            (query.ids.clone(), None)
        } else {
            state
                .query_results
                .get(query)
                .cloned()
                .unwrap_or_else(|| {
                    let ids = state
                        .objects
                        .keys()
                        .filter(|id| id.class == query.class)
                        .cloned()
                        .collect();
                    (ids, None)
                })
        };

        if skip_token.is_none() && tag.is_some() && tag.as_deref() == cache_tag {
            return Ok(ObjectsResponse::not_modified());
        }
        let offset = skip_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let (instances, next) = state.page(&ids, offset, query.select.as_ref());
        let mut response = ObjectsResponse::new(instances, tag);
        response.skip_token = next;
        Ok(response)
    }

    async fn send_changeset(
        &self,
        changeset: &Changeset,
        cancel: &CancellationToken,
    ) -> ClientResult<ChangesetResponse> {
        canceled_if(cancel)?;
        let targets = Self::changeset_targets(changeset);
        self.begin(Request::Changeset(changeset.clone()), Op::Changeset, &targets)?;
        self.state.lock().apply(changeset)
    }

    async fn create_object(
        &self,
        changeset: &Changeset,
        file: Option<&Path>,
        progress: Option<TransferProgress>,
        cancel: &CancellationToken,
    ) -> ClientResult<ChangesetResponse> {
        canceled_if(cancel)?;
        let targets = Self::changeset_targets(changeset);
        self.begin(Request::Create(changeset.clone()), Op::Create, &targets)?;
        let response = self.state.lock().apply(changeset)?;
        if let (Some(path), Some(id)) = (file, response.instances.first()) {
            self.store_file(id, path)?;
            if let Some(progress) = progress {
                let size = self.file(id).map_or(0, |c| c.len() as u64);
                progress(ByteProgress::new(size, size));
            }
        }
        Ok(response)
    }

    async fn update_object(
        &self,
        id: &RemoteId,
        properties: &Properties,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        canceled_if(cancel)?;
        self.begin(Request::Update(id.clone()), Op::Update, &[id])?;
        let mut state = self.state.lock();
        let instance = state
            .objects
            .get_mut(id)
            .ok_or_else(|| ClientError::not_found(id.to_string()))?;
        instance.properties.extend(properties.clone());
        let tag = state.next_tag();
        state.tags.insert(id.clone(), tag);
        Ok(())
    }

    async fn delete_object(&self, id: &RemoteId, cancel: &CancellationToken) -> ClientResult<()> {
        canceled_if(cancel)?;
        self.begin(Request::Delete(id.clone()), Op::Delete, &[id])?;
        let mut state = self.state.lock();
        if state.objects.remove(id).is_none() && state.relationships.remove(id).is_none() {
            return Err(ClientError::not_found(id.to_string()));
        }
        state.tags.remove(id);
        Ok(())
    }

    async fn update_file(
        &self,
        id: &RemoteId,
        path: &Path,
        progress: Option<TransferProgress>,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        canceled_if(cancel)?;
        self.begin(Request::UpdateFile(id.clone()), Op::UpdateFile, &[id])?;
        if !self.state.lock().exists(id) {
            return Err(ClientError::not_found(id.to_string()));
        }
        self.store_file(id, path)?;
        if let Some(progress) = progress {
            let size = self.file(id).map_or(0, |c| c.len() as u64);
            progress(ByteProgress::new(size, size));
        }
        Ok(())
    }

    async fn get_file(
        &self,
        id: &RemoteId,
        destination: &Path,
        cache_tag: Option<&str>,
        progress: Option<TransferProgress>,
        cancel: &CancellationToken,
    ) -> ClientResult<FileResponse> {
        canceled_if(cancel)?;
        self.begin(Request::GetFile(id.clone()), Op::GetFile, &[id])?;
        let stored = self
            .state
            .lock()
            .files
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::not_found(id.to_string()))?;
        if cache_tag == Some(stored.tag.as_str()) {
            return Ok(FileResponse {
                path: destination.to_path_buf(),
                cache_tag: Some(stored.tag),
                not_modified: true,
            });
        }

        {
            let mut state = self.state.lock();
            let stats = &mut state.file_stats;
            stats.active += 1;
            stats.max_active = stats.max_active.max(stats.active);
            stats.started.push(id.clone());
            *stats.calls.entry(id.clone()).or_default() += 1;
        }

        let size = stored.content.len() as u64;
        if let Some(progress) = &progress {
            progress(ByteProgress::new(0, size));
        }
        let gate = self.file_gate.lock().clone();
        let delay = *self.file_delay.lock();
        let transfer = async {
            let _permit = match &gate {
                Some(gate) => Some(
                    gate.acquire()
                        .await
                        .map_err(|_| ClientError::connection("gate closed"))?,
                ),
                None => None,
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(progress) = &progress {
                progress(ByteProgress::new(size / 2, size));
            }
            std::fs::write(destination, &stored.content)
                .map_err(|err| ClientError::new(ClientErrorKind::Server, err.to_string()))?;
            if let Some(progress) = &progress {
                progress(ByteProgress::new(size, size));
            }
            Ok::<(), ClientError>(())
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ClientError::canceled()),
            result = transfer => result,
        };

        let mut state = self.state.lock();
        let stats = &mut state.file_stats;
        stats.active -= 1;
        match &result {
            Ok(()) => stats.finished.push(id.clone()),
            Err(err) if err.is_canceled() => stats.canceled.push(id.clone()),
            Err(_) => {}
        }
        result.map(|()| FileResponse {
            path: destination.to_path_buf(),
            cache_tag: Some(stored.tag),
            not_modified: false,
        })
    }
}
