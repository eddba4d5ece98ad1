//! Test fixtures.
//!
//! [`TestEnv`] wires a [`MemoryStore`] and a [`MockRepository`] into a
//! [`CachingDataSource`] over a temporary directory.

use crate::memory_store::MemoryStore;
use crate::mock_repository::MockRepository;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use wscache_engine::{CacheSyncConfig, CachingDataSource, ProgressHandler, SyncProgress};
use wscache_protocol::{ClassKey, Properties, RemoteId, RemoteInstance, ServerInfo};

/// Schema used by the fixtures.
pub const TEST_SCHEMA: &str = "TestSchema";

/// Qualified name of the object class used by the fixtures.
pub const TEST_CLASS: &str = "TestSchema.TestClass";

/// Qualified name of the relationship class used by the fixtures.
pub const TEST_RELATIONSHIP: &str = "TestSchema.TestRelationship";

/// Data source type built by [`TestEnv`].
pub type TestDataSource = CachingDataSource<MemoryStore, MockRepository>;

static LOGGING: Once = Once::new();

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A cache, a server and a scratch directory.
pub struct TestEnv {
    /// Inspection handle on the cache.
    pub store: MemoryStore,
    /// Configuration used by [`TestEnv::data_source`].
    pub config: CacheSyncConfig,
    server: Option<MockRepository>,
    temp_dir: TempDir,
}

impl TestEnv {
    /// Creates an environment whose server supports everything.
    pub fn new() -> Self {
        Self::with_server(ServerInfo::full())
    }

    /// Creates an environment whose server advertises `info`.
    pub fn with_server(info: ServerInfo) -> Self {
        init_test_logging();
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let file_dir = temp_dir.path().join("files");
        std::fs::create_dir_all(&file_dir).expect("Failed to create file directory");
        let store = MemoryStore::new(file_dir);
        Self {
            store,
            config: CacheSyncConfig::new().with_progress_interval(Duration::ZERO),
            server: Some(MockRepository::new(info)),
            temp_dir,
        }
    }

    /// The server, until it is handed to the data source.
    pub fn server(&self) -> &MockRepository {
        self.server
            .as_ref()
            .expect("server already moved into the data source")
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: CacheSyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the data source, moving the server into it.
    ///
    /// Reach the server afterwards through
    /// [`CachingDataSource::client`].
    pub fn data_source(&mut self) -> TestDataSource {
        let server = self
            .server
            .take()
            .expect("data source already built for this environment");
        CachingDataSource::new(self.store.clone(), server, self.config.clone())
            .expect("Failed to start the cache access thread")
    }

    /// Scratch directory removed with the environment.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes a scratch file and returns its path.
    pub fn write_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content).expect("Failed to write test file");
        path
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `condition` until it holds, panicking after about a second.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Class key of [`TEST_CLASS`].
pub fn test_class() -> ClassKey {
    ClassKey::new(TEST_SCHEMA, "TestClass")
}

/// Id of a [`TEST_CLASS`] instance.
pub fn test_id(remote_id: &str) -> RemoteId {
    RemoteId::new(test_class(), remote_id)
}

/// A labeled [`TEST_CLASS`] instance with a `Name` property.
pub fn test_instance(remote_id: &str) -> RemoteInstance {
    RemoteInstance::new(test_id(remote_id))
        .with_label(remote_id)
        .with_property("Name", serde_json::json!(remote_id))
}

/// A file-backed [`TEST_CLASS`] instance.
pub fn test_file_instance(remote_id: &str, size: u64) -> RemoteInstance {
    test_instance(remote_id).with_file(format!("{remote_id}.bin"), Some(size))
}

/// Properties with a single `Name`.
pub fn name_properties(name: &str) -> Properties {
    let mut properties = Properties::new();
    properties.insert("Name".into(), serde_json::json!(name));
    properties
}

/// Progress reports collected by a handler.
#[derive(Debug, Clone, Default)]
pub struct ProgressLog {
    reports: Arc<Mutex<Vec<SyncProgress>>>,
}

impl ProgressLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler appending to this log.
    pub fn handler(&self) -> ProgressHandler {
        let reports = Arc::clone(&self.reports);
        Arc::new(move |progress: &SyncProgress| reports.lock().push(progress.clone()))
    }

    /// Every report so far.
    pub fn reports(&self) -> Vec<SyncProgress> {
        self.reports.lock().clone()
    }

    /// Reported fractions in order.
    pub fn fractions(&self) -> Vec<f64> {
        self.reports.lock().iter().map(|p| p.fraction).collect()
    }

    /// Returns true if no fraction ever went down.
    pub fn is_monotonic(&self) -> bool {
        self.fractions().windows(2).all(|w| w[0] <= w[1])
    }
}
