//! Configuration for the sync engine.

use std::time::Duration;

/// Default ceiling on simultaneously active file transfers.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 10;

/// Default ceiling on simultaneously active navigation fetches.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 10;

/// Default minimum interval between two progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration shared by every run issued through one cache.
#[derive(Debug, Clone)]
pub struct CacheSyncConfig {
    /// Maximum number of file transfers running at once.
    pub max_concurrent_downloads: usize,
    /// Maximum number of navigation children queries running at once.
    pub max_concurrent_fetches: usize,
    /// Minimum interval between progress reports.
    pub progress_interval: Duration,
    /// Limits applied to changeset requests.
    pub changeset_limits: ChangesetLimits,
    /// Name given to the cache access thread.
    pub access_thread_name: String,
}

impl CacheSyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            changeset_limits: ChangesetLimits::default(),
            access_thread_name: "wscache-access".into(),
        }
    }

    /// Sets the download concurrency limit. Zero is treated as one.
    pub fn with_max_concurrent_downloads(mut self, limit: usize) -> Self {
        self.max_concurrent_downloads = limit.max(1);
        self
    }

    /// Sets the navigation fetch concurrency limit. Zero is treated as one.
    pub fn with_max_concurrent_fetches(mut self, limit: usize) -> Self {
        self.max_concurrent_fetches = limit.max(1);
        self
    }

    /// Sets the minimum interval between progress reports.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Sets the changeset limits.
    pub fn with_changeset_limits(mut self, limits: ChangesetLimits) -> Self {
        self.changeset_limits = limits;
        self
    }

    /// Sets the access thread name.
    pub fn with_access_thread_name(mut self, name: impl Into<String>) -> Self {
        self.access_thread_name = name.into();
        self
    }
}

impl Default for CacheSyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Upper bounds for a single changeset request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangesetLimits {
    /// Maximum serialized size in bytes.
    pub max_size: Option<usize>,
    /// Maximum number of entries.
    pub max_instances: Option<usize>,
}

impl ChangesetLimits {
    /// Limits with no bounds.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Sets the size limit.
    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = Some(bytes);
        self
    }

    /// Sets the entry count limit.
    pub fn with_max_instances(mut self, count: usize) -> Self {
        self.max_instances = Some(count);
        self
    }

    /// Returns true if a request of this size and entry count is too big.
    pub fn exceeded_by(&self, size: usize, instances: usize) -> bool {
        self.max_size.is_some_and(|max| size > max)
            || self.max_instances.is_some_and(|max| instances > max)
    }
}

/// Options for one local-change sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Batch independent changes into changesets when the server allows it.
    pub use_changesets: bool,
    /// Overrides the configured changeset limits.
    pub changeset_limits: Option<ChangesetLimits>,
}

impl SyncOptions {
    /// Creates options with changesets enabled.
    pub fn new() -> Self {
        Self {
            use_changesets: true,
            changeset_limits: None,
        }
    }

    /// Enables or disables changesets.
    pub fn with_changesets(mut self, enabled: bool) -> Self {
        self.use_changesets = enabled;
        self
    }

    /// Overrides the changeset limits for this run.
    pub fn with_changeset_limits(mut self, limits: ChangesetLimits) -> Self {
        self.changeset_limits = Some(limits);
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for one navigation caching run.
#[derive(Debug, Clone, Default)]
pub struct NavigationOptions {
    /// Overrides the configured fetch concurrency.
    pub max_concurrent_fetches: Option<usize>,
    /// Only request these properties of the children.
    pub property_filter: Option<Vec<String>>,
    /// Download the files of file-backed leaves.
    pub download_files: bool,
}

impl NavigationOptions {
    /// Creates options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the fetch concurrency. Zero is treated as one.
    pub fn with_max_concurrent_fetches(mut self, limit: usize) -> Self {
        self.max_concurrent_fetches = Some(limit.max(1));
        self
    }

    /// Requests only the given properties.
    pub fn with_property_filter(mut self, properties: Vec<String>) -> Self {
        self.property_filter = Some(properties);
        self
    }

    /// Enables file downloads for file-backed leaves.
    pub fn with_file_downloads(mut self, enabled: bool) -> Self {
        self.download_files = enabled;
        self
    }
}
