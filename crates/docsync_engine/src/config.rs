//! Configuration for the sync engine and client.

use docsync_local::QueryEngineConfig;
use docsync_model::DatabaseId;
use std::path::PathBuf;
use std::time::Duration;

/// Where the local cache lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    /// Nothing survives the client.
    Memory,
    /// An append-only log file at the given path.
    File(PathBuf),
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Database whose documents are cached.
    pub database_id: DatabaseId,
    /// Local cache storage.
    pub persistence: PersistenceMode,
    /// Sync the log file on every commit.
    pub sync_on_commit: bool,
    /// Reconnect backoff of both streams.
    pub backoff: BackoffConfig,
    /// Maximum number of limbo documents resolved at once.
    pub max_concurrent_limbo_resolutions: usize,
    /// How long a stream with nothing to do stays open.
    pub idle_stream_timeout: Duration,
    /// How long to wait for the listen stream before reporting offline.
    pub online_state_timeout: Duration,
    /// Consecutive listen stream failures before reporting offline.
    pub max_watch_stream_failures: u32,
    /// Maximum number of writes awaiting acknowledgement, if limited.
    pub max_pending_writes: Option<usize>,
    /// Consecutive transient failures after which a write is rejected, if
    /// limited.
    pub write_retry_limit: Option<u32>,
    /// Local query execution tuning.
    pub query_engine: QueryEngineConfig,
}

impl SyncConfig {
    /// Creates a configuration for `database_id` with in-memory persistence.
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            persistence: PersistenceMode::Memory,
            sync_on_commit: true,
            backoff: BackoffConfig::default(),
            max_concurrent_limbo_resolutions: 100,
            idle_stream_timeout: Duration::from_secs(60),
            online_state_timeout: Duration::from_secs(10),
            max_watch_stream_failures: 1,
            max_pending_writes: None,
            write_retry_limit: None,
            query_engine: QueryEngineConfig::default(),
        }
    }

    /// Stores the cache in a log file at `path`.
    pub fn with_file_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence = PersistenceMode::File(path.into());
        self
    }

    /// Sets whether every commit is synced to disk.
    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the limbo resolution cap.
    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max;
        self
    }

    /// Sets the idle stream timeout.
    pub fn with_idle_stream_timeout(mut self, timeout: Duration) -> Self {
        self.idle_stream_timeout = timeout;
        self
    }

    /// Sets the online state timeout.
    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }

    /// Sets how many consecutive listen failures mean offline.
    pub fn with_max_watch_stream_failures(mut self, failures: u32) -> Self {
        self.max_watch_stream_failures = failures;
        self
    }

    /// Limits the number of unacknowledged writes.
    pub fn with_max_pending_writes(mut self, max: usize) -> Self {
        self.max_pending_writes = Some(max);
        self
    }

    /// Rejects a write after `limit` consecutive transient failures.
    pub fn with_write_retry_limit(mut self, limit: u32) -> Self {
        self.write_retry_limit = Some(limit);
        self
    }

    /// Sets the query engine configuration.
    pub fn with_query_engine(mut self, config: QueryEngineConfig) -> Self {
        self.query_engine = config;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DatabaseId::default())
    }
}

/// Configuration for exponential reconnect backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound of the base delay.
    pub max_delay: Duration,
    /// Factor applied to the base delay after each attempt.
    pub multiplier: f64,
}

impl BackoffConfig {
    /// Creates a backoff configuration.
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 1.5)
    }
}
