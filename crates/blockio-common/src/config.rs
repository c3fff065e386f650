//! Configuration types for BlockIO
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `BLOCKIO__<SECTION>__<KEY>` environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command ids are 16 bits wide on the wire
pub const MAX_IO_DEPTH: usize = 1 << 16;

/// Root configuration for BlockIO
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client data path configuration
    pub client: ClientConfig,
    /// Store server configuration
    pub server: ServerConfig,
    /// Event queue configuration shared by all workers
    pub queue: QueueConfig,
    /// Metadata service (conductor) configuration
    pub conductor: ConductorConfig,
}

impl Config {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let cfg: Self = builder
            .add_source(
                config::Environment::with_prefix("BLOCKIO")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| Error::configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the data path cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.client.io_depth == 0 || self.client.io_depth > MAX_IO_DEPTH {
            return Err(Error::configuration(format!(
                "client.io_depth must be in 1..={MAX_IO_DEPTH}, got {}",
                self.client.io_depth
            )));
        }
        if self.server.io_depth == 0 || self.server.dispatcher_count == 0 {
            return Err(Error::configuration(
                "server.io_depth and server.dispatcher_count must be non-zero",
            ));
        }
        if self.queue.depth == 0 || self.queue.batch_size == 0 || self.queue.msg_cache_size == 0 {
            return Err(Error::configuration(
                "queue.depth, queue.batch_size and queue.msg_cache_size must be non-zero",
            ));
        }
        if self.server.engine == EngineKind::File && self.server.engine_path.is_none() {
            return Err(Error::configuration("server.engine_path is required for the file engine"));
        }
        if self.client.heartbeat_batch == 0 {
            return Err(Error::configuration("client.heartbeat_batch must be non-zero"));
        }
        Ok(())
    }
}

/// Transport used by the client to reach stores
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Tcp,
    Rdma,
}

/// Client data path configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Number of iocbs per volume (maximum in-flight requests)
    pub io_depth: usize,
    /// Milliseconds before an in-flight request is considered stalled
    pub io_timeout_ms: u64,
    /// Interval of the timeout scanner
    pub timeout_check_interval_ms: u64,
    /// Interval between heartbeat sweeps
    pub heartbeat_interval_ms: u64,
    /// Maximum heartbeats sent per sweep
    pub heartbeat_batch: usize,
    /// Connections with more unanswered heartbeats than this are evicted
    pub max_outstanding_heartbeats: u32,
    /// Interval between reconnect attempts while the volume is not opened
    pub reconnect_interval_ms: u64,
    /// Completions slower than this are logged as slow I/O
    pub slow_io_threshold_ms: u64,
    /// Transport to reach stores
    pub transport: TransportKind,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            io_depth: 32,
            io_timeout_ms: 30_000,
            timeout_check_interval_ms: 1000,
            heartbeat_interval_ms: 3000,
            heartbeat_batch: 4,
            max_outstanding_heartbeats: 2,
            reconnect_interval_ms: 30_000,
            slow_io_threshold_ms: 2000,
            transport: TransportKind::Tcp,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    #[must_use]
    pub const fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Storage engine backing a store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Memory,
    File,
}

/// Store server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of dispatcher workers; connections are spread round-robin
    pub dispatcher_count: usize,
    /// Number of server iocbs per dispatcher
    pub io_depth: usize,
    /// Command buffers pre-posted for receive on each accepted connection
    pub recv_depth: usize,
    /// Connections the store sizes its receive buffer pool for
    pub max_connections: usize,
    /// Storage engine kind
    pub engine: EngineKind,
    /// Worker threads of the file engine
    pub engine_threads: usize,
    /// Bytes addressable through the engine
    pub engine_capacity: u64,
    /// Backing file of the file engine
    pub engine_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dispatcher_count: 1,
            io_depth: 256,
            recv_depth: 32,
            max_connections: 16,
            engine: EngineKind::Memory,
            engine_threads: 2,
            engine_capacity: 1 << 30,
            engine_path: None,
        }
    }
}

/// Event queue implementation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Lock-guarded double buffer
    #[default]
    DoubleBuffer,
    /// Lock-free ring backed by a message cache
    Ring,
}

/// Event queue configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue implementation
    pub kind: QueueKind,
    /// Maximum queued events
    pub depth: usize,
    /// Events handled per batch take
    pub batch_size: usize,
    /// Messages in each of the ring's two caches (owner-local and shared)
    pub msg_cache_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: QueueKind::DoubleBuffer,
            depth: 4096,
            batch_size: 8,
            msg_cache_size: 1024,
        }
    }
}

/// Metadata service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Base URL, e.g. `http://10.0.0.1:49180`
    pub url: String,
    /// Per-request timeout
    pub timeout_secs: u64,
    /// Attempts per query
    pub retries: u32,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:49180".to_string(),
            timeout_secs: 5,
            retries: 3,
        }
    }
}
