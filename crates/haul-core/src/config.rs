use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::lifecycle::EnqueueOption;

/// Timeouts for the curl-backed strategy (optional `[http]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,
    /// Abort a transfer that stays under `low_speed_limit_bytes` for this long.
    pub low_speed_time_secs: u64,
    pub low_speed_limit_bytes: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            low_speed_time_secs: 60,
            low_speed_limit_bytes: 1,
        }
    }
}

/// File-server strategy settings (optional `[file_server]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileServerConfig {
    /// When false, `haulfs://` jobs fail with `strategy_unavailable`.
    pub enabled: bool,
    /// Socket read deadline; bounds how long a worker goes without checking its interrupt flag.
    pub read_timeout_ms: u64,
    /// Give up after this long without receiving a byte.
    pub stall_timeout_secs: u64,
}

impl Default for FileServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_timeout_ms: 500,
            stall_timeout_secs: 60,
        }
    }
}

impl FileServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

/// Global configuration loaded from `~/.config/haul/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaulConfig {
    /// Partition of the job store this process manages.
    pub namespace: String,
    /// Maximum number of transfers in flight.
    pub concurrency_limit: usize,
    /// Minimum gap between two progress reports for one job.
    pub progress_interval_ms: u64,
    /// Read/write buffer for transfers, in bytes.
    pub buffer_size: usize,
    /// Segments per chunked transfer; 1 keeps every transfer sequential.
    pub segments: usize,
    /// Shared working directory for partial segments (None = system temp dir).
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Start dispatching queued jobs as soon as the manager opens.
    pub auto_start: bool,
    pub queue_poll_ms: u64,
    /// Duplicate handling applied to every enqueue.
    #[serde(default)]
    pub enqueue_options: Vec<EnqueueOption>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub file_server: FileServerConfig,
}

impl Default for HaulConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            concurrency_limit: 3,
            progress_interval_ms: 500,
            buffer_size: 64 * 1024,
            segments: 4,
            temp_dir: None,
            auto_start: true,
            queue_poll_ms: 1000,
            enqueue_options: Vec::new(),
            http: HttpConfig::default(),
            file_server: FileServerConfig::default(),
        }
    }
}

impl HaulConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms.max(10))
    }

    /// Working directory for partial segments.
    pub fn segment_root(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("haul-segments"))
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("haul")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<HaulConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = HaulConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: HaulConfig = toml::from_str(&data)?;
    Ok(cfg)
}
