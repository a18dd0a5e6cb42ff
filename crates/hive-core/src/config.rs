//! Configuration system for Hive.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $HIVE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/hive/config.toml
//!   3. ~/.config/hive/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    pub network: NetworkConfig,
    pub identity: IdentityConfig,
    pub sessions: SessionConfig,
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub registrar: RegistrarConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// WebSocket listener for nodes.
    pub gateway_addr: String,
    /// HTTP control API listener.
    pub api_addr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex-encoded 32-byte secret for node identity tokens.
    /// Empty = random per run (nodes get new identities after a restart).
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval nodes are told to heartbeat at, and the idle time after
    /// which the gateway pings.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age after which a session is marked DISCONNECTED.
    pub stale_after_secs: u64,
    /// How long a DISCONNECTED session waits for a reconnect before it is
    /// RETIRED and deregistered. Unset = never retire automatically.
    pub retire_after_secs: Option<u64>,
    /// Time allowed between accepting a connection and its `hello`.
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Max live (non-terminal) tasks. Submissions beyond this fail with QueueFull.
    pub capacity: usize,
    /// Terminal tasks kept for status queries before the oldest are pruned.
    pub retained_terminal: usize,
    /// `max_attempts` for submissions that do not specify one.
    pub default_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Period of the matching cycle when no event triggers it earlier.
    pub interval_ms: u64,
    /// ASSIGNED/RUNNING tasks with no node activity for this long are abandoned.
    pub task_timeout_secs: u64,
    /// Period of the stale-session / timeout / retirement sweep.
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Attempts per backend before a registration is given up on.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Period at which nodes stuck in REGISTERING are retried.
    pub resync_interval_secs: u64,
    /// Per-request timeout for backend calls.
    pub request_timeout_secs: u64,
    pub kubernetes: Option<KubernetesSettings>,
    pub slurm: Option<SlurmSettings>,
}

/// Container-orchestrator control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesSettings {
    /// API server base URL, e.g. "https://10.0.0.1:6443".
    pub api_url: String,
    /// Bearer token for the service account. Empty = no auth header.
    pub token: String,
    /// Pods each node object advertises.
    pub max_pods: u32,
}

/// Batch scheduler control endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmSettings {
    /// Control endpoint base URL, e.g. "http://slurm-ctl:6820/hive".
    pub control_url: String,
    /// Hex-encoded 32-byte shared credential used to sign requests.
    pub shared_key: String,
    /// Partition new nodes are added to.
    pub partition: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            gateway_addr: "0.0.0.0:8765".to_string(),
            api_addr: "127.0.0.1:8766".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            stale_after_secs: 45,
            retire_after_secs: None,
            handshake_timeout_secs: 10,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            retained_terminal: 1_000,
            default_max_attempts: 3,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            task_timeout_secs: 300,
            sweep_interval_ms: 1_000,
        }
    }
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            resync_interval_secs: 60,
            request_timeout_secs: 10,
            kubernetes: None,
            slurm: None,
        }
    }
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            api_url: "https://127.0.0.1:6443".to_string(),
            token: String::new(),
            max_pods: 10,
        }
    }
}

impl Default for SlurmSettings {
    fn default() -> Self {
        Self {
            control_url: "http://127.0.0.1:6820/hive".to_string(),
            shared_key: String::new(),
            partition: "edge".to_string(),
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn retire_after(&self) -> Option<Duration> {
        self.retire_after_secs.map(Duration::from_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl DispatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl RegistrarConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("hive")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl HiveConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path(), |key| std::env::var(key).ok())
    }

    /// Defaults when `path` is absent; a file that exists must parse and
    /// validate.
    pub fn load_from(
        path: &std::path::Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            HiveConfig::default()
        };
        config.apply_env_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("HIVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&HiveConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply HIVE_* overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("HIVE_NETWORK__GATEWAY_ADDR") {
            self.network.gateway_addr = v;
        }
        if let Some(v) = lookup("HIVE_NETWORK__API_ADDR") {
            self.network.api_addr = v;
        }
        if let Some(v) = lookup("HIVE_IDENTITY__SECRET") {
            self.identity.secret = v;
        }
        if let Some(v) = lookup("HIVE_SESSIONS__HEARTBEAT_INTERVAL_SECS") {
            self.sessions.heartbeat_interval_secs = parse("sessions.heartbeat_interval_secs", &v)?;
        }
        if let Some(v) = lookup("HIVE_SESSIONS__STALE_AFTER_SECS") {
            self.sessions.stale_after_secs = parse("sessions.stale_after_secs", &v)?;
        }
        if let Some(v) = lookup("HIVE_SESSIONS__RETIRE_AFTER_SECS") {
            self.sessions.retire_after_secs = Some(parse("sessions.retire_after_secs", &v)?);
        }
        if let Some(v) = lookup("HIVE_QUEUE__CAPACITY") {
            self.queue.capacity = parse("queue.capacity", &v)?;
        }
        if let Some(v) = lookup("HIVE_DISPATCH__TASK_TIMEOUT_SECS") {
            self.dispatch.task_timeout_secs = parse("dispatch.task_timeout_secs", &v)?;
        }
        if let Some(v) = lookup("HIVE_REGISTRAR__KUBERNETES_URL") {
            self.registrar.kubernetes.get_or_insert_with(Default::default).api_url = v;
        }
        if let Some(v) = lookup("HIVE_REGISTRAR__KUBERNETES_TOKEN") {
            self.registrar.kubernetes.get_or_insert_with(Default::default).token = v;
        }
        if let Some(v) = lookup("HIVE_REGISTRAR__SLURM_URL") {
            self.registrar.slurm.get_or_insert_with(Default::default).control_url = v;
        }
        if let Some(v) = lookup("HIVE_REGISTRAR__SLURM_KEY") {
            self.registrar.slurm.get_or_insert_with(Default::default).shared_key = v;
        }
        Ok(())
    }

    /// Reject combinations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::InvalidValue("queue.capacity", "must be > 0".into()));
        }
        if self.queue.default_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "queue.default_max_attempts",
                "must be > 0".into(),
            ));
        }
        if self.sessions.stale_after_secs < self.sessions.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue(
                "sessions.stale_after_secs",
                "must be at least heartbeat_interval_secs".into(),
            ));
        }
        if self.registrar.max_attempts == 0 {
            return Err(ConfigError::InvalidValue("registrar.max_attempts", "must be > 0".into()));
        }
        if let Some(slurm) = &self.registrar.slurm {
            if hex::decode(&slurm.shared_key).map(|b| b.len()) != Ok(32) {
                return Err(ConfigError::InvalidValue(
                    "registrar.slurm.shared_key",
                    "must be 64 hex characters".into(),
                ));
            }
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key, value.to_string()))
}
