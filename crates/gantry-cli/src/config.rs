//! Configuration – reads/writes `~/.gantry/config.toml`.
//!
//! Every field has a default, so a missing file (or a file that only sets a
//! few keys) is fine.  `GANTRY_*` environment variables override the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gantry_hal::MonitoringParams;
use gantry_middleware::SessionConfig;
use gantry_types::GantryError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Which upstream endpoint to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process simulated PLC.
    #[default]
    Sim,
    /// Real OPC UA server; needs the `opcua` cargo feature.
    Opcua,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Sim => write!(f, "sim"),
            TransportKind::Opcua => write!(f, "opcua"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = GantryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sim" => Ok(TransportKind::Sim),
            "opcua" => Ok(TransportKind::Opcua),
            other => Err(GantryError::Config(format!("unknown transport '{other}'"))),
        }
    }
}

/// Persisted configuration stored in `~/.gantry/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// OPC UA endpoint, e.g. `opc.tcp://192.168.0.10:4840`.
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,

    /// Port of the WebSocket + HTTP listener.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default)]
    pub points: PointsSection,

    #[serde(default)]
    pub session: SessionSection,

    #[serde(default)]
    pub monitoring: MonitoringSection,

    #[serde(default)]
    pub sim: SimSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointsSection {
    #[serde(default = "default_namespace")]
    pub namespace: u16,

    /// Per-point node id overrides, e.g. `I1 = "ns=3;s=\"Limit_Left\""`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// `0` retries forever.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSection {
    #[serde(default = "default_publishing_interval_ms")]
    pub publishing_interval_ms: u64,
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimSection {
    /// Time for a limit switch to settle after its actuator is written.
    #[serde(default = "default_travel_time_ms")]
    pub travel_time_ms: u64,
}

fn default_endpoint_url() -> String {
    "opc.tcp://localhost:4840".to_string()
}
fn default_api_port() -> u16 {
    gantry_cockpit::DEFAULT_PORT
}
fn default_namespace() -> u16 {
    3
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_session_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    3_000
}
fn default_retry_attempts() -> u32 {
    10
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_shutdown_timeout_ms() -> u64 {
    3_000
}
fn default_publishing_interval_ms() -> u64 {
    1_000
}
fn default_sampling_interval_ms() -> u64 {
    500
}
fn default_queue_size() -> usize {
    10
}
fn default_travel_time_ms() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_url: default_endpoint_url(),
            api_port: default_api_port(),
            transport: TransportKind::default(),
            points: PointsSection::default(),
            session: SessionSection::default(),
            monitoring: MonitoringSection::default(),
            sim: SimSection::default(),
        }
    }
}

impl Default for PointsSection {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            nodes: BTreeMap::new(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            publishing_interval_ms: default_publishing_interval_ms(),
            sampling_interval_ms: default_sampling_interval_ms(),
            queue_size: default_queue_size(),
        }
    }
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            travel_time_ms: default_travel_time_ms(),
        }
    }
}

impl SessionSection {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            session_timeout: Duration::from_millis(self.session_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            retry_attempts: self.retry_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }
}

impl MonitoringSection {
    /// Subscription parameters; the fields not exposed here keep their
    /// defaults.
    pub fn to_params(&self) -> MonitoringParams {
        MonitoringParams {
            publishing_interval: Duration::from_millis(self.publishing_interval_ms),
            sampling_interval: Duration::from_millis(self.sampling_interval_ms),
            queue_size: self.queue_size.max(1),
            ..MonitoringParams::default()
        }
    }
}

/// Return the config path: `$GANTRY_CONFIG` if set, else
/// `~/.gantry/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("GANTRY_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".gantry").join("config.toml")
}

/// Load the config from [`config_path`].  On first run the defaults are
/// written out so the operator has a file to edit; failing to write it is
/// only logged.  Environment overrides are applied either way.
pub fn load_or_init() -> Result<Config, GantryError> {
    let path = config_path();
    let mut cfg = match load_from(&path)? {
        Some(cfg) => {
            info!(path = %path.display(), "config loaded");
            cfg
        }
        None => {
            let cfg = Config::default();
            match save_to(&cfg, &path) {
                Ok(()) => info!(path = %path.display(), "wrote default config"),
                Err(e) => warn!(error = %e, "no config file; using defaults"),
            }
            cfg
        }
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, GantryError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        GantryError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| GantryError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `GANTRY_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `GANTRY_ENDPOINT` | `endpoint_url` |
/// | `GANTRY_API_PORT` | `api_port` |
/// | `GANTRY_TRANSPORT` | `transport` |
/// | `GANTRY_NAMESPACE` | `points.namespace` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("GANTRY_ENDPOINT") {
        cfg.endpoint_url = v;
    }
    if let Ok(v) = std::env::var("GANTRY_API_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.api_port = port;
    }
    if let Ok(v) = std::env::var("GANTRY_TRANSPORT")
        && let Ok(kind) = v.parse::<TransportKind>()
    {
        cfg.transport = kind;
    }
    if let Ok(v) = std::env::var("GANTRY_NAMESPACE")
        && let Ok(ns) = v.parse::<u16>()
    {
        cfg.points.namespace = ns;
    }
}

/// Save the config to a specific path, creating the parent directory.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), GantryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| GantryError::Config(format!("failed to create config directory: {e}")))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| GantryError::Serialization(format!("failed to serialize config: {e}")))?;
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| {
                GantryError::Config(format!("failed to write config at {}: {e}", path.display()))
            })?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| {
        GantryError::Config(format!("failed to write config at {}: {e}", path.display()))
    })?;
    Ok(())
}
