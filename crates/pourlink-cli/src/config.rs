//! Bridge configuration – reads `~/.pourlink/config.toml`.
//!
//! Every field has a default, so the bridge runs with no config file at all.
//! `POURLINK_CONFIG` points at an alternative file; a handful of
//! `POURLINK_*` environment variables override individual fields after the
//! file is parsed.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use pourlink_broker::BrokerConfig;
use pourlink_cockpit::SessionConfig;
use pourlink_processor::{PipelineConfig, TopicTable};
use pourlink_types::BridgeError;
use pourlink_validators::{ConcentrationLimits, RobotLimits, WeightLimits};
use serde::{Deserialize, Serialize};

/// Reconnect and ack tuning for the broker link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerTuning {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_reconnect_attempts() -> u32 {
    8
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_ack_timeout_ms() -> u64 {
    5_000
}

impl Default for BrokerTuning {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

/// Viewer session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTuning {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

fn default_heartbeat_secs() -> u64 {
    5
}
fn default_max_missed() -> u32 {
    3
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            max_missed: default_max_missed(),
        }
    }
}

/// Persisted bridge configuration stored in `~/.pourlink/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broker WebSocket URL.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// TCP port for the viewer WebSocket server.
    #[serde(default = "default_cockpit_port")]
    pub cockpit_port: u16,

    #[serde(default)]
    pub broker: BrokerTuning,

    #[serde(default)]
    pub session: SessionTuning,

    #[serde(default)]
    pub topics: TopicTable,

    #[serde(default)]
    pub weight: WeightLimits,

    #[serde(default)]
    pub concentration: ConcentrationLimits,

    #[serde(default)]
    pub robot: RobotLimits,
}

fn default_broker_url() -> String {
    "ws://localhost:9001".to_string()
}
fn default_cockpit_port() -> u16 {
    pourlink_cockpit::DEFAULT_PORT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            cockpit_port: default_cockpit_port(),
            broker: BrokerTuning::default(),
            session: SessionTuning::default(),
            topics: TopicTable::default(),
            weight: WeightLimits::default(),
            concentration: ConcentrationLimits::default(),
            robot: RobotLimits::default(),
        }
    }
}

impl Config {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            url: self.broker_url.clone(),
            initial_backoff: Duration::from_millis(self.broker.initial_backoff_ms),
            backoff_multiplier: self.broker.backoff_multiplier,
            max_reconnect_attempts: self.broker.max_reconnect_attempts,
            connect_timeout: Duration::from_millis(self.broker.connect_timeout_ms),
            ack_timeout: Duration::from_millis(self.broker.ack_timeout_ms),
            ..BrokerConfig::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            weight: self.weight.clone(),
            concentration: self.concentration.clone(),
            topics: self.topics.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(self.session.heartbeat_secs),
            max_missed: self.session.max_missed,
        }
    }
}

/// Return the config path: `POURLINK_CONFIG` when set, otherwise
/// `~/.pourlink/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(explicit) = std::env::var("POURLINK_CONFIG") {
        return PathBuf::from(explicit);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
/// Extracted for testability without mutating environment variables.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".pourlink").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, BridgeError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| BridgeError::Config(format!("failed to parse config: {e}")))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `POURLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `POURLINK_BROKER_URL` | `broker_url` |
/// | `POURLINK_COCKPIT_PORT` | `cockpit_port` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("POURLINK_BROKER_URL") {
        cfg.broker_url = v;
    }
    if let Ok(v) = std::env::var("POURLINK_COCKPIT_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.cockpit_port = port;
    }
}

/// Save the config to disk, creating `~/.pourlink/` if necessary.
pub fn save(cfg: &Config) -> Result<(), BridgeError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BridgeError::Config(format!("failed to create config directory: {e}")))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BridgeError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| {
        BridgeError::Config(format!("failed to write config at {}: {e}", path.display()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.broker_url, "ws://localhost:9001");
        assert_eq!(loaded.cockpit_port, 9091);
        assert_eq!(loaded.broker.max_reconnect_attempts, 8);
        assert_eq!(loaded.session.max_missed, 3);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn config_path_points_to_pourlink_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".pourlink"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "broker_url = \"ws://broker.local:1883\"\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.broker_url, "ws://broker.local:1883");
        assert_eq!(loaded.cockpit_port, 9091);
        assert!((loaded.concentration.tolerance - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn apply_env_overrides_changes_broker_url() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("POURLINK_BROKER_URL", "ws://cell-broker:9001") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.broker_url, "ws://cell-broker:9001");
        unsafe { std::env::remove_var("POURLINK_BROKER_URL") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_port() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("POURLINK_COCKPIT_PORT", "not-a-port") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.cockpit_port, 9091);
        unsafe { std::env::remove_var("POURLINK_COCKPIT_PORT") };
    }

    #[test]
    fn broker_config_converts_durations() {
        let mut cfg = Config::default();
        cfg.broker.initial_backoff_ms = 250;
        cfg.broker.ack_timeout_ms = 1_000;
        let broker = cfg.broker_config();
        assert_eq!(broker.initial_backoff, Duration::from_millis(250));
        assert_eq!(broker.connect_timeout, Duration::from_secs(10));
        assert_eq!(broker.ack_timeout, Duration::from_secs(1));
        assert_eq!(broker.url, cfg.broker_url);
    }

    #[test]
    fn weight_calibration_survives_roundtrip() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.weight.calibration_kg = -0.35;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert!((loaded.weight.calibration_kg - (-0.35)).abs() < f64::EPSILON);
    }

    #[test]
    fn topics_table_is_overridable() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            "[topics]\nconcentration = \"mix/target\"\nraw_weight_aliases = []\n",
        )
        .unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.topics.concentration, "mix/target");
        assert!(loaded.topics.raw_weight_aliases.is_empty());
        assert_eq!(loaded.topics.scenario, "robot/event");
    }

    #[test]
    fn robot_limits_survive_roundtrip() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.robot.speed_max = 80.0;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert!((loaded.robot.speed_max - 80.0).abs() < f64::EPSILON);
        // Joint 3's reduced range is part of the defaults.
        assert!((loaded.robot.joint_limits[2].max_deg - 158.0).abs() < f64::EPSILON);
    }
}
