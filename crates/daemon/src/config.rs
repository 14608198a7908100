// Daemon configuration at `~/.berth/config.toml`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::startup::restrict_permissions;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BerthConfig {
    pub runtime: RuntimeConfig,
    pub stream: StreamConfig,
    pub guardian: GuardianConfig,
    pub daemon: DaemonConfig,
}

impl BerthConfig {
    /// A malformed file is an error so typos don't silently fall back.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
            restrict_permissions(parent, 0o700).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)?;
        restrict_permissions(path, 0o600).map_err(ConfigError::Io)
    }
}

/// How to launch one agent runtime process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Executable to launch.
    pub command: String,
    /// Arguments; `{port}`, `{workspace}` and `{session_id}` are substituted.
    pub args: Vec<String>,
    /// Extra environment for the child.
    pub env: BTreeMap<String, String>,
    /// Readiness endpoint polled after spawn.
    pub health_path: String,
    pub startup_timeout_ms: u64,
    pub probe_interval_ms: u64,
    /// Delay between the last claim going away and teardown.
    pub idle_grace_ms: u64,
    /// Time allowed after TERM before KILL.
    pub terminate_grace_ms: u64,
    pub port_range_start: u16,
    pub port_range_len: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: "agent-runtime".into(),
            args: vec![
                "serve".into(),
                "--port".into(),
                "{port}".into(),
                "--workspace".into(),
                "{workspace}".into(),
            ],
            env: BTreeMap::new(),
            health_path: "/health".into(),
            startup_timeout_ms: 15_000,
            probe_interval_ms: 100,
            idle_grace_ms: 5_000,
            terminate_grace_ms: 3_000,
            port_range_start: 31_415,
            port_range_len: 512,
        }
    }
}

impl RuntimeConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Reconnect policy for per-consumer event streams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed reconnects before the consumer sees `disconnected`.
    pub max_attempts: u32,
    /// Per-consumer channel capacity.
    pub buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { base_delay_ms: 250, max_delay_ms: 10_000, max_attempts: 8, buffer: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardianConfig {
    /// Upper bound on how long a guardian keeps a finished-tab session alive.
    pub max_hold_secs: u64,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self { max_hold_secs: 900 }
    }
}

impl GuardianConfig {
    pub fn max_hold(&self) -> Duration {
        Duration::from_secs(self.max_hold_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Loopback HTTP/SSE listener port; 0 disables it.
    pub http_port: u16,
    /// Interval between process health sweeps.
    pub health_sweep_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { http_port: 0, health_sweep_secs: 30 }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[source] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[source] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[source] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BerthConfig::default();
        assert_eq!(cfg.runtime.health_path, "/health");
        assert_eq!(cfg.runtime.startup_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.runtime.idle_grace(), Duration::from_secs(5));
        assert_eq!(cfg.runtime.terminate_grace(), Duration::from_secs(3));
        assert_eq!(cfg.runtime.port_range_start, 31_415);
        assert_eq!(cfg.stream.max_attempts, 8);
        assert_eq!(cfg.guardian.max_hold(), Duration::from_secs(900));
        assert_eq!(cfg.daemon.http_port, 0);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
[runtime]
command = "/usr/local/bin/agentd"
idle_grace_ms = 250

[stream]
max_attempts = 3
"#;
        let cfg: BerthConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.runtime.command, "/usr/local/bin/agentd");
        assert_eq!(cfg.runtime.idle_grace_ms, 250);
        assert_eq!(cfg.runtime.terminate_grace_ms, 3_000); // default
        assert_eq!(cfg.stream.max_attempts, 3);
        assert_eq!(cfg.stream.base_delay_ms, 250); // default
        assert_eq!(cfg.daemon, DaemonConfig::default());
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let cfg: BerthConfig = toml::from_str("[telemetry]\nenabled = true\n").unwrap();
        assert_eq!(cfg, BerthConfig::default());
    }

    #[test]
    fn runtime_env_table_parses() {
        let toml_str = r#"
[runtime.env]
AGENT_LOG = "debug"
"#;
        let cfg: BerthConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.runtime.env.get("AGENT_LOG").map(String::as_str), Some("debug"));
    }

    #[test]
    fn roundtrip_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = BerthConfig::default();
        cfg.daemon.http_port = 8787;
        cfg.runtime.args = vec!["--port={port}".into()];
        cfg.save_to(&path).unwrap();

        let loaded = BerthConfig::load_from(&path).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[runtime\ncommand = ").unwrap();
        assert!(matches!(BerthConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn probe_interval_is_never_zero() {
        let cfg = RuntimeConfig { probe_interval_ms: 0, ..RuntimeConfig::default() };
        assert_eq!(cfg.probe_interval(), Duration::from_millis(1));
    }
}
