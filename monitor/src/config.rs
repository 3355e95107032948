//! Layered configuration for the monitor.
//!
//! Precedence, later layers win:
//! 1. Built-in defaults (the daemon's well-known locations under `~/.codex`)
//! 2. TOML file (`~/.codex/es-guard/monitor.toml`, or an explicit path)
//! 3. Environment overrides (`ESGUARD_*`)
//!
//! ```no_run
//! use esguard_monitor::config::ConfigLoader;
//!
//! let config = ConfigLoader::new().load().expect("config");
//! println!("policy at {}", config.paths.policy.display());
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::tailer::TailOptions;
use crate::watcher::WatchOptions;

/// Default auto-revoke delay for temporary overrides.
pub const DEFAULT_AUTO_REVOKE_MINUTES: i64 = 3;

/// Name of the daemon process checked by `pgrep -x`.
pub const DEFAULT_DAEMON_PROCESS: &str = "codex-es-guard";

const DEFAULT_ENV_PREFIX: &str = "ESGUARD";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine the home directory")]
    NoHomeDir,

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for ${var}: '{value}' (expected: {expected})")]
    InvalidEnvValue {
        var: String,
        value: String,
        expected: String,
    },
}

/// Files observed (and, for the policy and state, written) by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorPaths {
    pub policy: PathBuf,
    pub denials: PathBuf,
    pub last_denial: PathBuf,
    pub log: PathBuf,
    /// Monitor-owned state (acknowledged record).
    pub state: PathBuf,
}

impl MonitorPaths {
    pub fn for_home(home: &Path) -> Self {
        let codex = home.join(".codex");
        let guard = codex.join("es-guard");
        Self {
            policy: codex.join("es_policy.json"),
            denials: guard.join("denials.jsonl"),
            last_denial: guard.join("last_denial.txt"),
            log: PathBuf::from("/tmp/codex-es-guard.log"),
            state: guard.join("monitor-state.json"),
        }
    }

    /// Every file directly inside `dir`, for sandboxes and tests.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            policy: dir.join("es_policy.json"),
            denials: dir.join("denials.jsonl"),
            last_denial: dir.join("last_denial.txt"),
            log: dir.join("codex-es-guard.log"),
            state: dir.join("monitor-state.json"),
        }
    }
}

/// How the daemon is inspected and controlled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    pub process_name: String,
    /// Program and arguments that restart the daemon.
    pub restart_command: Vec<String>,
    /// Privileged helper invoked as `<helper> <path>` to apply an override.
    /// When unset the engine writes the policy document itself.
    pub override_helper: Option<PathBuf>,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            process_name: DEFAULT_DAEMON_PROCESS.to_string(),
            restart_command: ["launchctl", "kickstart", "-k", "system/dev.codex-es-guard"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            override_helper: None,
        }
    }
}

/// Fully resolved monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub paths: MonitorPaths,
    /// `None` keeps overrides until removed by hand.
    pub auto_revoke: Option<Duration>,
    pub watch: WatchOptions,
    pub tail: TailOptions,
    /// How long an outcome message stays in the snapshot.
    pub outcome_ttl: Duration,
    /// Wait between a restart command and the running-state re-check.
    pub restart_settle: Duration,
    pub daemon: DaemonSettings,
}

impl MonitorConfig {
    pub fn with_paths(paths: MonitorPaths) -> Self {
        Self {
            paths,
            auto_revoke: auto_revoke_from_minutes(DEFAULT_AUTO_REVOKE_MINUTES),
            watch: WatchOptions::default(),
            tail: TailOptions::default(),
            outcome_ttl: Duration::from_secs(4),
            restart_settle: Duration::from_secs(1),
            daemon: DaemonSettings::default(),
        }
    }
}

/// Zero or negative minutes disable auto-revoke. Very large values saturate.
pub fn auto_revoke_from_minutes(minutes: i64) -> Option<Duration> {
    u64::try_from(minutes)
        .ok()
        .filter(|m| *m > 0)
        .map(|m| Duration::from_secs(m.saturating_mul(60)))
}

/// On-disk representation; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    policy_path: Option<PathBuf>,
    denials_path: Option<PathBuf>,
    last_denial_path: Option<PathBuf>,
    log_path: Option<PathBuf>,
    state_path: Option<PathBuf>,
    auto_revoke_minutes: Option<i64>,
    rearm_delay_ms: Option<u64>,
    rearm_max_delay_ms: Option<u64>,
    tail_poll_interval_ms: Option<u64>,
    outcome_ttl_ms: Option<u64>,
    restart_settle_ms: Option<u64>,
    daemon_process_name: Option<String>,
    restart_command: Option<Vec<String>>,
    override_helper: Option<PathBuf>,
}

/// Builder for layered configuration loading.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    home: Option<PathBuf>,
    file: Option<PathBuf>,
    env_prefix: Option<String>,
    env: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `home` instead of the current user's home directory.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    /// Load this file instead of the default one; it must exist.
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Read overrides from `vars` instead of the process environment.
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn load(self) -> Result<MonitorConfig, ConfigError> {
        let home = match &self.home {
            Some(home) => home.clone(),
            None => dirs::home_dir().ok_or(ConfigError::NoHomeDir)?,
        };

        let mut config = MonitorConfig::with_paths(MonitorPaths::for_home(&home));

        let (file, required) = match &self.file {
            Some(file) => (file.clone(), true),
            None => (home.join(".codex").join("es-guard").join("monitor.toml"), false),
        };
        if let Some(toml) = read_config_file(&file, required)? {
            apply_file(&mut config, toml, &home);
        }

        self.apply_env(&mut config)?;
        Ok(config)
    }

    fn env_var(&self, key: &str) -> Option<String> {
        let prefix = self.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
        let name = format!("{prefix}_{key}");
        match &self.env {
            Some(vars) => vars.get(&name).cloned(),
            None => std::env::var(&name).ok(),
        }
    }

    fn apply_env(&self, config: &mut MonitorConfig) -> Result<(), ConfigError> {
        let paths = &mut config.paths;
        for (key, slot) in [
            ("POLICY_PATH", &mut paths.policy),
            ("DENIALS_PATH", &mut paths.denials),
            ("LAST_DENIAL_PATH", &mut paths.last_denial),
            ("LOG_PATH", &mut paths.log),
            ("STATE_PATH", &mut paths.state),
        ] {
            if let Some(value) = self.env_var(key) {
                *slot = PathBuf::from(value);
            }
        }

        if let Some(value) = self.env_var("AUTO_REVOKE_MINUTES") {
            let minutes = value
                .trim()
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidEnvValue {
                    var: format!(
                        "{}_AUTO_REVOKE_MINUTES",
                        self.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX)
                    ),
                    value: value.clone(),
                    expected: "integer minutes".to_string(),
                })?;
            config.auto_revoke = auto_revoke_from_minutes(minutes);
        }

        if let Some(value) = self.env_var("OVERRIDE_HELPER") {
            config.daemon.override_helper = (!value.trim().is_empty()).then(|| PathBuf::from(value));
        }

        Ok(())
    }
}

fn read_config_file(path: &Path, required: bool) -> Result<Option<ConfigToml>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let parsed = toml::from_str(&content).map_err(|source| ConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(Some(parsed))
}

fn apply_file(config: &mut MonitorConfig, toml: ConfigToml, home: &Path) {
    let expand = |p: PathBuf| expand_home(&p, home);

    if let Some(p) = toml.policy_path {
        config.paths.policy = expand(p);
    }
    if let Some(p) = toml.denials_path {
        config.paths.denials = expand(p);
    }
    if let Some(p) = toml.last_denial_path {
        config.paths.last_denial = expand(p);
    }
    if let Some(p) = toml.log_path {
        config.paths.log = expand(p);
    }
    if let Some(p) = toml.state_path {
        config.paths.state = expand(p);
    }
    if let Some(minutes) = toml.auto_revoke_minutes {
        config.auto_revoke = auto_revoke_from_minutes(minutes);
    }
    if let Some(ms) = toml.rearm_delay_ms {
        config.watch.rearm_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.rearm_max_delay_ms {
        config.watch.rearm_max_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.tail_poll_interval_ms {
        config.tail.poll_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.outcome_ttl_ms {
        config.outcome_ttl = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.restart_settle_ms {
        config.restart_settle = Duration::from_millis(ms);
    }
    if let Some(name) = toml.daemon_process_name {
        config.daemon.process_name = name;
    }
    if let Some(command) = toml.restart_command {
        config.daemon.restart_command = command;
    }
    if let Some(helper) = toml.override_helper {
        config.daemon.override_helper = Some(expand(helper));
    }
}

/// Expand a leading `~` to `home`.
fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}
