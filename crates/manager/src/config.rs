//! Configuration for managers, launchers and clients.
//!
//! Parsed from `config/datasource.toml`; every section and key is optional.
//! `DATASOURCE_<SECTION>_<KEY>` environment variables override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use datasource_bus::BusConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Config file used when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/datasource.toml";

/// Name of the job runner binary, looked up next to the running executable.
pub const LAUNCHER_BINARY_NAME: &str = "datasource-launcher";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DatasourceConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub manager: ManagerSection,

    #[serde(default)]
    pub launcher: LauncherSection,

    #[serde(default)]
    pub client: ClientSection,
}

/// `[manager]`: the command dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerSection {
    /// Address used in the command topic. Discovered from the network when unset.
    #[serde(default)]
    pub host_address: Option<String>,

    /// Job runner executable. Defaults to `datasource-launcher` beside the manager.
    #[serde(default)]
    pub launcher_binary: Option<PathBuf>,

    /// Upper bound on jobs running at once. Unbounded when unset.
    #[serde(default)]
    pub max_concurrent_jobs: Option<usize>,

    #[serde(default = "default_bus_retry_interval_ms")]
    pub bus_retry_interval_ms: u64,

    /// How long in-flight jobs get to respond after a shutdown signal.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Trailing stderr lines of a failed job copied into its response.
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
}

fn default_bus_retry_interval_ms() -> u64 {
    2000
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_stderr_tail_lines() -> usize {
    20
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            host_address: None,
            launcher_binary: None,
            max_concurrent_jobs: None,
            bus_retry_interval_ms: default_bus_retry_interval_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            stderr_tail_lines: default_stderr_tail_lines(),
        }
    }
}

impl ManagerSection {
    pub fn bus_retry_interval(&self) -> Duration {
        Duration::from_millis(self.bus_retry_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// The configured launcher, or `datasource-launcher` in the directory of
    /// the current executable.
    pub fn resolve_launcher_binary(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.launcher_binary {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe()?;
        let dir = exe.parent().ok_or_else(|| {
            ConfigError::Invalid(format!("executable {} has no parent directory", exe.display()))
        })?;
        Ok(dir.join(format!("{LAUNCHER_BINARY_NAME}{}", std::env::consts::EXE_SUFFIX)))
    }
}

/// `[launcher]`: the job runner process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LauncherSection {
    /// Pause after connecting and before exiting so progress is not lost
    /// to subscription propagation or an unflushed socket.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

fn default_settle_ms() -> u64 {
    300
}

fn default_publish_timeout_ms() -> u64 {
    1000
}

impl Default for LauncherSection {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

impl LauncherSection {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// `[client]`: command senders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    #[serde(default = "default_client_timeout_secs")]
    pub timeout_secs: u64,

    /// Pause between subscribing to the reply topics and publishing the command.
    #[serde(default = "default_subscribe_settle_ms")]
    pub subscribe_settle_ms: u64,
}

fn default_client_timeout_secs() -> u64 {
    15
}

fn default_subscribe_settle_ms() -> u64 {
    200
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_client_timeout_secs(),
            subscribe_settle_ms: default_subscribe_settle_ms(),
        }
    }
}

impl ClientSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn subscribe_settle(&self) -> Duration {
        Duration::from_millis(self.subscribe_settle_ms)
    }
}

impl DatasourceConfig {
    /// Parse and validate a TOML document. Environment overrides are not applied.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Load the effective configuration for a binary.
    ///
    /// An explicit `path` must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
    /// read if present and defaults are used otherwise. Environment overrides
    /// are applied last, then the result is validated again.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::from_file(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply `DATASOURCE_<SECTION>_<KEY>` overrides from an arbitrary source.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        self.bus.apply_overrides_from(&lookup);

        if let Some(v) = lookup("DATASOURCE_MANAGER_HOST_ADDRESS") {
            self.manager.host_address = Some(v);
        }
        if let Some(v) = lookup("DATASOURCE_MANAGER_LAUNCHER_BINARY") {
            self.manager.launcher_binary = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DATASOURCE_MANAGER_MAX_CONCURRENT_JOBS") {
            self.manager.max_concurrent_jobs = Some(parse_number("DATASOURCE_MANAGER_MAX_CONCURRENT_JOBS", &v)?);
        }
        override_number(&lookup, "DATASOURCE_MANAGER_BUS_RETRY_INTERVAL_MS", &mut self.manager.bus_retry_interval_ms)?;
        override_number(&lookup, "DATASOURCE_MANAGER_SHUTDOWN_TIMEOUT_SECS", &mut self.manager.shutdown_timeout_secs)?;
        override_number(&lookup, "DATASOURCE_MANAGER_STDERR_TAIL_LINES", &mut self.manager.stderr_tail_lines)?;
        override_number(&lookup, "DATASOURCE_LAUNCHER_SETTLE_MS", &mut self.launcher.settle_ms)?;
        override_number(&lookup, "DATASOURCE_LAUNCHER_PUBLISH_TIMEOUT_MS", &mut self.launcher.publish_timeout_ms)?;
        override_number(&lookup, "DATASOURCE_CLIENT_TIMEOUT_SECS", &mut self.client.timeout_secs)?;
        override_number(&lookup, "DATASOURCE_CLIENT_SUBSCRIBE_SETTLE_MS", &mut self.client.subscribe_settle_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;

        if let Some(host) = &self.manager.host_address {
            if host.trim().is_empty() || host.contains(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!(
                    "manager.host_address '{host}' is not a usable address"
                )));
            }
        }
        if self.manager.max_concurrent_jobs == Some(0) {
            return Err(ConfigError::Invalid(
                "manager.max_concurrent_jobs must be at least 1 (omit it for no limit)".into(),
            ));
        }
        for (key, value) in [
            ("manager.bus_retry_interval_ms", self.manager.bus_retry_interval_ms),
            ("launcher.publish_timeout_ms", self.launcher.publish_timeout_ms),
            ("client.timeout_secs", self.client.timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}: '{value}' is not a valid number")))
}

fn override_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(v) = lookup(key) {
        *target = parse_number(key, &v)?;
    }
    Ok(())
}
