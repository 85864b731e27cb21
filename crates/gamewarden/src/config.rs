//! Configuration file.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use gamewarden_core::FailurePolicy;
use gamewarden_rcon::{ClientConfig, SessionConfig};
use gamewarden_watcher::{LaunchError, OutputSink, ProcessSpec};
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub rcon: RconSection,
    pub watcher: WatcherSection,
    pub scheduler: SchedulerSection,
    pub supervisor: SupervisorSection,
}

/// `[rcon]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RconSection {
    pub enabled: bool,
    /// `host:port` of the BattlEye RCON endpoint.
    pub address: String,
    pub password: String,
    pub keep_alive_secs: u64,
    pub keep_alive_tolerance: u32,
    pub login_timeout_secs: u64,
    /// Defaults to the keep-alive interval.
    pub resend_after_secs: Option<u64>,
    pub max_resends: u32,
    pub reconnect_attempts: u32,
    pub reconnect_interval_secs: u64,
    /// Broadcast after every successful connect. Empty disables it.
    pub announce: String,
}

impl Default for RconSection {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:2306".to_string(),
            password: String::new(),
            keep_alive_secs: 10,
            keep_alive_tolerance: 4,
            login_timeout_secs: 5,
            resend_after_secs: None,
            max_resends: 3,
            reconnect_attempts: 5,
            reconnect_interval_secs: 10,
            announce: "gamewarden connected".to_string(),
        }
    }
}

impl RconSection {
    /// Client configuration for this section.
    #[must_use]
    pub fn client_config(&self, failure_policy: FailurePolicy) -> ClientConfig {
        let keep_alive = Duration::from_secs(self.keep_alive_secs);
        let mut config = ClientConfig::new(self.address.clone(), self.password.clone());
        config.session = SessionConfig {
            keep_alive_timer: keep_alive,
            keep_alive_tolerance: self.keep_alive_tolerance,
            login_timeout: Duration::from_secs(self.login_timeout_secs),
            resend_after: self.resend_after_secs.map_or(keep_alive, Duration::from_secs),
            max_resends: self.max_resends,
        };
        config.reconnect_attempts = self.reconnect_attempts;
        config.reconnect_interval = Duration::from_secs(self.reconnect_interval_secs);
        config.announce = (!self.announce.is_empty()).then(|| self.announce.clone());
        config.failure_policy = failure_policy;
        config
    }
}

/// `[watcher]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatcherSection {
    pub enabled: bool,
    /// Executable name or path.
    pub exec: String,
    /// Working directory. Defaults to the executable's directory.
    pub dir: Option<PathBuf>,
    /// Shell-quoted parameter line.
    pub params: String,
    pub auto_restart: bool,
    /// Mirror the server's output into the log.
    pub log_output: bool,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            enabled: false,
            exec: String::new(),
            dir: None,
            params: String::new(),
            auto_restart: true,
            log_output: true,
        }
    }
}

impl WatcherSection {
    /// Process specification for this section.
    ///
    /// # Errors
    /// Returns error if the parameter line cannot be split.
    pub fn process_spec(&self) -> Result<ProcessSpec, LaunchError> {
        let spec = ProcessSpec::new(self.exec.clone()).param_line(&self.params)?;
        Ok(match &self.dir {
            Some(dir) => spec.dir(dir.clone()),
            None => spec,
        })
    }

    /// Output sink for this section.
    #[must_use]
    pub fn sink(&self) -> OutputSink {
        if self.log_output {
            OutputSink::Log
        } else {
            OutputSink::Discard
        }
    }
}

/// `[scheduler]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
    pub enabled: bool,
    /// Schedule file, relative to the working directory.
    pub schedule: PathBuf,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule: PathBuf::from("schedule.json"),
        }
    }
}

/// `[supervisor]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSection {
    pub on_component_failure: FailurePolicy,
}

impl Config {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot start.
    ///
    /// # Errors
    /// Returns error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.rcon.enabled {
            if self.rcon.password.is_empty() {
                bail!("[rcon] is enabled but no password is set");
            }
            if self.rcon.keep_alive_secs == 0 {
                bail!("[rcon] keep_alive_secs must be positive");
            }
        }
        if self.watcher.enabled && self.watcher.exec.trim().is_empty() {
            bail!("[watcher] is enabled but no exec is set");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(!config.rcon.enabled);
        assert!(!config.watcher.enabled);
        assert!(!config.scheduler.enabled);
        assert_eq!(config.supervisor.on_component_failure, FailurePolicy::Shutdown);
        assert!(config.validate().is_ok());

        let client = config.rcon.client_config(FailurePolicy::Shutdown);
        assert_eq!(client.session.keep_alive_timer, Duration::from_secs(10));
        assert_eq!(client.session.resend_after, Duration::from_secs(10));
        assert_eq!(client.announce.as_deref(), Some("gamewarden connected"));
    }

    #[test]
    fn test_full_file() {
        let config: Config = toml::from_str(
            r#"
            [rcon]
            enabled = true
            address = "10.0.0.5:2306"
            password = "hunter2"
            keep_alive_secs = 15
            keep_alive_tolerance = 3
            resend_after_secs = 5
            reconnect_attempts = 8
            announce = ""

            [watcher]
            enabled = true
            exec = "/srv/arma3/arma3server_x64"
            params = '-port=2302 -config="server.cfg" -autoInit'
            auto_restart = false
            log_output = false

            [scheduler]
            enabled = true
            schedule = "/etc/gamewarden/schedule.json"

            [supervisor]
            on_component_failure = "disable"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());

        let client = config.rcon.client_config(config.supervisor.on_component_failure);
        assert_eq!(client.address, "10.0.0.5:2306");
        assert_eq!(client.session.keep_alive_tolerance, 3);
        assert_eq!(client.session.resend_after, Duration::from_secs(5));
        assert_eq!(client.reconnect_attempts, 8);
        assert_eq!(client.announce, None);
        assert_eq!(client.failure_policy, FailurePolicy::Disable);

        let spec = config.watcher.process_spec().unwrap();
        assert_eq!(spec.params, vec!["-port=2302", "-config=server.cfg", "-autoInit"]);
        assert_eq!(spec.dir, None);
        assert!(matches!(config.watcher.sink(), OutputSink::Discard));
        assert!(!config.watcher.auto_restart);
    }

    #[test]
    fn test_validation() {
        let config: Config = toml::from_str("[rcon]\nenabled = true\n").unwrap();
        tokio_test::assert_err!(config.validate());

        let config: Config = toml::from_str("[watcher]\nenabled = true\n").unwrap();
        tokio_test::assert_err!(config.validate());

        assert!(
            toml::from_str::<Config>("[supervisor]\non_component_failure = \"ignore\"\n").is_err()
        );
        assert!(toml::from_str::<Config>("[rcon]\nport = 2302\n").is_err());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("config.toml")).await.unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
