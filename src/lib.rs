pub mod api;
pub mod auth;
pub mod command;
pub mod deploy;
pub mod error;
pub mod logging;
pub mod notify;
pub mod policy;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::command::CommandExecutor;
use crate::deploy::Deployer;
use crate::error::DeployError;
use crate::logging::LogLevel;
use crate::notify::{Notification, NotificationLevel};

pub const DEFAULT_TRIGGER_FILENAME: &str = "docker-compose.yml";
pub const DEFAULT_RESTART_TIMEOUT_SECS: u64 = 300;

fn default_trigger_filename() -> String {
    DEFAULT_TRIGGER_FILENAME.to_string()
}

fn default_restart_timeout_secs() -> u64 {
    DEFAULT_RESTART_TIMEOUT_SECS
}

fn default_serialize_pulls() -> bool {
    true
}

fn default_pull_command() -> Vec<String> {
    ["git", "pull", "--rebase"].map(String::from).to_vec()
}

fn default_restart_command() -> Vec<String> {
    ["docker", "compose", "up", "-d", "--force-recreate"]
        .map(String::from)
        .to_vec()
}

/// Agent configuration, loaded once at startup and never reloaded.
#[derive(Deserialize, Clone)]
pub struct DeployConfig {
    pub webhook_secret: String,
    /// Route the webhook endpoint is served on, with or without a leading `/`.
    pub path: String,
    /// Directory holding one checkout per repository.
    pub local_path: PathBuf,
    #[serde(default)]
    pub folders_to_trigger_on: HashSet<String>,
    #[serde(default)]
    pub log_level: LogLevel,
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_trigger_filename")]
    pub trigger_filename: String,
    #[serde(default = "default_restart_timeout_secs")]
    pub restart_timeout_secs: u64,
    /// Unset means the pull runs unbounded, like the restart-only timeout
    /// model this agent has always had.
    pub pull_timeout_secs: Option<u64>,
    #[serde(default = "default_serialize_pulls")]
    pub serialize_pulls: bool,
    /// Log computed and received signatures at DEBUG.
    #[serde(default)]
    pub debug_signatures: bool,
    #[serde(default = "default_pull_command")]
    pub pull_command: Vec<String>,
    #[serde(default = "default_restart_command")]
    pub restart_command: Vec<String>,
    #[serde(default)]
    pub notification_level: NotificationLevel,
    #[serde(default, rename = "notification")]
    pub notifications: Vec<NotificationTarget>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationTarget {
    pub url: String,
}

// Hand-written so the secret never ends up in a log line.
impl fmt::Debug for DeployConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployConfig")
            .field("webhook_secret", &"<redacted>")
            .field("path", &self.path)
            .field("local_path", &self.local_path)
            .field("folders_to_trigger_on", &self.folders_to_trigger_on)
            .field("log_level", &self.log_level)
            .field("trigger_filename", &self.trigger_filename)
            .field("restart_timeout_secs", &self.restart_timeout_secs)
            .field("pull_timeout_secs", &self.pull_timeout_secs)
            .field("serialize_pulls", &self.serialize_pulls)
            .finish_non_exhaustive()
    }
}

impl DeployConfig {
    /// Parse and validate a TOML configuration document.
    pub fn from_toml_str(content: &str) -> Result<Self, DeployError> {
        let config: DeployConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the agent must never serve requests with.
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.webhook_secret.is_empty() {
            return Err(DeployError::ConfigError(
                "webhook_secret must not be empty".to_string(),
            ));
        }
        if self.path.trim_matches('/').is_empty() {
            return Err(DeployError::ConfigError("path must not be empty".to_string()));
        }
        if self.pull_command.is_empty() || self.restart_command.is_empty() {
            return Err(DeployError::ConfigError(
                "pull_command and restart_command must name a program".to_string(),
            ));
        }
        if self.folders_to_trigger_on.iter().any(|f| f.is_empty()) {
            return Err(DeployError::ConfigError(
                "folders_to_trigger_on must not contain an empty folder name".to_string(),
            ));
        }
        if self.trigger_filename.is_empty() {
            return Err(DeployError::ConfigError(
                "trigger_filename must not be empty".to_string(),
            ));
        }
        if self.restart_timeout_secs == 0 {
            return Err(DeployError::ConfigError(
                "restart_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Webhook route with exactly one leading slash.
    pub fn route_path(&self) -> String {
        format!("/{}", self.path.trim_start_matches('/'))
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Option<Duration> {
        self.pull_timeout_secs.map(Duration::from_secs)
    }

    /// Checkout of a repository: `{local_path}/{repository}`.
    pub fn repository_dir(&self, repository: &str) -> PathBuf {
        self.local_path.join(repository)
    }

    /// Directory of a unit inside a repository checkout.
    pub fn unit_dir(&self, repository: &str, unit: &str) -> PathBuf {
        self.repository_dir(repository).join(unit)
    }
}

/// Load and parse the configuration file
pub fn load_config(path: impl AsRef<Path>) -> Result<DeployConfig, DeployError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        DeployError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    DeployConfig::from_toml_str(&content).map_err(|e| {
        DeployError::ConfigError(format!(
            "Failed to load config file '{}': {}",
            path.display(),
            e
        ))
    })
}

pub struct AppState {
    pub config: Arc<DeployConfig>,
    pub deployer: Deployer,
    pub notifications: broadcast::Sender<Notification>,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Arc<DeployConfig>,
        executor: Arc<dyn CommandExecutor>,
        notifications: broadcast::Sender<Notification>,
    ) -> Self {
        Self {
            deployer: Deployer::new(Arc::clone(&config), executor),
            config,
            notifications,
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<AppState>;

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        webhook_secret = "s3cret"
        path = "/hooks/github"
        local_path = "/srv/repos"
        folders_to_trigger_on = ["svc1", "infra/proxy"]
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = DeployConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.trigger_filename, "docker-compose.yml");
        assert_eq!(config.restart_timeout(), Duration::from_secs(300));
        assert_eq!(config.pull_timeout(), None);
        assert!(config.serialize_pulls);
        assert!(!config.debug_signatures);
        assert_eq!(config.pull_command, vec!["git", "pull", "--rebase"]);
        assert_eq!(config.restart_command[..2], ["docker", "compose"]);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.notification_level, NotificationLevel::Success);
        assert!(config.notifications.is_empty());
        assert!(config.folders_to_trigger_on.contains("infra/proxy"));
    }

    #[test]
    fn route_path_has_single_leading_slash() {
        let mut config = DeployConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.route_path(), "/hooks/github");

        config.path = "webhook".to_string();
        assert_eq!(config.route_path(), "/webhook");
    }

    #[test]
    fn unit_dir_nests_under_repository() {
        let config = DeployConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(
            config.unit_dir("infra", "proxy/edge"),
            PathBuf::from("/srv/repos/infra/proxy/edge")
        );
    }

    #[test]
    fn notification_targets_are_parsed() {
        let content = format!(
            "{}\nnotification_level = \"failure\"\n[[notification]]\nurl = \"http://localhost:9000/notify\"\n",
            MINIMAL
        );
        let config = DeployConfig::from_toml_str(&content).unwrap();

        assert_eq!(config.notification_level, NotificationLevel::Failure);
        assert_eq!(config.notifications.len(), 1);
        assert_eq!(config.notifications[0].url, "http://localhost:9000/notify");
    }

    #[test]
    fn empty_secret_is_rejected() {
        let content = MINIMAL.replace("s3cret", "");
        let err = DeployConfig::from_toml_str(&content).unwrap_err();
        assert!(err.to_string().contains("webhook_secret"));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let err = DeployConfig::from_toml_str("path = \"webhook\"").unwrap_err();
        assert!(matches!(err, DeployError::TomlParseError(_)));
    }

    #[test]
    fn zero_restart_timeout_is_rejected() {
        let content = format!("{}\nrestart_timeout_secs = 0\n", MINIMAL);
        assert!(DeployConfig::from_toml_str(&content).is_err());
    }

    #[test]
    fn debug_output_redacts_secret() {
        let config = DeployConfig::from_toml_str(MINIMAL).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
