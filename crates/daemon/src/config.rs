use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use image_archiver_providers::{drive, slack, DriveConfig, SlackConfig};
use serde::Deserialize;
use thiserror::Error;

use crate::scheduler::DEFAULT_CRON;
use crate::transfer::RetryPolicy;
use crate::walker::DEFAULT_PAGE_SIZE;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub slack: SlackSection,
    pub drive: DriveSection,
    pub schedule: ScheduleConfig,
    pub archive: ArchiveConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub root: Option<String>,
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SlackSection {
    pub token: Option<String>,
    pub channel_id: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DriveSection {
    pub access_token: Option<String>,
    pub folder_id: Option<String>,
    pub upload_base: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub cron: Option<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ArchiveConfig {
    pub page_size: Option<u32>,
    pub retry_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub http_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub api_token: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

/// Fully resolved settings: file values overlaid with environment variables and defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: String,
    pub root: PathBuf,
    pub database_url: Option<String>,
    pub api_token: Option<String>,
    pub cron: Option<String>,
    pub page_size: u32,
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
    pub slack_token: Option<String>,
    pub slack_api_base: String,
    pub channel_id: Option<String>,
    pub drive_access_token: Option<String>,
    pub drive_upload_base: String,
    pub folder_id: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}

impl Settings {
    /// `env` looks up an environment variable; callers pass `std::env::var(..).ok()`.
    pub fn resolve(cfg: &Config, env: impl Fn(&str) -> Option<String>) -> Self {
        let pick = |var: &str, file: &Option<String>| env(var).or_else(|| file.clone());
        let retry = RetryPolicy::new(
            cfg.archive.retry_attempts.unwrap_or(3),
            Duration::from_millis(cfg.archive.retry_base_delay_ms.unwrap_or(1000)),
        );

        Self {
            listen: pick("IMAGE_ARCHIVER_LISTEN", &cfg.server.listen)
                .unwrap_or_else(|| "127.0.0.1:8088".to_owned()),
            root: PathBuf::from(
                pick("IMAGE_ARCHIVER_ROOT", &cfg.storage.root)
                    .unwrap_or_else(|| "./data".to_owned()),
            ),
            database_url: pick("DATABASE_URL", &cfg.storage.database_url),
            api_token: pick("IMAGE_ARCHIVER_API_TOKEN", &cfg.security.api_token),
            cron: cfg.schedule.enabled.then(|| {
                pick("IMAGE_ARCHIVER_CRON", &cfg.schedule.cron)
                    .unwrap_or_else(|| DEFAULT_CRON.to_owned())
            }),
            page_size: cfg.archive.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            retry,
            http_timeout: Duration::from_secs(cfg.archive.http_timeout_secs.unwrap_or(120)),
            slack_token: pick("SLACK_TOKEN", &cfg.slack.token),
            slack_api_base: pick("SLACK_API_BASE", &cfg.slack.api_base)
                .unwrap_or_else(|| slack::DEFAULT_API_BASE.to_owned()),
            channel_id: pick("SLACK_CHANNEL_ID", &cfg.slack.channel_id),
            drive_access_token: pick("DRIVE_ACCESS_TOKEN", &cfg.drive.access_token),
            drive_upload_base: pick("DRIVE_UPLOAD_BASE", &cfg.drive.upload_base)
                .unwrap_or_else(|| drive::DEFAULT_UPLOAD_BASE.to_owned()),
            folder_id: pick("DRIVE_FOLDER_ID", &cfg.drive.folder_id),
        }
    }

    pub fn slack_config(&self) -> Result<SlackConfig, ConfigError> {
        Ok(SlackConfig {
            token: required(&self.slack_token, "slack.token")?,
            api_base: self.slack_api_base.clone(),
            timeout: self.http_timeout,
        })
    }

    pub fn drive_config(&self) -> Result<DriveConfig, ConfigError> {
        Ok(DriveConfig {
            access_token: required(&self.drive_access_token, "drive.access_token")?,
            upload_base: self.drive_upload_base.clone(),
            timeout: self.http_timeout,
        })
    }

    pub fn channel_id(&self) -> Result<String, ConfigError> {
        required(&self.channel_id, "slack.channel_id")
    }

    pub fn folder_id(&self) -> Result<String, ConfigError> {
        required(&self.folder_id, "drive.folder_id")
    }
}

fn required(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
    value
        .as_ref()
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .ok_or(ConfigError::Missing(name))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn empty_config_uses_defaults() {
        let settings = Settings::resolve(&Config::default(), no_env);
        assert_eq!(settings.listen, "127.0.0.1:8088");
        assert_eq!(settings.root, PathBuf::from("./data"));
        assert_eq!(settings.page_size, 200);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.cron.as_deref(), Some(DEFAULT_CRON));
        assert!(settings.database_url.is_none());
        assert_eq!(settings.slack_config().unwrap_err(), ConfigError::Missing("slack.token"));
        assert_eq!(settings.folder_id().unwrap_err(), ConfigError::Missing("drive.folder_id"));
    }

    #[test]
    fn parses_toml_and_env_overrides() {
        let cfg: Config = toml::from_str(
            r#"
            [slack]
            token = "xoxb-file"
            channel_id = "C1"

            [drive]
            access_token = "ya29"
            folder_id = "folder-1"

            [schedule]
            cron = "0 */5 * * * *"

            [archive]
            retry_base_delay_ms = 10
            "#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [("SLACK_TOKEN", "xoxb-env"), ("DATABASE_URL", "postgres://db")]
            .into_iter()
            .collect();
        let settings = Settings::resolve(&cfg, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.slack_config().unwrap().token, "xoxb-env");
        assert_eq!(settings.channel_id().unwrap(), "C1");
        assert_eq!(settings.drive_config().unwrap().access_token, "ya29");
        assert_eq!(settings.database_url.as_deref(), Some("postgres://db"));
        assert_eq!(settings.cron.as_deref(), Some("0 */5 * * * *"));
        assert_eq!(settings.retry.base_delay, Duration::from_millis(10));
    }

    #[test]
    fn disabled_schedule_has_no_cron() {
        let cfg: Config = toml::from_str("[schedule]\nenabled = false\n").unwrap();
        assert!(Settings::resolve(&cfg, no_env).cron.is_none());
    }

    #[test]
    fn blank_values_count_as_missing() {
        let cfg: Config = toml::from_str("[slack]\nchannel_id = \"  \"\n").unwrap();
        let settings = Settings::resolve(&cfg, no_env);
        assert_eq!(settings.channel_id().unwrap_err(), ConfigError::Missing("slack.channel_id"));
    }
}
