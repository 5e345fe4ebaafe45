//! Configuration loading and validation.
//!
//! Mirrors `root/app/models/config_models.py`'s `AppConfig` pydantic tree: a
//! raw, `#[serde(deny_unknown_fields)]` deserialization shape that is then
//! validated and defaulted into the typed [`Config`] the rest of the crate
//! consumes. Loaded once at startup; there is no hot-reload.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// `update_method` values selecting the FanFicFare-side update strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMethod {
    Update,
    UpdateAlways,
    Force,
    UpdateNoForce,
}

/// `metadata_preservation_mode` values selecting an update strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataMode {
    RemoveAdd,
    PreserveMetadata,
    AddFormat,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmailRaw {
    user: String,
    password: String,
    server: String,
    mailbox: String,
    #[serde(default = "default_sleep_time")]
    sleep_time: u64,
    #[serde(default)]
    disabled_sites: Vec<String>,
    /// Legacy boolean, rewritten to `disabled_sites = ["fanfiction"]`.
    #[serde(default)]
    ffnet_disable: Option<bool>,
}

fn default_sleep_time() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CalibreRaw {
    #[serde(default)]
    path: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    default_ini: Option<PathBuf>,
    #[serde(default)]
    personal_ini: Option<PathBuf>,
    #[serde(default = "default_update_method")]
    update_method: UpdateMethod,
    #[serde(default = "default_metadata_mode")]
    metadata_preservation_mode: MetadataMode,
}

fn default_update_method() -> UpdateMethod {
    UpdateMethod::Update
}
fn default_metadata_mode() -> MetadataMode {
    MetadataMode::RemoveAdd
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PushbulletRaw {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    device: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AppriseRaw {
    #[serde(default)]
    urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryRaw {
    #[serde(default = "default_true")]
    hail_mary_enabled: bool,
    #[serde(default = "default_hail_mary_wait_hours")]
    hail_mary_wait_hours: f64,
    #[serde(default = "default_max_normal_retries")]
    max_normal_retries: u32,
}

fn default_true() -> bool {
    true
}
fn default_hail_mary_wait_hours() -> f64 {
    12.0
}
fn default_max_normal_retries() -> u32 {
    11
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessRaw {
    #[serde(default = "default_shutdown_timeout")]
    shutdown_timeout: f64,
    #[serde(default = "default_health_check_interval")]
    health_check_interval: f64,
    #[serde(default = "default_true")]
    auto_restart: bool,
    #[serde(default = "default_max_restart_attempts")]
    max_restart_attempts: u32,
    #[serde(default = "default_restart_delay")]
    restart_delay: f64,
    #[serde(default = "default_true")]
    enable_monitoring: bool,
    #[serde(default)]
    worker_timeout: Option<f64>,
    #[serde(default = "default_signal_timeout")]
    signal_timeout: f64,
}

fn default_shutdown_timeout() -> f64 {
    30.0
}
fn default_health_check_interval() -> f64 {
    60.0
}
fn default_max_restart_attempts() -> u32 {
    3
}
fn default_restart_delay() -> f64 {
    5.0
}
fn default_signal_timeout() -> f64 {
    10.0
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigRaw {
    email: EmailRaw,
    calibre: CalibreRaw,
    #[serde(default)]
    pushbullet: PushbulletRaw,
    #[serde(default)]
    apprise: AppriseRaw,
    #[serde(default)]
    retry: Option<RetryRaw>,
    #[serde(default)]
    process: Option<ProcessRaw>,
    #[serde(default)]
    max_workers: Option<usize>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub user: String,
    pub password: String,
    pub server: String,
    pub mailbox: String,
    pub poll_seconds: u64,
    pub disabled_sites: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct LibraryConfig {
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub default_ini: Option<PathBuf>,
    pub personal_ini: Option<PathBuf>,
    pub update_method: UpdateMethod,
    pub metadata_mode: MetadataMode,
}

impl LibraryConfig {
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.path.starts_with("http://") || self.path.starts_with("https://")
    }
}

#[derive(Debug, Clone, Default)]
pub struct PushbulletConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub device: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AppriseConfig {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NotificationsConfig {
    pub pushbullet: PushbulletConfig,
    pub apprise: AppriseConfig,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub hail_mary_enabled: bool,
    pub hail_mary_wait_hours: f64,
    pub max_normal_retries: u32,
}

impl RetryConfig {
    #[must_use]
    pub fn hail_mary_wait_minutes(&self) -> f64 {
        self.hail_mary_wait_hours * 60.0
    }
}

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub shutdown_timeout_sec: f64,
    pub health_check_interval_sec: f64,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    pub restart_delay_sec: f64,
    pub enable_monitoring: bool,
    pub worker_timeout_sec: Option<f64>,
    pub signal_timeout_sec: f64,
}

/// Fully validated, immutable configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub email: EmailConfig,
    pub library: LibraryConfig,
    pub notifications: NotificationsConfig,
    pub retry: RetryConfig,
    pub process: ProcessConfig,
    pub max_workers: usize,
}

impl Config {
    /// Loads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Parses and validates configuration text (split out from [`Config::load`]
    /// so tests don't need real files on disk).
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let raw: ConfigRaw = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: ConfigRaw) -> Result<Self, ConfigError> {
        let mut disabled_sites: HashSet<String> = raw.email.disabled_sites.into_iter().collect();
        if let Some(true) = raw.email.ffnet_disable {
            tracing::info!("Migrating deprecated 'ffnet_disable' to 'disabled_sites'");
            disabled_sites.insert("fanfiction".to_string());
        }

        if raw.email.sleep_time < 1 {
            return Err(ConfigError::Validation(
                "email.sleep_time must be >= 1".into(),
            ));
        }

        let pushbullet = PushbulletConfig {
            enabled: raw.pushbullet.enabled,
            api_key: raw.pushbullet.api_key,
            device: raw.pushbullet.device,
        };
        if pushbullet.enabled && pushbullet.api_key.is_none() {
            return Err(ConfigError::Validation(
                "pushbullet.api_key is required when pushbullet.enabled = true".into(),
            ));
        }

        let apprise = AppriseConfig {
            urls: raw
                .apprise
                .urls
                .into_iter()
                .filter(|u| !u.is_empty())
                .collect(),
        };

        let retry_raw = raw.retry.unwrap_or(RetryRaw {
            hail_mary_enabled: true,
            hail_mary_wait_hours: default_hail_mary_wait_hours(),
            max_normal_retries: default_max_normal_retries(),
        });
        if !(0.1..=168.0).contains(&retry_raw.hail_mary_wait_hours) {
            return Err(ConfigError::Validation(
                "retry.hail_mary_wait_hours must be between 0.1 and 168".into(),
            ));
        }
        if !(1..=50).contains(&retry_raw.max_normal_retries) {
            return Err(ConfigError::Validation(
                "retry.max_normal_retries must be between 1 and 50".into(),
            ));
        }

        let process_raw = raw.process.unwrap_or(ProcessRaw {
            shutdown_timeout: default_shutdown_timeout(),
            health_check_interval: default_health_check_interval(),
            auto_restart: true,
            max_restart_attempts: default_max_restart_attempts(),
            restart_delay: default_restart_delay(),
            enable_monitoring: true,
            worker_timeout: None,
            signal_timeout: default_signal_timeout(),
        });
        if !(1.0..=300.0).contains(&process_raw.shutdown_timeout) {
            return Err(ConfigError::Validation(
                "process.shutdown_timeout must be between 1 and 300 seconds".into(),
            ));
        }
        if !(0.1..=600.0).contains(&process_raw.health_check_interval) {
            return Err(ConfigError::Validation(
                "process.health_check_interval must be between 0.1 and 600 seconds".into(),
            ));
        }
        if process_raw.max_restart_attempts > 10 {
            return Err(ConfigError::Validation(
                "process.max_restart_attempts must be between 0 and 10".into(),
            ));
        }
        if !(0.0..=60.0).contains(&process_raw.restart_delay) {
            return Err(ConfigError::Validation(
                "process.restart_delay must be between 0 and 60 seconds".into(),
            ));
        }
        if !(1.0..=60.0).contains(&process_raw.signal_timeout) {
            return Err(ConfigError::Validation(
                "process.signal_timeout must be between 1 and 60 seconds".into(),
            ));
        }
        if let Some(wt) = process_raw.worker_timeout {
            if wt < 30.0 {
                return Err(ConfigError::Validation(
                    "process.worker_timeout must be >= 30 seconds".into(),
                ));
            }
        }

        let max_workers = raw.max_workers.unwrap_or_else(num_cpus);
        if max_workers < 1 {
            return Err(ConfigError::Validation("max_workers must be >= 1".into()));
        }

        Ok(Config {
            email: EmailConfig {
                user: raw.email.user,
                password: raw.email.password,
                server: raw.email.server,
                mailbox: raw.email.mailbox,
                poll_seconds: raw.email.sleep_time,
                disabled_sites,
            },
            library: LibraryConfig {
                path: raw.calibre.path,
                username: raw.calibre.username,
                password: raw.calibre.password,
                default_ini: raw.calibre.default_ini,
                personal_ini: raw.calibre.personal_ini,
                update_method: raw.calibre.update_method,
                metadata_mode: raw.calibre.metadata_preservation_mode,
            },
            notifications: NotificationsConfig { pushbullet, apprise },
            retry: RetryConfig {
                hail_mary_enabled: retry_raw.hail_mary_enabled,
                hail_mary_wait_hours: retry_raw.hail_mary_wait_hours,
                max_normal_retries: retry_raw.max_normal_retries,
            },
            process: ProcessConfig {
                shutdown_timeout_sec: process_raw.shutdown_timeout,
                health_check_interval_sec: process_raw.health_check_interval,
                auto_restart: process_raw.auto_restart,
                max_restart_attempts: process_raw.max_restart_attempts,
                restart_delay_sec: process_raw.restart_delay,
                enable_monitoring: process_raw.enable_monitoring,
                worker_timeout_sec: process_raw.worker_timeout,
                signal_timeout_sec: process_raw.signal_timeout,
            },
            max_workers,
        })
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(1)
}
