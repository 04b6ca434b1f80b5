use anyhow::{Context, Result, anyhow};
use chrono::NaiveTime;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use crate::{dispatcher::ResendPolicy, provider::ProviderId, scheduler::Schedule};

/// Configuration for a single weather provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    pub api_key: String,

    /// Overrides the provider's public endpoint, e.g. for a proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MailerKind {
    #[default]
    Resend,
    /// Write emails to the log instead of delivering them.
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailerConfig {
    #[serde(default)]
    pub kind: MailerKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_sender")]
    pub from: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            kind: MailerKind::default(),
            api_key: None,
            from: default_sender(),
            base_url: None,
        }
    }
}

fn default_sender() -> String {
    "weatherapp@resend.dev".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StorageConfig {
    /// SQLite database file. Defaults to the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DispatchConfig {
    #[serde(default)]
    pub resend: ResendPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Local wall-clock time of the daily run, "HH:MM".
    #[serde(default = "default_daily_at")]
    pub daily_at: String,

    /// Run every N seconds instead of once a day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_secs: Option<u64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_at: default_daily_at(),
            every_secs: None,
        }
    }
}

fn default_daily_at() -> String {
    "12:00".to_string()
}

fn default_http_timeout_secs() -> u64 {
    10
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Optional default provider id, e.g. "openweather" or "weatherapi".
    pub default_provider: Option<String>,

    /// Example TOML:
    /// [providers.openweather]
    /// api_key = "..."
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub mailer: MailerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Upper bound for every outgoing HTTP call.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: None,
            providers: HashMap::new(),
            mailer: MailerConfig::default(),
            storage: StorageConfig::default(),
            dispatch: DispatchConfig::default(),
            schedule: ScheduleConfig::default(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Config {
    /// Return the default provider as a strongly-typed ProviderId.
    pub fn default_provider_id(&self) -> Result<ProviderId> {
        let s = self.default_provider.as_ref().ok_or_else(|| {
            anyhow!(
                "No default provider configured.\n\
                 Hint: run `weatherwatch configure <provider>` (e.g. `weatherwatch configure openweather`) first."
            )
        })?;

        ProviderId::try_from(s.as_str())
    }

    pub fn provider_config(&self, id: ProviderId) -> Option<&ProviderConfig> {
        self.providers.get(id.as_str())
    }

    pub fn set_default_provider(&mut self, id: ProviderId) {
        self.default_provider = Some(id.as_str().to_string());
    }

    /// Load config from disk (or defaults on first run), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        Ok(Self::load_file()?.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Load config from disk only, or return an empty default if it doesn't exist yet.
    pub fn load_file() -> Result<Self> {
        let path = Self::config_file_path()?;
        if !path.exists() {
            // First run: no config file, return empty.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(&path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("dev", "weatherwatch", "weatherwatch")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))
    }

    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Configured database path, or `weatherwatch.db` in the data directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.storage.database {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join("weatherwatch.db")),
        }
    }

    /// Replace values with those found through `lookup`:
    /// `OPENWEATHERMAP_API_KEY`, `WEATHERAPI_API_KEY`, `RESEND_API_KEY`
    /// and `WEATHERWATCH_DATABASE`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("OPENWEATHERMAP_API_KEY") {
            self.upsert_provider_api_key(ProviderId::OpenWeather, key);
        }
        if let Some(key) = non_empty("WEATHERAPI_API_KEY") {
            self.upsert_provider_api_key(ProviderId::WeatherApi, key);
        }
        if let Some(key) = non_empty("RESEND_API_KEY") {
            self.mailer.api_key = Some(key);
        }
        if let Some(path) = non_empty("WEATHERWATCH_DATABASE") {
            self.storage.database = Some(PathBuf::from(path));
        }

        self
    }

    /// Set/replace a provider API key, keeping any base URL override, and
    /// make it the default provider if none is set yet.
    pub fn upsert_provider_api_key(&mut self, provider_id: ProviderId, api_key: String) {
        match self.providers.get_mut(provider_id.as_str()) {
            Some(cfg) => cfg.api_key = api_key,
            None => {
                self.providers.insert(
                    provider_id.as_str().to_string(),
                    ProviderConfig {
                        api_key,
                        base_url: None,
                    },
                );
            }
        }

        if self.default_provider.is_none() {
            self.default_provider = Some(provider_id.to_string());
        }
    }

    pub fn provider_api_key(&self, provider_id: ProviderId) -> Option<&str> {
        self.provider_config(provider_id).map(|cfg| cfg.api_key.as_str())
    }

    pub fn is_provider_configured(&self, provider_id: ProviderId) -> bool {
        self.provider_api_key(provider_id).is_some()
    }

    pub fn http_timeout(&self) -> Result<Duration> {
        if self.http_timeout_secs == 0 {
            return Err(anyhow!("http_timeout_secs must be greater than zero"));
        }
        Ok(Duration::from_secs(self.http_timeout_secs))
    }

    pub fn schedule(&self) -> Result<Schedule> {
        if let Some(secs) = self.schedule.every_secs {
            if secs == 0 {
                return Err(anyhow!("schedule.every_secs must be greater than zero"));
            }
            return Ok(Schedule::Every(Duration::from_secs(secs)));
        }

        let at = NaiveTime::parse_from_str(&self.schedule.daily_at, "%H:%M").with_context(|| {
            format!(
                "Invalid schedule.daily_at '{}', expected HH:MM",
                self.schedule.daily_at
            )
        })?;
        Ok(Schedule::DailyAt(at))
    }
}
