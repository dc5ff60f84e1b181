use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_WELCOME_MESSAGE: &str = "Hello! I'm a multi-purpose AI assistant.\n\n\
I'm currently capable of:\n\
1) helping you record a safety observation\n\
2) capturing context on variances between actual and planned production volumes\n\
3) answering questions about key financial metrics\n\n\
How can I help you today?";

/// Environment variable that overrides the socket base URL
pub const WS_URL_ENV: &str = "PILOT_WS_URL";
/// Environment variable that overrides the HTTP base URL
pub const HTTP_URL_ENV: &str = "PILOT_HTTP_URL";

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Socket server, e.g. `ws://localhost:8000`
    pub ws_base_url: String,

    /// Socket path appended to `ws_base_url`
    pub ws_endpoint: String,

    /// HTTP server used by the event-stream transport
    pub http_base_url: String,

    /// Event-stream path appended to `http_base_url`
    pub stream_endpoint: String,

    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub connect_poll_ms: u64,

    /// First message of every conversation
    pub welcome_message: String,

    pub profile: UserProfile,
}

/// Who is chatting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub preferences: String,
}

impl UserProfile {
    pub fn display_name(&self) -> Option<String> {
        let name = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let name = name.trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ws_base_url: "ws://localhost:8000".to_string(),
            ws_endpoint: "/api/v1/chat/ws".to_string(),
            http_base_url: "http://localhost:8000".to_string(),
            stream_endpoint: "/api/v1/chat/survey/stream".to_string(),
            heartbeat_interval_ms: 10_000,
            reconnect_delay_ms: 100,
            connect_timeout_ms: 5_000,
            connect_poll_ms: 100,
            welcome_message: DEFAULT_WELCOME_MESSAGE.to_string(),
            profile: UserProfile::default(),
        }
    }
}

impl Config {
    /// Directory holding `config.toml`
    pub fn home_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".pilot"))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location and apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::default_path()?)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from `path`, falling back to defaults when it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Reject timer settings that would leave the connection without a period.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("connect_poll_ms", self.connect_poll_ms),
        ];
        for (name, value) in periods {
            anyhow::ensure!(value > 0, "{} must be > 0", name);
        }
        Ok(())
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = self.to_toml()?;
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Override URLs from the environment. `lookup` is `std::env::var` outside tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(WS_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.ws_base_url = url;
        }
        if let Some(url) = lookup(HTTP_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.http_base_url = url;
        }
    }

    /// Full socket URL
    pub fn ws_url(&self) -> String {
        join_url(&self.ws_base_url, &self.ws_endpoint)
    }

    /// Full event-stream URL
    pub fn stream_url(&self) -> String {
        join_url(&self.http_base_url, &self.stream_endpoint)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_poll(&self) -> Duration {
        Duration::from_millis(self.connect_poll_ms)
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
