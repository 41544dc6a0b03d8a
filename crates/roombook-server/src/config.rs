//! Server configuration.
//!
//! Everything lives in one `config.toml`, by default at
//! `~/.config/roombook/config.toml`:
//!
//! ```toml
//! listen_addr = "0.0.0.0:8080"
//! timezone = "Europe/Moscow"
//!
//! [cache]
//! ttl_seconds = 60
//!
//! [exchange]
//! ews_url = "https://mail.uni.example/EWS/Exchange.asmx"
//! username = "svc-rooms"
//! password_file = "/run/secrets/ews"
//!
//! [auth]
//! mode = "accounts"
//! api_url = "https://api.uni.example/accounts/v0"
//!
//! [my_uni]
//! api_url = "https://my.uni.example/api"
//! token_file = "/run/secrets/my-uni"
//!
//! [[rooms]]
//! id = "301"
//! title = "Lecture room 301"
//! short_name = "301"
//! mailbox = "r301@uni.example"
//! my_uni_id = 12
//!
//! [access_lists]
//! "301" = [{ email = "t.teacher@uni.example" }]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use roombook_core::{AccessEntry, DaytimePolicy, RoomSpec};
use roombook_providers::exchange::ExchangeConfig;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API binds to.
    pub listen_addr: String,

    /// IANA zone for the daytime band and for floating calendar times.
    pub timezone: String,

    pub cache: CacheSettings,
    pub upstream: UpstreamSettings,
    pub exchange: ExchangeSettings,
    pub auth: AuthSettings,
    pub my_uni: MyUniSettings,

    /// Static room registry.
    pub rooms: Vec<RoomSpec>,

    /// People allowed into restricted rooms, keyed by room id.
    pub access_lists: BTreeMap<String, Vec<AccessEntry>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            timezone: "Europe/Moscow".to_string(),
            cache: CacheSettings::default(),
            upstream: UpstreamSettings::default(),
            exchange: ExchangeSettings::default(),
            auth: AuthSettings::default(),
            my_uni: MyUniSettings::default(),
            rooms: Vec::new(),
            access_lists: BTreeMap::new(),
        }
    }
}

/// Availability cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_seconds: u64,
    /// How often idle entries are swept.
    pub sweep_interval_seconds: u64,
    /// Entries idle for longer than `sweep_multiplier * ttl` are dropped.
    pub sweep_multiplier: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 60,
            sweep_interval_seconds: 300,
            sweep_multiplier: 10,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// Limits on calls to the calendar server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub timeout_seconds: u64,
    pub max_concurrency: usize,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_concurrency: 5,
        }
    }
}

impl UpstreamSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Exchange connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub ews_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// File holding the password; wins over `password`.
    pub password_file: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub accept_invalid_certs: bool,
}

/// How bearer tokens are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// A fixed list of API keys.
    #[default]
    Static,
    /// Ask the accounts service who the token belongs to.
    Accounts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub mode: AuthMode,
    /// Accepted tokens in `static` mode.
    pub tokens: Vec<String>,
    /// Base URL of the accounts API in `accounts` mode.
    pub api_url: Option<String>,
}

/// My University booking system. Left out, `GET /bookings/my` only reads
/// Exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MyUniSettings {
    pub api_url: Option<String>,
    /// Value of the `X-Booking-Token` header.
    pub token: Option<String>,
    /// File holding the token; wins over `token`.
    pub token_file: Option<PathBuf>,
}

impl MyUniSettings {
    /// The token, read from `token_file` if set.
    pub fn token(&self) -> Result<Option<String>, ConfigError> {
        match self.token_file {
            Some(ref path) => read_secret(path).map(Some),
            None => Ok(self.token.clone().filter(|t| !t.trim().is_empty())),
        }
    }
}

fn read_secret(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim_end().to_string())
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
}

impl ServerConfig {
    /// Loads and validates the file at `path`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("roombook")
            .join("config.toml")
    }

    /// Rejects values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.ttl_seconds == 0 {
            return Err(ConfigError::invalid("cache.ttl_seconds", "must be greater than 0"));
        }
        if self.cache.sweep_interval_seconds == 0 {
            return Err(ConfigError::invalid(
                "cache.sweep_interval_seconds",
                "must be greater than 0",
            ));
        }
        if self.cache.sweep_multiplier == 0 {
            return Err(ConfigError::invalid("cache.sweep_multiplier", "must be greater than 0"));
        }
        if self.upstream.timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "upstream.timeout_seconds",
                "must be greater than 0",
            ));
        }
        if self.upstream.max_concurrency == 0 {
            return Err(ConfigError::invalid(
                "upstream.max_concurrency",
                "must be greater than 0",
            ));
        }
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| ConfigError::invalid("listen_addr", e.to_string()))?;
        self.policy()?;
        if let Some(ref url) = self.exchange.ews_url {
            Url::parse(url).map_err(|e| ConfigError::invalid("exchange.ews_url", e.to_string()))?;
        }
        match self.auth.mode {
            AuthMode::Static if self.auth.tokens.iter().all(|t| t.trim().is_empty()) => {
                return Err(ConfigError::invalid(
                    "auth.tokens",
                    "static mode needs at least one token",
                ));
            }
            AuthMode::Accounts => {
                let Some(ref api_url) = self.auth.api_url else {
                    return Err(ConfigError::invalid(
                        "auth.api_url",
                        "required in accounts mode",
                    ));
                };
                Url::parse(api_url).map_err(|e| ConfigError::invalid("auth.api_url", e.to_string()))?;
            }
            AuthMode::Static => {}
        }
        if let Some(ref url) = self.my_uni.api_url {
            Url::parse(url).map_err(|e| ConfigError::invalid("my_uni.api_url", e.to_string()))?;
            if self.my_uni.token.is_none() && self.my_uni.token_file.is_none() {
                return Err(ConfigError::invalid(
                    "my_uni.token",
                    "required when my_uni.api_url is set",
                ));
            }
        }
        Ok(())
    }

    /// Daytime policy in the configured zone.
    pub fn policy(&self) -> Result<DaytimePolicy, ConfigError> {
        DaytimePolicy::from_timezone_name(&self.timezone)
            .map_err(|e| ConfigError::invalid("timezone", e.to_string()))
    }

    /// Builds the Exchange client settings, reading `password_file` if set.
    pub fn exchange_config(&self) -> Result<ExchangeConfig, ConfigError> {
        let settings = &self.exchange;
        let base = match settings.ews_url {
            Some(ref url) => ExchangeConfig::new(url)
                .map_err(|e| ConfigError::invalid("exchange.ews_url", e.to_string()))?,
            None => ExchangeConfig::default(),
        };
        let mut config = base
            .with_timeout(self.upstream.timeout())
            .with_timezone(self.policy()?.timezone());

        let password = match settings.password_file {
            Some(ref path) => Some(read_secret(path)?),
            None => settings.password.clone(),
        };
        if let (Some(username), Some(password)) = (settings.username.as_ref(), password) {
            config = config.with_credentials(username, password);
        }
        if let Some(ref agent) = settings.user_agent {
            config = config.with_user_agent(agent);
        }
        if settings.accept_invalid_certs {
            config = config.with_insecure_tls();
        }
        Ok(config)
    }
}
