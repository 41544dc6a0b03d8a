//! Exchange fetcher configuration.

use std::time::Duration;

use chrono_tz::Tz;
use url::Url;

/// Settings for talking to Exchange.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// EWS endpoint, e.g. `https://mail.example.com/EWS/Exchange.asmx`.
    /// Only needed for mailbox-backed rooms.
    pub ews_url: Option<Url>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// HTTP-level timeout for a single request.
    pub timeout: Duration,
    pub user_agent: String,
    pub verify_tls: bool,
    /// Granularity EWS uses when merging free/busy slots.
    pub merged_free_busy_interval: u32,
    /// Zone for floating ICS times.
    pub timezone: Tz,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            ews_url: None,
            username: None,
            password: None,
            timeout: Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS),
            user_agent: format!("roombook/{}", env!("CARGO_PKG_VERSION")),
            verify_tls: true,
            merged_free_busy_interval: Self::DEFAULT_MERGED_INTERVAL_MINUTES,
            timezone: roombook_core::policy::DEFAULT_TIMEZONE,
        }
    }
}

impl ExchangeConfig {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_MERGED_INTERVAL_MINUTES: u32 = 5;

    /// Configuration pointing at an EWS endpoint.
    pub fn new(ews_url: impl AsRef<str>) -> Result<Self, url::ParseError> {
        Ok(Self {
            ews_url: Some(Url::parse(ews_url.as_ref())?),
            ..Self::default()
        })
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Skips TLS verification. Test servers only.
    #[must_use]
    pub fn with_insecure_tls(mut self) -> Self {
        self.verify_tls = false;
        self
    }

    #[must_use]
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    #[must_use]
    pub fn with_merged_interval(mut self, minutes: u32) -> Self {
        self.merged_free_busy_interval = minutes;
        self
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}
