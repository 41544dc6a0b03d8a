//! Room availability service: TTL cache, aggregation, HTTP API.
//!
//! This crate provides the `roombookd` daemon that:
//! - Serves per-room availability over HTTP (axum)
//! - Fetches room calendars from Exchange, at most once per key at a time
//! - Caches normalized windows with a short TTL and serves stale data when
//!   a refresh fails
//! - Checks bearer tokens against a key list or the accounts service
//! - Lists a person's bookings from the service account's calendar and,
//!   when configured, the My University booking system
//! - Shows red rooms to the people on their access lists
//!
//! # Example
//!
//! ```rust,no_run
//! use roombook_server::{Server, ServerConfig, SignalHandler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::load_from(&ServerConfig::default_path())?;
//!     let signals = SignalHandler::new();
//!     signals.spawn_listener();
//!     Server::from_config(config)?.run(signals.shutdown_handle()).await?;
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod api;
pub mod auth;
pub mod bookings;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod my_uni;
pub mod signals;
pub mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use roombook_core::RoomRegistry;
use roombook_providers::exchange::ExchangeFetcher;
use roombook_providers::{CalendarFetcher, ErrorFetcher};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub use aggregator::{AvailabilityService, FetchFailure, RoomResult};
pub use api::{AppState, SharedState, router};
pub use auth::{AccountsVerifier, AuthError, Identity, IdentityVerifier, StaticTokenVerifier};
pub use cache::{AvailabilityCache, CacheKey, CachedWindow};
pub use config::{AuthMode, ServerConfig};
pub use error::{ConfigError, ServerError, ServerResult};
pub use my_uni::{MyUniBooking, MyUniClient, MyUniError};
pub use signals::{ShutdownHandle, SignalHandler};
pub use sweeper::spawn_sweeper;

/// A configured, not yet listening server.
pub struct Server {
    listen_addr: String,
    sweep_interval: Duration,
    cache: Arc<AvailabilityCache>,
    state: SharedState,
}

impl Server {
    /// Wires registry, fetcher, cache and verifier from `config`.
    pub fn from_config(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;

        let registry = Arc::new(
            RoomRegistry::load(config.rooms.iter().cloned())?
                .with_access_lists(config.access_lists.clone())?,
        );
        let fetcher: Arc<dyn CalendarFetcher> = match ExchangeFetcher::new(config.exchange_config()?)
        {
            Ok(fetcher) => Arc::new(fetcher),
            Err(e) => {
                warn!(error = %e, "exchange client could not be built, rooms will report it");
                Arc::new(ErrorFetcher::new("exchange", e))
            }
        };
        let cache = Arc::new(
            AvailabilityCache::new(config.cache.ttl())
                .with_sweep_multiplier(config.cache.sweep_multiplier),
        );
        let policy = config.policy()?;
        let my_uni =
            MyUniClient::from_settings(&config.my_uni, policy.timezone(), config.upstream.timeout())?;
        let service = AvailabilityService::new(registry, fetcher, cache.clone(), policy)
            .with_timeout(config.upstream.timeout())
            .with_max_concurrency(config.upstream.max_concurrency);
        let verifier = auth::verifier_from_settings(&config.auth, config.upstream.timeout())?;

        info!(
            rooms = service.registry().len(),
            ttl_secs = config.cache.ttl_seconds,
            auth = ?config.auth.mode,
            my_uni = my_uni.is_some(),
            "server configured"
        );

        Ok(Self {
            listen_addr: config.listen_addr,
            sweep_interval: config.cache.sweep_interval(),
            cache,
            state: AppState::with_my_uni(service, verifier, my_uni),
        })
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(self, shutdown: ShutdownHandle) -> ServerResult<()> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| ServerError::bind(&self.listen_addr, e))?;
        self.serve(listener, shutdown).await
    }

    /// Serves on an already bound listener until shutdown.
    pub async fn serve(self, listener: TcpListener, shutdown: ShutdownHandle) -> ServerResult<()> {
        let addr = listener.local_addr()?;
        let sweeper = spawn_sweeper(self.cache.clone(), self.sweep_interval, shutdown.clone());

        info!(%addr, "listening");
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        let _ = sweeper.await;
        info!("server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roombook_core::RoomSpec;

    fn config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.auth.tokens = vec!["secret".into()];
        config.rooms = vec![
            RoomSpec::mailbox("301", "Lecture room 301", "301", "r301@uni.example"),
            RoomSpec::mailbox("302", "Lecture room 302", "302", "r302@uni.example"),
        ];
        config
    }

    #[test]
    fn duplicate_rooms_fail_startup() {
        let mut config = config();
        config.rooms.push(RoomSpec::mailbox("301", "Again", "301", "x@uni.example"));
        assert!(matches!(
            Server::from_config(config),
            Err(ServerError::Registry(_))
        ));
    }

    #[test]
    fn access_lists_and_my_uni_are_wired() {
        let mut config = config();
        config.access_lists.insert(
            "302".into(),
            vec![roombook_core::AccessEntry::new("t.teacher@uni.example")],
        );
        config.my_uni.api_url = Some("https://my.uni.example/api".into());
        config.my_uni.token = Some("t".into());

        let server = Server::from_config(config).unwrap();
        let state = server.state();
        assert!(state.service.registry().has_access("t.teacher@uni.example", "302"));
        assert!(state.my_uni.is_some());
    }

    #[test]
    fn access_list_for_unknown_room_fails_startup() {
        let mut config = config();
        config.access_lists.insert(
            "999".into(),
            vec![roombook_core::AccessEntry::new("t.teacher@uni.example")],
        );
        assert!(matches!(
            Server::from_config(config),
            Err(ServerError::Registry(_))
        ));
    }

    #[test]
    fn invalid_config_fails_startup() {
        let mut config = config();
        config.cache.ttl_seconds = 0;
        assert!(matches!(
            Server::from_config(config),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let server = Server::from_config(config()).unwrap();
        assert_eq!(server.state().service.registry().len(), 2);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let signals = SignalHandler::new();
        let task = tokio::spawn(server.serve(listener, signals.shutdown_handle()));

        let http = reqwest::Client::new();
        let health: serde_json::Value = http
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let rooms = http
            .get(format!("http://{addr}/rooms"))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert_eq!(rooms.status(), reqwest::StatusCode::OK);

        signals.trigger_shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
