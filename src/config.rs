//! Configuration types for download-relay

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, net::SocketAddr, path::Path, path::PathBuf, time::Duration};
use utoipa::ToSchema;

/// Main configuration for [`DownloadRelay`](crate::DownloadRelay)
///
/// Every section has sensible defaults, so an empty JSON object is a valid
/// (if idle) configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Config {
    /// Download client instances to poll
    #[serde(default)]
    pub clients: Vec<ClientConfig>,

    /// Poll loop settings
    #[serde(default)]
    pub poller: PollerConfig,

    /// Subscriber fan-out settings
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Metadata cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Sliding-window rate limiting for sensitive endpoints
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Backoff for degraded client instances
    #[serde(default)]
    pub retry: RetryConfig,

    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Embedded HTTP surface
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_json_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await.map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values that would make the relay unusable
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (index, client) in self.clients.iter().enumerate() {
            let name = client.instance_name();
            if !names.insert(name.clone()) {
                return Err(Error::Config {
                    message: format!("duplicate client instance name '{}'", name),
                    key: Some(format!("clients[{}].name", index)),
                });
            }

            if url::Url::parse(&client.base_url).is_err() {
                return Err(Error::Config {
                    message: format!("invalid base URL '{}'", client.base_url),
                    key: Some(format!("clients[{}].base_url", index)),
                });
            }

            if matches!(client.credentials(), Credentials::None) {
                return Err(Error::Config {
                    message: format!(
                        "{} client '{}' needs {}",
                        client.kind,
                        name,
                        client.expected_credentials()
                    ),
                    key: Some(format!("clients[{}]", index)),
                });
            }
        }

        if self.poller.interval.is_zero() {
            return Err(Error::Config {
                message: "poll interval must be greater than zero".to_string(),
                key: Some("poller.interval".to_string()),
            });
        }

        if self.poller.fetch_timeout.is_zero() {
            return Err(Error::Config {
                message: "fetch timeout must be greater than zero".to_string(),
                key: Some("poller.fetch_timeout".to_string()),
            });
        }

        if self.broadcast.queue_capacity == 0 {
            return Err(Error::Config {
                message: "outbound queue capacity must be at least 1".to_string(),
                key: Some("broadcast.queue_capacity".to_string()),
            });
        }

        if self.rate_limit.window.is_zero() {
            return Err(Error::Config {
                message: "rate limit window must be greater than zero".to_string(),
                key: Some("rate_limit.window".to_string()),
            });
        }

        Ok(())
    }
}

/// One configured download client instance
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ClientConfig {
    /// Instance name, used as the `source` of its records (default: `type@host`)
    #[serde(default)]
    pub name: Option<String>,

    /// Backend type identifier (e.g. "qbittorrent", "sabnzbd")
    #[serde(rename = "type")]
    pub kind: String,

    /// Base URL of the client's web API
    pub base_url: String,

    /// Static API key (Usenet-style clients)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Username (session-login clients)
    #[serde(default)]
    pub username: Option<String>,

    /// Password (session-login clients)
    #[serde(default)]
    pub password: Option<String>,

    /// Verify TLS certificates (default: true)
    #[serde(default = "default_true")]
    pub tls_verify: bool,

    /// Per-request timeout override (default: poller fetch timeout)
    #[serde(default, with = "optional_duration_serde")]
    #[schema(value_type = Option<u64>)]
    pub timeout: Option<Duration>,
}

/// Credentials carried by a [`ClientConfig`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    /// Static API key
    ApiKey(String),
    /// Username and password for a session handshake
    UserPassword {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// Nothing usable configured
    None,
}

impl ClientConfig {
    /// Name used for logs and as the record source
    pub fn instance_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        let host = url::Url::parse(&self.base_url)
            .ok()
            .and_then(|u| {
                u.host_str().map(|h| match u.port() {
                    Some(port) => format!("{}:{}", h, port),
                    None => h.to_string(),
                })
            })
            .unwrap_or_else(|| self.base_url.clone());
        format!("{}@{}", self.kind, host)
    }

    /// Credentials the declared backend type authenticates with
    ///
    /// qBittorrent only accepts a username and password and SABnzbd only an
    /// API key; anything else configured for them is ignored. Other backend
    /// types get the API key if present, then username + password.
    pub fn credentials(&self) -> Credentials {
        match self.kind.as_str() {
            "qbittorrent" => self.user_password(),
            "sabnzbd" => self.api_key(),
            _ => match self.api_key() {
                Credentials::None => self.user_password(),
                key => key,
            },
        }
    }

    fn api_key(&self) -> Credentials {
        match self.api_key.as_ref().filter(|k| !k.is_empty()) {
            Some(key) => Credentials::ApiKey(key.clone()),
            None => Credentials::None,
        }
    }

    fn user_password(&self) -> Credentials {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) if !username.is_empty() => {
                Credentials::UserPassword {
                    username: username.clone(),
                    password: password.clone(),
                }
            }
            _ => Credentials::None,
        }
    }

    fn expected_credentials(&self) -> &'static str {
        match self.kind.as_str() {
            "qbittorrent" => "a username and password",
            "sabnzbd" => "an api_key",
            _ => "an api_key or a username and password",
        }
    }
}

/// Poll loop configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct PollerConfig {
    /// Time between poll ticks (default: 10 seconds)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    #[schema(value_type = u64)]
    pub interval: Duration,

    /// Per-instance fetch timeout within one tick (default: 5 seconds)
    #[serde(default = "default_fetch_timeout", with = "duration_serde")]
    #[schema(value_type = u64)]
    pub fetch_timeout: Duration,

    /// Minimum progress change, in percentage points, that triggers an update (default: 1.0)
    #[serde(default = "default_progress_threshold")]
    pub progress_threshold: f64,

    /// Ticks a vanished record is held before it is treated as terminal (default: 1)
    #[serde(default = "default_grace_ticks")]
    pub grace_ticks: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            fetch_timeout: default_fetch_timeout(),
            progress_threshold: default_progress_threshold(),
            grace_ticks: default_grace_ticks(),
        }
    }
}

/// Subscriber fan-out configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct BroadcastConfig {
    /// Pending batches held per connection before the oldest is dropped (default: 16)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Consecutive overflows or send failures before a connection is dropped (default: 3)
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Time allowed for one write to a connection (default: 5 seconds)
    #[serde(default = "default_send_timeout", with = "duration_serde")]
    #[schema(value_type = u64)]
    pub send_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_consecutive_failures: default_max_consecutive_failures(),
            send_timeout: default_send_timeout(),
        }
    }
}

/// Metadata cache configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct CacheConfig {
    /// Interval of the expired-row reclaim sweep (default: 1 hour)
    #[serde(default = "default_cache_cleanup_interval", with = "duration_serde")]
    #[schema(value_type = u64)]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: default_cache_cleanup_interval(),
        }
    }
}

/// Sliding-window rate limiting configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RateLimitConfig {
    /// Enable the HTTP middleware (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests allowed per key within the window (default: 5)
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// Window length (default: 60 seconds)
    #[serde(default = "default_rate_window", with = "duration_serde")]
    #[schema(value_type = u64)]
    pub window: Duration,

    /// Interval of the idle-key sweep (default: 60 seconds)
    #[serde(default = "default_rate_sweep_interval", with = "duration_serde")]
    #[schema(value_type = u64)]
    pub sweep_interval: Duration,

    /// Path prefixes the middleware guards (default: ["/invitations"])
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,

    /// Client addresses never limited
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    pub exempt_ips: Vec<std::net::IpAddr>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window: default_rate_window(),
            sweep_interval: default_rate_sweep_interval(),
            protected_paths: default_protected_paths(),
            exempt_ips: vec![],
        }
    }
}

/// Backoff for instances that failed to connect or had credentials rejected
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RetryConfig {
    /// Initial delay before the first reconnect (default: 30 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    #[schema(value_type = u64)]
    pub initial_delay: Duration,

    /// Maximum delay between reconnects (default: 15 minutes)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    #[schema(value_type = u64)]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct PersistenceConfig {
    /// Database path (default: "./download-relay.db")
    #[serde(default = "default_database_path")]
    #[schema(value_type = String)]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Embedded HTTP surface configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiConfig {
    /// Address to bind to (default: 127.0.0.1:7878)
    #[serde(default = "default_bind_address")]
    #[schema(value_type = String)]
    pub bind_address: SocketAddr,

    /// Header carrying the authenticated user id, set by the upstream auth layer
    #[serde(default = "default_user_header")]
    pub user_header: String,

    /// Enable CORS for browser access (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (default: ["*"])
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Enable Swagger UI at /swagger-ui (default: false)
    #[serde(default)]
    pub swagger_ui: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            user_header: default_user_header(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
            swagger_ui: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_progress_threshold() -> f64 {
    1.0
}

fn default_grace_ticks() -> u32 {
    1
}

fn default_queue_capacity() -> usize {
    16
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_cache_cleanup_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_max_requests() -> usize {
    5
}

fn default_rate_window() -> Duration {
    Duration::from_secs(60)
}

fn default_rate_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_protected_paths() -> Vec<String> {
    vec!["/invitations".to_string()]
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./download-relay.db")
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7878))
}

fn default_user_header() -> String {
    "x-user-id".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn qbit(name: Option<&str>) -> ClientConfig {
        ClientConfig {
            name: name.map(str::to_string),
            kind: "qbittorrent".to_string(),
            base_url: "http://seedbox.lan:8080".to_string(),
            api_key: None,
            username: Some("admin".to_string()),
            password: Some("adminadmin".to_string()),
            tls_verify: true,
            timeout: None,
        }
    }

    #[test]
    fn empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.clients.is_empty());
        assert_eq!(config.poller.interval, Duration::from_secs(10));
        assert_eq!(config.poller.fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.poller.progress_threshold, 1.0);
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.broadcast.queue_capacity, 16);
        assert_eq!(config.api.user_header, "x-user-id");
        config.validate().unwrap();
    }

    #[test]
    fn client_entries_deserialize_with_type_field() {
        let json = r#"{
            "clients": [
                {"type": "sabnzbd", "base_url": "https://sab.example.com", "api_key": "k", "tls_verify": false, "timeout": 3},
                {"type": "qbittorrent", "name": "seedbox", "base_url": "http://10.0.0.2:8080", "username": "u", "password": "p"}
            ],
            "poller": {"interval": 15}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.clients.len(), 2);
        assert_eq!(config.clients[0].kind, "sabnzbd");
        assert!(!config.clients[0].tls_verify);
        assert_eq!(config.clients[0].timeout, Some(Duration::from_secs(3)));
        assert!(config.clients[1].tls_verify);
        assert_eq!(config.poller.interval, Duration::from_secs(15));
        config.validate().unwrap();
    }

    #[test]
    fn instance_name_defaults_to_type_and_host() {
        assert_eq!(qbit(None).instance_name(), "qbittorrent@seedbox.lan:8080");
        assert_eq!(qbit(Some("box")).instance_name(), "box");
        assert_eq!(qbit(Some("  ")).instance_name(), "qbittorrent@seedbox.lan:8080");
    }

    #[test]
    fn credentials_follow_backend_type() {
        let mut client = qbit(None);
        client.api_key = Some("abc".to_string());
        assert!(matches!(
            client.credentials(),
            Credentials::UserPassword { .. }
        ));

        client.kind = "sabnzbd".to_string();
        assert_eq!(client.credentials(), Credentials::ApiKey("abc".to_string()));

        client.kind = "transmission".to_string();
        assert_eq!(client.credentials(), Credentials::ApiKey("abc".to_string()));
        client.api_key = None;
        assert!(matches!(
            client.credentials(),
            Credentials::UserPassword { .. }
        ));
        client.password = None;
        assert_eq!(client.credentials(), Credentials::None);
    }

    #[test]
    fn validate_rejects_credentials_of_the_wrong_type() {
        let mut qbit_with_key_only = qbit(None);
        qbit_with_key_only.username = None;
        qbit_with_key_only.password = None;
        qbit_with_key_only.api_key = Some("k".to_string());
        let config = Config {
            clients: vec![qbit_with_key_only],
            ..Default::default()
        };
        match config.validate() {
            Err(Error::Config { message, key }) => {
                assert!(message.contains("username and password"), "{message}");
                assert_eq!(key.as_deref(), Some("clients[0]"));
            }
            other => panic!("expected config error, got {other:?}"),
        }

        let mut sab_with_login = qbit(None);
        sab_with_login.kind = "sabnzbd".to_string();
        let config = Config {
            clients: vec![sab_with_login],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // Extra credentials next to the right ones are ignored
        let mut qbit_with_extra_key = qbit(None);
        qbit_with_extra_key.api_key = Some("k".to_string());
        let config = Config {
            clients: vec![qbit_with_extra_key],
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let config = Config {
            clients: vec![qbit(Some("a")), qbit(Some("a"))],
            ..Default::default()
        };
        match config.validate() {
            Err(Error::Config { key, .. }) => assert_eq!(key.as_deref(), Some("clients[1].name")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_missing_credentials_and_bad_urls() {
        let mut no_creds = qbit(None);
        no_creds.username = None;
        let config = Config {
            clients: vec![no_creds],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut bad_url = qbit(None);
        bad_url.base_url = "not a url".to_string();
        let config = Config {
            clients: vec![bad_url],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let mut config = Config::default();
        config.poller.interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.broadcast.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        tokio::fs::write(&path, r#"{"rate_limit": {"max_requests": 10}}"#)
            .await
            .unwrap();
        let config = Config::from_json_file(&path).await.unwrap();
        assert_eq!(config.rate_limit.max_requests, 10);

        assert!(
            Config::from_json_file(&dir.path().join("missing.json"))
                .await
                .is_err()
        );
    }
}
