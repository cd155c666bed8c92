use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;

const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Runtime settings for one meeting client.
#[derive(Debug, Clone)]
pub struct MeetConfig {
    /// Origin the app is served from; decides the signaling host and scheme
    pub app_origin: String,
    pub signaling_port: u16,
    pub signaling_path: String,
    /// REST base for join/leave registration, skipped when unset
    pub api_base: Option<Url>,
    pub api_token: Option<String>,
    pub ice_servers: Vec<String>,
    pub ice_candidate_pool_size: u8,
    pub setup_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub peer_failed_grace: Duration,
    pub media_dir: PathBuf,
    pub display_source: Option<PathBuf>,
    pub recordings_dir: PathBuf,
}

impl Default for MeetConfig {
    fn default() -> Self {
        Self {
            app_origin: "http://localhost:5173".to_string(),
            signaling_port: 3001,
            signaling_path: "/".to_string(),
            api_base: None,
            api_token: None,
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            ice_candidate_pool_size: 10,
            setup_timeout: Duration::from_secs(15),
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(1),
            peer_failed_grace: Duration::from_secs(20),
            media_dir: PathBuf::from("media"),
            display_source: None,
            recordings_dir: PathBuf::from("."),
        }
    }
}

impl MeetConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(origin) = get("APP_ORIGIN") {
            Url::parse(&origin).map_err(|e| ConfigError::invalid("APP_ORIGIN", e))?;
            config.app_origin = origin;
        }
        if let Some(port) = get("SIGNALING_PORT") {
            config.signaling_port = parse(&port, "SIGNALING_PORT")?;
        }
        if let Some(path) = get("SIGNALING_PATH") {
            config.signaling_path = if path.starts_with('/') {
                path
            } else {
                format!("/{path}")
            };
        }
        if let Some(base) = get("API_BASE_URL") {
            config.api_base =
                Some(Url::parse(&base).map_err(|e| ConfigError::invalid("API_BASE_URL", e))?);
        }
        config.api_token = get("API_TOKEN");
        if let Some(servers) = get("STUN_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(size) = get("ICE_CANDIDATE_POOL_SIZE") {
            config.ice_candidate_pool_size = parse(&size, "ICE_CANDIDATE_POOL_SIZE")?;
        }
        if let Some(ms) = get("SETUP_TIMEOUT_MS") {
            config.setup_timeout = Duration::from_millis(parse(&ms, "SETUP_TIMEOUT_MS")?);
        }
        if let Some(n) = get("MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = parse(&n, "MAX_RECONNECT_ATTEMPTS")?;
        }
        if let Some(ms) = get("RECONNECT_BACKOFF_MS") {
            config.reconnect_backoff = Duration::from_millis(parse(&ms, "RECONNECT_BACKOFF_MS")?);
        }
        if let Some(ms) = get("PEER_FAILED_GRACE_MS") {
            config.peer_failed_grace = Duration::from_millis(parse(&ms, "PEER_FAILED_GRACE_MS")?);
        }
        if let Some(dir) = get("MEDIA_DIR") {
            config.media_dir = PathBuf::from(dir);
        }
        config.display_source = get("DISPLAY_SOURCE").map(PathBuf::from);
        if let Some(dir) = get("RECORDINGS_DIR") {
            config.recordings_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Signaling endpoint: same host as the app, fixed port, `wss` only
    /// when the app itself is served over https.
    pub fn signaling_endpoint(&self) -> Result<Url, ConfigError> {
        let origin =
            Url::parse(&self.app_origin).map_err(|e| ConfigError::invalid("APP_ORIGIN", e))?;
        let host = origin
            .host_str()
            .ok_or_else(|| ConfigError::invalid("APP_ORIGIN", "origin has no host"))?;
        let scheme = if origin.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        Url::parse(&format!(
            "{scheme}://{host}:{}{}",
            self.signaling_port, self.signaling_path
        ))
        .map_err(|e| ConfigError::invalid("SIGNALING_PATH", e))
    }
}

fn parse<T>(raw: &str, key: &'static str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, e))
}
