use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::LogLevel;
use crate::util;

pub const CLOUD_HOST: &str = "0.peerjs.com";
pub const CLOUD_PORT: u16 = 443;
pub const DEFAULT_KEY: &str = "peerjs";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
/// Lifetime of one chunked fallback stream before it is rotated.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(25);

/// One STUN/TURN server handed to the native peer-connection capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
        }
    }
}

/// Settings for one session against a rendezvous server.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub host: String,
    pub port: u16,
    /// Websocket port when the server splits it from the HTTP port.
    pub ws_port: Option<u16>,
    pub path: String,
    pub key: String,
    /// Per-session secret presented alongside the identity.
    pub token: String,
    pub secure: bool,
    pub config: RtcConfiguration,
    pub stream_timeout: Duration,
    pub log_level: LogLevel,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            host: CLOUD_HOST.to_string(),
            port: CLOUD_PORT,
            ws_port: None,
            path: "/".to_string(),
            key: DEFAULT_KEY.to_string(),
            token: util::random_token(),
            secure: true,
            config: RtcConfiguration::default(),
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            log_level: LogLevel::default(),
        }
    }
}

impl PeerOptions {
    /// Defaults overlaid with `BEACH_PIER_*` environment variables.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(host) = env::var("BEACH_PIER_HOST") {
            if !host.trim().is_empty() {
                options.host = host;
            }
        }
        if let Some(port) = env::var("BEACH_PIER_PORT")
            .ok()
            .and_then(|value| value.parse().ok())
        {
            options.port = port;
        }
        options.ws_port = env::var("BEACH_PIER_WS_PORT")
            .ok()
            .and_then(|value| value.parse().ok())
            .or(options.ws_port);
        if let Ok(path) = env::var("BEACH_PIER_PATH") {
            options.path = path;
        }
        if let Ok(key) = env::var("BEACH_PIER_KEY") {
            options.key = key;
        }
        if let Ok(secure) = env::var("BEACH_PIER_SECURE") {
            options.secure = secure == "1" || secure.eq_ignore_ascii_case("true");
        }
        if let Some(ms) = env::var("BEACH_PIER_STREAM_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            options.stream_timeout = Duration::from_millis(ms);
        }
        if let Some(level) = env::var("BEACH_PIER_DEBUG")
            .ok()
            .and_then(|value| value.parse::<u8>().ok())
        {
            options.log_level = LogLevel::from_debug(level);
        }
        if let Ok(urls) = env::var("BEACH_PIER_ICE_SERVERS") {
            let servers: Vec<IceServer> = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::stun)
                .collect();
            if !servers.is_empty() {
                options.config.ice_servers = servers;
            }
        }
        options
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.config.ice_servers = servers;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Path with exactly one leading and one trailing slash.
    fn normalized_path(&self) -> String {
        let trimmed = self.path.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        }
    }

    /// `{scheme}://{host}:{port}{path}{key}`
    pub(crate) fn http_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!(
            "{scheme}://{}:{}{}{}",
            self.host,
            self.port,
            self.normalized_path(),
            self.key
        )
    }

    pub(crate) fn ws_base(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}{}peerjs",
            self.host,
            self.ws_port.unwrap_or(self.port),
            self.normalized_path()
        )
    }
}
