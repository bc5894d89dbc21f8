use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use merge::Merge;
use serde::Deserialize;
use thiserror::Error;

/// A custom merge strategy for `Option<T>` fields. It overwrites the destination
/// (`left`) with the source (`right`) only if the source is `Some`.
fn overwrite_if_some<T>(left: &mut Option<T>, right: Option<T>) {
    if right.is_some() {
        *left = right;
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Missing required setting '{0}'")]
    Missing(&'static str),
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// What a session does when the server host key cannot be registered.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Log the failure and launch the tunnel anyway. The tunnel client then runs in
    /// batch mode against whatever its trust store already holds.
    #[default]
    BestEffort,
    /// Abort the connect attempt before any process is launched.
    Required,
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best-effort" => Ok(Self::BestEffort),
            "required" => Ok(Self::Required),
            other => Err(format!("unknown host key policy '{}', expected 'best-effort' or 'required'", other)),
        }
    }
}

/// Durations used by the probe and by disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Delay between the graceful interrupt and the forced kill.
    pub grace_period: Duration,
    /// Granularity of every cooperative wait loop.
    pub poll_interval: Duration,
    /// Upper bound on probe ticks.
    pub probe_ticks: u32,
    /// Upper bound on waiting for killed helpers to be reaped.
    pub join_timeout: Duration,
}

impl Timings {
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(100);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_PROBE_TICKS: u32 = 100;
    pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            grace_period: Self::DEFAULT_GRACE_PERIOD,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            probe_ticks: Self::DEFAULT_PROBE_TICKS,
            join_timeout: Self::DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Everything one connect attempt needs to know about the server and the local ports.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub server_address: String,
    pub server_port: u16,
    /// Base64 of the server's SSH wire-format public key.
    pub server_host_key: String,
    pub username: String,
    pub password: String,
    pub local_socks_port: u16,
    pub local_http_port: u16,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("server_address", &self.server_address)
            .field("server_port", &self.server_port)
            .field("server_host_key", &self.server_host_key)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("local_socks_port", &self.local_socks_port)
            .field("local_http_port", &self.local_http_port)
            .finish()
    }
}

#[derive(Deserialize, Merge, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub server_address: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub server_port: Option<u16>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub server_host_key: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub username: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub password: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub local_socks_port: Option<u16>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub local_http_port: Option<u16>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub tunnel_client_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub proxy_client_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub provision_dir: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub trust_store_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub host_key_policy: Option<HostKeyPolicy>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub grace_period_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub probe_ticks: Option<u32>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub join_timeout_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub system_proxy_configure_command: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub system_proxy_revert_command: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Config {
    /// A config with every field unset, the identity for `merge`.
    pub fn empty() -> Self {
        Self {
            server_address: None,
            server_port: None,
            server_host_key: None,
            username: None,
            password: None,
            local_socks_port: None,
            local_http_port: None,
            tunnel_client_path: None,
            proxy_client_path: None,
            provision_dir: None,
            trust_store_path: None,
            host_key_policy: None,
            grace_period_ms: None,
            poll_interval_ms: None,
            probe_ticks: None,
            join_timeout_ms: None,
            system_proxy_configure_command: None,
            system_proxy_revert_command: None,
            log_level: None,
        }
    }

    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let server_address = required(&self.server_address, "server_address")?;
        if server_address.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "server_address",
                reason: "must not be empty".to_string(),
            });
        }

        let local_socks_port = self.local_socks_port.unwrap_or(1080);
        let local_http_port = self.local_http_port.unwrap_or(8080);
        if local_socks_port == local_http_port {
            return Err(ConfigError::Invalid {
                field: "local_http_port",
                reason: format!("collides with local_socks_port {}", local_socks_port),
            });
        }

        Ok(SessionConfig {
            server_address,
            server_port: self.server_port.unwrap_or(22),
            server_host_key: required(&self.server_host_key, "server_host_key")?,
            username: required(&self.username, "username")?,
            password: required(&self.password, "password")?,
            local_socks_port,
            local_http_port,
        })
    }

    pub fn timings(&self) -> Result<Timings, ConfigError> {
        let defaults = Timings::default();
        let poll_interval = self
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        let probe_ticks = self.probe_ticks.unwrap_or(defaults.probe_ticks);
        if probe_ticks == 0 {
            return Err(ConfigError::Invalid {
                field: "probe_ticks",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Timings {
            grace_period: self
                .grace_period_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.grace_period),
            poll_interval,
            probe_ticks,
            join_timeout: self
                .join_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.join_timeout),
        })
    }

    pub fn host_key_policy(&self) -> HostKeyPolicy {
        self.host_key_policy.unwrap_or_default()
    }
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, ConfigError> {
    value.clone().ok_or(ConfigError::Missing(field))
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_address", &self.server_address)
            .field("server_port", &self.server_port)
            .field("server_host_key", &self.server_host_key)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("local_socks_port", &self.local_socks_port)
            .field("local_http_port", &self.local_http_port)
            .field("tunnel_client_path", &self.tunnel_client_path)
            .field("proxy_client_path", &self.proxy_client_path)
            .field("provision_dir", &self.provision_dir)
            .field("trust_store_path", &self.trust_store_path)
            .field("host_key_policy", &self.host_key_policy)
            .field("grace_period_ms", &self.grace_period_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("probe_ticks", &self.probe_ticks)
            .field("join_timeout_ms", &self.join_timeout_ms)
            .field("system_proxy_configure_command", &self.system_proxy_configure_command)
            .field("system_proxy_revert_command", &self.system_proxy_revert_command)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: Some(22),
            local_socks_port: Some(1080),
            local_http_port: Some(8080),
            tunnel_client_path: Some("plink".to_string()),
            proxy_client_path: Some("polipo".to_string()),
            trust_store_path: Some("~/.putty/sshhostkeys".to_string()),
            host_key_policy: Some(HostKeyPolicy::BestEffort),
            grace_period_ms: Some(100),
            poll_interval_ms: Some(100),
            probe_ticks: Some(100),
            join_timeout_ms: Some(5000),
            log_level: Some("info".to_string()),
            ..Self::empty()
        }
    }
}

pub trait ConfigService {
    fn load_from_paths() -> Result<Config, ConfigError>;
    fn load_from<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError>;
    fn expand_tilde<P: AsRef<Path>>(path: P) -> Option<PathBuf>;
}
