//! Configuration Module
//!
//! TOML-based configuration for the forwarder with support for:
//! - Local broker endpoint and subscription filter
//! - Remote broker endpoint and topic prefix
//! - Reconnection backoff bounds
//! - Environment variable overrides (`FORWARDER__*` and the flat legacy names)

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::protocol::QoS;
use crate::topic::{validate_topic_filter, validate_topic_name};


/// Subscription filter used when `local.topic` is not configured
pub const DEFAULT_LOCAL_TOPIC: &str = "eu868/gateway/+/event/up";

/// Default MQTT port when the URL does not carry one
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Prefix for structured environment overrides (`FORWARDER__LOCAL__URL`)
const ENV_PREFIX: &str = "FORWARDER";

/// Flat legacy environment variables and the keys they set
const LEGACY_ENV_VARS: &[(&str, &str)] = &[
    ("LOCAL_MQTT_URL", "local.url"),
    ("LOCAL_MQTT_CLIENT_ID", "local.client_id"),
    ("LOCAL_MQTT_USERNAME", "local.username"),
    ("LOCAL_MQTT_PASSWORD", "local.password"),
    ("LOCAL_MQTT_TOPIC", "local.topic"),
    ("REMOTE_MQTT_URL", "remote.url"),
    ("REMOTE_MQTT_CLIENT_ID", "remote.client_id"),
    ("REMOTE_MQTT_USERNAME", "remote.username"),
    ("REMOTE_MQTT_PASSWORD", "remote.password"),
    ("REMOTE_TOPIC_PREFIX", "remote.topic_prefix"),
    ("RECONNECT_INITIAL_DELAY_MS", "reconnect.initial_delay_ms"),
    ("RECONNECT_MAX_DELAY_MS", "reconnect.max_delay_ms"),
];

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is valid")
    });
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Legacy variable name for a config key, used in diagnostics
fn legacy_var_for(key: &str) -> Option<&'static str> {
    LEGACY_ENV_VARS
        .iter()
        .find(|(_, k)| *k == key)
        .map(|(var, _)| *var)
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl ConfigError {
    fn missing(key: &str) -> Self {
        let hint = match legacy_var_for(key) {
            Some(var) => format!(
                " (set {} or {}__{})",
                var,
                ENV_PREFIX,
                key.replace('.', "__").to_uppercase()
            ),
            None => String::new(),
        };
        ConfigError::Validation(format!("{} is required{}", key, hint))
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// A credential that never appears in `Debug` output
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Local (source) broker
    pub local: LocalConfig,
    /// Remote (destination) broker
    pub remote: RemoteConfig,
    /// Reconnection bounds shared by both sides
    pub reconnect: ReconnectConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Local broker: where messages are subscribed from
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Broker URL (`mqtt://host:port`)
    pub url: String,
    /// Client identifier
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Secret>,
    /// Keep-alive in seconds (0 disables pings)
    pub keep_alive: u16,
    /// Largest inbound packet accepted from this broker, in bytes
    pub max_packet_size: usize,
    /// Subscription topic filter
    pub topic: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            topic: DEFAULT_LOCAL_TOPIC.to_string(),
        }
    }
}

/// Remote broker: where messages are republished to
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Broker URL (`mqtt://host:port`)
    pub url: String,
    /// Client identifier
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Secret>,
    /// Keep-alive in seconds (0 disables pings)
    pub keep_alive: u16,
    /// Largest inbound packet accepted from this broker, in bytes
    pub max_packet_size: usize,
    /// Prepended to every forwarded topic as `{prefix}/{topic}`
    pub topic_prefix: String,
    /// QoS for republished messages (0 or 1)
    pub qos: u8,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            topic_prefix: String::new(),
            qos: 0,
        }
    }
}

impl RemoteConfig {
    /// QoS used for republished messages
    pub fn publish_qos(&self) -> QoS {
        QoS::from_u8(self.qos).unwrap_or_default()
    }
}

/// Reconnection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First reconnect delay in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for the reconnect delay in milliseconds
    pub max_delay_ms: u64,
    /// Bound on TCP connect + CONNACK, in seconds
    pub connect_timeout_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_keep_alive() -> u16 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

/// Everything a client needs to open one broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// URL as configured, used in log lines
    pub url: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Secret>,
    /// Keep-alive in seconds (0 disables pings)
    pub keep_alive: u16,
    pub connect_timeout: Duration,
    /// Decoder limit for inbound packets
    pub max_packet_size: usize,
}

impl EndpointConfig {
    /// Socket address string for `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Keep-alive as a Duration, None when disabled
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive > 0).then(|| Duration::from_secs(self.keep_alive as u64))
    }
}

/// Split a broker URL into host and port.
///
/// Accepts `mqtt://host[:port]`, `tcp://host[:port]` and bare `host[:port]`.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), ConfigError> {
    let rest = match url.split_once("://") {
        Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => rest,
            other => {
                return Err(ConfigError::Validation(format!(
                    "unsupported URL scheme '{}' in '{}' (expected mqtt:// or tcp://)",
                    other, url
                )))
            }
        },
        None => url,
    };

    let authority = rest.trim_end_matches('/');
    if authority.contains('@') {
        return Err(ConfigError::Validation(format!(
            "credentials in URL '{}' are not supported, use username/password",
            url
        )));
    }
    if authority.contains('/') {
        return Err(ConfigError::Validation(format!(
            "URL '{}' must not contain a path",
            url
        )));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !authority.ends_with(']') => {
            let port = port.parse::<u16>().map_err(|_| {
                ConfigError::Validation(format!("invalid port '{}' in '{}'", port, url))
            })?;
            (host, port)
        }
        _ => (authority, DEFAULT_MQTT_PORT),
    };

    if host.is_empty() {
        return Err(ConfigError::Validation(format!(
            "URL '{}' has no host",
            url
        )));
    }

    Ok((host.to_string(), port))
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports three forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `FORWARDER__` prefix with double underscores for nesting:
    ///    - `FORWARDER__REMOTE__TOPIC_PREFIX=bridge/siteA` overrides `remote.topic_prefix`
    ///    - `FORWARDER__RECONNECT__MAX_DELAY_MS=60000` overrides `reconnect.max_delay_ms`
    /// 3. The flat legacy names (`LOCAL_MQTT_URL`,
    ///    `REMOTE_TOPIC_PREFIX`, `RECONNECT_INITIAL_DELAY_MS`, ...), which win
    ///    over everything else when set and non-empty
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("local.keep_alive", default_keep_alive() as i64)?
            .set_default("local.topic", DEFAULT_LOCAL_TOPIC)?
            .set_default("local.max_packet_size", DEFAULT_MAX_PACKET_SIZE as i64)?
            .set_default("remote.keep_alive", default_keep_alive() as i64)?
            .set_default("remote.max_packet_size", DEFAULT_MAX_PACKET_SIZE as i64)?
            .set_default("remote.qos", 0)?
            .set_default("reconnect.connect_timeout_secs", default_connect_timeout() as i64)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        if !path.as_os_str().is_empty() {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let substituted = substitute_env_vars(&content);
                    builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // File doesn't exist, use defaults and environment
                }
                Err(e) => return Err(ConfigError::Io(e)),
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        for (var, key) in LEGACY_ENV_VARS {
            builder = builder.set_override_option(*key, non_empty_env(var))?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only (no file).
    ///
    /// This is how the forwarder is usually deployed in containers.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("local.url", self.local.url.is_empty()),
            ("local.client_id", self.local.client_id.is_empty()),
            ("remote.url", self.remote.url.is_empty()),
            ("remote.client_id", self.remote.client_id.is_empty()),
            ("remote.topic_prefix", self.remote.topic_prefix.is_empty()),
            ("reconnect.initial_delay_ms", self.reconnect.initial_delay_ms == 0),
            ("reconnect.max_delay_ms", self.reconnect.max_delay_ms == 0),
        ];
        if let Some((key, _)) = required.iter().find(|(_, missing)| *missing) {
            return Err(ConfigError::missing(key));
        }

        parse_broker_url(&self.local.url)?;
        parse_broker_url(&self.remote.url)?;

        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::Validation(format!(
                "reconnect.max_delay_ms ({}) must not be smaller than reconnect.initial_delay_ms ({})",
                self.reconnect.max_delay_ms, self.reconnect.initial_delay_ms
            )));
        }

        if self.reconnect.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "reconnect.connect_timeout_secs must be greater than zero".to_string(),
            ));
        }

        for (key, size) in [
            ("local.max_packet_size", self.local.max_packet_size),
            ("remote.max_packet_size", self.remote.max_packet_size),
        ] {
            if size == 0 {
                return Err(ConfigError::Validation(format!(
                    "{} must be greater than zero",
                    key
                )));
            }
        }

        validate_topic_filter(&self.local.topic).map_err(|e| {
            ConfigError::Validation(format!("local.topic '{}': {}", self.local.topic, e))
        })?;

        validate_topic_name(&self.remote.topic_prefix).map_err(|e| {
            ConfigError::Validation(format!(
                "remote.topic_prefix '{}': {}",
                self.remote.topic_prefix, e
            ))
        })?;

        if self.remote.qos > 1 {
            return Err(ConfigError::Validation(
                "remote.qos must be 0 or 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Connection parameters for the local broker
    pub fn local_endpoint(&self) -> Result<EndpointConfig, ConfigError> {
        let (host, port) = parse_broker_url(&self.local.url)?;
        Ok(EndpointConfig {
            url: self.local.url.clone(),
            host,
            port,
            client_id: self.local.client_id.clone(),
            username: self.local.username.clone(),
            password: self.local.password.clone(),
            keep_alive: self.local.keep_alive,
            connect_timeout: self.reconnect.connect_timeout(),
            max_packet_size: self.local.max_packet_size,
        })
    }

    /// Connection parameters for the remote broker
    pub fn remote_endpoint(&self) -> Result<EndpointConfig, ConfigError> {
        let (host, port) = parse_broker_url(&self.remote.url)?;
        Ok(EndpointConfig {
            url: self.remote.url.clone(),
            host,
            port,
            client_id: self.remote.client_id.clone(),
            username: self.remote.username.clone(),
            password: self.remote.password.clone(),
            keep_alive: self.remote.keep_alive,
            connect_timeout: self.reconnect.connect_timeout(),
            max_packet_size: self.remote.max_packet_size,
        })
    }
}
