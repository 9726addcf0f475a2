//! Explicit configuration passed into constructors at startup.
//!
//! Nothing here reads the environment; the binary builds these structs once
//! and hands them down.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_CLIENT_ID: &str = "courier-dispatch-client";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_STORE_URL: &str = "sqlite://scheduled_tasks.db";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("broker address is empty")]
    EmptyBrokerAddress,

    #[error("unsupported broker scheme '{0}' (expected tcp:// or mqtt://)")]
    UnsupportedScheme(String),

    #[error("invalid broker port '{0}'")]
    InvalidPort(String),

    #[error("unknown delivery policy '{0}' (expected always-advance or require-delivery)")]
    UnknownDeliveryPolicy(String),
}

/// Broker host/port parsed from `tcp://host:port`, `mqtt://host:port` or `host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl FromStr for BrokerAddress {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let rest = match raw.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some((scheme, _)) => return Err(ConfigError::UnsupportedScheme(scheme.to_string())),
            None => raw,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidPort(port.to_string()))?;
                (host, port)
            }
            None => (rest, DEFAULT_MQTT_PORT),
        };

        if host.is_empty() {
            return Err(ConfigError::EmptyBrokerAddress);
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// Connection parameters for the broker. One connection per invocation.
#[derive(Clone)]
pub struct BrokerConfig {
    pub address: BrokerAddress,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub connect_timeout: Duration,

    /// Upper bound on waiting for a PUBACK.
    pub ack_timeout: Duration,
    pub keep_alive: Duration,
}

impl BrokerConfig {
    pub fn new(address: BrokerAddress) -> Self {
        Self {
            address,
            username: None,
            password: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("connect_timeout", &self.connect_timeout)
            .field("ack_timeout", &self.ack_timeout)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Task store location and paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub url: String,
    pub max_connections: u32,

    /// Documents fetched per round trip while enumerating due tasks.
    pub page_size: usize,
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 1,
            page_size: 100,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_URL)
    }
}

/// What happens to a task whose publish was not confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Mark processed regardless of the publish outcome. Favours "never
    /// reprocess" over "never lose"; every unconfirmed advance is logged.
    #[default]
    AlwaysAdvance,

    /// Only a confirmed delivery may advance the status; everything else stays
    /// pending and is selected again next invocation.
    RequireDelivery,
}

impl FromStr for DeliveryPolicy {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "always-advance" => Ok(DeliveryPolicy::AlwaysAdvance),
            "require-delivery" => Ok(DeliveryPolicy::RequireDelivery),
            other => Err(ConfigError::UnknownDeliveryPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for DeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryPolicy::AlwaysAdvance => f.write_str("always-advance"),
            DeliveryPolicy::RequireDelivery => f.write_str("require-delivery"),
        }
    }
}

/// Dispatch loop knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    pub delivery_policy: DeliveryPolicy,
    pub disconnect_grace: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            delivery_policy: DeliveryPolicy::AlwaysAdvance,
            disconnect_grace: Duration::from_millis(250),
        }
    }
}
