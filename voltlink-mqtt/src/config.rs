//! Configuration for the bus client.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use voltlink_common::DEFAULT_NAMESPACE;

use crate::error::BusError;

/// MQTT section of the relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker URL, e.g. "mqtt://localhost:1883"
    #[serde(default = "default_url")]
    pub url: String,

    /// Username (overrides credentials embedded in the URL)
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Prefix of the generated client id
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    /// Topic namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Bound on each connection attempt in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay before retrying after a failure or drop, in milliseconds
    #[serde(default = "default_reconnect_period_ms")]
    pub reconnect_period_ms: u64,

    /// Bound on handing a publish to the client, in milliseconds
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

fn default_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_client_id_prefix() -> String {
    "voltlink".to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    4000
}

fn default_reconnect_period_ms() -> u64 {
    1000
}

fn default_publish_timeout_ms() -> u64 {
    2000
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: None,
            password: None,
            client_id_prefix: default_client_id_prefix(),
            namespace: default_namespace(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_period_ms: default_reconnect_period_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

/// Parsed broker location and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

const DEFAULT_MQTT_PORT: u16 = 1883;

impl BrokerAddress {
    /// Parse `mqtt://[user[:pass]@]host[:port][/...]`.
    ///
    /// The scheme may be omitted. Only plain TCP (`mqtt`, `tcp`) is
    /// supported.
    pub fn parse(url: &str) -> Result<Self, BusError> {
        let invalid = |reason: &str| BusError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = url.trim();
        let (scheme, rest) = trimmed.split_once("://").unwrap_or(("mqtt", trimmed));
        if !matches!(scheme, "mqtt" | "tcp") {
            return Err(invalid(&format!("unsupported scheme '{}'", scheme)));
        }

        let authority = rest.split(['/', '?']).next().unwrap_or_default();
        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, authority),
        };

        let (host, port) = if let Some(bracketed) = hostport.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let port = match after.strip_prefix(':') {
                Some(port) => parse_port(port).ok_or_else(|| invalid("invalid port"))?,
                None if after.is_empty() => DEFAULT_MQTT_PORT,
                None => return Err(invalid("unexpected characters after host")),
            };
            (host, port)
        } else {
            match hostport.split_once(':') {
                Some((host, port)) => (
                    host,
                    parse_port(port).ok_or_else(|| invalid("invalid port"))?,
                ),
                None => (hostport, DEFAULT_MQTT_PORT),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let (username, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
                None => (Some(info.to_string()), None),
            },
            None => (None, None),
        };

        Ok(Self {
            host: host.to_string(),
            port,
            username: username.filter(|u| !u.is_empty()),
            password,
        })
    }
}

fn parse_port(port: &str) -> Option<u16> {
    port.parse::<u16>().ok().filter(|p| *p > 0)
}

impl MqttConfig {
    /// Broker address with configured credentials taking precedence over
    /// those embedded in the URL.
    pub fn broker(&self) -> Result<BrokerAddress, BusError> {
        let mut broker = BrokerAddress::parse(&self.url)?;
        if let Some(username) = self.username.as_ref().filter(|u| !u.is_empty()) {
            broker.username = Some(username.clone());
            broker.password = self.password.clone();
        }
        Ok(broker)
    }

    /// A fresh client id: the configured prefix plus a random suffix.
    pub fn client_id(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.client_id_prefix, &suffix[..8])
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_period(&self) -> Duration {
        Duration::from_millis(self.reconnect_period_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), BusError> {
        self.broker()?;

        if self.namespace.is_empty()
            || self.namespace.contains(['+', '#'])
            || self.namespace.starts_with('/')
            || self.namespace.ends_with('/')
        {
            return Err(BusError::Config(format!(
                "invalid topic namespace '{}'",
                self.namespace
            )));
        }
        if self.client_id_prefix.is_empty() {
            return Err(BusError::Config(
                "client_id_prefix cannot be empty".to_string(),
            ));
        }
        if self.keep_alive_secs < 5 {
            return Err(BusError::Config(
                "keep_alive_secs must be at least 5".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.publish_timeout_ms == 0 {
            return Err(BusError::Config(
                "connect_timeout_ms and publish_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
