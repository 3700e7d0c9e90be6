use std::env;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub multicast: MulticastConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// Root of every published topic, e.g. "/mibridge"
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Network interface to join the group on. `None` lets the kernel pick.
    pub interface: Option<String>,
    pub group: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub queue_capacity: usize,
    pub drain_timeout_secs: u64,
}

/// Multicast group the gateways announce on.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 50);
pub const DEFAULT_MULTICAST_PORT: u16 = 9898;

fn env_required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, String> {
    lookup(key).ok_or_else(|| format!("{key} environment variable is required"))
}

fn env_optional(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, String> {
    match env_optional(lookup, key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("{key} has an invalid value: {raw}")),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_required(&lookup, "MQTT_BROKER_HOST")?,
                broker_port: env_or_default(&lookup, "MQTT_BROKER_PORT", 1883)?,
                username: env_optional(&lookup, "MQTT_USERNAME"),
                password: env_optional(&lookup, "MQTT_PASSWORD"),
                client_id: env_or_default(&lookup, "MQTT_CLIENT_ID", "mibridge".to_string())?,
                topic_prefix: env_or_default(
                    &lookup,
                    "MQTT_TOPIC_PREFIX",
                    "/mibridge".to_string(),
                )?,
                keep_alive_secs: env_or_default(&lookup, "MQTT_KEEP_ALIVE_SECS", 30)?,
                connect_timeout_secs: env_or_default(&lookup, "MQTT_CONNECT_TIMEOUT_SECS", 10)?,
            },
            multicast: MulticastConfig {
                interface: env_optional(&lookup, "MULTICAST_INTERFACE"),
                group: env_or_default(&lookup, "MULTICAST_GROUP", DEFAULT_MULTICAST_GROUP)?,
                port: env_or_default(&lookup, "MULTICAST_PORT", DEFAULT_MULTICAST_PORT)?,
            },
            bridge: BridgeConfig {
                queue_capacity: env_or_default(&lookup, "BRIDGE_QUEUE_CAPACITY", 1024)?,
                drain_timeout_secs: env_or_default(&lookup, "BRIDGE_DRAIN_TIMEOUT_SECS", 5)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.mqtt.client_id.is_empty() {
            return Err("MQTT_CLIENT_ID must not be empty".into());
        }
        if self.mqtt.topic_prefix.ends_with('/') {
            return Err("MQTT_TOPIC_PREFIX must not end with '/'".into());
        }
        if self.mqtt.keep_alive_secs == 0 {
            return Err("MQTT_KEEP_ALIVE_SECS must be > 0".into());
        }
        if self.mqtt.connect_timeout_secs == 0 {
            return Err("MQTT_CONNECT_TIMEOUT_SECS must be > 0".into());
        }
        if !self.multicast.group.is_multicast() {
            return Err(format!(
                "MULTICAST_GROUP {} is not a multicast address",
                self.multicast.group
            ));
        }
        if self.bridge.queue_capacity == 0 {
            return Err("BRIDGE_QUEUE_CAPACITY must be > 0".into());
        }
        Ok(())
    }
}

impl MqttConfig {
    pub fn bridge_status_topic(&self) -> String {
        format!("{}/bridge_status", self.topic_prefix)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl BridgeConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
