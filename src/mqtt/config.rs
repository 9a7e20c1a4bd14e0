use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::bus::BusError;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_COMMAND_TOPIC: &str = "/pc2000_joint_command";

/// Where a control bus (or relay) lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Mqtt { host: String, port: u16 },
    Memory,
}

impl Endpoint {
    /// Accepts `mqtt://host[:port]`, bare `host[:port]` and `memory://`
    pub fn parse(url: &str) -> Result<Self, BusError> {
        let url = url.trim();
        if url == "memory://" || url == "memory" {
            return Ok(Endpoint::Memory);
        }

        let rest = match url.split_once("://") {
            Some(("mqtt" | "tcp", rest)) => rest,
            Some((scheme, _)) => {
                return Err(BusError::InvalidEndpoint(format!(
                    "unsupported scheme '{}' in '{}'",
                    scheme, url
                )))
            }
            None => url,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    BusError::InvalidEndpoint(format!("bad port in '{}': {}", url, e))
                })?;
                (host, port)
            }
            None => (rest, DEFAULT_MQTT_PORT),
        };

        if host.is_empty() {
            return Err(BusError::InvalidEndpoint(format!("missing host in '{}'", url)));
        }

        Ok(Endpoint::Mqtt {
            host: host.to_string(),
            port,
        })
    }
}

/// Control bus connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub url: String,
    pub topic: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost:1883".to_string(),
            topic: DEFAULT_COMMAND_TOPIC.to_string(),
            client_id: "excavlink-machine".to_string(),
            keep_alive_secs: 5,
            reconnect_delay_ms: 1000,
        }
    }
}

impl BusConfig {
    pub fn endpoint(&self) -> Result<Endpoint, BusError> {
        Endpoint::parse(&self.url)
    }
}

/// Builds client options for an MQTT endpoint
pub fn mqtt_options(
    host: &str,
    port: u16,
    client_id: &str,
    keep_alive: Duration,
) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(keep_alive);
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_forms() {
        assert_eq!(
            Endpoint::parse("mqtt://broker.local:1884").unwrap(),
            Endpoint::Mqtt {
                host: "broker.local".into(),
                port: 1884
            }
        );
        assert_eq!(
            Endpoint::parse("10.0.0.2").unwrap(),
            Endpoint::Mqtt {
                host: "10.0.0.2".into(),
                port: DEFAULT_MQTT_PORT
            }
        );
        assert_eq!(Endpoint::parse("memory://").unwrap(), Endpoint::Memory);
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(Endpoint::parse("ws://broker:80").is_err());
        assert!(Endpoint::parse("mqtt://broker:notaport").is_err());
        assert!(Endpoint::parse("mqtt://:1883").is_err());
    }
}
