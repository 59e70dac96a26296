use std::{collections::BTreeMap, time::Duration};

use thiserror::Error;

/// The only supported backend.
pub const BACKEND_STATSD: &str = "statsd";

/// The only supported transport mode.
pub const TRANSPORT_TCP: &str = "tcp";

pub(crate) const DEFAULT_HOST: &str = "127.0.0.1";
pub(crate) const DEFAULT_PORT: u16 = 8125;
pub(crate) const DEFAULT_MAX_QUEUE_POINTS: usize = 1000;
pub(crate) const DEFAULT_MAX_QUEUE_AGE_MS: u64 = 2000;

/// Errors found while validating a [`ClientConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The backend is not `statsd`.
    #[error("unsupported backend \"{backend}\" (expected \"statsd\")")]
    UnsupportedBackend {
        /// Configured backend.
        backend: String,
    },

    /// The transport mode is not `tcp`.
    #[error("unsupported transport mode \"{mode}\" (expected \"tcp\")")]
    UnsupportedTransport {
        /// Configured transport mode.
        mode: String,
    },

    /// The host is empty.
    #[error("host must not be empty")]
    EmptyHost,

    /// The port is zero.
    #[error("port must be between 1 and 65535")]
    InvalidPort,

    /// A `stat_map` key contains characters outside of `[-A-Za-z0-9_.]`, or is empty.
    #[error("invalid stat name \"{name}\" (expected one or more of [-A-Za-z0-9_.])")]
    InvalidStatName {
        /// The offending key.
        name: String,
    },
}

/// Client configuration.
///
/// Every field has a default, so a configuration only needs to spell out what differs from it, which in practice is
/// at least `stat_map`: basenames missing from it are never sent.
///
/// With the `serde` feature enabled, the configuration can be deserialized, with missing fields taking their default
/// values.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct ClientConfig {
    /// Metrics backend. Must be `statsd`.
    pub backend: String,

    /// Transport to the backend. Must be `tcp`.
    pub transport_mode: String,

    /// Host of the statsd aggregator.
    ///
    /// Defaults to `127.0.0.1`.
    pub host: String,

    /// Port of the statsd aggregator.
    ///
    /// Defaults to `8125`.
    pub port: u16,

    /// Maximum number of points held while disconnected.
    ///
    /// Defaults to 1000.
    pub max_queue_points: usize,

    /// Maximum age, in milliseconds, of the points held while disconnected, measured from the oldest one.
    ///
    /// Defaults to 2000.
    pub max_queue_age_ms: u64,

    /// Stat patterns to emit for each basename.
    pub stat_map: BTreeMap<String, Vec<String>>,
}

impl ClientConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found, if any.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend != BACKEND_STATSD {
            return Err(ConfigError::UnsupportedBackend { backend: self.backend.clone() });
        }

        if self.transport_mode != TRANSPORT_TCP {
            return Err(ConfigError::UnsupportedTransport { mode: self.transport_mode.clone() });
        }

        if self.host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if let Some(name) = self.stat_map.keys().find(|name| !is_valid_stat_name(name)) {
            return Err(ConfigError::InvalidStatName { name: name.clone() });
        }

        Ok(())
    }

    pub(crate) fn max_queue_age(&self) -> Duration {
        Duration::from_millis(self.max_queue_age_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            backend: BACKEND_STATSD.to_string(),
            transport_mode: TRANSPORT_TCP.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_queue_points: DEFAULT_MAX_QUEUE_POINTS,
            max_queue_age_ms: DEFAULT_MAX_QUEUE_AGE_MS,
            stat_map: BTreeMap::new(),
        }
    }
}

fn is_valid_stat_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use super::{ClientConfig, ConfigError};

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8125);
        assert_eq!(config.max_queue_points, 1000);
        assert_eq!(config.max_queue_age_ms, 2000);
    }

    #[test]
    fn rejects_invalid_fields() {
        // Cases are defined as: configuration, expected error.
        let cases = [
            (
                ClientConfig { backend: "graphite".into(), ..Default::default() },
                ConfigError::UnsupportedBackend { backend: "graphite".into() },
            ),
            (
                ClientConfig { transport_mode: "udp".into(), ..Default::default() },
                ConfigError::UnsupportedTransport { mode: "udp".into() },
            ),
            (ClientConfig { host: String::new(), ..Default::default() }, ConfigError::EmptyHost),
            (ClientConfig { port: 0, ..Default::default() }, ConfigError::InvalidPort),
            (
                ClientConfig {
                    stat_map: [("bad name".to_string(), vec!["%_name".to_string()])].into(),
                    ..Default::default()
                },
                ConfigError::InvalidStatName { name: "bad name".into() },
            ),
            (
                ClientConfig { stat_map: [(String::new(), Vec::new())].into(), ..Default::default() },
                ConfigError::InvalidStatName { name: String::new() },
            ),
        ];

        for (config, expected) in cases {
            assert_eq!(config.validate(), Err(expected));
        }
    }

    #[test]
    fn accepts_stat_names() {
        let config = ClientConfig {
            stat_map: [
                ("myapp.requests".to_string(), vec!["%_name.byhost.%host".to_string()]),
                ("my-app_2.latency".to_string(), Vec::new()),
            ]
            .into(),
            max_queue_points: 0,
            max_queue_age_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserialize_with_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "backend": "statsd",
                "transport_mode": "tcp",
                "port": 9125,
                "stat_map": {
                    "myapp.requests": ["%_name.byhost.%host", "%_name.bymethod.%method"]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9125);
        assert_eq!(config.max_queue_points, 1000);
        assert_eq!(config.stat_map["myapp.requests"].len(), 2);
        assert_eq!(config.validate(), Ok(()));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserialize_rejects_out_of_range_port() {
        assert!(serde_json::from_str::<ClientConfig>(r#"{ "port": 70000 }"#).is_err());
        assert!(serde_json::from_str::<ClientConfig>(r#"{ "max_queue_points": -1 }"#).is_err());
    }
}
