//! Relay connection options

use crate::reconnect::ReconnectConfig;
use iap_proto::DEFAULT_RECEIVE_WINDOW;
use iap_transport::default_user_agent;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for one relay connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayOptions {
    /// Upper bound on establishing the session, retries included
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Bytes we are willing to buffer before the application reads them
    pub receive_window: u32,

    /// Interval between keep-alive pings (None disables them)
    #[serde(with = "option_duration_secs")]
    pub keep_alive_interval: Option<Duration>,

    /// Backoff for initial connect retries and for session resumption
    pub reconnect: ReconnectConfig,

    pub user_agent: String,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            receive_window: DEFAULT_RECEIVE_WINDOW,
            keep_alive_interval: Some(Duration::from_secs(30)),
            reconnect: ReconnectConfig::default(),
            user_agent: default_user_agent(),
        }
    }
}

impl RelayOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_receive_window(mut self, window: u32) -> Self {
        self.receive_window = window;
        self
    }

    pub fn with_keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// `Duration` as fractional seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// `Option<Duration>` as fractional seconds or null
pub mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durations_serialize_as_seconds() {
        let options = RelayOptions::default()
            .with_connect_timeout(Duration::from_millis(1500))
            .with_keep_alive(None);

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["connect_timeout"], 1.5);
        assert!(json["keep_alive_interval"].is_null());

        let parsed: RelayOptions = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let parsed: RelayOptions =
            serde_json::from_str(r#"{ "receive_window": 1024 }"#).unwrap();
        assert_eq!(parsed.receive_window, 1024);
        assert_eq!(parsed.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_negative_duration_is_rejected() {
        let result: Result<RelayOptions, _> =
            serde_json::from_str(r#"{ "connect_timeout": -1 }"#);
        assert!(result.is_err());
    }
}
