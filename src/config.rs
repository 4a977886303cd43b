//! Client configuration.
//!
//! Everything can be set programmatically through the consuming builder methods on
//! [`ClientConfig`], or loaded from TOML:
//!
//! ```toml
//! url = "ws://127.0.0.1:6700"
//! access_token = "secret"
//! request_timeout_ms = 10000
//! outbound_buffer = 64
//!
//! [reconnect]
//! enabled = true
//! max_attempts = 5
//! backoff = { kind = "exponential", initial_ms = 500, max_ms = 10000, factor = 2.0 }
//! ```
use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    codec::{CodecOptions, Strictness, CQ_PREFIX},
    error::Result,
};

const DEFAULT_URL: &str = "ws://127.0.0.1:6700";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// (De)serializes a [`Duration`] as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Settings for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Websocket endpoint of the server.
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` during the handshake.
    pub access_token: Option<String>,
    /// Deadline for calls made without an explicit timeout.
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// When set, frames submitted while disconnected are queued (at most this many) instead of
    /// failing with `NotConnected`.
    pub outbound_buffer: Option<usize>,
    /// Prefix written before tag kinds when serializing messages.
    pub tag_prefix: String,
    pub strictness: Strictness,
}

/// Whether and how to reconnect after the connection drops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub backoff: Backoff,
    /// Consecutive failed reconnect attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

/// Delay curve between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        #[serde(rename = "delay_ms", with = "duration_ms")]
        delay: Duration,
    },
    Exponential {
        #[serde(rename = "initial_ms", with = "duration_ms")]
        initial: Duration,
        #[serde(rename = "max_ms", with = "duration_ms")]
        max: Duration,
        factor: f64,
    },
}

impl Backoff {
    /// The wait before reconnect attempt `attempt`, counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential {
                initial,
                max,
                factor,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let scaled = initial.as_secs_f64() * factor.max(1.0).powi(exponent);
                if !scaled.is_finite() || scaled >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial: DEFAULT_INITIAL_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
            factor: 2.0,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            backoff: Backoff::default(),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            access_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            outbound_buffer: None,
            tag_prefix: CQ_PREFIX.to_string(),
            strictness: Strictness::default(),
        }
    }
}

impl ClientConfig {
    /// Default settings for the given endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self::default().url(url)
    }

    /// Parses a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    #[must_use]
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    #[must_use]
    pub fn outbound_buffer(mut self, capacity: usize) -> Self {
        self.outbound_buffer = Some(capacity);
        self
    }

    #[must_use]
    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    /// Codec settings derived from `tag_prefix` and `strictness`.
    pub fn codec(&self) -> CodecOptions {
        CodecOptions {
            prefix: self.tag_prefix.clone(),
            strictness: self.strictness,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            factor: 2.0,
        };
        let delays: Vec<_> = (1..=6).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed {
            delay: Duration::from_millis(250),
        };
        assert_eq!(backoff.delay(1), backoff.delay(50));
    }

    #[test]
    fn parses_toml() {
        let config = ClientConfig::from_toml_str(
            r#"
            url = "ws://bot.local:8080"
            access_token = "secret"
            request_timeout_ms = 2000
            outbound_buffer = 16
            strictness = "strict"

            [reconnect]
            max_attempts = 3
            backoff = { kind = "fixed", delay_ms = 500 }
            "#,
        )
        .unwrap();
        assert_eq!(config.url, "ws://bot.local:8080");
        assert_eq!(config.access_token.as_deref(), Some("secret"));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.outbound_buffer, Some(16));
        assert_eq!(config.strictness, Strictness::Strict);
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(
            config.reconnect.backoff,
            Backoff::Fixed {
                delay: Duration::from_millis(500)
            }
        );
        assert_eq!(config.tag_prefix, CQ_PREFIX);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(ClientConfig::from_toml_str("nope = 1").is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "url = \"ws://example:6700\"").unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config, ClientConfig::new("ws://example:6700"));
        assert!(ClientConfig::from_file("/nonexistent/cqrpc.toml").is_err());
    }

    #[test]
    fn builder_methods() {
        let config = ClientConfig::new("ws://h:1")
            .access_token("t")
            .request_timeout(Duration::from_secs(2))
            .reconnect(ReconnectPolicy::disabled())
            .outbound_buffer(4);
        assert!(!config.reconnect.enabled);
        assert_eq!(config.outbound_buffer, Some(4));
        assert_eq!(config.codec(), CodecOptions::cq());
    }
}
