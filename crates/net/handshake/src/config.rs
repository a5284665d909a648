//! Handshake configuration.

use std::{fmt, sync::Arc, time::Duration};

use accord_net_codec::{Encoder, QueryStringEncoder};
use accord_timers::{TimerRegistry, parse_duration};
use serde::Deserialize;
use uuid::Uuid;

use crate::{ConfigError, DEFAULT_HANDSHAKE_TIMEOUT};

/// Opaque identifier of a single negotiation, also used as its timer key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A random UUID v4.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces a fresh [`SessionId`] per negotiation.
pub type IdGenerator = Arc<dyn Fn() -> SessionId + Send + Sync>;

/// Runtime configuration of a [`Handshake`](crate::Handshake).
#[derive(Clone)]
pub struct HandshakeConfig {
    pub(crate) timeout: Option<Duration>,
    pub(crate) encoder: Arc<dyn Encoder>,
    pub(crate) id_generator: IdGenerator,
    pub(crate) timers: Option<Arc<dyn TimerRegistry>>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            encoder: Arc::new(QueryStringEncoder),
            id_generator: Arc::new(SessionId::random),
            timers: None,
        }
    }
}

impl HandshakeConfig {
    /// Builds a configuration from deserialized settings, keeping the defaults
    /// for everything the settings do not cover.
    pub fn from_settings(settings: &HandshakeSettings) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(timeout) = &settings.handshake_timeout {
            config.timeout = timeout.resolve()?;
        }
        Ok(config)
    }

    /// Sets the negotiation deadline. `None` or a zero duration disables it.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    pub fn without_timeout(self) -> Self {
        self.with_timeout(None)
    }

    pub fn with_encoder(mut self, encoder: impl Encoder + 'static) -> Self {
        self.encoder = Arc::new(encoder);
        self
    }

    pub fn with_id_generator<F>(mut self, id_generator: F) -> Self
    where
        F: Fn() -> SessionId + Send + Sync + 'static,
    {
        self.id_generator = Arc::new(id_generator);
        self
    }

    /// Uses `timers` instead of a [`TokioTimers`](accord_timers::TokioTimers)
    /// registry created on the current runtime.
    pub fn with_timers(mut self, timers: Arc<dyn TimerRegistry>) -> Self {
        self.timers = Some(timers);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("timeout", &self.timeout)
            .field("custom_timers", &self.timers.is_some())
            .finish_non_exhaustive()
    }
}

/// Serializable handshake settings, for embedding in a host configuration
/// file.
///
/// ```toml
/// handshake-timeout = "5 seconds"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HandshakeSettings {
    #[serde(default, alias = "handshake timeout", alias = "handshake_timeout")]
    pub handshake_timeout: Option<TimeoutSetting>,
}

/// A configured timeout: a flag, milliseconds, or a human readable duration.
///
/// `false`, `0`, an empty string and `"off"` disable the timeout. `true`
/// selects [`DEFAULT_HANDSHAKE_TIMEOUT`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TimeoutSetting {
    Enabled(bool),
    Millis(u64),
    Human(String),
}

impl TimeoutSetting {
    pub fn resolve(&self) -> Result<Option<Duration>, ConfigError> {
        let timeout = match self {
            Self::Enabled(false) => None,
            Self::Enabled(true) => Some(DEFAULT_HANDSHAKE_TIMEOUT),
            Self::Millis(millis) => Some(Duration::from_millis(*millis)),
            Self::Human(text) => {
                let text = text.trim();
                if text.is_empty() || text.eq_ignore_ascii_case("off") {
                    None
                } else {
                    Some(parse_duration(text)?)
                }
            }
        };
        Ok(timeout.filter(|timeout| !timeout.is_zero()))
    }
}
