//! Handshake payload negotiation.
//!
//! A [`Handshake`] assembles the payload a server sends to a connecting peer,
//! lets the application enrich or reject it, bounds how long that may take,
//! and encodes the result for the transport. Errors are written into the
//! payload's `error` field so the peer learns why a handshake failed even when
//! the transport has no separate error channel.
//!
//! # Flow
//!
//! 1. **Configure**: [`Handshake::set`] registers default fields, either static
//!    values or producers evaluated against the handshake's context.
//! 2. **Refresh**: [`Handshake::refresh`] evaluates the template into the live
//!    payload. Construction refreshes once.
//! 3. **Negotiate**: [`Handshake::negotiate`] clones the live payload, runs the
//!    [`Modify`] step, races it against the deadline and delivers exactly one
//!    encoded outcome.
//! 4. **Dispose**: [`Handshake::dispose`] cancels every deadline and releases
//!    all state.
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> Result<(), accord_net_handshake::HandshakeError> {
//! use accord_net_handshake::{FieldValue, Handshake, HandshakeConfig, Modify};
//! use serde_json::json;
//!
//! struct Server {
//!     version: &'static str,
//! }
//!
//! let handshake = Handshake::new(Server { version: "1.4.0" }, HandshakeConfig::default())?;
//! handshake
//!     .set("pingInterval", 25_000)?
//!     .set("version", FieldValue::producer(|server: &Server| json!(server.version)))?
//!     .refresh()?;
//!
//! let outcome = handshake
//!     .negotiate_async(Modify::sync(|_, payload| {
//!         payload.insert("sid".into(), json!("abc"));
//!         Ok(())
//!     }))?
//!     .await?;
//! assert_eq!(outcome.encoded, "pingInterval=25000&version=1.4.0&sid=abc");
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub use accord_net_codec::{EncodeError, Encoder, JsonEncoder, Payload, QueryStringEncoder, Value};
pub use accord_timers::{TimerRegistry, TokioTimers};

mod boundary;

mod config;
pub use config::{HandshakeConfig, HandshakeSettings, IdGenerator, SessionId, TimeoutSetting};

mod error;
pub use error::{ConfigError, HandshakeError, ModifyError, NegotiationError};

mod handshake;
pub use handshake::{Handshake, Negotiation, Outcome};

mod metrics;

mod session;
pub use session::{Done, Modify, WorkingPayload};

mod template;
pub use template::{FieldValue, Producer};

/// Timeout applied to every negotiation unless configured otherwise.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload field that carries a failed handshake's error message.
pub const ERROR_FIELD: &str = "error";
