//! Error taxonomy for calls into remote dependencies.
//!
//! Every failure observable at this crate's boundary is a [`ServiceError`].
//! Each variant carries a stable [`ErrorKind`] tag so policies can be
//! configured by kind: circuit breakers take a set of excluded kinds that
//! never count as failures (client-side 4xx must not trip a breaker), and the
//! retry handler consults [`ServiceError::is_retryable`] before sleeping.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::circuit_breaker::CircuitState;

/// Unified error type for guarded remote calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The circuit breaker refused the call without invoking the operation.
    #[error("circuit breaker '{name}' is {state}")]
    CircuitOpen { name: String, state: CircuitState },
    /// The operation exceeded its deadline.
    #[error("operation timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The remote endpoint refused the connection.
    #[error("connection refused")]
    ConnectRefused,
    /// The remote returned a 5xx status.
    #[error("server error (HTTP {0})")]
    Server(u16),
    /// The remote returned a 4xx status. Client errors are the caller's
    /// problem and are excluded from breaker accounting by default.
    #[error("client error (HTTP {0})")]
    Client(u16),
    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// The message broker was unreachable or rejected the operation.
    #[error("broker error: {0}")]
    Broker(String),
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Kind tag for a [`ServiceError`], used in exclusion sets and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CircuitOpen,
    Timeout,
    ConnectRefused,
    Server,
    Client,
    Decode,
    Broker,
    Other,
}

impl ServiceError {
    /// The kind tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConnectRefused => ErrorKind::ConnectRefused,
            Self::Server(_) => ErrorKind::Server,
            Self::Client(_) => ErrorKind::Client,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Broker(_) => ErrorKind::Broker,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// Breaker rejections are never retried (the breaker already decided),
    /// and client-side or decode failures are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout
                | ErrorKind::ConnectRefused
                | ErrorKind::Server
                | ErrorKind::Broker
                | ErrorKind::Other
        )
    }

    /// Check if this error is a circuit-breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(ServiceError::ConnectRefused.kind(), ErrorKind::ConnectRefused);
        assert_eq!(ServiceError::Server(502).kind(), ErrorKind::Server);
        assert_eq!(ServiceError::Client(422).kind(), ErrorKind::Client);
        assert_eq!(ServiceError::Decode("bad json".into()).kind(), ErrorKind::Decode);
        assert_eq!(ServiceError::Broker("down".into()).kind(), ErrorKind::Broker);
        assert_eq!(ServiceError::Other("boom".into()).kind(), ErrorKind::Other);
    }

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(ServiceError::ConnectRefused.is_retryable());
        assert!(ServiceError::Server(500).is_retryable());
        assert!(ServiceError::Broker("down".into()).is_retryable());
        assert!(ServiceError::Timeout {
            elapsed: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
        }
        .is_retryable());

        assert!(!ServiceError::Client(400).is_retryable());
        assert!(!ServiceError::Decode("truncated".into()).is_retryable());
        assert!(!ServiceError::CircuitOpen {
            name: "detector".into(),
            state: CircuitState::Open,
        }
        .is_retryable());
    }

    #[test]
    fn circuit_open_display_names_the_breaker() {
        let err = ServiceError::CircuitOpen { name: "risk_llm".into(), state: CircuitState::Open };
        let msg = err.to_string();
        assert!(msg.contains("risk_llm"));
        assert!(msg.contains("open"));
    }

    #[test]
    fn kind_tags_deserialize_from_snake_case() {
        let kinds: Vec<ErrorKind> =
            serde_json::from_str(r#"["client", "connect_refused", "server"]"#).unwrap();
        assert_eq!(kinds, vec![ErrorKind::Client, ErrorKind::ConnectRefused, ErrorKind::Server]);
    }
}
