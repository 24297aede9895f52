//! Backend capability consumed by the poll loop.
//!
//! A [`Transport`] turns one [`LongPollRequest`] into a batch of raw,
//! timestamped events plus the cursor to continue from. Everything about the
//! wire (URLs, encoding, auth) lives behind this trait.

use std::time::Duration;

use async_trait::async_trait;

use crate::types::{Cursor, PRESENCE_SUFFIX, Timetoken};

/// A channel or channel group named in a request, with its presence interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub with_presence: bool,
}

/// Parameters of a single long-poll.
#[derive(Debug, Clone, PartialEq)]
pub struct LongPollRequest {
    pub channels: Vec<Target>,
    pub groups: Vec<Target>,
    /// `None` asks the backend for "now": it answers immediately with a fresh
    /// cursor (a handshake).
    pub cursor: Option<Cursor>,
    /// Long-poll window the backend may hold the request for.
    pub timeout: Duration,
}

impl LongPollRequest {
    pub fn is_handshake(&self) -> bool {
        self.cursor.is_none()
    }

    /// Channel names as sent on the wire, presence channels included.
    pub fn wire_channels(&self) -> Vec<String> {
        expand(&self.channels)
    }

    /// Group names as sent on the wire, presence groups included.
    pub fn wire_groups(&self) -> Vec<String> {
        expand(&self.groups)
    }
}

fn expand(targets: &[Target]) -> Vec<String> {
    let mut names = Vec::with_capacity(targets.len() * 2);
    for t in targets {
        names.push(t.name.clone());
        if t.with_presence {
            names.push(format!("{}{PRESENCE_SUFFIX}", t.name));
        }
    }
    names
}

/// An undecoded event as returned by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// Channel the event was published on (may carry the presence suffix).
    pub channel: String,
    /// Subscription that matched, when it differs from `channel`.
    pub subscription: Option<String>,
    pub timetoken: Timetoken,
    /// Backend message type; `1` marks a signal.
    pub message_type: Option<i32>,
    pub publisher: Option<String>,
    pub payload: serde_json::Value,
}

/// Result of a successful long-poll.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LongPollResponse {
    pub cursor: Cursor,
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("cursor invalidated: {0}")]
    CursorInvalidated(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    ///
    /// `CursorInvalidated` is not retriable as-is: the request must be
    /// re-issued from a fresh cursor.
    pub fn is_retriable(&self) -> bool {
        match self {
            TransportError::Timeout
            | TransportError::Network(_)
            | TransportError::Server { .. }
            | TransportError::Decode(_) => true,
            TransportError::Rejected { .. } | TransportError::CursorInvalidated(_) => false,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Issue one long-poll. May block for up to `request.timeout`, or return
    /// early as soon as events are available.
    async fn long_poll(&self, request: &LongPollRequest)
    -> Result<LongPollResponse, TransportError>;

    /// Announce that this client left the given channels and groups.
    async fn leave(&self, channels: &[String], groups: &[String]) -> Result<(), TransportError> {
        let _ = (channels, groups);
        Ok(())
    }

    /// Publish a message. Used by callers only; the poll loop never publishes.
    async fn publish(
        &self,
        channel: &str,
        payload: &serde_json::Value,
    ) -> Result<Timetoken, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, with_presence: bool) -> Target {
        Target {
            name: name.to_string(),
            with_presence,
        }
    }

    #[test]
    fn wire_names_include_presence_channels() {
        let req = LongPollRequest {
            channels: vec![target("a", true), target("b", false)],
            groups: vec![target("g", true)],
            cursor: None,
            timeout: Duration::from_secs(1),
        };
        assert!(req.is_handshake());
        assert_eq!(req.wire_channels(), vec!["a", "a-pnpres", "b"]);
        assert_eq!(req.wire_groups(), vec!["g", "g-pnpres"]);
    }

    #[test]
    fn retriable_classification() {
        assert!(TransportError::Timeout.is_retriable());
        assert!(TransportError::Network("reset".into()).is_retriable());
        assert!(
            TransportError::Server {
                status: 503,
                message: String::new()
            }
            .is_retriable()
        );
        assert!(
            !TransportError::Rejected {
                status: 403,
                message: "Forbidden".into()
            }
            .is_retriable()
        );
        assert!(!TransportError::CursorInvalidated("too old".into()).is_retriable());
    }
}
