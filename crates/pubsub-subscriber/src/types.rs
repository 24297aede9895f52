//! Public types for the pubsub-subscriber crate.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

/// Suffix appended to a base channel name to form its presence channel.
pub const PRESENCE_SUFFIX: &str = "-pnpres";

/// Derive the presence channel name for a base channel (`"ch1"` → `"ch1-pnpres"`).
pub fn presence_channel(base: &str) -> String {
    format!("{base}{PRESENCE_SUFFIX}")
}

/// Backend-assigned ordering token.
///
/// Monotonically non-decreasing per connection; doubles as the resumption
/// position in the event stream.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timetoken(pub u64);

impl fmt::Display for Timetoken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Timetoken {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Timetoken)
    }
}

/// Resumption cursor: the last consumed timetoken plus the backend region
/// that issued it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub timetoken: Timetoken,
    pub region: u32,
}

impl Cursor {
    pub fn new(timetoken: Timetoken, region: u32) -> Self {
        Self { timetoken, region }
    }
}

/// Discriminant of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Signal,
    Presence,
    Status,
}

/// A message (or signal) body received on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message payload.
    pub data: serde_json::Value,
    /// Publisher's client identifier, when the backend reports one.
    pub publisher: Option<String>,
}

/// Occupancy change reported on a presence channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceAction {
    Join,
    Leave,
    Timeout,
    StateChange,
}

impl PresenceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceAction::Join => "join",
            PresenceAction::Leave => "leave",
            PresenceAction::Timeout => "timeout",
            PresenceAction::StateChange => "state-change",
        }
    }
}

/// Presence payload: who changed, how, and the resulting occupancy.
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    pub action: PresenceAction,
    pub occupant_id: Option<String>,
    pub occupancy: u64,
    /// State document attached by the occupant (state-change and join).
    pub state: Option<serde_json::Value>,
    /// Server timestamp in seconds, when present.
    pub timestamp: Option<i64>,
}

/// Status kinds reported to `on_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCategory {
    /// Channels/groups confirmed by a successful round-trip.
    Subscribed,
    /// Channels/groups removed after their leave was confirmed.
    Unsubscribed,
    /// The first transient failure of a failure streak.
    Reconnecting,
    /// A request succeeded after a `Reconnecting` streak.
    Reconnected,
    /// The loop gave up (failure bound exceeded or request rejected) and is
    /// paused until an explicit `start`.
    Disconnected,
    /// The backend invalidated the cursor; events in the lost range are gone.
    CursorReset,
}

/// Status payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub category: StatusCategory,
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    pub error: Option<String>,
}

impl Status {
    pub fn new(category: StatusCategory) -> Self {
        Self {
            category,
            channels: Vec::new(),
            groups: Vec::new(),
            error: None,
        }
    }

    pub fn is(&self, category: StatusCategory) -> bool {
        self.category == category
    }
}

/// Kind-specific content of an [`Envelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(Message),
    Signal(Message),
    Presence(Presence),
    Status(Status),
}

/// One delivered occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Logical channel. For presence this is the base channel; empty for
    /// status envelopes.
    pub channel: String,
    /// Channel the backend delivered on (`"ch1-pnpres"` for presence of `"ch1"`).
    pub actual_channel: String,
    /// Subscription that matched (a channel group, or a wildcard), if different.
    pub subscription: Option<String>,
    pub timetoken: Timetoken,
    pub event: Event,
}

impl Envelope {
    pub(crate) fn status(status: Status, timetoken: Timetoken) -> Self {
        Self {
            channel: String::new(),
            actual_channel: String::new(),
            subscription: None,
            timetoken,
            event: Event::Status(status),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.event {
            Event::Message(_) => EventKind::Message,
            Event::Signal(_) => EventKind::Signal,
            Event::Presence(_) => EventKind::Presence,
            Event::Status(_) => EventKind::Status,
        }
    }

    /// Message or signal body.
    pub fn message(&self) -> Option<&Message> {
        match &self.event {
            Event::Message(m) | Event::Signal(m) => Some(m),
            _ => None,
        }
    }

    pub fn presence(&self) -> Option<&Presence> {
        match &self.event {
            Event::Presence(p) => Some(p),
            _ => None,
        }
    }

    pub fn status_payload(&self) -> Option<&Status> {
        match &self.event {
            Event::Status(s) => Some(s),
            _ => None,
        }
    }

    /// True for a status envelope of the given category.
    pub fn is_status(&self, category: StatusCategory) -> bool {
        self.status_payload().is_some_and(|s| s.is(category))
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no matching event within {0:?}")]
    WaitTimeout(Duration),

    #[error("client shut down before a matching event arrived")]
    WaitAborted,

    #[error("no tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("config error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}
