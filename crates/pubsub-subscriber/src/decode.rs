//! Raw backend events → [`Envelope`]s.

use std::collections::{HashSet, VecDeque};

use serde::Deserialize;

use crate::transport::RawEvent;
use crate::types::{Envelope, Event, Message, PRESENCE_SUFFIX, Presence, PresenceAction, Timetoken};

/// Backend message type marking a signal.
const MESSAGE_TYPE_SIGNAL: i32 = 1;

/// Presence payload as published on `<channel>-pnpres`.
#[derive(Debug, Deserialize)]
struct PresencePayload {
    action: PresenceAction,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    occupancy: u64,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

fn strip_presence(name: &str) -> Option<&str> {
    name.strip_suffix(PRESENCE_SUFFIX)
}

/// Decode one raw event. Events on a presence channel become
/// [`Event::Presence`] keyed by their base channel; `None` if such a payload
/// is not a presence document.
pub(crate) fn decode_event(raw: RawEvent) -> Option<Envelope> {
    let RawEvent {
        channel,
        subscription,
        timetoken,
        message_type,
        publisher,
        payload,
    } = raw;

    let subscription = subscription
        .filter(|s| *s != channel)
        .map(|s| strip_presence(&s).map(str::to_string).unwrap_or(s));

    if let Some(base) = strip_presence(&channel) {
        let presence: PresencePayload = match serde_json::from_value(payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(channel = %channel, %timetoken, "Dropping undecodable presence event: {e}");
                return None;
            }
        };
        return Some(Envelope {
            channel: base.to_string(),
            actual_channel: channel.clone(),
            subscription,
            timetoken,
            event: Event::Presence(Presence {
                action: presence.action,
                occupant_id: presence.uuid,
                occupancy: presence.occupancy,
                state: presence.data,
                timestamp: presence.timestamp,
            }),
        });
    }

    let message = Message {
        data: payload,
        publisher,
    };
    let event = if message_type == Some(MESSAGE_TYPE_SIGNAL) {
        Event::Signal(message)
    } else {
        Event::Message(message)
    };
    Some(Envelope {
        actual_channel: channel.clone(),
        channel,
        subscription,
        timetoken,
        event,
    })
}

type DedupeKey = (String, Timetoken, Option<String>);

/// Bounded memory of recently delivered events.
#[derive(Debug)]
struct DedupeCache {
    capacity: usize,
    order: VecDeque<DedupeKey>,
    seen: HashSet<DedupeKey>,
}

impl DedupeCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Returns false if the key was already seen.
    fn insert(&mut self, key: DedupeKey) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }
}

/// Turns response batches into ordered, de-duplicated envelopes.
#[derive(Debug)]
pub(crate) struct Decoder {
    dedupe: DedupeCache,
}

impl Decoder {
    pub fn new(dedupe_cache_size: usize) -> Self {
        Self {
            dedupe: DedupeCache::new(dedupe_cache_size),
        }
    }

    /// Decode a batch in timetoken order. Events older than `floor` (the
    /// last consumed cursor) and duplicates are dropped.
    pub fn decode_batch(&mut self, mut events: Vec<RawEvent>, floor: Option<Timetoken>) -> Vec<Envelope> {
        events.sort_by_key(|e| e.timetoken);
        let mut out = Vec::with_capacity(events.len());
        for raw in events {
            if let Some(floor) = floor
                && raw.timetoken < floor
            {
                tracing::warn!(
                    channel = %raw.channel,
                    timetoken = %raw.timetoken,
                    cursor = %floor,
                    "Dropping event older than the consumed cursor"
                );
                continue;
            }
            let key = (raw.channel.clone(), raw.timetoken, raw.publisher.clone());
            if !self.dedupe.insert(key) {
                tracing::debug!(channel = %raw.channel, timetoken = %raw.timetoken, "Dropping duplicate event");
                continue;
            }
            if let Some(env) = decode_event(raw) {
                out.push(env);
            }
        }
        out
    }
}
