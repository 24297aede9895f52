//! In-process loopback backend.
//!
//! [`MemoryBackend`] keeps an append-only event log and serves long-polls
//! from it with the same semantics as the HTTP backend: handshakes answer
//! "now" immediately, polls hold until something newer than the cursor is
//! published or the window elapses, and subscribing clients show up as
//! presence occupants. Faults and cursor invalidation can be injected.
//!
//! ```
//! # async fn example() -> Result<(), pubsub_subscriber::Error> {
//! use pubsub_subscriber::{Client, ClientConfig, SubscribeOptions};
//! use pubsub_subscriber::memory::MemoryBackend;
//!
//! let backend = MemoryBackend::new();
//! let client = Client::new(backend.transport("reader"), ClientConfig::default())?;
//! client.subscribe(SubscribeOptions::channels(["ch1"]));
//! backend.publish("writer", "ch1", serde_json::json!({"text": "hello"}));
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::transport::{LongPollRequest, LongPollResponse, RawEvent, Transport, TransportError};
use crate::types::{Cursor, PresenceAction, Timetoken, presence_channel};

/// First timetoken handed out (10ns units since the epoch, late 2023).
const START_TIMETOKEN: u64 = 17_000_000_000_000_000;
const REGION: u32 = 1;
/// Most events returned by one long-poll; the rest follow on the next.
const MAX_BATCH: usize = 100;
const MESSAGE_TYPE_SIGNAL: i32 = 1;

#[derive(Debug, Clone)]
struct StoredEvent {
    channel: String,
    timetoken: Timetoken,
    publisher: Option<String>,
    message_type: Option<i32>,
    payload: Value,
}

#[derive(Debug)]
struct BackendState {
    clock: u64,
    log: Vec<StoredEvent>,
    /// channel -> occupant ids
    occupants: BTreeMap<String, BTreeSet<String>>,
    /// group -> member channels
    groups: BTreeMap<String, BTreeSet<String>>,
    faults: VecDeque<TransportError>,
    requests: Vec<(String, LongPollRequest)>,
    /// Cursors older than this are rejected.
    invalid_before: Option<Timetoken>,
}

impl BackendState {
    fn now(&self) -> Timetoken {
        Timetoken(self.clock)
    }

    fn append(
        &mut self,
        channel: &str,
        publisher: Option<&str>,
        message_type: Option<i32>,
        payload: Value,
    ) -> Timetoken {
        self.clock += 1;
        let timetoken = Timetoken(self.clock);
        self.log.push(StoredEvent {
            channel: channel.to_string(),
            timetoken,
            publisher: publisher.map(str::to_string),
            message_type,
            payload,
        });
        timetoken
    }

    fn append_presence(
        &mut self,
        channel: &str,
        action: PresenceAction,
        uuid: &str,
        state: Option<Value>,
    ) -> Timetoken {
        let occupancy = self.occupants.get(channel).map_or(0, BTreeSet::len);
        let mut payload = json!({
            "action": action.as_str(),
            "uuid": uuid,
            "occupancy": occupancy,
            "timestamp": self.clock / 10_000_000,
        });
        if let (Some(state), Some(obj)) = (state, payload.as_object_mut()) {
            obj.insert("data".to_string(), state);
        }
        self.append(&presence_channel(channel), None, None, payload)
    }

    /// Base channels a request covers, groups expanded.
    fn covered_channels(&self, request: &LongPollRequest) -> BTreeSet<String> {
        let mut channels: BTreeSet<String> =
            request.channels.iter().map(|t| t.name.clone()).collect();
        for group in &request.groups {
            if let Some(members) = self.groups.get(&group.name) {
                channels.extend(members.iter().cloned());
            }
        }
        channels
    }

    fn join(&mut self, uuid: &str, request: &LongPollRequest) -> bool {
        let mut joined = false;
        for channel in self.covered_channels(request) {
            if self
                .occupants
                .entry(channel.clone())
                .or_default()
                .insert(uuid.to_string())
            {
                self.append_presence(&channel, PresenceAction::Join, uuid, None);
                joined = true;
            }
        }
        joined
    }

    fn remove_occupant(&mut self, channel: &str, uuid: &str, action: PresenceAction) -> bool {
        let removed = self
            .occupants
            .get_mut(channel)
            .is_some_and(|set| set.remove(uuid));
        if removed {
            self.append_presence(channel, action, uuid, None);
        }
        removed
    }

    /// Wire channel name -> subscription that matched it, for everything a
    /// request listens on.
    fn routes(&self, request: &LongPollRequest) -> BTreeMap<String, Option<String>> {
        let mut routes = BTreeMap::new();
        for group in &request.groups {
            let Some(members) = self.groups.get(&group.name) else {
                continue;
            };
            for member in members {
                routes.insert(member.clone(), Some(group.name.clone()));
                if group.with_presence {
                    routes.insert(
                        presence_channel(member),
                        Some(presence_channel(&group.name)),
                    );
                }
            }
        }
        // Direct subscriptions win over group membership.
        for channel in &request.channels {
            routes.insert(channel.name.clone(), None);
            if channel.with_presence {
                routes.insert(presence_channel(&channel.name), None);
            }
        }
        routes
    }

    fn matching(&self, request: &LongPollRequest, after: Timetoken) -> Vec<RawEvent> {
        let routes = self.routes(request);
        self.log
            .iter()
            .filter(|e| e.timetoken > after)
            .filter_map(|e| {
                let subscription = routes.get(&e.channel)?;
                Some(RawEvent {
                    channel: e.channel.clone(),
                    subscription: subscription.clone(),
                    timetoken: e.timetoken,
                    message_type: e.message_type,
                    publisher: e.publisher.clone(),
                    payload: e.payload.clone(),
                })
            })
            .take(MAX_BATCH)
            .collect()
    }
}

#[derive(Debug)]
struct BackendInner {
    state: Mutex<BackendState>,
    /// Latest timetoken; bumped under the state lock on every append.
    head: watch::Sender<u64>,
}

/// Shared in-process backend. Clones refer to the same log.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BackendInner {
                state: Mutex::new(BackendState {
                    clock: START_TIMETOKEN,
                    log: Vec::new(),
                    occupants: BTreeMap::new(),
                    groups: BTreeMap::new(),
                    faults: VecDeque::new(),
                    requests: Vec::new(),
                    invalid_before: None,
                }),
                head: watch::channel(START_TIMETOKEN).0,
            }),
        }
    }

    /// A transport acting as client `uuid`.
    pub fn transport(&self, uuid: &str) -> MemoryTransport {
        MemoryTransport {
            backend: self.clone(),
            uuid: uuid.to_string(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the state and wake held long-polls.
    fn mutate<T>(&self, f: impl FnOnce(&mut BackendState) -> T) -> T {
        let mut state = self.state();
        let out = f(&mut state);
        self.inner.head.send_replace(state.clock);
        out
    }

    pub fn publish(&self, publisher: &str, channel: &str, payload: Value) -> Timetoken {
        self.mutate(|s| s.append(channel, Some(publisher), None, payload))
    }

    pub fn signal(&self, publisher: &str, channel: &str, payload: Value) -> Timetoken {
        self.mutate(|s| s.append(channel, Some(publisher), Some(MESSAGE_TYPE_SIGNAL), payload))
    }

    pub fn add_channel_to_group(&self, group: &str, channel: &str) {
        self.mutate(|s| {
            s.groups
                .entry(group.to_string())
                .or_default()
                .insert(channel.to_string());
        });
    }

    /// Drop `uuid` from `channel` as if its heartbeat lapsed. Returns false if
    /// it was not an occupant.
    pub fn timeout_occupant(&self, channel: &str, uuid: &str) -> bool {
        self.mutate(|s| s.remove_occupant(channel, uuid, PresenceAction::Timeout))
    }

    /// Attach a state document to occupant `uuid` of `channel`.
    pub fn set_state(&self, channel: &str, uuid: &str, state: Value) -> Timetoken {
        self.mutate(|s| s.append_presence(channel, PresenceAction::StateChange, uuid, Some(state)))
    }

    pub fn occupants(&self, channel: &str) -> Vec<String> {
        self.state()
            .occupants
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Fail the next long-poll (from any client) with `error`.
    pub fn fail_next(&self, error: TransportError) {
        self.state().faults.push_back(error);
    }

    /// Reject every cursor issued so far. Handshakes still succeed.
    pub fn invalidate_cursors(&self) {
        self.mutate(|s| {
            s.clock += 1;
            s.invalid_before = Some(s.now());
        });
    }

    /// Every long-poll received so far, with the requesting client id.
    pub fn requests(&self) -> Vec<(String, LongPollRequest)> {
        self.state().requests.clone()
    }

    /// Latest timetoken issued.
    pub fn head(&self) -> Timetoken {
        self.state().now()
    }

    async fn long_poll(
        &self,
        uuid: &str,
        request: &LongPollRequest,
    ) -> Result<LongPollResponse, TransportError> {
        let mut head = self.inner.head.subscribe();
        let cursor = {
            let mut state = self.state();
            state.requests.push((uuid.to_string(), request.clone()));
            if let Some(fault) = state.faults.pop_front() {
                return Err(fault);
            }
            let now = state.now();
            if state.join(uuid, request) {
                self.inner.head.send_replace(state.clock);
            }
            let Some(cursor) = request.cursor else {
                return Ok(LongPollResponse {
                    cursor: Cursor::new(now, REGION),
                    events: Vec::new(),
                });
            };
            if let Some(before) = state.invalid_before
                && cursor.timetoken < before
            {
                return Err(TransportError::CursorInvalidated(format!(
                    "timetoken {} is older than {before}",
                    cursor.timetoken
                )));
            }
            cursor
        };

        let deadline = tokio::time::Instant::now() + request.timeout;
        loop {
            {
                let state = self.state();
                let _ = head.borrow_and_update();
                let events = state.matching(request, cursor.timetoken);
                if let Some(last) = events.last() {
                    return Ok(LongPollResponse {
                        cursor: Cursor::new(last.timetoken, REGION),
                        events,
                    });
                }
            }
            match tokio::time::timeout_at(deadline, head.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => {
                    return Ok(LongPollResponse {
                        cursor,
                        events: Vec::new(),
                    });
                }
            }
        }
    }

    fn leave(&self, uuid: &str, channels: &[String], groups: &[String]) {
        self.mutate(|s| {
            let mut names: BTreeSet<String> = channels.iter().cloned().collect();
            for group in groups {
                if let Some(members) = s.groups.get(group) {
                    names.extend(members.iter().cloned());
                }
            }
            for channel in names {
                s.remove_occupant(&channel, uuid, PresenceAction::Leave);
            }
        });
    }
}

/// [`Transport`] over a [`MemoryBackend`] for one client id.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    backend: MemoryBackend,
    uuid: String,
}

impl MemoryTransport {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn long_poll(
        &self,
        request: &LongPollRequest,
    ) -> Result<LongPollResponse, TransportError> {
        self.backend.long_poll(&self.uuid, request).await
    }

    async fn leave(&self, channels: &[String], groups: &[String]) -> Result<(), TransportError> {
        self.backend.leave(&self.uuid, channels, groups);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &Value) -> Result<Timetoken, TransportError> {
        Ok(self.backend.publish(&self.uuid, channel, payload.clone()))
    }
}
