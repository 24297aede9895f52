//! Long-poll pub/sub subscribe client.
//!
//! A [`Client`] keeps a set of channel and channel-group subscriptions, runs
//! one long-poll at a time against a [`Transport`], and delivers the decoded
//! events in order to registered [`Listener`]s.
//!
//! # Features
//! - Subscription changes take effect without dropping the cursor
//! - `Subscribed` / `Unsubscribed` statuses once the backend confirms them
//! - Presence (join, leave, timeout, state-change) on `<channel>-pnpres`
//! - Exponential backoff with jitter, then `Disconnected` after a bound
//! - `wait_for` suspension points for sequencing callers against delivery
//! - Reentrant listeners: callbacks may subscribe, unsubscribe or stop
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pubsub_subscriber::Error> {
//! use std::time::Duration;
//! use pubsub_subscriber::{Callbacks, Client, ClientConfig, HttpConfig, HttpTransport,
//!     StatusCategory, SubscribeOptions, wait};
//!
//! let transport = HttpTransport::new(HttpConfig {
//!     subscribe_key: "sub-c-...".to_string(),
//!     ..Default::default()
//! })?;
//! let client = Client::new(transport, ClientConfig::default())?;
//! client.add_listener(Callbacks::new().on_message(|_client, env| {
//!     println!("{}: {:?}", env.channel, env.message());
//! }));
//!
//! let subscribed = client.wait_for(
//!     wait::status_for(StatusCategory::Subscribed, "ch1"),
//!     Duration::from_secs(10),
//! );
//! client.subscribe(SubscribeOptions::channels(["ch1"]).with_presence());
//! subscribed.await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod decode;
mod dispatch;
mod http;
mod listener;
pub mod memory;
mod poll;
mod protocol;
mod registry;
mod transport;
mod types;
pub mod wait;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, TimingConfig};
pub use http::{HttpConfig, HttpTransport};
pub use listener::{Callbacks, Listener, ListenerHandle};
pub use poll::{BackoffPolicy, ExponentialBackoff};
pub use registry::{
    LeaveBatch, Snapshot, SubscribeOptions, SubscriptionEntry, SubscriptionState, TargetKind,
    UnsubscribeOptions,
};
pub use transport::{
    LongPollRequest, LongPollResponse, RawEvent, Target, Transport, TransportError,
};
pub use types::{
    Cursor, Envelope, Error, Event, EventKind, Message, PRESENCE_SUFFIX, Presence,
    PresenceAction, Status, StatusCategory, Timetoken, presence_channel,
};
pub use wait::WaitFuture;
