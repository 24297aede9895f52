//! One-shot "wait until an event like this is dispatched" primitives.
//!
//! [`Client::wait_for`](crate::Client::wait_for) registers an internal
//! listener immediately (not on first poll), so only envelopes dispatched
//! after the call can match. Dropping the returned future cancels the wait
//! and unregisters the listener.
//!
//! The free functions in this module build common predicates:
//!
//! ```no_run
//! # async fn example(client: pubsub_subscriber::Client) -> Result<(), pubsub_subscriber::Error> {
//! use std::time::Duration;
//! use pubsub_subscriber::{StatusCategory, wait};
//!
//! let joined = client.wait_for(wait::presence_on("ch1"), Duration::from_secs(5));
//! let connected = client.wait_for(wait::status(StatusCategory::Subscribed), Duration::from_secs(5));
//! connected.await?;
//! let envelope = joined.await?;
//! assert_eq!(envelope.actual_channel, "ch1-pnpres");
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

use crate::client::Client;
use crate::listener::{Listener, ListenerHandle, ListenerRegistry};
use crate::types::{Envelope, Error, EventKind, StatusCategory};

/// Future returned by `wait_for`.
pub type WaitFuture = BoxFuture<'static, Result<Envelope, Error>>;

struct Waiter<F> {
    predicate: F,
    tx: Mutex<Option<oneshot::Sender<Envelope>>>,
}

impl<F> Waiter<F>
where
    F: Fn(&Envelope) -> bool + Send + Sync + 'static,
{
    fn offer(&self, envelope: &Envelope) {
        if !(self.predicate)(envelope) {
            return;
        }
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = tx.take() {
            let _ = tx.send(envelope.clone());
        }
    }
}

impl<F> Listener for Waiter<F>
where
    F: Fn(&Envelope) -> bool + Send + Sync + 'static,
{
    fn on_message(&self, _client: &Client, envelope: &Envelope) {
        self.offer(envelope);
    }

    fn on_presence(&self, _client: &Client, envelope: &Envelope) {
        self.offer(envelope);
    }

    fn on_status(&self, _client: &Client, envelope: &Envelope) {
        self.offer(envelope);
    }
}

/// Unregisters the waiter when the wait completes or is dropped.
struct Registration {
    listeners: Arc<ListenerRegistry>,
    handle: ListenerHandle,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.listeners.remove(self.handle);
    }
}

pub(crate) fn register<F>(
    listeners: &Arc<ListenerRegistry>,
    predicate: F,
    timeout: Duration,
) -> WaitFuture
where
    F: Fn(&Envelope) -> bool + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let handle = listeners.add(Arc::new(Waiter {
        predicate,
        tx: Mutex::new(Some(tx)),
    }));
    let registration = Registration {
        listeners: Arc::clone(listeners),
        handle,
    };
    Box::pin(async move {
        let _registration = registration;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(Error::WaitAborted),
            Err(_) => Err(Error::WaitTimeout(timeout)),
        }
    })
}

/// Any envelope.
pub fn any() -> impl Fn(&Envelope) -> bool + Send + Sync + use<> {
    |_| true
}

/// A status envelope of `category`.
pub fn status(category: StatusCategory) -> impl Fn(&Envelope) -> bool + Send + Sync + use<> {
    move |env| env.is_status(category)
}

/// A status envelope of `category` that names `channel`.
pub fn status_for(
    category: StatusCategory,
    channel: &str,
) -> impl Fn(&Envelope) -> bool + Send + Sync + use<> {
    let channel = channel.to_string();
    move |env| {
        env.status_payload()
            .is_some_and(|s| s.is(category) && s.channels.contains(&channel))
    }
}

/// A message or signal on `channel`.
pub fn message_on(channel: &str) -> impl Fn(&Envelope) -> bool + Send + Sync + use<> {
    let channel = channel.to_string();
    move |env| {
        matches!(env.kind(), EventKind::Message | EventKind::Signal) && env.channel == channel
    }
}

/// A presence event for base channel `channel`.
pub fn presence_on(channel: &str) -> impl Fn(&Envelope) -> bool + Send + Sync + use<> {
    let channel = channel.to_string();
    move |env| env.kind() == EventKind::Presence && env.channel == channel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, Message, Status, Timetoken};

    fn message(channel: &str) -> Envelope {
        Envelope {
            channel: channel.into(),
            actual_channel: channel.into(),
            subscription: None,
            timetoken: Timetoken(1),
            event: Event::Message(Message {
                data: serde_json::json!(1),
                publisher: None,
            }),
        }
    }

    #[test]
    fn predicates() {
        let subscribed = {
            let mut s = Status::new(StatusCategory::Subscribed);
            s.channels = vec!["ch1".into()];
            Envelope::status(s, Timetoken(1))
        };
        assert!(status(StatusCategory::Subscribed)(&subscribed));
        assert!(!status(StatusCategory::Unsubscribed)(&subscribed));
        assert!(status_for(StatusCategory::Subscribed, "ch1")(&subscribed));
        assert!(!status_for(StatusCategory::Subscribed, "ch2")(&subscribed));

        assert!(message_on("a")(&message("a")));
        assert!(!message_on("b")(&message("a")));
        assert!(!presence_on("a")(&message("a")));
        assert!(any()(&message("a")));
    }

    #[test]
    fn waiter_fires_once() {
        let (tx, mut rx) = oneshot::channel();
        let waiter = Waiter {
            predicate: message_on("a"),
            tx: Mutex::new(Some(tx)),
        };
        waiter.offer(&message("b"));
        assert!(rx.try_recv().is_err());
        waiter.offer(&message("a"));
        waiter.offer(&message("a"));
        assert_eq!(rx.try_recv().unwrap().channel, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_unregisters() {
        let listeners = Arc::new(ListenerRegistry::default());
        let wait = register(&listeners, any(), Duration::from_secs(2));
        assert_eq!(listeners.len(), 1);

        let err = wait.await.unwrap_err();
        assert!(matches!(err, Error::WaitTimeout(d) if d == Duration::from_secs(2)));
        assert_eq!(listeners.len(), 0);
    }

    #[tokio::test]
    async fn dropping_the_future_unregisters() {
        let listeners = Arc::new(ListenerRegistry::default());
        let wait = register(&listeners, any(), Duration::from_secs(60));
        assert_eq!(listeners.len(), 1);
        drop(wait);
        assert_eq!(listeners.len(), 0);
    }

    #[tokio::test]
    async fn cleared_registry_aborts_the_wait() {
        let listeners = Arc::new(ListenerRegistry::default());
        let wait = register(&listeners, any(), Duration::from_secs(60));
        listeners.clear();
        assert!(matches!(wait.await, Err(Error::WaitAborted)));
    }
}
