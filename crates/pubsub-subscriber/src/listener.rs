//! Listener callbacks and the registry that holds them.
//!
//! Callbacks run on the dispatcher task and may call back into the
//! [`Client`] (subscribe, unsubscribe, stop, add or remove listeners). The
//! registry is copy-on-write: the dispatcher takes a snapshot per envelope,
//! and removal flips a flag that is checked right before every invocation.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::client::Client;
use crate::types::{Envelope, Event};

/// Receiver of dispatched envelopes. All methods default to no-ops.
pub trait Listener: Send + Sync + 'static {
    /// Messages and signals.
    fn on_message(&self, client: &Client, envelope: &Envelope) {
        let _ = (client, envelope);
    }

    fn on_presence(&self, client: &Client, envelope: &Envelope) {
        let _ = (client, envelope);
    }

    fn on_status(&self, client: &Client, envelope: &Envelope) {
        let _ = (client, envelope);
    }
}

/// Lets a caller keep a handle to a listener it registered.
impl<L: Listener + ?Sized> Listener for Arc<L> {
    fn on_message(&self, client: &Client, envelope: &Envelope) {
        (**self).on_message(client, envelope);
    }

    fn on_presence(&self, client: &Client, envelope: &Envelope) {
        (**self).on_presence(client, envelope);
    }

    fn on_status(&self, client: &Client, envelope: &Envelope) {
        (**self).on_status(client, envelope);
    }
}

/// Route an envelope to the callback matching its kind.
pub(crate) fn deliver(listener: &dyn Listener, client: &Client, envelope: &Envelope) {
    match envelope.event {
        Event::Message(_) | Event::Signal(_) => listener.on_message(client, envelope),
        Event::Presence(_) => listener.on_presence(client, envelope),
        Event::Status(_) => listener.on_status(client, envelope),
    }
}

type Callback = Arc<dyn Fn(&Client, &Envelope) + Send + Sync>;

/// Closure-based [`Listener`].
///
/// ```
/// use pubsub_subscriber::Callbacks;
///
/// let listener = Callbacks::new()
///     .on_message(|_client, env| println!("{}: {:?}", env.channel, env.message()))
///     .on_status(|_client, env| println!("status: {:?}", env.status_payload()));
/// # let _ = listener;
/// ```
#[derive(Clone, Default)]
pub struct Callbacks {
    message: Option<Callback>,
    presence: Option<Callback>,
    status: Option<Callback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Client, &Envelope) + Send + Sync + 'static,
    {
        self.message = Some(Arc::new(f));
        self
    }

    pub fn on_presence<F>(mut self, f: F) -> Self
    where
        F: Fn(&Client, &Envelope) + Send + Sync + 'static,
    {
        self.presence = Some(Arc::new(f));
        self
    }

    pub fn on_status<F>(mut self, f: F) -> Self
    where
        F: Fn(&Client, &Envelope) + Send + Sync + 'static,
    {
        self.status = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("message", &self.message.is_some())
            .field("presence", &self.presence.is_some())
            .field("status", &self.status.is_some())
            .finish()
    }
}

impl Listener for Callbacks {
    fn on_message(&self, client: &Client, envelope: &Envelope) {
        if let Some(cb) = &self.message {
            cb(client, envelope);
        }
    }

    fn on_presence(&self, client: &Client, envelope: &Envelope) {
        if let Some(cb) = &self.presence {
            cb(client, envelope);
        }
    }

    fn on_status(&self, client: &Client, envelope: &Envelope) {
        if let Some(cb) = &self.status {
            cb(client, envelope);
        }
    }
}

/// Identity of a registered listener, returned by `add_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

pub(crate) struct Registered {
    pub handle: ListenerHandle,
    pub listener: Arc<dyn Listener>,
    active: AtomicBool,
}

impl Registered {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub(crate) type ListenerSnapshot = Arc<Vec<Arc<Registered>>>;

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    entries: RwLock<ListenerSnapshot>,
}

impl ListenerRegistry {
    pub fn add(&self, listener: Arc<dyn Listener>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registered = Arc::new(Registered {
            handle,
            listener,
            active: AtomicBool::new(true),
        });
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push(registered);
        *entries = Arc::new(next);
        handle
    }

    /// Returns false if the handle was not registered.
    pub fn remove(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(found) = entries.iter().find(|r| r.handle == handle) else {
            return false;
        };
        // Dispatch snapshots taken before this point still hold the entry;
        // the flag stops them from invoking it.
        found.active.store(false, Ordering::Release);
        let next: Vec<_> = entries
            .iter()
            .filter(|r| r.handle != handle)
            .cloned()
            .collect();
        *entries = Arc::new(next);
        true
    }

    /// Deactivate and drop every listener.
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for r in entries.iter() {
            r.active.store(false, Ordering::Release);
        }
        *entries = Arc::new(Vec::new());
    }

    pub fn snapshot(&self) -> ListenerSnapshot {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl Listener for Noop {}

    #[test]
    fn add_and_remove() {
        let reg = ListenerRegistry::default();
        let a = reg.add(Arc::new(Noop));
        let b = reg.add(Arc::new(Noop));
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);

        assert!(reg.remove(a));
        assert!(!reg.remove(a));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.snapshot()[0].handle, b);
    }

    #[test]
    fn removal_deactivates_entries_in_old_snapshots() {
        let reg = ListenerRegistry::default();
        let a = reg.add(Arc::new(Noop));
        let before = reg.snapshot();
        assert!(before[0].is_active());

        reg.remove(a);
        assert!(!before[0].is_active());
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn addition_is_invisible_to_old_snapshots() {
        let reg = ListenerRegistry::default();
        reg.add(Arc::new(Noop));
        let before = reg.snapshot();
        reg.add(Arc::new(Noop));
        assert_eq!(before.len(), 1);
        assert_eq!(reg.snapshot().len(), 2);
    }

    #[test]
    fn callbacks_debug_shows_which_are_set() {
        let cb = Callbacks::new().on_status(|_, _| {});
        let dbg = format!("{cb:?}");
        assert!(dbg.contains("status: true"));
        assert!(dbg.contains("message: false"));
    }
}
