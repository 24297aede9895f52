//! Public entry point: [`Client`] and [`ClientBuilder`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Dispatch;
use tracing::instrument::{Instrument, WithSubscriber};

use crate::config::ClientConfig;
use crate::decode::Decoder;
use crate::dispatch::run_dispatcher;
use crate::listener::{Listener, ListenerHandle, ListenerRegistry};
use crate::poll::{BackoffPolicy, ExponentialBackoff, LoopExit, PollLoop};
use crate::registry::{
    ChannelRegistry, Confirmed, LeaveBatch, Snapshot, SubscribeOptions, UnsubscribeOptions,
};
use crate::transport::Transport;
use crate::types::{Cursor, Envelope, Error, Timetoken};
use crate::wait::{self, WaitFuture};

/// State shared between the client handle and the poll loop.
pub(crate) struct Shared {
    registry: Mutex<ChannelRegistry>,
    pub listeners: Arc<ListenerRegistry>,
    /// Signalled whenever the long-poll parameter set changes.
    pub changed: Notify,
    cursor: Mutex<Option<Cursor>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            registry: Mutex::new(ChannelRegistry::default()),
            listeners: Arc::new(ListenerRegistry::default()),
            changed: Notify::new(),
            cursor: Mutex::new(None),
        }
    }

    fn registry(&self) -> MutexGuard<'_, ChannelRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.registry().snapshot()
    }

    pub fn confirm_subscribed(&self, snapshot: &Snapshot) -> Confirmed {
        self.registry().confirm_subscribed(snapshot)
    }

    pub fn confirm_left(&self, left: &LeaveBatch) -> Confirmed {
        self.registry().confirm_left(left)
    }

    pub fn set_cursor(&self, cursor: Cursor) {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = Some(cursor);
    }

    fn reset_cursor(&self, cursor: Option<Cursor>) {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = cursor;
    }

    fn cursor(&self) -> Option<Cursor> {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Session {
    cancel: CancellationToken,
    poll: JoinHandle<LoopExit>,
    dispatch: JoinHandle<()>,
}

impl Session {
    fn is_running(&self) -> bool {
        !self.poll.is_finished()
    }
}

#[derive(Default)]
struct SessionState {
    current: Option<Session>,
    /// `stop` was called and no `start` since; suppresses auto-start.
    stopped: bool,
}

pub(crate) struct Inner {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    backoff: Arc<dyn BackoffPolicy>,
    config: ClientConfig,
    dispatch: Dispatch,
    runtime: Handle,
    session: Mutex<SessionState>,
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.session.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = state.current.take() {
            session.cancel.cancel();
        }
        // Pending waits resolve with `WaitAborted`.
        self.shared.listeners.clear();
    }
}

/// Handle to a subscribe client. Cheap to clone; all clones share one
/// subscription set, listener set and poll loop.
///
/// Dropping the last handle stops the loop.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("running", &self.is_running())
            .field("cursor", &self.cursor())
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder(transport: impl Transport) -> ClientBuilder {
        ClientBuilder {
            transport: Arc::new(transport),
            config: ClientConfig::default(),
            backoff: None,
            observer: None,
        }
    }

    /// Build a client with `config` and default backoff and observer.
    pub fn new(transport: impl Transport, config: ClientConfig) -> Result<Self, Error> {
        Self::builder(transport).config(config).build()
    }

    pub(crate) fn upgrade(inner: &Weak<Inner>) -> Option<Client> {
        inner.upgrade().map(|inner| Client { inner })
    }

    fn log(&self, f: impl FnOnce()) {
        tracing::dispatcher::with_default(&self.inner.dispatch, f);
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Add channels and groups to the subscription set. Takes effect on the
    /// poll loop's next iteration; a `Subscribed` status follows once a
    /// round-trip confirms them.
    pub fn subscribe(&self, options: SubscribeOptions) {
        let changed = self.inner.shared.registry().subscribe(&options);
        self.log(|| {
            tracing::debug!(
                channels = ?options.channels,
                groups = ?options.groups,
                with_presence = options.with_presence,
                changed,
                "Subscribe"
            )
        });
        if changed {
            self.inner.shared.changed.notify_one();
        }
        if self.inner.config.auto_start {
            self.auto_start();
        }
    }

    /// Remove channels and groups. Unknown names are ignored. An
    /// `Unsubscribed` status follows once the leave is confirmed.
    pub fn unsubscribe(&self, options: UnsubscribeOptions) {
        let changed = self.inner.shared.registry().unsubscribe(&options);
        self.log(|| {
            tracing::debug!(
                channels = ?options.channels,
                groups = ?options.groups,
                changed,
                "Unsubscribe"
            )
        });
        if changed {
            self.inner.shared.changed.notify_one();
        }
    }

    pub fn unsubscribe_all(&self) {
        let changed = self.inner.shared.registry().unsubscribe_all();
        self.log(|| tracing::debug!(changed, "Unsubscribe all"));
        if changed {
            self.inner.shared.changed.notify_one();
        }
    }

    /// Current subscription set, including entries not yet confirmed.
    pub fn subscriptions(&self) -> Snapshot {
        self.inner.shared.snapshot()
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Register a listener. It receives envelopes dispatched from now on.
    pub fn add_listener(&self, listener: impl Listener) -> ListenerHandle {
        self.inner.shared.listeners.add(Arc::new(listener))
    }

    /// Unregister a listener. It is not invoked again once this returns,
    /// even for envelopes of a batch already being dispatched. Returns false
    /// if the handle is unknown.
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.inner.shared.listeners.remove(handle)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.shared.listeners.len()
    }

    /// Resolve with the first envelope matching `predicate` dispatched after
    /// this call, or fail with [`Error::WaitTimeout`]. See [`wait`] for
    /// ready-made predicates.
    pub fn wait_for<F>(&self, predicate: F, timeout: Duration) -> WaitFuture
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        wait::register(&self.inner.shared.listeners, predicate, timeout)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the poll loop from "now". No-op while running.
    pub fn start(&self) {
        self.start_session(None);
    }

    /// Start the poll loop resuming after `cursor`. No-op while running.
    pub fn start_at(&self, cursor: Cursor) {
        self.start_session(Some(cursor));
    }

    /// Stop the poll loop. The in-flight request is abandoned and no further
    /// envelopes are delivered. Idempotent.
    pub fn stop(&self) {
        let mut state = self.inner.session();
        state.stopped = true;
        if let Some(session) = state.current.take() {
            session.cancel.cancel();
            self.log(|| tracing::info!(cursor = ?self.cursor(), "Subscribe loop stopped"));
        }
    }

    /// The poll loop is running (started, not stopped, not disconnected).
    pub fn is_running(&self) -> bool {
        self.inner
            .session()
            .current
            .as_ref()
            .is_some_and(Session::is_running)
    }

    /// Last consumed cursor, for a later [`start_at`](Client::start_at).
    pub fn cursor(&self) -> Option<Cursor> {
        self.inner.shared.cursor()
    }

    /// Publish through the transport. Independent of the poll loop.
    pub async fn publish(
        &self,
        channel: &str,
        payload: &serde_json::Value,
    ) -> Result<Timetoken, Error> {
        let timetoken = self
            .inner
            .transport
            .publish(channel, payload)
            .with_subscriber(self.inner.dispatch.clone())
            .await?;
        Ok(timetoken)
    }

    fn auto_start(&self) {
        {
            let state = self.inner.session();
            if state.stopped || state.current.is_some() {
                return;
            }
        }
        self.start_session(None);
    }

    fn start_session(&self, cursor: Option<Cursor>) {
        let mut state = self.inner.session();
        state.stopped = false;
        if state.current.as_ref().is_some_and(Session::is_running) {
            self.log(|| tracing::debug!("Subscribe loop already running"));
            return;
        }
        // A disconnected session may still be draining its queue.
        let previous = state.current.take().map(|s| s.dispatch);

        let inner = &self.inner;
        inner.shared.registry().reset_for_restart();
        inner.shared.reset_cursor(cursor);

        let timing = inner.config.timing.clone();
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(timing.dispatch_capacity);

        let span = tracing::dispatcher::with_default(&inner.dispatch, || {
            tracing::info_span!("subscribe_loop")
        });
        self.log(|| {
            let _enter = span.enter();
            tracing::info!(resume = ?cursor, "Starting subscribe loop");
        });

        let poll_loop = PollLoop {
            shared: Arc::clone(&inner.shared),
            transport: Arc::clone(&inner.transport),
            backoff: Arc::clone(&inner.backoff),
            timing,
            cursor,
            decoder: Decoder::new(inner.config.dedupe_cache_size),
            events_tx,
            cancel: cancel.clone(),
        };
        let poll = inner.runtime.spawn(
            poll_loop
                .run()
                .instrument(span.clone())
                .with_subscriber(inner.dispatch.clone()),
        );
        let dispatch = inner.runtime.spawn(
            run_dispatcher(
                events_rx,
                Arc::clone(&inner.shared.listeners),
                Arc::downgrade(inner),
                cancel.clone(),
                previous,
            )
            .instrument(span)
            .with_subscriber(inner.dispatch.clone()),
        );

        state.current = Some(Session {
            cancel,
            poll,
            dispatch,
        });
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    backoff: Option<Arc<dyn BackoffPolicy>>,
    observer: Option<Dispatch>,
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the retry schedule derived from `config.timing`.
    pub fn backoff(mut self, backoff: impl BackoffPolicy) -> Self {
        self.backoff = Some(Arc::new(backoff));
        self
    }

    /// Send this client's logs to `observer` instead of the default
    /// dispatcher current at `build` time.
    pub fn observer(mut self, observer: impl Into<Dispatch>) -> Self {
        self.observer = Some(observer.into());
        self
    }

    /// Must be called within a tokio runtime; the client spawns its tasks on
    /// that runtime.
    pub fn build(self) -> Result<Client, Error> {
        self.config.validate()?;
        let runtime = Handle::try_current()?;
        let dispatch = self
            .observer
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone));
        let backoff = self
            .backoff
            .unwrap_or_else(|| Arc::new(ExponentialBackoff::from_timing(&self.config.timing)));
        Ok(Client {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared::new()),
                transport: self.transport,
                backoff,
                config: self.config,
                dispatch,
                runtime,
                session: Mutex::new(SessionState::default()),
            }),
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("custom_backoff", &self.backoff.is_some())
            .field("custom_observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}
