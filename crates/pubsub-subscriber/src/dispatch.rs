//! Dispatcher: ordered fan-out of envelopes to listeners.
//!
//! Runs as its own task so the poll loop can issue the next request while a
//! batch is still being delivered. A single consumer drains the queue, which
//! keeps per-listener order equal to the order the poll loop produced.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{Client, Inner};
use crate::listener::{ListenerRegistry, deliver};
use crate::types::Envelope;

/// Drain `rx` into the listeners until cancelled or the poll loop is gone.
/// `previous` is the dispatcher of an earlier session that may still be
/// draining; this one starts delivering only after it finishes.
pub(crate) async fn run_dispatcher(
    mut rx: mpsc::Receiver<Envelope>,
    listeners: Arc<ListenerRegistry>,
    client: Weak<Inner>,
    cancel: CancellationToken,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = previous => {}
        }
    }
    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };
        let Some(client) = Client::upgrade(&client) else {
            break;
        };
        if !dispatch_one(&envelope, &listeners, &client, &cancel) {
            break;
        }
    }
    tracing::debug!("Dispatcher exited");
}

/// Deliver one envelope to every listener registered right now. Returns
/// false once the session is cancelled; nothing is delivered after that.
fn dispatch_one(
    envelope: &Envelope,
    listeners: &ListenerRegistry,
    client: &Client,
    cancel: &CancellationToken,
) -> bool {
    let snapshot = listeners.snapshot();
    for registered in snapshot.iter() {
        if cancel.is_cancelled() {
            return false;
        }
        // Removed after the snapshot was taken (possibly by an earlier
        // callback for this same envelope).
        if !registered.is_active() {
            continue;
        }
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            deliver(registered.listener.as_ref(), client, envelope);
        }));
        if result.is_err() {
            tracing::error!(
                listener = ?registered.handle,
                kind = ?envelope.kind(),
                channel = %envelope.channel,
                "Listener panicked; continuing with the remaining listeners"
            );
        }
    }
    !cancel.is_cancelled()
}
