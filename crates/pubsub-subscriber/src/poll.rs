//! The poll loop: one outstanding long-poll at a time, cursor handling,
//! subscription confirmation, and retry with backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::Shared;
use crate::config::TimingConfig;
use crate::decode::Decoder;
use crate::registry::{Confirmed, Snapshot};
use crate::transport::{LongPollRequest, LongPollResponse, Transport, TransportError};
use crate::types::{Cursor, Envelope, Status, StatusCategory};

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Delay schedule between retries of a failed long-poll.
pub trait BackoffPolicy: Send + Sync + 'static {
    /// Delay before retry `attempt` (1-based: the first retry is attempt 1).
    fn delay(&self, attempt: u32) -> Duration;
}

/// Doubling delay capped at `max`, plus up to `jitter` of random spread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl ExponentialBackoff {
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            initial: timing.retry_initial,
            max: timing.retry_max,
            jitter: timing.retry_jitter,
        }
    }

    fn base(&self, attempt: u32) -> Duration {
        // 1s, 2s, 4s, 8s, 15s, 15s, ...
        let exp = attempt.saturating_sub(1).min(30);
        self.initial.saturating_mul(1u32 << exp).min(self.max)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.base(attempt) + jitter(self.jitter)
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    // Use subsecond nanos from wall clock for non-deterministic jitter
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    Duration::from_millis(nanos % max_ms)
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// Cancelled by `stop` (or the client was dropped).
    Stopped,
    /// Gave up after `Disconnected`; needs an explicit `start`.
    Disconnected,
}

pub(crate) struct PollLoop {
    pub shared: Arc<Shared>,
    pub transport: Arc<dyn Transport>,
    pub backoff: Arc<dyn BackoffPolicy>,
    pub timing: TimingConfig,
    pub cursor: Option<Cursor>,
    pub decoder: Decoder,
    pub events_tx: mpsc::Sender<Envelope>,
    pub cancel: CancellationToken,
}

impl PollLoop {
    pub(crate) async fn run(mut self) -> LoopExit {
        let mut failures: u32 = 0;
        let mut idle_since: Option<Instant> = None;

        loop {
            if self.cancel.is_cancelled() {
                return LoopExit::Stopped;
            }
            let snapshot = self.shared.snapshot();

            if let Some(leaving) = snapshot.next_leave() {
                if !self.leave(&leaving.channels, &leaving.groups).await {
                    return LoopExit::Stopped;
                }
                let left = self.shared.confirm_left(&leaving);
                if !left.is_empty() && !self.emit_confirmed(StatusCategory::Unsubscribed, left).await
                {
                    return LoopExit::Stopped;
                }
                continue;
            }

            if snapshot.is_idle() {
                idle_since.get_or_insert_with(Instant::now);
                tracing::debug!("No active subscriptions, waiting for subscribe");
                tokio::select! {
                    _ = self.cancel.cancelled() => return LoopExit::Stopped,
                    _ = self.shared.changed.notified() => continue,
                }
            }

            if let Some(since) = idle_since.take()
                && self.cursor.is_some()
                && since.elapsed() > self.timing.cursor_staleness
            {
                tracing::info!(
                    idle = ?since.elapsed(),
                    "Cursor is stale after idle period, restarting from now"
                );
                self.cursor = None;
            }

            let handshake = self.cursor.is_none() || snapshot.has_unconfirmed();
            let request = LongPollRequest {
                channels: snapshot.channel_targets(),
                groups: snapshot.group_targets(),
                cursor: if handshake { None } else { self.cursor },
                timeout: self.timing.long_poll_timeout,
            };
            let guard = self.timing.long_poll_timeout + self.timing.request_margin;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return LoopExit::Stopped,
                _ = self.shared.changed.notified() => {
                    tracing::debug!("Subscription set changed, re-issuing request");
                    continue;
                }
                r = tokio::time::timeout(guard, self.transport.long_poll(&request)) => {
                    r.unwrap_or(Err(TransportError::Timeout))
                }
            };

            match result {
                Ok(response) => {
                    if failures > 0 {
                        tracing::info!(failures, "Long-poll recovered");
                        failures = 0;
                        if !self.emit_status(Status::new(StatusCategory::Reconnected)).await {
                            return LoopExit::Stopped;
                        }
                    }
                    if !self.handle_response(&snapshot, &request, response).await {
                        return LoopExit::Stopped;
                    }
                }
                Err(TransportError::CursorInvalidated(reason)) if self.cursor.is_some() => {
                    let lost_after = self.cursor.take().map(|c| c.timetoken);
                    tracing::warn!(
                        cursor = ?lost_after,
                        %reason,
                        "Backend invalidated the cursor; events after it are lost"
                    );
                    let mut status = Status::new(StatusCategory::CursorReset);
                    status.error = lost_after
                        .map(|tt| format!("events after timetoken {tt} lost: {reason}"));
                    if !self.emit_status(status).await {
                        return LoopExit::Stopped;
                    }
                }
                // Without a cursor there is nothing to reset: a handshake
                // rejected this way is retried like any transient failure.
                Err(err)
                    if err.is_retriable()
                        || matches!(err, TransportError::CursorInvalidated(_)) =>
                {
                    failures += 1;
                    if let Some(exit) = self.retry_after_failure(failures, &err).await {
                        return exit;
                    }
                }
                Err(err) => {
                    tracing::error!("Long-poll rejected: {err}");
                    let mut status = Status::new(StatusCategory::Disconnected);
                    status.error = Some(err.to_string());
                    self.emit_status(status).await;
                    return LoopExit::Disconnected;
                }
            }
        }
    }

    /// Report and back off after the `failures`th consecutive failure.
    /// Returns the exit reason once the loop should end.
    async fn retry_after_failure(&self, failures: u32, err: &TransportError) -> Option<LoopExit> {
        tracing::warn!(attempt = failures, "Long-poll failed: {err}");
        if failures == 1 {
            let mut status = Status::new(StatusCategory::Reconnecting);
            status.error = Some(err.to_string());
            if !self.emit_status(status).await {
                return Some(LoopExit::Stopped);
            }
        }
        if failures > self.timing.max_consecutive_failures {
            tracing::error!(
                failures,
                "Giving up after consecutive failures; call start() to resume"
            );
            let mut status = Status::new(StatusCategory::Disconnected);
            status.error = Some(format!("{failures} consecutive failures, last: {err}"));
            self.emit_status(status).await;
            return Some(LoopExit::Disconnected);
        }
        let delay = self.backoff.delay(failures);
        tracing::debug!(?delay, "Backing off before retry");
        tokio::select! {
            _ = tokio::time::sleep(delay) => None,
            _ = self.cancel.cancelled() => Some(LoopExit::Stopped),
        }
    }

    /// Confirm subscriptions covered by `snapshot`, advance the cursor, then
    /// hand the response's events to the dispatcher. `Subscribed` always
    /// precedes the events.
    async fn handle_response(
        &mut self,
        snapshot: &Snapshot,
        request: &LongPollRequest,
        response: LongPollResponse,
    ) -> bool {
        let confirmed = self.shared.confirm_subscribed(snapshot);

        // A handshake while a cursor exists only confirms: the existing
        // cursor stays and the next long-poll fetches everything after it.
        let envelopes = if request.is_handshake() && self.cursor.is_some() {
            Vec::new()
        } else {
            let floor = self.cursor.map(|c| c.timetoken);
            let envelopes = self.decoder.decode_batch(response.events, floor);
            self.advance(response.cursor);
            envelopes
        };

        if !confirmed.is_empty()
            && !self.emit_confirmed(StatusCategory::Subscribed, confirmed).await
        {
            return false;
        }
        for envelope in envelopes {
            if !self.emit(envelope).await {
                return false;
            }
        }
        true
    }

    /// Move the cursor forward. A response cursor older than the current one
    /// is ignored.
    fn advance(&mut self, next: Cursor) {
        if let Some(current) = self.cursor
            && next.timetoken < current.timetoken
        {
            tracing::warn!(
                current = %current.timetoken,
                returned = %next.timetoken,
                "Ignoring response cursor older than the consumed one"
            );
            return;
        }
        self.cursor = Some(next);
        self.shared.set_cursor(next);
    }

    /// Send the leave for `channels`/`groups`. Failures are logged only: the
    /// entries are dropped from the parameter set either way. Returns false
    /// if cancelled.
    async fn leave(&self, channels: &[String], groups: &[String]) -> bool {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            r = tokio::time::timeout(self.timing.leave_timeout, self.transport.leave(channels, groups)) => r,
        };
        match result {
            Ok(Ok(())) => tracing::debug!(?channels, ?groups, "Leave sent"),
            Ok(Err(e)) => tracing::warn!(?channels, ?groups, "Leave failed: {e}"),
            Err(_) => tracing::warn!(?channels, ?groups, "Leave timed out"),
        }
        true
    }

    async fn emit_confirmed(&self, category: StatusCategory, confirmed: Confirmed) -> bool {
        tracing::info!(
            channels = ?confirmed.channels,
            groups = ?confirmed.groups,
            "{category:?}"
        );
        let mut status = Status::new(category);
        status.channels = confirmed.channels;
        status.groups = confirmed.groups;
        self.emit_status(status).await
    }

    async fn emit_status(&self, status: Status) -> bool {
        let timetoken = self.cursor.map(|c| c.timetoken).unwrap_or_default();
        self.emit(Envelope::status(status, timetoken)).await
    }

    /// Queue an envelope for the dispatcher, waiting for capacity. Returns
    /// false if cancelled or the dispatcher is gone.
    async fn emit(&self, envelope: Envelope) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events_tx.send(envelope) => sent.is_ok(),
        }
    }
}
