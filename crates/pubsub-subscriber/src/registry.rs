//! Channel registry: the caller-owned set of channel and group subscriptions.
//!
//! Callers mutate it through `subscribe`/`unsubscribe`; the poll loop reads a
//! [`Snapshot`] per iteration and reports back which snapshot a successful
//! round-trip covered, which is what moves entries from `Requested` to
//! `Active` and from `LeavePending` to removed. The registry never calls
//! listener code; confirmations are returned as [`Confirmed`] sets that the
//! poll loop turns into status envelopes.

use std::collections::BTreeMap;

use crate::transport::Target;

/// Whether an entry names a channel or a channel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetKind {
    Channel,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Subscribe called; not yet confirmed by a round-trip.
    Requested,
    Active,
    /// Unsubscribe called; the leave has not been confirmed yet.
    LeavePending,
    /// Leave confirmed. Only ever seen in [`Confirmed`] results.
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub name: String,
    pub kind: TargetKind,
    pub presence_enabled: bool,
    pub state: SubscriptionState,
    /// A `Subscribed` status has been reported and no `Unsubscribed` since.
    announced: bool,
    /// The `unsubscribe` call that made this entry `LeavePending`.
    leave_batch: u64,
}

impl SubscriptionEntry {
    fn requested(name: &str, kind: TargetKind, presence_enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            presence_enabled,
            state: SubscriptionState::Requested,
            announced: false,
            leave_batch: 0,
        }
    }

    /// Part of the long-poll parameter set.
    pub fn is_polled(&self) -> bool {
        matches!(
            self.state,
            SubscriptionState::Requested | SubscriptionState::Active
        )
    }
}

/// Structured subscribe request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    pub with_presence: bool,
}

impl SubscribeOptions {
    pub fn channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_presence(mut self) -> Self {
        self.with_presence = true;
        self
    }
}

/// Structured unsubscribe request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubscribeOptions {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
}

impl UnsubscribeOptions {
    pub fn channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            groups: Vec::new(),
        }
    }

    pub fn groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: Vec::new(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }
}

/// Point-in-time copy of the registry, ordered by (kind, name).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub entries: Vec<SubscriptionEntry>,
}

impl Snapshot {
    /// Channel targets of the long-poll built from this snapshot.
    pub fn channel_targets(&self) -> Vec<Target> {
        self.targets(TargetKind::Channel)
    }

    pub fn group_targets(&self) -> Vec<Target> {
        self.targets(TargetKind::Group)
    }

    fn targets(&self, kind: TargetKind) -> Vec<Target> {
        self.entries
            .iter()
            .filter(|e| e.kind == kind && e.is_polled())
            .map(|e| Target {
                name: e.name.clone(),
                with_presence: e.presence_enabled,
            })
            .collect()
    }

    /// No entry is part of the parameter set.
    pub fn is_idle(&self) -> bool {
        !self.entries.iter().any(SubscriptionEntry::is_polled)
    }

    pub fn has_unconfirmed(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.state == SubscriptionState::Requested)
    }

    /// The oldest `unsubscribe` call still waiting for its leave. Each call
    /// is left and reported on its own, in call order.
    pub fn next_leave(&self) -> Option<LeaveBatch> {
        let batch = self
            .entries
            .iter()
            .filter(|e| e.state == SubscriptionState::LeavePending)
            .map(|e| e.leave_batch)
            .min()?;
        let (channels, groups) = split_names(self.entries.iter().filter(|e| {
            e.state == SubscriptionState::LeavePending && e.leave_batch == batch
        }));
        Some(LeaveBatch {
            channels,
            groups,
            batch,
        })
    }
}

/// Entries made `LeavePending` by one `unsubscribe` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveBatch {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    batch: u64,
}

/// Entries that changed state because of a confirmation, split by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Confirmed {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
}

impl Confirmed {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.groups.is_empty()
    }
}

fn split_names<'a>(
    entries: impl Iterator<Item = &'a SubscriptionEntry>,
) -> (Vec<String>, Vec<String>) {
    let mut channels = Vec::new();
    let mut groups = Vec::new();
    for e in entries {
        match e.kind {
            TargetKind::Channel => channels.push(e.name.clone()),
            TargetKind::Group => groups.push(e.name.clone()),
        }
    }
    (channels, groups)
}

#[derive(Debug, Default)]
pub(crate) struct ChannelRegistry {
    entries: BTreeMap<(TargetKind, String), SubscriptionEntry>,
    /// Last batch number handed to an `unsubscribe` call.
    leave_batches: u64,
}

impl ChannelRegistry {
    /// Add or upgrade entries. Returns true when the parameter set changed.
    pub fn subscribe(&mut self, options: &SubscribeOptions) -> bool {
        let mut changed = false;
        for name in &options.channels {
            changed |= self.subscribe_one(TargetKind::Channel, name, options.with_presence);
        }
        for name in &options.groups {
            changed |= self.subscribe_one(TargetKind::Group, name, options.with_presence);
        }
        changed
    }

    fn subscribe_one(&mut self, kind: TargetKind, name: &str, with_presence: bool) -> bool {
        let key = (kind, name.to_string());
        let Some(entry) = self.entries.get_mut(&key) else {
            self.entries.insert(
                key,
                SubscriptionEntry::requested(name, kind, with_presence),
            );
            return true;
        };
        match entry.state {
            SubscriptionState::Requested | SubscriptionState::Active => {
                if entry.presence_enabled || !with_presence {
                    return false;
                }
                // Presence upgrade needs its own confirmation.
                entry.presence_enabled = true;
                if entry.state == SubscriptionState::Active {
                    entry.announced = false;
                }
                entry.state = SubscriptionState::Requested;
                true
            }
            SubscriptionState::LeavePending | SubscriptionState::Removed => {
                // Leave not confirmed yet: no Unsubscribed was reported, so a
                // confirmed entry stays announced.
                entry.presence_enabled = with_presence;
                entry.state = SubscriptionState::Requested;
                true
            }
        }
    }

    /// Mark entries `LeavePending`. Unknown names are ignored.
    pub fn unsubscribe(&mut self, options: &UnsubscribeOptions) -> bool {
        let batch = self.leave_batches + 1;
        let mut changed = false;
        for name in &options.channels {
            changed |= self.unsubscribe_one(TargetKind::Channel, name, batch);
        }
        for name in &options.groups {
            changed |= self.unsubscribe_one(TargetKind::Group, name, batch);
        }
        if changed {
            self.leave_batches = batch;
        }
        changed
    }

    fn unsubscribe_one(&mut self, kind: TargetKind, name: &str, batch: u64) -> bool {
        match self.entries.get_mut(&(kind, name.to_string())) {
            Some(entry) if entry.is_polled() => {
                entry.state = SubscriptionState::LeavePending;
                entry.leave_batch = batch;
                true
            }
            _ => false,
        }
    }

    pub fn unsubscribe_all(&mut self) -> bool {
        let batch = self.leave_batches + 1;
        let mut changed = false;
        for entry in self.entries.values_mut().filter(|e| e.is_polled()) {
            entry.state = SubscriptionState::LeavePending;
            entry.leave_batch = batch;
            changed = true;
        }
        if changed {
            self.leave_batches = batch;
        }
        changed
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: self.entries.values().cloned().collect(),
        }
    }

    /// A round-trip built from `snapshot` succeeded: its `Requested` entries
    /// that are still requested at the same presence level become `Active`.
    /// Returns those not announced before.
    pub fn confirm_subscribed(&mut self, snapshot: &Snapshot) -> Confirmed {
        let mut confirmed = Vec::new();
        for seen in snapshot
            .entries
            .iter()
            .filter(|e| e.state == SubscriptionState::Requested)
        {
            let Some(entry) = self.entries.get_mut(&(seen.kind, seen.name.clone())) else {
                continue;
            };
            if entry.state != SubscriptionState::Requested
                || entry.presence_enabled != seen.presence_enabled
            {
                continue;
            }
            entry.state = SubscriptionState::Active;
            if !entry.announced {
                entry.announced = true;
                confirmed.push(entry.clone());
            }
        }
        let (channels, groups) = split_names(confirmed.iter());
        Confirmed { channels, groups }
    }

    /// The leave for `left` went through: remove its entries that are still
    /// pending in that batch. Returns the removed entries that had been
    /// announced.
    pub fn confirm_left(&mut self, left: &LeaveBatch) -> Confirmed {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.state == SubscriptionState::LeavePending && e.leave_batch == left.batch
            })
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = Vec::new();
        for key in keys {
            if let Some(mut entry) = self.entries.remove(&key)
                && entry.announced
            {
                entry.state = SubscriptionState::Removed;
                removed.push(entry);
            }
        }
        let (channels, groups) = split_names(removed.iter());
        Confirmed { channels, groups }
    }

    /// Prepare for a fresh session: everything still wanted must be confirmed
    /// (and announced) again.
    pub fn reset_for_restart(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.state == SubscriptionState::Active {
                entry.state = SubscriptionState::Requested;
            }
            if entry.state == SubscriptionState::Requested {
                entry.announced = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(registry: &ChannelRegistry) -> Vec<(String, SubscriptionState, bool)> {
        registry
            .snapshot()
            .entries
            .into_iter()
            .map(|e| (e.name, e.state, e.presence_enabled))
            .collect()
    }

    #[test]
    fn subscribe_adds_requested_entries() {
        let mut reg = ChannelRegistry::default();
        assert!(reg.subscribe(&SubscribeOptions::channels(["b", "a"])));
        assert_eq!(
            states(&reg),
            vec![
                ("a".to_string(), SubscriptionState::Requested, false),
                ("b".to_string(), SubscriptionState::Requested, false),
            ]
        );
        let snap = reg.snapshot();
        assert!(snap.has_unconfirmed());
        assert!(!snap.is_idle());
    }

    #[test]
    fn repeated_subscribe_is_idempotent() {
        let mut reg = ChannelRegistry::default();
        assert!(reg.subscribe(&SubscribeOptions::channels(["a"])));
        assert!(!reg.subscribe(&SubscribeOptions::channels(["a"])));

        let snap = reg.snapshot();
        assert_eq!(reg.confirm_subscribed(&snap).channels, vec!["a"]);
        assert!(!reg.subscribe(&SubscribeOptions::channels(["a"])));
        assert!(reg.confirm_subscribed(&reg.snapshot()).is_empty());
    }

    #[test]
    fn presence_upgrade_requires_confirmation() {
        let mut reg = ChannelRegistry::default();
        reg.subscribe(&SubscribeOptions::channels(["a"]));
        let snap = reg.snapshot();
        reg.confirm_subscribed(&snap);

        // Lower level is a no-op, higher level re-triggers.
        assert!(!reg.subscribe(&SubscribeOptions::channels(["a"])));
        assert!(reg.subscribe(&SubscribeOptions::channels(["a"]).with_presence()));
        assert_eq!(
            states(&reg),
            vec![("a".to_string(), SubscriptionState::Requested, true)]
        );
        assert!(!reg.subscribe(&SubscribeOptions::channels(["a"]).with_presence()));

        let snap = reg.snapshot();
        assert!(snap.channel_targets()[0].with_presence);
        assert_eq!(reg.confirm_subscribed(&snap).channels, vec!["a"]);
    }

    #[test]
    fn stale_snapshot_does_not_confirm_upgrade() {
        let mut reg = ChannelRegistry::default();
        reg.subscribe(&SubscribeOptions::channels(["a"]));
        let before = reg.snapshot();
        reg.subscribe(&SubscribeOptions::channels(["a"]).with_presence());

        assert!(reg.confirm_subscribed(&before).is_empty());
        assert_eq!(
            states(&reg),
            vec![("a".to_string(), SubscriptionState::Requested, true)]
        );
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let mut reg = ChannelRegistry::default();
        assert!(!reg.unsubscribe(&UnsubscribeOptions::channels(["missing"])));
        assert!(reg.snapshot().entries.is_empty());
    }

    #[test]
    fn leave_confirmation_removes_and_reports_announced() {
        let mut reg = ChannelRegistry::default();
        reg.subscribe(&SubscribeOptions::channels(["a", "b", "c"]));
        let snap = reg.snapshot();
        reg.confirm_subscribed(&snap);

        assert!(reg.unsubscribe(&UnsubscribeOptions::channels(["a", "b"])));
        assert!(!reg.unsubscribe(&UnsubscribeOptions::channels(["a"])));
        let snap = reg.snapshot();
        let leave = snap.next_leave().unwrap();
        assert_eq!(leave.channels, vec!["a", "b"]);
        assert!(leave.groups.is_empty());
        assert_eq!(snap.channel_targets().len(), 1);

        let left = reg.confirm_left(&leave);
        assert_eq!(left.channels, vec!["a", "b"]);
        assert_eq!(
            states(&reg),
            vec![("c".to_string(), SubscriptionState::Active, false)]
        );
        assert!(reg.confirm_left(&leave).is_empty());
        assert!(reg.snapshot().next_leave().is_none());
    }

    #[test]
    fn separate_unsubscribe_calls_leave_separately() {
        let mut reg = ChannelRegistry::default();
        reg.subscribe(&SubscribeOptions::channels(["ch1", "ch2", "ch3"]));
        let snap = reg.snapshot();
        reg.confirm_subscribed(&snap);

        reg.unsubscribe(&UnsubscribeOptions::channels(["ch3"]));
        reg.unsubscribe(&UnsubscribeOptions::channels(["ch1", "ch2"]));

        let first = reg.snapshot().next_leave().unwrap();
        assert_eq!(first.channels, vec!["ch3"]);
        assert_eq!(reg.confirm_left(&first).channels, vec!["ch3"]);

        let second = reg.snapshot().next_leave().unwrap();
        assert_eq!(second.channels, vec!["ch1", "ch2"]);
        assert_eq!(reg.confirm_left(&second).channels, vec!["ch1", "ch2"]);
        assert!(reg.snapshot().entries.is_empty());
    }

    #[test]
    fn unsubscribe_again_after_resubscribe_starts_a_new_batch() {
        let mut reg = ChannelRegistry::default();
        reg.subscribe(&SubscribeOptions::channels(["a"]));
        let snap = reg.snapshot();
        reg.confirm_subscribed(&snap);

        reg.unsubscribe(&UnsubscribeOptions::channels(["a"]));
        let stale = reg.snapshot().next_leave().unwrap();
        reg.subscribe(&SubscribeOptions::channels(["a"]));
        reg.unsubscribe(&UnsubscribeOptions::channels(["a"]));

        assert!(reg.confirm_left(&stale).is_empty());
        let current = reg.snapshot().next_leave().unwrap();
        assert_eq!(reg.confirm_left(&current).channels, vec!["a"]);
    }

    #[test]
    fn unannounced_leave_is_silent() {
        let mut reg = ChannelRegistry::default();
        reg.subscribe(&SubscribeOptions::channels(["a"]));
        reg.unsubscribe(&UnsubscribeOptions::channels(["a"]));
        let snap = reg.snapshot();
        assert!(snap.is_idle());
        let leave = snap.next_leave().unwrap();
        assert!(reg.confirm_left(&leave).is_empty());
        assert!(reg.snapshot().entries.is_empty());
    }

    #[test]
    fn resubscribe_before_leave_confirmed_keeps_announcement() {
        let mut reg = ChannelRegistry::default();
        reg.subscribe(&SubscribeOptions::channels(["a"]));
        let snap = reg.snapshot();
        reg.confirm_subscribed(&snap);
        reg.unsubscribe(&UnsubscribeOptions::channels(["a"]));
        let leaving = reg.snapshot().next_leave().unwrap();

        assert!(reg.subscribe(&SubscribeOptions::channels(["a"])));
        // The leave raced with the resubscribe: entry is no longer pending.
        assert!(reg.confirm_left(&leaving).is_empty());
        // Still announced, so the reconfirmation is silent.
        let snap = reg.snapshot();
        assert!(reg.confirm_subscribed(&snap).is_empty());
        assert_eq!(
            states(&reg),
            vec![("a".to_string(), SubscriptionState::Active, false)]
        );
    }

    #[test]
    fn subscribe_and_unsubscribe_commute_per_name() {
        let mut one = ChannelRegistry::default();
        one.subscribe(&SubscribeOptions::channels(["a"]));
        one.subscribe(&SubscribeOptions::channels(["b"]));
        one.unsubscribe(&UnsubscribeOptions::channels(["c"]));

        let mut two = ChannelRegistry::default();
        two.unsubscribe(&UnsubscribeOptions::channels(["c"]));
        two.subscribe(&SubscribeOptions::channels(["b"]));
        two.subscribe(&SubscribeOptions::channels(["a"]));

        assert_eq!(one.snapshot(), two.snapshot());
    }

    #[test]
    fn groups_are_tracked_separately() {
        let mut reg = ChannelRegistry::default();
        reg.subscribe(&SubscribeOptions {
            channels: vec!["x".into()],
            groups: vec!["x".into()],
            with_presence: false,
        });
        let snap = reg.snapshot();
        assert_eq!(snap.entries.len(), 2);
        let confirmed = reg.confirm_subscribed(&snap);
        assert_eq!(confirmed.channels, vec!["x"]);
        assert_eq!(confirmed.groups, vec!["x"]);

        reg.unsubscribe(&UnsubscribeOptions::groups(["x"]));
        let snap = reg.snapshot();
        assert_eq!(snap.group_targets(), vec![]);
        assert_eq!(snap.channel_targets().len(), 1);
    }

    #[test]
    fn unsubscribe_all_marks_everything() {
        let mut reg = ChannelRegistry::default();
        reg.subscribe(&SubscribeOptions::channels(["a", "b"]));
        assert!(reg.unsubscribe_all());
        assert!(reg.snapshot().is_idle());
        assert!(!reg.unsubscribe_all());
    }

    #[test]
    fn restart_requires_fresh_confirmation() {
        let mut reg = ChannelRegistry::default();
        reg.subscribe(&SubscribeOptions::channels(["a"]));
        let snap = reg.snapshot();
        reg.confirm_subscribed(&snap);

        reg.reset_for_restart();
        let snap = reg.snapshot();
        assert!(snap.has_unconfirmed());
        assert_eq!(reg.confirm_subscribed(&snap).channels, vec!["a"]);
    }
}
