use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::realtime::PresenceSnapshot;

/// What one connection announces about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub is_typing: bool,
}

/// Counts other participants whose first tracked state says they are typing.
pub fn count_typing(snapshot: &PresenceSnapshot, self_key: &str) -> usize {
    snapshot
        .iter()
        .filter(|(key, _)| key.as_str() != self_key)
        .filter_map(|(_, states)| states.first())
        .filter(|state| {
            serde_json::from_value::<PresenceState>((*state).clone())
                .is_ok_and(|s| s.is_typing)
        })
        .count()
}

/// Local typing flag with its idle timer, plus the derived count of others typing.
#[derive(Debug)]
pub struct PresenceTracker {
    key:       String,
    idle:      Duration,
    typing:    bool,
    deadline:  Option<Instant>,
    others:    usize,
}

impl PresenceTracker {
    pub fn new(key: impl Into<String>, idle: Duration) -> Self {
        Self { key: key.into(), idle, typing: false, deadline: None, others: 0 }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    pub fn typing_count(&self) -> usize {
        self.others
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Recomputes the aggregate; returns the new count if it moved.
    pub fn sync(&mut self, snapshot: &PresenceSnapshot) -> Option<usize> {
        let n = count_typing(snapshot, &self.key);
        (n != self.others).then(|| {
            self.others = n;
            n
        })
    }

    /// Restarts the idle timer. Returns the state to publish on an idle→typing edge.
    pub fn keystroke(&mut self, now: Instant) -> Option<PresenceState> {
        self.deadline = Some(now + self.idle);
        (!self.typing).then(|| {
            self.typing = true;
            PresenceState { is_typing: true }
        })
    }

    /// Fires the idle timer if it is due.
    pub fn expire(&mut self, now: Instant) -> Option<PresenceState> {
        match self.deadline {
            Some(at) if at <= now => self.force_idle(),
            _ => None,
        }
    }

    /// Drops back to not-typing at once and cancels the timer.
    pub fn force_idle(&mut self) -> Option<PresenceState> {
        self.deadline = None;
        std::mem::take(&mut self.typing).then_some(PresenceState { is_typing: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(entries: &[(&str, &[bool])]) -> PresenceSnapshot {
        entries
            .iter()
            .map(|(k, states)| {
                (k.to_string(), states.iter().map(|t| json!({ "is_typing": t })).collect())
            })
            .collect()
    }

    #[test]
    fn counts_others_only() {
        let s = snap(&[("me", &[true]), ("a", &[true]), ("b", &[false]), ("c", &[true])]);
        assert_eq!(count_typing(&s, "me"), 2);
        assert_eq!(count_typing(&s, "nobody"), 3);
    }

    #[test]
    fn only_the_first_state_counts() {
        let s = snap(&[("a", &[false, true]), ("b", &[true, false])]);
        assert_eq!(count_typing(&s, "me"), 1);
    }

    #[test]
    fn malformed_states_are_not_typing() {
        let mut s = PresenceSnapshot::new();
        s.insert("a".into(), vec![json!("typing")]);
        s.insert("b".into(), vec![]);
        assert_eq!(count_typing(&s, "me"), 0);
    }

    #[test]
    fn sync_reports_changes_only() {
        let mut t = PresenceTracker::new("me", Duration::from_secs(3));
        assert_eq!(t.sync(&snap(&[("a", &[true])])), Some(1));
        assert_eq!(t.sync(&snap(&[("a", &[true])])), None);
        assert_eq!(t.sync(&snap(&[])), Some(0));
        assert_eq!(t.typing_count(), 0);
    }

    #[test]
    fn first_keystroke_publishes_then_timer_restarts() {
        let mut t = PresenceTracker::new("me", Duration::from_secs(3));
        let t0 = Instant::now();
        assert_eq!(t.keystroke(t0), Some(PresenceState { is_typing: true }));
        assert_eq!(t.keystroke(t0 + Duration::from_secs(2)), None);
        assert_eq!(t.deadline(), Some(t0 + Duration::from_secs(5)));

        // old deadline passes without firing
        assert_eq!(t.expire(t0 + Duration::from_secs(4)), None);
        assert!(t.is_typing());
        assert_eq!(t.expire(t0 + Duration::from_secs(5)), Some(PresenceState { is_typing: false }));
        assert_eq!(t.deadline(), None);
    }

    #[test]
    fn force_idle_cancels_timer() {
        let mut t = PresenceTracker::new("me", Duration::from_secs(3));
        let t0 = Instant::now();
        t.keystroke(t0);
        assert_eq!(t.force_idle(), Some(PresenceState { is_typing: false }));
        assert_eq!(t.deadline(), None);
        assert_eq!(t.force_idle(), None);
        assert_eq!(t.expire(t0 + Duration::from_secs(10)), None);
    }
}
