//! Named multicast channels.
//!
//! A channel borrows its members: it stores connection ids, never record
//! handles. Iteration resolves ids through the hub index, so deregistering
//! a client needs no back-pointers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// A named channel. Created lazily on first join; persists after its last
/// member leaves so in-flight broadcasts never race channel teardown.
pub struct Channel {
    pub name: String,
    members: RwLock<HashSet<String>>,
    require_auth: AtomicBool,
    private: AtomicBool,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: RwLock::new(HashSet::new()),
            require_auth: AtomicBool::new(false),
            private: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    pub fn requires_auth(&self) -> bool {
        self.require_auth.load(Ordering::Acquire)
    }

    pub fn is_private(&self) -> bool {
        self.private.load(Ordering::Acquire)
    }

    /// Set policy flags; admin surface only.
    pub fn set_policy(&self, require_auth: bool, private: bool) {
        self.require_auth.store(require_auth, Ordering::Release);
        self.private.store(private, Ordering::Release);
    }

    pub fn add_member(&self, client_id: &str) {
        let _ = self.members.write().insert(client_id.to_string());
    }

    pub fn remove_member(&self, client_id: &str) -> bool {
        self.members.write().remove(client_id)
    }

    pub fn has_member(&self, client_id: &str) -> bool {
        self.members.read().contains(client_id)
    }

    /// Defensive snapshot of member ids. Callers iterate the snapshot, so
    /// membership changes during a broadcast cannot invalidate iteration.
    pub fn members(&self) -> Vec<String> {
        self.members.read().iter().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    /// Admin listing entry; holds no lock beyond the count read.
    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            name: self.name.clone(),
            is_private: self.is_private(),
            require_auth: self.requires_auth(),
            client_count: self.member_count(),
            created_at: self.created_at,
        }
    }
}

/// What the admin API reports per channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub name: String,
    pub is_private: bool,
    pub require_auth: bool,
    pub client_count: usize,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_channel_is_open_and_empty() {
        let ch = Channel::new("room1");
        assert_eq!(ch.name, "room1");
        assert!(!ch.requires_auth());
        assert!(!ch.is_private());
        assert_eq!(ch.member_count(), 0);
    }

    #[test]
    fn add_and_remove_members() {
        let ch = Channel::new("room1");
        ch.add_member("c1");
        ch.add_member("c2");
        assert_eq!(ch.member_count(), 2);
        assert!(ch.has_member("c1"));

        assert!(ch.remove_member("c1"));
        assert!(!ch.has_member("c1"));
        assert!(!ch.remove_member("c1"));
        assert_eq!(ch.member_count(), 1);
    }

    #[test]
    fn duplicate_add_is_noop() {
        let ch = Channel::new("room1");
        ch.add_member("c1");
        ch.add_member("c1");
        assert_eq!(ch.member_count(), 1);
    }

    #[test]
    fn members_returns_snapshot() {
        let ch = Channel::new("room1");
        ch.add_member("c1");
        let snapshot = ch.members();
        ch.add_member("c2");
        // The earlier snapshot is unaffected by the later mutation.
        assert_eq!(snapshot.len(), 1);
        assert_eq!(ch.member_count(), 2);
    }

    #[test]
    fn policy_flags_settable() {
        let ch = Channel::new("secret");
        ch.set_policy(true, true);
        assert!(ch.requires_auth());
        assert!(ch.is_private());
        ch.set_policy(false, false);
        assert!(!ch.requires_auth());
    }

    #[test]
    fn summary_fields() {
        let ch = Channel::new("room1");
        ch.set_policy(true, false);
        ch.add_member("c1");
        let s = ch.summary();
        assert_eq!(s.name, "room1");
        assert!(s.require_auth);
        assert!(!s.is_private);
        assert_eq!(s.client_count, 1);
    }

    #[test]
    fn summary_serializes_expected_keys() {
        let ch = Channel::new("room1");
        let wire = serde_json::to_value(ch.summary()).unwrap();
        for key in ["name", "is_private", "require_auth", "client_count", "created_at"] {
            assert!(wire.get(key).is_some(), "missing key {key}");
        }
    }
}
