use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::SyncEventType;

/// Default suppression window after a successful mirror write.
pub const DEFAULT_COOLDOWN_TTL: Duration = Duration::from_secs(30);

/// Cross-peer identity of a media item.
///
/// Peer-local item ids differ per peer, so loop suppression must key on
/// something every peer agrees on: the storage path, or failing that an
/// external provider id. An empty key disables cooldown for that event.
#[must_use]
pub fn item_identity_key(
    item_path: Option<&str>,
    provider_imdb: Option<&str>,
    provider_tmdb: Option<&str>,
    provider_tvdb: Option<&str>,
) -> String {
    if let Some(path) = item_path {
        return format!("path:{path}");
    }
    if let Some(imdb) = provider_imdb {
        return format!("imdb:{imdb}");
    }
    if let Some(tmdb) = provider_tmdb {
        return format!("tmdb:{tmdb}");
    }
    if let Some(tvdb) = provider_tvdb {
        return format!("tvdb:{tvdb}");
    }
    String::new()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    peer: String,
    username: String,
    identity: String,
    event_type: SyncEventType,
}

/// Time-limited suppression of return webhooks.
///
/// After a successful write of event `E` for item `I` to peer `P`, the
/// worker registers `(P, user, I, E)` here; the dispatcher then discards
/// matching events arriving *from* `P` until the TTL lapses. This is the
/// primary defense against A→B→A sync loops.
pub struct CooldownTracker {
    ttl: Duration,
    entries: Mutex<HashMap<CooldownKey, Instant>>,
}

impl CooldownTracker {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(peer: &str, username: &str, identity: &str, event_type: SyncEventType) -> CooldownKey {
        CooldownKey {
            peer: peer.to_string(),
            username: username.to_lowercase(),
            identity: identity.to_string(),
            event_type,
        }
    }

    /// Register a cooldown after a successful mirror write. No-op when the
    /// item has no cross-peer identity.
    pub fn set(&self, peer: &str, username: &str, identity: &str, event_type: SyncEventType) {
        if identity.is_empty() {
            return;
        }
        let expiry = Instant::now() + self.ttl;
        self.entries
            .lock()
            .insert(Self::key(peer, username, identity, event_type), expiry);
    }

    /// Should an inbound event from `peer` be discarded? Expired entries
    /// are cleaned up on the way.
    pub fn is_suppressed(
        &self,
        peer: &str,
        username: &str,
        identity: &str,
        event_type: SyncEventType,
    ) -> bool {
        if identity.is_empty() {
            return false;
        }
        let key = Self::key(peer, username, identity, event_type);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(expiry) if Instant::now() < *expiry => true,
            Some(_) => {
                entries.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Drop every expired entry; called on each webhook intake.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|_, expiry| now < *expiry);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_prefers_path_then_providers_in_order() {
        assert_eq!(
            item_identity_key(Some("/movies/test.mkv"), Some("tt1"), Some("2"), Some("3")),
            "path:/movies/test.mkv"
        );
        assert_eq!(
            item_identity_key(None, Some("tt1234567"), Some("2"), Some("3")),
            "imdb:tt1234567"
        );
        assert_eq!(item_identity_key(None, None, Some("12345"), Some("3")), "tmdb:12345");
        assert_eq!(item_identity_key(None, None, None, Some("67890")), "tvdb:67890");
        assert_eq!(item_identity_key(None, None, None, None), "");
    }

    #[test]
    fn suppression_is_scoped_by_event_type_and_peer() {
        let tracker = CooldownTracker::default();
        tracker.set("lan", "alice", "path:/movies/test.mkv", SyncEventType::Watched);

        assert!(tracker.is_suppressed("lan", "alice", "path:/movies/test.mkv", SyncEventType::Watched));
        assert!(!tracker.is_suppressed("lan", "alice", "path:/movies/test.mkv", SyncEventType::Favorite));
        assert!(!tracker.is_suppressed("backup", "alice", "path:/movies/test.mkv", SyncEventType::Watched));
        assert!(!tracker.is_suppressed("lan", "bob", "path:/movies/test.mkv", SyncEventType::Watched));
    }

    #[test]
    fn username_comparison_ignores_case() {
        let tracker = CooldownTracker::default();
        tracker.set("lan", "Alice", "path:/movies/test.mkv", SyncEventType::Watched);
        assert!(tracker.is_suppressed("lan", "ALICE", "path:/movies/test.mkv", SyncEventType::Watched));
    }

    #[test]
    fn empty_identity_disables_cooldown() {
        let tracker = CooldownTracker::default();
        tracker.set("lan", "alice", "", SyncEventType::Watched);
        assert!(tracker.is_empty());
        assert!(!tracker.is_suppressed("lan", "alice", "", SyncEventType::Watched));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let tracker = CooldownTracker::new(Duration::from_millis(20));
        tracker.set("lan", "alice", "imdb:tt1", SyncEventType::Progress);
        assert!(tracker.is_suppressed("lan", "alice", "imdb:tt1", SyncEventType::Progress));

        std::thread::sleep(Duration::from_millis(30));
        assert!(!tracker.is_suppressed("lan", "alice", "imdb:tt1", SyncEventType::Progress));
        // The expired entry was removed by the lookup.
        assert!(tracker.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let tracker = CooldownTracker::new(Duration::from_millis(20));
        tracker.set("lan", "alice", "imdb:tt1", SyncEventType::Watched);
        std::thread::sleep(Duration::from_millis(30));
        tracker.set("lan", "alice", "imdb:tt2", SyncEventType::Watched);

        tracker.sweep_expired();
        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_suppressed("lan", "alice", "imdb:tt2", SyncEventType::Watched));
    }
}
