use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of one user on one peer. Usernames are stored lowercased so the
/// (username, peer) pair is unique regardless of display casing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMapping {
    pub id: i64,
    pub username: String,
    pub peer_name: String,
    pub peer_user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cached (peer, storage path) → peer-local item id. Entries may be stale;
/// a 404 from a mutation that used the cached id invalidates the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemPathCacheEntry {
    pub id: i64,
    pub peer_name: String,
    pub item_path: String,
    pub peer_item_id: String,
    pub item_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}
