use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State categories mirrored between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    Progress,
    Watched,
    Favorite,
    Rating,
    Likes,
    PlayCount,
    LastPlayed,
    AudioStream,
    SubtitleStream,
}

impl SyncEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Watched => "watched",
            Self::Favorite => "favorite",
            Self::Rating => "rating",
            Self::Likes => "likes",
            Self::PlayCount => "play_count",
            Self::LastPlayed => "last_played",
            Self::AudioStream => "audio_stream",
            Self::SubtitleStream => "subtitle_stream",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "progress" => Some(Self::Progress),
            "watched" => Some(Self::Watched),
            "favorite" => Some(Self::Favorite),
            "rating" => Some(Self::Rating),
            "likes" => Some(Self::Likes),
            "play_count" => Some(Self::PlayCount),
            "last_played" => Some(Self::LastPlayed),
            "audio_stream" => Some(Self::AudioStream),
            "subtitle_stream" => Some(Self::SubtitleStream),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue row lifecycle. `Failed` is terminal: such rows are only touched by
/// a manual retry through the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingEventStatus {
    Pending,
    Processing,
    WaitingForItem,
    Failed,
}

impl PendingEventStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::WaitingForItem => "waiting_for_item",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "waiting_for_item" => Some(Self::WaitingForItem),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PendingEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload carried by a queue row, serialized into `event_data`. Only the
/// field relevant to the row's event type is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_played: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_ticks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likes: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_played: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle_stream_index: Option<i64>,
}

/// A durable queue row (write-ahead log entry for one mirror write).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEvent {
    pub id: i64,
    pub event_type: SyncEventType,
    pub source_peer: String,
    pub target_peer: String,
    pub username: String,
    pub source_user_id: String,
    pub source_item_id: String,
    pub item_name: String,
    pub item_path: Option<String>,
    pub provider_imdb: Option<String>,
    pub provider_tmdb: Option<String>,
    pub provider_tvdb: Option<String>,
    pub event_data: String,
    pub status: PendingEventStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub last_error: Option<String>,
    pub item_not_found_count: i64,
    pub item_not_found_max: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl PendingEvent {
    /// Parse the serialized payload.
    pub fn data(&self) -> serde_json::Result<EventData> {
        serde_json::from_str(&self.event_data)
    }
}

/// Insert form for a new queue row.
#[derive(Debug, Clone)]
pub struct NewPendingEvent {
    pub event_type: SyncEventType,
    pub source_peer: String,
    pub target_peer: String,
    pub username: String,
    pub source_user_id: String,
    pub source_item_id: String,
    pub item_name: String,
    pub item_path: Option<String>,
    pub provider_imdb: Option<String>,
    pub provider_tmdb: Option<String>,
    pub provider_tvdb: Option<String>,
    pub event_data: String,
    pub max_retries: i64,
}

/// Append-only audit record. Never read back by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub event_type: String,
    pub source_peer: String,
    pub target_peer: String,
    pub username: String,
    pub source_item_id: Option<String>,
    pub item_name: Option<String>,
    pub synced_value: Option<String>,
    pub success: bool,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSyncLogEntry<'a> {
    pub event_type: &'a str,
    pub source_peer: &'a str,
    pub target_peer: &'a str,
    pub username: &'a str,
    pub source_item_id: Option<&'a str>,
    pub item_name: Option<&'a str>,
    pub synced_value: Option<&'a str>,
    pub success: bool,
    pub message: &'a str,
}

/// Queue depth by status, for the status API.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub waiting_for_item: i64,
    pub failed: i64,
}

/// Sync log rollup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_storage_form() {
        let all = [
            SyncEventType::Progress,
            SyncEventType::Watched,
            SyncEventType::Favorite,
            SyncEventType::Rating,
            SyncEventType::Likes,
            SyncEventType::PlayCount,
            SyncEventType::LastPlayed,
            SyncEventType::AudioStream,
            SyncEventType::SubtitleStream,
        ];
        for event_type in all {
            assert_eq!(SyncEventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(SyncEventType::parse("bogus"), None);
    }

    #[test]
    fn event_data_serializes_only_present_fields() {
        let data = EventData {
            is_played: Some(true),
            ..EventData::default()
        };
        let json = serde_json::to_string(&data).expect("serialize");
        assert_eq!(json, r#"{"is_played":true}"#);

        let parsed: EventData = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.is_played, Some(true));
        assert_eq!(parsed.position_ticks, None);
    }

    #[test]
    fn status_parse_rejects_unknown() {
        assert_eq!(
            PendingEventStatus::parse("waiting_for_item"),
            Some(PendingEventStatus::WaitingForItem)
        );
        assert_eq!(PendingEventStatus::parse("done"), None);
    }
}
