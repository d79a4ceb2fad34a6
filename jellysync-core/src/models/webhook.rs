use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound webhook envelope.
///
/// Decoding is deliberately tolerant: unknown keys are ignored, every
/// optional field is `Option` so "absent" and "false"/zero stay
/// distinguishable, and fields whose name varies between webhook plugin
/// versions carry aliases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookPayload {
    #[serde(rename = "NotificationType")]
    pub event: String,

    #[serde(rename = "ServerId")]
    pub server_id: String,
    #[serde(rename = "ServerName")]
    pub server_name: String,

    #[serde(rename = "UserId")]
    pub user_id: String,
    #[serde(rename = "NotificationUsername")]
    pub username: String,

    #[serde(rename = "ItemId")]
    pub item_id: String,
    #[serde(rename = "Name")]
    pub item_name: String,
    #[serde(rename = "ItemType")]
    pub item_type: String,
    #[serde(rename = "Path")]
    pub item_path: Option<String>,

    #[serde(rename = "PlaybackPositionTicks")]
    pub playback_position_ticks: Option<i64>,
    #[serde(rename = "PlaybackPosition")]
    pub playback_position: Option<String>,
    #[serde(rename = "PlayedToCompletion")]
    pub played_to_completion: bool,

    #[serde(rename = "IsFavorite", alias = "Favorite")]
    pub is_favorite: Option<bool>,
    #[serde(rename = "Played")]
    pub is_played: Option<bool>,
    #[serde(rename = "Likes")]
    pub likes: Option<bool>,
    #[serde(rename = "PlayCount")]
    pub play_count: Option<i64>,
    #[serde(rename = "LastPlayedDate")]
    pub last_played_date: Option<DateTime<Utc>>,
    #[serde(rename = "AudioStreamIndex")]
    pub audio_stream_index: Option<i64>,
    #[serde(rename = "SubtitleStreamIndex")]
    pub subtitle_stream_index: Option<i64>,
    #[serde(rename = "SaveReason", alias = "saveReason")]
    pub save_reason: Option<String>,

    #[serde(rename = "Provider_imdb")]
    pub provider_imdb: Option<String>,
    #[serde(rename = "Provider_tmdb")]
    pub provider_tmdb: Option<String>,
    #[serde(rename = "Provider_tvdb")]
    pub provider_tvdb: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_playback_stop_envelope() {
        let json = r#"{
            "NotificationType": "PlaybackStop",
            "ServerId": "abc",
            "ServerName": "wan",
            "UserId": "user-1",
            "NotificationUsername": "alice",
            "ItemId": "item-1",
            "Name": "Test Movie",
            "ItemType": "Movie",
            "Path": "/movies/test.mkv",
            "PlayedToCompletion": true,
            "Provider_imdb": "tt1234567",
            "SomeUnknownKey": {"nested": true}
        }"#;

        let payload: WebhookPayload = serde_json::from_str(json).expect("parse");
        assert_eq!(payload.event, "PlaybackStop");
        assert_eq!(payload.username, "alice");
        assert!(payload.played_to_completion);
        assert_eq!(payload.item_path.as_deref(), Some("/movies/test.mkv"));
        assert_eq!(payload.provider_imdb.as_deref(), Some("tt1234567"));
        assert_eq!(payload.is_played, None);
    }

    #[test]
    fn absent_and_false_stay_distinguishable() {
        let absent: WebhookPayload =
            serde_json::from_str(r#"{"NotificationType": "UserDataSaved"}"#).expect("parse");
        assert_eq!(absent.is_favorite, None);

        let explicit: WebhookPayload = serde_json::from_str(
            r#"{"NotificationType": "UserDataSaved", "IsFavorite": false}"#,
        )
        .expect("parse");
        assert_eq!(explicit.is_favorite, Some(false));
    }

    #[test]
    fn favorite_alias_is_accepted() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{"NotificationType": "UserDataSaved", "Favorite": true}"#,
        )
        .expect("parse");
        assert_eq!(payload.is_favorite, Some(true));
    }

    #[test]
    fn null_optionals_are_tolerated() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{"NotificationType": "PlaybackProgress", "Path": null, "PlaybackPositionTicks": null}"#,
        )
        .expect("parse");
        assert_eq!(payload.item_path, None);
        assert_eq!(payload.playback_position_ticks, None);
    }

    #[test]
    fn parses_last_played_date() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{"NotificationType": "UserDataSaved", "LastPlayedDate": "2024-06-01T10:30:00.0000000Z"}"#,
        )
        .expect("parse");
        assert!(payload.last_played_date.is_some());
    }
}
