use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A user account on a peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserDto {
    pub id: String,
    pub name: String,
    pub policy: Option<UserPolicy>,
}

impl Default for UserDto {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            policy: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserPolicy {
    pub is_administrator: bool,
    pub is_disabled: bool,
}

/// A library item as returned by the items endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ItemDto {
    pub id: String,
    pub name: String,
    #[serde(rename = "Type")]
    pub item_type: String,
    pub path: Option<String>,
    pub provider_ids: Option<HashMap<String, String>>,
    pub user_data: Option<UserDataDto>,
}

impl ItemDto {
    /// Provider id by name ("Imdb", "Tmdb", "Tvdb"), case-insensitive on
    /// the key since peers are not consistent about casing.
    #[must_use]
    pub fn provider_id(&self, provider: &str) -> Option<&str> {
        let ids = self.provider_ids.as_ref()?;
        ids.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(provider))
            .map(|(_, v)| v.as_str())
    }
}

/// One page of an items listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ItemsPage {
    pub items: Vec<ItemDto>,
    pub total_record_count: i64,
}

/// Per-user state attached to an item.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserDataDto {
    pub playback_position_ticks: Option<i64>,
    pub play_count: Option<i64>,
    pub is_favorite: Option<bool>,
    pub played: Option<bool>,
    pub likes: Option<bool>,
    pub last_played_date: Option<DateTime<Utc>>,
    pub rating: Option<f64>,
    pub audio_stream_index: Option<i64>,
    pub subtitle_stream_index: Option<i64>,
}

/// Partial user-data update; absent fields are left untouched on the peer.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserDataUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_position_ticks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub played: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_played_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likes: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle_stream_index: Option<i64>,
}

impl UserDataUpdate {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.playback_position_ticks.is_none()
            && self.play_count.is_none()
            && self.played.is_none()
            && self.last_played_date.is_none()
            && self.likes.is_none()
            && self.audio_stream_index.is_none()
            && self.subtitle_stream_index.is_none()
    }
}

/// Response of `GET /System/Info/Public`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PublicSystemInfo {
    pub id: String,
    pub server_name: String,
    pub version: String,
}
