use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::SyncConfig;
use crate::models::{EventData, SyncEventType, WebhookPayload};

/// One sync intent extracted from a webhook envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub event_type: SyncEventType,
    pub data: EventData,
}

/// Converts webhook envelopes into sync intents, honoring the per-category
/// feature flags and debouncing progress updates.
///
/// Pure apart from the debounce map: the same envelope with the same
/// debounce state always yields the same records.
pub struct EventParser {
    sync: SyncConfig,
    /// (source peer, username, item id) → last emitted progress intent.
    progress_seen: Mutex<HashMap<(String, String, String), Instant>>,
}

impl EventParser {
    #[must_use]
    pub fn new(sync: SyncConfig) -> Self {
        Self {
            sync,
            progress_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn parse(&self, source_peer: &str, payload: &WebhookPayload) -> Vec<ParsedRecord> {
        let mut records = Vec::new();

        match payload.event.as_str() {
            "PlaybackStop" => {
                if payload.played_to_completion && self.sync.watched_status {
                    records.push(ParsedRecord {
                        event_type: SyncEventType::Watched,
                        data: EventData {
                            is_played: Some(true),
                            ..EventData::default()
                        },
                    });
                }
            }
            "PlaybackProgress" => {
                let ticks = payload.playback_position_ticks.unwrap_or(0);
                if self.sync.playback_progress
                    && ticks > 0
                    && self.should_emit_progress(source_peer, payload)
                {
                    records.push(ParsedRecord {
                        event_type: SyncEventType::Progress,
                        data: EventData {
                            position_ticks: Some(ticks),
                            ..EventData::default()
                        },
                    });
                }
            }
            "UserDataSaved" => {
                // Bulk library operations replay every item's state; mirroring
                // them would flood the queue.
                if payload
                    .save_reason
                    .as_deref()
                    .is_some_and(|r| r.eq_ignore_ascii_case("import"))
                {
                    return records;
                }
                self.parse_user_data_saved(payload, &mut records);
            }
            _ => {}
        }

        records
    }

    fn parse_user_data_saved(&self, payload: &WebhookPayload, records: &mut Vec<ParsedRecord>) {
        if self.sync.watched_status {
            if let Some(is_played) = payload.is_played {
                records.push(ParsedRecord {
                    event_type: SyncEventType::Watched,
                    data: EventData {
                        is_played: Some(is_played),
                        ..EventData::default()
                    },
                });
            }
        }

        if self.sync.favorites {
            if let Some(is_favorite) = payload.is_favorite {
                records.push(ParsedRecord {
                    event_type: SyncEventType::Favorite,
                    data: EventData {
                        is_favorite: Some(is_favorite),
                        ..EventData::default()
                    },
                });
            }
        }

        if self.sync.likes {
            if let Some(likes) = payload.likes {
                records.push(ParsedRecord {
                    event_type: SyncEventType::Likes,
                    data: EventData {
                        likes: Some(likes),
                        ..EventData::default()
                    },
                });
            }
        }

        if self.sync.play_count {
            if let Some(play_count) = payload.play_count {
                records.push(ParsedRecord {
                    event_type: SyncEventType::PlayCount,
                    data: EventData {
                        play_count: Some(play_count),
                        ..EventData::default()
                    },
                });
            }
        }

        if self.sync.last_played_date {
            if let Some(last_played) = payload.last_played_date {
                records.push(ParsedRecord {
                    event_type: SyncEventType::LastPlayed,
                    data: EventData {
                        last_played: Some(last_played),
                        ..EventData::default()
                    },
                });
            }
        }

        if self.sync.audio_stream {
            if let Some(index) = payload.audio_stream_index {
                records.push(ParsedRecord {
                    event_type: SyncEventType::AudioStream,
                    data: EventData {
                        audio_stream_index: Some(index),
                        ..EventData::default()
                    },
                });
            }
        }

        if self.sync.subtitle_stream {
            if let Some(index) = payload.subtitle_stream_index {
                records.push(ParsedRecord {
                    event_type: SyncEventType::SubtitleStream,
                    data: EventData {
                        subtitle_stream_index: Some(index),
                        ..EventData::default()
                    },
                });
            }
        }
    }

    /// At most one progress intent per (peer, user, item) per debounce
    /// window; the first value in a window wins.
    fn should_emit_progress(&self, source_peer: &str, payload: &WebhookPayload) -> bool {
        let window = Duration::from_secs(self.sync.progress_debounce_seconds);
        let key = (
            source_peer.to_string(),
            payload.username.to_lowercase(),
            payload.item_id.clone(),
        );

        let now = Instant::now();
        let mut seen = self.progress_seen.lock();
        if let Some(last) = seen.get(&key) {
            if now.duration_since(*last) < window {
                return false;
            }
        }
        seen.insert(key, now);
        true
    }
}
