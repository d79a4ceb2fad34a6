use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{NewPendingEvent, WebhookPayload};
use crate::repository::{PendingEventRepository, UserMappingRepository};
use crate::service::cooldown::{item_identity_key, CooldownTracker};
use crate::service::parser::EventParser;
use crate::service::peers::PeerRegistry;
use crate::Result;

/// Producer side of the pipeline: turns one inbound webhook into zero or
/// more durable queue rows, one per (intent, target peer).
pub struct Dispatcher {
    config: Arc<Config>,
    peers: Arc<PeerRegistry>,
    queue: PendingEventRepository,
    mappings: UserMappingRepository,
    cooldowns: Arc<CooldownTracker>,
    parser: EventParser,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        peers: Arc<PeerRegistry>,
        queue: PendingEventRepository,
        mappings: UserMappingRepository,
        cooldowns: Arc<CooldownTracker>,
    ) -> Self {
        let parser = EventParser::new(config.sync.clone());
        Self {
            config,
            peers,
            queue,
            mappings,
            cooldowns,
            parser,
        }
    }

    /// Process one webhook from `source_peer`. Returns the number of queue
    /// rows persisted.
    pub async fn handle_webhook(
        &self,
        source_peer: &str,
        payload: &WebhookPayload,
    ) -> Result<u32> {
        let mut payload = payload.clone();

        // Opportunistic mapping refresh: the webhook tells us this user's
        // id on the source peer for free.
        if !payload.username.is_empty() && !payload.user_id.is_empty() {
            self.mappings
                .upsert(&payload.username, source_peer, &payload.user_id)
                .await?;
        }

        self.enrich_item_identity(source_peer, &mut payload).await;
        self.cooldowns.sweep_expired();

        let records = self.parser.parse(source_peer, &payload);
        if records.is_empty() {
            debug!(source_peer, event = %payload.event, "no sync intents from webhook");
            return Ok(0);
        }

        let identity = item_identity_key(
            payload.item_path.as_deref(),
            payload.provider_imdb.as_deref(),
            payload.provider_tmdb.as_deref(),
            payload.provider_tvdb.as_deref(),
        );

        let mut enqueued = 0u32;
        for record in records {
            // A matching cooldown means we recently wrote this state TO the
            // source peer; its webhook is the echo of our own write.
            if self.cooldowns.is_suppressed(
                source_peer,
                &payload.username,
                &identity,
                record.event_type,
            ) {
                debug!(
                    source_peer,
                    event_type = %record.event_type,
                    item = %payload.item_name,
                    "suppressed return event in cooldown"
                );
                continue;
            }

            let event_data = serde_json::to_string(&record.data)?;
            for target in self.config.other_servers(source_peer) {
                let new_event = NewPendingEvent {
                    event_type: record.event_type,
                    source_peer: source_peer.to_string(),
                    target_peer: target.name.clone(),
                    username: payload.username.clone(),
                    source_user_id: payload.user_id.clone(),
                    source_item_id: payload.item_id.clone(),
                    item_name: payload.item_name.clone(),
                    item_path: payload.item_path.clone(),
                    provider_imdb: payload.provider_imdb.clone(),
                    provider_tmdb: payload.provider_tmdb.clone(),
                    provider_tvdb: payload.provider_tvdb.clone(),
                    event_data: event_data.clone(),
                    max_retries: i64::from(self.config.sync.max_retries),
                };

                match self.queue.enqueue(&new_event).await? {
                    Some(_) => enqueued += 1,
                    None => debug!(
                        event_type = %record.event_type,
                        target = %target.name,
                        item = %payload.item_name,
                        "skipping duplicate queued event"
                    ),
                }
            }
        }

        if enqueued > 0 {
            info!(
                source_peer,
                enqueued,
                event = %payload.event,
                user = %payload.username,
                item = %payload.item_name,
                "enqueued sync events"
            );
        }

        Ok(enqueued)
    }

    /// The webhook plugin often omits `Path`; without it neither item
    /// matching nor path policies work, so fetch the item's metadata from
    /// the source peer. Best-effort: the event still flows without it.
    async fn enrich_item_identity(&self, source_peer: &str, payload: &mut WebhookPayload) {
        if payload.item_path.is_some() || payload.item_id.is_empty() || payload.user_id.is_empty()
        {
            return;
        }
        let Some(peer) = self.peers.get(source_peer) else {
            return;
        };

        match peer.get_item_info(&payload.user_id, &payload.item_id).await {
            Ok(item) => {
                payload.item_path = item.path.clone();
                if payload.provider_imdb.is_none() {
                    payload.provider_imdb = item.provider_id("Imdb").map(str::to_string);
                }
                if payload.provider_tmdb.is_none() {
                    payload.provider_tmdb = item.provider_id("Tmdb").map(str::to_string);
                }
                if payload.provider_tvdb.is_none() {
                    payload.provider_tvdb = item.provider_id("Tvdb").map(str::to_string);
                }
                debug!(
                    source_peer,
                    item = %payload.item_name,
                    path = ?payload.item_path,
                    "enriched webhook from source peer"
                );
            }
            Err(e) => warn!(
                source_peer,
                item_id = %payload.item_id,
                "failed to enrich webhook item identity: {e}"
            ),
        }
    }
}
