//! Service graph construction and dependency injection.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::repository::{
    ItemPathCacheRepository, PendingEventRepository, SyncLogRepository, UserMappingRepository,
};
use crate::service::{
    CooldownTracker, Dispatcher, ItemResolver, PeerRegistry, SyncWorker, UserService,
};

/// Everything the HTTP layer and the binary need, wired once at startup.
/// No hidden globals: this context is passed explicitly.
pub struct Services {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub peers: Arc<PeerRegistry>,
    pub queue: PendingEventRepository,
    pub mappings: UserMappingRepository,
    pub sync_log: SyncLogRepository,
    pub cooldowns: Arc<CooldownTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub worker: Arc<SyncWorker>,
    pub users: Arc<UserService>,
}

pub async fn init_services(pool: SqlitePool, config: Arc<Config>) -> Result<Services> {
    let peers = Arc::new(
        PeerRegistry::from_config(&config)
            .map_err(|e| anyhow::anyhow!("failed to build peer clients: {e}"))?,
    );

    let queue = PendingEventRepository::new(pool.clone());
    let mappings = UserMappingRepository::new(pool.clone());
    let cache = ItemPathCacheRepository::new(pool.clone());
    let sync_log = SyncLogRepository::new(pool.clone());
    let cooldowns = Arc::new(CooldownTracker::default());

    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        peers.clone(),
        queue.clone(),
        mappings.clone(),
        cooldowns.clone(),
    ));

    let worker = Arc::new(SyncWorker::new(
        config.clone(),
        peers.clone(),
        queue.clone(),
        mappings.clone(),
        ItemResolver::new(cache),
        cooldowns.clone(),
    ));

    let users = Arc::new(UserService::new(
        config.clone(),
        peers.clone(),
        mappings.clone(),
    ));

    // Crash recovery: rows left in-flight by a previous process resume.
    let recovered = queue.reset_all_processing().await?;
    if recovered > 0 {
        info!(recovered, "recovered in-flight events from previous run");
    }

    Ok(Services {
        config,
        pool,
        peers,
        queue,
        mappings,
        sync_log,
        cooldowns,
        dispatcher,
        worker,
        users,
    })
}
