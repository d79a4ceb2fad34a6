pub mod item_path_cache;
pub mod pending_event;
pub mod sync_log;
pub mod user_mapping;

pub use item_path_cache::ItemPathCacheRepository;
pub use pending_event::PendingEventRepository;
pub use sync_log::SyncLogRepository;
pub use user_mapping::UserMappingRepository;
