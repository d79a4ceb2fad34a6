use async_singleflight::Group;
use tracing::{debug, info};

use crate::peer::{PeerClient, PeerError, LIBRARY_PAGE_SIZE};
use crate::repository::ItemPathCacheRepository;
use crate::{Error, Result};

/// Outcome of an item lookup on a target peer.
#[derive(Debug, Clone)]
pub struct ResolvedItem {
    pub item_id: String,
    pub item_name: Option<String>,
    /// True when the id came from the path cache rather than a live search;
    /// a 404 on the subsequent mutation then means the entry is stale.
    pub from_cache: bool,
}

/// Resolves a queue event's item identity to a peer-local item id.
///
/// Path lookups go through the per-peer path cache. On a miss the full
/// library is paged into the cache under a per-peer singleflight: a burst
/// of parallel lookups for fresh imports runs exactly one refresh, with
/// every waiter re-checking the cache once the leader finishes.
pub struct ItemResolver {
    cache: ItemPathCacheRepository,
    refresh: Group<String, (), String>,
}

impl ItemResolver {
    #[must_use]
    pub fn new(cache: ItemPathCacheRepository) -> Self {
        Self {
            cache,
            refresh: Group::new(),
        }
    }

    /// Find an item by storage path first, then by provider ids.
    pub async fn resolve(
        &self,
        peer: &PeerClient,
        item_path: Option<&str>,
        provider_imdb: Option<&str>,
        provider_tmdb: Option<&str>,
        provider_tvdb: Option<&str>,
    ) -> Result<Option<ResolvedItem>> {
        if let Some(path) = item_path {
            if let Some(resolved) = self.find_by_path(peer, path).await? {
                return Ok(Some(resolved));
            }
        }

        if provider_imdb.is_some() || provider_tmdb.is_some() || provider_tvdb.is_some() {
            let admin = peer.get_admin_user_id().await?;
            if let Some(item) = peer
                .find_item_by_provider_id(admin, provider_imdb, provider_tmdb, provider_tvdb)
                .await?
            {
                return Ok(Some(ResolvedItem {
                    item_id: item.id,
                    item_name: Some(item.name),
                    from_cache: false,
                }));
            }
        }

        Ok(None)
    }

    /// Path lookup: cache hit (verified against the peer), else one shared
    /// library refresh, else not found.
    pub async fn find_by_path(
        &self,
        peer: &PeerClient,
        path: &str,
    ) -> Result<Option<ResolvedItem>> {
        if let Some(entry) = self.cache.get(peer.name(), path).await? {
            let admin = peer.get_admin_user_id().await?;
            match peer.get_item_info(admin, &entry.peer_item_id).await {
                Ok(item) => {
                    let item_name = Some(item.name).filter(|n| !n.is_empty()).or(entry.item_name);
                    return Ok(Some(ResolvedItem {
                        item_id: entry.peer_item_id,
                        item_name,
                        from_cache: true,
                    }));
                }
                Err(PeerError::NotFound) => {
                    debug!(peer = peer.name(), path, "stale path cache entry, invalidating");
                    self.cache.invalidate(peer.name(), Some(path)).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.refresh_library(peer).await?;

        Ok(self.cache.get(peer.name(), path).await?.map(|entry| ResolvedItem {
            item_id: entry.peer_item_id,
            item_name: entry.item_name,
            from_cache: false,
        }))
    }

    /// Drop a cache entry whose id the peer no longer recognizes.
    pub async fn invalidate(&self, peer_name: &str, path: &str) -> Result<()> {
        self.cache.invalidate(peer_name, Some(path)).await?;
        Ok(())
    }

    /// Page the peer's full library into the path cache. Concurrent callers
    /// for the same peer share one in-flight refresh; a caller that arrives
    /// while a refresh runs waits for it instead of starting another.
    async fn refresh_library(&self, peer: &PeerClient) -> Result<()> {
        let key = peer.name().to_string();
        self.refresh
            .work(&key, async {
                self.do_refresh(peer).await.map_err(|e| e.to_string())
            })
            .await
            .map_err(|err| match err {
                Some(message) => Error::Internal(message),
                None => Error::Internal("library refresh leader was dropped".to_string()),
            })
    }

    async fn do_refresh(&self, peer: &PeerClient) -> Result<()> {
        let admin = peer.get_admin_user_id().await?;

        let mut entries: Vec<(String, String, Option<String>)> = Vec::new();
        let mut start_index = 0i64;
        loop {
            let page = peer
                .list_library_items(admin, start_index, LIBRARY_PAGE_SIZE)
                .await?;
            let fetched = page.items.len() as i64;
            for item in page.items {
                if let Some(path) = item.path {
                    entries.push((path, item.id, Some(item.name)));
                }
            }
            start_index += fetched;
            if fetched == 0 || start_index >= page.total_record_count {
                break;
            }
        }

        info!(
            peer = peer.name(),
            items = entries.len(),
            "refreshed item path cache"
        );
        self.cache.put_batch(peer.name(), &entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::test_support::memory_pool;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (Arc<PeerClient>, ItemResolver) {
        let peer = PeerClient::new(&PeerConfig {
            name: "lan".to_string(),
            url: server.uri(),
            api_key: "key".to_string(),
            passwordless: false,
        })
        .expect("client");
        let resolver = ItemResolver::new(ItemPathCacheRepository::new(memory_pool().await));
        (Arc::new(peer), resolver)
    }

    fn mount_users(server: &MockServer) -> Mock {
        Mock::given(method("GET"))
            .and(path("/Users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"Id": "u-admin", "Name": "Admin", "Policy": {"IsAdministrator": true}}
            ])))
    }

    fn library_page() -> serde_json::Value {
        serde_json::json!({
            "Items": [
                {"Id": "item-1", "Name": "Test Movie", "Type": "Movie", "Path": "/movies/test.mkv"},
                {"Id": "item-2", "Name": "Other", "Type": "Movie", "Path": "/movies/other.mkv"},
                {"Id": "item-3", "Name": "Pathless", "Type": "Movie"}
            ],
            "TotalRecordCount": 3
        })
    }

    #[tokio::test]
    async fn miss_triggers_one_refresh_then_resolves_from_cache() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items"))
            .and(query_param("startIndex", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(library_page()))
            .expect(1)
            .mount(&server)
            .await;

        let (peer, resolver) = setup(&server).await;
        let resolved = resolver
            .find_by_path(&peer, "/movies/test.mkv")
            .await
            .expect("resolve")
            .expect("found");
        assert_eq!(resolved.item_id, "item-1");
        assert!(!resolved.from_cache);

        // Items without a path are not cached.
        assert_eq!(resolver.cache.count_for_peer("lan").await.expect("count"), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_share_a_single_refresh() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(library_page())
                    .set_delay(std::time::Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (peer, resolver) = setup(&server).await;
        let resolver = Arc::new(resolver);

        let (a, b) = tokio::join!(
            resolver.find_by_path(&peer, "/movies/test.mkv"),
            resolver.find_by_path(&peer, "/movies/other.mkv"),
        );
        assert_eq!(a.expect("resolve").expect("found").item_id, "item-1");
        assert_eq!(b.expect("resolve").expect("found").item_id, "item-2");
    }

    #[tokio::test]
    async fn stale_cache_entry_is_invalidated_and_refetched() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        // The stale id draws a 404; the refresh then supplies the new id.
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items/stale-id"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(library_page()))
            .expect(1)
            .mount(&server)
            .await;

        let (peer, resolver) = setup(&server).await;
        resolver
            .cache
            .put("lan", "/movies/test.mkv", "stale-id", None)
            .await
            .expect("seed cache");

        let resolved = resolver
            .find_by_path(&peer, "/movies/test.mkv")
            .await
            .expect("resolve")
            .expect("found");
        assert_eq!(resolved.item_id, "item-1");
    }

    #[tokio::test]
    async fn cache_hit_skips_the_refresh() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items/item-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Id": "item-1", "Name": "Test Movie", "Type": "Movie"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (peer, resolver) = setup(&server).await;
        resolver
            .cache
            .put("lan", "/movies/test.mkv", "item-1", Some("Test Movie"))
            .await
            .expect("seed cache");

        let resolved = resolver
            .find_by_path(&peer, "/movies/test.mkv")
            .await
            .expect("resolve")
            .expect("found");
        assert_eq!(resolved.item_id, "item-1");
        assert!(resolved.from_cache);
    }

    #[tokio::test]
    async fn provider_fallback_when_path_is_unknown() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items"))
            .and(query_param("AnyProviderIdEquals", "Imdb.tt1234567"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Items": [{"Id": "item-9", "Name": "By Provider", "Type": "Movie"}],
                "TotalRecordCount": 1
            })))
            .mount(&server)
            .await;
        // Library refresh finds nothing for the path.
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items"))
            .and(query_param("startIndex", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Items": [], "TotalRecordCount": 0
            })))
            .mount(&server)
            .await;

        let (peer, resolver) = setup(&server).await;
        let resolved = resolver
            .resolve(&peer, Some("/movies/missing.mkv"), Some("tt1234567"), None, None)
            .await
            .expect("resolve")
            .expect("found");
        assert_eq!(resolved.item_id, "item-9");
        assert!(!resolved.from_cache);
    }

    #[tokio::test]
    async fn unresolvable_item_returns_none() {
        let server = MockServer::start().await;
        mount_users(&server).mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/Users/u-admin/Items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Items": [], "TotalRecordCount": 0
            })))
            .mount(&server)
            .await;

        let (peer, resolver) = setup(&server).await;
        let resolved = resolver
            .resolve(&peer, Some("/movies/new/latest.mkv"), None, None, None)
            .await
            .expect("resolve");
        assert!(resolved.is_none());
    }
}
