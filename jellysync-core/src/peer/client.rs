use std::sync::LazyLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::config::PeerConfig;

use super::error::{check_response, PeerError, Result};
use super::types::{
    ItemDto, ItemsPage, PublicSystemInfo, UserDataDto, UserDataUpdate, UserDto,
};

const CLIENT_NAME: &str = "jellysync";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library page size for full-library refreshes.
pub const LIBRARY_PAGE_SIZE: i64 = 500;

/// Media item types that can carry playback state.
const MEDIA_ITEM_TYPES: &str = "Movie,Episode,Video,Audio,MusicVideo";

/// Stable device id so peers see one device per deployment instead of a new
/// phantom session per process start.
static DEVICE_ID: LazyLock<String> = LazyLock::new(|| {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, format!("{CLIENT_NAME}.local").as_bytes()).to_string()
});

/// Typed client for one peer's REST API.
///
/// Holds its own pooled connection set; cheap to clone via `Arc` at the
/// registry level, not `Clone` itself.
pub struct PeerClient {
    name: String,
    base_url: String,
    http: Client,
    headers: HeaderMap,
    admin_user_id: OnceCell<String>,
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl PeerClient {
    pub fn new(peer: &PeerConfig) -> Result<Self> {
        // The MediaBrowser authorization scheme keeps the peer from showing
        // these API calls as an active playback session on its dashboard.
        let auth = format!(
            "MediaBrowser Client=\"{CLIENT_NAME}\", Device=\"{CLIENT_NAME}\", \
             DeviceId=\"{}\", Version=\"{CLIENT_VERSION}\", Token=\"{}\"",
            *DEVICE_ID, peer.api_key
        );

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&auth)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            name: peer.name.clone(),
            base_url: peer.url.trim_end_matches('/').to_string(),
            http,
            headers,
            admin_user_id: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        let url = format!("{}{endpoint}", self.base_url);
        self.http.request(method, url).headers(self.headers.clone())
    }

    // ===== Users =====

    pub async fn list_users(&self) -> Result<Vec<UserDto>> {
        let response = self.request(Method::GET, "/Users").send().await?;
        let response = check_response(response)?;
        Ok(response.json().await?)
    }

    /// Find a user by name, case-insensitive.
    pub async fn get_user_by_name(&self, username: &str) -> Result<Option<UserDto>> {
        let users = self.list_users().await?;
        Ok(users
            .into_iter()
            .find(|u| u.name.eq_ignore_ascii_case(username)))
    }

    /// Id of any administrator account, cached for the client's lifetime.
    /// Library refreshes run in this user's context so every library is
    /// visible.
    pub async fn get_admin_user_id(&self) -> Result<&str> {
        let id = self
            .admin_user_id
            .get_or_try_init(|| async {
                let users = self.list_users().await?;
                users
                    .into_iter()
                    .find(|u| u.policy.as_ref().is_some_and(|p| p.is_administrator))
                    .map(|u| u.id)
                    .ok_or_else(|| {
                        PeerError::Parse(format!("no administrator account on peer {}", self.name))
                    })
            })
            .await?;
        Ok(id.as_str())
    }

    pub async fn create_user(&self, username: &str, password: Option<&str>) -> Result<UserDto> {
        let body = serde_json::json!({
            "Name": username,
            "Password": password.unwrap_or(""),
        });
        let response = self
            .request(Method::POST, "/Users/New")
            .json(&body)
            .send()
            .await?;
        let response = check_response(response)?;
        Ok(response.json().await?)
    }

    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        let response = self
            .request(Method::DELETE, &format!("/Users/{user_id}"))
            .send()
            .await?;
        check_response(response)?;
        Ok(())
    }

    // ===== Item lookup =====

    /// One page of the full media library, admin context, with the fields
    /// the path cache needs.
    pub async fn list_library_items(
        &self,
        user_id: &str,
        start_index: i64,
        limit: i64,
    ) -> Result<ItemsPage> {
        let start_index = start_index.to_string();
        let limit = limit.to_string();
        let response = self
            .request(Method::GET, &format!("/Users/{user_id}/Items"))
            .query(&[
                ("recursive", "true"),
                ("fields", "Path,ProviderIds"),
                ("includeItemTypes", MEDIA_ITEM_TYPES),
                ("startIndex", start_index.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;
        let response = check_response(response)?;
        Ok(response.json().await?)
    }

    /// Find an item by external provider id, trying imdb, tmdb, tvdb in
    /// that order. Collections are excluded so a boxset carrying the same
    /// provider id never shadows the actual media item.
    pub async fn find_item_by_provider_id(
        &self,
        user_id: &str,
        imdb: Option<&str>,
        tmdb: Option<&str>,
        tvdb: Option<&str>,
    ) -> Result<Option<ItemDto>> {
        let candidates = [("Imdb", imdb), ("Tmdb", tmdb), ("Tvdb", tvdb)];

        for (provider, value) in candidates {
            let Some(value) = value else { continue };
            let query = format!("{provider}.{value}");
            let response = self
                .request(Method::GET, &format!("/Users/{user_id}/Items"))
                .query(&[
                    ("recursive", "true"),
                    ("fields", "Path,ProviderIds"),
                    ("excludeItemTypes", "BoxSet"),
                    ("limit", "1"),
                    ("AnyProviderIdEquals", query.as_str()),
                ])
                .send()
                .await?;
            let response = match check_response(response) {
                Ok(response) => response,
                Err(PeerError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let page: ItemsPage = response.json().await?;
            if let Some(item) = page.items.into_iter().next() {
                return Ok(Some(item));
            }
        }

        Ok(None)
    }

    /// Full item metadata (path, provider ids, user data).
    pub async fn get_item_info(&self, user_id: &str, item_id: &str) -> Result<ItemDto> {
        let response = self
            .request(Method::GET, &format!("/Users/{user_id}/Items/{item_id}"))
            .query(&[("fields", "Path,ProviderIds")])
            .send()
            .await?;
        let response = check_response(response)?;
        Ok(response.json().await?)
    }

    /// Per-user state for an item, for smart-sync comparison.
    pub async fn get_user_data(&self, user_id: &str, item_id: &str) -> Result<UserDataDto> {
        let item = self.get_item_info(user_id, item_id).await?;
        Ok(item.user_data.unwrap_or_default())
    }

    // ===== State mutations =====

    pub async fn set_playback_position(
        &self,
        user_id: &str,
        item_id: &str,
        position_ticks: i64,
    ) -> Result<()> {
        self.update_user_data(
            user_id,
            item_id,
            &UserDataUpdate {
                playback_position_ticks: Some(position_ticks),
                ..UserDataUpdate::default()
            },
        )
        .await
    }

    pub async fn mark_played(&self, user_id: &str, item_id: &str) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("/Users/{user_id}/PlayedItems/{item_id}"))
            .send()
            .await?;
        check_response(response)?;
        Ok(())
    }

    pub async fn mark_unplayed(&self, user_id: &str, item_id: &str) -> Result<()> {
        let response = self
            .request(
                Method::DELETE,
                &format!("/Users/{user_id}/PlayedItems/{item_id}"),
            )
            .send()
            .await?;
        check_response(response)?;
        Ok(())
    }

    pub async fn add_favorite(&self, user_id: &str, item_id: &str) -> Result<()> {
        let response = self
            .request(
                Method::POST,
                &format!("/Users/{user_id}/FavoriteItems/{item_id}"),
            )
            .send()
            .await?;
        check_response(response)?;
        Ok(())
    }

    pub async fn remove_favorite(&self, user_id: &str, item_id: &str) -> Result<()> {
        let response = self
            .request(
                Method::DELETE,
                &format!("/Users/{user_id}/FavoriteItems/{item_id}"),
            )
            .send()
            .await?;
        check_response(response)?;
        Ok(())
    }

    /// The peer stores a boolean thumb, not the 0-10 rating; `rating >= 5`
    /// maps to a like.
    pub async fn set_rating(&self, user_id: &str, item_id: &str, rating: f64) -> Result<()> {
        let likes = rating >= 5.0;
        let response = self
            .request(
                Method::POST,
                &format!("/Users/{user_id}/Items/{item_id}/Rating"),
            )
            .query(&[("likes", if likes { "true" } else { "false" })])
            .send()
            .await?;
        check_response(response)?;
        Ok(())
    }

    pub async fn delete_rating(&self, user_id: &str, item_id: &str) -> Result<()> {
        let response = self
            .request(
                Method::DELETE,
                &format!("/Users/{user_id}/Items/{item_id}/Rating"),
            )
            .send()
            .await?;
        check_response(response)?;
        Ok(())
    }

    pub async fn update_user_data(
        &self,
        user_id: &str,
        item_id: &str,
        update: &UserDataUpdate,
    ) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let response = self
            .request(
                Method::POST,
                &format!("/Users/{user_id}/Items/{item_id}/UserData"),
            )
            .json(update)
            .send()
            .await?;
        check_response(response)?;
        Ok(())
    }

    // ===== Health =====

    pub async fn health(&self) -> Result<PublicSystemInfo> {
        let response = self
            .request(Method::GET, "/System/Info/Public")
            .send()
            .await?;
        let response = check_response(response)?;
        Ok(response.json().await?)
    }
}
