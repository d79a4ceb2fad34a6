use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::repository::UserMappingRepository;
use crate::service::peers::PeerRegistry;
use crate::Result;

const PASSWORD_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";
const PASSWORD_LENGTH: usize = 16;

/// Password for a user created on a peer that requires one. Returned to the
/// caller so an admin can hand it over; the user is expected to reset it.
fn generate_password() -> String {
    let mut rng = rand::rng();
    (0..PASSWORD_LENGTH)
        .map(|_| PASSWORD_CHARSET[rng.random_range(0..PASSWORD_CHARSET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedUser {
    pub server: String,
    pub passwordless: bool,
    /// Present only for password-requiring peers.
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UserCreationReport {
    pub created: Vec<CreatedUser>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UserDeletionReport {
    pub deleted: Vec<String>,
    pub not_found: Vec<String>,
    pub failed: Vec<String>,
}

/// User-lifecycle fan-out and fleet-level user utilities. Unlike playback
/// state, user creation and deletion replicate inline with the webhook
/// request rather than through the durable queue.
pub struct UserService {
    config: Arc<Config>,
    peers: Arc<PeerRegistry>,
    mappings: UserMappingRepository,
}

impl UserService {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        peers: Arc<PeerRegistry>,
        mappings: UserMappingRepository,
    ) -> Self {
        Self {
            config,
            peers,
            mappings,
        }
    }

    /// Mirror a newly created user onto every other peer.
    pub async fn sync_user_creation(
        &self,
        source_peer: &str,
        username: &str,
        source_user_id: &str,
    ) -> Result<UserCreationReport> {
        info!(source_peer, username, "syncing user creation");
        let mut report = UserCreationReport::default();

        self.mappings
            .upsert(username, source_peer, source_user_id)
            .await?;

        for peer_config in self.config.other_servers(source_peer) {
            let Some(client) = self.peers.get(&peer_config.name) else {
                continue;
            };

            match client.get_user_by_name(username).await {
                Ok(Some(existing)) => {
                    debug!(peer = %peer_config.name, username, "user already exists, updating mapping");
                    self.mappings
                        .upsert(username, &peer_config.name, &existing.id)
                        .await?;
                    report.skipped.push(peer_config.name.clone());
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(peer = %peer_config.name, username, "user lookup failed: {e}");
                    report.failed.push(peer_config.name.clone());
                    continue;
                }
            }

            let password = (!peer_config.passwordless).then(generate_password);
            match client.create_user(username, password.as_deref()).await {
                Ok(user) => {
                    info!(
                        peer = %peer_config.name,
                        username,
                        passwordless = peer_config.passwordless,
                        "created user"
                    );
                    self.mappings
                        .upsert(username, &peer_config.name, &user.id)
                        .await?;
                    report.created.push(CreatedUser {
                        server: peer_config.name.clone(),
                        passwordless: peer_config.passwordless,
                        password,
                    });
                }
                Err(e) => {
                    error!(peer = %peer_config.name, username, "failed to create user: {e}");
                    report.failed.push(peer_config.name.clone());
                }
            }
        }

        info!(
            username,
            created = report.created.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "user creation sync complete"
        );
        Ok(report)
    }

    /// Remove a deleted user from every other peer and drop its mappings.
    pub async fn sync_user_deletion(
        &self,
        source_peer: &str,
        username: &str,
    ) -> Result<UserDeletionReport> {
        info!(source_peer, username, "syncing user deletion");
        let mut report = UserDeletionReport::default();

        self.mappings.delete(username, source_peer).await?;
        report.deleted.push(source_peer.to_string());

        for peer_config in self.config.other_servers(source_peer) {
            let Some(client) = self.peers.get(&peer_config.name) else {
                continue;
            };

            let user = match client.get_user_by_name(username).await {
                Ok(Some(user)) => user,
                Ok(None) => {
                    debug!(peer = %peer_config.name, username, "user not present, dropping mapping");
                    self.mappings.delete(username, &peer_config.name).await?;
                    report.not_found.push(peer_config.name.clone());
                    continue;
                }
                Err(e) => {
                    error!(peer = %peer_config.name, username, "user lookup failed: {e}");
                    report.failed.push(peer_config.name.clone());
                    continue;
                }
            };

            match client.delete_user(&user.id).await {
                Ok(()) => {
                    info!(peer = %peer_config.name, username, "deleted user");
                    self.mappings.delete(username, &peer_config.name).await?;
                    report.deleted.push(peer_config.name.clone());
                }
                Err(e) => {
                    error!(peer = %peer_config.name, username, "failed to delete user: {e}");
                    report.failed.push(peer_config.name.clone());
                }
            }
        }

        Ok(report)
    }

    /// Startup sweep: record every (user, peer) pair the fleet currently
    /// knows. Unreachable peers are skipped; the mappings refresh lazily as
    /// webhooks arrive.
    pub async fn sync_all_users(&self) -> Result<usize> {
        let mut discovered = 0usize;

        for (peer_name, client) in self.peers.iter() {
            let users = match client.list_users().await {
                Ok(users) => users,
                Err(e) => {
                    warn!(peer = peer_name, "skipping user sweep: {e}");
                    continue;
                }
            };
            for user in users {
                if user.name.is_empty() || user.id.is_empty() {
                    continue;
                }
                self.mappings.upsert(&user.name, peer_name, &user.id).await?;
                discovered += 1;
            }
        }

        info!(discovered, "user mapping sweep complete");
        Ok(discovered)
    }

    /// Reachability of every configured peer, in parallel.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let checks = self.peers.iter().map(|(name, client)| {
            let name = name.to_string();
            let client = client.clone();
            async move {
                let healthy = client.health().await.is_ok();
                (name, healthy)
            }
        });

        futures::future::join_all(checks).await.into_iter().collect()
    }
}
