use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::peer::PeerClient;
use crate::{Error, Result};

/// All configured peer clients, built once at startup. Clients are shared
/// so every component reuses the same connection pools.
pub struct PeerRegistry {
    peers: HashMap<String, Arc<PeerClient>>,
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PeerRegistry {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut peers = HashMap::new();
        for peer in &config.servers {
            let client = PeerClient::new(peer)
                .map_err(|e| Error::Config(format!("peer {}: {e}", peer.name)))?;
            peers.insert(peer.name.clone(), Arc::new(client));
        }
        Ok(Self { peers })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<PeerClient>> {
        self.peers.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<PeerClient>)> {
        self.peers.iter().map(|(name, client)| (name.as_str(), client))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
