//! Peer block directory.
//!
//! Advisory hints about which nodes are believed to hold a given block.
//! Used by read handlers when the node is throttling egress: instead of
//! data, the client gets a list of peers to try. Entries expire by wall
//! clock and are capped per block.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use dn_api_types::{BlockId, NodeDescriptor, PeerInfo, PeerTableConfig};

pub struct PeerBlockTable {
    config: PeerTableConfig,
    peers: RwLock<HashMap<BlockId, Vec<PeerInfo>>>,
}

impl PeerBlockTable {
    pub fn new(config: PeerTableConfig) -> Self {
        Self {
            config,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Record that `descriptor` likely holds `block_id` until `expiration`.
    pub fn update_peer(&self, block_id: BlockId, descriptor: NodeDescriptor, expiration: SystemTime) {
        let mut peers = self.peers.write().unwrap();
        let entries = peers.entry(block_id).or_default();

        let now = SystemTime::now();
        entries.retain(|peer| peer.expiration > now && peer.descriptor != descriptor);
        entries.push(PeerInfo {
            descriptor,
            expiration,
        });

        // cap by dropping the entries closest to expiry
        if entries.len() > self.config.max_peers_per_block {
            entries.sort_by_key(|peer| std::cmp::Reverse(peer.expiration));
            entries.truncate(self.config.max_peers_per_block);
        }
    }

    /// Live peers for the block, most durable hint first.
    pub fn get_peers(&self, block_id: BlockId) -> Vec<NodeDescriptor> {
        let now = SystemTime::now();
        let peers = self.peers.read().unwrap();
        let Some(entries) = peers.get(&block_id) else {
            return Vec::new();
        };
        let mut live: Vec<&PeerInfo> = entries.iter().filter(|peer| peer.expiration > now).collect();
        live.sort_by_key(|peer| std::cmp::Reverse(peer.expiration));
        live.into_iter().map(|peer| peer.descriptor.clone()).collect()
    }

    /// Drop all expired entries; run periodically.
    pub fn sweep_expired(&self) {
        let now = SystemTime::now();
        let mut peers = self.peers.write().unwrap();
        peers.retain(|_, entries| {
            entries.retain(|peer| peer.expiration > now);
            !entries.is_empty()
        });
    }

    pub fn default_expiration(&self) -> SystemTime {
        SystemTime::now() + self.config.default_peer_ttl
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dn_api_types::{ChunkId, ObjectType};
    use std::time::Duration;

    fn block(index: u32) -> BlockId {
        BlockId::new(ChunkId::new(ObjectType::Blob, 1, 0x77), index)
    }

    #[test]
    fn test_peer_expiry_and_cap() {
        let table = PeerBlockTable::new(PeerTableConfig {
            max_peers_per_block: 2,
            default_peer_ttl: Duration::from_secs(600),
        });

        let soon = SystemTime::now() + Duration::from_millis(50);
        let later = SystemTime::now() + Duration::from_secs(60);

        table.update_peer(block(0), NodeDescriptor::new("n1:10100"), soon);
        table.update_peer(block(0), NodeDescriptor::new("n2:10100"), later);
        assert_eq!(table.get_peers(block(0)).len(), 2);

        // cap of two drops the hint expiring soonest
        table.update_peer(
            block(0),
            NodeDescriptor::new("n3:10100"),
            SystemTime::now() + Duration::from_secs(30),
        );
        let peers = table.get_peers(block(0));
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].address, "n2:10100");

        // re-announcing a known peer refreshes instead of duplicating
        table.update_peer(block(0), NodeDescriptor::new("n2:10100"), later);
        assert_eq!(table.get_peers(block(0)).len(), 2);

        std::thread::sleep(Duration::from_millis(60));
        table.sweep_expired();
        assert!(table
            .get_peers(block(0))
            .iter()
            .all(|peer| peer.address != "n1:10100"));

        assert!(table.get_peers(block(9)).is_empty());
    }
}
