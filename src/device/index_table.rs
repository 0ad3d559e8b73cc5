//! Maps the 32-bit indices carried on the wire (handshake sender index, transport
//! receiver index) back to the peer that owns them, so a bind receiver can route an
//! inbound datagram to the right peer without inspecting its source address.
//!
//! Indices themselves are minted by each peer's `Tunn` (a fresh random value per
//! handshake attempt, never predictable from the previous one). This table doesn't
//! mint anything; it is the single place with visibility across all peers, so the
//! device registers an index here the moment it observes `Tunn` mint one (by reading
//! the sender index back out of an outbound handshake init/response buffer) and looks
//! it up here on every inbound packet carrying a receiver index.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::peer::Peer;

/// What a local index currently refers to.
pub enum IndexEntry {
    Peer(Arc<Peer>),
}

#[derive(Default)]
pub struct IndexTable {
    table: RwLock<HashMap<u32, IndexEntry>>,
}

impl IndexTable {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Bind `index` to `peer`, overwriting any previous owner. Collisions across the
    /// 32-bit space are astronomically unlikely; when one does happen the newest
    /// mapping wins, same as the previous owner's session simply expiring.
    pub fn insert(&self, index: u32, peer: Arc<Peer>) {
        self.table.write().insert(index, IndexEntry::Peer(peer));
    }

    pub fn lookup(&self, index: u32) -> Option<Arc<Peer>> {
        match self.table.read().get(&index) {
            Some(IndexEntry::Peer(peer)) => Some(Arc::clone(peer)),
            None => None,
        }
    }

    /// Atomically move ownership of `index` from `old` to `new`, used when a
    /// handshake-slot index is superseded by the installed keypair's session index.
    pub fn swap(&self, old: u32, new: u32, peer: Arc<Peer>) {
        let mut table = self.table.write();
        table.remove(&old);
        table.insert(new, IndexEntry::Peer(peer));
    }

    pub fn remove(&self, index: u32) {
        self.table.write().remove(&index);
    }

    /// Drop every index owned by `peer`. Called on peer removal.
    pub fn remove_by_peer(&self, peer: &Arc<Peer>) {
        let mut table = self.table.write();
        table.retain(|_, entry| {
            let IndexEntry::Peer(owner) = entry;
            !Arc::ptr_eq(owner, peer)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::peer::AllowedIP;
    use crate::noise::Tunn;
    use crate::x25519;

    fn dummy_peer() -> Arc<Peer> {
        let static_private = x25519::StaticSecret::random_from_rng(rand_core::OsRng);
        let peer_static_public = x25519::PublicKey::from(&x25519::StaticSecret::random_from_rng(
            rand_core::OsRng,
        ));
        let tunn = Tunn::new(static_private, peer_static_public, None, None, 0, None);
        Arc::new(Peer::new(
            tunn,
            peer_static_public,
            None,
            &[] as &[AllowedIP],
            None,
            None,
        ))
    }

    #[test]
    fn insert_and_lookup() {
        let table = IndexTable::new();
        let peer = dummy_peer();
        table.insert(7, Arc::clone(&peer));
        assert!(table.lookup(7).is_some());
        assert!(table.lookup(8).is_none());
    }

    #[test]
    fn swap_moves_ownership() {
        let table = IndexTable::new();
        let peer = dummy_peer();
        table.insert(1, Arc::clone(&peer));
        table.swap(1, 2, Arc::clone(&peer));
        assert!(table.lookup(1).is_none());
        assert!(table.lookup(2).is_some());
    }

    #[test]
    fn remove_by_peer_sweeps_all_entries() {
        let table = IndexTable::new();
        let a = dummy_peer();
        let b = dummy_peer();
        table.insert(1, Arc::clone(&a));
        table.insert(2, Arc::clone(&a));
        table.insert(3, Arc::clone(&b));
        table.remove_by_peer(&a);
        assert!(table.lookup(1).is_none());
        assert!(table.lookup(2).is_none());
        assert!(table.lookup(3).is_some());
    }
}
