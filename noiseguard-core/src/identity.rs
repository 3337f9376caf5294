//! Local identity: the interface's own static keypair plus the two index
//! structures every remote and keypair is found through (spec §3 "Local
//! identity").

use std::sync::Arc;

use ahash::AHashMap;
use noiseguard_crypto::{NoisePublicKey as PublicKey, NoiseStaticSecret as StaticSecret};
use parking_lot::RwLock;
use rand_core::RngCore;

use crate::error::ConfigError;
use crate::peer::{Peer, PeerId};

/// An index-table entry is either a remote with a handshake in progress or
/// an active keypair (spec §3 "is_keypair tag"); `noise_remote_index_lookup`
/// can ask for either kind or accept both.
#[derive(Clone)]
pub enum IndexEntry {
    Handshake(PeerId),
    Keypair(PeerId, Arc<crate::keypair::Keypair>),
}

#[derive(Default)]
struct Indices {
    /// Keyed by raw key bytes rather than `PublicKey` directly: it keeps
    /// this table independent of whatever `Hash`/`Eq` support the dalek
    /// type happens to derive.
    by_public: AHashMap<[u8; 32], PeerId>,
    by_index: AHashMap<u32, IndexEntry>,
}

pub struct Identity {
    private_key: RwLock<Option<StaticSecret>>,
    public_key: RwLock<Option<PublicKey>>,
    indices: RwLock<Indices>,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            private_key: RwLock::new(None),
            public_key: RwLock::new(None),
            indices: RwLock::new(Indices::default()),
        }
    }
}

impl Identity {
    pub fn has_identity(&self) -> bool {
        self.private_key.read().is_some()
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        *self.public_key.read()
    }

    pub fn private_key(&self) -> Option<StaticSecret> {
        self.private_key.read().clone()
    }

    /// Sets the local private key and derives the public key. Returns the
    /// previous public key, if any, so the caller can evict any peer whose
    /// public collided with the new local public and recompute every
    /// per-remote `ss` (spec §6 "Set semantics").
    pub fn set_private_key(&self, key: StaticSecret) -> Option<PublicKey> {
        let public = PublicKey::from(&key);
        let previous = self.public_key.write().replace(public);
        *self.private_key.write() = Some(key);
        previous
    }

    pub fn require_identity(&self) -> Result<(), ConfigError> {
        if self.has_identity() {
            Ok(())
        } else {
            Err(ConfigError::NoIdentity)
        }
    }

    pub fn peer_by_public(&self, public: &PublicKey) -> Option<PeerId> {
        self.indices.read().by_public.get(public.as_bytes()).copied()
    }

    pub fn register_peer_public(&self, public: PublicKey, id: PeerId) {
        self.indices
            .write()
            .by_public
            .insert(public.to_bytes(), id);
    }

    pub fn forget_peer_public(&self, public: &PublicKey) {
        self.indices.write().by_public.remove(public.as_bytes());
    }

    /// Draws a random 32-bit index that doesn't collide with an existing
    /// entry and files `peer` under it as a handshake-in-progress entry
    /// (spec §4.1 "Create initiation").
    pub fn assign_handshake_index(&self, peer: PeerId, rng: &mut impl RngCore) -> u32 {
        let mut indices = self.indices.write();
        loop {
            let candidate = rng.next_u32();
            if candidate != 0 && !indices.by_index.contains_key(&candidate) {
                indices
                    .by_index
                    .insert(candidate, IndexEntry::Handshake(peer));
                return candidate;
            }
        }
    }

    pub fn lookup_index(&self, index: u32) -> Option<IndexEntry> {
        self.indices.read().by_index.get(&index).cloned()
    }

    /// Transfers an index-table entry from "handshake in progress" to
    /// "active keypair" in place, keeping the same local/remote index
    /// (spec §4.1 `begin_session` step 3).
    pub fn promote_to_keypair(&self, index: u32, peer: PeerId, kp: Arc<crate::keypair::Keypair>) {
        self.indices
            .write()
            .by_index
            .insert(index, IndexEntry::Keypair(peer, kp));
    }

    pub fn remove_index(&self, index: u32) {
        self.indices.write().by_index.remove(&index);
    }

    pub fn remote_count(&self) -> usize {
        self.indices.read().by_public.len()
    }
}

/// Computes the static-static shared secret used as `ss` in the handshake
/// (spec §3 "Remote/peer": `ss = X25519(local_private, peer_public)`,
/// recomputed whenever local identity changes).
pub fn precompute_ss(local_private: &StaticSecret, peer_public: &PublicKey) -> [u8; 32] {
    local_private.diffie_hellman(peer_public).to_bytes()
}

pub(crate) fn recompute_all_ss(identity: &Identity, peers: &[Arc<Peer>]) {
    let Some(private) = identity.private_key() else {
        return;
    };
    for peer in peers {
        let ss = precompute_ss(&private, &peer.public_key);
        *peer.static_static.write() = ss;
    }
}
