//! The §6 interface configuration object: get (snapshot) and set (apply).
//! The original's `HAS_*`/`REPLACE_*`/`REMOVE`/`UPDATE` bit flags are
//! expressed as `Option`/`bool` fields instead of a flags word — idiomatic
//! for a typed Rust API, and every flag still has a direct field
//! counterpart below.

use std::net::SocketAddr;

use ip_network::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::device::{DatapathIo, Device};
use crate::error::ConfigError;
use crate::peer::PeerId;

pub const DEFAULT_MTU: u32 = 1420;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedIpConfig {
    pub network: IpNetwork,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub id: u64,
    pub public_key: [u8; 32],
    pub persistent_keepalive_interval: u16,
    pub endpoint: Option<SocketAddr>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_handshake: Option<std::time::SystemTime>,
    pub description: String,
    pub allowed_ips: Vec<AllowedIpConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceSnapshot {
    pub port: u16,
    pub fwmark: Option<u32>,
    pub public_key: Option<[u8; 32]>,
    pub mtu: u32,
    pub peers: Vec<PeerSnapshot>,
}

/// A single peer descriptor in a `SIOCSWG`-equivalent set call.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub persistent_keepalive_interval: Option<u16>,
    pub endpoint: Option<SocketAddr>,
    pub description: Option<String>,
    /// `REMOVE`: drop this peer instead of creating/updating it.
    #[serde(default)]
    pub remove: bool,
    /// `REPLACE_AIPS`: clear the peer's existing allowed-ips before adding
    /// `allowed_ips` below; otherwise they're additive.
    #[serde(default)]
    pub replace_allowed_ips: bool,
    #[serde(default)]
    pub allowed_ips: Vec<AllowedIpConfig>,
}

/// A `SIOCSWG`-equivalent set call.
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    pub port: Option<u16>,
    pub fwmark: Option<u32>,
    pub private_key: Option<[u8; 32]>,
    /// `REPLACE_PEERS`: drop every peer not named in `peers` below.
    #[serde(default)]
    pub replace_peers: bool,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl<IO: DatapathIo> Device<IO> {
    /// `SIOCGWG`: takes a snapshot of the interface's current config.
    /// `privileged` gates whether the private key would be included —
    /// this snapshot never carries it, but the flag is kept so a
    /// caller-side redaction policy has somewhere to hang.
    pub fn get_config(&self, _privileged: bool) -> InterfaceSnapshot {
        let peers = self
            .peer_ids()
            .into_iter()
            .filter_map(|id| self.peer(id))
            .map(|peer| PeerSnapshot {
                id: peer.id.0,
                public_key: peer.public_key.to_bytes(),
                persistent_keepalive_interval: peer
                    .persistent_keepalive_interval
                    .load(std::sync::atomic::Ordering::Acquire),
                endpoint: *peer.endpoint.read(),
                rx_bytes: peer.rx_bytes.load(std::sync::atomic::Ordering::Relaxed),
                tx_bytes: peer.tx_bytes.load(std::sync::atomic::Ordering::Relaxed),
                last_handshake: *peer.last_handshake.read(),
                description: peer.description.read().clone(),
                allowed_ips: self
                    .allowed_ips
                    .read()
                    .iter_owned(peer.id)
                    .map(|network| AllowedIpConfig { network })
                    .collect(),
            })
            .collect();

        InterfaceSnapshot {
            port: self.port(),
            fwmark: self.fwmark(),
            public_key: self.identity.public_key().map(|k| k.to_bytes()),
            mtu: self.mtu(),
            peers,
        }
    }

    /// `SIOCSWG`: applies a set call (spec §6 "Set semantics"). Returns the
    /// ids of peers created by this call, so the caller can spawn their
    /// per-peer workers (`crate::workers::spawn_peer_workers`) once it has
    /// an `Arc<Device<IO>>` handle — this method only takes `&self`.
    pub fn apply_config(&self, config: InterfaceConfig) -> Result<Vec<PeerId>, ConfigError> {
        if let Some(port) = config.port {
            self.set_port(port);
        }
        if config.fwmark.is_some() {
            self.set_fwmark(config.fwmark);
        }
        if let Some(bytes) = config.private_key {
            let key = noiseguard_crypto::NoiseStaticSecret::from(bytes);
            self.set_private_key(key);
        }

        if config.replace_peers {
            let keep: std::collections::HashSet<[u8; 32]> =
                config.peers.iter().map(|p| p.public_key).collect();
            for id in self.peer_ids() {
                let Some(peer) = self.peer(id) else { continue };
                if !keep.contains(peer.public_key.as_bytes()) {
                    self.remove_peer(id);
                }
            }
        }

        let mut created = Vec::new();
        for desc in config.peers {
            if let Some(id) = self.apply_peer_config(desc)? {
                created.push(id);
            }
        }

        Ok(created)
    }

    /// Returns `Some(id)` only when this call created a brand new peer.
    fn apply_peer_config(&self, desc: PeerConfig) -> Result<Option<PeerId>, ConfigError> {
        let public = noiseguard_crypto::NoisePublicKey::from(desc.public_key);
        let existing = self.peer_by_public(&public);

        if desc.remove {
            if let Some(peer) = existing {
                self.remove_peer(peer.id);
            }
            return Ok(None);
        }

        let (peer, created) = match existing {
            Some(peer) => (peer, false),
            None => {
                let psk = desc.preshared_key.map(noiseguard_crypto::Key::from);
                (self.add_peer(public, psk), true)
            }
        };

        if let Some(interval) = desc.persistent_keepalive_interval {
            peer.persistent_keepalive_interval
                .store(interval, std::sync::atomic::Ordering::Release);
            peer.timers
                .persistent_keepalive_interval
                .store(interval, std::sync::atomic::Ordering::Release);
        }
        if let Some(endpoint) = desc.endpoint {
            *peer.endpoint.write() = Some(endpoint);
        }
        if let Some(description) = desc.description {
            *peer.description.write() = description;
        }

        if desc.replace_allowed_ips {
            self.allowed_ips.write().remove_all(peer.id);
        }
        for aip in desc.allowed_ips {
            self.allowed_ips.write().insert(peer.id, aip.network);
        }

        Ok(created.then_some(peer.id))
    }
}
