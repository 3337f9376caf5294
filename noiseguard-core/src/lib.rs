//! Control plane and datapath state for a single WireGuard-style interface:
//! local identity, peers, allowed-IPs routing, handshake orchestration,
//! cookie/rate-limit defenses, and the per-peer timer state machine.
//!
//! This crate owns state and policy; socket and TUN I/O live one layer up.

pub mod allowed_ips;
pub mod config;
pub mod cookie;
pub mod device;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod keypair;
pub mod peer;
pub mod queue;
pub mod ratelimit;
pub mod timers;
pub mod workers;

pub use allowed_ips::AllowedIps;
pub use cookie::{Checker, Maker};
pub use device::{DatapathIo, Device};
pub use error::{ConfigError, DatapathDrop};
pub use identity::{precompute_ss, Identity, IndexEntry};
pub use keypair::{Keypair, KeypairSlots};
pub use peer::{HandshakeRole, Peer, PeerId};
pub use queue::Family;
pub use ratelimit::RateLimiter;
pub use timers::{DueCallout, PeerTimers};
