//! Control-path errors are surfaced to the caller (§7 "Configuration errors");
//! data-path failures are never surfaced, only counted — see [`DatapathDrop`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported address family")]
    UnsupportedFamily,
    #[error("no space for a new peer")]
    OutOfSpace,
    #[error("invalid mtu: must be between 1 and {max}")]
    InvalidMtu { max: u32 },
    #[error("insufficient privilege for this operation")]
    Forbidden,
    #[error("local identity is not set")]
    NoIdentity,
    #[error("peer not found")]
    NoSuchPeer,
}

/// A reason a packet was silently dropped on the data path (§7 "Handshake
/// errors" / "Datapath errors"). These are counter labels, never returned
/// to a caller — deliberately not a [`std::error::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatapathDrop {
    Mac1Mismatch,
    RateLimited,
    HandshakeReplay,
    HandshakeFlood,
    AeadFailure,
    UnknownReceiverIndex,
    CorruptedLength,
    NoIdentity,
    NoRoute,
    NoEndpoint,
    LoopDetected,
    SourceMismatch,
    CounterReplay,
    QueueFull,
}
