//! Wire structs for the handshake and data message formats (spec §3).
//!
//! This crate only knows about byte layouts: it has no notion of a
//! handshake transcript, a key, or a session. `noiseguard-crypto` adds
//! the AEAD/MAC operations on top of these shapes via its own traits,
//! since inherent impls for foreign types aren't allowed — the same
//! reason `HasMac` lives in the crypto crate instead of here.
#![no_std]

use zerocopy::little_endian::{U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const MSG_FIRST: u32 = 1;
pub const MSG_SECOND: u32 = 2;
pub const MSG_COOKIE: u32 = 3;
pub const MSG_DATA: u32 = 4;

pub type Mac = [u8; 16];

/// A 16-byte AEAD authentication tag, stored as plain bytes so this crate
/// never has to name an AEAD crate's tag type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct Tag(pub [u8; 16]);

/// A keyed MAC of a remote's socket address (spec §4.2).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct Cookie(pub [u8; 16]);

macro_rules! encrypted {
    ($name:ident, $n:literal) => {
        #[doc = concat!(
            "An AEAD-sealed ",
            stringify!($n),
            "-byte handshake payload: ciphertext followed by its tag."
        )]
        #[derive(Clone, Copy, Debug, FromBytes, FromZeroes, AsBytes)]
        #[repr(C)]
        pub struct $name {
            pub msg: [u8; $n],
            pub tag: Tag,
        }
    };
}

encrypted!(EncryptedEmpty, 0);
encrypted!(EncryptedTimestamp, 12);
encrypted!(EncryptedPublicKey, 32);

/// An AEAD-sealed cookie payload (spec §4.2, the `ec` field of a COOKIE message).
#[derive(Clone, Copy, Debug, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct EncryptedCookie {
    pub msg: Cookie,
    pub tag: Tag,
}

/// INITIATION message, 148 bytes (spec §3).
#[derive(Clone, Copy, Debug, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct HandshakeInit {
    pub msg_type: U32,
    pub sender: U32,
    pub ephemeral_key: [u8; 32],
    pub static_key: EncryptedPublicKey,
    pub timestamp: EncryptedTimestamp,
    pub mac1: Mac,
    pub mac2: Mac,
}

/// RESPONSE message, 92 bytes (spec §3).
#[derive(Clone, Copy, Debug, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct HandshakeResp {
    pub msg_type: U32,
    pub sender: U32,
    pub receiver: U32,
    pub ephemeral_key: [u8; 32],
    pub empty: EncryptedEmpty,
    pub mac1: Mac,
    pub mac2: Mac,
}

/// COOKIE message, 64 bytes (spec §3).
#[derive(Clone, Copy, Debug, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct CookieMessage {
    pub msg_type: U32,
    pub receiver: U32,
    pub nonce: [u8; 24],
    pub cookie: EncryptedCookie,
}

/// The fixed header of a DATA message; the ciphertext||tag follows in the
/// datagram and is not part of this struct (its length is variable).
#[derive(Clone, Copy, Debug, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct DataHeader {
    pub msg_type: U32,
    pub receiver: U32,
    pub counter: U64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_sizes_match_spec() {
        assert_eq!(core::mem::size_of::<HandshakeInit>(), 148);
        assert_eq!(core::mem::size_of::<HandshakeResp>(), 92);
        assert_eq!(core::mem::size_of::<CookieMessage>(), 64);
        assert_eq!(core::mem::size_of::<DataHeader>(), 16);
    }

    #[test]
    fn wire_structs_have_byte_alignment() {
        // zerocopy's little-endian integer wrappers are byte-aligned so these
        // structs need no `#[repr(packed)]` to match the wire layout exactly.
        assert_eq!(core::mem::align_of::<HandshakeInit>(), 1);
        assert_eq!(core::mem::align_of::<HandshakeResp>(), 1);
        assert_eq!(core::mem::align_of::<CookieMessage>(), 1);
        assert_eq!(core::mem::align_of::<DataHeader>(), 1);
    }
}
