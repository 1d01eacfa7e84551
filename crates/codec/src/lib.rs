//! ## GAP wire formats
//!
//! Frames exchanged between peers (queries and replies) and between a node
//! and its local clients (search start/stop, inserts, results). All
//! integers are network byte order. Every frame starts with a 4 byte
//! header: a 16-bit total size followed by a 16-bit message type.
//!
//! Content keys and peer identities are 512-bit hashes. A query carries
//! one or more keys; the frame size must therefore satisfy
//! `(size - fixed part) % 64 == 0`, and decoding rejects anything else.

pub mod client;
pub mod message;
pub mod wrapper;

use std::{fmt, str::FromStr};

/// Total bytes of the frame header (size + message type).
pub const HEADER_SIZE: usize = 4;

/// Frames are framed by a 16-bit size and can never exceed it.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Peer-to-peer message types.
pub const P2P_QUERY: u16 = 0x10;
pub const P2P_REPLY: u16 = 0x11;

/// Block type tags carried by queries and content wrappers.
pub const BLOCK_ANY: u32 = 0;
pub const BLOCK_DATA: u32 = 1;
pub const BLOCK_ON_DEMAND: u32 = 5;

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    UnderLength,
    UnknownMessage,
    KeyAlignment,
    TooLarge,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A 512-bit content key.
///
/// # Test
///
/// ```
/// use gap_server_codec::Key;
///
/// let key: Key = [7u8; 64].into();
///
/// assert_eq!(key.as_ref()[0], 7);
/// assert_eq!(key, "07".repeat(64).parse().unwrap());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(pub [u8; 64]);

/// A 512-bit peer identity hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 64]);

macro_rules! hash_impls {
    ($name:ident) => {
        impl $name {
            pub const ZERO: Self = Self([0u8; 64]);

            /// First 32 bits, used for table indexing.
            pub fn first_word(&self) -> u32 {
                u32::from_be_bytes(self.0[0..4].try_into().unwrap())
            }

            /// Second 32 bits, mixed into the routing slot index.
            pub fn second_word(&self) -> u32 {
                u32::from_be_bytes(self.0[4..8].try_into().unwrap())
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 64]
            }
        }

        impl From<[u8; 64]> for $name {
            fn from(value: [u8; 64]) -> Self {
                Self(value)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::ZERO
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for it in &self.0[..4] {
                    write!(f, "{:02x}", it)?;
                }

                write!(f, "..")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for it in &self.0 {
                    write!(f, "{:02x}", it)?;
                }

                Ok(())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                let value = value.as_bytes();
                if value.len() != 128 {
                    return Err(Error::InvalidInput);
                }

                fn nibble(it: u8) -> Result<u8, Error> {
                    match it {
                        b'0'..=b'9' => Ok(it - b'0'),
                        b'a'..=b'f' => Ok(it - b'a' + 10),
                        b'A'..=b'F' => Ok(it - b'A' + 10),
                        _ => Err(Error::InvalidInput),
                    }
                }

                let mut bytes = [0u8; 64];
                for (i, it) in bytes.iter_mut().enumerate() {
                    *it = nibble(value[i * 2])? << 4 | nibble(value[i * 2 + 1])?;
                }

                Ok(Self(bytes))
            }
        }

        #[cfg(feature = "serde")]
        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let value = <String as serde::Deserialize>::deserialize(deserializer)?;
                value.parse().map_err(serde::de::Error::custom)
            }
        }

        #[cfg(feature = "serde")]
        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }
    };
}

hash_impls!(Key);
hash_impls!(PeerId);

impl Key {
    /// Proximity metric between a content key and a peer identity.
    ///
    /// Only the leading 32 bits take part; this is a routing heuristic,
    /// not a distance with any cryptographic meaning.
    ///
    /// # Test
    ///
    /// ```
    /// use gap_server_codec::{Key, PeerId};
    ///
    /// let key = Key([0u8; 64]);
    /// let peer = PeerId([0u8; 64]);
    ///
    /// assert_eq!(key.distance(&peer), 0);
    /// ```
    pub fn distance(&self, peer: &PeerId) -> u32 {
        self.first_word() ^ peer.first_word()
    }
}

/// Read and validate a frame header.
///
/// The declared size must match the number of bytes handed in; the
/// transport is responsible for datagram framing.
pub fn header(bytes: &[u8]) -> Result<(usize, u16), Error> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::UnderLength);
    }

    let size = u16::from_be_bytes(bytes[0..2].try_into().unwrap()) as usize;
    let kind = u16::from_be_bytes(bytes[2..4].try_into().unwrap());
    if size != bytes.len() {
        return Err(Error::InvalidInput);
    }

    Ok((size, kind))
}

pub enum Packet<'a> {
    Query(message::Query),
    Reply(message::Reply<'a>),
}

/// Decode a peer-to-peer frame.
///
/// # Test
///
/// ```
/// use gap_server_codec::{decode, message::Query, Packet, PeerId};
///
/// let query = Query {
///     block_type: 1,
///     priority: 10,
///     ttl: 5000,
///     return_to: PeerId([3u8; 64]),
///     keys: vec![[9u8; 64].into()],
/// };
///
/// let bytes = query.to_bytes();
/// assert_eq!(bytes.len(), 144);
///
/// match decode(&bytes).unwrap() {
///     Packet::Query(it) => assert_eq!(it, query),
///     _ => panic!("expected a query"),
/// }
/// ```
pub fn decode(bytes: &[u8]) -> Result<Packet<'_>, Error> {
    let (_, kind) = header(bytes)?;
    Ok(match kind {
        P2P_QUERY => Packet::Query(message::Query::decode(bytes)?),
        P2P_REPLY => Packet::Reply(message::Reply::decode(bytes)?),
        _ => return Err(Error::UnknownMessage),
    })
}
