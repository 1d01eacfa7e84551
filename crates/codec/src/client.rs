//! Envelopes spoken between a node and its local clients.
//!
//! Same framing as the peer protocol: a 16-bit total length and a 16-bit
//! message type, everything network byte order. Clients connect over a
//! local stream socket, so frames arrive length-prefixed and are decoded
//! one at a time.

use crate::{Error, HEADER_SIZE, Key, MAX_FRAME_SIZE, PeerId};

use bytes::{BufMut, BytesMut};

pub const CS_SEARCH_START: u16 = 0x20;
pub const CS_SEARCH_STOP: u16 = 0x21;
pub const CS_RESULT: u16 = 0x22;
pub const CS_INSERT: u16 = 0x23;

const SEARCH_START_FIXED_SIZE: usize = HEADER_SIZE + 4 + 4 + 4 + 8 + 64;
const SEARCH_STOP_SIZE: usize = HEADER_SIZE + 64;
const RESULT_FIXED_SIZE: usize = HEADER_SIZE + 4 + 8 + 64;
const INSERT_FIXED_SIZE: usize = HEADER_SIZE + 4 + 4 + 4 + 8 + 64;

/// A client asks the node to search for content.
///
/// A zero target means "no preference"; anything else is a direct ask to
/// that peer. Expiration is absolute milliseconds since the unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchStart {
    pub block_type: u32,
    pub anonymity: u32,
    pub priority: u32,
    pub expiration: i64,
    pub target: PeerId,
    pub keys: Vec<Key>,
}

impl SearchStart {
    pub fn target(&self) -> Option<&PeerId> {
        (!self.target.is_zero()).then_some(&self.target)
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u16((SEARCH_START_FIXED_SIZE + self.keys.len() * 64) as u16);
        bytes.put_u16(CS_SEARCH_START);
        bytes.put_u32(self.block_type);
        bytes.put_u32(self.anonymity);
        bytes.put_u32(self.priority);
        bytes.put_i64(self.expiration);
        bytes.put(self.target.as_ref());
        for key in &self.keys {
            bytes.put(key.as_ref());
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < SEARCH_START_FIXED_SIZE + 64 {
            return Err(Error::UnderLength);
        }

        if (bytes.len() - SEARCH_START_FIXED_SIZE) % 64 != 0 {
            return Err(Error::KeyAlignment);
        }

        let count = (bytes.len() - SEARCH_START_FIXED_SIZE) / 64;
        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            let start = SEARCH_START_FIXED_SIZE + i * 64;
            keys.push(Key(bytes[start..start + 64].try_into().unwrap()));
        }

        Ok(Self {
            block_type: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            anonymity: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            priority: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            expiration: i64::from_be_bytes(bytes[16..24].try_into().unwrap()),
            target: PeerId(bytes[24..88].try_into().unwrap()),
            keys,
        })
    }
}

/// A client stores a block into the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insert {
    pub block_type: u32,
    pub anonymity: u32,
    pub priority: u32,
    pub expiration: i64,
    pub key: Key,
    pub data: Vec<u8>,
}

impl Insert {
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u16((INSERT_FIXED_SIZE + self.data.len()) as u16);
        bytes.put_u16(CS_INSERT);
        bytes.put_u32(self.block_type);
        bytes.put_u32(self.anonymity);
        bytes.put_u32(self.priority);
        bytes.put_i64(self.expiration);
        bytes.put(self.key.as_ref());
        bytes.put(self.data.as_slice());
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < INSERT_FIXED_SIZE {
            return Err(Error::UnderLength);
        }

        Ok(Self {
            block_type: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            anonymity: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            priority: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            expiration: i64::from_be_bytes(bytes[16..24].try_into().unwrap()),
            key: Key(bytes[24..88].try_into().unwrap()),
            data: bytes[INSERT_FIXED_SIZE..].to_vec(),
        })
    }
}

/// A search result delivered back to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult<'a> {
    pub block_type: u32,
    pub expiration: i64,
    pub key: Key,
    pub data: &'a [u8],
}

impl<'a> SearchResult<'a> {
    pub fn encode(&self, bytes: &mut BytesMut) -> Result<(), Error> {
        let size = RESULT_FIXED_SIZE + self.data.len();
        if size > MAX_FRAME_SIZE {
            return Err(Error::TooLarge);
        }

        bytes.put_u16(size as u16);
        bytes.put_u16(CS_RESULT);
        bytes.put_u32(self.block_type);
        bytes.put_i64(self.expiration);
        bytes.put(self.key.as_ref());
        bytes.put(self.data);
        Ok(())
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        let (size, kind) = crate::header(bytes)?;
        if kind != CS_RESULT {
            return Err(Error::UnknownMessage);
        }

        if size < RESULT_FIXED_SIZE {
            return Err(Error::UnderLength);
        }

        Ok(Self {
            block_type: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            expiration: i64::from_be_bytes(bytes[8..16].try_into().unwrap()),
            key: Key(bytes[16..80].try_into().unwrap()),
            data: &bytes[RESULT_FIXED_SIZE..],
        })
    }
}

pub enum ClientPacket {
    SearchStart(SearchStart),
    SearchStop(Key),
    Insert(Insert),
}

/// Decode one client frame.
///
/// # Test
///
/// ```
/// use gap_server_codec::client::{decode, ClientPacket, SearchStart};
/// use gap_server_codec::PeerId;
///
/// let start = SearchStart {
///     block_type: 1,
///     anonymity: 0,
///     priority: 10,
///     expiration: 99_000,
///     target: PeerId::ZERO,
///     keys: vec![[8u8; 64].into()],
/// };
///
/// let mut bytes = bytes::BytesMut::new();
/// start.encode(&mut bytes);
///
/// match decode(&bytes).unwrap() {
///     ClientPacket::SearchStart(it) => {
///         assert_eq!(it, start);
///         assert!(it.target().is_none());
///     }
///     _ => panic!("expected search start"),
/// }
/// ```
pub fn decode(bytes: &[u8]) -> Result<ClientPacket, Error> {
    let (_, kind) = crate::header(bytes)?;
    Ok(match kind {
        CS_SEARCH_START => ClientPacket::SearchStart(SearchStart::decode(bytes)?),
        CS_INSERT => ClientPacket::Insert(Insert::decode(bytes)?),
        CS_SEARCH_STOP => {
            if bytes.len() != SEARCH_STOP_SIZE {
                return Err(Error::UnderLength);
            }

            ClientPacket::SearchStop(Key(bytes[4..68].try_into().unwrap()))
        }
        _ => return Err(Error::UnknownMessage),
    })
}
