use crate::{Error, HEADER_SIZE, Key, MAX_FRAME_SIZE, P2P_QUERY, P2P_REPLY, PeerId};

use bytes::{BufMut, Bytes, BytesMut};

/// Bytes of a query frame before the key list starts.
pub const QUERY_FIXED_SIZE: usize = HEADER_SIZE + 4 + 4 + 4 + 64;

/// Bytes of a reply frame before the payload starts.
pub const REPLY_FIXED_SIZE: usize = HEADER_SIZE + 64;

/// A request for content.
///
/// The number of keys is implied by the frame size. The ttl is a SIGNED
/// relative duration in milliseconds; a negative ttl marks a query that
/// is formally expired but may still tap onto a pending request.
/// `return_to` names the peer that forwarded the query to us, not the
/// originator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub block_type: u32,
    pub priority: u32,
    pub ttl: i32,
    pub return_to: PeerId,
    pub keys: Vec<Key>,
}

impl Query {
    /// The key replies are routed by.
    pub fn primary_key(&self) -> &Key {
        &self.keys[0]
    }

    /// Total frame size once encoded.
    pub fn size(&self) -> usize {
        QUERY_FIXED_SIZE + self.keys.len() * 64
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u16(self.size() as u16);
        bytes.put_u16(P2P_QUERY);
        bytes.put_u32(self.block_type);
        bytes.put_u32(self.priority);
        bytes.put_i32(self.ttl);
        bytes.put(self.return_to.as_ref());
        for key in &self.keys {
            bytes.put(key.as_ref());
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(self.size());
        self.encode(&mut bytes);
        bytes.freeze()
    }

    /// # Test
    ///
    /// ```
    /// use gap_server_codec::{message::Query, Error, PeerId};
    ///
    /// let query = Query {
    ///     block_type: 1,
    ///     priority: 5,
    ///     ttl: -1000,
    ///     return_to: PeerId([1u8; 64]),
    ///     keys: vec![[2u8; 64].into(), [3u8; 64].into()],
    /// };
    ///
    /// let bytes = query.to_bytes();
    /// assert_eq!(bytes.len(), 208);
    /// assert_eq!(Query::decode(&bytes).unwrap(), query);
    ///
    /// // a truncated key list is not a query
    /// assert!(Query::decode(&bytes[..200]).is_err());
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let (size, kind) = crate::header(bytes)?;
        if kind != P2P_QUERY {
            return Err(Error::UnknownMessage);
        }

        if size < QUERY_FIXED_SIZE + 64 {
            return Err(Error::UnderLength);
        }

        // Multi-key queries must carry whole keys, nothing in between.
        if (size - QUERY_FIXED_SIZE) % 64 != 0 {
            return Err(Error::KeyAlignment);
        }

        let count = (size - QUERY_FIXED_SIZE) / 64;
        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            let start = QUERY_FIXED_SIZE + i * 64;
            keys.push(Key(bytes[start..start + 64].try_into().unwrap()));
        }

        Ok(Self {
            block_type: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            priority: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            ttl: i32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            return_to: PeerId(bytes[16..80].try_into().unwrap()),
            keys,
        })
    }
}

/// A search result travelling back along the query path.
///
/// The payload is opaque to the routing layer; validation and hashing are
/// the block store's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply<'a> {
    pub primary_key: Key,
    pub payload: &'a [u8],
}

impl<'a> Reply<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        let (size, kind) = crate::header(bytes)?;
        if kind != P2P_REPLY {
            return Err(Error::UnknownMessage);
        }

        if size < REPLY_FIXED_SIZE {
            return Err(Error::UnderLength);
        }

        Ok(Self {
            primary_key: Key(bytes[4..68].try_into().unwrap()),
            payload: &bytes[REPLY_FIXED_SIZE..],
        })
    }

    /// Encode a reply frame for the given key and payload.
    ///
    /// # Test
    ///
    /// ```
    /// use gap_server_codec::message::Reply;
    ///
    /// let mut bytes = bytes::BytesMut::new();
    /// Reply::encode(&[5u8; 64].into(), b"hello", &mut bytes).unwrap();
    ///
    /// assert_eq!(bytes.len(), 73);
    ///
    /// let reply = Reply::decode(&bytes).unwrap();
    /// assert_eq!(reply.payload, b"hello");
    /// ```
    pub fn encode(primary_key: &Key, payload: &[u8], bytes: &mut BytesMut) -> Result<(), Error> {
        let size = REPLY_FIXED_SIZE + payload.len();
        if size > MAX_FRAME_SIZE {
            return Err(Error::TooLarge);
        }

        bytes.put_u16(size as u16);
        bytes.put_u16(P2P_REPLY);
        bytes.put(primary_key.as_ref());
        bytes.put(payload);
        Ok(())
    }

    pub fn frame_size(payload_len: usize) -> usize {
        REPLY_FIXED_SIZE + payload_len
    }
}
