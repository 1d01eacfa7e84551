use crate::{Error, Key};

use bytes::{BufMut, BytesMut};

/// Bytes of a wrapper before the block data starts.
pub const WRAPPER_FIXED_SIZE: usize = 4 + 8;

/// The content envelope carried inside reply payloads and stored by the
/// datastore.
///
/// The routing engine never looks inside a payload; everything the file
/// sharing layer needs to reconstruct a block (its type tag and
/// expiration) rides in this wrapper. Expiration is absolute milliseconds
/// since the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wrapper<'a> {
    pub block_type: u32,
    pub expiration: i64,
    pub data: &'a [u8],
}

impl<'a> Wrapper<'a> {
    /// # Test
    ///
    /// ```
    /// use gap_server_codec::wrapper::Wrapper;
    ///
    /// let wrapper = Wrapper {
    ///     block_type: 1,
    ///     expiration: 1234,
    ///     data: b"block",
    /// };
    ///
    /// let mut bytes = bytes::BytesMut::new();
    /// wrapper.encode(&mut bytes);
    ///
    /// assert_eq!(Wrapper::decode(&bytes).unwrap(), wrapper);
    /// assert!(Wrapper::decode(&bytes[..8]).is_err());
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < WRAPPER_FIXED_SIZE {
            return Err(Error::UnderLength);
        }

        Ok(Self {
            block_type: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            expiration: i64::from_be_bytes(bytes[4..12].try_into().unwrap()),
            data: &bytes[WRAPPER_FIXED_SIZE..],
        })
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u32(self.block_type);
        bytes.put_i64(self.expiration);
        bytes.put(self.data);
    }

    pub fn size(&self) -> usize {
        WRAPPER_FIXED_SIZE + self.data.len()
    }

    /// The content hash replies are de-duplicated by.
    ///
    /// Only the block data takes part; two wrappers for the same block
    /// with different expirations hash alike.
    pub fn content_hash(&self) -> Key {
        fold_hash(self.data)
    }
}

/// Fold arbitrary bytes into a 512-bit digest.
///
/// An FNV-style mixing fold, NOT a cryptographic hash. The seen set only
/// needs a stable, well distributed identifier per block; forging
/// collisions buys an attacker nothing that replaying the block itself
/// would not.
pub fn fold_hash(data: &[u8]) -> Key {
    let mut state = [0u64; 8];
    for (i, it) in state.iter_mut().enumerate() {
        *it = 0xcbf29ce484222325u64.wrapping_add(i as u64);
    }

    for (i, byte) in data.iter().enumerate() {
        let slot = i % 8;
        state[slot] ^= *byte as u64;
        state[slot] = state[slot].wrapping_mul(0x100000001b3);
    }

    let mut bytes = [0u8; 64];
    for (i, it) in state.iter().enumerate() {
        bytes[i * 8..(i + 1) * 8].copy_from_slice(&it.to_be_bytes());
    }

    Key(bytes)
}
