use anyhow::Result;
use bytes::BytesMut;
use gap_server_codec::{
    BLOCK_DATA, Error, Key, P2P_QUERY, Packet, PeerId,
    client::{self, ClientPacket, Insert, SearchResult, SearchStart},
    decode,
    message::{Query, REPLY_FIXED_SIZE, Reply},
    wrapper::{Wrapper, fold_hash},
};

fn key(fill: u8) -> Key {
    Key([fill; 64])
}

#[test]
fn test_query_roundtrip() -> Result<()> {
    let query = Query {
        block_type: BLOCK_DATA,
        priority: 42,
        ttl: -7_500,
        return_to: PeerId([9u8; 64]),
        keys: vec![key(1), key(2), key(3)],
    };

    let bytes = query.to_bytes();
    assert_eq!(bytes.len(), 80 + 3 * 64);

    match decode(&bytes)? {
        Packet::Query(decoded) => {
            assert_eq!(decoded, query);
            assert_eq!(decoded.primary_key(), &key(1));
            assert_eq!(decoded.ttl, -7_500);
        }
        _ => panic!("expected a query"),
    }

    Ok(())
}

#[test]
fn test_query_key_alignment() {
    let query = Query {
        block_type: 0,
        priority: 0,
        ttl: 0,
        return_to: PeerId::ZERO,
        keys: vec![key(1), key(2)],
    };

    let mut bytes = BytesMut::new();
    query.encode(&mut bytes);

    // chop off half a key and fix up the declared size
    let mut short = bytes[..bytes.len() - 32].to_vec();
    let size = short.len() as u16;
    short[0..2].copy_from_slice(&size.to_be_bytes());

    assert!(matches!(
        Query::decode(&short),
        Err(Error::KeyAlignment)
    ));
}

#[test]
fn test_query_under_length() {
    // a header claiming a query with zero keys
    let mut bytes = vec![0u8; 80];
    bytes[0..2].copy_from_slice(&80u16.to_be_bytes());
    bytes[2..4].copy_from_slice(&P2P_QUERY.to_be_bytes());

    assert!(Query::decode(&bytes).is_err());
}

#[test]
fn test_reply_roundtrip() -> Result<()> {
    let mut bytes = BytesMut::new();
    Reply::encode(&key(5), b"some payload", &mut bytes)?;
    assert_eq!(bytes.len(), REPLY_FIXED_SIZE + 12);

    let reply = Reply::decode(&bytes)?;
    assert_eq!(reply.primary_key, key(5));
    assert_eq!(reply.payload, b"some payload");

    // an empty payload is still a valid reply frame
    let mut empty = BytesMut::new();
    Reply::encode(&key(5), b"", &mut empty)?;
    assert_eq!(Reply::decode(&empty)?.payload.len(), 0);
    Ok(())
}

#[test]
fn test_reply_under_length() {
    let mut bytes = vec![0u8; 60];
    bytes[0..2].copy_from_slice(&60u16.to_be_bytes());
    bytes[2..4].copy_from_slice(&0x11u16.to_be_bytes());

    assert!(Reply::decode(&bytes).is_err());
}

#[test]
fn test_declared_size_must_match() {
    let query = Query {
        block_type: 0,
        priority: 0,
        ttl: 0,
        return_to: PeerId::ZERO,
        keys: vec![key(1)],
    };

    let bytes = query.to_bytes();
    assert!(decode(&bytes[..bytes.len() - 1]).is_err());
}

#[test]
fn test_wrapper_hash_ignores_expiration() {
    let one = Wrapper {
        block_type: BLOCK_DATA,
        expiration: 1,
        data: b"same block",
    };

    let two = Wrapper {
        block_type: BLOCK_DATA,
        expiration: 999_999,
        data: b"same block",
    };

    assert_eq!(one.content_hash(), two.content_hash());
    assert_ne!(fold_hash(b"same block"), fold_hash(b"other block"));
}

#[test]
fn test_client_roundtrips() -> Result<()> {
    let start = SearchStart {
        block_type: BLOCK_DATA,
        anonymity: 2,
        priority: 10,
        expiration: 123_456,
        target: PeerId([4u8; 64]),
        keys: vec![key(8)],
    };

    let mut bytes = BytesMut::new();
    start.encode(&mut bytes);
    match client::decode(&bytes)? {
        ClientPacket::SearchStart(decoded) => {
            assert_eq!(decoded, start);
            assert_eq!(decoded.target(), Some(&PeerId([4u8; 64])));
        }
        _ => panic!("expected search start"),
    }

    let insert = Insert {
        block_type: BLOCK_DATA,
        anonymity: 0,
        priority: 3,
        expiration: 0,
        key: key(7),
        data: b"content".to_vec(),
    };

    let mut bytes = BytesMut::new();
    insert.encode(&mut bytes);
    match client::decode(&bytes)? {
        ClientPacket::Insert(decoded) => assert_eq!(decoded, insert),
        _ => panic!("expected insert"),
    }

    let mut bytes = BytesMut::new();
    let result = SearchResult {
        block_type: BLOCK_DATA,
        expiration: 55,
        key: key(6),
        data: b"found",
    };

    result.encode(&mut bytes)?;
    assert_eq!(SearchResult::decode(&bytes)?, result);
    Ok(())
}
