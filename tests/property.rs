//! Property-based tests for the frame codec and the accept key.
//!
//! These tests use proptest to exercise decode/encode on arbitrary payloads.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use proptest::prelude::*;
use sha1::{Digest, Sha1};
use wspool::protocol::frame::{MAX_CHUNK_PAYLOAD, chunk_count, frame_size, payload_offset};
use wspool::protocol::{
    HttpRequest, WS_GUID, apply_mask, compute_accept_key, decode, encode, encode_extended,
    encode_masked,
};

/// Split chunked encoder output into frame payloads, checking each header.
fn split_chunked(mut wire: &[u8]) -> Result<Vec<Vec<u8>>, TestCaseError> {
    let mut frames = Vec::new();
    while !wire.is_empty() {
        prop_assert!(wire.len() >= 2);
        prop_assert_eq!(wire[0], 0x81);
        let len = wire[1] as usize;
        prop_assert!(len <= MAX_CHUNK_PAYLOAD);
        prop_assert!(wire.len() >= 2 + len);
        frames.push(wire[2..2 + len].to_vec());
        wire = &wire[2 + len..];
    }
    Ok(frames)
}

proptest! {
    // =========================================================================
    // Property 1: Masked client frames decode to the original payload
    // =========================================================================
    #[test]
    fn test_masked_roundtrip_short(
        payload in prop::collection::vec(any::<u8>(), 0..=125),
        mask in any::<[u8; 4]>()
    ) {
        let wire = encode_masked(&payload, mask);
        prop_assert_eq!(decode(&wire).unwrap(), payload);
    }

    #[test]
    fn test_masked_roundtrip_extended(
        payload in prop::collection::vec(any::<u8>(), 126..3000),
        mask in any::<[u8; 4]>()
    ) {
        let wire = encode_masked(&payload, mask);
        prop_assert_eq!(payload_offset(&wire).unwrap(), 8);
        prop_assert_eq!(decode(&wire).unwrap(), payload);
    }

    // The declared size is readable from the header alone and cuts exactly
    // one frame off a stream of back-to-back frames.
    #[test]
    fn test_frame_size_splits_stream(
        first in prop::collection::vec(any::<u8>(), 0..400),
        second in prop::collection::vec(any::<u8>(), 0..400),
        mask in any::<[u8; 4]>()
    ) {
        let head = encode_masked(&first, mask);
        let mut stream = head.clone();
        stream.extend_from_slice(&encode_masked(&second, mask));

        let offset = payload_offset(&stream).unwrap();
        let size = frame_size(&stream[..offset]).unwrap();
        prop_assert_eq!(size, head.len());
        prop_assert_eq!(decode(&stream[..size]).unwrap(), first);
        prop_assert_eq!(decode(&stream[size..]).unwrap(), second);
    }

    // =========================================================================
    // Property 2: Chunked encoding produces ceil(len/125) valid frames
    // =========================================================================
    #[test]
    fn test_chunk_count(payload in prop::collection::vec(any::<u8>(), 1..2000)) {
        let frames = split_chunked(&encode(&payload))?;
        prop_assert_eq!(frames.len(), payload.len().div_ceil(125));
        prop_assert_eq!(frames.len(), chunk_count(payload.len()));
        prop_assert_eq!(frames.concat(), payload);
    }

    #[test]
    fn test_only_last_chunk_is_short(payload in prop::collection::vec(any::<u8>(), 1..2000)) {
        let frames = split_chunked(&encode(&payload))?;
        let (last, full) = frames.split_last().unwrap();
        prop_assert!(full.iter().all(|f| f.len() == MAX_CHUNK_PAYLOAD));
        prop_assert!(!last.is_empty());
    }

    // =========================================================================
    // Property 3: Extended encoding is one frame with the exact length
    // =========================================================================
    #[test]
    fn test_extended_single_frame(payload in prop::collection::vec(any::<u8>(), 0..70_000)) {
        let wire = encode_extended(&payload);
        prop_assert_eq!(wire[0], 0x81);
        prop_assert_eq!(wire[1] & 0x80, 0);
        let (len, offset) = match wire[1] {
            126 => (u16::from_be_bytes([wire[2], wire[3]]) as usize, 4),
            127 => (u64::from_be_bytes(wire[2..10].try_into().unwrap()) as usize, 10),
            n => (n as usize, 2),
        };
        prop_assert_eq!(len, payload.len());
        prop_assert_eq!(&wire[offset..], &payload[..]);
    }

    // =========================================================================
    // Property 4: Masking is an involution
    // =========================================================================
    #[test]
    fn test_mask_involution(
        data in prop::collection::vec(any::<u8>(), 0..1000),
        mask in any::<[u8; 4]>()
    ) {
        let mut buf = data.clone();
        apply_mask(&mut buf, mask);
        apply_mask(&mut buf, mask);
        prop_assert_eq!(buf, data);
    }

    // =========================================================================
    // Property 5: Accept key is base64(SHA1(key + GUID))
    // =========================================================================
    #[test]
    fn test_accept_key_definition(raw in any::<[u8; 16]>()) {
        let key = STANDARD.encode(raw);
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        hasher.update(WS_GUID.as_bytes());
        let expected = STANDARD.encode(hasher.finalize());
        prop_assert_eq!(compute_accept_key(&key), expected);
    }

    // =========================================================================
    // Property 6: Header lookup ignores case
    // =========================================================================
    #[test]
    fn test_header_lookup_case_insensitive(raw in any::<[u8; 16]>(), upper in any::<bool>()) {
        let key = STANDARD.encode(raw);
        let name = if upper { "SEC-WEBSOCKET-KEY" } else { "sec-websocket-key" };
        let request = format!("GET / HTTP/1.1\r\nHost: x\r\n{name}: {key}\r\n\r\n");
        let parsed = HttpRequest::parse(request.as_bytes()).unwrap();
        prop_assert_eq!(parsed.websocket_key().unwrap(), key.as_str());
    }

    // =========================================================================
    // Property 7: Decode never panics on arbitrary input
    // =========================================================================
    #[test]
    fn test_decode_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..300)) {
        let _ = decode(&data);
    }
}

#[test]
fn test_rfc_accept_example() {
    assert_eq!(
        compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
        "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
}

#[test]
fn test_encode_hi() {
    assert_eq!(encode(b"hi"), vec![0x81, 0x02, b'h', b'i']);
}
