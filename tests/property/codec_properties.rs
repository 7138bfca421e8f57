//! Property-based tests for the wire formats.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never makes lenient inbound decoding panic.
//! 2. Bus-encoded messages are seen unchanged by the inbound decoder.
//! 3. Chunk frames unpack to what was packed, and any payload corruption
//!    is caught by the integrity check.
//! 4. Length-prefixed framing needs the whole frame and consumes exactly it.
//! 5. Chunks reassemble to the original asset in any arrival order.

use proptest::prelude::*;

use linkchat_proto::chunk::{ChunkError, ChunkHeader, Reassembler, pack_chunk, unpack_chunk};
use linkchat_proto::codec::{self, decode_inbound};
use linkchat_proto::envelope::{Inbound, ServerEnvelope};
use linkchat_proto::framing::{Frame, classify, decode_frame, encode_frame};
use linkchat_proto::transfer::{AssetReference, chunk_count};

fn header_for(data_len: usize, chunk_size: usize, index: usize, total: u16) -> ChunkHeader {
    ChunkHeader {
        total_len: u32::try_from(data_len).unwrap(),
        offset: u32::try_from(index * chunk_size).unwrap(),
        chunk_id: u16::try_from(index).unwrap(),
        total_chunks: total,
    }
}

proptest! {
    #[test]
    fn inbound_decode_never_panics(text in ".{0,512}") {
        let _ = decode_inbound(&text);
    }

    #[test]
    fn inbound_decode_never_panics_on_typed_objects(
        kind in prop::sample::select(vec![
            "message",
            "list",
            "user_list_update",
            "ip_assigned",
            "error",
            "other",
        ]),
        field in "[a-zA-Z]{1,12}",
        value in prop::option::of(".{0,64}"),
    ) {
        let mut object = serde_json::json!({ "type": kind });
        if let Some(value) = value {
            object[field.as_str()] = serde_json::Value::String(value);
        }
        let _ = decode_inbound(&object.to_string());
    }

    #[test]
    fn routed_messages_decode_unchanged(
        from in "[a-z]{1,16}",
        to in "[a-z]{1,16}",
        msg in ".{0,256}",
    ) {
        let frame = codec::encode(&ServerEnvelope::Message {
            from: from.clone(),
            to: to.clone(),
            msg: msg.clone(),
        }).unwrap();
        let Inbound::Message(message) = decode_inbound(&frame).unwrap() else {
            panic!("expected a message");
        };
        prop_assert_eq!(message.from, Some(from));
        prop_assert_eq!(message.to, Some(to));
        prop_assert_eq!(message.content, msg);
    }

    #[test]
    fn chunk_unpacks_to_what_was_packed(
        payload in prop::collection::vec(any::<u8>(), 0..2048),
        chunk_id in any::<u16>(),
        total_chunks in any::<u16>(),
        offset in any::<u32>(),
        with_metadata in any::<bool>(),
    ) {
        let header = ChunkHeader {
            total_len: u32::try_from(payload.len()).unwrap(),
            offset,
            chunk_id,
            total_chunks,
        };
        let metadata = with_metadata.then(|| serde_json::json!({ "name": "cat.png" }));
        let frame = pack_chunk(&header, &payload, metadata.as_ref()).unwrap();

        let chunk = unpack_chunk(&frame).unwrap();
        prop_assert_eq!(chunk.header, header);
        prop_assert_eq!(chunk.payload, payload.as_slice());
        prop_assert_eq!(chunk.metadata, metadata);
    }

    #[test]
    fn corrupted_payload_fails_integrity(
        payload in prop::collection::vec(any::<u8>(), 1..1024),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let header = header_for(payload.len(), payload.len(), 0, 1);
        let mut frame = pack_chunk(&header, &payload, None).unwrap();
        let at = frame.len() - payload.len() + index.index(payload.len());
        frame[at] ^= flip;

        prop_assert!(matches!(unpack_chunk(&frame), Err(ChunkError::IntegrityMismatch(0))));
    }

    #[test]
    fn framing_needs_the_whole_frame(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        trailing in prop::collection::vec(any::<u8>(), 0..16),
    ) {
        let frame = encode_frame(&payload).unwrap();
        for cut in 0..frame.len() {
            prop_assert_eq!(decode_frame(&frame[..cut]).unwrap(), None);
        }

        let mut stream = frame.clone();
        stream.extend_from_slice(&trailing);
        let (decoded, consumed) = decode_frame(&stream).unwrap().unwrap();
        prop_assert_eq!(decoded, payload.as_slice());
        prop_assert_eq!(consumed, frame.len());
    }

    #[test]
    fn packed_chunks_classify_as_chunks(payload in prop::collection::vec(any::<u8>(), 0..512)) {
        let frame = pack_chunk(&header_for(payload.len(), 512, 0, 1), &payload, None).unwrap();
        prop_assert!(matches!(classify(&frame), Ok(Frame::Chunk(_))));
    }

    #[test]
    fn chunk_count_covers_the_asset(total in 0u64..1_000_000, size in 1usize..70_000) {
        let chunks = chunk_count(total, size);
        let size = u64::try_from(size).unwrap();
        prop_assert!(chunks * size >= total);
        if chunks > 0 {
            prop_assert!((chunks - 1) * size < total);
        }
    }

    #[test]
    fn reassembly_is_order_independent(
        data in prop::collection::vec(any::<u8>(), 1..4096),
        chunk_size in 1usize..512,
        order in any::<u64>(),
    ) {
        let total = u16::try_from(data.len().div_ceil(chunk_size)).unwrap();
        let mut ids: Vec<usize> = (0..usize::from(total)).collect();
        // Deterministic shuffle from the generated seed.
        let mut seed = order | 1;
        for i in (1..ids.len()).rev() {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            ids.swap(i, usize::try_from(seed % u64::try_from(i + 1).unwrap()).unwrap());
        }

        let mut reassembler = Reassembler::new(data.len(), total, chunk_size);
        for &i in &ids {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(data.len());
            let header = header_for(data.len(), chunk_size, i, total);
            let frame = pack_chunk(&header, &data[start..end], None).unwrap();
            let chunk = unpack_chunk(&frame).unwrap();
            prop_assert!(reassembler.add(chunk.header.chunk_id, chunk.payload).unwrap());
        }
        prop_assert!(reassembler.is_complete());
        prop_assert_eq!(reassembler.assemble(), Some(data.clone()));
        prop_assert_eq!(reassembler.assemble_partial(), data);
    }

    #[test]
    fn asset_messages_parse_back(name in "[A-Za-z0-9_][A-Za-z0-9_.-]{0,40}") {
        let asset = AssetReference::new(name.clone()).unwrap();
        prop_assert_eq!(AssetReference::parse_message(&asset.to_message()), Some(asset));
        prop_assert_eq!(AssetReference::parse_message(&name), None);
    }
}
