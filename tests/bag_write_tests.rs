// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Bag write-path tests.
//!
//! Covers:
//! - The single-message file layout and its reopen
//! - Timestamp validation
//! - Connection identity rules (topic-keyed and header-keyed)
//! - Chunk threshold behavior, chunk time bounds, and index offsets

mod common;

use common::{temp_bag_path, StringMessage};
use robobag::{
    Bag, BagError, BagMode, CompressionType, FieldMap, RawMessage, Time, View,
};

#[test]
fn test_single_message_uncompressed() {
    let (path, _guard) = temp_bag_path("single_message");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.set_compression(CompressionType::None).unwrap();
    bag.write("/t", Time::new(10, 0), &RawMessage::new(vec![0x01, 0x02, 0x03]))
        .unwrap();
    bag.close().unwrap();

    // magic + padded file header + connection + chunk + index records
    // + tail connection + tail chunk info
    let len = std::fs::metadata(&path).unwrap().len();
    assert!(
        (4200..5000).contains(&len),
        "unexpected file size {len} for a single 3-byte message"
    );

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    assert_eq!(bag.major_version(), 2);
    assert_eq!(bag.minor_version(), 0);
    assert_eq!(bag.connections().len(), 1);
    assert_eq!(bag.chunks().len(), 1);

    let view = View::new(&bag);
    assert_eq!(view.size(), 1);
    let messages: Vec<_> = view.iter().collect();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic(), "/t");
    assert_eq!(messages[0].time(), Time::new(10, 0));
    let payload = messages[0].instantiate::<RawMessage>().unwrap().unwrap();
    assert_eq!(payload.data, vec![0x01, 0x02, 0x03]);
    bag.close().unwrap();
}

#[test]
fn test_zero_time_rejected_with_usage_error() {
    let (path, _guard) = temp_bag_path("zero_time");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    let err = bag
        .write("/t", Time::ZERO, &RawMessage::new(vec![1]))
        .unwrap_err();
    assert!(matches!(err, BagError::Usage { .. }));
    bag.close().unwrap();
}

#[test]
fn test_same_topic_shares_connection() {
    let (path, _guard) = temp_bag_path("topic_identity");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.write("/t", Time::new(1, 0), &RawMessage::new(vec![1]))
        .unwrap();
    bag.write("/t", Time::new(2, 0), &RawMessage::new(vec![2]))
        .unwrap();
    bag.write("/u", Time::new(3, 0), &RawMessage::new(vec![3]))
        .unwrap();
    assert_eq!(bag.connections().len(), 2);
    bag.close().unwrap();
}

#[test]
fn test_connection_identity_by_header() {
    let (path, _guard) = temp_bag_path("header_identity");

    let mut header_a = FieldMap::new();
    header_a.insert_str("type", "*");
    header_a.insert_str("md5sum", "*");
    header_a.insert_str("message_definition", "");
    header_a.insert_str("callerid", "/node_a");

    // Differs from header_a in one field only
    let mut header_b = header_a.clone();
    header_b.insert_str("callerid", "/node_b");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();

    let msg = RawMessage::new(vec![1]);
    bag.write_with_header("/t", Time::new(1, 0), &msg, &header_a)
        .unwrap();
    bag.write_with_header("/t", Time::new(2, 0), &msg, &header_a)
        .unwrap();
    assert_eq!(bag.connections().len(), 1, "identical headers share an id");

    bag.write_with_header("/t", Time::new(3, 0), &msg, &header_b)
        .unwrap();
    assert_eq!(bag.connections().len(), 2, "differing field makes a new id");

    // Same header on a different topic stays distinct: the topic is
    // injected into the bookkeeping key
    bag.write_with_header("/u", Time::new(4, 0), &msg, &header_a)
        .unwrap();
    assert_eq!(bag.connections().len(), 3);

    bag.close().unwrap();

    // Dense ids survive the round trip
    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let ids: Vec<u32> = bag.connections().iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(
        bag.connections()[0].header.get_string("callerid").as_deref(),
        Some("/node_a")
    );
    bag.close().unwrap();
}

#[test]
fn test_chunk_threshold_splits_chunks() {
    let (path, _guard) = temp_bag_path("chunk_boundary");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.set_chunk_threshold(64);
    for sec in 1..=6u32 {
        bag.write("/t", Time::new(sec, 0), &RawMessage::new(vec![sec as u8; 20]))
            .unwrap();
    }
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    assert!(bag.chunks().len() >= 2, "threshold of 64 must split chunks");

    // Each chunk's count table matches the messages inside its bounds
    let total: u32 = bag
        .chunks()
        .iter()
        .flat_map(|c| c.connection_counts.values())
        .sum();
    assert_eq!(total, 6);
    for chunk in bag.chunks() {
        assert!(chunk.start_time <= chunk.end_time);
    }

    // Chunk time bounds hold for every message
    let view = View::new(&bag);
    for message in &view {
        let entry = message.index_entry();
        let chunk = bag
            .chunks()
            .iter()
            .find(|c| c.pos == entry.chunk_pos)
            .expect("index entry points at a known chunk");
        assert!(chunk.start_time <= entry.time && entry.time <= chunk.end_time);
    }
    bag.close().unwrap();
}

#[test]
fn test_index_offsets_are_valid() {
    let (path, _guard) = temp_bag_path("offsets");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.set_chunk_threshold(128);
    for sec in 1..=10u32 {
        bag.write("/a", Time::new(sec, 0), &RawMessage::new(vec![0xAB; 30]))
            .unwrap();
        bag.write("/b", Time::new(sec, 500), &StringMessage::new("hello"))
            .unwrap();
    }
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let chunk_positions: Vec<u64> = bag.chunks().iter().map(|c| c.pos).collect();

    let view = View::new(&bag);
    assert_eq!(view.size(), 20);
    for message in &view {
        let entry = message.index_entry();
        assert!(
            chunk_positions.contains(&entry.chunk_pos),
            "chunk_pos {} is not a chunk header position",
            entry.chunk_pos
        );
        // Materialization parses the record envelope at the offset and
        // bounds-checks it against the uncompressed chunk
        assert!(message.size().unwrap() > 0);
    }
    bag.close().unwrap();
}

#[test]
fn test_typed_message_metadata_lands_in_connection() {
    let (path, _guard) = temp_bag_path("typed_metadata");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.write("/chatter", Time::new(1, 0), &StringMessage::new("hi"))
        .unwrap();
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let conn = &bag.connections()[0];
    assert_eq!(conn.topic, "/chatter");
    assert_eq!(conn.datatype, "std_msgs/String");
    assert_eq!(conn.md5sum, "992ce8a1687cec8c8bd883ec73ca41d1");
    assert_eq!(conn.msg_def, "string data");
    bag.close().unwrap();
}

#[test]
fn test_empty_topic_rejected() {
    let (path, _guard) = temp_bag_path("empty_topic");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    let err = bag
        .write("", Time::new(1, 0), &RawMessage::new(vec![1]))
        .unwrap_err();
    assert!(matches!(err, BagError::Usage { .. }));
    bag.close().unwrap();
}

#[test]
fn test_bag_size_grows_while_writing() {
    let (path, _guard) = temp_bag_path("size");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    let initial = bag.size();
    assert!(initial > 0);
    for sec in 1..=50u32 {
        bag.write("/t", Time::new(sec, 0), &RawMessage::new(vec![0; 100]))
            .unwrap();
    }
    bag.close().unwrap();
    assert!(bag.size() == 0, "state is discarded after close");
    assert!(std::fs::metadata(&path).unwrap().len() > initial);
}
