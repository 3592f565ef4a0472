// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Append-path tests.
//!
//! Covers:
//! - Appending new topics and extending existing ones
//! - Connection-id reuse across reopen
//! - Append with zero writes leaving the file byte-identical
//! - Repeated append cycles

mod common;

use common::temp_bag_path;
use robobag::{Bag, BagError, BagMode, CompressionType, RawMessage, Time, View};

#[test]
fn test_append_new_topic() {
    let (path, _guard) = temp_bag_path("append_new_topic");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.write("/t", Time::new(10, 0), &RawMessage::new(vec![1, 2, 3]))
        .unwrap();
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Append).unwrap();
    assert!(bag.revision() > 0, "append starts at a non-zero revision");
    bag.write("/t2", Time::new(11, 0), &RawMessage::new(vec![9]))
        .unwrap();
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let view = View::new(&bag);
    let sequence: Vec<(String, u32, Vec<u8>)> = view
        .iter()
        .map(|m| {
            (
                m.topic().to_string(),
                m.time().sec,
                m.instantiate::<RawMessage>().unwrap().unwrap().data,
            )
        })
        .collect();
    assert_eq!(
        sequence,
        vec![
            ("/t".to_string(), 10, vec![1, 2, 3]),
            ("/t2".to_string(), 11, vec![9]),
        ]
    );
    bag.close().unwrap();
}

#[test]
fn test_append_reuses_existing_connection_id() {
    let (path, _guard) = temp_bag_path("append_reuse");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.write("/t", Time::new(1, 0), &RawMessage::new(vec![1]))
        .unwrap();
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Append).unwrap();
    bag.write("/t", Time::new(2, 0), &RawMessage::new(vec![2]))
        .unwrap();
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    assert_eq!(
        bag.connections().len(),
        1,
        "appending to an existing topic reuses its connection"
    );
    let view = View::new(&bag);
    assert_eq!(view.size(), 2);
    bag.close().unwrap();
}

#[test]
fn test_append_without_writes_is_byte_identical() {
    let (path, _guard) = temp_bag_path("append_idempotent");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.write("/t", Time::new(1, 0), &RawMessage::new(vec![1, 2]))
        .unwrap();
    bag.write("/u", Time::new(2, 0), &RawMessage::new(vec![3]))
        .unwrap();
    bag.close().unwrap();

    let before = std::fs::read(&path).unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Append).unwrap();
    bag.close().unwrap();

    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_repeated_append_cycles() {
    let (path, _guard) = temp_bag_path("append_cycles");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.write("/t", Time::new(1, 0), &RawMessage::new(vec![0]))
        .unwrap();
    bag.close().unwrap();

    for round in 2..=5u32 {
        let mut bag = Bag::new();
        bag.open(&path, BagMode::Append).unwrap();
        bag.write("/t", Time::new(round, 0), &RawMessage::new(vec![round as u8]))
            .unwrap();
        bag.close().unwrap();
    }

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    assert_eq!(bag.connections().len(), 1);
    assert_eq!(bag.chunks().len(), 5);
    let view = View::new(&bag);
    let payloads: Vec<u8> = view
        .iter()
        .map(|m| m.instantiate::<RawMessage>().unwrap().unwrap().data[0])
        .collect();
    assert_eq!(payloads, vec![0, 2, 3, 4, 5]);
    bag.close().unwrap();
}

#[test]
fn test_append_preserves_compression_choice_per_session() {
    let (path, _guard) = temp_bag_path("append_compression");

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.set_compression(CompressionType::None).unwrap();
    bag.write("/t", Time::new(1, 0), &RawMessage::new(vec![1; 100]))
        .unwrap();
    bag.close().unwrap();

    // The appended session may use a different codec; chunks record
    // their own compression
    let mut bag = Bag::new();
    bag.open(&path, BagMode::Append).unwrap();
    bag.set_compression(CompressionType::Lz4).unwrap();
    bag.write("/t", Time::new(2, 0), &RawMessage::new(vec![2; 100]))
        .unwrap();
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let view = View::new(&bag);
    let payloads: Vec<Vec<u8>> = view
        .iter()
        .map(|m| m.instantiate::<RawMessage>().unwrap().unwrap().data)
        .collect();
    assert_eq!(payloads, vec![vec![1; 100], vec![2; 100]]);
    bag.close().unwrap();
}

#[test]
fn test_append_to_legacy_bag_rejected() {
    let (path, _guard) = temp_bag_path("append_legacy");
    // Minimal 1.2 magic is enough: append must refuse before parsing
    // any records
    std::fs::write(&path, b"#ROS BAG V1.2\n").unwrap();

    let mut bag = Bag::new();
    let err = bag.open(&path, BagMode::Append).unwrap_err();
    assert!(matches!(err, BagError::Usage { .. }));
}
