// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Read-path error semantics.
//!
//! Covers:
//! - Unindexed bags (never closed, or truncated inside the index)
//! - Unknown compression names
//! - Malformed message records that must not poison the bag
//! - Unknown encryptor plugins

mod common;

use common::temp_bag_path;
use robobag::{Bag, BagError, BagMode, RawMessage, Time, View};

fn write_simple_bag(path: &std::path::Path, chunk_threshold: Option<u32>) {
    let mut bag = Bag::new();
    bag.open(path, BagMode::Write).unwrap();
    if let Some(threshold) = chunk_threshold {
        bag.set_chunk_threshold(threshold);
    }
    bag.write("/t", Time::new(1, 0), &RawMessage::new(vec![0x11; 8]))
        .unwrap();
    bag.write("/t", Time::new(2, 0), &RawMessage::new(vec![0x22; 8]))
        .unwrap();
    bag.close().unwrap();
}

/// Replace the first occurrence of `needle` in the file.
fn patch_file(path: &std::path::Path, needle: &[u8], replacement: &[u8]) {
    assert_eq!(needle.len(), replacement.len());
    let mut bytes = std::fs::read(path).unwrap();
    let at = bytes
        .windows(needle.len())
        .position(|w| w == needle)
        .expect("pattern present in file");
    bytes[at..at + needle.len()].copy_from_slice(replacement);
    std::fs::write(path, bytes).unwrap();
}

#[test]
fn test_never_closed_bag_is_unindexed() {
    let (path, _guard) = temp_bag_path("never_closed");
    write_simple_bag(&path, None);
    // Zero out index_pos the way a crashed writer leaves it
    let mut bytes = std::fs::read(&path).unwrap();
    let at = bytes
        .windows(10)
        .position(|w| w == b"index_pos=")
        .expect("file header present");
    bytes[at + 10..at + 18].copy_from_slice(&0u64.to_le_bytes());
    std::fs::write(&path, bytes).unwrap();

    let mut bag = Bag::new();
    let err = bag.open(&path, BagMode::Read).unwrap_err();
    assert!(matches!(err, BagError::Unindexed { .. }), "got {err:?}");
}

#[test]
fn test_truncated_index_reports_offset() {
    let (path, _guard) = temp_bag_path("truncated_index");
    write_simple_bag(&path, None);

    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 10).unwrap();
    drop(file);

    let mut bag = Bag::new();
    let err = bag.open(&path, BagMode::Read).unwrap_err();
    match err {
        BagError::Unindexed { offset, .. } => {
            assert!(offset > 0, "failure offset should be recorded");
        }
        other => panic!("expected Unindexed, got {other:?}"),
    }
    assert!(!bag.is_open(), "failed open releases the file");
}

#[test]
fn test_unknown_compression_name() {
    let (path, _guard) = temp_bag_path("bad_compression");
    write_simple_bag(&path, None);
    patch_file(&path, b"compression=none", b"compression=zip!");

    let mut bag = Bag::new();
    // The chunk header is parsed while rebuilding the index, so the
    // open itself fails
    let err = bag.open(&path, BagMode::Read).unwrap_err();
    assert!(matches!(err, BagError::Unindexed { .. }), "got {err:?}");
}

#[test]
fn test_corrupt_message_record_does_not_poison_the_bag() {
    let (path, _guard) = temp_bag_path("corrupt_message");
    // Tiny threshold: each message lands in its own chunk
    write_simple_bag(&path, Some(16));

    // Break the opcode of the first chunk's message record
    let mut needle = vec![4u8, 0, 0, 0];
    needle.extend(b"op=\x02");
    let mut replacement = vec![4u8, 0, 0, 0];
    replacement.extend(b"op=\x09");
    patch_file(&path, &needle, &replacement);

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let view = View::new(&bag);
    let messages: Vec<_> = view.iter().collect();
    assert_eq!(messages.len(), 2);

    let err = messages[0].instantiate::<RawMessage>().unwrap_err();
    assert!(err.is_format(), "got {err:?}");

    // The second chunk is untouched and still materializes
    let ok = messages[1].instantiate::<RawMessage>().unwrap().unwrap();
    assert_eq!(ok.data, vec![0x22; 8]);
    bag.close().unwrap();
}

#[test]
fn test_unknown_encryptor_plugin_rejected_on_write() {
    let (path, _guard) = temp_bag_path("bad_encryptor");
    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    let err = bag.set_encryptor_plugin("aes", "").unwrap_err();
    assert!(matches!(err, BagError::Encryption { .. }));
    bag.close().unwrap();
}

#[test]
fn test_unknown_encryptor_in_file_header_rejected_on_read() {
    let (path, _guard) = temp_bag_path("bad_encryptor_read");
    write_simple_bag(&path, None);
    // Smuggle an encryptor name into the padded file header; the
    // padding gives the record room for the extra field
    let bytes = std::fs::read(&path).unwrap();
    // The record header starts right after the 13-byte magic line.
    // Extend header_len and append an "encryptor=aes" field, taking
    // the bytes out of the padding data block.
    let header_len_at = 13;
    let header_len = u32::from_le_bytes([bytes[13], bytes[14], bytes[15], bytes[16]]);
    let field: &[u8] = b"encryptor=aes";
    let mut patched = Vec::new();
    patched.extend_from_slice(&bytes[..header_len_at]);
    patched.extend_from_slice(&(header_len + 4 + field.len() as u32).to_le_bytes());
    patched.extend_from_slice(&bytes[17..17 + header_len as usize]);
    patched.extend_from_slice(&(field.len() as u32).to_le_bytes());
    patched.extend_from_slice(field);
    // Shrink the padding data block by the bytes we consumed
    let data_len_at = 17 + header_len as usize;
    let data_len = u32::from_le_bytes([
        bytes[data_len_at],
        bytes[data_len_at + 1],
        bytes[data_len_at + 2],
        bytes[data_len_at + 3],
    ]);
    let consumed = 4 + field.len() as u32;
    patched.extend_from_slice(&(data_len - consumed).to_le_bytes());
    patched.extend_from_slice(&bytes[data_len_at + 4 + consumed as usize..]);
    std::fs::write(&path, patched).unwrap();

    let mut bag = Bag::new();
    let err = bag.open(&path, BagMode::Read).unwrap_err();
    assert!(matches!(err, BagError::Encryption { .. }), "got {err:?}");
}

#[test]
fn test_codec_failure_surfaces_without_poisoning() {
    let (path, _guard) = temp_bag_path("codec_failure");

    struct FailingMessage;

    impl robobag::TypedMessage for FailingMessage {
        fn datatype() -> &'static str {
            "test_msgs/Failing"
        }
        fn md5sum() -> &'static str {
            "*"
        }
        fn definition() -> &'static str {
            ""
        }
        fn encode(&self, _out: &mut Vec<u8>) -> robobag::Result<()> {
            Err(BagError::format("FailingMessage", "cannot serialize"))
        }
        fn decode(_data: &[u8]) -> robobag::Result<FailingMessage> {
            Ok(FailingMessage)
        }
    }

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Write).unwrap();
    bag.write("/t", Time::new(1, 0), &RawMessage::new(vec![1]))
        .unwrap();

    // Codec failures surface before the file is touched and do not
    // poison the bag
    assert!(bag.write("/t", Time::new(2, 0), &FailingMessage).is_err());
    bag.write("/t", Time::new(3, 0), &RawMessage::new(vec![3]))
        .unwrap();
    bag.close().unwrap();

    let mut bag = Bag::new();
    bag.open(&path, BagMode::Read).unwrap();
    let view = View::new(&bag);
    assert_eq!(view.size(), 2);
    bag.close().unwrap();
}
