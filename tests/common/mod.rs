// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Shared fixtures for the bag integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use robobag::{Result, TypedMessage};

/// Get a temporary directory for test files.
///
/// Combines the process id with a nanosecond stamp to avoid collisions
/// when tests run in parallel.
fn temp_dir() -> PathBuf {
    let random = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .subsec_nanos();
    std::env::temp_dir().join(format!("robobag_test_{}_{}", std::process::id(), random))
}

/// Create a temporary bag file path and a cleanup guard for the
/// directory.
pub fn temp_bag_path(name: &str) -> (PathBuf, CleanupGuard) {
    let dir = temp_dir();
    fs::create_dir_all(&dir).ok();
    let path = dir.join(format!("{}.bag", name));
    (path, CleanupGuard(dir))
}

/// Removes the temporary directory when the test completes.
#[derive(Debug)]
pub struct CleanupGuard(PathBuf);

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

/// A typed test message with a real (non-wildcard) MD5, serialized the
/// way std_msgs/String is: a little-endian length prefix plus bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringMessage {
    pub data: String,
}

impl StringMessage {
    pub fn new(data: &str) -> StringMessage {
        StringMessage {
            data: data.to_string(),
        }
    }
}

impl TypedMessage for StringMessage {
    fn datatype() -> &'static str {
        "std_msgs/String"
    }

    fn md5sum() -> &'static str {
        "992ce8a1687cec8c8bd883ec73ca41d1"
    }

    fn definition() -> &'static str {
        "string data"
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(self.data.as_bytes());
        Ok(())
    }

    fn decode(data: &[u8]) -> Result<StringMessage> {
        if data.len() < 4 {
            return Err(robobag::BagError::format(
                "StringMessage::decode",
                "payload shorter than its length prefix",
            ));
        }
        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            return Err(robobag::BagError::format(
                "StringMessage::decode",
                "payload truncated",
            ));
        }
        Ok(StringMessage {
            data: String::from_utf8_lossy(&data[4..4 + len]).to_string(),
        })
    }
}
