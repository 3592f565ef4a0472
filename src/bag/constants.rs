// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Format constants for the bag container.

/// Message definition record (version 1.2 only)
pub const OP_MSG_DEF: u8 = 0x01;
/// Message data record
pub const OP_MSG_DATA: u8 = 0x02;
/// File header record
pub const OP_BAG_HEADER: u8 = 0x03;
/// Per-chunk connection index record
pub const OP_INDEX_DATA: u8 = 0x04;
/// Chunk record
pub const OP_CHUNK: u8 = 0x05;
/// Chunk info summary record
pub const OP_CHUNK_INFO: u8 = 0x06;
/// Connection record
pub const OP_CONNECTION: u8 = 0x07;

/// Version written to new bags
pub const VERSION: &str = "2.0";

/// The file header record's header plus padding always spans this many
/// bytes so it can be rewritten in place at close time.
pub const FILE_HEADER_LENGTH: usize = 4096;

/// INDEX_DATA record version for 2.0 bags
pub const INDEX_VERSION: u32 = 1;

/// CHUNK_INFO record version
pub const CHUNK_INFO_VERSION: u32 = 1;

/// Default uncompressed chunk size threshold (768 KiB)
pub const DEFAULT_CHUNK_THRESHOLD: u32 = 768 * 1024;

/// File header field naming the encryptor plugin. Absent when the
/// default pass-through encryptor wrote the bag.
pub const ENCRYPTOR_FIELD_NAME: &str = "encryptor";
