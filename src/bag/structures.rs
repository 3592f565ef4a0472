// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! In-memory structures mirroring the on-disk record types.

use std::collections::BTreeMap;

use crate::io::chunked_file::CompressionType;
use crate::io::record::FieldMap;
use crate::types::Time;

/// The mode a bag is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BagMode {
    /// Read an existing bag
    Read,
    /// Create or truncate a bag for writing
    Write,
    /// Extend an existing 2.0 bag
    Append,
}

/// A uniquely identified message stream: topic plus metadata.
///
/// Connections are owned by the bag in an arena indexed by their dense
/// id; index entries and message handles refer to them by id only.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Dense id, assigned in write order starting at 0
    pub id: u32,
    /// Topic name (non-empty)
    pub topic: String,
    /// Datatype name from the codec
    pub datatype: String,
    /// MD5 checksum from the codec
    pub md5sum: String,
    /// Full textual message definition from the codec
    pub msg_def: String,
    /// Full connection header; may carry additional fields such as
    /// `callerid` and `latching`
    pub header: FieldMap,
}

/// Parsed CHUNK record header.
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    /// Codec the chunk body was written with
    pub compression: CompressionType,
    /// Byte size of the chunk body on disk
    pub compressed_size: u32,
    /// Byte size of the chunk body once decompressed
    pub uncompressed_size: u32,
}

/// Summary of one written chunk.
///
/// Every message time recorded in the chunk lies within
/// `[start_time, end_time]`.
#[derive(Debug, Clone, Default)]
pub struct ChunkInfo {
    /// File position of the CHUNK record
    pub pos: u64,
    /// Earliest message time in the chunk
    pub start_time: Time,
    /// Latest message time in the chunk
    pub end_time: Time,
    /// Message count per connection id
    pub connection_counts: BTreeMap<u32, u32>,
}

/// Position of one message: time, owning chunk, and offset within the
/// uncompressed chunk data.
///
/// Ordering is total and stable: time first, ties broken by
/// `(chunk_pos, offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntry {
    /// Message timestamp
    pub time: Time,
    /// File position of the CHUNK record holding the message. For 1.2
    /// bags this is the absolute position of the message record itself.
    pub chunk_pos: u64,
    /// Offset of the message record within the uncompressed chunk data
    pub offset: u32,
}

/// Insert into a vector kept sorted by the entry's total order.
pub(crate) fn insert_sorted(entries: &mut Vec<IndexEntry>, entry: IndexEntry) {
    let at = entries.partition_point(|e| *e <= entry);
    entries.insert(at, entry);
}
