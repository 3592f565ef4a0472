// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! # Robobag
//!
//! Storage engine for **bag files**: self-describing, indexed, chunked
//! containers of timestamped, typed messages recorded from robotics
//! middleware.
//!
//! The library reads and writes a single monolithic file opened for
//! read, write, or append. Messages accumulate into optionally
//! compressed chunks (BZ2 or framed LZ4), each followed by
//! per-connection index records; a tail index of connection and
//! chunk-info records makes time-range and topic-filtered replay cheap
//! without decompressing anything at open time.
//!
//! ## Architecture
//!
//! - `io/` - positioned chunked-file I/O and the record envelope
//! - `bag/` - the engine: open/close lifecycle, chunked write path,
//!   index reconstruction, 2.0 and legacy 1.2 read paths
//! - `bag/view` - the query layer: a k-way merge cursor over selected
//!   connections
//! - `codec` - the opaque typed-message contract
//! - `encryptor` - the chunk/header encryption contract and its
//!   pass-through default
//!
//! ## Example: writing and reading back
//!
//! ```rust,no_run
//! # fn main() -> robobag::Result<()> {
//! use robobag::{Bag, BagMode, CompressionType, Query, RawMessage, Time, View};
//!
//! let mut bag = Bag::new();
//! bag.open("out.bag", BagMode::Write)?;
//! bag.set_compression(CompressionType::Lz4)?;
//! bag.write("/chatter", Time::new(10, 0), &RawMessage::new(vec![1, 2, 3]))?;
//! bag.close()?;
//!
//! let mut bag = Bag::new();
//! bag.open("out.bag", BagMode::Read)?;
//! let view = View::with_query(&bag, Query::topics(["/chatter"]));
//! for message in &view {
//!     println!("{} @ {}: {} bytes", message.topic(), message.time(), message.size()?);
//! }
//! # Ok(())
//! # }
//! ```

// Core types
pub mod core;

pub use core::{BagError, Result};

// Primitive types
pub mod types;

pub use types::{Buffer, Time};

// Byte-level I/O
pub mod io;

pub use io::{ChunkedFile, CompressionType, FieldMap, FileMode};

// Message codec contract
pub mod codec;

pub use codec::{RawMessage, TypedMessage};

// Encryptor contract
pub mod encryptor;

pub use encryptor::{Encryptor, NoEncryptor};

// The storage engine
pub mod bag;

pub use bag::structures::{BagMode, ChunkHeader, ChunkInfo, ConnectionInfo, IndexEntry};
pub use bag::view::{MessageInstance, Query, TopicFilter, View, ViewIter};
pub use bag::Bag;
