// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Byte-level I/O layer: positioned chunked file access and record
//! framing.

pub mod chunked_file;
pub mod record;

pub use chunked_file::{ChunkedFile, CompressionType, FileMode};
pub use record::FieldMap;
