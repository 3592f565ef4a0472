// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Message codec contract.
//!
//! The storage engine never interprets message payloads. A message type
//! provides its metadata triple (datatype name, MD5 checksum, textual
//! definition) and converts itself to and from bytes; everything else —
//! framing, chunking, indexing — is the engine's job.

use crate::core::Result;

/// Capability contract for a typed message.
///
/// An MD5 of `"*"` is a wildcard: it matches any connection when
/// instantiating, and disables type checking for readers of data it
/// wrote.
pub trait TypedMessage: Sized {
    /// Datatype name, e.g. `"std_msgs/String"`.
    fn datatype() -> &'static str;

    /// MD5 checksum of the message definition, or `"*"`.
    fn md5sum() -> &'static str;

    /// Full textual message definition.
    fn definition() -> &'static str;

    /// Serialize into `out`.
    fn encode(&self, out: &mut Vec<u8>) -> Result<()>;

    /// Deserialize from a payload produced by [`encode`](Self::encode).
    fn decode(data: &[u8]) -> Result<Self>;
}

/// Pass-through payload for tools that move already-serialized bytes
/// without knowing their schema.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawMessage {
    /// Raw serialized message bytes
    pub data: Vec<u8>,
}

impl RawMessage {
    /// Wrap raw serialized bytes.
    pub fn new(data: Vec<u8>) -> RawMessage {
        RawMessage { data }
    }
}

impl TypedMessage for RawMessage {
    fn datatype() -> &'static str {
        "*"
    }

    fn md5sum() -> &'static str {
        "*"
    }

    fn definition() -> &'static str {
        ""
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.data);
        Ok(())
    }

    fn decode(data: &[u8]) -> Result<RawMessage> {
        Ok(RawMessage {
            data: data.to_vec(),
        })
    }
}
