// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Core error types for robobag.
//!
//! Provides error types for bag storage operations:
//! - OS-level file I/O
//! - Record and index parsing
//! - Missing or truncated index regions
//! - Encryptor plugins
//! - API misuse (mode mismatch, double open, writes after failure)

use std::fmt;

/// Errors that can occur while reading or writing a bag file.
#[derive(Debug, Clone)]
pub enum BagError {
    /// OS-level I/O failure (short read, failed write, unexpected EOF)
    Io {
        /// Operation that failed
        context: String,
        /// Error message
        message: String,
    },

    /// Malformed record, unknown opcode, unknown version or compression,
    /// missing required header field
    Format {
        /// What was being parsed
        context: String,
        /// Error message
        message: String,
    },

    /// A 2.0 bag with a truncated or missing index region. The offset
    /// records where index parsing failed so an offline reindex can
    /// resume from it.
    Unindexed {
        /// Byte offset at which index parsing failed
        offset: u64,
        /// Error message
        message: String,
    },

    /// Encryptor plugin failure or unknown plugin name
    Encryption {
        /// Error message
        message: String,
    },

    /// API misuse: mode mismatch, double open, write before open,
    /// operation unsupported for the bag's format version
    Usage {
        /// Error message
        message: String,
    },
}

impl BagError {
    /// Create an I/O error.
    pub fn io(context: impl Into<String>, message: impl Into<String>) -> Self {
        BagError::Io {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a format error.
    pub fn format(context: impl Into<String>, message: impl Into<String>) -> Self {
        BagError::Format {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create an unindexed-bag error at the given file offset.
    pub fn unindexed(offset: u64, message: impl Into<String>) -> Self {
        BagError::Unindexed {
            offset,
            message: message.into(),
        }
    }

    /// Create an encryption error.
    pub fn encryption(message: impl Into<String>) -> Self {
        BagError::Encryption {
            message: message.into(),
        }
    }

    /// Create a usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        BagError::Usage {
            message: message.into(),
        }
    }

    /// True if this is a format error (malformed bytes rather than a
    /// failed syscall or misuse).
    pub fn is_format(&self) -> bool {
        matches!(self, BagError::Format { .. })
    }
}

impl fmt::Display for BagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BagError::Io { context, message } => {
                write!(f, "I/O error in {context}: {message}")
            }
            BagError::Format { context, message } => {
                write!(f, "Format error in {context}: {message}")
            }
            BagError::Unindexed { offset, message } => {
                write!(f, "Bag is unindexed (failed at offset {offset}): {message}")
            }
            BagError::Encryption { message } => {
                write!(f, "Encryption error: {message}")
            }
            BagError::Usage { message } => {
                write!(f, "Usage error: {message}")
            }
        }
    }
}

impl std::error::Error for BagError {}

impl From<std::io::Error> for BagError {
    fn from(err: std::io::Error) -> Self {
        BagError::Io {
            context: "io".to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type for robobag operations.
pub type Result<T> = std::result::Result<T, BagError>;
