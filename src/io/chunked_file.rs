// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Positioned binary I/O with streamed chunk compression.
//!
//! [`ChunkedFile`] wraps a single OS file descriptor and transparently
//! routes writes through a raw, BZ2, or LZ4 stream while a chunk is
//! open:
//! - `start_write` / `stop_write` bracket the compressed stream; while a
//!   compressed stream is active, `seek` is forbidden.
//! - Byte counters report how many uncompressed bytes went into the
//!   stream and how many compressed bytes came out, so the engine can
//!   size a chunk header after the fact.
//! - Whole-buffer [`decompress`] dispatches on the same codec set for
//!   the read path.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::core::{BagError, Result};
use crate::types::Buffer;

/// Chunk compression codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression
    #[default]
    None,
    /// BZ2 block compression
    Bz2,
    /// Framed LZ4 stream
    Lz4,
}

impl CompressionType {
    /// The name stored in chunk headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Bz2 => "bz2",
            CompressionType::Lz4 => "lz4",
        }
    }

    /// Parse a chunk-header compression name.
    pub fn from_name(name: &str) -> Result<CompressionType> {
        match name {
            "none" => Ok(CompressionType::None),
            "bz2" => Ok(CompressionType::Bz2),
            "lz4" => Ok(CompressionType::Lz4),
            other => Err(BagError::format(
                "CompressionType",
                format!("unknown compression '{other}'"),
            )),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to open the underlying file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Read-only; the file must exist
    Read,
    /// Read-write; the file is created or truncated
    Write,
    /// Read-write; the file must exist (append path)
    ReadWrite,
}

enum WriteStream {
    Bz2(BzEncoder<Vec<u8>>),
    Lz4(Box<FrameEncoder<Vec<u8>>>),
}

/// Positioned I/O over one file with an optional compressed write
/// stream for the currently open chunk.
pub struct ChunkedFile {
    path: String,
    file: Option<File>,
    offset: u64,
    stream_open: bool,
    write_stream: Option<WriteStream>,
    stream_start_offset: u64,
    stream_bytes_in: u64,
    stream_bytes_out: u64,
}

impl std::fmt::Debug for ChunkedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedFile")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("stream_open", &self.stream_open)
            .field("stream_start_offset", &self.stream_start_offset)
            .field("stream_bytes_in", &self.stream_bytes_in)
            .field("stream_bytes_out", &self.stream_bytes_out)
            .finish()
    }
}

impl ChunkedFile {
    /// Open `path` in the given mode.
    pub fn open<P: AsRef<Path>>(path: P, mode: FileMode) -> Result<ChunkedFile> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let mut options = OpenOptions::new();
        match mode {
            FileMode::Read => {
                options.read(true);
            }
            FileMode::Write => {
                options.read(true).write(true).create(true).truncate(true);
            }
            FileMode::ReadWrite => {
                options.read(true).write(true);
            }
        }
        let file = options.open(path.as_ref()).map_err(|e| {
            BagError::io(
                "ChunkedFile::open",
                format!("failed to open '{path_str}': {e}"),
            )
        })?;
        Ok(ChunkedFile {
            path: path_str,
            file: Some(file),
            offset: 0,
            stream_open: false,
            write_stream: None,
            stream_start_offset: 0,
            stream_bytes_in: 0,
            stream_bytes_out: 0,
        })
    }

    /// True while the file is open.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// The path this file was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current logical offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Current file size in bytes.
    pub fn size(&self) -> Result<u64> {
        let file = self.handle()?;
        let meta = file
            .metadata()
            .map_err(|e| BagError::io("ChunkedFile::size", e.to_string()))?;
        Ok(meta.len())
    }

    /// Release the file descriptor. Further operations fail with a
    /// usage error.
    pub fn close(&mut self) {
        self.file = None;
        self.stream_open = false;
        self.write_stream = None;
    }

    /// Seek to a new position. Forbidden while a compressed stream is
    /// active.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        if self.write_stream.is_some() {
            return Err(BagError::usage(
                "cannot seek while a compressed stream is open",
            ));
        }
        let file = self.handle_mut()?;
        let offset = file
            .seek(pos)
            .map_err(|e| BagError::io("ChunkedFile::seek", e.to_string()))?;
        self.offset = offset;
        Ok(offset)
    }

    /// Truncate the file to `size` bytes.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        let file = self.handle_mut()?;
        file.set_len(size)
            .map_err(|e| BagError::io("ChunkedFile::truncate", e.to_string()))?;
        if self.offset > size {
            self.seek(SeekFrom::Start(size))?;
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes at the current position.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        let file = self.handle_mut()?;
        file.read_exact(buf)
            .map_err(|e| BagError::io("ChunkedFile::read", format!("unexpected EOF: {e}")))?;
        self.offset += len;
        Ok(())
    }

    /// Read a little-endian u32 at the current position.
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read bytes up to and including the next `\n`, returned without
    /// the terminator. Used for the magic version line only.
    pub fn read_line(&mut self, max_len: usize) -> Result<String> {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            self.read(&mut byte)?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > max_len {
                return Err(BagError::format(
                    "ChunkedFile::read_line",
                    "version line exceeds maximum length",
                ));
            }
        }
        Ok(String::from_utf8_lossy(&line).to_string())
    }

    /// Write bytes. Routed through the active compressed stream if one
    /// is open, otherwise written directly at the current position.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.stream_open {
            self.stream_bytes_in += data.len() as u64;
        }
        match &mut self.write_stream {
            Some(WriteStream::Bz2(encoder)) => encoder
                .write_all(data)
                .map_err(|e| BagError::io("ChunkedFile::write", format!("bz2 stream: {e}"))),
            Some(WriteStream::Lz4(encoder)) => encoder
                .write_all(data)
                .map_err(|e| BagError::io("ChunkedFile::write", format!("lz4 stream: {e}"))),
            None => {
                let file = self.handle_mut()?;
                file.write_all(data)
                    .map_err(|e| BagError::io("ChunkedFile::write", e.to_string()))?;
                self.offset += data.len() as u64;
                Ok(())
            }
        }
    }

    /// Begin a write stream for a chunk body at the current position.
    pub fn start_write(&mut self, compression: CompressionType) -> Result<()> {
        if self.stream_open {
            return Err(BagError::usage("a write stream is already open"));
        }
        self.handle()?;
        self.stream_open = true;
        self.stream_start_offset = self.offset;
        self.stream_bytes_in = 0;
        self.stream_bytes_out = 0;
        self.write_stream = match compression {
            CompressionType::None => None,
            CompressionType::Bz2 => Some(WriteStream::Bz2(BzEncoder::new(
                Vec::new(),
                bzip2::Compression::best(),
            ))),
            CompressionType::Lz4 => {
                Some(WriteStream::Lz4(Box::new(FrameEncoder::new(Vec::new()))))
            }
        };
        Ok(())
    }

    /// Finish the active write stream. Compressed output lands at the
    /// position the stream was started at, regardless of reads that
    /// moved the cursor in between.
    pub fn stop_write(&mut self) -> Result<()> {
        if !self.stream_open {
            return Err(BagError::usage("no write stream is open"));
        }
        match self.write_stream.take() {
            Some(stream) => {
                let compressed = match stream {
                    WriteStream::Bz2(encoder) => encoder.finish().map_err(|e| {
                        BagError::io("ChunkedFile::stop_write", format!("bz2 finish: {e}"))
                    })?,
                    WriteStream::Lz4(encoder) => encoder.finish().map_err(|e| {
                        BagError::io("ChunkedFile::stop_write", format!("lz4 finish: {e}"))
                    })?,
                };
                self.seek(SeekFrom::Start(self.stream_start_offset))?;
                let file = self.handle_mut()?;
                file.write_all(&compressed)
                    .map_err(|e| BagError::io("ChunkedFile::stop_write", e.to_string()))?;
                self.offset = self.stream_start_offset + compressed.len() as u64;
                self.stream_bytes_out = compressed.len() as u64;
            }
            None => {
                // Raw stream: bytes went straight through
                self.stream_bytes_out = self.stream_bytes_in;
            }
        }
        self.stream_open = false;
        Ok(())
    }

    /// Uncompressed bytes fed into the active (or last finished)
    /// stream.
    pub fn compressed_bytes_in(&self) -> u64 {
        self.stream_bytes_in
    }

    /// Compressed bytes emitted by the last finished stream.
    pub fn compressed_bytes_out(&self) -> u64 {
        self.stream_bytes_out
    }

    fn handle(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| BagError::usage("file is not open"))
    }

    fn handle_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| BagError::usage("file is not open"))
    }
}

/// Decompress a chunk body into `dst`, which is sized to
/// `uncompressed_size`. Corrupt streams and size mismatches surface as
/// format errors.
pub fn decompress(
    compression: CompressionType,
    src: &[u8],
    dst: &mut Buffer,
    uncompressed_size: u32,
) -> Result<()> {
    dst.set_size(uncompressed_size as usize);
    match compression {
        CompressionType::None => {
            if src.len() != uncompressed_size as usize {
                return Err(size_mismatch(uncompressed_size, src.len()));
            }
            dst.data_mut().copy_from_slice(src);
            Ok(())
        }
        CompressionType::Bz2 => {
            let mut decoder = BzDecoder::new(src);
            read_exact_stream(&mut decoder, dst, uncompressed_size, "bz2")
        }
        CompressionType::Lz4 => {
            let mut decoder = FrameDecoder::new(src);
            read_exact_stream(&mut decoder, dst, uncompressed_size, "lz4")
        }
    }
}

fn read_exact_stream<R: Read>(
    decoder: &mut R,
    dst: &mut Buffer,
    uncompressed_size: u32,
    codec: &str,
) -> Result<()> {
    decoder.read_exact(dst.data_mut()).map_err(|e| {
        BagError::format("decompress", format!("{codec} stream corrupt: {e}"))
    })?;
    let mut extra = [0u8; 1];
    match decoder.read(&mut extra) {
        Ok(0) => Ok(()),
        Ok(_) => Err(size_mismatch(uncompressed_size, uncompressed_size as usize + 1)),
        Err(e) => Err(BagError::format(
            "decompress",
            format!("{codec} stream corrupt: {e}"),
        )),
    }
}

fn size_mismatch(expected: u32, actual: usize) -> BagError {
    BagError::format(
        "decompress",
        format!("uncompressed size mismatch: header says {expected}, got at least {actual}"),
    )
}
