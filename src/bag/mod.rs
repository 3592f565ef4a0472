// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! The bag storage engine.
//!
//! A bag file is a self-describing, indexed, chunked container for
//! timestamped, typed messages:
//! - Magic line `#ROSBAG V2.0\n`, then a fixed-size file header record
//!   that is rewritten in place at close time.
//! - Chunks of message data records (optionally BZ2/LZ4 compressed),
//!   each followed by per-connection INDEX_DATA records.
//! - A tail index of CONNECTION and CHUNK_INFO records whose position
//!   is patched into the file header, which is what makes append cheap.
//!
//! [`Bag`] owns the file handle, the connection arena, the chunk table
//! and the in-memory indexes. Reading goes through a size-one
//! decompressed-chunk cache shared by every [`View`](view::View) over
//! the same bag.

pub mod constants;
pub mod structures;
pub mod view;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::{debug, warn};

use crate::codec::TypedMessage;
use crate::core::{BagError, Result};
use crate::encryptor::{self, Encryptor, NoEncryptor};
use crate::io::chunked_file::{self, ChunkedFile, CompressionType, FileMode};
use crate::io::record::{self, FieldMap};
use crate::types::{Buffer, Time};

use constants::{
    CHUNK_INFO_VERSION, DEFAULT_CHUNK_THRESHOLD, FILE_HEADER_LENGTH, INDEX_VERSION, OP_BAG_HEADER,
    OP_CHUNK, OP_CHUNK_INFO, OP_CONNECTION, OP_INDEX_DATA, OP_MSG_DATA, OP_MSG_DEF, VERSION,
};
use structures::{insert_sorted, BagMode, ChunkHeader, ChunkInfo, ConnectionInfo, IndexEntry};

/// Implausible record header guard; a valid header never comes close.
const MAX_HEADER_LEN: u32 = 1 << 26;

/// Which reusable buffer holds the current uncompressed chunk.
enum CurrentBuffer {
    Chunk,
    Decompress,
}

/// Size-one decompressed-chunk cache.
struct ReadCache {
    chunk_buffer: Buffer,
    decompress_buffer: Buffer,
    current: CurrentBuffer,
    decompressed_chunk: Option<u64>,
}

impl ReadCache {
    fn new() -> ReadCache {
        ReadCache {
            chunk_buffer: Buffer::new(),
            decompress_buffer: Buffer::new(),
            current: CurrentBuffer::Chunk,
            decompressed_chunk: None,
        }
    }

    fn current_data(&self) -> &[u8] {
        match self.current {
            CurrentBuffer::Chunk => self.chunk_buffer.data(),
            CurrentBuffer::Decompress => self.decompress_buffer.data(),
        }
    }
}

/// A bag file and the engine that manages it.
///
/// Created closed; opened once with [`open`](Bag::open); closed exactly
/// once with [`close`](Bag::close) (idempotent, and run on drop if
/// forgotten). Not safe for concurrent use from multiple threads.
pub struct Bag {
    mode: BagMode,
    file: RefCell<Option<ChunkedFile>>,
    version: u32,
    compression: CompressionType,
    chunk_threshold: u32,
    bag_revision: u32,

    file_size: u64,
    file_header_pos: u64,
    index_data_pos: u64,
    connection_count: u32,
    chunk_count: u32,

    chunk_open: bool,
    curr_chunk_info: ChunkInfo,
    curr_chunk_data_pos: u64,

    topic_connection_ids: HashMap<String, u32>,
    header_connection_ids: BTreeMap<FieldMap, u32>,
    connections: Vec<ConnectionInfo>,
    chunks: Vec<ChunkInfo>,

    connection_indexes: BTreeMap<u32, Vec<IndexEntry>>,
    curr_chunk_connection_indexes: BTreeMap<u32, Vec<IndexEntry>>,

    outgoing_chunk_buffer: Buffer,
    read_cache: RefCell<ReadCache>,

    encryptor: Box<dyn Encryptor>,
    write_failed: bool,
    last_error: Option<BagError>,
}

impl Default for Bag {
    fn default() -> Bag {
        Bag::new()
    }
}

impl Bag {
    /// Create a closed bag.
    pub fn new() -> Bag {
        Bag {
            mode: BagMode::Read,
            file: RefCell::new(None),
            version: 0,
            compression: CompressionType::None,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            bag_revision: 0,
            file_size: 0,
            file_header_pos: 0,
            index_data_pos: 0,
            connection_count: 0,
            chunk_count: 0,
            chunk_open: false,
            curr_chunk_info: ChunkInfo::default(),
            curr_chunk_data_pos: 0,
            topic_connection_ids: HashMap::new(),
            header_connection_ids: BTreeMap::new(),
            connections: Vec::new(),
            chunks: Vec::new(),
            connection_indexes: BTreeMap::new(),
            curr_chunk_connection_indexes: BTreeMap::new(),
            outgoing_chunk_buffer: Buffer::new(),
            read_cache: RefCell::new(ReadCache::new()),
            encryptor: Box::new(NoEncryptor),
            write_failed: false,
            last_error: None,
        }
    }

    /// Open a bag file in the given mode.
    pub fn open<P: AsRef<Path>>(&mut self, path: P, mode: BagMode) -> Result<()> {
        if self.file.get_mut().is_some() {
            return Err(BagError::usage("bag is already open"));
        }
        let result = match mode {
            BagMode::Write => self.open_write(path.as_ref()),
            BagMode::Read => self.open_read(path.as_ref()),
            BagMode::Append => self.open_append(path.as_ref()),
        };
        if let Err(e) = result {
            if let Some(mut file) = self.file.get_mut().take() {
                file.close();
            }
            self.reset();
            return Err(e);
        }
        Ok(())
    }

    /// Close the bag. For writable bags this flushes the open chunk,
    /// writes the tail index, and patches the file header. The file
    /// descriptor is released even if a flush step fails; the error is
    /// retained for [`last_error`](Bag::last_error). Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.file.get_mut().is_none() {
            return Ok(());
        }
        let mut result = Ok(());
        if matches!(self.mode, BagMode::Write | BagMode::Append) && !self.write_failed {
            result = self.stop_writing();
        }
        if let Some(mut file) = self.file.get_mut().take() {
            file.close();
        }
        if let Err(ref e) = result {
            self.last_error = Some(e.clone());
        }
        self.reset();
        result
    }

    /// True while the bag is open.
    pub fn is_open(&self) -> bool {
        self.file.borrow().is_some()
    }

    /// Path of the open file, or empty when closed.
    pub fn file_name(&self) -> String {
        self.file
            .borrow()
            .as_ref()
            .map(|f| f.path().to_string())
            .unwrap_or_default()
    }

    /// The mode the bag was opened in.
    pub fn mode(&self) -> BagMode {
        self.mode
    }

    /// Major format version of the open bag (2 for 2.0, 1 for 1.2).
    pub fn major_version(&self) -> u32 {
        self.version / 100
    }

    /// Minor format version of the open bag.
    pub fn minor_version(&self) -> u32 {
        self.version % 100
    }

    /// Current size of the bag file in bytes (a lower bound while a
    /// chunk is being written).
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Set the codec used for subsequently written chunks.
    pub fn set_compression(&mut self, compression: CompressionType) -> Result<()> {
        if self.chunk_open {
            return Err(BagError::usage(
                "cannot change compression while a chunk is open",
            ));
        }
        self.compression = compression;
        Ok(())
    }

    /// The codec used for written chunks.
    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Set the uncompressed size at which a chunk is flushed.
    pub fn set_chunk_threshold(&mut self, chunk_threshold: u32) {
        self.chunk_threshold = chunk_threshold;
    }

    /// The uncompressed size at which a chunk is flushed.
    pub fn chunk_threshold(&self) -> u32 {
        self.chunk_threshold
    }

    /// Select an encryptor plugin by name for writing. Readers pick the
    /// encryptor up from the file header instead.
    pub fn set_encryptor_plugin(&mut self, plugin_name: &str, plugin_param: &str) -> Result<()> {
        if self.chunk_open {
            return Err(BagError::usage(
                "cannot change encryptor while a chunk is open",
            ));
        }
        let mut enc = encryptor::create_encryptor(plugin_name)?;
        enc.initialize(plugin_param)?;
        self.encryptor = enc;
        Ok(())
    }

    /// Write a message on `topic` at `time`.
    pub fn write<T: TypedMessage>(&mut self, topic: &str, time: Time, msg: &T) -> Result<()> {
        self.do_write(topic, time, msg, None)
    }

    /// Write a message with an explicit connection header. Streams that
    /// agree on the exact header map (and topic) share a connection;
    /// any differing field makes a new one.
    pub fn write_with_header<T: TypedMessage>(
        &mut self,
        topic: &str,
        time: Time,
        msg: &T,
        connection_header: &FieldMap,
    ) -> Result<()> {
        self.do_write(topic, time, msg, Some(connection_header))
    }

    /// Exchange the entire state of two bags.
    pub fn swap(&mut self, other: &mut Bag) {
        std::mem::swap(self, other);
    }

    /// Write revision counter; incremented on every write. Views record
    /// the revision they were seeded at.
    pub fn revision(&self) -> u32 {
        self.bag_revision
    }

    /// All connections, indexed by their dense id.
    pub fn connections(&self) -> &[ConnectionInfo] {
        &self.connections
    }

    /// Summaries of all written chunks.
    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunks
    }

    /// The error retained from a failed close, if any.
    pub fn last_error(&self) -> Option<&BagError> {
        self.last_error.as_ref()
    }

    pub(crate) fn version_code(&self) -> u32 {
        self.version
    }

    pub(crate) fn connection_index(&self, id: u32) -> Option<&[IndexEntry]> {
        self.connection_indexes.get(&id).map(|v| v.as_slice())
    }

    // =========================================================================
    // Write path
    // =========================================================================

    fn do_write<T: TypedMessage>(
        &mut self,
        topic: &str,
        time: Time,
        msg: &T,
        connection_header: Option<&FieldMap>,
    ) -> Result<()> {
        if self.file.get_mut().is_none() {
            return Err(BagError::usage("cannot write: bag is not open"));
        }
        if self.mode == BagMode::Read {
            return Err(BagError::usage("cannot write: bag is open read-only"));
        }
        if self.write_failed {
            return Err(BagError::usage(
                "cannot write: bag entered a failed state after a write error",
            ));
        }
        if topic.is_empty() {
            return Err(BagError::usage("cannot write: topic is empty"));
        }
        if time < Time::MIN {
            return Err(BagError::usage(
                "cannot write: message time is below the minimum; (0, 0) is reserved as \"no time\"",
            ));
        }

        // Serialize before touching the file so codec errors are free
        let mut data = Vec::new();
        msg.encode(&mut data)?;

        self.bag_revision += 1;

        let result = self.write_message(
            topic,
            time,
            T::datatype(),
            T::md5sum(),
            T::definition(),
            &data,
            connection_header,
        );
        if let Err(e) = result {
            self.handle_write_failure();
            return Err(e);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_message(
        &mut self,
        topic: &str,
        time: Time,
        datatype: &str,
        md5sum: &str,
        definition: &str,
        data: &[u8],
        connection_header: Option<&FieldMap>,
    ) -> Result<()> {
        // Resolve the connection id: by topic, or by the normalized
        // header copy with the topic injected
        let (conn_id, is_new) = match connection_header {
            None => match self.topic_connection_ids.get(topic) {
                Some(&id) => (id, false),
                None => {
                    let id = self.connections.len() as u32;
                    self.topic_connection_ids.insert(topic.to_string(), id);
                    (id, true)
                }
            },
            Some(header) => {
                let mut key = header.clone();
                key.insert_str("topic", topic);
                match self.header_connection_ids.get(&key) {
                    Some(&id) => (id, false),
                    None => {
                        let id = self.connections.len() as u32;
                        self.header_connection_ids.insert(key, id);
                        (id, true)
                    }
                }
            }
        };

        // A read on the same bag may have moved the cursor
        let offset = {
            let seek_to_end = !self.chunk_open || self.compression == CompressionType::None;
            let file = self.file_mut()?;
            if seek_to_end {
                file.seek(SeekFrom::End(0))?;
            }
            file.offset()
        };
        self.file_size = self.file_size.max(offset);

        if !self.chunk_open {
            self.start_writing_chunk(time)?;
        }

        // New connections get their record inside the chunk immediately;
        // the authoritative table is re-emitted at close
        if is_new {
            let mut header = match connection_header {
                Some(h) => h.clone(),
                None => FieldMap::new(),
            };
            if !header.contains("type") {
                header.insert_str("type", datatype);
            }
            if !header.contains("md5sum") {
                header.insert_str("md5sum", md5sum);
            }
            if !header.contains("message_definition") {
                header.insert_str("message_definition", definition);
            }
            let info = ConnectionInfo {
                id: conn_id,
                topic: topic.to_string(),
                datatype: datatype.to_string(),
                md5sum: md5sum.to_string(),
                msg_def: definition.to_string(),
                header,
            };
            let mut buf = Vec::new();
            Self::append_connection_record(&mut buf, &info);
            self.write_chunked(&buf)?;
            self.connections.push(info);
        }

        // Index bookkeeping
        let entry = IndexEntry {
            time,
            chunk_pos: self.curr_chunk_info.pos,
            offset: self.chunk_offset(),
        };
        insert_sorted(
            self.curr_chunk_connection_indexes
                .entry(conn_id)
                .or_default(),
            entry,
        );
        if self.mode == BagMode::Append {
            insert_sorted(self.connection_indexes.entry(conn_id).or_default(), entry);
        }
        *self
            .curr_chunk_info
            .connection_counts
            .entry(conn_id)
            .or_default() += 1;

        // Message data record, through the chunk stream
        let mut buf = Vec::new();
        let mut fields = FieldMap::new();
        fields.insert_u8("op", OP_MSG_DATA);
        fields.insert_u32("conn", conn_id);
        fields.insert_time("time", time);
        record::write_record_header(&mut buf, &fields);
        record::write_data_length(&mut buf, data.len() as u32);
        buf.extend_from_slice(data);
        self.write_chunked(&buf)?;

        if time > self.curr_chunk_info.end_time {
            self.curr_chunk_info.end_time = time;
        } else if time < self.curr_chunk_info.start_time {
            self.curr_chunk_info.start_time = time;
        }

        if self.chunk_offset() > self.chunk_threshold {
            self.stop_writing_chunk()?;
        }
        Ok(())
    }

    /// Write record bytes through the chunk stream and mirror them into
    /// the outgoing chunk buffer, which tracks uncompressed offsets.
    fn write_chunked(&mut self, bytes: &[u8]) -> Result<()> {
        self.file_mut()?.write(bytes)?;
        self.outgoing_chunk_buffer.extend(bytes);
        Ok(())
    }

    /// Offset the next record would land at within the uncompressed
    /// chunk data.
    fn chunk_offset(&self) -> u32 {
        self.outgoing_chunk_buffer.size() as u32
    }

    fn start_writing_chunk(&mut self, time: Time) -> Result<()> {
        let pos = self.file_mut()?.offset();
        self.curr_chunk_info = ChunkInfo {
            pos,
            start_time: time,
            end_time: time,
            connection_counts: BTreeMap::new(),
        };
        // Placeholder sizes; patched when the chunk is stopped
        self.write_chunk_header(0, 0)?;
        self.curr_chunk_data_pos = self.file_mut()?.offset();
        let compression = self.compression;
        self.file_mut()?.start_write(compression)?;
        self.outgoing_chunk_buffer.set_size(0);
        self.chunk_open = true;
        Ok(())
    }

    fn stop_writing_chunk(&mut self) -> Result<()> {
        let (uncompressed_size, compressed_size) = {
            let compression = self.compression;
            let file = self.file_mut()?;
            if compression == CompressionType::None {
                file.seek(SeekFrom::End(0))?;
            }
            let uncompressed_size = file.compressed_bytes_in() as u32;
            file.stop_write()?;
            (uncompressed_size, file.compressed_bytes_out() as u32)
        };

        // Encrypt the chunk body in place; the size may change
        let encrypted_size = {
            let file = self
                .file
                .get_mut()
                .as_mut()
                .ok_or_else(|| BagError::usage("bag is not open"))?;
            self.encryptor
                .encrypt_chunk(compressed_size, self.curr_chunk_data_pos, file)?
        };

        debug!(
            pos = self.curr_chunk_info.pos,
            uncompressed_size, compressed_size, "chunk flushed"
        );

        // Patch the chunk header with the real sizes
        let chunk_pos = self.curr_chunk_info.pos;
        self.file_mut()?.seek(SeekFrom::Start(chunk_pos))?;
        self.write_chunk_header(encrypted_size, uncompressed_size)?;

        // Index records follow the chunk body
        let index_pos = self.curr_chunk_data_pos + encrypted_size as u64;
        self.file_mut()?.seek(SeekFrom::Start(index_pos))?;
        self.write_index_records()?;
        self.curr_chunk_connection_indexes.clear();

        self.chunks.push(std::mem::take(&mut self.curr_chunk_info));
        self.outgoing_chunk_buffer.set_size(0);
        self.chunk_open = false;
        self.file_size = self.file_mut()?.offset();
        Ok(())
    }

    fn write_chunk_header(&mut self, compressed_size: u32, uncompressed_size: u32) -> Result<()> {
        let mut fields = FieldMap::new();
        fields.insert_u8("op", OP_CHUNK);
        fields.insert_str("compression", self.compression.as_str());
        fields.insert_u32("size", uncompressed_size);
        let mut buf = Vec::new();
        record::write_record_header(&mut buf, &fields);
        record::write_data_length(&mut buf, compressed_size);
        self.file_mut()?.write(&buf)
    }

    fn write_index_records(&mut self) -> Result<()> {
        let mut buf = Vec::new();
        for (conn_id, entries) in &self.curr_chunk_connection_indexes {
            let mut fields = FieldMap::new();
            fields.insert_u8("op", OP_INDEX_DATA);
            fields.insert_u32("ver", INDEX_VERSION);
            fields.insert_u32("conn", *conn_id);
            fields.insert_u32("count", entries.len() as u32);
            record::write_record_header(&mut buf, &fields);
            record::write_data_length(&mut buf, (entries.len() * 12) as u32);
            for entry in entries {
                buf.extend_from_slice(&entry.time.to_le_bytes());
                buf.extend_from_slice(&entry.offset.to_le_bytes());
            }
        }
        self.file_mut()?.write(&buf)
    }

    fn append_connection_record(buf: &mut Vec<u8>, conn: &ConnectionInfo) {
        let mut fields = FieldMap::new();
        fields.insert_u8("op", OP_CONNECTION);
        fields.insert_u32("conn", conn.id);
        fields.insert_str("topic", &conn.topic);
        record::write_record_header(buf, &fields);
        record::write_data_length(buf, conn.header.serialized_len() as u32);
        conn.header.write_fields(buf);
    }

    fn write_connection_records(&mut self) -> Result<()> {
        for i in 0..self.connections.len() {
            let (outer, header) = {
                let conn = &self.connections[i];
                let mut fields = FieldMap::new();
                fields.insert_u8("op", OP_CONNECTION);
                fields.insert_u32("conn", conn.id);
                fields.insert_str("topic", &conn.topic);
                let mut buf = Vec::new();
                record::write_record_header(&mut buf, &fields);
                (buf, conn.header.clone())
            };
            let file = self
                .file
                .get_mut()
                .as_mut()
                .ok_or_else(|| BagError::usage("bag is not open"))?;
            file.write(&outer)?;
            self.encryptor.write_encrypted_header(file, &header)?;
        }
        Ok(())
    }

    fn write_chunk_info_records(&mut self) -> Result<()> {
        let mut buf = Vec::new();
        for chunk_info in &self.chunks {
            let mut fields = FieldMap::new();
            fields.insert_u8("op", OP_CHUNK_INFO);
            fields.insert_u32("ver", CHUNK_INFO_VERSION);
            fields.insert_u64("chunk_pos", chunk_info.pos);
            fields.insert_time("start_time", chunk_info.start_time);
            fields.insert_time("end_time", chunk_info.end_time);
            fields.insert_u32("count", chunk_info.connection_counts.len() as u32);
            record::write_record_header(&mut buf, &fields);
            record::write_data_length(&mut buf, (chunk_info.connection_counts.len() * 8) as u32);
            for (conn_id, count) in &chunk_info.connection_counts {
                buf.extend_from_slice(&conn_id.to_le_bytes());
                buf.extend_from_slice(&count.to_le_bytes());
            }
        }
        self.file_mut()?.write(&buf)
    }

    fn write_file_header_record(&mut self) -> Result<()> {
        self.connection_count = self.connections.len() as u32;
        self.chunk_count = self.chunks.len() as u32;

        let mut fields = FieldMap::new();
        fields.insert_u8("op", OP_BAG_HEADER);
        fields.insert_u64("index_pos", self.index_data_pos);
        fields.insert_u32("conn_count", self.connection_count);
        fields.insert_u32("chunk_count", self.chunk_count);
        self.encryptor.add_fields_to_file_header(&mut fields);

        let mut buf = Vec::new();
        record::write_record_header(&mut buf, &fields);
        let header_len = buf.len() - 4;
        // Pad so the record spans FILE_HEADER_LENGTH and can be
        // rewritten in place at close time
        let data_len = FILE_HEADER_LENGTH.saturating_sub(header_len);
        record::write_data_length(&mut buf, data_len as u32);
        buf.resize(buf.len() + data_len, b' ');
        self.file_mut()?.write(&buf)
    }

    fn start_writing(&mut self) -> Result<()> {
        self.file_mut()?
            .write(format!("#ROSBAG V{VERSION}\n").as_bytes())?;
        self.file_header_pos = self.file_mut()?.offset();
        self.write_file_header_record()?;
        self.file_size = self.file_mut()?.offset();
        Ok(())
    }

    fn stop_writing(&mut self) -> Result<()> {
        if self.chunk_open {
            self.stop_writing_chunk()?;
        }
        self.file_mut()?.seek(SeekFrom::End(0))?;
        self.index_data_pos = self.file_mut()?.offset();
        self.write_connection_records()?;
        self.write_chunk_info_records()?;
        self.file_size = self.file_mut()?.offset();
        let file_header_pos = self.file_header_pos;
        self.file_mut()?.seek(SeekFrom::Start(file_header_pos))?;
        self.write_file_header_record()
    }

    /// Write-path errors are fatal to the current chunk: the file is
    /// cut back to the chunk's start and the bag stops accepting
    /// writes.
    fn handle_write_failure(&mut self) {
        self.write_failed = true;
        if !self.chunk_open {
            return;
        }
        let pos = self.curr_chunk_info.pos;
        if let Some(file) = self.file.get_mut().as_mut() {
            let _ = file.stop_write();
            let _ = file.seek(SeekFrom::Start(pos));
            let _ = file.truncate(pos);
        }
        warn!(pos, "write failed; truncated bag at the open chunk's start");
        self.chunk_open = false;
        self.curr_chunk_connection_indexes.clear();
        self.outgoing_chunk_buffer.set_size(0);
    }

    // =========================================================================
    // Open paths
    // =========================================================================

    fn open_write(&mut self, path: &Path) -> Result<()> {
        let file = ChunkedFile::open(path, FileMode::Write)?;
        *self.file.get_mut() = Some(file);
        self.mode = BagMode::Write;
        self.version = 200;
        self.start_writing()
    }

    fn open_read(&mut self, path: &Path) -> Result<()> {
        let file = ChunkedFile::open(path, FileMode::Read)?;
        *self.file.get_mut() = Some(file);
        self.mode = BagMode::Read;
        self.read_version()?;
        match self.version {
            200 => self.start_reading_version_200()?,
            102 => self.start_reading_version_102()?,
            v => {
                return Err(BagError::format(
                    "Bag::open",
                    format!("unsupported bag version {}.{}", v / 100, v % 100),
                ))
            }
        }
        self.file_size = self.file_mut()?.size()?;
        Ok(())
    }

    fn open_append(&mut self, path: &Path) -> Result<()> {
        let file = ChunkedFile::open(path, FileMode::ReadWrite)?;
        *self.file.get_mut() = Some(file);
        self.mode = BagMode::Append;
        self.read_version()?;
        if self.version != 200 {
            return Err(BagError::usage(format!(
                "append requires a 2.0 bag, found {}.{}",
                self.version / 100,
                self.version % 100
            )));
        }
        self.start_reading_version_200()?;

        // Chop the tail index off; it is rewritten at close. While the
        // bag is being appended, index_pos = 0 marks it unindexed.
        let truncate_at = self.index_data_pos;
        self.index_data_pos = 0;
        self.file_mut()?.truncate(truncate_at)?;
        let file_header_pos = self.file_header_pos;
        self.file_mut()?.seek(SeekFrom::Start(file_header_pos))?;
        self.write_file_header_record()?;
        self.file_mut()?.seek(SeekFrom::End(0))?;
        self.file_size = self.file_mut()?.offset();
        self.bag_revision = 1;
        Ok(())
    }

    // =========================================================================
    // Read path, version 2.0
    // =========================================================================

    fn read_version(&mut self) -> Result<()> {
        let line = self.file_mut()?.read_line(64)?;
        self.file_header_pos = self.file_mut()?.offset();
        if !line.starts_with("#ROS") {
            return Err(BagError::format(
                "Bag::read_version",
                format!("not a bag file: bad magic {line:?}"),
            ));
        }
        let version_str = line
            .rfind(" V")
            .map(|at| &line[at + 2..])
            .ok_or_else(|| {
                BagError::format("Bag::read_version", format!("no version in magic {line:?}"))
            })?;
        let (major, minor) = version_str.split_once('.').ok_or_else(|| {
            BagError::format(
                "Bag::read_version",
                format!("malformed version {version_str:?}"),
            )
        })?;
        let major: u32 = major.trim().parse().map_err(|_| {
            BagError::format("Bag::read_version", format!("bad major version {major:?}"))
        })?;
        let minor: u32 = minor.trim().parse().map_err(|_| {
            BagError::format("Bag::read_version", format!("bad minor version {minor:?}"))
        })?;
        self.version = major * 100 + minor;
        Ok(())
    }

    fn read_file_header_record(&mut self) -> Result<()> {
        let fields = {
            let file = self.file_mut()?;
            read_header_from_file(file)?
        };
        require_op(&fields, OP_BAG_HEADER, "file header record")?;
        self.index_data_pos = fields.read_u64("index_pos")?;
        if self.version == 200 {
            self.connection_count = fields.read_u32("conn_count")?;
            self.chunk_count = fields.read_u32("chunk_count")?;
        }
        if let Some(enc) = encryptor::encryptor_from_file_header(&fields)? {
            self.encryptor = enc;
        }
        let file = self.file_mut()?;
        let data_len = file.read_u32()?;
        file.seek(SeekFrom::Current(data_len as i64))?;
        Ok(())
    }

    fn start_reading_version_200(&mut self) -> Result<()> {
        self.read_file_header_record()?;
        if self.index_data_pos == 0 {
            return Err(BagError::unindexed(
                self.file_header_pos,
                "bag was not closed cleanly: file header has no index position",
            ));
        }

        let index_data_pos = self.index_data_pos;
        self.file_mut()?.seek(SeekFrom::Start(index_data_pos))?;
        for _ in 0..self.connection_count {
            self.read_connection_record().map_err(|e| self.unindexed(e))?;
        }
        for _ in 0..self.chunk_count {
            self.read_chunk_info_record().map_err(|e| self.unindexed(e))?;
        }

        // Per-chunk connection indexes live right after each chunk body
        let chunk_metas: Vec<(u64, usize)> = self
            .chunks
            .iter()
            .map(|c| (c.pos, c.connection_counts.len()))
            .collect();
        for (pos, index_count) in chunk_metas {
            let header_result = {
                let file = self.file_mut()?;
                file.seek(SeekFrom::Start(pos))?;
                read_chunk_header(file)
            };
            let chunk_header = header_result.map_err(|e| self.unindexed(e))?;
            self.file_mut()?
                .seek(SeekFrom::Current(chunk_header.compressed_size as i64))?;
            for _ in 0..index_count {
                self.read_connection_index_record_200(pos)
                    .map_err(|e| self.unindexed(e))?;
            }
        }
        Ok(())
    }

    fn read_connection_record(&mut self) -> Result<()> {
        let fields = {
            let file = self.file_mut()?;
            read_header_from_file(file)?
        };
        require_op(&fields, OP_CONNECTION, "connection record")?;
        let id = fields.read_u32("conn")?;
        let topic = fields.read_string("topic")?;

        let header = {
            let file = self
                .file
                .get_mut()
                .as_mut()
                .ok_or_else(|| BagError::usage("bag is not open"))?;
            self.encryptor.read_encrypted_header(file)?
        };

        if (id as usize) < self.connections.len() {
            return Ok(()); // already known
        }
        if id as usize != self.connections.len() {
            return Err(BagError::format(
                "Bag::read_connection_record",
                format!(
                    "connection id {id} is not dense (expected {})",
                    self.connections.len()
                ),
            ));
        }

        let info = ConnectionInfo {
            id,
            topic: topic.clone(),
            datatype: header.read_string("type")?,
            md5sum: header.get_string("md5sum").unwrap_or_default(),
            msg_def: header.get_string("message_definition").unwrap_or_default(),
            header,
        };

        // Lookup tables so appended writes reuse existing ids
        self.topic_connection_ids.entry(topic).or_insert(id);
        let mut key = info.header.clone();
        key.insert_str("topic", &info.topic);
        self.header_connection_ids.entry(key).or_insert(id);

        self.connections.push(info);
        Ok(())
    }

    fn read_chunk_info_record(&mut self) -> Result<()> {
        let (fields, data) = self.read_record()?;
        require_op(&fields, OP_CHUNK_INFO, "chunk info record")?;
        let ver = fields.read_u32("ver")?;
        if ver != CHUNK_INFO_VERSION {
            return Err(BagError::format(
                "Bag::read_chunk_info_record",
                format!("unsupported chunk info version {ver}"),
            ));
        }
        let pos = fields.read_u64("chunk_pos")?;
        let start_time = fields.read_time("start_time")?;
        let end_time = fields.read_time("end_time")?;
        let count = fields.read_u32("count")?;
        if data.len() != count as usize * 8 {
            return Err(BagError::format(
                "Bag::read_chunk_info_record",
                format!("data block is {} bytes for {count} entries", data.len()),
            ));
        }

        let mut connection_counts = BTreeMap::new();
        let mut cursor = Cursor::new(&data[..]);
        for _ in 0..count {
            let conn = read_u32_from(&mut cursor, "chunk info entry")?;
            let msg_count = read_u32_from(&mut cursor, "chunk info entry")?;
            connection_counts.insert(conn, msg_count);
        }
        self.chunks.push(ChunkInfo {
            pos,
            start_time,
            end_time,
            connection_counts,
        });
        Ok(())
    }

    fn read_connection_index_record_200(&mut self, chunk_pos: u64) -> Result<()> {
        let (fields, data) = self.read_record()?;
        require_op(&fields, OP_INDEX_DATA, "index data record")?;
        let ver = fields.read_u32("ver")?;
        if ver != INDEX_VERSION {
            return Err(BagError::format(
                "Bag::read_connection_index_record",
                format!("unsupported index version {ver}"),
            ));
        }
        let conn_id = fields.read_u32("conn")?;
        let count = fields.read_u32("count")?;
        if data.len() != count as usize * 12 {
            return Err(BagError::format(
                "Bag::read_connection_index_record",
                format!("data block is {} bytes for {count} entries", data.len()),
            ));
        }

        let index = self.connection_indexes.entry(conn_id).or_default();
        let mut cursor = Cursor::new(&data[..]);
        for _ in 0..count {
            let sec = read_u32_from(&mut cursor, "index entry")?;
            let nsec = read_u32_from(&mut cursor, "index entry")?;
            let offset = read_u32_from(&mut cursor, "index entry")?;
            insert_sorted(
                index,
                IndexEntry {
                    time: Time { sec, nsec },
                    chunk_pos,
                    offset,
                },
            );
        }
        Ok(())
    }

    // =========================================================================
    // Read path, version 1.2
    // =========================================================================

    fn start_reading_version_102(&mut self) -> Result<()> {
        self.read_file_header_record()?;
        if self.index_data_pos == 0 {
            return Err(BagError::unindexed(
                self.file_header_pos,
                "bag was not closed cleanly: file header has no index position",
            ));
        }
        let file_length = self.file_mut()?.size()?;
        let index_data_pos = self.index_data_pos;
        self.file_mut()?.seek(SeekFrom::Start(index_data_pos))?;
        while self.file_mut()?.offset() < file_length {
            self.read_topic_index_record_102().map_err(|e| self.unindexed(e))?;
        }

        // Each topic's first index entry points at its MSG_DEF record
        let firsts: Vec<(u32, u64)> = self
            .connection_indexes
            .iter()
            .filter_map(|(id, entries)| entries.first().map(|e| (*id, e.chunk_pos)))
            .collect();
        for (id, pos) in firsts {
            self.file_mut()?.seek(SeekFrom::Start(pos))?;
            self.read_message_definition_record_102(id)
                .map_err(|e| self.unindexed(e))?;
        }
        Ok(())
    }

    fn read_topic_index_record_102(&mut self) -> Result<()> {
        let (fields, data) = self.read_record()?;
        require_op(&fields, OP_INDEX_DATA, "topic index record")?;
        let ver = fields.read_u32("ver")?;
        if ver != 0 {
            return Err(BagError::format(
                "Bag::read_topic_index_record",
                format!("unsupported 1.2 index version {ver}"),
            ));
        }
        let topic = fields.read_string("topic")?;
        let count = fields.read_u32("count")?;
        if data.len() != count as usize * 16 {
            return Err(BagError::format(
                "Bag::read_topic_index_record",
                format!("data block is {} bytes for {count} entries", data.len()),
            ));
        }

        // Connection ids are synthesized from topic order on first
        // encounter
        let conn_id = match self.topic_connection_ids.get(&topic) {
            Some(&id) => id,
            None => {
                let id = self.topic_connection_ids.len() as u32;
                self.topic_connection_ids.insert(topic, id);
                id
            }
        };

        let index = self.connection_indexes.entry(conn_id).or_default();
        let mut cursor = Cursor::new(&data[..]);
        for _ in 0..count {
            let sec = read_u32_from(&mut cursor, "topic index entry")?;
            let nsec = read_u32_from(&mut cursor, "topic index entry")?;
            let pos = cursor.read_u64::<LittleEndian>().map_err(|e| {
                BagError::format("Bag::read_topic_index_record", format!("truncated entry: {e}"))
            })?;
            insert_sorted(
                index,
                IndexEntry {
                    time: Time { sec, nsec },
                    chunk_pos: pos,
                    offset: 0,
                },
            );
        }
        Ok(())
    }

    fn read_message_definition_record_102(&mut self, id: u32) -> Result<()> {
        let (fields, _data) = self.read_record()?;
        require_op(&fields, OP_MSG_DEF, "message definition record")?;
        let topic = fields.read_string("topic")?;
        let md5sum = fields.read_string("md5")?;
        let datatype = fields.read_string("type")?;
        let msg_def = fields.read_string("def")?;

        if id as usize != self.connections.len() {
            return Err(BagError::format(
                "Bag::read_message_definition_record",
                format!(
                    "connection id {id} is not dense (expected {})",
                    self.connections.len()
                ),
            ));
        }
        let mut header = FieldMap::new();
        header.insert_str("topic", &topic);
        header.insert_str("type", &datatype);
        header.insert_str("md5sum", &md5sum);
        header.insert_str("message_definition", &msg_def);
        self.connections.push(ConnectionInfo {
            id,
            topic,
            datatype,
            md5sum,
            msg_def,
            header,
        });
        Ok(())
    }

    /// Read the message record at an absolute position in a 1.2 bag,
    /// skipping the MSG_DEF record paired with a topic's first message.
    fn read_message_record_102(&self, pos: u64) -> Result<(FieldMap, Vec<u8>)> {
        let mut file_guard = self.file.borrow_mut();
        let file = file_guard
            .as_mut()
            .ok_or_else(|| BagError::usage("bag is not open"))?;
        file.seek(SeekFrom::Start(pos))?;

        let mut fields = read_header_from_file(file)?;
        if fields.read_u8("op")? == OP_MSG_DEF {
            let skip = file.read_u32()?;
            file.seek(SeekFrom::Current(skip as i64))?;
            fields = read_header_from_file(file)?;
        }
        require_op(&fields, OP_MSG_DATA, "message data record")?;
        let data_len = file.read_u32()?;
        let mut data = vec![0u8; data_len as usize];
        file.read(&mut data)?;
        Ok((fields, data))
    }

    // =========================================================================
    // Message materialization
    // =========================================================================

    /// Decompress the chunk at `chunk_pos` into the size-one cache.
    fn decompress_chunk(&self, chunk_pos: u64) -> Result<()> {
        {
            let cache = self.read_cache.borrow();
            if cache.decompressed_chunk == Some(chunk_pos) {
                return Ok(());
            }
        }
        let mut file_guard = self.file.borrow_mut();
        let file = file_guard
            .as_mut()
            .ok_or_else(|| BagError::usage("bag is not open"))?;
        let mut cache = self.read_cache.borrow_mut();
        cache.decompressed_chunk = None;

        file.seek(SeekFrom::Start(chunk_pos))?;
        let chunk_header = read_chunk_header(file)?;
        self.encryptor
            .decrypt_chunk(&chunk_header, &mut cache.chunk_buffer, file)?;

        match chunk_header.compression {
            CompressionType::None => {
                if cache.chunk_buffer.size() != chunk_header.uncompressed_size as usize {
                    return Err(BagError::format(
                        "Bag::decompress_chunk",
                        format!(
                            "raw chunk is {} bytes but header says {}",
                            cache.chunk_buffer.size(),
                            chunk_header.uncompressed_size
                        ),
                    ));
                }
                cache.current = CurrentBuffer::Chunk;
            }
            compression => {
                let ReadCache {
                    chunk_buffer,
                    decompress_buffer,
                    ..
                } = &mut *cache;
                chunked_file::decompress(
                    compression,
                    chunk_buffer.data(),
                    decompress_buffer,
                    chunk_header.uncompressed_size,
                )?;
                cache.current = CurrentBuffer::Decompress;
            }
        }
        cache.decompressed_chunk = Some(chunk_pos);
        Ok(())
    }

    /// Copy out the serialized payload a message's index entry points
    /// at.
    pub(crate) fn read_message_data(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        match self.version {
            200 => {
                self.decompress_chunk(entry.chunk_pos)?;
                let cache = self.read_cache.borrow();
                let buf = cache.current_data();
                let (fields, data_len, bytes_read) =
                    record::read_header_from_buffer(buf, entry.offset as usize)?;
                require_op(&fields, OP_MSG_DATA, "message data record")?;
                let start = entry.offset as usize + bytes_read;
                Ok(buf[start..start + data_len as usize].to_vec())
            }
            102 => {
                let (_fields, data) = self.read_message_record_102(entry.chunk_pos)?;
                Ok(data)
            }
            v => Err(BagError::format(
                "Bag::read_message_data",
                format!("unhandled version {v}"),
            )),
        }
    }

    /// Serialized payload size without copying it out.
    pub(crate) fn read_message_size(&self, entry: &IndexEntry) -> Result<u32> {
        match self.version {
            200 => {
                self.decompress_chunk(entry.chunk_pos)?;
                let cache = self.read_cache.borrow();
                let (fields, data_len, _) =
                    record::read_header_from_buffer(cache.current_data(), entry.offset as usize)?;
                require_op(&fields, OP_MSG_DATA, "message data record")?;
                Ok(data_len)
            }
            102 => Ok(self.read_message_record_102(entry.chunk_pos)?.1.len() as u32),
            v => Err(BagError::format(
                "Bag::read_message_size",
                format!("unhandled version {v}"),
            )),
        }
    }

    /// Header fields of the message record itself (carries per-message
    /// `latching` / `callerid` in 1.2 bags).
    pub(crate) fn message_fields(&self, entry: &IndexEntry) -> Result<FieldMap> {
        match self.version {
            200 => {
                self.decompress_chunk(entry.chunk_pos)?;
                let cache = self.read_cache.borrow();
                let (fields, _, _) =
                    record::read_header_from_buffer(cache.current_data(), entry.offset as usize)?;
                require_op(&fields, OP_MSG_DATA, "message data record")?;
                Ok(fields)
            }
            102 => Ok(self.read_message_record_102(entry.chunk_pos)?.0),
            v => Err(BagError::format(
                "Bag::message_fields",
                format!("unhandled version {v}"),
            )),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn file_mut(&mut self) -> Result<&mut ChunkedFile> {
        self.file
            .get_mut()
            .as_mut()
            .ok_or_else(|| BagError::usage("bag is not open"))
    }

    /// Read a full record (header fields plus data block) at the
    /// current file position.
    fn read_record(&mut self) -> Result<(FieldMap, Vec<u8>)> {
        let file = self.file_mut()?;
        let fields = read_header_from_file(file)?;
        let data_len = file.read_u32()?;
        if data_len > MAX_HEADER_LEN {
            return Err(BagError::format(
                "Bag::read_record",
                format!("implausible data length {data_len}"),
            ));
        }
        let mut data = vec![0u8; data_len as usize];
        file.read(&mut data)?;
        Ok((fields, data))
    }

    fn unindexed(&mut self, err: BagError) -> BagError {
        if matches!(err, BagError::Unindexed { .. }) {
            return err;
        }
        let offset = self
            .file
            .get_mut()
            .as_ref()
            .map(|f| f.offset())
            .unwrap_or(0);
        BagError::unindexed(offset, err.to_string())
    }

    fn reset(&mut self) {
        self.mode = BagMode::Read;
        self.version = 0;
        self.compression = CompressionType::None;
        self.chunk_threshold = DEFAULT_CHUNK_THRESHOLD;
        self.bag_revision = 0;
        self.file_size = 0;
        self.file_header_pos = 0;
        self.index_data_pos = 0;
        self.connection_count = 0;
        self.chunk_count = 0;
        self.chunk_open = false;
        self.curr_chunk_info = ChunkInfo::default();
        self.curr_chunk_data_pos = 0;
        self.topic_connection_ids.clear();
        self.header_connection_ids.clear();
        self.connections.clear();
        self.chunks.clear();
        self.connection_indexes.clear();
        self.curr_chunk_connection_indexes.clear();
        self.outgoing_chunk_buffer.set_size(0);
        *self.read_cache.get_mut() = ReadCache::new();
        self.encryptor = Box::new(NoEncryptor);
        self.write_failed = false;
        // last_error is retained for inspection
    }
}

impl Drop for Bag {
    fn drop(&mut self) {
        if self.file.get_mut().is_some() {
            if let Err(e) = self.close() {
                warn!(error = %e, "failed to close bag during drop");
            }
        }
    }
}

fn read_header_from_file(file: &mut ChunkedFile) -> Result<FieldMap> {
    let header_len = file.read_u32()?;
    if header_len > MAX_HEADER_LEN {
        return Err(BagError::format(
            "Bag::read_header",
            format!("implausible header length {header_len}"),
        ));
    }
    let mut bytes = vec![0u8; header_len as usize];
    file.read(&mut bytes)?;
    FieldMap::parse(&bytes)
}

fn read_chunk_header(file: &mut ChunkedFile) -> Result<ChunkHeader> {
    let fields = read_header_from_file(file)?;
    require_op(&fields, OP_CHUNK, "chunk record")?;
    let compression = CompressionType::from_name(&fields.read_string("compression")?)?;
    let uncompressed_size = fields.read_u32("size")?;
    let compressed_size = file.read_u32()?;
    Ok(ChunkHeader {
        compression,
        compressed_size,
        uncompressed_size,
    })
}

fn require_op(fields: &FieldMap, expected: u8, what: &str) -> Result<()> {
    let op = fields.read_u8("op")?;
    if op != expected {
        return Err(BagError::format(
            "Bag",
            format!("expected {what} (op=0x{expected:02x}), found op=0x{op:02x}"),
        ));
    }
    Ok(())
}

fn read_u32_from(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u32> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| BagError::format("Bag", format!("truncated {what}: {e}")))
}
