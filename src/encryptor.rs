// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Encryptor plugin contract.
//!
//! An encryptor wraps chunk bodies and selected header blocks on their
//! way to and from the file. The engine always goes through the active
//! encryptor; the default [`NoEncryptor`] passes bytes through
//! unchanged and leaves no trace in the file header.

use crate::bag::constants::ENCRYPTOR_FIELD_NAME;
use crate::bag::structures::ChunkHeader;
use crate::core::{BagError, Result};
use crate::io::chunked_file::ChunkedFile;
use crate::io::record::{self, FieldMap};
use crate::types::Buffer;

/// Chunk and header wrapping hooks.
///
/// Implementations are user-extensible; the engine selects one by name
/// via `Bag::set_encryptor_plugin` and records that name in the file
/// header so readers can reconstruct it.
pub trait Encryptor: std::fmt::Debug {
    /// Initialize with the plugin parameter string.
    fn initialize(&mut self, _param: &str) -> Result<()> {
        Ok(())
    }

    /// Encrypt the finished chunk body in place.
    ///
    /// The original body occupies `[chunk_data_pos, chunk_data_pos +
    /// chunk_size)`; the encrypted body is written back starting at
    /// `chunk_data_pos` and its size is returned.
    fn encrypt_chunk(
        &self,
        chunk_size: u32,
        chunk_data_pos: u64,
        file: &mut ChunkedFile,
    ) -> Result<u32>;

    /// Read the chunk body from the file and write the decrypted bytes
    /// into `out`, sized by the caller to the on-disk body size.
    fn decrypt_chunk(
        &self,
        chunk_header: &ChunkHeader,
        out: &mut Buffer,
        file: &mut ChunkedFile,
    ) -> Result<()>;

    /// Add encryptor-specific fields to the file header of a bag being
    /// written. Every implementation other than the pass-through must
    /// record its plugin name under `encryptor`.
    fn add_fields_to_file_header(&self, _fields: &mut FieldMap) {}

    /// Read encryptor-specific fields back from the file header of a
    /// bag being opened.
    fn read_fields_from_file_header(&mut self, _fields: &FieldMap) -> Result<()> {
        Ok(())
    }

    /// Write a header block, encrypted, as a record data section.
    fn write_encrypted_header(&self, file: &mut ChunkedFile, fields: &FieldMap) -> Result<()>;

    /// Read back a header block written by
    /// [`write_encrypted_header`](Self::write_encrypted_header).
    fn read_encrypted_header(&self, file: &mut ChunkedFile) -> Result<FieldMap>;
}

/// The default pass-through encryptor.
#[derive(Debug, Default)]
pub struct NoEncryptor;

impl Encryptor for NoEncryptor {
    fn encrypt_chunk(
        &self,
        chunk_size: u32,
        _chunk_data_pos: u64,
        _file: &mut ChunkedFile,
    ) -> Result<u32> {
        Ok(chunk_size)
    }

    fn decrypt_chunk(
        &self,
        chunk_header: &ChunkHeader,
        out: &mut Buffer,
        file: &mut ChunkedFile,
    ) -> Result<()> {
        out.set_size(chunk_header.compressed_size as usize);
        file.read(out.data_mut())
    }

    fn write_encrypted_header(&self, file: &mut ChunkedFile, fields: &FieldMap) -> Result<()> {
        let mut buf = Vec::new();
        record::write_data_length(&mut buf, fields.serialized_len() as u32);
        fields.write_fields(&mut buf);
        file.write(&buf)
    }

    fn read_encrypted_header(&self, file: &mut ChunkedFile) -> Result<FieldMap> {
        let len = file.read_u32()?;
        let mut bytes = vec![0u8; len as usize];
        file.read(&mut bytes)?;
        FieldMap::parse(&bytes)
    }
}

/// Construct an encryptor by plugin name. The empty name and `"none"`
/// select the pass-through encryptor; anything else is unknown here,
/// since concrete encryptors live outside the storage engine.
pub fn create_encryptor(name: &str) -> Result<Box<dyn Encryptor>> {
    match name {
        "" | "none" => Ok(Box::new(NoEncryptor)),
        other => Err(BagError::encryption(format!(
            "unknown encryptor plugin '{other}'"
        ))),
    }
}

/// Encryptor named in a file header's fields, if any.
pub fn encryptor_from_file_header(fields: &FieldMap) -> Result<Option<Box<dyn Encryptor>>> {
    match fields.get_string(ENCRYPTOR_FIELD_NAME) {
        None => Ok(None),
        Some(name) => {
            let mut encryptor = create_encryptor(&name)?;
            encryptor.read_fields_from_file_header(fields)?;
            Ok(Some(encryptor))
        }
    }
}
