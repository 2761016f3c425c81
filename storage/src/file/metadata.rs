//! Persisted description of a backing file.
//!
//! # Format
//!
//! ```text
//! +---------+------------+--------+---------------------+-------+-------------------------+-------+
//! | version | handle len | handle | remote change time  | count | (offset, length, state) | CRC32 |
//! |  u8     |    u32     | bytes  |        u64          |  u32  |  u64 | u64 | u8       |  u32  |
//! +---------+------------+--------+---------------------+-------+-------------------------+-------+
//! ```
//!
//! All integers are big-endian. The checksum covers every byte before it.

use crate::{
    extent::{Extent, State},
    Error,
};
use bytes::{Buf, BufMut};
use std::{
    fs::{self, File},
    io::Write,
    path::Path,
};
use tracing::debug;

const VERSION: u8 = 1;
const EXTENT_SIZE: usize = 8 + 8 + 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Metadata {
    pub handle: Vec<u8>,
    pub remote_change_time: u64,
    pub extents: Vec<Extent>,
}

impl Metadata {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let handle_len = u32::try_from(self.handle.len())
            .map_err(|_| Error::InvalidArgument("handle too long"))?;
        let count = u32::try_from(self.extents.len())
            .map_err(|_| Error::InvalidArgument("too many extents"))?;
        let mut buf = Vec::with_capacity(
            1 + 4 + self.handle.len() + 8 + 4 + self.extents.len() * EXTENT_SIZE + 4,
        );
        buf.put_u8(VERSION);
        buf.put_u32(handle_len);
        buf.put_slice(&self.handle);
        buf.put_u64(self.remote_change_time);
        buf.put_u32(count);
        for extent in &self.extents {
            buf.put_u64(extent.offset);
            buf.put_u64(extent.length);
            buf.put_u8(match extent.state {
                State::Clean => 0,
                State::Dirty => 1,
            });
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);
        Ok(buf)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < 4 {
            return Err(Error::MetadataCorrupt("too short"));
        }
        let (body, checksum) = raw.split_at(raw.len() - 4);
        let stored_checksum = u32::from_be_bytes(checksum.try_into().unwrap());
        let computed_checksum = crc32fast::hash(body);
        if stored_checksum != computed_checksum {
            debug!(
                stored = stored_checksum,
                computed = computed_checksum,
                "checksum mismatch"
            );
            return Err(Error::MetadataCorrupt("checksum mismatch"));
        }

        let mut buf = body;
        if buf.remaining() < 1 + 4 {
            return Err(Error::MetadataCorrupt("truncated header"));
        }
        if buf.get_u8() != VERSION {
            return Err(Error::MetadataCorrupt("unsupported version"));
        }
        let handle_len = buf.get_u32() as usize;
        if buf.remaining() < handle_len + 8 + 4 {
            return Err(Error::MetadataCorrupt("truncated header"));
        }
        let handle = buf.copy_to_bytes(handle_len).to_vec();
        let remote_change_time = buf.get_u64();
        let count = buf.get_u32() as usize;
        if buf.remaining() != count * EXTENT_SIZE {
            return Err(Error::MetadataCorrupt("extent count mismatch"));
        }
        let mut extents = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = buf.get_u64();
            let length = buf.get_u64();
            let state = match buf.get_u8() {
                0 => State::Clean,
                1 => State::Dirty,
                _ => return Err(Error::MetadataCorrupt("invalid extent state")),
            };
            if length == 0 || offset.checked_add(length).is_none() {
                return Err(Error::MetadataCorrupt("invalid extent bounds"));
            }
            extents.push(Extent {
                offset,
                length,
                state,
            });
        }
        Ok(Self {
            handle,
            remote_change_time,
            extents,
        })
    }

    /// Replace the file at `path` with the encoded metadata.
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let encoded = self.encode()?;
        let staged = path.with_extension("tmp");
        let mut file = File::create(&staged)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&staged, path)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, Error> {
        match fs::read(path) {
            Ok(raw) => Self::decode(&raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(err) => Err(err.into()),
        }
    }
}
