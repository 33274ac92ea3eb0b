//! On-disk layout of `.dqlog` files.
//!
//! All integers are little-endian.
//!
//! ```text
//! lead-in   16 B   "DAQLOG\r\n" | version u16 | reserved [6]
//! segment*
//!   header  40 B   "DQSG" | flags u32 | meta_len u32 | meta_crc u32
//!                  | sample_count u64 | data_len u64 | commit_crc u32 | reserved u32
//!   meta    meta_len B of JSON (SegmentMetadata)
//!   data    data_len B of block records:
//!             timestamp_ns u64 | frames u32 | reserved u32
//!             | frames * channels f64, interleaved by frame
//! index     "DQIX" | count u32 | count * (offset u64 | sample_count u64 | first_ts_ns u64)
//! trailer   16 B   index_offset u64 | "DQND" | index_crc u32
//! ```
//!
//! The commit record (`sample_count`, `data_len`, `commit_crc`) is the only
//! part of a segment rewritten after it is appended. It is rewritten after the
//! data it describes has been synced, so the declared counts never exceed the
//! durable data unless the file is later truncated externally.

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::channel::ChannelDescriptor;

/// File magic at offset 0
pub const LEAD_IN_MAGIC: &[u8; 8] = b"DAQLOG\r\n";
/// Current format version
pub const FORMAT_VERSION: u16 = 1;
/// Size of the lead-in
pub const LEAD_IN_LEN: u64 = 16;

pub(crate) const SEGMENT_TAG: &[u8; 4] = b"DQSG";
pub(crate) const SEGMENT_HEADER_LEN: u64 = 40;
/// Offset of the commit record inside a segment header
pub(crate) const COMMIT_OFFSET: u64 = 16;
pub(crate) const COMMIT_LEN: usize = 24;

pub(crate) const RECORD_HEADER_LEN: u64 = 16;
pub(crate) const SAMPLE_LEN: u64 = 8;

pub(crate) const INDEX_TAG: &[u8; 4] = b"DQIX";
pub(crate) const INDEX_ENTRY_LEN: u64 = 24;
pub(crate) const TRAILER_TAG: &[u8; 4] = b"DQND";
pub(crate) const TRAILER_LEN: u64 = 16;

/// Data region layout tag stored in segment metadata
pub const LAYOUT_INTERLEAVED: &str = "interleaved_f64_le";

static CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub(crate) fn checksum(bytes: &[u8]) -> u32 {
    CRC32C.checksum(bytes)
}

/// Errors raised while parsing a log file. Scoped to a single read call.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("file does not start with a daq_log lead-in")]
    MissingLeadIn,

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    #[error("corrupt data at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("unsupported data layout '{0}'")]
    UnsupportedLayout(String),

    #[error("channel '{0}' not found in log")]
    UnknownChannel(String),

    #[error("segment metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Self-describing metadata written at the start of every segment.
///
/// Unknown fields are ignored on read, so newer writers may add fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    /// Session that produced the segment
    pub session_id: Uuid,
    /// Wall-clock session start
    pub session_start: DateTime<Utc>,
    /// Per-channel sample rate in Hz
    pub sample_rate: f64,
    /// Position of the segment within the file
    pub segment_index: u32,
    /// Data region layout, see [`LAYOUT_INTERLEAVED`]
    #[serde(default = "default_layout")]
    pub layout: String,
    /// Channels in storage order, including scale parameters
    pub channels: Vec<ChannelDescriptor>,
}

fn default_layout() -> String {
    LAYOUT_INTERLEAVED.to_string()
}

impl SegmentMetadata {
    pub(crate) fn frame_len(&self) -> u64 {
        self.channels.len() as u64 * SAMPLE_LEN
    }

    pub(crate) fn channel_position(&self, display_name: &str) -> Option<usize> {
        self.channels
            .iter()
            .position(|c| c.display_name == display_name)
    }
}

pub(crate) fn encode_lead_in() -> [u8; LEAD_IN_LEN as usize] {
    let mut out = [0u8; LEAD_IN_LEN as usize];
    out[..8].copy_from_slice(LEAD_IN_MAGIC);
    out[8..10].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    out
}

/// Validate the lead-in and return the format version.
pub(crate) fn decode_lead_in(bytes: &[u8]) -> Result<u16, FormatError> {
    if bytes.len() < LEAD_IN_LEN as usize || &bytes[..8] != LEAD_IN_MAGIC {
        return Err(FormatError::MissingLeadIn);
    }
    let version = u16::from_le_bytes([bytes[8], bytes[9]]);
    if version == 0 || version > FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    Ok(version)
}

/// How much of a segment is durably committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitRecord {
    /// Samples per channel
    pub sample_count: u64,
    /// Bytes of data region
    pub data_len: u64,
}

impl CommitRecord {
    pub(crate) fn encode(&self) -> [u8; COMMIT_LEN] {
        let mut buf = BytesMut::with_capacity(COMMIT_LEN);
        buf.put_u64_le(self.sample_count);
        buf.put_u64_le(self.data_len);
        let crc = checksum(&buf[..16]);
        buf.put_u32_le(crc);
        buf.put_u32_le(0);
        let mut out = [0u8; COMMIT_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// `None` when the checksum does not match (torn update).
    pub(crate) fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 20 {
            return None;
        }
        let mut cur = bytes;
        let sample_count = cur.get_u64_le();
        let data_len = cur.get_u64_le();
        let crc = cur.get_u32_le();
        (crc == checksum(&bytes[..16])).then_some(Self {
            sample_count,
            data_len,
        })
    }
}

/// Fixed-size segment header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentHeader {
    pub meta_len: u32,
    pub meta_crc: u32,
    pub commit: Option<CommitRecord>,
}

pub(crate) fn encode_segment_header(metadata: &[u8], commit: CommitRecord) -> BytesMut {
    let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_LEN as usize + metadata.len());
    buf.put_slice(SEGMENT_TAG);
    buf.put_u32_le(0);
    buf.put_u32_le(metadata.len() as u32);
    buf.put_u32_le(checksum(metadata));
    buf.put_slice(&commit.encode());
    buf.put_slice(metadata);
    buf
}

/// `None` if the bytes do not start with a segment tag.
pub(crate) fn decode_segment_header(bytes: &[u8]) -> Option<SegmentHeader> {
    if bytes.len() < SEGMENT_HEADER_LEN as usize || &bytes[..4] != SEGMENT_TAG {
        return None;
    }
    let mut cur = &bytes[4..];
    let _flags = cur.get_u32_le();
    let meta_len = cur.get_u32_le();
    let meta_crc = cur.get_u32_le();
    let commit = CommitRecord::decode(&bytes[COMMIT_OFFSET as usize..]);
    Some(SegmentHeader {
        meta_len,
        meta_crc,
        commit,
    })
}

/// Header of one block record in the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub timestamp_ns: u64,
    pub frames: u32,
}

impl RecordHeader {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.timestamp_ns);
        buf.put_u32_le(self.frames);
        buf.put_u32_le(0);
    }

    pub(crate) fn decode(bytes: &[u8]) -> Self {
        let mut cur = bytes;
        let timestamp_ns = cur.get_u64_le();
        let frames = cur.get_u32_le();
        Self {
            timestamp_ns,
            frames,
        }
    }
}

/// One entry of the end-of-file segment index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Byte offset of the segment header
    pub offset: u64,
    /// Committed samples per channel
    pub sample_count: u64,
    /// Timestamp of the first block, nanoseconds since session start
    pub first_timestamp_ns: u64,
}

/// Encode index plus trailer. `index_offset` is where the index starts.
pub(crate) fn encode_index(entries: &[IndexEntry], index_offset: u64) -> BytesMut {
    let mut buf = BytesMut::with_capacity(
        8 + entries.len() * INDEX_ENTRY_LEN as usize + TRAILER_LEN as usize,
    );
    buf.put_slice(INDEX_TAG);
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        buf.put_u64_le(entry.offset);
        buf.put_u64_le(entry.sample_count);
        buf.put_u64_le(entry.first_timestamp_ns);
    }
    let crc = checksum(&buf);
    buf.put_u64_le(index_offset);
    buf.put_slice(TRAILER_TAG);
    buf.put_u32_le(crc);
    buf
}

/// Trailer fields: `(index_offset, index_crc)`; `None` if not a trailer.
pub(crate) fn decode_trailer(bytes: &[u8]) -> Option<(u64, u32)> {
    if bytes.len() != TRAILER_LEN as usize || &bytes[8..12] != TRAILER_TAG {
        return None;
    }
    let mut cur = bytes;
    let index_offset = cur.get_u64_le();
    cur.advance(4);
    Some((index_offset, cur.get_u32_le()))
}

/// Parse index bytes (without trailer) and verify them against `crc`.
pub(crate) fn decode_index(bytes: &[u8], crc: u32) -> Option<Vec<IndexEntry>> {
    if bytes.len() < 8 || &bytes[..4] != INDEX_TAG || checksum(bytes) != crc {
        return None;
    }
    let mut cur = &bytes[4..];
    let count = cur.get_u32_le() as usize;
    if cur.len() != count * INDEX_ENTRY_LEN as usize {
        return None;
    }
    Some(
        (0..count)
            .map(|_| IndexEntry {
                offset: cur.get_u64_le(),
                sample_count: cur.get_u64_le(),
                first_timestamp_ns: cur.get_u64_le(),
            })
            .collect(),
    )
}
