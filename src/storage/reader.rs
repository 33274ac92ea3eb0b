//! Log file reader.
//!
//! [`LogReader::open`] builds a [`LogHandle`] describing every segment, from
//! the trailing index when it is present and consistent, otherwise by walking
//! segment headers from the start of the file. Opening never reads sample
//! data except to recover a truncated final segment.
//!
//! Channel data is read through [`ChannelStream`], a lazy iterator with its
//! own file handle. Streams scale raw values with the transform stored in the
//! segment that holds them, so a file stays readable after its scales are
//! changed in the configuration.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};

use super::format::{
    checksum, decode_index, decode_lead_in, decode_segment_header, decode_trailer, CommitRecord,
    FormatError, IndexEntry, RecordHeader, SegmentHeader, SegmentMetadata, INDEX_TAG,
    LAYOUT_INTERLEAVED, LEAD_IN_LEN, RECORD_HEADER_LEN, SAMPLE_LEN, SEGMENT_HEADER_LEN,
    TRAILER_LEN,
};
use super::TruncationRecovered;
use crate::channel::{ChannelDescriptor, ScaleTransform};

/// Entry point for reading `.dqlog` files.
pub struct LogReader;

impl LogReader {
    /// Open a log file and index its segments.
    pub fn open(path: impl AsRef<Path>) -> Result<LogHandle, FormatError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();
        if len < LEAD_IN_LEN {
            return Err(FormatError::MissingLeadIn);
        }
        let mut lead_in = [0u8; LEAD_IN_LEN as usize];
        file.read_exact(&mut lead_in)?;
        let version = decode_lead_in(&lead_in)?;

        let trailer = read_trailer(&mut file, len)?;
        // an unverified trailer may just be sample bytes
        let data_end = trailer
            .as_ref()
            .filter(|t| t.entries.is_some())
            .map_or(len, |t| t.index_offset);
        let (scan, indexed) = match trailer.and_then(|t| t.entries.map(|e| (e, t.index_offset))) {
            Some((entries, index_offset)) => {
                match load_indexed(&mut file, &entries, index_offset) {
                    Ok(scan) => (scan, true),
                    Err(err) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %err,
                            "Segment index inconsistent, scanning file"
                        );
                        (scan_segments(&mut file, data_end)?, false)
                    }
                }
            }
            None => (scan_segments(&mut file, data_end)?, false),
        };

        for truncation in &scan.truncations {
            tracing::warn!(path = %path.display(), "{truncation}");
        }
        if scan.uncommitted_bytes > 0 {
            tracing::debug!(
                path = %path.display(),
                bytes = scan.uncommitted_bytes,
                "Ignoring uncommitted tail"
            );
        }
        tracing::debug!(
            path = %path.display(),
            segments = scan.segments.len(),
            indexed,
            "Opened log file"
        );

        Ok(LogHandle {
            path,
            version,
            indexed,
            segments: scan.segments,
            truncations: scan.truncations,
            uncommitted_bytes: scan.uncommitted_bytes,
        })
    }
}

/// Description of one segment as found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSummary {
    /// Position within the file
    pub index: usize,
    /// Offset of the segment header
    pub offset: u64,
    /// Offset of the first block record
    pub data_start: u64,
    /// Readable bytes of the data region
    pub data_len: u64,
    /// Readable samples per channel
    pub sample_count: u64,
    /// Timestamp of the first record, nanoseconds since session start
    pub first_timestamp_ns: u64,
    pub metadata: SegmentMetadata,
    commit: Option<CommitRecord>,
    whole_len: u64,
    whole_samples: u64,
}

impl SegmentSummary {
    /// Commit record as stored, `None` if it failed its checksum
    pub fn commit(&self) -> Option<CommitRecord> {
        self.commit
    }

    /// Recorded time span in seconds
    pub fn duration_secs(&self) -> f64 {
        self.sample_count as f64 / self.metadata.sample_rate
    }

    /// Bytes and samples covered by complete block records.
    pub(crate) fn whole_records(&self) -> (u64, u64) {
        (self.whole_len, self.whole_samples)
    }
}

/// A stored display name that no longer matches the configured name for the
/// same physical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameDiscrepancy {
    pub physical_id: String,
    pub stored_name: String,
    pub configured_name: String,
}

/// Which part of a channel to read.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ReadRange {
    #[default]
    All,
    /// Indices into the channel's samples concatenated across segments
    Samples(Range<u64>),
    /// Samples with `start <= timestamp < end`, seconds since session start
    Seconds { start: f64, end: f64 },
}

/// One scaled value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledSample {
    /// Seconds since the owning session started
    pub timestamp: f64,
    pub value: f64,
}

/// An opened log file.
#[derive(Debug, Clone)]
pub struct LogHandle {
    path: PathBuf,
    version: u16,
    indexed: bool,
    segments: Vec<SegmentSummary>,
    truncations: Vec<TruncationRecovered>,
    uncommitted_bytes: u64,
}

impl LogHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Format version from the lead-in
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Whether segments were located through the trailing index
    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    pub fn segments(&self) -> &[SegmentSummary] {
        &self.segments
    }

    /// Recovery warnings raised while opening
    pub fn truncations(&self) -> &[TruncationRecovered] {
        &self.truncations
    }

    /// Bytes after the last committed data that were ignored
    pub fn uncommitted_bytes(&self) -> u64 {
        self.uncommitted_bytes
    }

    /// All channels in the file, by display name in order of first
    /// appearance. When a name occurs in several segments the most recent
    /// descriptor is returned.
    pub fn list_channels(&self) -> Vec<ChannelDescriptor> {
        let mut order = Vec::new();
        let mut latest: HashMap<&str, &ChannelDescriptor> = HashMap::new();
        for segment in &self.segments {
            for channel in &segment.metadata.channels {
                if latest
                    .insert(channel.display_name.as_str(), channel)
                    .is_none()
                {
                    order.push(channel.display_name.as_str());
                }
            }
        }
        order
            .into_iter()
            .filter_map(|name| latest.get(name).map(|c| (*c).clone()))
            .collect()
    }

    /// Samples per channel stored under `display_name`
    pub fn total_samples(&self, display_name: &str) -> u64 {
        self.segments
            .iter()
            .filter(|s| s.metadata.channel_position(display_name).is_some())
            .map(|s| s.sample_count)
            .sum()
    }

    /// Stream the scaled values of a channel.
    pub fn read_channel(
        &self,
        display_name: &str,
        range: ReadRange,
    ) -> Result<ChannelStream, FormatError> {
        self.stream(display_name, range, |meta| {
            meta.channel_position(display_name)
        })
    }

    /// Like [`read_channel`](Self::read_channel), matching on the physical
    /// channel instead of the display name.
    pub fn read_channel_by_physical_id(
        &self,
        physical_id: &str,
        range: ReadRange,
    ) -> Result<ChannelStream, FormatError> {
        self.stream(physical_id, range, |meta| {
            meta.channels
                .iter()
                .position(|c| c.physical_id == physical_id)
        })
    }

    /// Compare stored display names against configured channels.
    pub fn reconcile(&self, configured: &[ChannelDescriptor]) -> Vec<NameDiscrepancy> {
        self.list_channels()
            .into_iter()
            .filter_map(|stored| {
                let current = configured
                    .iter()
                    .find(|c| c.physical_id == stored.physical_id)?;
                (current.display_name != stored.display_name).then(|| NameDiscrepancy {
                    physical_id: stored.physical_id.clone(),
                    stored_name: stored.display_name.clone(),
                    configured_name: current.display_name.clone(),
                })
            })
            .collect()
    }

    fn stream(
        &self,
        channel: &str,
        range: ReadRange,
        locate: impl Fn(&SegmentMetadata) -> Option<usize>,
    ) -> Result<ChannelStream, FormatError> {
        let plan: Vec<StreamSegment> = self
            .segments
            .iter()
            .filter_map(|segment| Some(StreamSegment::new(segment, locate(&segment.metadata)?)))
            .collect();
        if plan.is_empty() {
            return Err(FormatError::UnknownChannel(channel.to_string()));
        }
        let stream = self.build_stream(plan, range);
        for truncation in stream.truncations() {
            tracing::warn!(channel, "Reading recovered data: {truncation}");
        }
        Ok(stream)
    }

    /// Stream one channel of a single segment.
    pub(crate) fn segment_channel(&self, segment: &SegmentSummary, position: usize) -> ChannelStream {
        self.build_stream(vec![StreamSegment::new(segment, position)], ReadRange::All)
    }

    fn build_stream(&self, plan: Vec<StreamSegment>, range: ReadRange) -> ChannelStream {
        let truncations = self
            .truncations
            .iter()
            .filter(|t| plan.iter().any(|s| s.index == t.segment))
            .copied()
            .collect();
        ChannelStream {
            path: self.path.clone(),
            file: None,
            file_pos: 0,
            plan,
            range,
            truncations,
            segment: 0,
            offset: 0,
            segment_read: 0,
            next_index: 0,
            payload: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }
}

#[derive(Debug, Clone)]
struct StreamSegment {
    index: usize,
    data_start: u64,
    data_len: u64,
    sample_count: u64,
    channel: usize,
    frame_len: u64,
    sample_rate: f64,
    scale: ScaleTransform,
}

impl StreamSegment {
    fn new(segment: &SegmentSummary, position: usize) -> Self {
        Self {
            index: segment.index,
            data_start: segment.data_start,
            data_len: segment.data_len,
            sample_count: segment.sample_count,
            channel: position,
            frame_len: segment.metadata.frame_len(),
            sample_rate: segment.metadata.sample_rate,
            scale: segment.metadata.channels[position].scale.clone(),
        }
    }
}

/// Lazy iterator over one channel's scaled samples in storage order.
///
/// Yields `Err` once on an I/O failure and then ends.
pub struct ChannelStream {
    path: PathBuf,
    file: Option<BufReader<File>>,
    file_pos: u64,
    plan: Vec<StreamSegment>,
    range: ReadRange,
    truncations: Vec<TruncationRecovered>,
    segment: usize,
    offset: u64,
    segment_read: u64,
    next_index: u64,
    payload: Vec<u8>,
    pending: VecDeque<ScaledSample>,
    done: bool,
}

impl ChannelStream {
    /// Recovery warnings for segments this stream reads
    pub fn truncations(&self) -> &[TruncationRecovered] {
        &self.truncations
    }

    /// Collect the remaining values.
    pub fn values(self) -> Result<Vec<f64>, FormatError> {
        self.map(|s| s.map(|s| s.value)).collect()
    }

    fn reader_at(&mut self, position: u64) -> Result<&mut BufReader<File>, FormatError> {
        let file = match self.file.take() {
            Some(mut file) => {
                if position != self.file_pos {
                    file.seek_relative(position as i64 - self.file_pos as i64)?;
                }
                file
            }
            None => {
                let mut file = BufReader::with_capacity(1 << 16, File::open(&self.path)?);
                file.seek(SeekFrom::Start(position))?;
                file
            }
        };
        self.file_pos = position;
        Ok(self.file.insert(file))
    }

    fn next_segment(&mut self) {
        self.segment += 1;
        self.offset = 0;
        self.segment_read = 0;
    }

    /// Frame range of the current record to emit.
    fn wanted(&self, first_timestamp: f64, frames: u64, sample_rate: f64) -> Range<u64> {
        match &self.range {
            ReadRange::All => 0..frames,
            ReadRange::Samples(range) => {
                let lo = range.start.saturating_sub(self.next_index).min(frames);
                let hi = range.end.saturating_sub(self.next_index).min(frames);
                lo..hi.max(lo)
            }
            ReadRange::Seconds { start, end } => {
                let lo = first_frame_at(*start, first_timestamp, frames, sample_rate);
                lo..first_frame_at(*end, first_timestamp, frames, sample_rate).max(lo)
            }
        }
    }

    /// Decode the next record that overlaps the range into `pending`.
    fn fill(&mut self) -> Result<bool, FormatError> {
        loop {
            let Some(segment) = self.plan.get(self.segment).cloned() else {
                return Ok(false);
            };
            if let ReadRange::Samples(range) = &self.range {
                if self.next_index >= range.end {
                    return Ok(false);
                }
            }
            let remaining = segment.data_len - self.offset;
            if remaining < RECORD_HEADER_LEN
                || self.segment_read >= segment.sample_count
                || segment.frame_len == 0
            {
                self.next_segment();
                continue;
            }

            let record_start = segment.data_start + self.offset;
            let mut header = [0u8; RECORD_HEADER_LEN as usize];
            self.reader_at(record_start)?.read_exact(&mut header)?;
            self.file_pos += RECORD_HEADER_LEN;
            let header = RecordHeader::decode(&header);

            let body = remaining - RECORD_HEADER_LEN;
            let frames = u64::from(header.frames)
                .min(body / segment.frame_len)
                .min(segment.sample_count - self.segment_read);
            let first_timestamp = header.timestamp_ns as f64 / 1e9;

            if let ReadRange::Seconds { end, .. } = self.range {
                if first_timestamp >= end {
                    // timestamps only grow within a segment
                    self.next_segment();
                    continue;
                }
            }

            let wanted = self.wanted(first_timestamp, frames, segment.sample_rate);
            if !wanted.is_empty() {
                let bytes = (wanted.end * segment.frame_len) as usize;
                self.payload.resize(bytes, 0);
                let mut payload = std::mem::take(&mut self.payload);
                self.reader_at(record_start + RECORD_HEADER_LEN)?
                    .read_exact(&mut payload)?;
                self.file_pos += bytes as u64;
                let channel_offset = segment.channel * SAMPLE_LEN as usize;
                for frame in wanted.clone() {
                    let at = frame as usize * segment.frame_len as usize + channel_offset;
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&payload[at..at + 8]);
                    self.pending.push_back(ScaledSample {
                        timestamp: first_timestamp + frame as f64 / segment.sample_rate,
                        value: segment.scale.apply(f64::from_le_bytes(raw)),
                    });
                }
                self.payload = payload;
            }

            let record_len = u64::from(header.frames) * segment.frame_len;
            self.offset += RECORD_HEADER_LEN + record_len.min(body);
            self.segment_read += frames;
            self.next_index += frames;
            if !wanted.is_empty() {
                return Ok(true);
            }
        }
    }
}

impl Iterator for ChannelStream {
    type Item = Result<ScaledSample, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(sample) = self.pending.pop_front() {
                return Some(Ok(sample));
            }
            if self.done {
                return None;
            }
            match self.fill() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    self.pending.clear();
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Index of the first frame whose timestamp is at or after `t`, or `frames`.
///
/// Compares with the exact expression used to timestamp emitted samples, so
/// a sample sitting on the boundary is never lost to rounding.
fn first_frame_at(t: f64, first_timestamp: f64, frames: u64, sample_rate: f64) -> u64 {
    let time_of = |frame: u64| first_timestamp + frame as f64 / sample_rate;
    let estimate = ((t - first_timestamp) * sample_rate).ceil();
    let mut frame = if estimate.is_nan() {
        0
    } else {
        (estimate.max(0.0) as u64).min(frames)
    };
    while frame > 0 && time_of(frame - 1) >= t {
        frame -= 1;
    }
    while frame < frames && time_of(frame) < t {
        frame += 1;
    }
    frame
}

#[derive(Default)]
struct Scan {
    segments: Vec<SegmentSummary>,
    truncations: Vec<TruncationRecovered>,
    uncommitted_bytes: u64,
}

struct LoadedSegment {
    offset: u64,
    header: SegmentHeader,
    metadata: SegmentMetadata,
    data_start: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct RecordWalk {
    len: u64,
    samples: u64,
    whole_len: u64,
    whole_samples: u64,
}

fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

struct Trailer {
    index_offset: u64,
    /// `None` when the index fails its checksum
    entries: Option<Vec<IndexEntry>>,
}

/// Trailer and index, if the file ends with a plausible trailer.
fn read_trailer(file: &mut File, len: u64) -> Result<Option<Trailer>, FormatError> {
    if len < LEAD_IN_LEN + TRAILER_LEN {
        return Ok(None);
    }
    let trailer_at = len - TRAILER_LEN;
    let mut trailer = [0u8; TRAILER_LEN as usize];
    read_at(file, trailer_at, &mut trailer)?;
    let Some((index_offset, crc)) = decode_trailer(&trailer) else {
        return Ok(None);
    };
    if index_offset < LEAD_IN_LEN || index_offset >= trailer_at {
        return Ok(None);
    }
    let mut index = vec![0u8; (trailer_at - index_offset) as usize];
    read_at(file, index_offset, &mut index)?;
    Ok(Some(Trailer {
        index_offset,
        entries: decode_index(&index, crc),
    }))
}

/// Header and metadata at `offset`, or `None` if no complete, intact segment
/// header fits before `limit`.
fn load_segment(
    file: &mut File,
    offset: u64,
    limit: u64,
) -> Result<Option<LoadedSegment>, FormatError> {
    if offset + SEGMENT_HEADER_LEN > limit {
        return Ok(None);
    }
    let mut raw = [0u8; SEGMENT_HEADER_LEN as usize];
    read_at(file, offset, &mut raw)?;
    let Some(header) = decode_segment_header(&raw) else {
        return Ok(None);
    };
    let data_start = offset + SEGMENT_HEADER_LEN + u64::from(header.meta_len);
    if data_start > limit {
        return Ok(None);
    }
    let mut meta = vec![0u8; header.meta_len as usize];
    read_at(file, offset + SEGMENT_HEADER_LEN, &mut meta)?;
    if checksum(&meta) != header.meta_crc {
        return Ok(None);
    }
    let metadata: SegmentMetadata = serde_json::from_slice(&meta)?;
    if metadata.layout != LAYOUT_INTERLEAVED {
        return Err(FormatError::UnsupportedLayout(metadata.layout));
    }
    Ok(Some(LoadedSegment {
        offset,
        header,
        metadata,
        data_start,
    }))
}

/// Count the whole frames stored in `len` bytes of block records.
fn walk_records(
    file: &mut File,
    start: u64,
    len: u64,
    frame_len: u64,
) -> Result<RecordWalk, FormatError> {
    let mut walk = RecordWalk::default();
    if frame_len == 0 {
        return Ok(walk);
    }
    let mut reader = BufReader::new(&mut *file);
    reader.seek(SeekFrom::Start(start))?;
    let mut pos = 0;
    let mut header = [0u8; RECORD_HEADER_LEN as usize];
    while len - pos >= RECORD_HEADER_LEN {
        reader.read_exact(&mut header)?;
        let frames = u64::from(RecordHeader::decode(&header).frames);
        let body = len - pos - RECORD_HEADER_LEN;
        let need = frames * frame_len;
        if need > body {
            let partial = body / frame_len;
            walk.samples += partial;
            walk.len = pos + RECORD_HEADER_LEN + partial * frame_len;
            return Ok(walk);
        }
        reader.seek_relative(need as i64)?;
        pos += RECORD_HEADER_LEN + need;
        walk.samples += frames;
        walk.len = pos;
        walk.whole_samples = walk.samples;
        walk.whole_len = pos;
    }
    Ok(walk)
}

/// Build the summary of a loaded segment whose data may extend to `limit`.
fn summarize(
    file: &mut File,
    loaded: LoadedSegment,
    index: usize,
    limit: u64,
) -> Result<(SegmentSummary, Option<TruncationRecovered>), FormatError> {
    let available = limit - loaded.data_start;
    let commit = loaded.header.commit;
    let (walk, truncation) = match commit {
        Some(c) if c.data_len <= available => (
            RecordWalk {
                len: c.data_len,
                samples: c.sample_count,
                whole_len: c.data_len,
                whole_samples: c.sample_count,
            },
            None,
        ),
        _ => {
            let walk = walk_records(
                file,
                loaded.data_start,
                available,
                loaded.metadata.frame_len(),
            )?;
            let truncation = TruncationRecovered {
                segment: index,
                declared_samples: commit.map(|c| c.sample_count),
                valid_samples: walk.samples,
            };
            (walk, Some(truncation))
        }
    };

    let first_timestamp_ns = if walk.len >= RECORD_HEADER_LEN {
        let mut raw = [0u8; RECORD_HEADER_LEN as usize];
        read_at(file, loaded.data_start, &mut raw)?;
        RecordHeader::decode(&raw).timestamp_ns
    } else {
        0
    };

    let summary = SegmentSummary {
        index,
        offset: loaded.offset,
        data_start: loaded.data_start,
        data_len: walk.len,
        sample_count: walk.samples,
        first_timestamp_ns,
        metadata: loaded.metadata,
        commit,
        whole_len: walk.whole_len,
        whole_samples: walk.whole_samples,
    };
    Ok((summary, truncation))
}

/// Walk segments from the lead-in until data runs out or `len` is reached.
fn scan_segments(file: &mut File, len: u64) -> Result<Scan, FormatError> {
    let mut scan = Scan::default();
    let mut pos = LEAD_IN_LEN;
    while pos < len {
        let Some(loaded) = load_segment(file, pos, len)? else {
            let mut tag = [0u8; 4];
            if pos + 4 <= len {
                read_at(file, pos, &mut tag)?;
            }
            if &tag == INDEX_TAG {
                tracing::debug!(offset = pos, "Found index without a valid trailer");
            }
            scan.uncommitted_bytes = len - pos;
            break;
        };
        let (summary, truncation) = summarize(file, loaded, scan.segments.len(), len)?;
        pos = summary.data_start + summary.data_len;
        scan.segments.push(summary);
        if let Some(truncation) = truncation {
            scan.truncations.push(truncation);
            break;
        }
    }
    Ok(scan)
}

/// Load segments at the offsets listed in the index.
fn load_indexed(
    file: &mut File,
    entries: &[IndexEntry],
    index_offset: u64,
) -> Result<Scan, FormatError> {
    let mut scan = Scan::default();
    for (i, entry) in entries.iter().enumerate() {
        let corrupt = |reason: &str| FormatError::Corrupt {
            offset: entry.offset,
            reason: reason.to_string(),
        };
        let limit = entries.get(i + 1).map_or(index_offset, |next| next.offset);
        let loaded = load_segment(file, entry.offset, limit)?
            .ok_or_else(|| corrupt("index entry does not point at a segment"))?;
        let (summary, truncation) = summarize(file, loaded, i, limit)?;
        if truncation.is_some() || summary.sample_count != entry.sample_count {
            return Err(corrupt("segment disagrees with index"));
        }
        scan.segments.push(summary);
    }
    Ok(scan)
}
