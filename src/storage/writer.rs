//! Append-only segment writer.
//!
//! The writer owns the file exclusively. Block records are appended through a
//! buffered handle; the commit record in the open segment's header is the
//! only thing ever rewritten, and only after the data it covers has been
//! synced to disk. A file left behind by a crash therefore always reads back
//! up to the last successful flush.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::format::{
    encode_index, encode_lead_in, encode_segment_header, CommitRecord, IndexEntry, RecordHeader,
    SegmentMetadata, COMMIT_OFFSET, FORMAT_VERSION, LAYOUT_INTERLEAVED, LEAD_IN_LEN,
};
use super::reader::LogReader;
use crate::channel::ChannelSet;
use crate::error::{AppResult, DaqError};
use crate::measurement_types::SampleBlock;
use crate::session::Session;

/// When the writer makes appended data durable.
///
/// Either trigger fires a flush; with both unset data is committed only on
/// rollover, [`LogWriter::flush`] and [`LogWriter::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushPolicy {
    /// Flush after this many block records
    pub every_blocks: Option<u32>,
    /// Flush when this much time passed since the last flush
    #[serde(with = "humantime_serde")]
    pub interval: Option<Duration>,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            every_blocks: None,
            interval: Some(Duration::from_secs(1)),
        }
    }
}

impl FlushPolicy {
    fn is_due(&self, blocks_since_flush: u32, since_flush: Duration) -> bool {
        self.every_blocks
            .is_some_and(|n| n > 0 && blocks_since_flush >= n)
            || self
                .interval
                .is_some_and(|interval| blocks_since_flush > 0 && since_flush >= interval)
    }
}

/// Writer tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriterOptions {
    pub flush: FlushPolicy,
    /// Start a new segment once the data region reaches this many bytes
    pub segment_size_threshold: Option<u64>,
    /// Start a new segment once it spans this much acquisition time
    pub segment_duration: Option<Duration>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            flush: FlushPolicy::default(),
            segment_size_threshold: Some(256 * 1024 * 1024),
            segment_duration: None,
        }
    }
}

/// Lifecycle of a [`LogWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Lead-in written, no session started
    Idle,
    /// A segment accepts block records
    SegmentOpen,
    /// Pending data is being synced and committed
    Flushing,
    /// Index written; no further writes
    Closed,
    /// An I/O error occurred; no further writes
    Failed,
}

/// Result of [`LogWriter::close`].
#[derive(Debug, Clone, PartialEq)]
pub struct WriterSummary {
    pub path: PathBuf,
    /// Segments in the file, including ones from before an append
    pub segments: usize,
    /// Committed samples per channel across all segments
    pub committed_samples: u64,
    /// Final file length
    pub file_len: u64,
    /// Flushes performed by this writer
    pub flushes: u64,
}

struct SessionInfo {
    id: Uuid,
    started_at: DateTime<Utc>,
}

struct OpenSegment {
    offset: u64,
    index: u32,
    channels: Arc<ChannelSet>,
    sample_rate: f64,
    sample_count: u64,
    data_len: u64,
    committed: CommitRecord,
    first_timestamp: Option<Duration>,
}

impl OpenSegment {
    fn index_entry(&self) -> IndexEntry {
        IndexEntry {
            offset: self.offset,
            sample_count: self.committed.sample_count,
            first_timestamp_ns: self
                .first_timestamp
                .map(|t| t.as_nanos() as u64)
                .unwrap_or(0),
        }
    }
}

/// Appends sessions to a `.dqlog` file.
pub struct LogWriter {
    path: PathBuf,
    file: BufWriter<File>,
    options: WriterOptions,
    state: WriterState,
    session: Option<SessionInfo>,
    segment: Option<OpenSegment>,
    finished: Vec<IndexEntry>,
    end_offset: u64,
    committed_before: u64,
    blocks_since_flush: u32,
    last_flush: Instant,
    flushes: u64,
    record_buf: BytesMut,
}

impl LogWriter {
    /// Create (or truncate) `path` and write the lead-in.
    pub fn create(path: impl AsRef<Path>, options: WriterOptions) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&encode_lead_in())?;
        file.sync_all()?;
        tracing::info!(path = %path.display(), version = FORMAT_VERSION, "Created log file");
        Ok(Self::from_parts(path, file, options, LEAD_IN_LEN, Vec::new()))
    }

    /// Continue an existing log file.
    ///
    /// The trailing index and any uncommitted bytes are removed; existing
    /// segments are kept and listed again in the new index. A final segment
    /// recovered from truncation is cut back to its last whole record and its
    /// commit record rewritten to match.
    pub fn append(path: impl AsRef<Path>, options: WriterOptions) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let handle = LogReader::open(&path)?;
        if handle.version() != FORMAT_VERSION {
            return Err(DaqError::InvalidState(format!(
                "cannot append to format version {}",
                handle.version()
            )));
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut finished = Vec::with_capacity(handle.segments().len());
        let mut end_offset = LEAD_IN_LEN;
        for segment in handle.segments() {
            let (whole_len, whole_samples) = segment.whole_records();
            let commit = CommitRecord {
                sample_count: whole_samples,
                data_len: whole_len,
            };
            if segment.commit() != Some(commit) {
                file.seek(SeekFrom::Start(segment.offset + COMMIT_OFFSET))?;
                file.write_all(&commit.encode())?;
                tracing::warn!(
                    segment = segment.index,
                    samples = whole_samples,
                    "Repaired commit record of recovered segment"
                );
            }
            finished.push(IndexEntry {
                offset: segment.offset,
                sample_count: whole_samples,
                first_timestamp_ns: segment.first_timestamp_ns,
            });
            end_offset = segment.data_start + whole_len;
        }
        file.set_len(end_offset)?;
        file.seek(SeekFrom::Start(end_offset))?;
        file.sync_all()?;

        tracing::info!(
            path = %path.display(),
            segments = finished.len(),
            "Appending to log file"
        );
        Ok(Self::from_parts(path, file, options, end_offset, finished))
    }

    fn from_parts(
        path: PathBuf,
        file: File,
        options: WriterOptions,
        end_offset: u64,
        finished: Vec<IndexEntry>,
    ) -> Self {
        let committed_before = finished.iter().map(|e| e.sample_count).sum();
        Self {
            path,
            file: BufWriter::with_capacity(1 << 16, file),
            options,
            state: WriterState::Idle,
            session: None,
            segment: None,
            finished,
            end_offset,
            committed_before,
            blocks_since_flush: 0,
            last_flush: Instant::now(),
            flushes: 0,
            record_buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Samples per channel durably committed by this file so far
    pub fn committed_samples(&self) -> u64 {
        self.committed_before
            + self
                .segment
                .as_ref()
                .map(|s| s.committed.sample_count)
                .unwrap_or(0)
    }

    /// Segments written so far, including the open one
    pub fn segment_count(&self) -> usize {
        self.finished.len() + usize::from(self.segment.is_some())
    }

    /// Open a segment for `session`'s current channel set.
    ///
    /// A segment still open from a previous session is finalized first.
    pub fn start_session(&mut self, session: &Session) -> AppResult<()> {
        self.ensure_writable()?;
        if self.segment.is_some() {
            self.finish_segment()?;
        }
        self.session = Some(SessionInfo {
            id: session.id(),
            started_at: session.started_at(),
        });
        self.open_segment(Arc::clone(session.channels()), session.sample_rate())
    }

    /// Append one block, rolling over and flushing as configured.
    pub fn write_block(&mut self, block: &SampleBlock) -> AppResult<()> {
        self.ensure_writable()?;
        let Some(segment) = self.segment.as_ref() else {
            return Err(DaqError::InvalidState(
                "write_block called before start_session".into(),
            ));
        };

        if let Some(reason) = self.rollover_reason(segment, block) {
            tracing::info!(
                segment = segment.index,
                reason,
                samples = segment.sample_count,
                "Rolling over to a new segment"
            );
            self.rollover(Arc::clone(block.channels()), block.sample_rate())?;
        }

        self.encode_record(block);
        if let Err(err) = self.file.write_all(&self.record_buf) {
            return Err(self.fail(err));
        }
        let written = self.record_buf.len() as u64;
        self.end_offset += written;
        if let Some(segment) = self.segment.as_mut() {
            segment.sample_count += block.frames() as u64;
            segment.data_len += written;
            segment.first_timestamp.get_or_insert(block.timestamp());
        }
        self.blocks_since_flush += 1;

        if self
            .options
            .flush
            .is_due(self.blocks_since_flush, self.last_flush.elapsed())
        {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush if the interval elapsed, e.g. while the writer is idle.
    pub fn flush_if_due(&mut self) -> AppResult<bool> {
        if self.segment.is_some()
            && self
                .options
                .flush
                .is_due(self.blocks_since_flush, self.last_flush.elapsed())
        {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Sync pending data and commit it.
    pub fn flush(&mut self) -> AppResult<()> {
        self.ensure_writable()?;
        self.flush_inner().map_err(|err| self.fail(err))
    }

    /// Finalize the open segment, write the index and trailer.
    pub fn close(mut self) -> AppResult<WriterSummary> {
        self.ensure_writable()?;
        if self.segment.is_some() {
            self.finish_segment()?;
        }
        let index_offset = self.end_offset;
        let index = encode_index(&self.finished, index_offset);
        let result = self
            .file
            .write_all(&index)
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.get_ref().sync_all());
        if let Err(err) = result {
            return Err(self.fail(err));
        }
        self.end_offset += index.len() as u64;
        self.state = WriterState::Closed;

        let summary = WriterSummary {
            path: self.path.clone(),
            segments: self.finished.len(),
            committed_samples: self.committed_before,
            file_len: self.end_offset,
            flushes: self.flushes,
        };
        tracing::info!(
            path = %summary.path.display(),
            segments = summary.segments,
            samples = summary.committed_samples,
            bytes = summary.file_len,
            "Closed log file"
        );
        Ok(summary)
    }

    fn ensure_writable(&self) -> AppResult<()> {
        match self.state {
            WriterState::Closed | WriterState::Failed => Err(DaqError::InvalidState(format!(
                "log writer is {:?}",
                self.state
            ))),
            _ => Ok(()),
        }
    }

    fn fail(&mut self, err: impl Into<DaqError>) -> DaqError {
        let err = err.into();
        self.state = WriterState::Failed;
        tracing::error!(
            path = %self.path.display(),
            committed = self.committed_samples(),
            error = %err,
            "Log writer failed"
        );
        err
    }

    /// Point the writer at another file, e.g. one that rejects writes.
    #[cfg(test)]
    pub(crate) fn replace_file(&mut self, file: File) {
        *self.file.get_mut() = file;
    }

    fn rollover_reason(&self, segment: &OpenSegment, block: &SampleBlock) -> Option<&'static str> {
        if !segment.channels.same_layout(block.channels()) {
            return Some("channel set changed");
        }
        if segment.sample_rate != block.sample_rate() {
            return Some("sample rate changed");
        }
        if segment.sample_count == 0 {
            return None;
        }
        if self
            .options
            .segment_size_threshold
            .is_some_and(|limit| segment.data_len >= limit)
        {
            return Some("size threshold reached");
        }
        let span = segment
            .first_timestamp
            .map(|first| block.timestamp().saturating_sub(first));
        match (self.options.segment_duration, span) {
            (Some(limit), Some(span)) if span >= limit => Some("duration threshold reached"),
            _ => None,
        }
    }

    fn rollover(&mut self, channels: Arc<ChannelSet>, sample_rate: f64) -> AppResult<()> {
        let empty = self.segment.as_ref().is_some_and(|s| s.sample_count == 0);
        if empty {
            self.discard_empty_segment()?;
        } else {
            self.finish_segment()?;
        }
        self.open_segment(channels, sample_rate)
    }

    /// Replace an open segment that never received data.
    fn discard_empty_segment(&mut self) -> AppResult<()> {
        let Some(segment) = self.segment.take() else {
            return Ok(());
        };
        let result = self.file.flush().and_then(|()| {
            let file = self.file.get_mut();
            file.set_len(segment.offset)?;
            file.seek(SeekFrom::Start(segment.offset)).map(|_| ())
        });
        if let Err(err) = result {
            return Err(self.fail(err));
        }
        self.end_offset = segment.offset;
        Ok(())
    }

    fn open_segment(&mut self, channels: Arc<ChannelSet>, sample_rate: f64) -> AppResult<()> {
        let Some(session) = self.session.as_ref() else {
            return Err(DaqError::InvalidState("no session started".into()));
        };
        let index = self.finished.len() as u32;
        let metadata = SegmentMetadata {
            session_id: session.id,
            session_start: session.started_at,
            sample_rate,
            segment_index: index,
            layout: LAYOUT_INTERLEAVED.to_string(),
            channels: channels.channels().to_vec(),
        };
        let json = serde_json::to_vec(&metadata).map_err(super::FormatError::from)?;
        let header = encode_segment_header(&json, CommitRecord::default());
        if let Err(err) = self.file.write_all(&header) {
            return Err(self.fail(err));
        }

        let offset = self.end_offset;
        self.end_offset += header.len() as u64;
        tracing::info!(
            segment = index,
            offset,
            channels = channels.len(),
            sample_rate,
            "Opened segment"
        );
        self.segment = Some(OpenSegment {
            offset,
            index,
            channels,
            sample_rate,
            sample_count: 0,
            data_len: 0,
            committed: CommitRecord::default(),
            first_timestamp: None,
        });
        self.state = WriterState::SegmentOpen;
        Ok(())
    }

    fn finish_segment(&mut self) -> AppResult<()> {
        self.flush_inner().map_err(|err| self.fail(err))?;
        if let Some(segment) = self.segment.take() {
            let entry = segment.index_entry();
            self.committed_before += entry.sample_count;
            self.finished.push(entry);
        }
        Ok(())
    }

    fn flush_inner(&mut self) -> std::io::Result<()> {
        let Some(segment) = self.segment.as_mut() else {
            return self.file.flush();
        };
        self.state = WriterState::Flushing;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;

        let commit = CommitRecord {
            sample_count: segment.sample_count,
            data_len: segment.data_len,
        };
        if commit != segment.committed {
            let file = self.file.get_mut();
            file.seek(SeekFrom::Start(segment.offset + COMMIT_OFFSET))?;
            file.write_all(&commit.encode())?;
            file.seek(SeekFrom::Start(self.end_offset))?;
            file.sync_data()?;
            segment.committed = commit;
        }

        self.state = WriterState::SegmentOpen;
        self.blocks_since_flush = 0;
        self.last_flush = Instant::now();
        self.flushes += 1;
        tracing::debug!(
            segment = segment.index,
            samples = commit.sample_count,
            bytes = commit.data_len,
            "Committed segment data"
        );
        Ok(())
    }

    fn encode_record(&mut self, block: &SampleBlock) {
        let frames = block.frames();
        self.record_buf.clear();
        RecordHeader {
            timestamp_ns: block.timestamp().as_nanos() as u64,
            frames: frames as u32,
        }
        .encode_into(&mut self.record_buf);
        for frame in 0..frames {
            for channel in block.samples() {
                self.record_buf.put_f64_le(channel[frame]);
            }
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if self.state == WriterState::SegmentOpen {
            tracing::warn!(
                path = %self.path.display(),
                "Log writer dropped without close; committing pending data"
            );
            if let Err(err) = self.flush_inner() {
                tracing::error!(error = %err, "Final commit failed");
            }
        }
    }
}
