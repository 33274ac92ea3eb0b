//! Segmented, append-only log storage.
//!
//! A `.dqlog` file is a lead-in followed by a sequence of self-describing
//! segments, each bound to one fixed [`ChannelSet`](crate::channel::ChannelSet).
//! [`LogWriter`] appends and commits segments; [`LogReader`] opens files,
//! including files still being written or truncated by a crash.
//!
//! See [`format`] for the byte layout.

pub mod format;
pub mod reader;
pub mod writer;

#[cfg(feature = "storage_csv")]
pub mod csv_export;

pub use format::{CommitRecord, FormatError, IndexEntry, SegmentMetadata, FORMAT_VERSION};
pub use reader::{
    ChannelStream, LogHandle, LogReader, NameDiscrepancy, ReadRange, ScaledSample, SegmentSummary,
};
pub use writer::{FlushPolicy, LogWriter, WriterOptions, WriterState, WriterSummary};

/// Warning raised when the final segment held fewer whole frames than its
/// commit record declared. Never an error: the valid prefix is still read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationRecovered {
    /// Segment position within the file
    pub segment: usize,
    /// Samples per channel the commit record claimed, `None` if the commit
    /// record itself was damaged
    pub declared_samples: Option<u64>,
    /// Samples per channel actually recoverable
    pub valid_samples: u64,
}

impl std::fmt::Display for TruncationRecovered {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.declared_samples {
            Some(declared) => write!(
                f,
                "segment {} truncated: {} of {} declared samples recovered",
                self.segment, self.valid_samples, declared
            ),
            None => write!(
                f,
                "segment {} has a damaged commit record: {} samples recovered",
                self.segment, self.valid_samples
            ),
        }
    }
}
