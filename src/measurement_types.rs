//! Sample block type shared by the driver, buffer, writer, and live tap.

use crate::channel::ChannelSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Structural problems detected when building a [`SampleBlock`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlockShapeError {
    #[error("block has {got} channel arrays, channel set has {expected}")]
    ChannelCount { expected: usize, got: usize },

    #[error("channel {index} has {got} samples, expected {expected}")]
    RaggedChannel {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("sample rate must be positive and finite, got {0}")]
    SampleRate(f64),
}

/// One timestamped group of per-channel raw samples.
///
/// `timestamp` is monotonic time since session start at the first sample of
/// the block. All per-channel arrays have the same length and follow the
/// order of `channels`. Immutable once built.
#[derive(Debug, Clone)]
pub struct SampleBlock {
    timestamp: Duration,
    sample_rate: f64,
    channels: Arc<ChannelSet>,
    samples: Vec<Vec<f64>>,
}

impl SampleBlock {
    /// Build a block, checking it against the channel set.
    pub fn new(
        timestamp: Duration,
        sample_rate: f64,
        channels: Arc<ChannelSet>,
        samples: Vec<Vec<f64>>,
    ) -> Result<Self, BlockShapeError> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(BlockShapeError::SampleRate(sample_rate));
        }
        if samples.len() != channels.len() {
            return Err(BlockShapeError::ChannelCount {
                expected: channels.len(),
                got: samples.len(),
            });
        }
        let expected = samples.first().map_or(0, Vec::len);
        if let Some((index, ch)) = samples
            .iter()
            .enumerate()
            .find(|(_, ch)| ch.len() != expected)
        {
            return Err(BlockShapeError::RaggedChannel {
                index,
                expected,
                got: ch.len(),
            });
        }
        Ok(Self {
            timestamp,
            sample_rate,
            channels,
            samples,
        })
    }

    /// Start-of-block monotonic timestamp relative to session start
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Samples per second per channel
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Channel set this block was acquired with
    pub fn channels(&self) -> &Arc<ChannelSet> {
        &self.channels
    }

    /// Per-channel raw samples in channel order
    pub fn samples(&self) -> &[Vec<f64>] {
        &self.samples
    }

    /// Raw samples for one channel index
    pub fn channel(&self, index: usize) -> Option<&[f64]> {
        self.samples.get(index).map(Vec::as_slice)
    }

    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.samples.first().map_or(0, Vec::len)
    }

    /// Timestamp in seconds of the `i`-th frame of this block.
    pub fn frame_time(&self, i: usize) -> f64 {
        self.timestamp.as_secs_f64() + i as f64 / self.sample_rate
    }
}
