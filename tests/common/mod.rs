//! Shared helpers for integration tests.
#![allow(dead_code)]

use daq_log::channel::{ChannelDescriptor, ChannelSet};
use daq_log::measurement_types::SampleBlock;
use daq_log::storage::{FlushPolicy, WriterOptions};
use std::sync::Arc;
use std::time::Duration;

/// Writer options that only commit on explicit flush, rollover and close.
pub fn manual_flush() -> WriterOptions {
    WriterOptions {
        flush: FlushPolicy {
            every_blocks: None,
            interval: None,
        },
        segment_size_threshold: None,
        segment_duration: None,
    }
}

/// Writer options that commit after every block.
pub fn commit_every_block() -> WriterOptions {
    WriterOptions {
        flush: FlushPolicy {
            every_blocks: Some(1),
            interval: None,
        },
        ..manual_flush()
    }
}

/// Block with explicit per-channel samples.
pub fn block(
    channels: &Arc<ChannelSet>,
    timestamp_secs: f64,
    sample_rate: f64,
    samples: Vec<Vec<f64>>,
) -> SampleBlock {
    SampleBlock::new(
        Duration::from_secs_f64(timestamp_secs),
        sample_rate,
        Arc::clone(channels),
        samples,
    )
    .unwrap()
}

/// Ramp block: channel `c` holds `first + i + 1000 * c`.
pub fn ramp(channels: &Arc<ChannelSet>, first: u64, frames: u64, sample_rate: f64) -> SampleBlock {
    let samples = (0..channels.len())
        .map(|c| {
            (first..first + frames)
                .map(|n| n as f64 + 1000.0 * c as f64)
                .collect()
        })
        .collect();
    block(channels, first as f64 / sample_rate, sample_rate, samples)
}

/// Unscaled channels named after their physical ids.
pub fn plain_channels(ids: &[&str]) -> Vec<ChannelDescriptor> {
    ids.iter().map(|id| ChannelDescriptor::new(*id, *id)).collect()
}
