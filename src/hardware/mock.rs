//! Mock Hardware Implementations
//!
//! Provides a simulated multi-channel analog input card for testing without
//! physical hardware.
//!
//! # Behaviour
//!
//! - Channels `ai0..aiN` with a native unit of volts
//! - Timestamps derived from the sample counter, so they are exact and
//!   monotonic regardless of host scheduling
//! - Optional real-time pacing (`std::thread::sleep`, the source runs on a
//!   dedicated producer thread)
//! - Optional fault injection after a number of blocks

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::ChannelSet;
use crate::hardware::{DriverFault, PhysicalChannel, SampleSource, StaticCatalog};
use crate::measurement_types::SampleBlock;

/// Signal generated on every channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    /// `amplitude * sin(2*pi*f*t + k*pi/4)` for channel index `k`
    Sine { frequency: f64, amplitude: f64 },
    /// Sample counter plus `1000 * k`; useful for exact assertions
    Ramp,
}

/// Simulated analog input card.
pub struct SimulatedDaq {
    channels: Arc<ChannelSet>,
    sample_rate: f64,
    samples_per_block: usize,
    waveform: Waveform,
    pace: bool,
    fail_after: Option<u64>,
    blocks_emitted: u64,
    frames_emitted: u64,
    started: Option<Instant>,
}

impl SimulatedDaq {
    /// Unpaced ramp source, mainly for tests.
    pub fn new(channels: Arc<ChannelSet>, sample_rate: f64, samples_per_block: usize) -> Self {
        Self {
            channels,
            sample_rate,
            samples_per_block: samples_per_block.max(1),
            waveform: Waveform::Ramp,
            pace: false,
            fail_after: None,
            blocks_emitted: 0,
            frames_emitted: 0,
            started: None,
        }
    }

    /// Catalog with `count` analog inputs named `ai0..`.
    pub fn catalog(count: usize) -> StaticCatalog {
        StaticCatalog::new(
            (0..count)
                .map(|i| PhysicalChannel {
                    id: format!("ai{i}"),
                    native_unit: "V".to_string(),
                })
                .collect(),
        )
    }

    /// Select the generated waveform
    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = waveform;
        self
    }

    /// Emit blocks at the configured sample rate instead of as fast as possible
    pub fn paced(mut self, pace: bool) -> Self {
        self.pace = pace;
        self
    }

    /// Return a fault instead of block number `blocks` (0-based)
    pub fn fail_after(mut self, blocks: u64) -> Self {
        self.fail_after = Some(blocks);
        self
    }

    /// Blocks produced so far
    pub fn blocks_emitted(&self) -> u64 {
        self.blocks_emitted
    }

    fn sample(&self, channel: usize, frame: u64) -> f64 {
        match self.waveform {
            Waveform::Ramp => frame as f64 + 1000.0 * channel as f64,
            Waveform::Sine {
                frequency,
                amplitude,
            } => {
                let t = frame as f64 / self.sample_rate;
                let phase = channel as f64 * std::f64::consts::FRAC_PI_4;
                amplitude * (TAU * frequency * t + phase).sin()
            }
        }
    }
}

impl SampleSource for SimulatedDaq {
    fn next_block(&mut self) -> Result<SampleBlock, DriverFault> {
        if self.fail_after == Some(self.blocks_emitted) {
            return Err(DriverFault::new(format!(
                "simulated fault after {} blocks",
                self.blocks_emitted
            )));
        }

        let started = *self.started.get_or_insert_with(Instant::now);
        let first_frame = self.frames_emitted;
        let frames = self.samples_per_block as u64;
        let timestamp = Duration::from_secs_f64(first_frame as f64 / self.sample_rate);

        if self.pace {
            let block_end =
                Duration::from_secs_f64((first_frame + frames) as f64 / self.sample_rate);
            if let Some(wait) = block_end.checked_sub(started.elapsed()) {
                std::thread::sleep(wait);
            }
        }

        let samples = (0..self.channels.len())
            .map(|ch| {
                (first_frame..first_frame + frames)
                    .map(|n| self.sample(ch, n))
                    .collect()
            })
            .collect();

        let block = SampleBlock::new(
            timestamp,
            self.sample_rate,
            Arc::clone(&self.channels),
            samples,
        )
        .map_err(|e| DriverFault::new(e.to_string()))?;

        self.blocks_emitted += 1;
        self.frames_emitted += frames;
        Ok(block)
    }

    fn reconfigure(&mut self, channels: Arc<ChannelSet>) -> Result<(), DriverFault> {
        if channels.is_empty() {
            return Err(DriverFault::new("cannot acquire with an empty channel set"));
        }
        self.channels = channels;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelDescriptor;
    use crate::hardware::DeviceCatalog;

    fn set(n: usize) -> Arc<ChannelSet> {
        Arc::new(ChannelSet::new(
            (0..n)
                .map(|i| ChannelDescriptor::new(format!("ai{i}"), format!("ch{i}")))
                .collect(),
        ))
    }

    #[test]
    fn ramp_blocks_are_contiguous() {
        let mut daq = SimulatedDaq::new(set(2), 10.0, 5);
        let first = daq.next_block().unwrap();
        let second = daq.next_block().unwrap();
        assert_eq!(first.channel(0).unwrap(), &[0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(second.channel(1).unwrap()[0], 1005.0);
        assert_eq!(second.timestamp(), Duration::from_millis(500));
    }

    #[test]
    fn fault_injection_stops_the_feed() {
        let mut daq = SimulatedDaq::new(set(1), 10.0, 1).fail_after(2);
        assert!(daq.next_block().is_ok());
        assert!(daq.next_block().is_ok());
        assert!(daq.next_block().is_err());
        assert_eq!(daq.blocks_emitted(), 2);
    }

    #[test]
    fn reconfigure_switches_channel_set() {
        let mut daq = SimulatedDaq::new(set(1), 10.0, 2);
        daq.reconfigure(set(3)).unwrap();
        assert_eq!(daq.next_block().unwrap().samples().len(), 3);
    }

    #[test]
    fn catalog_lists_analog_inputs() {
        let catalog = SimulatedDaq::catalog(2);
        assert!(catalog.physical_channel("ai1").is_some());
        assert!(catalog.physical_channel("ai2").is_none());
    }
}
