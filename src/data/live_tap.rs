//! Live visualization tap.
//!
//! A [`LiveFeedTap`] is a non-blocking secondary consumer of the
//! [`AcquisitionBuffer`](super::ring_buffer::AcquisitionBuffer). It applies
//! the same [`ScaleTransform::apply`](crate::channel::ScaleTransform::apply)
//! the log reader uses, so plotted and logged values are derived identically.
//! Its pace has no effect on the writer: it owns its own cursor and loses
//! blocks (drop-oldest) when it falls behind.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::ring_buffer::{BlockCursor, WouldBlock};
use crate::measurement_types::SampleBlock;

/// Scaled samples of one channel in a [`LiveFrame`].
#[derive(Debug, Clone, PartialEq)]
pub struct LiveChannel {
    /// Channel display name
    pub display_name: String,
    /// Engineering unit
    pub unit: String,
    /// `(seconds since session start, scaled value)` pairs
    pub samples: Vec<(f64, f64)>,
}

/// One scaled block for display.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveFrame {
    /// Start-of-block time in seconds since session start
    pub timestamp: f64,
    /// Channels in acquisition order
    pub channels: Vec<LiveChannel>,
    /// Blocks this tap lost immediately before this frame
    pub dropped_before: u64,
}

impl LiveFrame {
    /// Scale a raw block.
    pub fn from_block(block: &SampleBlock, dropped_before: u64) -> Self {
        let channels = block
            .channels()
            .channels()
            .iter()
            .zip(block.samples())
            .map(|(descriptor, raw)| LiveChannel {
                display_name: descriptor.display_name.clone(),
                unit: descriptor.unit.clone(),
                samples: raw
                    .iter()
                    .enumerate()
                    .map(|(i, &x)| (block.frame_time(i), descriptor.scale.apply(x)))
                    .collect(),
            })
            .collect();
        Self {
            timestamp: block.timestamp().as_secs_f64(),
            channels,
            dropped_before,
        }
    }

    /// Samples of one channel by display name
    pub fn channel(&self, display_name: &str) -> Option<&LiveChannel> {
        self.channels
            .iter()
            .find(|c| c.display_name == display_name)
    }
}

/// Result of a [`LiveFeedTap::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum LiveUpdate {
    /// Next unread block, scaled
    Frame(LiveFrame),
    /// Nothing new since the last poll
    NoNewData,
}

/// Pull-based scaled view of the acquisition stream.
pub struct LiveFeedTap {
    cursor: BlockCursor,
}

impl LiveFeedTap {
    /// Wrap a cursor subscribed to the acquisition buffer.
    pub fn new(cursor: BlockCursor) -> Self {
        Self { cursor }
    }

    /// Next unread block, scaled, or [`LiveUpdate::NoNewData`]. Never blocks.
    pub fn poll(&mut self) -> LiveUpdate {
        let dropped_before = self.cursor.dropped_blocks();
        match self.cursor.pull() {
            Ok(block) => {
                let dropped = self.cursor.dropped_blocks() - dropped_before;
                LiveUpdate::Frame(LiveFrame::from_block(&block, dropped))
            }
            Err(WouldBlock) => LiveUpdate::NoNewData,
        }
    }

    /// Total blocks this tap has lost to backpressure
    pub fn dropped_blocks(&self) -> u64 {
        self.cursor.dropped_blocks()
    }

    /// True when acquisition ended and every retained block was seen
    pub fn is_finished(&self) -> bool {
        self.cursor.is_drained()
    }
}

/// Rolling per-channel history for plotting, e.g. the last 60 seconds.
#[derive(Debug, Clone)]
pub struct LiveWindow {
    max_samples: usize,
    order: Vec<String>,
    channels: HashMap<String, VecDeque<(f64, f64)>>,
}

impl LiveWindow {
    /// Window keeping at most `max_samples` per channel.
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples: max_samples.max(1),
            order: Vec::new(),
            channels: HashMap::new(),
        }
    }

    /// Window covering `seconds` at `sample_rate`.
    pub fn for_duration(seconds: f64, sample_rate: f64) -> Self {
        Self::new((seconds * sample_rate).ceil() as usize)
    }

    /// Append a frame, evicting the oldest samples beyond capacity.
    pub fn push(&mut self, frame: &LiveFrame) {
        let max_samples = self.max_samples;
        for channel in &frame.channels {
            if !self.channels.contains_key(&channel.display_name) {
                self.order.push(channel.display_name.clone());
            }
            let history = self
                .channels
                .entry(channel.display_name.clone())
                .or_insert_with(|| VecDeque::with_capacity(max_samples));
            history.extend(channel.samples.iter().copied());
            let excess = history.len().saturating_sub(self.max_samples);
            history.drain(..excess);
        }
    }

    /// History for one channel, oldest first
    pub fn series(&self, display_name: &str) -> Option<&VecDeque<(f64, f64)>> {
        self.channels.get(display_name)
    }

    /// Channel names in first-seen order
    pub fn channel_names(&self) -> &[String] {
        &self.order
    }
}

/// Counters for a forwarding task.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    /// Frames delivered to the receiver
    pub frames_sent: AtomicU64,
    /// Frames discarded because the receiver's channel was full
    pub frames_dropped: AtomicU64,
}

/// Forward frames from a tap to an async channel, e.g. a UI task.
///
/// Uses `try_send`, so a slow receiver loses frames instead of slowing the
/// tap. The task ends when acquisition is finished or the receiver is closed.
pub fn spawn_forwarder(
    mut tap: LiveFeedTap,
    sender: mpsc::Sender<LiveFrame>,
    poll_interval: Duration,
) -> (tokio::task::JoinHandle<()>, Arc<ForwarderStats>) {
    let stats = Arc::new(ForwarderStats::default());
    let task_stats = Arc::clone(&stats);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            match tap.poll() {
                LiveUpdate::Frame(frame) => match sender.try_send(frame) {
                    Ok(()) => {
                        task_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        task_stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                },
                LiveUpdate::NoNewData if tap.is_finished() => break,
                LiveUpdate::NoNewData => {
                    ticker.tick().await;
                }
            }
        }
        tracing::debug!(
            sent = task_stats.frames_sent.load(Ordering::Relaxed),
            dropped = task_stats.frames_dropped.load(Ordering::Relaxed),
            "Live forwarder finished"
        );
    });
    (handle, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelDescriptor, ChannelSet, ScaleTransform};
    use crate::data::ring_buffer::AcquisitionBuffer;

    fn scenario_set() -> Arc<ChannelSet> {
        Arc::new(ChannelSet::new(vec![
            ChannelDescriptor::new("ai0", "Temp").with_scale(ScaleTransform::Linear {
                gain: 2.0,
                offset: 1.0,
            }),
            ChannelDescriptor::new("ai1", "Pressure"),
        ]))
    }

    fn scenario_block() -> SampleBlock {
        SampleBlock::new(
            Duration::ZERO,
            1.0,
            scenario_set(),
            vec![vec![1.0, 2.0], vec![10.0, 20.0]],
        )
        .unwrap()
    }

    #[test]
    fn poll_scales_like_the_reader() {
        let (mut producer, buffer) = AcquisitionBuffer::new(4);
        let mut tap = LiveFeedTap::new(buffer.subscribe("live"));
        assert_eq!(tap.poll(), LiveUpdate::NoNewData);

        producer.push(scenario_block());
        let LiveUpdate::Frame(frame) = tap.poll() else {
            panic!("expected a frame");
        };
        let temp: Vec<f64> = frame.channel("Temp").unwrap().samples.iter().map(|s| s.1).collect();
        let pressure: Vec<f64> = frame
            .channel("Pressure")
            .unwrap()
            .samples
            .iter()
            .map(|s| s.1)
            .collect();
        assert_eq!(temp, vec![3.0, 5.0]);
        assert_eq!(pressure, vec![10.0, 20.0]);
        assert_eq!(frame.channel("Temp").unwrap().samples[1].0, 1.0);
    }

    #[test]
    fn poll_reports_drops_before_frame() {
        let (mut producer, buffer) = AcquisitionBuffer::new(1);
        let mut tap = LiveFeedTap::new(buffer.subscribe("live"));
        producer.push(scenario_block());
        producer.push(scenario_block());
        producer.push(scenario_block());
        let LiveUpdate::Frame(frame) = tap.poll() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.dropped_before, 2);
        assert_eq!(tap.dropped_blocks(), 2);
    }

    #[test]
    fn window_keeps_latest_samples() {
        let mut window = LiveWindow::new(3);
        let frame = LiveFrame::from_block(&scenario_block(), 0);
        window.push(&frame);
        window.push(&frame);
        let temp: Vec<f64> = window.series("Temp").unwrap().iter().map(|s| s.1).collect();
        assert_eq!(temp, vec![5.0, 3.0, 5.0]);
        assert_eq!(window.channel_names(), &["Temp".to_string(), "Pressure".to_string()]);
    }

    #[tokio::test]
    async fn forwarder_delivers_until_acquisition_ends() {
        let (mut producer, buffer) = AcquisitionBuffer::new(8);
        let tap = LiveFeedTap::new(buffer.subscribe("ui"));
        let (tx, mut rx) = mpsc::channel(8);
        let (handle, stats) = spawn_forwarder(tap, tx, Duration::from_millis(1));

        producer.push(scenario_block());
        producer.push(scenario_block());
        drop(producer);

        handle.await.unwrap();
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
        assert_eq!(stats.frames_sent.load(Ordering::Relaxed), 2);
    }
}
