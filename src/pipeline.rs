//! Acquisition pipeline.
//!
//! ```text
//! SampleSource --(producer thread)--> AcquisitionBuffer --(writer thread)--> LogWriter
//!                                             |
//!                                             +--> LiveFeedTap (any number)
//! ```
//!
//! The producer thread never waits on the writer: it publishes into the
//! lock-free ring and moves on. The writer thread polls its own cursor,
//! backing off while idle and flushing when the flush interval elapses with
//! nothing new to write.
//!
//! A driver fault ends acquisition; the writer still drains what the buffer
//! retains before closing. A writer I/O failure stops the producer. Both
//! surface from [`RunningSession::stop`] as [`DaqError::SessionAborted`].

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

use crate::channel::{ChannelDescriptor, ChannelSet};
use crate::data::live_tap::LiveFeedTap;
use crate::data::ring_buffer::{
    AcquisitionBuffer, BlockCursor, BlockProducer, DroppedBlock, WouldBlock,
};
use crate::error::{AppResult, DaqError, FaultKind};
use crate::hardware::{DriverFault, SampleSource};
use crate::session::Session;
use crate::storage::{LogWriter, WriterSummary};

/// Runtime parameters of a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    /// Ring capacity in blocks
    pub buffer_depth: usize,
    /// Writer sleep while no block is available
    pub idle_backoff: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            buffer_depth: 64,
            idle_backoff: Duration::from_millis(2),
        }
    }
}

/// Outcome of a completed session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub path: PathBuf,
    /// Blocks published by the producer
    pub blocks_acquired: u64,
    /// Blocks the writer lost to backpressure
    pub writer_dropped_blocks: u64,
    /// Sequence ranges missing from the log
    pub writer_gaps: Vec<DroppedBlock>,
    /// Durably committed samples per channel in the file
    pub committed_samples: u64,
    pub segments: usize,
    pub elapsed: Duration,
}

struct WriterFailure {
    error: DaqError,
    durable_samples: u64,
}

struct WriterOutcome {
    summary: WriterSummary,
    dropped_blocks: u64,
}

/// Starts acquisition sessions.
pub struct Pipeline;

impl Pipeline {
    /// Open the session's first segment and start the producer and writer
    /// threads.
    pub fn start<S>(
        settings: PipelineSettings,
        source: S,
        mut writer: LogWriter,
        session: Session,
    ) -> AppResult<RunningSession>
    where
        S: SampleSource + 'static,
    {
        if settings.buffer_depth == 0 {
            return Err(DaqError::Configuration(
                "buffer depth must be at least one block".into(),
            ));
        }
        writer.start_session(&session)?;

        let (producer, buffer) = AcquisitionBuffer::new(settings.buffer_depth);
        let cursor = buffer.subscribe("writer");
        let stop = Arc::new(AtomicBool::new(false));
        let (reconfigure_tx, reconfigure_rx) = mpsc::channel();

        let producer_stop = Arc::clone(&stop);
        let producer = thread::Builder::new()
            .name("daq-producer".into())
            .spawn(move || run_producer(source, producer, reconfigure_rx, producer_stop))?;

        let writer_stop = Arc::clone(&stop);
        let gaps = Arc::new(Mutex::new(Vec::new()));
        let writer_gaps = Arc::clone(&gaps);
        let idle_backoff = settings.idle_backoff;
        let writer = thread::Builder::new()
            .name("daq-writer".into())
            .spawn(move || run_writer(writer, cursor, idle_backoff, writer_stop, writer_gaps))?;

        tracing::info!(
            session_id = %session.id(),
            buffer_depth = settings.buffer_depth,
            "Acquisition pipeline started"
        );
        Ok(RunningSession {
            session,
            buffer,
            stop,
            reconfigure_tx,
            gaps,
            producer: Some(producer),
            writer: Some(writer),
        })
    }
}

fn run_producer<S: SampleSource>(
    mut source: S,
    mut producer: BlockProducer,
    reconfigure: mpsc::Receiver<Arc<ChannelSet>>,
    stop: Arc<AtomicBool>,
) -> Result<u64, DriverFault> {
    let mut blocks = 0u64;
    while !stop.load(Ordering::Acquire) {
        while let Ok(channels) = reconfigure.try_recv() {
            source.reconfigure(channels).inspect_err(|fault| {
                tracing::error!(error = %fault, "Driver rejected channel change");
            })?;
        }
        match source.next_block() {
            Ok(block) => {
                producer.push(block);
                blocks += 1;
            }
            Err(fault) => {
                tracing::error!(blocks, error = %fault, "Driver fault, stopping acquisition");
                return Err(fault);
            }
        }
    }
    tracing::debug!(blocks, "Producer stopped");
    Ok(blocks)
}

fn run_writer(
    mut writer: LogWriter,
    mut cursor: BlockCursor,
    idle_backoff: Duration,
    stop: Arc<AtomicBool>,
    gaps: Arc<Mutex<Vec<DroppedBlock>>>,
) -> Result<WriterOutcome, WriterFailure> {
    let fail = |writer: &LogWriter, error: DaqError| {
        stop.store(true, Ordering::Release);
        WriterFailure {
            durable_samples: writer.committed_samples(),
            error,
        }
    };

    loop {
        match cursor.pull() {
            Ok(block) => {
                if let Err(error) = writer.write_block(&block) {
                    return Err(fail(&writer, error));
                }
            }
            Err(WouldBlock) if cursor.is_drained() => break,
            Err(WouldBlock) => {
                if let Err(error) = writer.flush_if_due() {
                    return Err(fail(&writer, error));
                }
                thread::sleep(idle_backoff);
            }
        }
        let events = cursor.take_drop_events();
        if !events.is_empty() {
            for gap in &events {
                tracing::warn!(
                    first_sequence = gap.first_sequence,
                    count = gap.count,
                    "Writer fell behind; blocks missing from log"
                );
            }
            gaps.lock().extend(events);
        }
    }

    let durable_samples = writer.committed_samples();
    let dropped_blocks = cursor.dropped_blocks();
    writer
        .close()
        .map(|summary| WriterOutcome {
            summary,
            dropped_blocks,
        })
        .map_err(|error| WriterFailure {
            error,
            durable_samples,
        })
}

/// Handle to an active session.
pub struct RunningSession {
    session: Session,
    buffer: Arc<AcquisitionBuffer>,
    stop: Arc<AtomicBool>,
    reconfigure_tx: mpsc::Sender<Arc<ChannelSet>>,
    gaps: Arc<Mutex<Vec<DroppedBlock>>>,
    producer: Option<JoinHandle<Result<u64, DriverFault>>>,
    writer: Option<JoinHandle<Result<WriterOutcome, WriterFailure>>>,
}

impl RunningSession {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn buffer(&self) -> &Arc<AcquisitionBuffer> {
        &self.buffer
    }

    /// Blocks the writer has lost so far
    pub fn writer_gaps(&self) -> Vec<DroppedBlock> {
        self.gaps.lock().clone()
    }

    /// Live view starting at the next published block.
    pub fn tap(&self, name: impl Into<String>) -> LiveFeedTap {
        LiveFeedTap::new(self.buffer.subscribe(name))
    }

    /// Switch the acquisition to a new channel set. Blocks of the new set
    /// land in a new segment. An invalid channel list leaves the running
    /// acquisition untouched.
    pub fn reconfigure(&mut self, channels: Vec<ChannelDescriptor>) -> AppResult<Arc<ChannelSet>> {
        let set = self.session.reconfigure(channels)?;
        self.reconfigure_tx
            .send(Arc::clone(&set))
            .map_err(|_| DaqError::InvalidState("acquisition already stopped".into()))?;
        Ok(set)
    }

    /// True once either thread ended on its own, e.g. after a fault.
    pub fn has_stopped(&self) -> bool {
        self.producer.as_ref().map_or(true, JoinHandle::is_finished)
            || self.writer.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop acquisition, drain the buffer into the log and close the file.
    pub fn stop(mut self) -> AppResult<SessionSummary> {
        self.stop.store(true, Ordering::Release);
        let producer = self
            .producer
            .take()
            .map(JoinHandle::join)
            .transpose()
            .map_err(|_| DaqError::InvalidState("producer thread panicked".into()))?;
        let writer = self
            .writer
            .take()
            .map(JoinHandle::join)
            .transpose()
            .map_err(|_| DaqError::InvalidState("writer thread panicked".into()))?;
        let (Some(producer), Some(writer)) = (producer, writer) else {
            return Err(DaqError::InvalidState("session already stopped".into()));
        };

        let outcome = match writer {
            Ok(outcome) => outcome,
            Err(failure) => {
                let err = DaqError::SessionAborted {
                    kind: failure.error.fault_kind().unwrap_or(FaultKind::Io),
                    durable_samples: failure.durable_samples,
                    message: failure.error.to_string(),
                };
                tracing::error!(session_id = %self.session.id(), error = %err, "Session aborted");
                return Err(err);
            }
        };
        let blocks_acquired = match producer {
            Ok(blocks) => blocks,
            Err(fault) => {
                let err = DaqError::SessionAborted {
                    kind: FaultKind::Driver,
                    durable_samples: outcome.summary.committed_samples,
                    message: fault.to_string(),
                };
                tracing::error!(session_id = %self.session.id(), error = %err, "Session aborted");
                return Err(err);
            }
        };

        let summary = SessionSummary {
            session_id: self.session.id(),
            path: outcome.summary.path,
            blocks_acquired,
            writer_dropped_blocks: outcome.dropped_blocks,
            writer_gaps: self.writer_gaps(),
            committed_samples: outcome.summary.committed_samples,
            segments: outcome.summary.segments,
            elapsed: self.session.elapsed(),
        };
        tracing::info!(
            session_id = %summary.session_id,
            blocks = summary.blocks_acquired,
            samples = summary.committed_samples,
            dropped = summary.writer_dropped_blocks,
            "Session complete"
        );
        Ok(summary)
    }
}

impl Drop for RunningSession {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
