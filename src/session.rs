//! Acquisition session state.
//!
//! A [`Session`] is created when acquisition starts and dropped when it stops.
//! It owns the current [`ChannelSet`] snapshot; every block produced in the
//! session references that set, so channel ordering is fixed until an explicit
//! [`Session::reconfigure`].

use crate::channel::{ChannelDescriptor, ChannelSet, ConfigError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A running acquisition session.
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    sample_rate: f64,
    channels: Arc<ChannelSet>,
}

impl Session {
    /// Start a session now with the given resolved channels.
    pub fn start(channels: Vec<ChannelDescriptor>, sample_rate: f64) -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            sample_rate,
            channels: Arc::new(ChannelSet::new(channels)),
        };
        tracing::info!(
            session_id = %session.id,
            channels = session.channels.len(),
            sample_rate,
            "Session started"
        );
        session
    }

    /// Unique session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wall-clock start time
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Per-channel sample rate in Hz
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Current channel set
    pub fn channels(&self) -> &Arc<ChannelSet> {
        &self.channels
    }

    /// Monotonic time since the session started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Replace the channel set mid-session. Blocks built afterwards carry the
    /// new set, which makes the writer open a new segment.
    ///
    /// Display names must stay unique; on error the current set is kept.
    pub fn reconfigure(
        &mut self,
        channels: Vec<ChannelDescriptor>,
    ) -> Result<Arc<ChannelSet>, ConfigError> {
        self.channels = Arc::new(ChannelSet::try_new(channels)?);
        tracing::info!(
            session_id = %self.id,
            generation = self.channels.generation(),
            channels = self.channels.len(),
            "Session channel set changed"
        );
        Ok(Arc::clone(&self.channels))
    }
}
