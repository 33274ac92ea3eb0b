//! Hardware driver seam.
//!
//! The acquisition core never talks to a vendor API directly. It consumes two
//! small traits:
//!
//! - [`SampleSource`]: yields one [`SampleBlock`] per tick group at the
//!   configured sample rate. Failures surface as [`DriverFault`] and abort
//!   the session.
//! - [`DeviceCatalog`]: answers which physical channels exist, used by the
//!   [`ChannelRegistry`](crate::channel::ChannelRegistry) during resolution.
//!
//! [`mock::SimulatedDaq`] implements both for tests and for the CLI when no
//! hardware is attached.

pub mod mock;

use crate::channel::ChannelSet;
use crate::measurement_types::SampleBlock;
use std::sync::Arc;
use thiserror::Error;

/// Hardware feed failure. Fatal to the running session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverFault {
    /// Driver supplied description
    pub message: String,
}

impl DriverFault {
    /// Fault with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A physical input channel known to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalChannel {
    /// Identifier such as `ai0`
    pub id: String,
    /// Unit of the unscaled reading
    pub native_unit: String,
}

/// Device channel lookup collaborator.
pub trait DeviceCatalog: Send + Sync {
    /// Return the physical channel with this id, if the device has one.
    fn physical_channel(&self, id: &str) -> Option<PhysicalChannel>;
}

/// Fixed list of physical channels.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    channels: Vec<PhysicalChannel>,
}

impl StaticCatalog {
    /// Catalog over an explicit channel list
    pub fn new(channels: Vec<PhysicalChannel>) -> Self {
        Self { channels }
    }

    /// Known channels
    pub fn channels(&self) -> &[PhysicalChannel] {
        &self.channels
    }
}

impl DeviceCatalog for StaticCatalog {
    fn physical_channel(&self, id: &str) -> Option<PhysicalChannel> {
        self.channels.iter().find(|c| c.id == id).cloned()
    }
}

/// Producer side of the hardware interface.
///
/// Implementations are driven from a dedicated producer thread; `next_block`
/// may block until the next tick group is available.
pub trait SampleSource: Send {
    /// Next block of raw samples for the current channel set.
    fn next_block(&mut self) -> Result<SampleBlock, DriverFault>;

    /// Switch to a new channel set. Blocks returned afterwards must
    /// reference `channels`.
    fn reconfigure(&mut self, channels: Arc<ChannelSet>) -> Result<(), DriverFault>;
}
