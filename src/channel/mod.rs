//! Channel descriptors, scale transforms, and configuration resolution.

pub mod registry;
pub mod scale;

pub use registry::{
    ChannelConfig, ChannelRegistry, ConfigError, InMemoryScaleStore, ScaleDefinition, ScaleStore,
};
pub use scale::ScaleTransform;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A resolved acquisition channel.
///
/// `display_name` is the join key between stored and configured channels and
/// is unique within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Hardware channel identifier, e.g. `ai0`
    pub physical_id: String,
    /// User-facing name, unique within a session
    pub display_name: String,
    /// Engineering unit after scaling
    pub unit: String,
    /// Raw-to-engineering transform
    #[serde(default)]
    pub scale: ScaleTransform,
}

impl ChannelDescriptor {
    /// Descriptor with an identity scale and a volt unit.
    pub fn new(physical_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            physical_id: physical_id.into(),
            display_name: display_name.into(),
            unit: "V".to_string(),
            scale: ScaleTransform::identity(),
        }
    }

    /// Set the engineering unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Set the scale transform
    pub fn with_scale(mut self, scale: ScaleTransform) -> Self {
        self.scale = scale;
        self
    }
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Immutable, ordered channel list shared by every block of a session
/// configuration. A reconfiguration produces a new set with a new generation.
#[derive(Debug, PartialEq)]
pub struct ChannelSet {
    generation: u64,
    channels: Vec<ChannelDescriptor>,
}

impl ChannelSet {
    /// Wrap a resolved channel list under a fresh generation id.
    pub fn new(channels: Vec<ChannelDescriptor>) -> Self {
        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            channels,
        }
    }

    /// Like [`new`](Self::new), but rejects an empty list and display names
    /// that are empty or repeated after trimming.
    pub fn try_new(channels: Vec<ChannelDescriptor>) -> Result<Self, ConfigError> {
        if channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        let mut seen = std::collections::HashSet::with_capacity(channels.len());
        for channel in &channels {
            let name = channel.display_name.trim();
            if name.is_empty() {
                return Err(ConfigError::EmptyDisplayName(channel.physical_id.clone()));
            }
            if !seen.insert(name) {
                return Err(ConfigError::DuplicateDisplayName(name.to_string()));
            }
        }
        Ok(Self::new(channels))
    }

    /// Process-unique identifier of this set
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Channels in acquisition order
    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.channels
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when the set holds no channels
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Position of a channel by display name
    pub fn position(&self, display_name: &str) -> Option<usize> {
        self.channels
            .iter()
            .position(|c| c.display_name == display_name)
    }

    /// Same channels in the same order, regardless of generation.
    pub fn same_layout(&self, other: &ChannelSet) -> bool {
        self.generation == other.generation || self.channels == other.channels
    }
}
