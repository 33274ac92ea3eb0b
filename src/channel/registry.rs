//! Channel configuration resolution.
//!
//! [`ChannelRegistry`] turns the configured channel list into
//! [`ChannelDescriptor`]s. It consults two collaborators that are injected at
//! construction time rather than read from global state:
//!
//! - a [`DeviceCatalog`] that knows which physical channels exist, and
//! - a [`ScaleStore`] that holds named calibration scales.
//!
//! Resolution is pure: it never mutates either collaborator. Display names
//! are checked for uniqueness here because the log reader later uses them to
//! match stored channels to configured ones.

use super::{ChannelDescriptor, ScaleTransform};
use crate::hardware::DeviceCatalog;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while resolving the channel list. Fatal before a session
/// starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("no channels configured")]
    NoChannels,

    #[error("unknown physical channel '{physical_id}' for display name '{display_name}'")]
    UnknownPhysicalChannel {
        physical_id: String,
        display_name: String,
    },

    #[error("display name '{0}' is used by more than one channel")]
    DuplicateDisplayName(String),

    #[error("channel display name for '{0}' is empty")]
    EmptyDisplayName(String),

    #[error("scale '{scale}' referenced by channel '{display_name}' does not exist")]
    UnresolvedScale { scale: String, display_name: String },

    #[error("scale '{scale}' is invalid: {reason}")]
    InvalidScale { scale: String, reason: String },
}

/// One configured channel, as supplied by the configuration loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Hardware channel identifier (e.g. `ai0`)
    pub physical_channel_id: String,
    /// Name shown to users and used as the storage join key
    pub display_name: String,
    /// Name of a scale in the [`ScaleStore`]
    #[serde(default)]
    pub scale_reference: Option<String>,
    /// Unit override
    #[serde(default)]
    pub unit: Option<String>,
    /// Terminal configuration passed through to the driver (e.g. `RSE`, `DIFF`)
    #[serde(default)]
    pub terminal: Option<String>,
    /// Maximum expected raw value, passed through to the driver
    #[serde(default)]
    pub max_value: Option<f64>,
}

impl ChannelConfig {
    /// Minimal config entry without scale or unit override.
    pub fn new(physical_channel_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            physical_channel_id: physical_channel_id.into(),
            display_name: display_name.into(),
            scale_reference: None,
            unit: None,
            terminal: None,
            max_value: None,
        }
    }

    /// Reference a named scale
    pub fn with_scale(mut self, scale: impl Into<String>) -> Self {
        self.scale_reference = Some(scale.into());
        self
    }

    /// Override the unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// A named scale as held by the calibration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleDefinition {
    /// Transform parameters
    #[serde(flatten)]
    pub transform: ScaleTransform,
    /// Scaled unit, if the store defines one
    #[serde(default)]
    pub unit: Option<String>,
}

/// Calibration scale store collaborator.
pub trait ScaleStore: Send + Sync {
    /// Look up a scale by name.
    fn lookup(&self, name: &str) -> Option<ScaleDefinition>;
}

/// Scale store backed by a map, typically filled from the `[scales]` table
/// of the configuration file.
#[derive(Debug, Clone, Default)]
pub struct InMemoryScaleStore {
    scales: HashMap<String, ScaleDefinition>,
}

impl InMemoryScaleStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a scale
    pub fn insert(&mut self, name: impl Into<String>, definition: ScaleDefinition) {
        self.scales.insert(name.into(), definition);
    }

    /// Builder-style insert of a bare transform
    pub fn with_scale(mut self, name: impl Into<String>, transform: ScaleTransform) -> Self {
        self.insert(
            name,
            ScaleDefinition {
                transform,
                unit: None,
            },
        );
        self
    }
}

impl From<HashMap<String, ScaleDefinition>> for InMemoryScaleStore {
    fn from(scales: HashMap<String, ScaleDefinition>) -> Self {
        Self { scales }
    }
}

impl ScaleStore for InMemoryScaleStore {
    fn lookup(&self, name: &str) -> Option<ScaleDefinition> {
        self.scales.get(name).cloned()
    }
}

/// Resolves configured channels against the device catalog and scale store.
pub struct ChannelRegistry {
    catalog: Arc<dyn DeviceCatalog>,
    scales: Arc<dyn ScaleStore>,
}

impl ChannelRegistry {
    /// Create a registry over explicit collaborator handles.
    pub fn new(catalog: Arc<dyn DeviceCatalog>, scales: Arc<dyn ScaleStore>) -> Self {
        Self { catalog, scales }
    }

    /// Resolve the configured channel list, preserving its order.
    pub fn resolve(&self, config: &[ChannelConfig]) -> Result<Vec<ChannelDescriptor>, ConfigError> {
        if config.is_empty() {
            return Err(ConfigError::NoChannels);
        }

        let mut seen = HashSet::with_capacity(config.len());
        let mut resolved = Vec::with_capacity(config.len());

        for entry in config {
            let display_name = entry.display_name.trim();
            if display_name.is_empty() {
                return Err(ConfigError::EmptyDisplayName(
                    entry.physical_channel_id.clone(),
                ));
            }
            if !seen.insert(display_name.to_string()) {
                return Err(ConfigError::DuplicateDisplayName(display_name.to_string()));
            }

            let physical = self
                .catalog
                .physical_channel(&entry.physical_channel_id)
                .ok_or_else(|| ConfigError::UnknownPhysicalChannel {
                    physical_id: entry.physical_channel_id.clone(),
                    display_name: display_name.to_string(),
                })?;

            let (scale, scale_unit) = match &entry.scale_reference {
                Some(name) => {
                    let definition =
                        self.scales
                            .lookup(name)
                            .ok_or_else(|| ConfigError::UnresolvedScale {
                                scale: name.clone(),
                                display_name: display_name.to_string(),
                            })?;
                    definition
                        .transform
                        .validate()
                        .map_err(|reason| ConfigError::InvalidScale {
                            scale: name.clone(),
                            reason,
                        })?;
                    (definition.transform, definition.unit)
                }
                None => (ScaleTransform::identity(), None),
            };

            let unit = entry
                .unit
                .clone()
                .or(scale_unit)
                .unwrap_or_else(|| physical.native_unit.clone());

            tracing::debug!(
                physical_id = %physical.id,
                display_name,
                unit = %unit,
                "Resolved channel"
            );

            resolved.push(ChannelDescriptor {
                physical_id: physical.id,
                display_name: display_name.to_string(),
                unit,
                scale,
            });
        }

        Ok(resolved)
    }
}
