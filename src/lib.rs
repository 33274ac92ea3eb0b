//! # daq_log
//!
//! Multi-channel data acquisition logging. Raw sample blocks flow from a
//! hardware driver through a lock-free ring buffer to a durable, segmented
//! binary log, while any number of live views read the same stream without
//! slowing the writer down.
//!
//! ## Crate Structure
//!
//! - **`channel`**: channel descriptors, scale transforms and the
//!   [`ChannelRegistry`](channel::ChannelRegistry) that resolves the configured
//!   channel list against the device catalog and the scale store.
//! - **`config`**: Figment-based loading and validation of
//!   [`Settings`](config::Settings) from TOML and the environment.
//! - **`data`**: the [`AcquisitionBuffer`](data::AcquisitionBuffer) ring and the
//!   [`LiveFeedTap`](data::LiveFeedTap) scaled live view.
//! - **`error`**: the crate-wide [`DaqError`](error::DaqError).
//! - **`hardware`**: the [`SampleSource`](hardware::SampleSource) and
//!   [`DeviceCatalog`](hardware::DeviceCatalog) driver seams plus a simulated
//!   analog input card.
//! - **`logging`**: tracing subscriber setup.
//! - **`measurement_types`**: the [`SampleBlock`](measurement_types::SampleBlock)
//!   unit of acquisition.
//! - **`pipeline`**: producer and writer threads around the buffer.
//! - **`session`**: session identity and the current channel set.
//! - **`storage`**: the `.dqlog` format, [`LogWriter`](storage::LogWriter) and
//!   [`LogReader`](storage::LogReader).

pub mod channel;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod measurement_types;
pub mod pipeline;
pub mod session;
pub mod storage;

pub use error::{AppResult, DaqError};
