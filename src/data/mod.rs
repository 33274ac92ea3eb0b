//! In-memory data path: the acquisition ring buffer and the live tap.
pub mod live_tap;
pub mod ring_buffer;

pub use live_tap::{LiveFeedTap, LiveFrame, LiveUpdate, LiveWindow};
pub use ring_buffer::{AcquisitionBuffer, BlockCursor, BlockProducer, DroppedBlock, WouldBlock};
