//! Bounded, lock-free block ring between the hardware callback and its
//! consumers.
//!
//! # Design
//! - One producer ([`BlockProducer`], not `Clone`) publishes [`SampleBlock`]s.
//! - Any number of consumers each own a [`BlockCursor`] with an independent
//!   read position; consumers never mutate shared state.
//! - Storage is an arena of `capacity` slots. Block number `n` lives in slot
//!   `n % capacity` and is tagged with `n`, so a consumer can tell whether the
//!   slot still holds the block it wants.
//! - The producer swaps an `Arc` into the slot and then advances the `head`
//!   counter with `Release` ordering. It never waits on consumers.
//!
//! # Backpressure
//! Drop-oldest per consumer: when a cursor falls more than `capacity` blocks
//! behind, its oldest unread blocks are gone. The next `pull` skips straight to
//! the oldest retained block and records a [`DroppedBlock`] event with the
//! exact sequence range that was lost.
//!
//! ```text
//! head = 10, capacity = 4      retained: [6 7 8 9]
//! cursor.next = 3              pull() -> block 6, DroppedBlock { first: 3, count: 3 }
//! ```

use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::measurement_types::SampleBlock;

/// Returned by [`BlockCursor::pull`] when the cursor has caught up with the
/// producer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no new block available")]
pub struct WouldBlock;

/// A contiguous range of blocks a consumer lost to drop-oldest backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedBlock {
    /// Sequence number of the first lost block
    pub first_sequence: u64,
    /// Number of consecutive blocks lost
    pub count: u64,
}

struct Slot {
    sequence: u64,
    block: Arc<SampleBlock>,
}

/// Shared ring storage. Obtain one through [`AcquisitionBuffer::new`].
pub struct AcquisitionBuffer {
    slots: Box<[ArcSwapOption<Slot>]>,
    capacity: u64,
    /// Number of published blocks; the next sequence number to be written.
    head: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for AcquisitionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionBuffer")
            .field("capacity", &self.capacity)
            .field("head", &self.pushed())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AcquisitionBuffer {
    /// Create a ring retaining `capacity` blocks (at least one).
    ///
    /// Returns the single producer handle and the shared buffer consumers
    /// subscribe to.
    pub fn new(capacity: usize) -> (BlockProducer, Arc<AcquisitionBuffer>) {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| ArcSwapOption::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let buffer = Arc::new(AcquisitionBuffer {
            slots,
            capacity: capacity as u64,
            head: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let producer = BlockProducer {
            buffer: Arc::clone(&buffer),
        };
        (producer, buffer)
    }

    /// Number of blocks retained before the oldest is overwritten
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total blocks published so far
    pub fn pushed(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// True once the producer has been closed or dropped
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Oldest sequence number still retained
    pub fn oldest_retained(&self) -> u64 {
        self.pushed().saturating_sub(self.capacity)
    }

    /// New consumer that starts with the next block published.
    pub fn subscribe(self: &Arc<Self>, name: impl Into<String>) -> BlockCursor {
        let next = self.pushed();
        self.cursor_at(name.into(), next)
    }

    /// New consumer that starts with the oldest block still retained.
    pub fn subscribe_from_oldest(self: &Arc<Self>, name: impl Into<String>) -> BlockCursor {
        let next = self.oldest_retained();
        self.cursor_at(name.into(), next)
    }

    fn cursor_at(self: &Arc<Self>, name: String, next: u64) -> BlockCursor {
        tracing::debug!(consumer = %name, start = next, "Consumer subscribed");
        BlockCursor {
            buffer: Arc::clone(self),
            name,
            next,
            dropped: 0,
            events: Vec::new(),
        }
    }

    fn slot(&self, sequence: u64) -> &ArcSwapOption<Slot> {
        &self.slots[(sequence % self.capacity) as usize]
    }
}

/// Sole writer into an [`AcquisitionBuffer`].
///
/// Dropping the producer closes the buffer so consumers can tell a drained
/// buffer from an idle one.
pub struct BlockProducer {
    buffer: Arc<AcquisitionBuffer>,
}

impl BlockProducer {
    /// Publish a block. Never blocks; overwrites the oldest retained block
    /// when the ring is full. Returns the block's sequence number.
    pub fn push(&mut self, block: SampleBlock) -> u64 {
        let buffer = &self.buffer;
        // Only this handle writes `head`, so a relaxed read is current.
        let sequence = buffer.head.load(Ordering::Relaxed);
        buffer.slot(sequence).store(Some(Arc::new(Slot {
            sequence,
            block: Arc::new(block),
        })));
        buffer.head.store(sequence + 1, Ordering::Release);
        sequence
    }

    /// Shared buffer this producer writes into
    pub fn buffer(&self) -> &Arc<AcquisitionBuffer> {
        &self.buffer
    }

    /// Mark the stream finished.
    pub fn close(self) {}
}

impl Drop for BlockProducer {
    fn drop(&mut self) {
        self.buffer.closed.store(true, Ordering::Release);
    }
}

/// Independent read position of one consumer.
pub struct BlockCursor {
    buffer: Arc<AcquisitionBuffer>,
    name: String,
    next: u64,
    dropped: u64,
    events: Vec<DroppedBlock>,
}

impl BlockCursor {
    /// Next unread block in sequence order, or [`WouldBlock`] if none.
    pub fn pull(&mut self) -> Result<Arc<SampleBlock>, WouldBlock> {
        let head = self.buffer.head.load(Ordering::Acquire);
        if self.next >= head {
            return Err(WouldBlock);
        }

        let oldest = head.saturating_sub(self.buffer.capacity);
        if self.next < oldest {
            self.record_drop(oldest);
        }

        loop {
            let guard = self.buffer.slot(self.next).load();
            match &*guard {
                Some(slot) if slot.sequence == self.next => {
                    self.next += 1;
                    return Ok(Arc::clone(&slot.block));
                }
                Some(slot) if slot.sequence > self.next => {
                    // Overwritten between the head load and the slot load.
                    // Everything up to `slot.sequence - capacity` is gone.
                    let resume = slot.sequence + 1 - self.buffer.capacity;
                    self.record_drop(resume.max(self.next + 1));
                }
                _ => return Err(WouldBlock),
            }
        }
    }

    /// Drain every block currently available.
    pub fn pull_all(&mut self) -> Vec<Arc<SampleBlock>> {
        let mut blocks = Vec::new();
        while let Ok(block) = self.pull() {
            blocks.push(block);
        }
        blocks
    }

    fn record_drop(&mut self, resume: u64) {
        let count = resume - self.next;
        let event = DroppedBlock {
            first_sequence: self.next,
            count,
        };
        tracing::warn!(
            consumer = %self.name,
            first_sequence = event.first_sequence,
            count,
            "Consumer lagged; oldest unread blocks dropped"
        );
        self.dropped += count;
        self.events.push(event);
        self.next = resume;
    }

    /// Consumer name, used in log events
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequence number of the next block this cursor will return
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Blocks published but not yet pulled (may exceed capacity)
    pub fn lag(&self) -> u64 {
        self.buffer.pushed().saturating_sub(self.next)
    }

    /// Total blocks this consumer has lost
    pub fn dropped_blocks(&self) -> u64 {
        self.dropped
    }

    /// Drop events since the last call
    pub fn take_drop_events(&mut self) -> Vec<DroppedBlock> {
        std::mem::take(&mut self.events)
    }

    /// True when the producer is gone and every retained block was pulled
    pub fn is_drained(&self) -> bool {
        self.buffer.is_closed() && self.next >= self.buffer.pushed()
    }

    /// Shared buffer this cursor reads from
    pub fn buffer(&self) -> &Arc<AcquisitionBuffer> {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelDescriptor, ChannelSet};
    use std::thread;
    use std::time::Duration;

    fn block(n: u64) -> SampleBlock {
        let set = Arc::new(ChannelSet::new(vec![ChannelDescriptor::new("ai0", "A")]));
        SampleBlock::new(
            Duration::from_millis(n * 10),
            100.0,
            set,
            vec![vec![n as f64]],
        )
        .unwrap()
    }

    fn id(b: &SampleBlock) -> u64 {
        b.channel(0).unwrap()[0] as u64
    }

    #[test]
    fn empty_buffer_would_block() {
        let (_producer, buffer) = AcquisitionBuffer::new(4);
        let mut cursor = buffer.subscribe("writer");
        assert_eq!(cursor.pull().unwrap_err(), WouldBlock);
    }

    #[test]
    fn consumers_read_in_order_independently() {
        let (mut producer, buffer) = AcquisitionBuffer::new(8);
        let mut fast = buffer.subscribe("fast");
        let mut slow = buffer.subscribe("slow");

        for n in 0..5 {
            producer.push(block(n));
        }
        let fast_ids: Vec<_> = fast.pull_all().iter().map(|b| id(b)).collect();
        assert_eq!(fast_ids, vec![0, 1, 2, 3, 4]);

        assert_eq!(id(&slow.pull().unwrap()), 0);
        assert_eq!(slow.lag(), 4);
        assert_eq!(fast.lag(), 0);
    }

    #[test]
    fn lagging_consumer_drops_oldest_first() {
        let (mut producer, buffer) = AcquisitionBuffer::new(4);
        let mut cursor = buffer.subscribe("live");

        for n in 0..10 {
            producer.push(block(n));
        }

        let ids: Vec<_> = cursor.pull_all().iter().map(|b| id(b)).collect();
        assert_eq!(ids, vec![6, 7, 8, 9]);
        assert_eq!(cursor.dropped_blocks(), 6);
        assert_eq!(
            cursor.take_drop_events(),
            vec![DroppedBlock {
                first_sequence: 0,
                count: 6
            }]
        );
        assert!(cursor.take_drop_events().is_empty());
    }

    #[test]
    fn drops_do_not_affect_other_consumers() {
        let (mut producer, buffer) = AcquisitionBuffer::new(2);
        let mut writer = buffer.subscribe("writer");
        let mut live = buffer.subscribe("live");

        for n in 0..2 {
            producer.push(block(n));
            assert_eq!(id(&writer.pull().unwrap()), n);
        }
        for n in 2..5 {
            producer.push(block(n));
            assert_eq!(id(&writer.pull().unwrap()), n);
        }

        assert_eq!(writer.dropped_blocks(), 0);
        assert_eq!(id(&live.pull().unwrap()), 3);
        assert_eq!(live.dropped_blocks(), 3);
    }

    #[test]
    fn subscribe_from_oldest_sees_retained_history() {
        let (mut producer, buffer) = AcquisitionBuffer::new(3);
        for n in 0..5 {
            producer.push(block(n));
        }
        let mut cursor = buffer.subscribe_from_oldest("late");
        let ids: Vec<_> = cursor.pull_all().iter().map(|b| id(b)).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(cursor.dropped_blocks(), 0);
    }

    #[test]
    fn dropping_producer_drains_cursor() {
        let (mut producer, buffer) = AcquisitionBuffer::new(4);
        let mut cursor = buffer.subscribe("writer");
        producer.push(block(0));
        producer.close();
        assert!(!cursor.is_drained());
        cursor.pull().unwrap();
        assert!(cursor.is_drained());
    }

    #[test]
    fn concurrent_consumer_sees_strictly_increasing_sequences() {
        let (mut producer, buffer) = AcquisitionBuffer::new(16);
        let mut cursor = buffer.subscribe("reader");

        let reader = thread::spawn(move || {
            let mut last = None;
            let mut received = 0u64;
            loop {
                match cursor.pull() {
                    Ok(b) => {
                        let n = id(&b);
                        if let Some(prev) = last {
                            assert!(n > prev, "out of order: {n} after {prev}");
                        }
                        last = Some(n);
                        received += 1;
                    }
                    Err(WouldBlock) if cursor.is_drained() => break,
                    Err(WouldBlock) => thread::yield_now(),
                }
            }
            (received, cursor.dropped_blocks())
        });

        for n in 0..5000 {
            producer.push(block(n));
        }
        drop(producer);

        let (received, dropped) = reader.join().unwrap();
        assert_eq!(received + dropped, 5000);
    }
}
