//! Bounded Tick Buffer
//!
//! Fixed-capacity queue between the receive loop and a consumer.
//!
//! # Overflow Policy
//!
//! `push` never blocks. When the buffer is full the oldest tick is evicted
//! and the overflow counter is incremented once per evicted tick. Because
//! the producer pushes each pair in sequence order and the queue is FIFO,
//! consumers see every pair in sequence order; evictions show up as
//! [`SequenceGap`]s on delivery.
//!
//! # Waiting
//!
//! - [`TickBuffer::pop`] never waits
//! - [`TickBuffer::recv`] waits asynchronously
//! - [`TickBuffer::pop_timeout`] blocks the calling thread (consumer threads)

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::Notify;

use crate::domain::tick::{CurrencyPair, SequenceGap, Tick};

/// Default buffer capacity in ticks.
pub const DEFAULT_BUFFER_CAPACITY: usize = 2048;

// =============================================================================
// Buffer
// =============================================================================

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored without eviction.
    Stored,
    /// Stored after evicting the oldest tick.
    EvictedOldest,
    /// Buffer is closed; the tick was dropped.
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Tick>,
    closed: bool,
    last_delivered: HashMap<CurrencyPair, u64>,
    last_gap: Option<SequenceGap>,
    gap_count: u64,
}

impl Inner {
    fn take_front(&mut self) -> Option<Tick> {
        let tick = self.queue.pop_front()?;
        let pair = tick.pair();
        if let Some(last) = self.last_delivered.get(&pair)
            && tick.sequence() > last + 1
        {
            self.last_gap = Some(SequenceGap {
                pair,
                expected: last + 1,
                received: tick.sequence(),
            });
            self.gap_count += 1;
        }
        self.last_delivered.insert(pair, tick.sequence());
        Some(tick)
    }
}

/// Bounded drop-oldest tick queue.
#[derive(Debug)]
pub struct TickBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
    available: Condvar,
    notify: Notify,
    overflow: AtomicU64,
}

impl Default for TickBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl TickBuffer {
    /// Create a buffer holding at most `capacity` ticks (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                ..Inner::default()
            }),
            available: Condvar::new(),
            notify: Notify::new(),
            overflow: AtomicU64::new(0),
        }
    }

    /// Append a tick, evicting the oldest one if full. Never blocks.
    pub fn push(&self, tick: Tick) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            let evicted = if inner.queue.len() >= self.capacity {
                inner.queue.pop_front();
                self.overflow.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                false
            };
            inner.queue.push_back(tick);
            if evicted {
                PushOutcome::EvictedOldest
            } else {
                PushOutcome::Stored
            }
        };

        self.available.notify_one();
        self.notify.notify_waiters();
        outcome
    }

    /// Take the oldest tick without waiting.
    #[must_use]
    pub fn pop(&self) -> Option<Tick> {
        self.inner.lock().take_front()
    }

    /// Wait asynchronously for the next tick.
    ///
    /// Returns `None` once the buffer is closed and empty.
    pub async fn recv(&self) -> Option<Tick> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(tick) = inner.take_front() {
                    return Some(tick);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Block the current thread until a tick arrives or `timeout` elapses.
    ///
    /// Returns `None` on timeout, or once the buffer is closed and empty.
    #[must_use]
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Tick> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(tick) = inner.take_front() {
                return Some(tick);
            }
            if inner.closed {
                return None;
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                return inner.take_front();
            }
        }
    }

    /// Take every buffered tick.
    #[must_use]
    pub fn drain(&self) -> Vec<Tick> {
        let mut inner = self.inner.lock();
        std::iter::from_fn(|| inner.take_front()).collect()
    }

    /// Discard every buffered tick. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let discarded = inner.queue.len();
        inner.queue.clear();
        discarded
    }

    /// Stop accepting ticks and wake every waiter.
    ///
    /// Ticks already buffered can still be popped.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_all();
        self.notify.notify_waiters();
    }

    /// True once [`TickBuffer::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of buffered ticks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// True if no tick is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Maximum number of buffered ticks.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of ticks evicted because the buffer was full.
    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Most recent sequence gap seen on delivery.
    #[must_use]
    pub fn last_gap(&self) -> Option<SequenceGap> {
        self.inner.lock().last_gap
    }

    /// Number of sequence gaps seen on delivery.
    #[must_use]
    pub fn gap_count(&self) -> u64 {
        self.inner.lock().gap_count
    }
}

// =============================================================================
// Fan-out
// =============================================================================

/// Buffer statistics aggregated over every registered consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct FanoutStats {
    /// Registered buffers.
    pub consumers: usize,
    /// Ticks currently buffered across consumers.
    pub buffered: usize,
    /// Ticks evicted across consumers.
    pub overflow: u64,
}

/// Copies each accepted tick into one buffer per consumer.
///
/// A slow consumer only overflows its own buffer.
#[derive(Debug)]
pub struct TickFanout {
    capacity: usize,
    buffers: RwLock<Vec<Arc<TickBuffer>>>,
}

impl TickFanout {
    /// Create a fan-out whose buffers hold `capacity` ticks each.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: RwLock::new(Vec::new()),
        }
    }

    /// Register a new consumer buffer.
    #[must_use]
    pub fn register(&self) -> Arc<TickBuffer> {
        let buffer = Arc::new(TickBuffer::new(self.capacity));
        self.buffers.write().push(Arc::clone(&buffer));
        buffer
    }

    /// Remove a consumer buffer.
    pub fn unregister(&self, buffer: &Arc<TickBuffer>) {
        self.buffers.write().retain(|b| !Arc::ptr_eq(b, buffer));
    }

    /// Push `tick` into every open buffer.
    ///
    /// Returns the number of buffers that had to evict a tick.
    pub fn publish(&self, tick: &Tick) -> usize {
        self.buffers
            .read()
            .iter()
            .filter(|buffer| buffer.push(tick.clone()) == PushOutcome::EvictedOldest)
            .count()
    }

    /// Registered buffers.
    #[must_use]
    pub fn buffers(&self) -> Vec<Arc<TickBuffer>> {
        self.buffers.read().clone()
    }

    /// Number of registered consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.buffers.read().len()
    }

    /// Close every buffer.
    pub fn close_all(&self) {
        for buffer in self.buffers.read().iter() {
            buffer.close();
        }
    }

    /// Discard buffered ticks in every buffer. Returns the total discarded.
    pub fn clear_all(&self) -> usize {
        self.buffers.read().iter().map(|b| b.clear()).sum()
    }

    /// Aggregated statistics.
    #[must_use]
    pub fn stats(&self) -> FanoutStats {
        let buffers = self.buffers.read();
        FanoutStats {
            consumers: buffers.len(),
            buffered: buffers.iter().map(|b| b.len()).sum(),
            overflow: buffers.iter().map(|b| b.overflow_count()).sum(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;

    fn tick(pair: &str, sequence: u64) -> Tick {
        let now = Utc::now();
        Tick::new(
            pair.parse().unwrap(),
            Some(Decimal::ONE),
            Some(Decimal::TWO),
            now,
            now,
            sequence,
            false,
            1,
        )
    }

    #[test]
    fn fifo_order() {
        let buffer = TickBuffer::new(8);
        for seq in 1..=3 {
            assert_eq!(buffer.push(tick("EUR/USD", seq)), PushOutcome::Stored);
        }
        let seqs: Vec<u64> = buffer.drain().iter().map(Tick::sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let buffer = TickBuffer::new(2);
        buffer.push(tick("EUR/USD", 1));
        buffer.push(tick("EUR/USD", 2));
        assert_eq!(buffer.push(tick("EUR/USD", 3)), PushOutcome::EvictedOldest);

        assert_eq!(buffer.overflow_count(), 1);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.pop().unwrap().sequence(), 2);
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let buffer = TickBuffer::new(4);
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn gap_recorded_after_eviction() {
        let buffer = TickBuffer::new(2);
        buffer.push(tick("EUR/USD", 1));
        assert_eq!(buffer.pop().unwrap().sequence(), 1);

        for seq in 2..=5 {
            buffer.push(tick("EUR/USD", seq));
        }
        assert_eq!(buffer.pop().unwrap().sequence(), 4);

        let gap = buffer.last_gap().unwrap();
        assert_eq!(gap.expected, 2);
        assert_eq!(gap.received, 4);
        assert_eq!(buffer.gap_count(), 1);
    }

    #[test]
    fn gaps_are_tracked_per_pair() {
        let buffer = TickBuffer::new(8);
        buffer.push(tick("EUR/USD", 1));
        buffer.push(tick("USD/JPY", 1));
        buffer.push(tick("EUR/USD", 2));
        buffer.push(tick("USD/JPY", 2));
        let _ = buffer.drain();
        assert!(buffer.last_gap().is_none());
    }

    #[test]
    fn closed_buffer_rejects_push_but_drains() {
        let buffer = TickBuffer::new(4);
        buffer.push(tick("EUR/USD", 1));
        buffer.close();
        assert_eq!(buffer.push(tick("EUR/USD", 2)), PushOutcome::Closed);
        assert_eq!(buffer.pop().unwrap().sequence(), 1);
        assert!(buffer.pop_timeout(Duration::from_secs(5)).is_none());
    }

    #[test]
    fn clear_discards() {
        let buffer = TickBuffer::new(4);
        buffer.push(tick("EUR/USD", 1));
        buffer.push(tick("EUR/USD", 2));
        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn pop_timeout_times_out() {
        let buffer = TickBuffer::new(4);
        let started = Instant::now();
        assert!(buffer.pop_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        let buffer = Arc::new(TickBuffer::new(4));
        let producer = Arc::clone(&buffer);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(tick("EUR/USD", 1));
        });
        let received = buffer.pop_timeout(Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(received.unwrap().sequence(), 1);
    }

    #[tokio::test]
    async fn recv_waits_for_push() {
        let buffer = Arc::new(TickBuffer::new(4));
        let consumer = Arc::clone(&buffer);
        let handle = tokio::spawn(async move { consumer.recv().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push(tick("EUR/USD", 7));

        let received = handle.await.unwrap();
        assert_eq!(received.unwrap().sequence(), 7);
    }

    #[tokio::test]
    async fn recv_returns_none_after_close() {
        let buffer = Arc::new(TickBuffer::new(4));
        let consumer = Arc::clone(&buffer);
        let handle = tokio::spawn(async move { consumer.recv().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        assert!(handle.await.unwrap().is_none());
    }

    #[test]
    fn fanout_isolates_slow_consumer() {
        let fanout = TickFanout::new(2);
        let fast = fanout.register();
        let slow = fanout.register();

        for seq in 1..=3 {
            fanout.publish(&tick("EUR/USD", seq));
            let _ = fast.pop();
        }

        assert_eq!(fast.overflow_count(), 0);
        assert_eq!(slow.overflow_count(), 1);
        assert_eq!(fanout.stats().overflow, 1);
        assert_eq!(fanout.stats().consumers, 2);
    }

    #[test]
    fn fanout_unregister_stops_delivery() {
        let fanout = TickFanout::new(4);
        let buffer = fanout.register();
        fanout.unregister(&buffer);
        fanout.publish(&tick("EUR/USD", 1));
        assert!(buffer.is_empty());
        assert_eq!(fanout.consumer_count(), 0);
    }

    proptest! {
        #[test]
        fn overflow_counts_each_eviction(capacity in 1usize..64, pushes in 0usize..256) {
            let buffer = TickBuffer::new(capacity);
            for seq in 1..=pushes {
                buffer.push(tick("EUR/USD", seq as u64));
            }
            let expected_overflow = pushes.saturating_sub(capacity);
            prop_assert_eq!(buffer.overflow_count(), expected_overflow as u64);
            prop_assert_eq!(buffer.len(), pushes.min(capacity));

            let delivered: Vec<u64> = buffer.drain().iter().map(Tick::sequence).collect();
            let first = expected_overflow as u64 + 1;
            let expected: Vec<u64> = (first..=pushes as u64).collect();
            prop_assert_eq!(delivered, expected);
        }
    }
}
