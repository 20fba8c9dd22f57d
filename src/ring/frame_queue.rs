//! In-process latest-wins frame queue.
//!
//! One producer thread, up to [`MAX_CONSUMERS`](crate::constants::MAX_CONSUMERS)
//! consumer threads, byte-copy semantics. Payloads are copied into a pool of
//! preallocated slot buffers on produce and copied out into a fresh
//! allocation on consume, so the returned [`Frame`] owns its bytes and can
//! outlive the queue. The pool is allocated once at creation and freed only
//! when the queue drops.
//!
//! The producer never blocks and never fails for lack of space: a full ring
//! overwrites its oldest unread slot and lagging consumers silently skip the
//! lost frame.

use std::cmp::Ordering;

use parking_lot::Mutex;

use crate::constants::{MAX_CAPACITY, MIN_CAPACITY};
use crate::error::{AvringError, Result};
use crate::ring::cursors::RingCursors;

/// Configuration for [`FrameQueue`].
#[derive(Debug, Clone, Copy)]
pub struct FrameQueueConfig {
    capacity: u8,
    max_frame_size: usize,
}

impl FrameQueueConfig {
    /// Validate capacity and slot size.
    pub fn new(capacity: u8, max_frame_size: usize) -> Result<Self> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(AvringError::config(format!(
                "capacity {} outside [{}, {}]",
                capacity, MIN_CAPACITY, MAX_CAPACITY
            )));
        }
        if max_frame_size == 0 {
            return Err(AvringError::config("max_frame_size must be non-zero"));
        }
        Ok(Self {
            capacity,
            max_frame_size,
        })
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

/// A frame handed out by [`FrameQueue::consume`]. Owns its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Payload bytes, copied out of the queue's slot.
    pub data: Vec<u8>,
    /// Opaque application classification tag.
    pub frame_type: i32,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct SlotMeta {
    len: usize,
    frame_type: i32,
}

struct Inner {
    cursors: RingCursors,
    meta: Vec<SlotMeta>,
    pool: Vec<Box<[u8]>>,
}

/// In-process SPMC queue with latest-wins overwrite.
pub struct FrameQueue {
    inner: Mutex<Inner>,
    max_frame_size: usize,
}

impl FrameQueue {
    /// Create a queue with `capacity` slots of `max_frame_size` bytes each.
    pub fn new(config: FrameQueueConfig) -> Result<Self> {
        let capacity = config.capacity() as usize;

        let mut pool = Vec::new();
        pool.try_reserve_exact(capacity)
            .map_err(|_| AvringError::memory("failed to allocate slot pool"))?;
        for _ in 0..capacity {
            let mut buf = Vec::new();
            buf.try_reserve_exact(config.max_frame_size())
                .map_err(|_| AvringError::memory("failed to allocate slot buffer"))?;
            buf.resize(config.max_frame_size(), 0);
            pool.push(buf.into_boxed_slice());
        }

        let meta = (0..capacity)
            .map(|_| SlotMeta {
                len: 0,
                frame_type: 0,
            })
            .collect();

        Ok(Self {
            inner: Mutex::new(Inner {
                cursors: RingCursors::new(config.capacity()),
                meta,
                pool,
            }),
            max_frame_size: config.max_frame_size(),
        })
    }

    /// Register a new consumer. It will observe every frame currently live
    /// in the queue and everything produced afterwards.
    pub fn register_consumer(&self) -> Result<i32> {
        self.inner
            .lock()
            .cursors
            .register_consumer()
            .ok_or(AvringError::ConsumerTableFull)
    }

    /// Remove a consumer from the registry. Unknown ids are ignored.
    pub fn deregister_consumer(&self, consumer_id: i32) {
        self.inner.lock().cursors.deregister_consumer(consumer_id);
    }

    /// Ids of all registered consumers.
    pub fn enumerate_consumers(&self) -> Vec<i32> {
        self.inner.lock().cursors.enumerate_consumers()
    }

    /// Copy `data` into the next slot. Never blocks; a full ring drops its
    /// oldest unread frame.
    pub fn produce(&self, data: &[u8], frame_type: i32) -> Result<()> {
        if data.is_empty() {
            return Err(AvringError::config("cannot produce an empty frame"));
        }
        if data.len() > self.max_frame_size {
            return Err(AvringError::FrameTooLarge {
                len: data.len(),
                max: self.max_frame_size,
            });
        }

        let mut inner = self.inner.lock();
        let wr = inner.cursors.wr_off() as usize;

        inner.pool[wr][..data.len()].copy_from_slice(data);
        inner.meta[wr].len = data.len();
        inner.meta[wr].frame_type = frame_type;

        inner.cursors.advance_producer();

        Ok(())
    }

    /// Produce from an existing [`Frame`].
    pub fn produce_frame(&self, frame: &Frame) -> Result<()> {
        self.produce(&frame.data, frame.frame_type)
    }

    /// Read the oldest frame this consumer has not seen yet.
    ///
    /// The payload is copied into a fresh allocation owned by the returned
    /// [`Frame`]. If that allocation fails the cursor is left untouched and
    /// the frame can be retried.
    pub fn consume(&self, consumer_id: i32) -> Result<Frame> {
        let mut inner = self.inner.lock();

        let idx = inner
            .cursors
            .find_consumer_index(consumer_id)
            .ok_or_else(|| {
                tracing::warn!(consumer_id, "consume from unregistered consumer");
                AvringError::ConsumerNotFound { id: consumer_id }
            })?;

        if inner.cursors.local_empty(idx) {
            tracing::debug!(consumer_id, "consume on empty local view");
            return Err(AvringError::NoBuffer);
        }

        let rd = inner.cursors.local_rd_off(idx) as usize;
        let len = inner.meta[rd].len;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| AvringError::memory("failed to allocate consume output"))?;
        data.extend_from_slice(&inner.pool[rd][..len]);

        let frame = Frame {
            data,
            frame_type: inner.meta[rd].frame_type,
        };

        inner.cursors.advance_consumer(idx);

        Ok(frame)
    }

    /// Number of live frames between the slowest consumer and the producer.
    pub fn len(&self) -> usize {
        self.inner.lock().cursors.len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().cursors.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().cursors.is_full()
    }

    /// Whether `consumer_id` has nothing left to read.
    pub fn local_empty(&self, consumer_id: i32) -> Result<bool> {
        let inner = self.inner.lock();
        let idx = inner
            .cursors
            .find_consumer_index(consumer_id)
            .ok_or(AvringError::ConsumerNotFound { id: consumer_id })?;
        Ok(inner.cursors.local_empty(idx))
    }

    /// Whether `consumer_id` lags a full ring behind the producer.
    pub fn local_full(&self, consumer_id: i32) -> Result<bool> {
        let inner = self.inner.lock();
        let idx = inner
            .cursors
            .find_consumer_index(consumer_id)
            .ok_or(AvringError::ConsumerNotFound { id: consumer_id })?;
        Ok(inner.cursors.local_full(idx))
    }

    /// Compare the global read cursor against one consumer's cursor.
    pub fn compare_read_speed(&self, consumer_id: i32) -> Result<Ordering> {
        let inner = self.inner.lock();
        let idx = inner
            .cursors
            .find_consumer_index(consumer_id)
            .ok_or(AvringError::ConsumerNotFound { id: consumer_id })?;
        Ok(inner.cursors.compare_read_speed(idx))
    }

    /// Offset of the slowest registered consumer.
    pub fn slowest_rd_off(&self) -> u8 {
        self.inner.lock().cursors.slowest_rd_off()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::INVALID_OFFSET;

    fn queue(capacity: u8) -> FrameQueue {
        FrameQueue::new(FrameQueueConfig::new(capacity, 64).unwrap()).unwrap()
    }

    fn produce_u32(q: &FrameQueue, v: u32) {
        q.produce(&v.to_le_bytes(), 0).unwrap();
    }

    fn consume_u32(q: &FrameQueue, id: i32) -> u32 {
        let frame = q.consume(id).unwrap();
        u32::from_le_bytes(frame.data.as_slice().try_into().unwrap())
    }

    #[test]
    fn test_config_rejects_bad_capacity() {
        assert!(FrameQueueConfig::new(1, 64).is_err());
        assert!(FrameQueueConfig::new(65, 64).is_err());
        assert!(FrameQueueConfig::new(4, 0).is_err());
        assert!(FrameQueueConfig::new(2, 1).is_ok());
    }

    #[test]
    fn test_single_consumer_in_order() {
        let q = queue(3);
        let id = q.register_consumer().unwrap();

        assert_eq!(q.len(), 0);
        produce_u32(&q, 1);
        assert_eq!(q.len(), 1);
        produce_u32(&q, 2);
        assert_eq!(q.len(), 2);

        assert_eq!(consume_u32(&q, id), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(consume_u32(&q, id), 2);
        assert_eq!(q.len(), 0);

        assert!(matches!(q.consume(id), Err(AvringError::NoBuffer)));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let q = queue(4);
        let id = q.register_consumer().unwrap();

        for v in 1..=9 {
            produce_u32(&q, v);
        }

        // Capacity 4 keeps 3 live items; 7, 8, 9 survive.
        assert_eq!(consume_u32(&q, id), 7);
        assert_eq!(q.len(), 2);
        assert_eq!(consume_u32(&q, id), 8);
        assert_eq!(consume_u32(&q, id), 9);
        assert!(matches!(q.consume(id), Err(AvringError::NoBuffer)));
    }

    #[test]
    fn test_slow_consumer_retains_frame() {
        let q = queue(4);
        let ids: Vec<i32> = (0..4).map(|_| q.register_consumer().unwrap()).collect();

        produce_u32(&q, 42);

        for (n, id) in ids.iter().enumerate() {
            // The frame stays live until the last consumer reads it.
            assert_eq!(q.len(), 1, "before consumer {n}");
            assert_eq!(consume_u32(&q, *id), 42);
        }
        assert_eq!(q.len(), 0);
        assert!(matches!(q.consume(ids[3]), Err(AvringError::NoBuffer)));
    }

    #[test]
    fn test_late_consumer_misses_earlier_frames() {
        let q = queue(4);

        produce_u32(&q, 1);
        let c1 = q.register_consumer().unwrap();
        produce_u32(&q, 2);
        assert_eq!(consume_u32(&q, c1), 1);

        let c2 = q.register_consumer().unwrap();
        produce_u32(&q, 3);

        assert_eq!(consume_u32(&q, c1), 2);
        assert_eq!(consume_u32(&q, c2), 2);
        assert_eq!(consume_u32(&q, c1), 3);
        assert_eq!(consume_u32(&q, c2), 3);
        assert!(matches!(q.consume(c2), Err(AvringError::NoBuffer)));
    }

    #[test]
    fn test_unknown_consumer() {
        let q = queue(4);
        assert!(matches!(
            q.consume(99),
            Err(AvringError::ConsumerNotFound { id: 99 })
        ));
    }

    #[test]
    fn test_frame_type_round_trips() {
        let q = queue(4);
        let id = q.register_consumer().unwrap();
        q.produce(b"keyframe", 7).unwrap();

        let frame = q.consume(id).unwrap();
        assert_eq!(frame.data, b"keyframe");
        assert_eq!(frame.frame_type, 7);
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let q = FrameQueue::new(FrameQueueConfig::new(4, 8).unwrap()).unwrap();
        let err = q.produce(&[0u8; 9], 0).unwrap_err();
        assert!(matches!(err, AvringError::FrameTooLarge { len: 9, max: 8 }));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_empty_frame_rejected() {
        let q = queue(4);
        assert!(q.produce(&[], 0).is_err());
    }

    #[test]
    fn test_register_deregister_cycles() {
        let q = queue(4);
        let mut last = -1;
        for _ in 0..10 {
            let id = q.register_consumer().unwrap();
            assert!(id > last);
            last = id;
            assert_eq!(q.enumerate_consumers(), vec![id]);
            q.deregister_consumer(id);
            assert!(q.enumerate_consumers().is_empty());
        }
    }

    #[test]
    fn test_table_exhaustion() {
        let q = queue(4);
        for _ in 0..crate::constants::MAX_CONSUMERS {
            q.register_consumer().unwrap();
        }
        assert!(matches!(
            q.register_consumer(),
            Err(AvringError::ConsumerTableFull)
        ));
    }

    #[test]
    fn test_slowest_rd_off_empty_registry() {
        let q = queue(4);
        assert_eq!(q.slowest_rd_off(), INVALID_OFFSET);
    }

    #[test]
    fn test_producer_thread_and_slow_consumer() {
        let q = queue(8);
        let id = q.register_consumer().unwrap();
        let total: u32 = 200;

        crossbeam::thread::scope(|s| {
            s.spawn(|_| {
                for v in 0..total {
                    produce_u32(&q, v);
                    std::thread::yield_now();
                }
            });

            let mut seen = Vec::new();
            while seen.last() != Some(&(total - 1)) {
                match q.consume(id) {
                    Ok(frame) => {
                        let v = u32::from_le_bytes(frame.data.as_slice().try_into().unwrap());
                        seen.push(v);
                    }
                    Err(AvringError::NoBuffer) => std::thread::yield_now(),
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }

            // Gapped but strictly increasing: per-consumer FIFO holds even
            // when frames are lost to overwrite.
            for pair in seen.windows(2) {
                assert!(pair[1] > pair[0]);
            }
        })
        .unwrap();
    }

    #[test]
    fn test_multiple_consumer_threads() {
        let q = queue(8);
        let ids: Vec<i32> = (0..3).map(|_| q.register_consumer().unwrap()).collect();
        let total: u32 = 100;

        crossbeam::thread::scope(|s| {
            for id in &ids {
                let q = &q;
                let id = *id;
                s.spawn(move |_| {
                    let mut seen = Vec::new();
                    while seen.last() != Some(&(total - 1)) {
                        match q.consume(id) {
                            Ok(frame) => {
                                let v =
                                    u32::from_le_bytes(frame.data.as_slice().try_into().unwrap());
                                seen.push(v);
                            }
                            Err(AvringError::NoBuffer) => std::thread::yield_now(),
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                    for pair in seen.windows(2) {
                        assert!(pair[1] > pair[0]);
                    }
                });
            }

            for v in 0..total {
                produce_u32(&q, v);
                std::thread::yield_now();
            }
        })
        .unwrap();
    }
}
