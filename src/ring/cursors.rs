//! Cursor state for a latest-wins SPMC ring.
//!
//! `RingCursors` holds nothing but offsets and the consumer registry, and it
//! knows nothing about payloads or locking. The in-process queue embeds it
//! behind a mutex; the cross-process queue places it verbatim inside the
//! shared-memory header, which is why the struct is `repr(C, packed)` and
//! why every array walk below is an index loop (references into packed
//! fields are rejected by the compiler, and the layout must match on both
//! sides of the process boundary byte for byte).
//!
//! The ring keeps one slot empty to distinguish empty from full, so a ring
//! of capacity N carries at most N - 1 items. The producer never blocks:
//! when the ring is full the oldest unread slot is overwritten and every
//! cursor still pointing at it is fast-forwarded past the loss.

use std::cmp::Ordering;

use crate::constants::{EMPTY_CONSUMER, INVALID_OFFSET, MAX_CONSUMERS};

/// Offsets and consumer registry for one SPMC ring.
///
/// All operations assume the caller holds the queue's mutual-exclusion
/// primitive; this type performs no synchronization of its own.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct RingCursors {
    capacity: u8,
    wr_off: u8,
    rd_off: u8,
    rd_off_local: [u8; MAX_CONSUMERS],
    consumer: [i32; MAX_CONSUMERS],
    consumer_id_seq_no: i32,
}

impl RingCursors {
    /// Fresh cursor state for a ring of `capacity` slots.
    ///
    /// Capacity validation happens in the queue configs; this type trusts
    /// its caller.
    pub fn new(capacity: u8) -> Self {
        let mut cursors = RingCursors {
            capacity: 0,
            wr_off: 0,
            rd_off: 0,
            rd_off_local: [0; MAX_CONSUMERS],
            consumer: [0; MAX_CONSUMERS],
            consumer_id_seq_no: 0,
        };
        cursors.init(capacity);
        cursors
    }

    /// Initialize in place. Used on zeroed shared memory, where the struct
    /// already exists at a fixed address and only the fields need setting.
    pub fn init(&mut self, capacity: u8) {
        self.capacity = capacity;
        self.wr_off = 0;
        self.rd_off = 0;
        self.rd_off_local = [0; MAX_CONSUMERS];
        self.consumer = [EMPTY_CONSUMER; MAX_CONSUMERS];
        self.consumer_id_seq_no = 0;
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    pub fn wr_off(&self) -> u8 {
        self.wr_off
    }

    pub fn rd_off(&self) -> u8 {
        self.rd_off
    }

    /// Local read cursor of the consumer at table index `idx`.
    pub fn local_rd_off(&self, idx: usize) -> u8 {
        self.rd_off_local[idx]
    }

    /// Number of items between the global read cursor and the write cursor.
    pub fn len(&self) -> u8 {
        self.dist_behind_wr(self.rd_off)
    }

    pub fn is_empty(&self) -> bool {
        self.wr_off == self.rd_off
    }

    pub fn is_full(&self) -> bool {
        self.next_off(self.wr_off) == self.rd_off
    }

    /// Whether the consumer at `idx` has nothing left to read.
    pub fn local_empty(&self, idx: usize) -> bool {
        self.wr_off == self.rd_off_local[idx]
    }

    /// Whether the consumer at `idx` lags a full ring behind the producer.
    pub fn local_full(&self, idx: usize) -> bool {
        self.next_off(self.wr_off) == self.rd_off_local[idx]
    }

    /// Next offset in ring order.
    pub fn next_off(&self, off: u8) -> u8 {
        ((off as u16 + 1) % self.capacity as u16) as u8
    }

    /// How far `off` trails the write cursor, in ring-forward direction.
    /// 0 means caught up with the producer.
    fn dist_behind_wr(&self, off: u8) -> u8 {
        ((self.wr_off as u16 + self.capacity as u16 - off as u16) % self.capacity as u16) as u8
    }

    /// Allocate the next consumer id and place it in the first free table
    /// slot. The new consumer starts at the global read cursor, so it sees
    /// every item currently live.
    ///
    /// The id sequence advances even when the table is full; the id space
    /// is not reclaimed on failure.
    pub fn register_consumer(&mut self) -> Option<i32> {
        let consumer_id = self.consumer_id_seq_no;
        self.consumer_id_seq_no += 1;

        for i in 0..MAX_CONSUMERS {
            if self.consumer[i] == EMPTY_CONSUMER {
                self.consumer[i] = consumer_id;
                self.rd_off_local[i] = self.rd_off;
                return Some(consumer_id);
            }
        }

        None
    }

    /// Clear the consumer's table slot. Other cursors are left untouched.
    pub fn deregister_consumer(&mut self, consumer_id: i32) {
        for i in 0..MAX_CONSUMERS {
            if self.consumer[i] == consumer_id {
                self.consumer[i] = EMPTY_CONSUMER;
                break;
            }
        }
    }

    /// Registered consumer ids, in table order.
    pub fn enumerate_consumers(&self) -> Vec<i32> {
        let mut ids = Vec::new();
        for i in 0..MAX_CONSUMERS {
            if self.consumer[i] != EMPTY_CONSUMER {
                ids.push(self.consumer[i]);
            }
        }
        ids
    }

    /// Table index for a consumer id.
    pub fn find_consumer_index(&self, consumer_id: i32) -> Option<usize> {
        (0..MAX_CONSUMERS).find(|&i| self.consumer[i] == consumer_id)
    }

    pub fn consumer_count(&self) -> usize {
        (0..MAX_CONSUMERS)
            .filter(|&i| self.consumer[i] != EMPTY_CONSUMER)
            .count()
    }

    /// Cursor bookkeeping after the producer has written `slot[wr_off]`.
    ///
    /// Advances the write cursor, and if that collides with the global read
    /// cursor the oldest item is gone and the global cursor moves past it.
    /// Any local cursor sitting on the new write position was pointing at
    /// the slot that will be overwritten next; it is fast-forwarded so the
    /// consumer silently skips the lost item instead of reading a slot the
    /// producer is about to reuse.
    pub fn advance_producer(&mut self) {
        self.wr_off = self.next_off(self.wr_off);

        if self.rd_off == self.wr_off {
            self.rd_off = self.next_off(self.rd_off);
        }

        for i in 0..MAX_CONSUMERS {
            if self.consumer[i] != EMPTY_CONSUMER && self.rd_off_local[i] == self.wr_off {
                self.rd_off_local[i] = self.next_off(self.rd_off_local[i]);
            }
        }
    }

    /// Cursor bookkeeping after the consumer at `idx` has read its slot.
    ///
    /// Advances the local cursor, then checks whether every registered
    /// consumer is now strictly ahead of the global read cursor; if so the
    /// global cursor jumps to the slowest local one, freeing the slots
    /// behind it for reuse. This is the only path that releases slots while
    /// consumers are registered.
    pub fn advance_consumer(&mut self, idx: usize) {
        self.rd_off_local[idx] = self.next_off(self.rd_off_local[idx]);

        let mut consumer_count = 0;
        let mut fast_consumer_count = 0;
        for i in 0..MAX_CONSUMERS {
            if self.consumer[i] != EMPTY_CONSUMER {
                consumer_count += 1;
                if self.compare_read_speed(i) == Ordering::Less {
                    fast_consumer_count += 1;
                }
            }
        }

        if fast_consumer_count == consumer_count && fast_consumer_count > 0 {
            self.rd_off = self.slowest_rd_off();

            if self.rd_off == INVALID_OFFSET {
                tracing::warn!("invalid slowest offset with consumers registered");
            }
        }
    }

    /// Compare the global read cursor's progress against the consumer at
    /// `idx`.
    ///
    /// `Less` means the global cursor is further behind the producer than
    /// the local one (the consumer is faster), `Greater` the opposite.
    /// A cursor equal to the write cursor has caught up and counts as the
    /// fastest possible.
    pub fn compare_read_speed(&self, idx: usize) -> Ordering {
        if self.rd_off == self.rd_off_local[idx] {
            return Ordering::Equal;
        }

        let global_dist = self.dist_behind_wr(self.rd_off);
        let local_dist = self.dist_behind_wr(self.rd_off_local[idx]);

        if global_dist == 0 {
            // The ring is globally empty; a local cursor elsewhere would
            // have overtaken the producer, which the produce path prevents.
            if local_dist != 0 {
                tracing::warn!("ring empty but a local read cursor is ahead");
            }
            return Ordering::Equal;
        }

        if local_dist == 0 {
            return Ordering::Less;
        }

        // Distances are distinct here because offsets are distinct.
        if global_dist > local_dist {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// Offset of the slowest registered consumer, or [`INVALID_OFFSET`]
    /// when no consumer is registered.
    ///
    /// Slowest means the largest forward distance behind the write cursor.
    /// A cursor equal to the write cursor has consumed everything and is
    /// the fastest; it gets a substitute distance so it never wins.
    pub fn slowest_rd_off(&self) -> u8 {
        let mut ret = INVALID_OFFSET;
        let mut min_diff = MAX_CONSUMERS as i32 + 1;

        for i in 0..MAX_CONSUMERS {
            if self.consumer[i] == EMPTY_CONSUMER {
                continue;
            }

            let mut diff = self.rd_off_local[i] as i32 - self.wr_off as i32;
            if diff == 0 {
                diff = MAX_CONSUMERS as i32;
            } else if diff < 0 {
                diff += self.capacity as i32;
            }

            if diff < min_diff {
                min_diff = diff;
                ret = self.rd_off_local[i];
            }
        }

        ret
    }
}
