//! Property tests over the cursor algebra and the in-process queue.

use proptest::prelude::*;

use avring::constants::{MAX_CAPACITY, MAX_CONSUMERS, MIN_CAPACITY};
use avring::{FrameQueue, FrameQueueConfig, RingCursors};

#[derive(Debug, Clone)]
enum Op {
    Produce,
    Consume(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            2 => Just(Op::Produce),
            3 => (0..MAX_CONSUMERS).prop_map(Op::Consume),
        ],
        0..200,
    )
}

proptest! {
    /// Occupancy and every cursor stay inside the ring, whatever the
    /// schedule.
    #[test]
    fn occupancy_and_cursors_stay_bounded(
        capacity in MIN_CAPACITY..=MAX_CAPACITY,
        consumers in 0..=MAX_CONSUMERS,
        ops in ops(),
    ) {
        let mut cursors = RingCursors::new(capacity);
        let mut idxs = Vec::new();
        for _ in 0..consumers {
            let id = cursors.register_consumer().unwrap();
            idxs.push(cursors.find_consumer_index(id).unwrap());
        }

        for op in ops {
            match op {
                Op::Produce => cursors.advance_producer(),
                Op::Consume(k) if !idxs.is_empty() => {
                    let idx = idxs[k % idxs.len()];
                    if !cursors.local_empty(idx) {
                        cursors.advance_consumer(idx);
                    }
                }
                Op::Consume(_) => {}
            }

            prop_assert!(cursors.len() < capacity);
            prop_assert!(cursors.wr_off() < capacity);
            prop_assert!(cursors.rd_off() < capacity);
            for &idx in &idxs {
                prop_assert!(cursors.local_rd_off(idx) < capacity);
            }
        }
    }

    /// Each consumer observes a strictly increasing, possibly gapped
    /// subsequence of the produced values.
    #[test]
    fn per_consumer_fifo_is_gapped_subsequence(ops in ops()) {
        let queue = FrameQueue::new(FrameQueueConfig::new(8, 8).unwrap()).unwrap();
        let ids = [
            queue.register_consumer().unwrap(),
            queue.register_consumer().unwrap(),
        ];
        let mut next = 0u32;
        let mut seen: [Vec<u32>; 2] = [Vec::new(), Vec::new()];

        for op in ops {
            match op {
                Op::Produce => {
                    queue.produce(&next.to_le_bytes(), 0).unwrap();
                    next += 1;
                }
                Op::Consume(k) => {
                    let who = k % 2;
                    if let Ok(frame) = queue.consume(ids[who]) {
                        let v = u32::from_le_bytes(frame.data.as_slice().try_into().unwrap());
                        seen[who].push(v);
                    }
                }
            }
        }

        for observed in &seen {
            for pair in observed.windows(2) {
                prop_assert!(pair[1] > pair[0]);
            }
        }
    }

    /// After an unobserved burst, a consumer registered up front reads
    /// exactly the newest capacity - 1 values, in order.
    #[test]
    fn latest_wins_after_burst(
        capacity in MIN_CAPACITY..=MAX_CAPACITY,
        burst in 1usize..200,
    ) {
        let queue = FrameQueue::new(FrameQueueConfig::new(capacity, 8).unwrap()).unwrap();
        let id = queue.register_consumer().unwrap();

        for v in 0..burst as u32 {
            queue.produce(&v.to_le_bytes(), 0).unwrap();
        }

        let live = (capacity as usize - 1).min(burst);
        prop_assert_eq!(queue.len(), live);

        let mut expected = (burst - live) as u32;
        while let Ok(frame) = queue.consume(id) {
            let v = u32::from_le_bytes(frame.data.as_slice().try_into().unwrap());
            prop_assert_eq!(v, expected);
            expected += 1;
        }
        prop_assert_eq!(expected, burst as u32);
    }
}
