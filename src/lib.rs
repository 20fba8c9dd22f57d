//! avring - Latest-wins SPMC queues for low-latency A/V frame transport
//!
//! Two queue variants share one cursor algebra:
//!
//! - [`FrameQueue`]: producer and consumers are threads of one process;
//!   payloads are byte buffers copied through a preallocated pool.
//! - [`FdQueue`]: producer and consumers are separate processes sharing the
//!   ring through shared memory; slots carry file descriptors (typically
//!   dma-buf handles), translated between processes over a Unix-socket side
//!   channel.
//!
//! ```text
//! Producer process            Shared Memory             Consumer process
//! ┌──────────────┐      ┌────────────────────────┐      ┌──────────────┐
//! │ produce(fd) ─┼──────┼─► sem │ cursors │ slots ┼──────┼─ consume(id) │
//! │              │      └────────────────────────┘      │      │       │
//! │ fd listener ◄┼──────── one byte: slot offset ───────┼──────┘       │
//! │              ├───── SCM_RIGHTS: duplicated fd ──────►              │
//! └──────────────┘                                      └──────────────┘
//! ```
//!
//! The defining semantic is latest-wins with slow-consumer tolerance: the
//! producer never blocks. When the ring is full the oldest unread slot is
//! overwritten, and any consumer still pointing there silently skips the
//! lost item. Each registered consumer sees each item at most once, in
//! production order.

pub mod constants;
pub mod error;
pub mod ipc;
pub mod ring;

// Re-export main components
pub use error::{AvringError, Result};
pub use ipc::{FdFrame, FdQueue, FdQueueConfig, ReleaseCallback, SlotRef};
pub use ring::{Frame, FrameQueue, FrameQueueConfig, RingCursors};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_queue_smoke() {
        let config = FrameQueueConfig::new(8, 1024).unwrap();
        let queue = FrameQueue::new(config).unwrap();
        let id = queue.register_consumer().unwrap();

        queue.produce(b"Hello, avring!", 1).unwrap();
        let frame = queue.consume(id).unwrap();

        assert_eq!(frame.data, b"Hello, avring!");
        assert_eq!(frame.frame_type, 1);
    }

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
