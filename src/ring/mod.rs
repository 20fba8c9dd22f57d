//! Latest-wins SPMC ring machinery.
//!
//! - [`cursors`] — the cursor algebra shared by both queue variants
//! - [`frame_queue`] — the in-process, byte-copy queue

pub mod cursors;
pub mod frame_queue;

pub use cursors::RingCursors;
pub use frame_queue::{Frame, FrameQueue, FrameQueueConfig};
