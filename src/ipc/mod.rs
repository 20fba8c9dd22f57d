//! Cross-process zero-copy queue: shared-memory ring, process-shared
//! semaphore, fd translation channel, and dma-buf sync pass-through.

pub mod dmabuf;
pub(crate) mod fd_channel;
pub mod fd_ring;
pub(crate) mod sem;
pub(crate) mod shm;

pub use fd_ring::{FdFrame, FdQueue, FdQueueConfig, ReleaseCallback, SlotRef};
