//! dma-buf cpu-access sync ioctls, pass-through only.
//!
//! Buffers traveling through the fd queue are typically dma-buf handles;
//! CPU reads and writes of such a buffer must be bracketed by
//! `DMA_BUF_IOCTL_SYNC` begin/end calls. This module forwards those ioctls
//! verbatim and knows nothing else about the buffers.

use std::os::fd::RawFd;

use crate::error::Result;

/// Mirror of `struct dma_buf_sync` from linux/dma-buf.h.
#[repr(C)]
pub struct DmaBufSync {
    pub flags: u64,
}

pub const DMA_BUF_SYNC_READ: u64 = 1 << 0;
pub const DMA_BUF_SYNC_WRITE: u64 = 2 << 0;
pub const DMA_BUF_SYNC_RW: u64 = DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE;
pub const DMA_BUF_SYNC_START: u64 = 0 << 2;
pub const DMA_BUF_SYNC_END: u64 = 1 << 2;

// DMA_BUF_BASE is 'b', DMA_BUF_IOCTL_SYNC is _IOW('b', 0, struct dma_buf_sync).
nix::ioctl_write_ptr!(dma_buf_ioctl_sync, b'b', 0, DmaBufSync);

/// Begin CPU access on a dma-buf fd.
pub fn lock(fd: RawFd) -> Result<()> {
    let sync = DmaBufSync {
        flags: DMA_BUF_SYNC_RW | DMA_BUF_SYNC_START,
    };
    unsafe { dma_buf_ioctl_sync(fd, &sync) }?;
    Ok(())
}

/// End CPU access on a dma-buf fd.
pub fn unlock(fd: RawFd) -> Result<()> {
    let sync = DmaBufSync {
        flags: DMA_BUF_SYNC_RW | DMA_BUF_SYNC_END,
    };
    unsafe { dma_buf_ioctl_sync(fd, &sync) }?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_sync_on_non_dmabuf_fd_fails() {
        // A memfd is not a dma-buf; the kernel rejects the ioctl. The
        // wrappers must surface that instead of swallowing it.
        let name = CString::new("avring-dmabuf-test").unwrap();
        let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
        assert!(fd >= 0);

        assert!(lock(fd).is_err());
        assert!(unlock(fd).is_err());

        unsafe {
            libc::close(fd);
        }
    }
}
