//! Shared-memory layout and lifecycle for the cross-process queue.
//!
//! The region holds a packed header followed by `capacity` fd slots:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ ShmHeader                                                    │
//! │  ├─ sem_t            process-shared semaphore, offset 0      │
//! │  └─ RingCursors      capacity, wr_off, rd_off,               │
//! │                      rd_off_local[4], consumer[4], seq_no    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ FdSlot[capacity]     { fd: i32, ref_count: i32 } each        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything is packed: producer and consumer binaries map the same bytes
//! and must agree on every offset, so no compiler padding is tolerated.
//! The slot array starts straight after the header and is therefore not
//! 4-aligned; slots are only ever read and written by value through raw
//! pointers.
//!
//! The producer creates, truncates, zeroes and later unlinks the object;
//! consumers open and map what exists and never unlink.

use std::fs::File;
use std::mem;
use std::ptr;

use memmap2::MmapRaw;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use static_assertions::const_assert_eq;

use crate::constants::{MAX_CAPACITY, MAX_CONSUMERS, MIN_CAPACITY};
use crate::error::{AvringError, Result};
use crate::ipc::sem::SharedSem;
use crate::ring::cursors::RingCursors;

/// One ring slot: a producer-local fd and its signed reference count.
///
/// `ref_count` values: > 0 referenced by consumers, 0 idle with the release
/// callback still pending, -1 idle with the callback already fired.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub(crate) struct FdSlot {
    pub(crate) fd: i32,
    pub(crate) ref_count: i32,
}

/// Header at offset 0 of the shared region, semaphore first.
///
/// `sem` is stored as a raw byte buffer rather than `libc::sem_t` directly:
/// `sem_t` carries a `#[repr(align)]` attribute that a packed struct cannot
/// transitively contain (rustc E0588), even though nothing here ever reads
/// `sem` except through a raw, unaligned-capable pointer cast back to
/// `libc::sem_t` (see `SharedRegion::sem`). The byte representation and
/// offsets are unchanged.
#[repr(C, packed)]
pub(crate) struct ShmHeader {
    pub(crate) sem: [u8; mem::size_of::<libc::sem_t>()],
    pub(crate) cursors: RingCursors,
}

// The shared ABI: both sides of the process boundary must see these exact
// sizes or the cursor fields will shear.
const_assert_eq!(mem::size_of::<FdSlot>(), 8);
const_assert_eq!(
    mem::size_of::<RingCursors>(),
    3 + MAX_CONSUMERS + 4 * MAX_CONSUMERS + 4
);
const_assert_eq!(
    mem::size_of::<ShmHeader>(),
    mem::size_of::<libc::sem_t>() + mem::size_of::<RingCursors>()
);

/// A mapped shared-memory object holding one fd ring.
pub(crate) struct SharedRegion {
    map: MmapRaw,
    _file: File,
    shm_name: String,
    owner: bool,
    capacity: u8,
}

impl SharedRegion {
    fn region_len(capacity: u8) -> usize {
        mem::size_of::<ShmHeader>() + capacity as usize * mem::size_of::<FdSlot>()
    }

    /// Producer side: create or replace the named object, size it, zero it,
    /// and initialize header and semaphore.
    pub(crate) fn create(shm_name: &str, capacity: u8) -> Result<Self> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(AvringError::config(format!(
                "capacity {} outside [{}, {}]",
                capacity, MIN_CAPACITY, MAX_CAPACITY
            )));
        }

        let fd = shm_open(
            shm_name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )?;
        let file = File::from(fd);

        let len = Self::region_len(capacity);
        ftruncate(&file, len as libc::off_t)?;

        let map = MmapRaw::map_raw(&file)?;

        let region = Self {
            map,
            _file: file,
            shm_name: shm_name.to_owned(),
            owner: true,
            capacity,
        };

        unsafe {
            ptr::write_bytes(region.map.as_mut_ptr(), 0, len);
            (*region.header_ptr()).cursors.init(capacity);
        }
        region.sem().init(1)?;

        Ok(region)
    }

    /// Consumer side: open and map an object the producer already set up.
    pub(crate) fn open(shm_name: &str) -> Result<Self> {
        let fd = shm_open(shm_name, OFlag::O_RDWR, Mode::empty())?;
        let file = File::from(fd);

        let len = file.metadata()?.len() as usize;
        if len < mem::size_of::<ShmHeader>() {
            return Err(AvringError::unexpected(format!(
                "shared region '{shm_name}' too small: {len} bytes"
            )));
        }

        let map = MmapRaw::map_raw(&file)?;

        let mut region = Self {
            map,
            _file: file,
            shm_name: shm_name.to_owned(),
            owner: false,
            capacity: 0,
        };

        let capacity = unsafe { (*region.header_ptr()).cursors.capacity() };
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity)
            || len < Self::region_len(capacity)
        {
            return Err(AvringError::unexpected(format!(
                "shared region '{shm_name}' has inconsistent capacity {capacity}"
            )));
        }
        region.capacity = capacity;

        Ok(region)
    }

    pub(crate) fn capacity(&self) -> u8 {
        self.capacity
    }

    pub(crate) fn header_ptr(&self) -> *mut ShmHeader {
        self.map.as_mut_ptr() as *mut ShmHeader
    }

    /// The embedded process-shared semaphore.
    pub(crate) fn sem(&self) -> SharedSem {
        unsafe {
            SharedSem::from_ptr(ptr::addr_of_mut!((*self.header_ptr()).sem) as *mut libc::sem_t)
        }
    }

    /// Raw pointer to the slot at `off`. The slot array is unaligned; use
    /// by-value reads and writes only.
    pub(crate) fn slot_ptr(&self, off: u8) -> *mut FdSlot {
        debug_assert!(off < self.capacity);
        unsafe {
            (self.map.as_mut_ptr().add(mem::size_of::<ShmHeader>()) as *mut FdSlot)
                .add(off as usize)
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owner {
            self.sem().destroy();
            if let Err(err) = shm_unlink(self.shm_name.as_str()) {
                tracing::warn!(name = %self.shm_name, %err, "failed to unlink shared region");
            }
        }
        // The mapping and the fd close with their fields.
    }
}
