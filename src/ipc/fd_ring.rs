//! Cross-process latest-wins queue carrying file descriptors.
//!
//! The producer process creates the shared region and the fd channel
//! listener; consumer processes map the existing region and connect a
//! channel client. Slots carry a producer-local fd (typically a dma-buf)
//! plus a signed reference count; consumers receive a translated duplicate
//! of the fd through the channel.
//!
//! Refcount states per slot: `> 0` referenced by consumers (live), `0` idle
//! with the release callback still owed, `-1` idle with the callback
//! already fired. The producer uses the `-1` sentinel to avoid firing the
//! callback twice when it overwrites a slot nobody referenced.
//!
//! Locking: one process-shared semaphore in the header covers every read
//! and write of cursors and slots. The consume path keeps holding it across
//! the fd round-trip to the producer, which serializes consumers behind the
//! channel latency; the producer's reply path deliberately reads the slot
//! table without the semaphore so it cannot deadlock against a consumer
//! mid-consume. A process that dies while holding the semaphore wedges the
//! queue — there is no holder-death recovery.

use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::constants::{DEFAULT_SHM_NAME, DEFAULT_SOCKET_PATH, MAX_CAPACITY, MIN_CAPACITY};
use crate::error::{AvringError, Result};
use crate::ipc::dmabuf;
use crate::ipc::fd_channel::{FdClient, FdListener};
use crate::ipc::shm::SharedRegion;

/// Callback invoked when a slot's buffer is no longer referenced: the last
/// consumer unref'd it, or the producer overwrote it. Receives the queue
/// and the producer-local fd that was stored in the slot.
///
/// Runs with the queue semaphore held on the consumer-unref path; do not
/// call back into queue operations from it.
pub type ReleaseCallback = Box<dyn Fn(&FdQueue, RawFd) + Send + Sync>;

/// Configuration for [`FdQueue`].
///
/// The shared-memory name and socket path default to the well-known values
/// but are parameters so that independent queues can coexist.
#[derive(Debug, Clone)]
pub struct FdQueueConfig {
    capacity: u8,
    shm_name: String,
    socket_path: PathBuf,
}

impl FdQueueConfig {
    /// Validate the capacity and apply the default resource names.
    pub fn new(capacity: u8) -> Result<Self> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(AvringError::config(format!(
                "capacity {} outside [{}, {}]",
                capacity, MIN_CAPACITY, MAX_CAPACITY
            )));
        }
        Ok(Self {
            capacity,
            shm_name: DEFAULT_SHM_NAME.to_owned(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        })
    }

    /// Use a custom shared-memory object name.
    pub fn with_shm_name(mut self, shm_name: impl Into<String>) -> Self {
        self.shm_name = shm_name.into();
        self
    }

    /// Use a custom fd channel socket path.
    pub fn with_socket_path(mut self, socket_path: impl Into<PathBuf>) -> Self {
        self.socket_path = socket_path.into();
        self
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    pub fn shm_name(&self) -> &str {
        &self.shm_name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Reference to a ring slot, as handed out by [`FdQueue::consume`]. The
/// caller owes exactly one [`FdQueue::unref`] per consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef(pub(crate) u8);

impl SlotRef {
    /// Slot offset within the ring.
    pub fn offset(&self) -> u8 {
        self.0
    }
}

/// One consumed item: the slot reference to unref later, and the fd
/// translated into this process, or None when the channel round-trip timed
/// out (the consume still counts and must still be unref'd).
#[derive(Debug)]
pub struct FdFrame {
    pub slot: SlotRef,
    pub fd: Option<OwnedFd>,
}

/// Cross-process SPMC fd queue with latest-wins overwrite.
pub struct FdQueue {
    region: SharedRegion,
    is_producer: bool,
    release_cb: ReleaseCallback,
    local_consumers: Mutex<Vec<i32>>,
    listener: Option<FdListener>,
    client: Option<Mutex<FdClient>>,
    quit: AtomicBool,
}

impl FdQueue {
    /// Producer side: create the shared region and the channel listener.
    ///
    /// The queue does not own the fds passed to [`produce`](Self::produce);
    /// `release_cb` is where the application reclaims a buffer once the
    /// queue is done with it. None installs a no-op.
    pub fn create(config: FdQueueConfig, release_cb: Option<ReleaseCallback>) -> Result<Self> {
        let region = SharedRegion::create(config.shm_name(), config.capacity())?;
        let listener = FdListener::bind(config.socket_path())?;

        Ok(Self {
            region,
            is_producer: true,
            release_cb: release_cb.unwrap_or_else(|| Box::new(|_, _| {})),
            local_consumers: Mutex::new(Vec::new()),
            listener: Some(listener),
            client: None,
            quit: AtomicBool::new(false),
        })
    }

    /// Consumer side: map the existing region and connect to the producer's
    /// channel. The configured capacity is ignored; the header's value
    /// rules.
    pub fn acquire(config: FdQueueConfig, release_cb: Option<ReleaseCallback>) -> Result<Self> {
        let region = SharedRegion::open(config.shm_name())?;
        let client = FdClient::connect(config.socket_path())?;

        Ok(Self {
            region,
            is_producer: false,
            release_cb: release_cb.unwrap_or_else(|| Box::new(|_, _| {})),
            local_consumers: Mutex::new(Vec::new()),
            listener: None,
            client: Some(Mutex::new(client)),
            quit: AtomicBool::new(false),
        })
    }

    /// Register a new consumer with the shared registry. The consumer sees
    /// every item currently live.
    pub fn register_consumer(&self) -> Result<i32> {
        let sem = self.region.sem();
        let _guard = sem.lock()?;

        let cursors = unsafe { &mut (*self.region.header_ptr()).cursors };
        match cursors.register_consumer() {
            Some(id) => {
                self.local_consumers.lock().push(id);
                Ok(id)
            }
            None => Err(AvringError::ConsumerTableFull),
        }
    }

    /// Remove a consumer from the shared registry.
    pub fn deregister_consumer(&self, consumer_id: i32) -> Result<()> {
        let sem = self.region.sem();
        let _guard = sem.lock()?;

        let cursors = unsafe { &mut (*self.region.header_ptr()).cursors };
        cursors.deregister_consumer(consumer_id);
        self.local_consumers.lock().retain(|&id| id != consumer_id);
        Ok(())
    }

    /// Ids of all consumers registered by any process.
    pub fn enumerate_consumers(&self) -> Result<Vec<i32>> {
        let sem = self.region.sem();
        let _guard = sem.lock()?;

        let cursors = unsafe { &(*self.region.header_ptr()).cursors };
        Ok(cursors.enumerate_consumers())
    }

    /// Publish `fd` into the next slot. Never blocks on consumers; a full
    /// ring drops its oldest unread slot, firing the release callback for
    /// it outside the critical section.
    pub fn produce(&self, fd: RawFd) -> Result<()> {
        if fd < 0 {
            return Err(AvringError::config("produce requires a valid fd"));
        }

        let sem = self.region.sem();
        sem.wait()?;

        unsafe {
            let hdr = self.region.header_ptr();
            let wr = (*hdr).cursors.wr_off();

            let slot = self.region.slot_ptr(wr);
            (*slot).fd = fd;
            (*slot).ref_count = 0;

            if (*hdr).cursors.is_full() {
                // The next slot is about to be lost; release it with the
                // semaphore dropped so the callback runs unlocked.
                let victim = (*hdr).cursors.next_off(wr);
                sem.post()?;
                self.unref(SlotRef(victim));
                sem.wait()?;
            }

            (*hdr).cursors.advance_producer();
        }

        sem.post()?;
        Ok(())
    }

    /// Read the oldest slot this consumer has not seen yet, bump its
    /// refcount, and translate its fd into this process.
    ///
    /// A `fd` of None means the channel round-trip timed out; the slot
    /// still counts as consumed and the caller still owes an unref. The
    /// semaphore is held across the round-trip, mirroring the on-the-wire
    /// protocol this queue speaks.
    pub fn consume(&self, consumer_id: i32) -> Result<FdFrame> {
        let sem = self.region.sem();
        let _guard = sem.lock()?;

        let cursors = unsafe { &mut (*self.region.header_ptr()).cursors };

        let idx = cursors.find_consumer_index(consumer_id).ok_or_else(|| {
            tracing::warn!(consumer_id, "consume from unregistered consumer");
            AvringError::ConsumerNotFound { id: consumer_id }
        })?;

        if cursors.local_empty(idx) {
            tracing::debug!(consumer_id, "consume on empty local view");
            return Err(AvringError::NoBuffer);
        }

        let off = cursors.local_rd_off(idx);
        let slot = self.region.slot_ptr(off);
        let producer_fd = unsafe {
            let refs = (*slot).ref_count;
            (*slot).ref_count = refs + 1;
            (*slot).fd
        };

        cursors.advance_consumer(idx);

        let fd = if self.is_producer {
            // Already in the owning process; hand back a duplicate so the
            // caller owns what it gets, same as the channel path.
            let borrowed = unsafe { BorrowedFd::borrow_raw(producer_fd) };
            Some(borrowed.try_clone_to_owned()?)
        } else {
            let client = self
                .client
                .as_ref()
                .ok_or_else(|| AvringError::unexpected("consumer handle without channel client"))?;
            client.lock().get_fd(off)?
        };

        Ok(FdFrame {
            slot: SlotRef(off),
            fd,
        })
    }

    /// Add a reference to a slot, keeping its buffer alive past the next
    /// unref.
    pub fn ref_slot(&self, slot: SlotRef) -> Result<()> {
        let sem = self.region.sem();
        let _guard = sem.lock()?;

        let ptr = self.region.slot_ptr(slot.0);
        unsafe {
            let refs = (*ptr).ref_count;
            (*ptr).ref_count = refs + 1;
        }
        Ok(())
    }

    /// Drop a reference to a slot. Fires the release callback when the
    /// buffer becomes idle; double releases are logged and ignored.
    pub fn unref(&self, slot: SlotRef) {
        let sem = self.region.sem();
        let _guard = match sem.lock() {
            Ok(guard) => guard,
            Err(err) => {
                tracing::warn!(%err, "unref could not take queue semaphore");
                return;
            }
        };

        let ptr = self.region.slot_ptr(slot.0);
        let fd = unsafe { (*ptr).fd };
        let refs = unsafe { (*ptr).ref_count };

        if self.is_producer {
            if refs < 0 {
                tracing::warn!(offset = slot.0, "producer releasing a slot twice");
                return;
            }
            let new_refs = refs - 1;
            unsafe {
                (*ptr).ref_count = new_refs;
            }
            if new_refs == 0 || new_refs == -1 {
                (self.release_cb)(self, fd);
                if new_refs == 0 {
                    // Remember the callback fired so overwrite cannot fire
                    // it again.
                    unsafe {
                        (*ptr).ref_count = -1;
                    }
                }
            } else {
                tracing::warn!(
                    offset = slot.0,
                    ref_count = new_refs,
                    "producer overwrote a slot still referenced by consumers"
                );
            }
        } else {
            if refs <= 0 {
                tracing::warn!(offset = slot.0, "consumer releasing a slot twice");
                return;
            }
            let new_refs = refs - 1;
            unsafe {
                (*ptr).ref_count = new_refs;
            }
            if new_refs == 0 {
                (self.release_cb)(self, fd);
            }
        }
    }

    /// Issue the dma-buf cpu-access begin ioctl on the slot's fd. Opaque
    /// pass-through; only meaningful when the fd really is a dma-buf and
    /// this process can address it.
    pub fn dmabuf_lock(&self, slot: SlotRef) -> Result<()> {
        let fd = unsafe { (*self.region.slot_ptr(slot.0)).fd };
        dmabuf::lock(fd)
    }

    /// Issue the dma-buf cpu-access end ioctl on the slot's fd.
    pub fn dmabuf_unlock(&self, slot: SlotRef) -> Result<()> {
        let fd = unsafe { (*self.region.slot_ptr(slot.0)).fd };
        dmabuf::unlock(fd)
    }

    /// Number of live items between the slowest consumer and the producer.
    pub fn len(&self) -> Result<usize> {
        let sem = self.region.sem();
        let _guard = sem.lock()?;
        let cursors = unsafe { &(*self.region.header_ptr()).cursors };
        Ok(cursors.len() as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        let sem = self.region.sem();
        let _guard = sem.lock()?;
        let cursors = unsafe { &(*self.region.header_ptr()).cursors };
        Ok(cursors.is_empty())
    }

    pub fn is_full(&self) -> Result<bool> {
        let sem = self.region.sem();
        let _guard = sem.lock()?;
        let cursors = unsafe { &(*self.region.header_ptr()).cursors };
        Ok(cursors.is_full())
    }

    /// Whether `consumer_id` has nothing left to read.
    pub fn local_empty(&self, consumer_id: i32) -> Result<bool> {
        let sem = self.region.sem();
        let _guard = sem.lock()?;
        let cursors = unsafe { &(*self.region.header_ptr()).cursors };
        let idx = cursors
            .find_consumer_index(consumer_id)
            .ok_or(AvringError::ConsumerNotFound { id: consumer_id })?;
        Ok(cursors.local_empty(idx))
    }

    /// Whether `consumer_id` lags a full ring behind the producer.
    pub fn local_full(&self, consumer_id: i32) -> Result<bool> {
        let sem = self.region.sem();
        let _guard = sem.lock()?;
        let cursors = unsafe { &(*self.region.header_ptr()).cursors };
        let idx = cursors
            .find_consumer_index(consumer_id)
            .ok_or(AvringError::ConsumerNotFound { id: consumer_id })?;
        Ok(cursors.local_full(idx))
    }

    /// Compare the global read cursor against one consumer's cursor.
    pub fn compare_read_speed(&self, consumer_id: i32) -> Result<std::cmp::Ordering> {
        let sem = self.region.sem();
        let _guard = sem.lock()?;
        let cursors = unsafe { &(*self.region.header_ptr()).cursors };
        let idx = cursors
            .find_consumer_index(consumer_id)
            .ok_or(AvringError::ConsumerNotFound { id: consumer_id })?;
        Ok(cursors.compare_read_speed(idx))
    }

    /// Offset of the slowest registered consumer.
    pub fn slowest_rd_off(&self) -> Result<u8> {
        let sem = self.region.sem();
        let _guard = sem.lock()?;
        let cursors = unsafe { &(*self.region.header_ptr()).cursors };
        Ok(cursors.slowest_rd_off())
    }

    /// Wait up to one poll interval for channel activity and return a
    /// readable client connection, if any. Producer side only.
    pub fn producer_has_data(&self) -> Result<Option<RawFd>> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| AvringError::unexpected("producer_has_data on a consumer handle"))?;
        listener.poll_ready()
    }

    /// Serve one fd request from `client`: read the offset byte, look up
    /// the slot's fd, and reply with it attached.
    ///
    /// Runs without the queue semaphore: the requesting consumer is inside
    /// its own consume critical section while it waits for this reply.
    pub fn producer_handle_data(&self, client: RawFd) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| AvringError::unexpected("producer_handle_data on a consumer handle"))?;

        if let Some(offset) = listener.recv_request(client)? {
            let fd = if offset < self.region.capacity() {
                let raw = unsafe { (*self.region.slot_ptr(offset)).fd };
                (raw > 0).then_some(raw)
            } else {
                tracing::warn!(offset, "fd request for offset outside the ring");
                None
            };
            listener.send_reply(client, fd)?;
        }

        Ok(())
    }

    /// Serve fd requests until [`producer_quit`](Self::producer_quit) is
    /// called. Run this on a dedicated producer-process thread; errors on
    /// individual clients are logged and do not stop the loop.
    pub fn producer_run(&self) {
        while !self.quit.load(Ordering::Relaxed) {
            match self.producer_has_data() {
                Ok(Some(client)) => {
                    if let Err(err) = self.producer_handle_data(client) {
                        tracing::warn!(%err, "fd channel request failed");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(%err, "fd channel poll failed");
                    return;
                }
            }
        }
    }

    /// Ask [`producer_run`](Self::producer_run) to return. Takes effect
    /// within one poll interval.
    pub fn producer_quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
    }
}

impl Drop for FdQueue {
    fn drop(&mut self) {
        if self.is_producer {
            self.producer_quit();
            // SharedRegion destroys the semaphore and unlinks the shm name;
            // FdListener removes the socket file.
        } else {
            // Leave shared resources alone, but take this handle's
            // consumers out of the registry.
            let ids: Vec<i32> = self.local_consumers.lock().clone();
            for id in ids {
                if let Err(err) = self.deregister_consumer(id) {
                    tracing::warn!(consumer_id = id, %err, "deregister on release failed");
                }
            }
        }
    }
}
