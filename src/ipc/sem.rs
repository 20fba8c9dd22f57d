//! Process-shared semaphore embedded in a mapped region.
//!
//! The queue header starts with an unnamed POSIX semaphore (`sem_t`,
//! `pshared = 1`) so that unrelated processes mapping the same shared-memory
//! object can serialize on it. nix has no binding for unnamed semaphores,
//! so this wraps the libc calls directly.
//!
//! A process that dies while holding the semaphore wedges the queue; there
//! is no robust-mutex style recovery here.

use std::io;

/// Thin handle over a `sem_t` living at a fixed address inside a shared
/// mapping. The handle does not own the memory.
#[derive(Clone, Copy)]
pub(crate) struct SharedSem {
    sem: *mut libc::sem_t,
}

impl SharedSem {
    /// Wrap the semaphore at `sem`.
    ///
    /// # Safety
    /// `sem` must point into a live MAP_SHARED region with room for a
    /// `sem_t`, and must stay valid for the lifetime of the handle.
    pub(crate) unsafe fn from_ptr(sem: *mut libc::sem_t) -> Self {
        Self { sem }
    }

    /// Initialize the semaphore for cross-process use with `value` tokens.
    /// Only the creating process calls this, on zeroed memory.
    pub(crate) fn init(&self, value: u32) -> io::Result<()> {
        let rc = unsafe { libc::sem_init(self.sem, 1, value) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until a token is available. Retries on EINTR.
    pub(crate) fn wait(&self) -> io::Result<()> {
        loop {
            let rc = unsafe { libc::sem_wait(self.sem) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Release a token.
    pub(crate) fn post(&self) -> io::Result<()> {
        let rc = unsafe { libc::sem_post(self.sem) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Destroy the semaphore. Only the creating process calls this, after
    /// all users are gone.
    pub(crate) fn destroy(&self) {
        unsafe {
            libc::sem_destroy(self.sem);
        }
    }

    /// Wait, returning a guard that posts on drop.
    pub(crate) fn lock(&self) -> io::Result<SemGuard> {
        self.wait()?;
        Ok(SemGuard { sem: *self })
    }
}

// The pointer targets process-shared memory; the semaphore itself is the
// synchronization primitive.
unsafe impl Send for SharedSem {}
unsafe impl Sync for SharedSem {}

/// Posts the semaphore when dropped.
pub(crate) struct SemGuard {
    sem: SharedSem,
}

impl Drop for SemGuard {
    fn drop(&mut self) {
        if let Err(err) = self.sem.post() {
            tracing::warn!(%err, "failed to post queue semaphore");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_lock_unlock() {
        let mut storage: libc::sem_t = unsafe { std::mem::zeroed() };
        let sem = unsafe { SharedSem::from_ptr(&mut storage) };
        sem.init(1).unwrap();

        {
            let _guard = sem.lock().unwrap();
        }
        // A second lock succeeds only if the guard posted.
        let _guard = sem.lock().unwrap();
        drop(_guard);

        sem.destroy();
    }

    #[test]
    fn test_explicit_wait_post() {
        let mut storage: libc::sem_t = unsafe { std::mem::zeroed() };
        let sem = unsafe { SharedSem::from_ptr(&mut storage) };
        sem.init(1).unwrap();

        sem.wait().unwrap();
        sem.post().unwrap();
        sem.wait().unwrap();
        sem.post().unwrap();

        sem.destroy();
    }
}
