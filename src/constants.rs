//! Queue limits and well-known resource names.
//!
//! The cross-process variant shares these values through a packed header, so
//! producer and consumer binaries must be built against the same constants.

use std::time::Duration;

/// Maximum number of simultaneously registered consumers per queue.
pub const MAX_CONSUMERS: usize = 4;

/// Minimum ring capacity (one slot is always kept empty, so 2 is the
/// smallest ring that can hold an item).
pub const MIN_CAPACITY: u8 = 2;

/// Maximum ring capacity. Offsets are stored as `u8` in the shared header,
/// and 0xFF is reserved as the invalid-offset sentinel.
pub const MAX_CAPACITY: u8 = 64;

/// Sentinel for "no valid slot offset".
pub const INVALID_OFFSET: u8 = 0xFF;

/// Consumer-table entry meaning "slot free".
pub const EMPTY_CONSUMER: i32 = -1;

/// Default POSIX shared-memory object name for the fd queue.
pub const DEFAULT_SHM_NAME: &str = "fdzcq";

/// Default Unix socket path for the fd translation channel.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/fdzcq.sock";

/// Listen backlog for the fd translation channel.
pub const CHANNEL_BACKLOG: usize = 10;

/// Send/receive timeout on the consumer side of the fd channel.
pub const CHANNEL_IO_TIMEOUT: Duration = Duration::from_millis(100);

/// Poll timeout for the producer-side readiness check.
pub const CHANNEL_POLL_TIMEOUT_MS: u16 = 1000;

/// Validate that the constants are mutually consistent.
pub fn validate_constants() -> Result<(), &'static str> {
    if MIN_CAPACITY < 2 {
        return Err("MIN_CAPACITY must leave one slot empty");
    }
    if MAX_CAPACITY <= MIN_CAPACITY {
        return Err("MAX_CAPACITY must exceed MIN_CAPACITY");
    }
    if (MAX_CAPACITY as u16) >= (INVALID_OFFSET as u16) {
        return Err("INVALID_OFFSET must be outside the offset range");
    }
    if MAX_CONSUMERS == 0 || MAX_CONSUMERS > i32::MAX as usize {
        return Err("MAX_CONSUMERS must fit the consumer table");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_validation() {
        assert!(validate_constants().is_ok());
    }

    #[test]
    fn test_offset_sentinel_outside_range() {
        assert!(INVALID_OFFSET as u16 > MAX_CAPACITY as u16);
    }
}
