//! Rate limiting for per-packet fault logs.
//!
//! Camera-level faults (sequence gaps, missing buffers, stray ethertypes) can
//! repeat for every packet. Each stream owns a throttler that lets one warning
//! per fault kind through per interval and counts the rest, until the stream
//! recovers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default interval between two warnings of the same kind.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct FaultEntry {
    last_logged: Instant,
    suppressed: u64,
}

/// Per-stream log throttler keyed by fault kind.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use avb_ingest::utils::LogThrottler;
///
/// let mut throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("discontinuity"));
/// assert!(!throttler.should_log("discontinuity"));
/// assert_eq!(throttler.recover(), 1);
/// ```
#[derive(Debug)]
pub struct LogThrottler {
    interval: Duration,
    faults: HashMap<&'static str, FaultEntry>,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            faults: HashMap::new(),
        }
    }

    /// Record a fault of kind `key`; `true` if it should be logged now.
    pub fn should_log(&mut self, key: &'static str) -> bool {
        let now = Instant::now();
        match self.faults.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                false
            }
            Some(entry) => {
                entry.last_logged = now;
                true
            }
            None => {
                self.faults.insert(
                    key,
                    FaultEntry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                true
            }
        }
    }

    /// Whether no fault was recorded since the last recovery.
    pub fn is_quiet(&self) -> bool {
        self.faults.is_empty()
    }

    /// The stream delivered good data again: forget all faults.
    ///
    /// Returns the number of warnings suppressed since the faults began, so
    /// the next fault of any kind is reported at once.
    pub fn recover(&mut self) -> u64 {
        self.faults.drain().map(|(_, entry)| entry.suppressed).sum()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

/// Log a warning unless the same fault kind was logged recently.
///
/// # Arguments
///
/// * `$throttler` - a mutable [`LogThrottler`] place
/// * `$key` - the fault kind
/// * the rest - `tracing::warn!` arguments
///
/// ```rust
/// use avb_ingest::utils::LogThrottler;
/// use avb_ingest::warn_throttled;
///
/// let mut throttler = LogThrottler::default();
/// warn_throttled!(throttler, "gap", "sequence gap on camera {}", 2);
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_interval() {
        let mut throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("gap"));
        assert!(!throttler.should_log("gap"));
        // other kinds are independent
        assert!(throttler.should_log("overflow"));

        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("gap"));
    }

    #[test]
    fn test_recover_counts_suppressed() {
        let mut throttler = LogThrottler::default();
        assert!(throttler.is_quiet());

        for _ in 0..4 {
            throttler.should_log("no-buffer");
        }
        throttler.should_log("overflow");
        assert!(!throttler.is_quiet());

        assert_eq!(throttler.recover(), 3);
        assert!(throttler.is_quiet());
        // reported at once after recovery
        assert!(throttler.should_log("no-buffer"));
    }
}
