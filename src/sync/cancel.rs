//! Shared cancellation token.
//!
//! One token aborts both feeds and the consumer: feeds stop issuing
//! requests, the queues disconnect, and the consumer drains in-flight
//! items and exits. Cloned handles observe the same flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep in small slices so cancellation interrupts long waits.
    pub fn sleep(&self, total: Duration) -> bool {
        let slice = Duration::from_millis(50);
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.is_cancelled() {
                return false;
            }
            let nap = remaining.min(slice);
            std::thread::sleep(nap);
            remaining -= nap;
        }
        !self.is_cancelled()
    }
}
