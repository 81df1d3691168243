//! cooperative cancellation
//!
//! File reads and overlay engine invocations check the signal. Work that is already in flight
//! is abandoned, not rolled back.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::info!("cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel from a background thread once `timeout` has passed
    pub fn cancel_after(&self, timeout: Duration) {
        let cancellation = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            tracing::debug!(?timeout, "timeout reached");
            cancellation.cancel();
        });
    }
}
