pub mod backoff;

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Current wall-clock time as Unix milliseconds, the timestamp unit used on the wire.
pub fn unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Like [`unix_millis`], but strictly increasing within the process.
///
/// Envelope timestamps double as de-duplication keys for broadcasts that
/// arrive both directly and through the relay.
pub fn envelope_millis() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = unix_millis();
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Converts wire milliseconds back into a `DateTime`, clamping garbage to the epoch.
pub fn from_unix_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Abort a spawned task when the guard is dropped.
///
/// Used for per-peer timers: replacing the guard cancels the previous timer.
#[derive(Debug)]
pub(crate) struct TaskGuard(tokio::task::AbortHandle);

impl TaskGuard {
    pub fn spawn<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(fut).abort_handle())
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
