//! Mesh time.
//!
//! Every node runs on its own monotonic clock and keeps a running estimate
//! of the offset to the shared mesh time. The estimate is nudged by
//! weighted samples taken from direct peer messages, so a mesh converges
//! on a common clock without any reference node.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Nanoseconds of mesh time.
pub type Timestamp = i64;

/// One second of mesh time.
pub const SEC: Timestamp = 1_000_000_000;

/// One millisecond of mesh time.
pub const MSEC: Timestamp = 1_000_000;

/// Source of local monotonic time.
pub type LocalClock = Box<dyn Fn() -> Timestamp + Send + Sync>;

/// A clock measuring nanoseconds since its creation.
pub fn steady_clock() -> LocalClock {
    let epoch = Instant::now();

    Box::new(move || epoch.elapsed().as_nanos() as Timestamp)
}

/// Running offset between the local clock and shared mesh time.
///
/// The offset starts at the negated local time, so a node booting alone
/// begins its mesh at zero. Samples move the estimate proportionally to
/// their weight; a weight of 1 adopts the sample outright.
pub struct TimeSync {
    offset: AtomicI64,
    local_clock: LocalClock,
}

impl TimeSync {
    pub fn new(local_clock: LocalClock) -> Self {
        let offset = AtomicI64::new(-local_clock());

        Self {
            offset,
            local_clock,
        }
    }

    /// Fold a remote time sample into the offset estimate.
    pub fn sync(&self, sample: Timestamp, weight: f32) {
        let offset = sample - (self.local_clock)();
        let estimate = self.offset.load(Ordering::Relaxed);
        let correction = ((offset - estimate) as f64 * weight as f64) as i64;

        self.offset.fetch_add(correction, Ordering::Relaxed);
    }

    /// Current mesh time.
    pub fn now(&self) -> Timestamp {
        (self.local_clock)() + self.offset.load(Ordering::Relaxed)
    }

    pub fn local_time(&self) -> Timestamp {
        (self.local_clock)()
    }

    pub fn offset(&self) -> Timestamp {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn from_local(&self, time: Timestamp) -> Timestamp {
        time + self.offset.load(Ordering::Relaxed)
    }

    pub fn to_local(&self, time: Timestamp) -> Timestamp {
        time - self.offset.load(Ordering::Relaxed)
    }
}
