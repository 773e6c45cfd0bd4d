/// Activity clock: the instant the subordinate last produced output.
///
/// The timestamp is stored as nanoseconds since a fixed origin in an
/// `AtomicU64`, so the drain and the watchdog share it without a lock.
/// The write side is not `Clone`: one drain, one writer.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Shared {
    origin: Instant,
    last_ns: AtomicU64,
}

/// Read side, held by the watchdog.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    shared: Arc<Shared>,
}

/// Write side, owned by the output drain.
#[derive(Debug)]
pub struct ActivityRecorder {
    shared: Arc<Shared>,
}

/// Create a clock whose last activity is now (launch time).
pub fn activity_clock() -> (ActivityRecorder, ActivityClock) {
    let shared = Arc::new(Shared {
        origin: Instant::now(),
        last_ns: AtomicU64::new(0),
    });
    (
        ActivityRecorder {
            shared: Arc::clone(&shared),
        },
        ActivityClock { shared },
    )
}

impl ActivityRecorder {
    /// Record activity at the current instant.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Record activity at `at`. Never moves the timestamp backwards.
    pub fn touch_at(&self, at: Instant) {
        let elapsed = at.saturating_duration_since(self.shared.origin);
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.shared.last_ns.fetch_max(ns, Ordering::Release);
    }
}

impl ActivityClock {
    pub fn last_activity(&self) -> Instant {
        let ns = self.shared.last_ns.load(Ordering::Acquire);
        self.shared.origin + Duration::from_nanos(ns)
    }

    /// Time elapsed between the last activity and `now`.
    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    pub fn idle(&self) -> Duration {
        self.idle_at(Instant::now())
    }
}
