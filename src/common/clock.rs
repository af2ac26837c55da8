//! Wall clocks and the hybrid logical clock used to version metadata
//!
//! Every metadata mutation is stamped with a [`HlcTimestamp`] drawn from a
//! [`VersionClock`]. Record versions pair that stamp with a `last_mod`
//! counter that grows by exactly one per ownership change.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> u64;
}

/// Real time since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        crate::common::utils::timestamp_now_millis()
    }
}

/// Clock that only moves when told to. Used to step over cleanup delays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        let millis = by.as_millis().min(u128::from(u64::MAX)) as u64;
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Hybrid logical clock reading: wall milliseconds plus a logical counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct HlcTimestamp {
    pub wall_ms: u64,
    pub logical: u32,
}

impl HlcTimestamp {
    pub const fn new(wall_ms: u64, logical: u32) -> Self {
        Self { wall_ms, logical }
    }

    fn successor(self) -> Self {
        if self.logical == u32::MAX {
            Self::new(self.wall_ms + 1, 0)
        } else {
            Self::new(self.wall_ms, self.logical + 1)
        }
    }
}

impl std::fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.wall_ms, self.logical)
    }
}

/// Version carried by every durable metadata record.
///
/// `epoch` is the stamp the record was created with and sorts first, so a
/// namespace that is dropped and created again outranks every version of its
/// previous incarnation. Within an epoch, `last_mod` counts ownership changes
/// and the timestamp breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub epoch: HlcTimestamp,
    pub last_mod: u64,
    pub timestamp: HlcTimestamp,
}

impl Version {
    pub const fn new(epoch: HlcTimestamp, last_mod: u64, timestamp: HlcTimestamp) -> Self {
        Self {
            epoch,
            last_mod,
            timestamp,
        }
    }

    /// First version of a freshly created record.
    pub fn initial(timestamp: HlcTimestamp) -> Self {
        Self::new(timestamp, 1, timestamp)
    }

    /// Next version after an ownership change.
    pub fn bump(self, timestamp: HlcTimestamp) -> Self {
        Self::new(self.epoch, self.last_mod + 1, timestamp.max(self.timestamp))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}|{}", self.last_mod, self.epoch, self.timestamp)
    }
}

/// Strictly monotonic hybrid logical clock.
///
/// `timestamp = max(wall, last)`; the counter increments within a tick and
/// resets to zero when the wall component advances.
pub struct VersionClock {
    wall: std::sync::Arc<dyn Clock>,
    last: Mutex<HlcTimestamp>,
}

impl VersionClock {
    pub fn new(wall: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            wall,
            last: Mutex::new(HlcTimestamp::default()),
        }
    }

    pub fn system() -> Self {
        Self::new(std::sync::Arc::new(SystemClock))
    }

    /// Wall clock backing this HLC.
    pub fn wall(&self) -> &std::sync::Arc<dyn Clock> {
        &self.wall
    }

    pub fn now_millis(&self) -> u64 {
        self.wall.now_millis()
    }

    /// Issue a new timestamp, strictly greater than every earlier one.
    pub fn next(&self) -> HlcTimestamp {
        let wall = self.wall.now_millis();
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        let next = if wall > last.wall_ms {
            HlcTimestamp::new(wall, 0)
        } else {
            last.successor()
        };
        *last = next;
        next
    }

    /// Merge a timestamp received from another node and issue a local one
    /// that is strictly greater than both.
    pub fn observe(&self, remote: HlcTimestamp) -> HlcTimestamp {
        let wall = self.wall.now_millis();
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        let top = wall.max(last.wall_ms).max(remote.wall_ms);
        let next = if top == last.wall_ms && top == remote.wall_ms {
            HlcTimestamp::new(top, last.logical.max(remote.logical)).successor()
        } else if top == last.wall_ms {
            last.successor()
        } else if top == remote.wall_ms {
            remote.successor()
        } else {
            HlcTimestamp::new(top, 0)
        };
        *last = next;
        next
    }

    /// Last issued timestamp.
    pub fn current(&self) -> HlcTimestamp {
        *self.last.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for VersionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionClock")
            .field("last", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_next_is_strictly_monotonic_with_frozen_wall() {
        let wall = Arc::new(ManualClock::new(1_000));
        let clock = VersionClock::new(wall.clone());

        let mut prev = clock.next();
        for _ in 0..1_000 {
            let ts = clock.next();
            assert!(ts > prev);
            assert_eq!(ts.wall_ms, 1_000);
            prev = ts;
        }
    }

    #[test]
    fn test_counter_resets_on_tick() {
        let wall = Arc::new(ManualClock::new(10));
        let clock = VersionClock::new(wall.clone());

        clock.next();
        let ts = clock.next();
        assert_eq!(ts, HlcTimestamp::new(10, 1));

        wall.advance(Duration::from_millis(5));
        assert_eq!(clock.next(), HlcTimestamp::new(15, 0));
    }

    #[test]
    fn test_wall_going_backwards_keeps_order() {
        let wall = Arc::new(ManualClock::new(500));
        let clock = VersionClock::new(wall.clone());
        let before = clock.next();

        wall.set(100);
        let after = clock.next();
        assert!(after > before);
        assert_eq!(after.wall_ms, 500);
    }

    #[test]
    fn test_observe_orders_after_remote() {
        let local = VersionClock::new(Arc::new(ManualClock::new(100)));
        let remote = VersionClock::new(Arc::new(ManualClock::new(900)));

        let sent = remote.next();
        let received = local.observe(sent);
        assert!(received > sent);
        assert!(local.next() > received);
    }

    #[test]
    fn test_version_bump_and_order() {
        let v1 = Version::initial(HlcTimestamp::new(10, 0));
        let v2 = v1.bump(HlcTimestamp::new(5, 0));
        assert_eq!(v2.last_mod, 2);
        assert!(v2 > v1);
        assert_eq!(v2.timestamp, HlcTimestamp::new(10, 0));
        assert_eq!(v2.epoch, v1.epoch);
        assert_eq!(v1.to_string(), "1@10.0|10.0");
    }

    #[test]
    fn test_recreated_record_outranks_previous_incarnation() {
        let mut old = Version::initial(HlcTimestamp::new(10, 0));
        for tick in 11..20 {
            old = old.bump(HlcTimestamp::new(tick, 0));
        }
        let recreated = Version::initial(HlcTimestamp::new(30, 0));
        assert_eq!(recreated.last_mod, 1);
        assert!(recreated > old);
    }
}
