//! Monotonic kernel timestamps.
//!
//! The kernel stamps lifecycle events with nanoseconds since boot
//! (CLOCK_BOOTTIME). The same clock disambiguates pid reuse, so the
//! value must survive conversions unchanged.

use std::{
    fmt,
    ops::{Add, Sub},
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};

/// Nanoseconds since boot, as assigned by the kernel.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current value of the kernel boot clock.
    pub fn now() -> Self {
        let t = nix::time::clock_gettime(nix::time::ClockId::CLOCK_BOOTTIME)
            .expect("CLOCK_BOOTTIME unavailable");
        Self(t.tv_sec() as u64 * 1_000_000_000 + t.tv_nsec() as u64)
    }

    pub const fn from_raw(ns: u64) -> Self {
        Self(ns)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Timestamp {
    fn from(ns: u64) -> Self {
        Self(ns)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl Add<u64> for Timestamp {
    type Output = Timestamp;
    fn add(self, ns: u64) -> Timestamp {
        Timestamp(self.0 + ns)
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;
    fn sub(self, other: Timestamp) -> Timestamp {
        Timestamp(self.0.saturating_sub(other.0))
    }
}

/// Pin the boot-relative value to the wall clock. Values in the future
/// of the boot clock collapse to the current instant.
impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        let now = Timestamp::now();
        SystemTime::now() - Duration::from_nanos((now - ts).raw())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
