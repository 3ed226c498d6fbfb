//! Abstraction over the system clock so that anything time-dependent
//! (request expiration, histogram aging, scheduler wake-ups) can be driven
//! by a mock provider in tests.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt::{self, Debug, Display};
use std::ops::{Add, Sub};
use std::sync::Arc;
use std::time::Duration;

/// A UTC instant with nanosecond precision.
///
/// Wraps [`chrono::DateTime`] so the rest of the workspace never deals with
/// the chrono API surface directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Construct from the number of nanoseconds since the UNIX epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Construct from the number of milliseconds since the UNIX epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis(millis))
    }

    /// Nanoseconds since the UNIX epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos()
    }

    /// Seconds since the UNIX epoch, truncated.
    pub fn timestamp(&self) -> i64 {
        self.0.timestamp()
    }

    /// Returns `self - other` if `other` is not later than `self`.
    pub fn checked_duration_since(&self, other: Self) -> Option<Duration> {
        (self.0 - other.0).to_std().ok()
    }

    /// Returns the time advanced by `duration`, or `None` on overflow.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let d = chrono::Duration::from_std(duration).ok()?;
        self.0.checked_add_signed(d).map(Time)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        self.checked_add(rhs).expect("time overflow")
    }
}

impl Sub<Self> for Time {
    type Output = Duration;

    /// Panics if `rhs` is later than `self`.
    fn sub(self, rhs: Self) -> Duration {
        self.checked_duration_since(rhs).expect("negative duration")
    }
}

impl Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// A source of [`Time`].
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] reading the real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] that only moves when told to.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider pinned at `now`.
    pub fn new(now: Time) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Advance the mock clock by `duration` and return the new time.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }

    /// Pin the mock clock to `time`.
    pub fn set(&self, time: Time) {
        *self.now.write() = time;
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

impl<T: TimeProvider> TimeProvider for Arc<T> {
    fn now(&self) -> Time {
        (**self).now()
    }
}
