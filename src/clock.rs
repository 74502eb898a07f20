//! Clock seam for discovery dates
//!
//! Discovery walks backwards from "today" as seen by the machine's local
//! wall clock. The clock is injected so tests can pin the day; production
//! code uses [`SystemClock`].

use chrono::{DateTime, Local, NaiveDate, Utc};

/// Source of the current date and time.
pub trait Clock: Send + Sync {
    /// The local wall-clock date, used as the starting day for discovery.
    fn today(&self) -> NaiveDate;

    /// The current instant in UTC, used for persisted timestamps.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a fixed date, for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
