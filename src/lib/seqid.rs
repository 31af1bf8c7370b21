//! Version ids for persisted aggregates.
//!
//! An id packs the commit time in milliseconds past 2015-01-01, the reducer's
//! worker number and a per-millisecond counter. Every partition owns its
//! [`VersionClock`], so ids are strictly increasing along a partition's
//! history.

use std::{fmt, str::FromStr};

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const EPOCH_MILLIS: u64 = 1_420_070_400_000;
const WORKER_BITS: u8 = 10;
const COUNTER_BITS: u8 = 12;
const TIME_SHIFT: u8 = WORKER_BITS + COUNTER_BITS;
const MAX_COUNTER: u16 = (1 << COUNTER_BITS) - 1;

pub const MAX_WORKER: u16 = (1 << WORKER_BITS) - 1;

/// Hands out the version ids of one partition.
#[derive(Debug, Clone)]
pub struct VersionClock {
    worker: u16,
    last_millis: u64,
    counter: u16,
}

impl VersionClock {
    pub fn new(worker: u16) -> Self {
        Self {
            worker: worker.min(MAX_WORKER),
            last_millis: EPOCH_MILLIS,
            counter: 0,
        }
    }

    /// Continues after `last`, typically the newest id of a revived history.
    pub fn resume(worker: u16, last: SequenceId) -> Self {
        let mut clock = Self::new(worker);
        clock.last_millis = last.issued_at();
        clock.counter = last.counter();
        clock
    }

    pub fn next_id(&mut self) -> SequenceId {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        self.issue(now)
    }

    /// Issues the id for a commit at `now_millis`. When the wall clock stalls,
    /// runs backwards or the counter is exhausted, the clock steps ahead of
    /// wall time by a millisecond instead of waiting.
    pub fn issue(&mut self, now_millis: u64) -> SequenceId {
        if now_millis > self.last_millis {
            self.last_millis = now_millis;
            self.counter = 0;
        } else if self.counter == MAX_COUNTER {
            self.last_millis += 1;
            self.counter = 0;
        } else {
            self.counter += 1;
        }

        SequenceId(
            ((self.last_millis - EPOCH_MILLIS) << TIME_SHIFT)
                | (u64::from(self.worker) << COUNTER_BITS)
                | u64::from(self.counter),
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId(u64);

impl SequenceId {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Commit time in Unix milliseconds.
    pub fn issued_at(self) -> u64 {
        (self.0 >> TIME_SHIFT) + EPOCH_MILLIS
    }

    pub fn worker(self) -> u16 {
        ((self.0 >> COUNTER_BITS) & u64::from(MAX_WORKER)) as u16
    }

    fn counter(self) -> u16 {
        (self.0 & u64::from(MAX_COUNTER)) as u16
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SequenceId({}@{})", self.issued_at(), self.counter())
    }
}

impl FromStr for SequenceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(SequenceId)
    }
}

impl Serialize for SequenceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SequenceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse::<SequenceId>()
            .map_err(serde::de::Error::custom)
    }
}
