use std::{
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    error::{Error, Result},
    tx_desc::Timestamp,
};

enum Source {
    Physical,
    Manual,
}

/// Issues strictly increasing timestamps for transaction ids. The physical
/// source follows the wall clock but never repeats or goes backwards.
pub struct ClockSource {
    source: Source,
    last: Mutex<Timestamp>,
}

impl Default for ClockSource {
    fn default() -> Self {
        Self::physical()
    }
}

impl ClockSource {
    pub fn physical() -> Self {
        Self {
            source: Source::Physical,
            last: Mutex::new(0),
        }
    }

    /// Ticks by one from `start` on every call.
    pub fn manual(start: Timestamp) -> Self {
        Self {
            source: Source::Manual,
            last: Mutex::new(start),
        }
    }

    pub fn now(&self) -> Result<Timestamp> {
        let mut last = self.last.lock().unwrap();
        let candidate = match self.source {
            Source::Physical => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos() as Timestamp)
                .unwrap_or(0),
            Source::Manual => 0,
        };
        let next = candidate.max(last.saturating_add(1));
        if next >= Timestamp::MAX {
            return Err(Error::protocol("clock source exhausted"));
        }
        *last = next;
        Ok(next)
    }
}
