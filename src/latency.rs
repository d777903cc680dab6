//! Round-trip latency of replication link posts.

use std::{
    fmt::{self, Display, Formatter},
    ops::AddAssign,
    time::Duration,
};

use hdrhistogram::{sync::Recorder, Histogram, SyncHistogram};
use quanta::Clock;

/// Histogram for one destination. Recording happens through [`LocalLatency`]
/// handles; call [`Latency::refresh`] before reading.
pub struct Latency {
    name: String,
    hist: SyncHistogram<u64>,
}

#[derive(Clone)]
pub struct LocalLatency {
    recorder: Recorder<u64>,
    clock: Clock,
}

#[derive(Clone, Default)]
pub struct MeasureClock(Clock);

/// Start mark taken by [`MeasureClock::measure`].
pub struct Measure(u64);

impl Latency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            // three significant digits, auto-resizing
            hist: Histogram::new(3).unwrap().into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local(&self) -> LocalLatency {
        LocalLatency {
            recorder: self.hist.recorder(),
            clock: Clock::new(),
        }
    }

    /// Pull in samples from every handle. Handles that stay idle are given up
    /// on after a short wait instead of blocking forever.
    pub fn refresh(&mut self) {
        self.hist.refresh_timeout(Duration::from_millis(100));
    }

    pub fn len(&self) -> u64 {
        self.hist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hist.len() == 0
    }

    pub fn quantile(&self, quantile: f64) -> Duration {
        Duration::from_nanos(self.hist.value_at_quantile(quantile))
    }
}

impl MeasureClock {
    pub fn measure(&self) -> Measure {
        Measure(self.0.start())
    }
}

impl AddAssign<Measure> for LocalLatency {
    fn add_assign(&mut self, measure: Measure) {
        self.recorder += self.clock.delta(measure.0, self.clock.end()).as_nanos() as u64;
    }
}

impl AddAssign<Duration> for LocalLatency {
    fn add_assign(&mut self, duration: Duration) {
        self.recorder += duration.as_nanos() as u64;
    }
}

impl Display for Latency {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "{}: no samples", self.name);
        }
        write!(
            f,
            "{}: {} round trips, mean {:?}, max {:?}",
            self.name,
            self.hist.len(),
            Duration::from_nanos(self.hist.mean() as u64),
            Duration::from_nanos(self.hist.max()),
        )?;
        for value in self.hist.iter_quantiles(1).skip(1) {
            if value.count_since_last_iteration() == 0 {
                continue;
            }
            let bar =
                (value.count_since_last_iteration() as f64 * 40.0 / self.hist.len() as f64).ceil();
            write!(
                f,
                "\n{:>12?} | {:40} | {:5.1}%",
                Duration::from_nanos(value.value_iterated_to()),
                "#".repeat(bar as usize),
                value.quantile_iterated_to() * 100.0
            )?;
            if value.quantile() >= 0.99 {
                break;
            }
        }
        Ok(())
    }
}
