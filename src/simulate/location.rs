//! Simulated locations and the fetch function that reads them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::fetcher::{CancelSignal, Fetch};

/// Sleep granularity of the cooperative fetch.
const COOPERATIVE_SLICE: Duration = Duration::from_millis(5);

/// Declarative description of a simulated location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSpec {
    /// Value returned once the location stops misbehaving.
    pub value: i64,
    /// Submission priority; the fetcher default when absent.
    #[serde(default)]
    pub priority: Option<f64>,
    /// Number of initial attempts that return nothing.
    #[serde(default)]
    pub failures: u32,
    /// Number of initial attempts that raise an error.
    #[serde(default)]
    pub errors: u32,
    /// Per-attempt delays in milliseconds; later attempts are instant.
    #[serde(default)]
    pub delays_ms: Vec<u64>,
}

impl LocationSpec {
    /// Creates a well-behaved location.
    pub fn new(value: i64) -> Self {
        Self {
            value,
            priority: None,
            failures: 0,
            errors: 0,
            delays_ms: Vec::new(),
        }
    }

    /// Sets the submission priority.
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the number of empty responses before the value.
    pub fn with_failures(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    /// Sets the number of errors before the value.
    pub fn with_errors(mut self, errors: u32) -> Self {
        self.errors = errors;
        self
    }

    /// Sets per-attempt delays.
    pub fn with_delays(mut self, delays: impl IntoIterator<Item = Duration>) -> Self {
        self.delays_ms = delays.into_iter().map(|d| d.as_millis() as u64).collect();
        self
    }
}

/// A location whose behaviour depends on how often it was fetched.
///
/// State is shared across retries of the same task, so each attempt
/// consumes the next delay and the misbehaviour budget counts down.
#[derive(Debug)]
pub struct SimulatedLocation {
    spec: LocationSpec,
    calls: AtomicU32,
    empty_returned: AtomicU32,
    errors_raised: AtomicU32,
}

impl SimulatedLocation {
    /// Creates a location from its description.
    pub fn new(spec: LocationSpec) -> Self {
        Self {
            spec,
            calls: AtomicU32::new(0),
            empty_returned: AtomicU32::new(0),
            errors_raised: AtomicU32::new(0),
        }
    }

    /// The value this location eventually yields.
    pub fn value(&self) -> i64 {
        self.spec.value
    }

    /// The description this location was built from.
    pub fn spec(&self) -> &LocationSpec {
        &self.spec
    }

    /// Number of fetch calls made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Claims the delay for the next call.
    fn next_delay(&self) -> Duration {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        self.spec
            .delays_ms
            .get(call)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(Duration::ZERO)
    }

    /// Produces the response once the delay has passed.
    fn respond(&self) -> anyhow::Result<Option<i64>> {
        if self.errors_raised.load(Ordering::SeqCst) < self.spec.errors {
            let raised = self.errors_raised.fetch_add(1, Ordering::SeqCst) + 1;
            anyhow::bail!(
                "simulated error {}/{} for location {}",
                raised,
                self.spec.errors,
                self.spec.value
            );
        }

        if self.empty_returned.load(Ordering::SeqCst) < self.spec.failures {
            self.empty_returned.fetch_add(1, Ordering::SeqCst);
            return Ok(None);
        }

        Ok(Some(self.spec.value))
    }
}

/// Fetch function over [`SimulatedLocation`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatedFetch {
    /// Sleeps through the whole delay and ignores cancellation.
    #[default]
    Blocking,
    /// Sleeps in short slices and stops once cancelled.
    Cooperative,
}

impl Fetch<SimulatedLocation, Option<i64>> for SimulatedFetch {
    fn fetch(
        &self,
        location: &SimulatedLocation,
        cancel: &CancelSignal,
    ) -> anyhow::Result<Option<i64>> {
        let delay = location.next_delay();

        match self {
            SimulatedFetch::Blocking => std::thread::sleep(delay),
            SimulatedFetch::Cooperative => {
                let deadline = Instant::now() + delay;
                loop {
                    cancel.check()?;
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    std::thread::sleep(COOPERATIVE_SLICE.min(deadline - now));
                }
            }
        }

        location.respond()
    }
}
