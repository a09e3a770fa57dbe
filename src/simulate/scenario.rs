//! Scenario files and the runner that drives them through a fetcher.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ScenarioError;
use crate::fetcher::{DeadLetter, Fetcher, FetcherConfig, NoYield, PoolStats};

use super::location::{LocationSpec, SimulatedFetch, SimulatedLocation};

/// A set of simulated locations to fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// How the simulated fetch treats cancellation.
    #[serde(default)]
    pub fetch: SimulatedFetch,
    /// Locations in submission order.
    pub locations: Vec<LocationSpec>,
}

impl Scenario {
    /// Creates a scenario from location descriptions.
    pub fn new(locations: Vec<LocationSpec>) -> Self {
        Self {
            name: None,
            fetch: SimulatedFetch::Blocking,
            locations,
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the fetch mode.
    pub fn with_fetch(mut self, fetch: SimulatedFetch) -> Self {
        self.fetch = fetch;
        self
    }

    /// Parses a scenario from YAML.
    pub fn from_yaml_str(content: &str) -> Result<Self, ScenarioError> {
        let scenario: Self = serde_yaml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Loads a scenario from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Checks that the scenario can be submitted.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.locations.is_empty() {
            return Err(ScenarioError::Empty);
        }

        for (index, location) in self.locations.iter().enumerate() {
            if let Some(priority) = location.priority {
                if !priority.is_finite() {
                    return Err(ScenarioError::InvalidPriority { index, priority });
                }
            }
        }

        Ok(())
    }
}

/// Knobs of a scenario run that are not part of the fetcher configuration.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Replace the default yield point with one that never observes
    /// cancellation.
    pub no_yield: bool,
    /// Upper bound on the whole run.
    pub max_wait: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            no_yield: false,
            max_wait: Duration::from_secs(60),
        }
    }
}

/// A location the run gave up on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterReport {
    pub value: i64,
    pub attempts: u32,
    pub failures: u32,
    pub error: String,
}

impl From<&DeadLetter<SimulatedLocation>> for DeadLetterReport {
    fn from(letter: &DeadLetter<SimulatedLocation>) -> Self {
        Self {
            value: letter.task.location.value(),
            attempts: letter.task.attempts,
            failures: letter.task.failures,
            error: letter.error.clone(),
        }
    }
}

/// Outcome of a scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: Option<String>,
    /// Published values in completion order.
    pub results: Vec<i64>,
    pub dead_letters: Vec<DeadLetterReport>,
    pub stats: PoolStats,
    pub elapsed_ms: u64,
}

/// Runs a scenario to completion and reports what came out.
///
/// # Errors
///
/// Returns `ScenarioError::DeadlineExceeded` if the run does not drain
/// within `options.max_wait`, or `ScenarioError::Pool` if the fetcher
/// cannot be built or started.
pub async fn run_scenario(
    scenario: &Scenario,
    config: FetcherConfig,
    options: &RunOptions,
) -> Result<ScenarioReport, ScenarioError> {
    scenario.validate()?;

    let mut fetcher: Fetcher<SimulatedLocation, Option<i64>> =
        Fetcher::new(scenario.fetch, config)?;
    if options.no_yield {
        fetcher = fetcher.with_yield_point(NoYield);
    }

    for spec in &scenario.locations {
        let location = SimulatedLocation::new(spec.clone());
        match spec.priority {
            Some(priority) => fetcher.add_with_priority(location, priority)?,
            None => fetcher.add(location)?,
        };
    }

    info!(
        scenario = scenario.name.as_deref().unwrap_or("unnamed"),
        locations = scenario.locations.len(),
        workers = fetcher.num_workers(),
        no_yield = options.no_yield,
        "Running scenario"
    );

    let started = Instant::now();
    let results = fetcher.start()?;
    let joined = tokio::time::timeout(options.max_wait, fetcher.join()).await;

    if let Err(e) = fetcher.shutdown().await {
        warn!(error = %e, "Fetcher did not shut down cleanly");
    }

    match joined {
        Ok(result) => result?,
        Err(_) => {
            return Err(ScenarioError::DeadlineExceeded {
                seconds: options.max_wait.as_secs(),
            })
        }
    }

    let report = ScenarioReport {
        name: scenario.name.clone(),
        results: results.drain().into_iter().flatten().collect(),
        dead_letters: fetcher
            .dead_letters()
            .iter()
            .map(DeadLetterReport::from)
            .collect(),
        stats: fetcher.stats(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    };

    info!(
        results = report.results.len(),
        dead_letters = report.dead_letters.len(),
        elapsed_ms = report.elapsed_ms,
        "Scenario complete"
    );

    Ok(report)
}
