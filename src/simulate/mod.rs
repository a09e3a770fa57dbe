//! Simulation harness for exercising the fetcher without real I/O.
//!
//! A [`SimulatedLocation`] misbehaves in a scripted way: it can delay each
//! attempt, return nothing for a number of attempts, or raise errors. A
//! [`Scenario`] groups such locations with their priorities and can be
//! loaded from YAML:
//!
//! ```yaml
//! name: reprioritization
//! fetch: blocking        # or: cooperative
//! locations:
//!   - value: 3
//!     priority: 0.9
//!   - value: 1
//!     priority: 0.42
//!   - value: 2
//!     priority: 0.40
//!     delays_ms: [200, 0]
//! ```

pub mod location;
pub mod scenario;

pub use location::{LocationSpec, SimulatedFetch, SimulatedLocation};
pub use scenario::{run_scenario, DeadLetterReport, RunOptions, Scenario, ScenarioReport};
