//! QA harness for the measurement toolkit: builds simulated topologies from declarative
//! scenarios and judges the structured logs commands emit while running against them.

#![forbid(unsafe_code)]

mod error;
pub mod registry;
pub mod scenario;
mod simulation;
pub mod teardown;
mod timeouts;
pub mod verify;

pub use error::{LookupError, ServerRole, SimulationError};
pub use registry::{ExpectedErr, ScenarioDescriptor};
pub use scenario::{ClientStack, DnsServer, HttpServer, Scenario, ScenarioEditor};
pub use simulation::{Simulation, SimulationConfig};
pub use teardown::{Close, CloseFailure, Closer, TeardownError, TeardownReport, TeardownStack};
pub use verify::{
    verify_events, verify_log, verify_sequence, ExpectedEvent, Pattern, SequenceError, VerifyError,
};
