//! Discrete-event simulator for a Layer-7 TCP load balancer.
//!
//! The proxy core accepts framed requests over simulated byte streams, picks
//! a backend per request through a pluggable balancing policy, and relays
//! responses back while measuring round trips. Everything runs on a
//! single-threaded virtual-time runtime, so a fixed seed replays a run
//! exactly.

pub mod apps;
pub mod balance;
pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod net;
pub mod proxy;
pub mod report;
pub mod sim;

pub use config::{Algorithm, Config};
pub use driver::{run_scenario, Simulation};
pub use error::{LbError, Result};
pub use report::RunReport;
