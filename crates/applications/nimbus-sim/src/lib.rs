//! Nimbus Simulation Harness
//!
//! Reference in-memory substrate, discrete-event engine and synthetic
//! workload generation for exercising the scheduling core end to end.

pub mod cluster;
pub mod engine;
pub mod workload;

pub use cluster::{MachineSpec, SimCluster, SimConfig, TaskSpec};
pub use engine::{Engine, RunResult};
pub use workload::{standard_fleet, WorkloadGenerator};
