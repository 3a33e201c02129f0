//! Nimbus Scheduler
//!
//! Event-driven scheduling and placement core for a cloud workload simulator.
//! The host drives the nine callbacks on [`Scheduler`]; everything else -
//! placement, DVFS, power management, live migration, pending-task draining -
//! happens inside those callbacks against the [`Substrate`] interface.
//!
//! [`Substrate`]: nimbus_core::Substrate

pub mod classify;
pub mod config;
pub mod dvfs;
pub mod inventory;
pub mod placer;
pub mod power;
pub mod queue;
pub mod report;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testkit;

pub use classify::TaskClass;
pub use config::SchedulerConfig;
pub use scheduler::Scheduler;
