//! Scheduler configuration
//!
//! All thresholds are tunable but fixed at startup; the defaults are the
//! values the policy tables in [`crate::placer`], [`crate::dvfs`] and
//! [`crate::power`] were calibrated against.

use nimbus_core::{SimTime, SlaClass};
use serde::{Deserialize, Serialize};

/// Configuration for the scheduling core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Load below which a machine counts as underutilized.
    pub load_low: f64,

    /// Load above which a machine counts as saturated.
    pub load_high: f64,

    /// Utilization ceiling for migration targets; packing stops short of it.
    pub high_util: f64,

    /// Utilization floor used by the consolidation sweep.
    pub low_util: f64,

    /// Floor on always-warm machines. Power-off never drops the usable
    /// machine count below this.
    pub initial_active_machines: usize,

    /// Minimum gap between consolidation sweeps, in simulated microseconds.
    pub consolidation_interval: SimTime,

    /// Per-VM memory overhead added to every placement and migration check.
    pub vm_memory_overhead_mb: u64,

    /// Per-class headroom factors for the SLA-risk scan, indexed by
    /// [`SlaClass::index`]. A task is at risk when its required MIPS exceeds
    /// the machine's current MIPS times this factor.
    pub sla_factors: [f64; 4],
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            load_low: 0.30,
            load_high: 0.70,
            high_util: 0.80,
            low_util: 0.30,
            initial_active_machines: 12,
            consolidation_interval: 300_000,
            vm_memory_overhead_mb: 8,
            sla_factors: [0.85, 0.90, 0.95, 1.0],
        }
    }
}

impl SchedulerConfig {
    /// Set the always-warm machine floor
    pub fn with_initial_active_machines(mut self, count: usize) -> Self {
        self.initial_active_machines = count;
        self
    }

    /// Set the consolidation interval (simulated microseconds)
    pub fn with_consolidation_interval(mut self, interval: SimTime) -> Self {
        self.consolidation_interval = interval;
        self
    }

    /// Set the per-VM memory overhead (MB)
    pub fn with_vm_memory_overhead(mut self, overhead_mb: u64) -> Self {
        self.vm_memory_overhead_mb = overhead_mb;
        self
    }

    /// Set the load thresholds
    pub fn with_load_thresholds(mut self, low: f64, high: f64) -> Self {
        self.load_low = low;
        self.load_high = high;
        self
    }

    /// Risk-scan headroom factor for a class
    pub fn sla_factor(&self, sla: SlaClass) -> f64 {
        self.sla_factors[sla.index()]
    }
}
