//! Per-machine DVFS policy
//!
//! Reassessed on placement, completion, periodic ticks and warnings. The
//! decision ladder is: frozen machines are untouched; any task at SLA risk
//! forces P0; otherwise the SLA mix of the residents picks a state; otherwise
//! plain load does. A transition is only issued when the target state differs
//! from the current one, and it is applied to every core.

use tracing::{debug, warn};

use nimbus_core::{MachineId, PState, SimTime, SlaClass, Substrate, TaskInfo};

use crate::config::SchedulerConfig;
use crate::inventory::Inventory;

/// Load above which a machine with SLA1 residents runs at P0 instead of P1.
const SLA1_LOAD_SPLIT: f64 = 0.5;
/// Load at or below which a machine is considered idle enough for P3.
const IDLE_LOAD: f64 = 0.1;
/// Trigger urgency above which the machine is boosted outright.
const URGENT_TRIGGER: f64 = 0.8;

/// Outcome of one reassessment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DvfsDecision {
    /// Machine is mid-transition or hosts a migrating VM; left alone.
    Frozen,
    /// A resident task was at SLA risk; machine forced to P0.
    Urgent,
    /// Regular policy picked a new state.
    Set(PState),
    /// Already at the right state.
    Unchanged,
}

/// MIPS the task needs from now to its deadline. Infinite once the deadline
/// has passed.
fn required_mips(info: &TaskInfo, now: SimTime) -> f64 {
    if info.target_completion <= now {
        return f64::INFINITY;
    }
    info.remaining_instructions as f64 / (info.target_completion - now) as f64
}

/// Chooses per-core performance states.
#[derive(Debug, Default)]
pub struct DvfsController;

impl DvfsController {
    /// Reassess one machine. `trigger` carries the urgency and class of the
    /// task that caused the reassessment, if any.
    pub fn reassess(
        &self,
        inv: &Inventory,
        sub: &mut dyn Substrate,
        cfg: &SchedulerConfig,
        now: SimTime,
        machine: MachineId,
        trigger: Option<(f64, SlaClass)>,
    ) -> DvfsDecision {
        if inv.is_frozen(machine) {
            return DvfsDecision::Frozen;
        }
        let info = match sub.machine_info(machine) {
            Ok(info) => info,
            Err(e) => {
                warn!("DVFS skipped machine {machine}: {e}");
                return DvfsDecision::Unchanged;
            }
        };
        if !info.s_state.is_active() {
            return DvfsDecision::Unchanged;
        }

        let residents: Vec<TaskInfo> = inv
            .tasks_on_machine(machine)
            .into_iter()
            .filter_map(|task| sub.task_info(task).ok())
            .collect();

        let current_mips = info.mips[info.p_state.index()] as f64;
        let at_risk = residents.iter().any(|t| {
            required_mips(t, now) > current_mips * cfg.sla_factor(t.sla)
        });
        let urgent_trigger = trigger.map_or(false, |(urgency, _)| urgency > URGENT_TRIGGER);

        if at_risk || urgent_trigger {
            if info.p_state != PState::P0 {
                self.apply(sub, machine, info.num_cpus, PState::P0);
                debug!("boosted machine {machine} to P0 (SLA risk)");
            }
            return DvfsDecision::Urgent;
        }

        let load = info.load();
        let target = self.target_state(cfg, load, &residents);

        if target == info.p_state {
            DvfsDecision::Unchanged
        } else {
            self.apply(sub, machine, info.num_cpus, target);
            debug!("machine {machine} load {load:.2} -> {target:?}");
            DvfsDecision::Set(target)
        }
    }

    /// Force a machine to P0 regardless of load, unless frozen. Used by the
    /// memory- and SLA-warning paths.
    pub fn boost(&self, inv: &Inventory, sub: &mut dyn Substrate, machine: MachineId) {
        if inv.is_frozen(machine) {
            return;
        }
        let info = match sub.machine_info(machine) {
            Ok(info) => info,
            Err(e) => {
                warn!("boost skipped machine {machine}: {e}");
                return;
            }
        };
        if info.s_state.is_active() && info.p_state != PState::P0 {
            self.apply(sub, machine, info.num_cpus, PState::P0);
        }
    }

    fn target_state(&self, cfg: &SchedulerConfig, load: f64, residents: &[TaskInfo]) -> PState {
        let has_sla0 = residents.iter().any(|t| t.sla == SlaClass::Sla0);
        let has_sla1 = residents.iter().any(|t| t.sla == SlaClass::Sla1);

        if has_sla0 {
            PState::P0
        } else if has_sla1 {
            if load > SLA1_LOAD_SPLIT {
                PState::P0
            } else {
                PState::P1
            }
        } else if load > cfg.load_high {
            PState::P0
        } else if load > cfg.load_low {
            PState::P1
        } else if load > IDLE_LOAD {
            PState::P2
        } else {
            PState::P3
        }
    }

    fn apply(&self, sub: &mut dyn Substrate, machine: MachineId, num_cpus: u32, pstate: PState) {
        for core in 0..num_cpus {
            if let Err(e) = sub.machine_set_core_performance(machine, core, pstate) {
                warn!("failed to set core {core} of {machine} to {pstate:?}: {e}");
            }
        }
    }
}
