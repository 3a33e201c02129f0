//! Task placement
//!
//! Deterministic candidate filtering and scoring: every usable machine that
//! meets the task's architecture/GPU/memory constraints is scored by load
//! with SLA and utilization biases, lowest score wins, ties break to the
//! lowest machine id. VM selection on the chosen machine reuses an existing
//! compatible VM when one is free, creating (and if necessary coercing) one
//! otherwise.

use tracing::{debug, warn};

use nimbus_core::{
    MachineId, Priority, Result, SimTime, SlaClass, Substrate, TaskInfo, VmId, VmKind,
};

use crate::config::SchedulerConfig;
use crate::inventory::Inventory;

/// Score reduction for SLA0/SLA1 tasks when the machine already runs at P0.
const P0_BIAS: f64 = 0.3;
/// Score reduction for SLA0/SLA1 tasks when the machine already runs at P1.
const P1_BIAS: f64 = 0.2;
/// Score reduction for underutilized machines.
const UNDERUTIL_BIAS: f64 = 0.2;

/// Pacing ratio: remaining instructions per microsecond to the deadline.
/// A deadline at or behind `now` is infinitely urgent.
pub fn urgency(info: &TaskInfo, now: SimTime) -> f64 {
    if info.target_completion <= now {
        return f64::INFINITY;
    }
    let gap = (info.target_completion - now).max(1);
    info.remaining_instructions as f64 / gap as f64
}

/// Priority mapping from SLA class and urgency.
pub fn priority_for(sla: SlaClass, urgency: f64) -> Priority {
    match sla {
        SlaClass::Sla0 | SlaClass::Sla1 => Priority::High,
        _ if urgency > 0.7 => Priority::High,
        SlaClass::Sla2 => Priority::Mid,
        _ if urgency > 0.4 => Priority::Mid,
        _ => Priority::Low,
    }
}

/// Chooses machines and VMs for tasks.
#[derive(Debug, Default)]
pub struct Placer;

impl Placer {
    /// Find the best machine for a task, or `None` when no usable machine
    /// satisfies the constraints. Machines with a pending power transition or
    /// a migrating VM are never candidates.
    pub fn find_machine(
        &self,
        inv: &Inventory,
        sub: &dyn Substrate,
        cfg: &SchedulerConfig,
        task: &TaskInfo,
    ) -> Option<MachineId> {
        let mut best: Option<(f64, MachineId)> = None;

        for machine in inv.machines() {
            if !inv.is_active(machine) || inv.is_frozen(machine) {
                continue;
            }
            let info = match sub.machine_info(machine) {
                Ok(info) => info,
                Err(e) => {
                    debug!("skipping machine {machine} during placement: {e}");
                    continue;
                }
            };
            if !info.s_state.is_active() {
                continue;
            }
            if info.arch != task.required_arch {
                continue;
            }
            if task.gpu_capable && !info.has_gpus {
                continue;
            }
            let need = task.memory_mb + cfg.vm_memory_overhead_mb;
            if info.memory_used_mb + need > info.memory_mb {
                continue;
            }

            let load = info.load();
            let mut score = load;
            if matches!(task.sla, SlaClass::Sla0 | SlaClass::Sla1) {
                match info.p_state {
                    nimbus_core::PState::P0 => score -= P0_BIAS,
                    nimbus_core::PState::P1 => score -= P1_BIAS,
                    _ => {}
                }
            }
            if load < cfg.load_low {
                score -= UNDERUTIL_BIAS;
            }

            // Strict less-than keeps the lowest id on ties; iteration is
            // ascending by id.
            if best.map_or(true, |(s, _)| score < s) {
                best = Some((score, machine));
            }
        }

        best.map(|(_, m)| m)
    }

    /// Place a task on a chosen machine: pick or create a VM, compute the
    /// priority, and register the task with the substrate and the inventory.
    pub fn place_on(
        &self,
        inv: &mut Inventory,
        sub: &mut dyn Substrate,
        now: SimTime,
        machine: MachineId,
        task: &TaskInfo,
    ) -> Result<(VmId, Priority)> {
        let arch = sub.machine_info(machine)?.arch;
        let kind = task.required_vm.coerce_for(arch);
        if kind != task.required_vm {
            warn!(
                "task {} wants {} which cannot run on {}; coercing to {kind}",
                task.id, task.required_vm, arch
            );
        }

        let vm = self.pick_or_create_vm(inv, sub, machine, kind)?;
        let priority = priority_for(task.sla, urgency(task, now));
        sub.vm_add_task(vm, task.id, priority)?;
        inv.bind_task(task.id, vm);
        Ok((vm, priority))
    }

    /// Prefer an existing non-migrating VM of the right guest family on the
    /// machine; create and attach one otherwise.
    fn pick_or_create_vm(
        &self,
        inv: &mut Inventory,
        sub: &mut dyn Substrate,
        machine: MachineId,
        kind: VmKind,
    ) -> Result<VmId> {
        for &vm in inv.vms_on(machine) {
            if inv.is_migrating(vm) {
                continue;
            }
            match sub.vm_info(vm) {
                Ok(info) if info.kind == kind => return Ok(vm),
                Ok(_) => continue,
                Err(e) => {
                    debug!("skipping VM {vm} during placement: {e}");
                    continue;
                }
            }
        }

        let arch = sub.machine_info(machine)?.arch;
        let vm = sub.vm_create(kind, arch)?;
        sub.vm_attach(vm, machine)?;
        inv.attach_vm(vm, machine);
        debug!("created {kind} VM {vm} on machine {machine}");
        Ok(vm)
    }
}
