//! Power and migration management
//!
//! Powers machines on and off around the always-warm floor, selects eviction
//! VMs and migration targets, and plans the consolidation sweep as a
//! minimum-cost assignment of candidate VMs onto busier machines.

use pathfinding::kuhn_munkres::kuhn_munkres_min;
use pathfinding::matrix::Matrix;
use tracing::{debug, info, warn};

use nimbus_core::{CpuArch, MachineId, MachineInfo, SState, SimTime, SlaClass, Substrate, VmId};

use crate::config::SchedulerConfig;
use crate::inventory::Inventory;

/// Assignment cost for an infeasible VM/target pair. Far above any real
/// packing cost so the matching never picks one.
const INFEASIBLE: i64 = 1_000_000_000;

/// Fixed-point scale applied to packing costs before the integer matching.
const COST_SCALE: f64 = 1000.0;

/// A VM the consolidation sweep would like to move.
#[derive(Debug, Clone)]
struct SweepCandidate {
    vm: VmId,
    source: MachineId,
    arch: CpuArch,
    working_set_mb: u64,
    needs_gpu: bool,
}

/// Powers machines on/off and drives live migration.
#[derive(Debug, Default)]
pub struct PowerManager;

impl PowerManager {
    /// Wake the lowest-id S5 machine matching the given constraints. The
    /// machine enters `pendingStateChange` and stays unusable until its
    /// `StateChangeComplete` arrives.
    pub fn power_on_matching(
        &self,
        inv: &mut Inventory,
        sub: &mut dyn Substrate,
        arch: Option<CpuArch>,
        min_memory_mb: u64,
        needs_gpu: bool,
    ) -> Option<MachineId> {
        for machine in inv.machines() {
            if inv.is_active(machine) || inv.has_pending_state(machine) {
                continue;
            }
            let info = match sub.machine_info(machine) {
                Ok(info) => info,
                Err(e) => {
                    debug!("skipping machine {machine} during power-on scan: {e}");
                    continue;
                }
            };
            if !info.s_state.is_off() {
                continue;
            }
            if arch.is_some_and(|a| info.arch != a) {
                continue;
            }
            if needs_gpu && !info.has_gpus {
                continue;
            }
            if info.memory_mb < min_memory_mb {
                continue;
            }
            match sub.machine_set_state(machine, SState::S0) {
                Ok(()) => {
                    inv.mark_pending_state(machine);
                    info!("powering on machine {machine}");
                    return Some(machine);
                }
                Err(e) => {
                    warn!("failed to power on machine {machine}: {e}");
                    continue;
                }
            }
        }
        None
    }

    /// Retire a machine to S5 if it is idle, unfrozen, past its dwell window,
    /// and the usable-machine floor stays intact. Shuts down its VMs first.
    pub fn maybe_power_off(
        &self,
        inv: &mut Inventory,
        sub: &mut dyn Substrate,
        cfg: &SchedulerConfig,
        now: SimTime,
        machine: MachineId,
    ) -> bool {
        if !inv.is_active(machine) || inv.has_pending_state(machine) {
            return false;
        }
        if inv.task_count(machine) != 0 {
            return false;
        }
        if inv.vms_on(machine).iter().any(|vm| inv.is_migrating(*vm)) {
            return false;
        }
        if inv.is_migration_target(machine) {
            return false;
        }
        if inv.usable_count() <= cfg.initial_active_machines {
            return false;
        }
        // Dwell guard: a freshly woken machine serves at least one
        // consolidation interval before it may sleep again.
        if let Some(up_since) = inv.powered_on_at(machine) {
            if now < up_since.saturating_add(cfg.consolidation_interval) {
                return false;
            }
        }

        for vm in inv.detach_vms(machine) {
            if let Err(e) = sub.vm_shutdown(vm) {
                warn!("failed to shut down VM {vm} on {machine}: {e}");
            }
        }
        match sub.machine_set_state(machine, SState::S5) {
            Ok(()) => {
                inv.mark_pending_state(machine);
                info!("powering off idle machine {machine}");
                true
            }
            Err(e) => {
                warn!("failed to power off machine {machine}: {e}");
                false
            }
        }
    }

    /// Pick the VM to migrate off a machine: prefer VMs with no SLA0/SLA1
    /// residents, then the one carrying the most tasks.
    pub fn select_eviction_vm(
        &self,
        inv: &Inventory,
        sub: &dyn Substrate,
        machine: MachineId,
    ) -> Option<VmId> {
        let mut best: Option<(bool, usize, VmId)> = None;
        for &vm in inv.vms_on(machine) {
            if inv.is_migrating(vm) {
                continue;
            }
            let tasks = inv.tasks_in_vm(vm);
            if tasks.is_empty() {
                continue;
            }
            let has_strict = tasks.iter().any(|t| {
                matches!(
                    sub.task_info(*t).map(|i| i.sla),
                    Ok(SlaClass::Sla0) | Ok(SlaClass::Sla1)
                )
            });
            let better = match best {
                None => true,
                Some((best_strict, best_count, _)) => {
                    (!has_strict && best_strict)
                        || (has_strict == best_strict && tasks.len() > best_count)
                }
            };
            if better {
                best = Some((has_strict, tasks.len(), vm));
            }
        }
        best.map(|(_, _, vm)| vm)
    }

    /// Pick a migration target for a VM: active, unfrozen, right
    /// architecture, GPU if needed, room for the working set plus overhead,
    /// and utilization below the overload ceiling. Prefers the busiest such
    /// machine so the cluster packs without overloading.
    pub fn find_migration_target(
        &self,
        inv: &Inventory,
        sub: &dyn Substrate,
        cfg: &SchedulerConfig,
        source: MachineId,
        arch: CpuArch,
        needs_gpu: bool,
        working_set_mb: u64,
    ) -> Option<MachineId> {
        let mut best: Option<(f64, MachineId)> = None;
        for machine in inv.active_machines() {
            if machine == source || inv.is_frozen(machine) {
                continue;
            }
            let info = match sub.machine_info(machine) {
                Ok(info) => info,
                Err(e) => {
                    debug!("skipping machine {machine} during target scan: {e}");
                    continue;
                }
            };
            if !self.target_feasible(&info, cfg, arch, needs_gpu, working_set_mb) {
                continue;
            }
            let load = info.load();
            if best.map_or(true, |(l, _)| load > l) {
                best = Some((load, machine));
            }
        }
        best.map(|(_, m)| m)
    }

    /// Issue a live migration. The inventory's own pending set drives policy;
    /// the substrate's predicate is only a last defensive check.
    pub fn migrate(
        &self,
        inv: &mut Inventory,
        sub: &mut dyn Substrate,
        vm: VmId,
        target: MachineId,
    ) -> bool {
        if inv.is_migrating(vm) {
            return false;
        }
        if sub.vm_is_pending_migration(vm) {
            warn!("substrate reports VM {vm} already migrating; bookkeeping disagrees, skipping");
            return false;
        }
        match sub.vm_migrate(vm, target) {
            Ok(()) => {
                inv.mark_migration(vm, target);
                info!("migrating VM {vm} to machine {target}");
                true
            }
            Err(e) => {
                warn!("failed to migrate VM {vm} to {target}: {e}");
                false
            }
        }
    }

    /// Plan the consolidation sweep: candidate VMs come from active machines
    /// under `low_util` with no SLA0 resident; targets are the remaining
    /// active machines with spare capacity. The assignment is a minimum-cost
    /// matching where cheaper means busier target; only the first planned
    /// migration is returned, so at most one consolidation migration is ever
    /// in flight.
    pub fn plan_consolidation(
        &self,
        inv: &Inventory,
        sub: &dyn Substrate,
        cfg: &SchedulerConfig,
    ) -> Option<(VmId, MachineId)> {
        let mut donors: Vec<MachineId> = Vec::new();
        let mut targets: Vec<MachineInfo> = Vec::new();

        for machine in inv.active_machines() {
            if inv.is_frozen(machine) {
                continue;
            }
            let info = match sub.machine_info(machine) {
                Ok(info) => info,
                Err(_) => continue,
            };
            if !info.s_state.is_active() {
                continue;
            }
            let residents = inv.tasks_on_machine(machine);
            let has_sla0 = residents.iter().any(|t| {
                matches!(sub.task_info(*t).map(|i| i.sla), Ok(SlaClass::Sla0))
            });
            if info.load() < cfg.low_util && !has_sla0 && !residents.is_empty() {
                donors.push(machine);
            } else {
                targets.push(info);
            }
        }
        if donors.is_empty() || targets.is_empty() {
            return None;
        }

        let mut candidates: Vec<SweepCandidate> = Vec::new();
        for &donor in &donors {
            let arch = match sub.machine_info(donor) {
                Ok(info) => info.arch,
                Err(_) => continue,
            };
            for &vm in inv.vms_on(donor) {
                if inv.is_migrating(vm) {
                    continue;
                }
                let tasks = inv.tasks_in_vm(vm);
                if tasks.is_empty() {
                    continue;
                }
                let mut working_set_mb = cfg.vm_memory_overhead_mb;
                let mut needs_gpu = false;
                for task in &tasks {
                    if let Ok(info) = sub.task_info(*task) {
                        working_set_mb += info.memory_mb;
                        needs_gpu |= info.gpu_capable;
                    }
                }
                candidates.push(SweepCandidate {
                    vm,
                    source: donor,
                    arch,
                    working_set_mb,
                    needs_gpu,
                });
            }
        }
        if candidates.is_empty() {
            return None;
        }

        // Square cost matrix, padded with infeasible cells; the matching
        // needs rows <= columns.
        let size = candidates.len().max(targets.len());
        let mut costs = vec![INFEASIBLE; size * size];
        for (i, cand) in candidates.iter().enumerate() {
            for (j, target) in targets.iter().enumerate() {
                if self.target_feasible(target, cfg, cand.arch, cand.needs_gpu, cand.working_set_mb)
                {
                    let cost = ((cfg.high_util - target.load()).max(0.0) * COST_SCALE) as i64;
                    costs[i * size + j] = cost;
                }
            }
        }
        let matrix = Matrix::from_vec(size, size, costs).expect("square cost matrix");
        let (_, assignment) = kuhn_munkres_min(&matrix);

        for (i, cand) in candidates.iter().enumerate() {
            let j = assignment[i];
            if j < targets.len() && matrix[(i, j)] < INFEASIBLE {
                debug!(
                    "consolidation: VM {} off machine {} onto {}",
                    cand.vm, cand.source, targets[j].id
                );
                return Some((cand.vm, targets[j].id));
            }
        }
        None
    }

    fn target_feasible(
        &self,
        info: &MachineInfo,
        cfg: &SchedulerConfig,
        arch: CpuArch,
        needs_gpu: bool,
        working_set_mb: u64,
    ) -> bool {
        info.s_state.is_active()
            && info.arch == arch
            && (!needs_gpu || info.has_gpus)
            && info.memory_free_mb() >= working_set_mb
            && info.load() < cfg.high_util
    }
}
