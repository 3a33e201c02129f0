//! Event dispatcher
//!
//! One [`Scheduler`] instance owns the inventory, the pending queue and the
//! policy components; the host drives it through the nine callbacks below.
//! Handlers run to completion on the host's single control thread and never
//! let a substrate error escape: transient failures skip the candidate,
//! bookkeeping mismatches degrade to logged no-ops.

use tracing::{debug, info, warn};

use nimbus_core::{
    MachineId, PState, Priority, SState, SimTime, SlaClass, Substrate, TaskId, TaskInfo, VmId,
    VmKind,
};

use crate::classify::classify;
use crate::config::SchedulerConfig;
use crate::dvfs::DvfsController;
use crate::inventory::Inventory;
use crate::placer::{self, Placer};
use crate::power::PowerManager;
use crate::queue::{PendingEntry, PendingQueue};

/// The scheduling core.
pub struct Scheduler {
    cfg: SchedulerConfig,
    inv: Inventory,
    queue: PendingQueue,
    placer: Placer,
    dvfs: DvfsController,
    power: PowerManager,
    last_consolidation: SimTime,
    last_energy_kwh: f64,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Self {
            cfg,
            inv: Inventory::new(0),
            queue: PendingQueue::new(),
            placer: Placer,
            dvfs: DvfsController,
            power: PowerManager,
            last_consolidation: 0,
            last_energy_kwh: 0.0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    /// Read-only view of the bookkeeping, for hosts and tests.
    pub fn inventory(&self) -> &Inventory {
        &self.inv
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    // ---- callbacks -----------------------------------------------------

    /// Build the inventory, warm the initial machine set and retire the rest.
    pub fn on_init(&mut self, sub: &mut dyn Substrate) {
        let total = sub.machine_total();
        self.inv = Inventory::new(total);
        self.queue = PendingQueue::new();
        info!(
            "initializing scheduler: {total} machines, {} always warm",
            self.cfg.initial_active_machines
        );

        for machine in self.inv.machines().collect::<Vec<_>>() {
            let info = match sub.machine_info(machine) {
                Ok(info) => info,
                Err(e) => {
                    warn!("machine {machine} unreadable at init: {e}");
                    continue;
                }
            };
            if (machine.0 as usize) < self.cfg.initial_active_machines {
                if info.s_state.is_active() {
                    self.inv.set_active(machine);
                    self.inv.record_power_on(machine, 0);
                    self.ensure_bootstrap_vm(sub, machine);
                } else if sub.machine_set_state(machine, SState::S0).is_ok() {
                    self.inv.mark_pending_state(machine);
                }
            } else if !info.s_state.is_off() {
                if sub.machine_set_state(machine, SState::S5).is_ok() {
                    self.inv.mark_pending_state(machine);
                    debug!("retiring surplus machine {machine} at init");
                }
            }
        }
    }

    /// Place an arriving task, or queue it and wake capacity.
    pub fn on_new_task(&mut self, sub: &mut dyn Substrate, now: SimTime, task: TaskId) {
        let info = match sub.task_info(task) {
            Ok(info) => info,
            Err(e) => {
                warn!("task {task} arrived but its snapshot failed: {e}");
                return;
            }
        };
        let urgency = placer::urgency(&info, now);
        debug!(
            "new {} task {task}: {} / {} / {}, urgency {urgency:.3}",
            classify(&info),
            info.required_arch,
            info.required_vm,
            info.sla
        );
        self.place_or_queue(sub, now, &info, urgency);
    }

    /// Forget a finished task, relax its machine, maybe retire it, and give
    /// waiting tasks the freed room.
    pub fn on_task_complete(&mut self, sub: &mut dyn Substrate, now: SimTime, task: TaskId) {
        self.queue.remove(task);
        let Some((vm, machine)) = self.inv.release_task(task) else {
            warn!("completion for task {task} not in our records; ignoring");
            return;
        };
        debug!("task {task} completed on VM {vm}");
        if let Some(machine) = machine {
            self.dvfs.reassess(&self.inv, sub, &self.cfg, now, machine, None);
            self.power
                .maybe_power_off(&mut self.inv, sub, &self.cfg, now, machine);
        }
        self.drain_pending(sub, now);
    }

    /// Periodic sweep: DVFS, power-down of idle machines, consolidation,
    /// cluster-load watchdog, energy telemetry, queue drain.
    pub fn on_periodic(&mut self, sub: &mut dyn Substrate, now: SimTime) {
        for machine in self.inv.active_machines().collect::<Vec<_>>() {
            if self.inv.is_frozen(machine) {
                continue;
            }
            self.dvfs
                .reassess(&self.inv, sub, &self.cfg, now, machine, None);
            if self.inv.task_count(machine) == 0 {
                self.power
                    .maybe_power_off(&mut self.inv, sub, &self.cfg, now, machine);
            }
        }
        self.run_consolidation(sub, now);
        self.watch_cluster_load(sub);
        self.sample_energy(sub);
        self.drain_pending(sub, now);
    }

    /// A VM finished migrating: unfreeze it, learn its new host, retry the
    /// queue.
    pub fn on_migration_complete(&mut self, sub: &mut dyn Substrate, now: SimTime, vm: VmId) {
        if !self.inv.clear_migration(vm) {
            warn!("migration completion for VM {vm} with no migration in flight");
        }
        match sub.vm_info(vm) {
            Ok(info) => {
                if let Some(new_host) = info.machine {
                    self.inv.complete_migration(vm, new_host);
                    debug!("VM {vm} now on machine {new_host}");
                    self.dvfs
                        .reassess(&self.inv, sub, &self.cfg, now, new_host, None);
                }
            }
            Err(e) => warn!("VM {vm} unreadable after migration: {e}"),
        }
        self.drain_pending(sub, now);
    }

    /// A machine finished a power transition.
    pub fn on_state_change_complete(
        &mut self,
        sub: &mut dyn Substrate,
        now: SimTime,
        machine: MachineId,
    ) {
        if !self.inv.clear_pending_state(machine) {
            warn!("state change completion for machine {machine} with no transition in flight");
        }
        let info = match sub.machine_info(machine) {
            Ok(info) => info,
            Err(e) => {
                warn!("machine {machine} unreadable after state change: {e}");
                return;
            }
        };
        if info.s_state.is_active() {
            self.inv.set_active(machine);
            self.inv.record_power_on(machine, now);
            // Fresh machines start at full tilt until the next reassessment.
            for core in 0..info.num_cpus {
                if let Err(e) = sub.machine_set_core_performance(machine, core, PState::P0) {
                    warn!("failed to set core {core} of fresh machine {machine}: {e}");
                }
            }
            self.ensure_bootstrap_vm(sub, machine);
            info!("machine {machine} is up");
        } else if info.s_state.is_off() {
            self.inv.clear_active(machine);
            debug!("machine {machine} is off");
        }
        self.drain_pending(sub, now);
    }

    /// Memory pressure: boost the machine, move its heaviest movable VM away,
    /// waking a compatible machine when no target exists.
    pub fn on_memory_warning(&mut self, sub: &mut dyn Substrate, now: SimTime, machine: MachineId) {
        warn!("memory pressure on machine {machine} at t={now}");
        self.dvfs.boost(&self.inv, sub, machine);
        if self.inv.is_frozen(machine) {
            return;
        }
        let Some(vm) = self.power.select_eviction_vm(&self.inv, sub, machine) else {
            return;
        };
        let mut working_set_mb = self.cfg.vm_memory_overhead_mb;
        let mut needs_gpu = false;
        for task in self.inv.tasks_in_vm(vm) {
            if let Ok(info) = sub.task_info(task) {
                working_set_mb += info.memory_mb;
                needs_gpu |= info.gpu_capable;
            }
        }
        let arch = match sub.machine_info(machine) {
            Ok(info) => info.arch,
            Err(e) => {
                warn!("machine {machine} unreadable during memory warning: {e}");
                return;
            }
        };
        match self.power.find_migration_target(
            &self.inv,
            sub,
            &self.cfg,
            machine,
            arch,
            needs_gpu,
            working_set_mb,
        ) {
            Some(target) => {
                self.power.migrate(&mut self.inv, sub, vm, target);
            }
            None => {
                self.power
                    .power_on_matching(&mut self.inv, sub, Some(arch), working_set_mb, needs_gpu);
            }
        }
    }

    /// A task is at risk of missing its deadline: boost its host and, for the
    /// strict classes, its own priority. Unknown or completed tasks are a
    /// no-op.
    pub fn on_sla_warning(&mut self, sub: &mut dyn Substrate, now: SimTime, task: TaskId) {
        let Some(vm) = self.inv.vm_of_task(task) else {
            debug!("SLA warning for task {task} not in our records; ignoring");
            return;
        };
        let Some(machine) = self.inv.host_of(vm) else {
            return;
        };
        if self.inv.is_frozen(machine) {
            return;
        }
        warn!("SLA risk for task {task} on machine {machine} at t={now}");
        self.dvfs.boost(&self.inv, sub, machine);
        match sub.required_sla(task) {
            Ok(SlaClass::Sla0 | SlaClass::Sla1) => {
                if let Err(e) = sub.set_task_priority(task, Priority::High) {
                    warn!("failed to escalate task {task}: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => warn!("task {task} unreadable during SLA warning: {e}"),
        }
    }

    /// Global shutdown: every VM down, every machine to S5.
    pub fn on_shutdown(&mut self, sub: &mut dyn Substrate, now: SimTime) {
        info!("shutting down at t={now}");
        for vm in self.inv.all_vms().collect::<Vec<_>>() {
            if let Err(e) = sub.vm_shutdown(vm) {
                debug!("VM {vm} shutdown: {e}");
            }
        }
        for machine in self.inv.machines().collect::<Vec<_>>() {
            if let Err(e) = sub.machine_set_state(machine, SState::S5) {
                debug!("machine {machine} power-off at shutdown: {e}");
            }
        }
    }

    // ---- internals -----------------------------------------------------

    fn ensure_bootstrap_vm(&mut self, sub: &mut dyn Substrate, machine: MachineId) {
        if !self.inv.vms_on(machine).is_empty() {
            return;
        }
        let arch = match sub.machine_info(machine) {
            Ok(info) => info.arch,
            Err(e) => {
                warn!("machine {machine} unreadable for bootstrap VM: {e}");
                return;
            }
        };
        match sub
            .vm_create(VmKind::Linux, arch)
            .and_then(|vm| sub.vm_attach(vm, machine).map(|()| vm))
        {
            Ok(vm) => {
                self.inv.attach_vm(vm, machine);
                debug!("bootstrap VM {vm} on machine {machine}");
            }
            Err(e) => warn!("failed to bootstrap a VM on machine {machine}: {e}"),
        }
    }

    /// Returns true when the task was assigned; false leaves it queued.
    fn place_or_queue(
        &mut self,
        sub: &mut dyn Substrate,
        now: SimTime,
        info: &TaskInfo,
        urgency: f64,
    ) -> bool {
        if let Some(machine) = self.placer.find_machine(&self.inv, sub, &self.cfg, info) {
            match self.placer.place_on(&mut self.inv, sub, now, machine, info) {
                Ok((vm, priority)) => {
                    info!(
                        "assigned task {} to VM {vm} on machine {machine} at {priority:?}",
                        info.id
                    );
                    self.dvfs.reassess(
                        &self.inv,
                        sub,
                        &self.cfg,
                        now,
                        machine,
                        Some((urgency, info.sla)),
                    );
                    return true;
                }
                Err(e) => warn!("placement of task {} on machine {machine} failed: {e}", info.id),
            }
        } else {
            let need = info.memory_mb + self.cfg.vm_memory_overhead_mb;
            self.power.power_on_matching(
                &mut self.inv,
                sub,
                Some(info.required_arch),
                need,
                info.gpu_capable,
            );
        }
        debug!("task {} queued ({} waiting)", info.id, self.queue.len() + 1);
        self.queue.push(PendingEntry {
            task: info.id,
            sla: info.sla,
            urgency,
        });
        false
    }

    fn drain_pending(&mut self, sub: &mut dyn Substrate, now: SimTime) {
        if self.queue.is_empty() {
            return;
        }
        self.queue
            .refresh_with(|task| sub.task_info(task).ok().map(|i| placer::urgency(&i, now)));
        self.queue.reprioritize();

        for entry in self.queue.entries().to_vec() {
            if self.inv.has_task(entry.task) {
                self.queue.remove(entry.task);
                continue;
            }
            let info = match sub.task_info(entry.task) {
                Ok(info) => info,
                Err(e) => {
                    warn!("dropping queued task {}: {e}", entry.task);
                    self.queue.remove(entry.task);
                    continue;
                }
            };
            let Some(machine) = self.placer.find_machine(&self.inv, sub, &self.cfg, &info) else {
                // Stop at the first unplaceable task so the strict classes
                // are never starved by retries behind them.
                break;
            };
            match self.placer.place_on(&mut self.inv, sub, now, machine, &info) {
                Ok((vm, priority)) => {
                    info!(
                        "drained task {} to VM {vm} on machine {machine} at {priority:?}",
                        entry.task
                    );
                    self.queue.remove(entry.task);
                    self.dvfs.reassess(
                        &self.inv,
                        sub,
                        &self.cfg,
                        now,
                        machine,
                        Some((entry.urgency, info.sla)),
                    );
                }
                Err(e) => {
                    warn!("drain of task {} failed: {e}", entry.task);
                    break;
                }
            }
        }
    }

    fn run_consolidation(&mut self, sub: &mut dyn Substrate, now: SimTime) {
        if self.inv.migration_in_flight() {
            return;
        }
        if now.saturating_sub(self.last_consolidation) < self.cfg.consolidation_interval {
            return;
        }
        self.last_consolidation = now;
        if let Some((vm, target)) = self.power.plan_consolidation(&self.inv, sub, &self.cfg) {
            self.power.migrate(&mut self.inv, sub, vm, target);
        }
    }

    /// Proactively wake one machine when the cluster is running hot or tasks
    /// are waiting. Idle while any power transition is in flight, so repeated
    /// checks with no intervening events stay a fixed point.
    fn watch_cluster_load(&mut self, sub: &mut dyn Substrate) {
        if self.inv.any_pending_state() {
            return;
        }
        let mut tasks = 0u64;
        let mut cores = 0u64;
        for machine in self.inv.active_machines() {
            if self.inv.has_pending_state(machine) {
                continue;
            }
            if let Ok(info) = sub.machine_info(machine) {
                tasks += u64::from(self.inv.task_count(machine));
                cores += u64::from(info.num_cpus);
            }
        }
        if cores == 0 {
            return;
        }
        let cluster_load = tasks as f64 / cores as f64;
        if cluster_load > self.cfg.load_high * 0.8 || !self.queue.is_empty() {
            if self
                .power
                .power_on_matching(&mut self.inv, sub, None, 0, false)
                .is_some()
            {
                debug!("woke extra capacity (cluster load {cluster_load:.2}, {} waiting)",
                    self.queue.len());
            }
        }
    }

    fn sample_energy(&mut self, sub: &dyn Substrate) {
        let energy = sub.cluster_energy_kwh();
        debug!(
            "cluster energy {energy:.3} kWh (+{:.3})",
            energy - self.last_energy_kwh
        );
        self.last_energy_kwh = energy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{mock_task, MockSubstrate};
    use nimbus_core::CpuArch;

    /// Every accepted, uncompleted task is bound XOR queued.
    fn assert_task_exclusive(sched: &Scheduler, task: TaskId) {
        let bound = sched.inv.has_task(task);
        let queued = sched.queue.contains(task);
        assert!(bound ^ queued, "task {task} bound={bound} queued={queued}");
    }

    fn small_cluster(floor: usize) -> (Scheduler, MockSubstrate) {
        let mut sub = MockSubstrate::new();
        for _ in 0..2 {
            sub.add_machine(CpuArch::X86, 2, 4096, false, SState::S0);
        }
        for _ in 0..2 {
            sub.add_machine(CpuArch::X86, 2, 4096, false, SState::S5);
        }
        let cfg = SchedulerConfig::default().with_initial_active_machines(floor);
        let mut sched = Scheduler::new(cfg);
        sched.on_init(&mut sub);
        (sched, sub)
    }

    #[test]
    fn test_init_seeds_floor_and_retires_tail() {
        let mut sub = MockSubstrate::new();
        for _ in 0..4 {
            sub.add_machine(CpuArch::X86, 2, 4096, false, SState::S0);
        }
        let cfg = SchedulerConfig::default().with_initial_active_machines(2);
        let mut sched = Scheduler::new(cfg);
        sched.on_init(&mut sub);

        assert!(sched.inv.is_active(MachineId(0)));
        assert!(sched.inv.is_active(MachineId(1)));
        // Warm machines get a bootstrap VM each
        assert_eq!(sched.inv.vms_on(MachineId(0)).len(), 1);
        assert_eq!(sched.inv.vms_on(MachineId(1)).len(), 1);
        // Surplus machines are asked to sleep and are frozen meanwhile
        assert_eq!(
            sub.state_requests,
            vec![(MachineId(2), SState::S5), (MachineId(3), SState::S5)]
        );
        assert!(sched.inv.has_pending_state(MachineId(2)));
    }

    #[test]
    fn test_new_task_assigned_to_lowest_machine() {
        let (mut sched, mut sub) = small_cluster(2);
        let task = mock_task(1, CpuArch::X86, VmKind::Linux, SlaClass::Sla2);
        sub.add_task(task);

        sched.on_new_task(&mut sub, 100, TaskId(1));

        assert!(sched.inv.has_task(TaskId(1)));
        let vm = sched.inv.vm_of_task(TaskId(1)).unwrap();
        assert_eq!(sched.inv.host_of(vm), Some(MachineId(0)));
        assert_eq!(sub.task_priority(TaskId(1)).unwrap(), Priority::Mid);
        assert_task_exclusive(&sched, TaskId(1));
    }

    #[test]
    fn test_unplaceable_task_queues_and_wakes_machine() {
        let (mut sched, mut sub) = small_cluster(2);
        // RISC-V has no active machine and no sleeping match either
        let task = mock_task(1, CpuArch::RiscV, VmKind::Linux, SlaClass::Sla1);
        sub.add_task(task);

        sched.on_new_task(&mut sub, 100, TaskId(1));

        assert!(!sched.inv.has_task(TaskId(1)));
        assert!(sched.queue.contains(TaskId(1)));
        assert_task_exclusive(&sched, TaskId(1));
    }

    #[test]
    fn test_queue_drains_after_power_up() {
        let (mut sched, mut sub) = small_cluster(2);
        // Fill both active machines' memory so the next task cannot fit.
        for id in 1..=2 {
            let mut task = mock_task(id, CpuArch::X86, VmKind::Linux, SlaClass::Sla2);
            task.memory_mb = 3500;
            sub.add_task(task);
            sched.on_new_task(&mut sub, 50, TaskId(id));
            assert!(sched.inv.has_task(TaskId(id)));
        }

        let mut task = mock_task(3, CpuArch::X86, VmKind::Linux, SlaClass::Sla1);
        task.memory_mb = 3500;
        sub.add_task(task);
        sched.on_new_task(&mut sub, 100, TaskId(3));

        // Task 3 waits; a compatible S5 machine was asked to wake.
        assert!(sched.queue.contains(TaskId(3)));
        assert_eq!(sub.state_requests.last(), Some(&(MachineId(2), SState::S0)));

        // Power-up confirmation drains the queue onto the new machine.
        sub.complete_state(MachineId(2));
        sched.on_state_change_complete(&mut sub, 200, MachineId(2));

        assert!(sched.inv.has_task(TaskId(3)));
        let vm = sched.inv.vm_of_task(TaskId(3)).unwrap();
        assert_eq!(sched.inv.host_of(vm), Some(MachineId(2)));
        assert_task_exclusive(&sched, TaskId(3));
    }

    #[test]
    fn test_task_complete_forgets_and_unknown_is_noop() {
        let (mut sched, mut sub) = small_cluster(2);
        let task = mock_task(1, CpuArch::X86, VmKind::Linux, SlaClass::Sla3);
        sub.add_task(task);
        sched.on_new_task(&mut sub, 100, TaskId(1));

        sched.on_task_complete(&mut sub, 500, TaskId(1));
        assert!(!sched.inv.has_task(TaskId(1)));
        assert_eq!(sched.inv.task_count(MachineId(0)), 0);

        // Completion for a task we never saw must not disturb anything.
        sched.on_task_complete(&mut sub, 600, TaskId(99));
        assert_eq!(sched.inv.placed_task_total(), 0);
    }

    #[test]
    fn test_sla_warning_for_completed_task_is_noop() {
        let (mut sched, mut sub) = small_cluster(2);
        let task = mock_task(1, CpuArch::X86, VmKind::Linux, SlaClass::Sla0);
        sub.add_task(task);
        sched.on_new_task(&mut sub, 100, TaskId(1));
        sched.on_task_complete(&mut sub, 500, TaskId(1));

        let perf_before = sub.perf_sets.len();
        sched.on_sla_warning(&mut sub, 600, TaskId(1));
        assert_eq!(sub.perf_sets.len(), perf_before);
    }

    #[test]
    fn test_sla_warning_boosts_host_and_priority() {
        let (mut sched, mut sub) = small_cluster(2);
        let mut task = mock_task(1, CpuArch::X86, VmKind::Linux, SlaClass::Sla1);
        // Low urgency so placement-time DVFS leaves the machine below P0
        task.remaining_instructions = 1_000;
        task.target_completion = 1_000_000_000;
        sub.add_task(task);
        sched.on_new_task(&mut sub, 100, TaskId(1));
        assert_ne!(sub.machine_info(MachineId(0)).unwrap().p_state, PState::P0);

        sched.on_sla_warning(&mut sub, 200, TaskId(1));
        assert_eq!(sub.machine_info(MachineId(0)).unwrap().p_state, PState::P0);
        assert_eq!(sub.task_priority(TaskId(1)).unwrap(), Priority::High);
    }

    #[test]
    fn test_periodic_is_a_fixed_point() {
        let (mut sched, mut sub) = small_cluster(2);
        for id in 1..=3 {
            let task = mock_task(id, CpuArch::X86, VmKind::Linux, SlaClass::Sla2);
            sub.add_task(task);
            sched.on_new_task(&mut sub, 100, TaskId(id));
        }

        sched.on_periodic(&mut sub, 200);
        let perf = sub.perf_sets.clone();
        let states = sub.state_requests.clone();
        let migrations = sub.migrations.clone();
        let placed = sched.inv.placed_task_total();

        sched.on_periodic(&mut sub, 200);
        assert_eq!(sub.perf_sets, perf);
        assert_eq!(sub.state_requests, states);
        assert_eq!(sub.migrations, migrations);
        assert_eq!(sched.inv.placed_task_total(), placed);
    }

    #[test]
    fn test_state_change_round_trip() {
        let (mut sched, mut sub) = small_cluster(2);
        // Wake machine 2 and confirm: it must look like it was always warm.
        sub.machine_set_state(MachineId(2), SState::S0).unwrap();
        sched.inv.mark_pending_state(MachineId(2));
        sub.complete_state(MachineId(2));
        sched.on_state_change_complete(&mut sub, 1_000, MachineId(2));

        assert!(sched.inv.is_active(MachineId(2)));
        assert!(!sched.inv.has_pending_state(MachineId(2)));
        assert_eq!(sched.inv.vms_on(MachineId(2)).len(), 1);
        assert_eq!(sched.inv.powered_on_at(MachineId(2)), Some(1_000));
    }

    #[test]
    fn test_memory_warning_migrates_busiest_vm() {
        let (mut sched, mut sub) = small_cluster(2);
        for id in 1..=2 {
            let task = mock_task(id, CpuArch::X86, VmKind::Linux, SlaClass::Sla3);
            sub.add_task(task);
            sched.on_new_task(&mut sub, 100, TaskId(id));
        }
        let vm = sched.inv.vm_of_task(TaskId(1)).unwrap();
        assert_eq!(sched.inv.host_of(vm), Some(MachineId(0)));

        sched.on_memory_warning(&mut sub, 200, MachineId(0));

        // Host boosted, eviction migration in flight towards machine 1.
        assert_eq!(sub.machine_info(MachineId(0)).unwrap().p_state, PState::P0);
        assert!(sched.inv.is_migrating(vm));
        assert_eq!(sub.migrations, vec![(vm, MachineId(1))]);

        // Completion re-homes the VM and its tasks.
        sub.complete_migration(vm);
        sched.on_migration_complete(&mut sub, 300, vm);
        assert_eq!(sched.inv.host_of(vm), Some(MachineId(1)));
        assert_eq!(sched.inv.task_count(MachineId(0)), 0);
        assert_eq!(sched.inv.task_count(MachineId(1)), 2);
    }

    #[test]
    fn test_memory_warning_wakes_machine_when_no_target() {
        let mut sub = MockSubstrate::new();
        sub.add_machine(CpuArch::Power, 8, 32768, true, SState::S0);
        sub.add_machine(CpuArch::Power, 8, 32768, true, SState::S5);
        let cfg = SchedulerConfig::default().with_initial_active_machines(1);
        let mut sched = Scheduler::new(cfg);
        sched.on_init(&mut sub);

        let task = mock_task(1, CpuArch::Power, VmKind::Aix, SlaClass::Sla2);
        sub.add_task(task);
        sched.on_new_task(&mut sub, 100, TaskId(1));

        sched.on_memory_warning(&mut sub, 200, MachineId(0));

        // No active target: the sleeping POWER machine is asked to wake.
        assert!(sub.migrations.is_empty());
        assert_eq!(sub.state_requests.last(), Some(&(MachineId(1), SState::S0)));
    }

    #[test]
    fn test_consolidation_migrates_then_retires() {
        let mut sub = MockSubstrate::new();
        sub.add_machine(CpuArch::X86, 8, 16384, false, SState::S0);
        sub.add_machine(CpuArch::X86, 2, 16384, true, SState::S5);
        let cfg = SchedulerConfig::default().with_initial_active_machines(1);
        let mut sched = Scheduler::new(cfg);
        sched.on_init(&mut sub);

        // A GPU task cannot run on machine 0, so the GPU machine is woken
        // and the task drains onto it: load 0.5 there.
        let mut gpu_task = mock_task(2, CpuArch::X86, VmKind::Linux, SlaClass::Sla3);
        gpu_task.gpu_capable = true;
        sub.add_task(gpu_task);
        sched.on_new_task(&mut sub, 10, TaskId(2));
        sub.complete_state(MachineId(1));
        sched.on_state_change_complete(&mut sub, 20, MachineId(1));
        assert!(sched.inv.has_task(TaskId(2)));

        // A plain task lands on the idle 8-core machine: load 0.125, below
        // the consolidation floor.
        let task = mock_task(1, CpuArch::X86, VmKind::Linux, SlaClass::Sla3);
        sub.add_task(task);
        sched.on_new_task(&mut sub, 30, TaskId(1));
        let vm = sched.inv.vm_of_task(TaskId(1)).unwrap();
        assert_eq!(sched.inv.host_of(vm), Some(MachineId(0)));

        let interval = sched.cfg.consolidation_interval;
        sched.on_periodic(&mut sub, interval + 1);

        let vm = sched.inv.vm_of_task(TaskId(1)).unwrap();
        assert!(sched.inv.is_migrating(vm));
        assert_eq!(sub.migrations, vec![(vm, MachineId(1))]);

        sub.complete_migration(vm);
        sched.on_migration_complete(&mut sub, interval + 100, vm);
        assert_eq!(sched.inv.task_count(MachineId(0)), 0);

        // The emptied machine retires on a later sweep, past its dwell.
        sched.on_periodic(&mut sub, 2 * interval + 200);
        assert_eq!(sub.state_requests.last(), Some(&(MachineId(0), SState::S5)));
        sub.complete_state(MachineId(0));
        sched.on_state_change_complete(&mut sub, 2 * interval + 300, MachineId(0));
        assert!(!sched.inv.is_active(MachineId(0)));
    }

    #[test]
    fn test_unreadable_queued_task_is_dropped_on_drain() {
        let (mut sched, mut sub) = small_cluster(2);
        let task = mock_task(1, CpuArch::RiscV, VmKind::Linux, SlaClass::Sla2);
        sub.add_task(task);
        sched.on_new_task(&mut sub, 100, TaskId(1));
        assert!(sched.queue.contains(TaskId(1)));

        // The substrate loses the task; the next drain discards it instead
        // of wedging the queue.
        sub.poison_task(TaskId(1));
        sched.on_periodic(&mut sub, 200);
        assert!(!sched.queue.contains(TaskId(1)));
        assert!(!sched.inv.has_task(TaskId(1)));
    }

    #[test]
    fn test_shutdown_retires_everything() {
        let (mut sched, mut sub) = small_cluster(2);
        sched.on_shutdown(&mut sub, 10_000_000);

        let s5_requests = sub
            .state_requests
            .iter()
            .filter(|(_, s)| *s == SState::S5)
            .count();
        assert_eq!(s5_requests, 4);
    }
}
