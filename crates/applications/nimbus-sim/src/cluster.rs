//! Reference in-memory substrate
//!
//! Models machines, VMs and tasks with just enough physics for the scheduler
//! to be exercised honestly: MIPS-rated progress (one MIPS = one instruction
//! per simulated microsecond), per-P-state power draw integrated into energy,
//! asynchronous power transitions and live migrations with fixed latencies,
//! memory accounting, and per-class SLA bookkeeping.
//!
//! Time never advances inside a substrate call; the engine moves the clock
//! between events via [`SimCluster::advance_to`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use nimbus_core::{
    CpuArch, MachineId, MachineInfo, PState, Priority, Result, SState, SimTime, SlaClass,
    Substrate, SubstrateError, TaskId, TaskInfo, VmId, VmInfo, VmKind,
};

/// Residue below which a task counts as finished (sub-instruction rounding).
const DONE_EPSILON: f64 = 0.5;

/// Simulation-side knobs, fixed at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Latency of an S-state transition, simulated microseconds.
    pub state_transition_us: SimTime,
    /// Latency of a live migration, simulated microseconds.
    pub migration_us: SimTime,
    /// Memory overhead charged per attached VM, MB.
    pub vm_overhead_mb: u64,
    /// Fraction of machine memory above which a memory warning fires.
    pub memory_pressure_ratio: f64,
    /// Power draw per performance state while running tasks, watts.
    pub active_power_w: [f64; 4],
    /// Power draw of an active machine with no tasks, watts.
    pub idle_power_w: f64,
    /// Power draw of a sleeping or off machine, watts.
    pub sleep_power_w: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            state_transition_us: 50_000,
            migration_us: 100_000,
            vm_overhead_mb: 8,
            memory_pressure_ratio: 0.90,
            active_power_w: [220.0, 160.0, 110.0, 70.0],
            idle_power_w: 55.0,
            sleep_power_w: 2.0,
        }
    }
}

impl SimConfig {
    pub fn with_state_transition(mut self, us: SimTime) -> Self {
        self.state_transition_us = us;
        self
    }

    pub fn with_migration_latency(mut self, us: SimTime) -> Self {
        self.migration_us = us;
        self
    }
}

/// Static description of one machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    pub arch: CpuArch,
    pub num_cpus: u32,
    pub memory_mb: u64,
    pub has_gpus: bool,
    pub mips: [u64; 4],
}

impl MachineSpec {
    pub fn new(arch: CpuArch, num_cpus: u32, memory_mb: u64, has_gpus: bool) -> Self {
        Self {
            arch,
            num_cpus,
            memory_mb,
            has_gpus,
            mips: [3000, 2200, 1500, 800],
        }
    }
}

/// Static description of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub arrival: SimTime,
    pub arch: CpuArch,
    pub vm_kind: VmKind,
    pub memory_mb: u64,
    pub gpu_capable: bool,
    pub sla: SlaClass,
    pub instructions: u64,
    /// Absolute deadline in simulated time.
    pub deadline: SimTime,
}

/// Completion callbacks and warnings the substrate owes the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    StateChange(MachineId),
    Migration(VmId),
    MemoryWarning(MachineId),
    SlaWarning(TaskId),
}

#[derive(Debug)]
struct SimMachine {
    spec: MachineSpec,
    s_state: SState,
    p_state: PState,
    requested_state: Option<SState>,
    energy_joules: f64,
    /// Set while memory pressure is high so the warning fires once per
    /// excursion.
    pressure_flagged: bool,
}

#[derive(Debug)]
struct SimVm {
    kind: VmKind,
    arch: CpuArch,
    machine: Option<MachineId>,
    tasks: Vec<TaskId>,
    migrating_to: Option<MachineId>,
}

#[derive(Debug)]
struct SimTask {
    spec: TaskSpec,
    remaining: f64,
    vm: Option<VmId>,
    priority: Priority,
    completed_at: Option<SimTime>,
    sla_warned: bool,
}

/// The in-memory cluster
pub struct SimCluster {
    cfg: SimConfig,
    now: SimTime,
    machines: Vec<SimMachine>,
    vms: BTreeMap<VmId, SimVm>,
    next_vm: u32,
    tasks: Vec<SimTask>,
    /// Async operations waiting to complete, drained by the engine.
    scheduled: Vec<(SimTime, Callback)>,
    sla_met: [u32; 4],
    sla_done: [u32; 4],
}

impl SimCluster {
    pub fn new(cfg: SimConfig, specs: Vec<MachineSpec>) -> Self {
        let machines = specs
            .into_iter()
            .map(|spec| SimMachine {
                spec,
                s_state: SState::S0,
                p_state: PState::P3,
                requested_state: None,
                energy_joules: 0.0,
                pressure_flagged: false,
            })
            .collect();
        Self {
            cfg,
            now: 0,
            machines,
            vms: BTreeMap::new(),
            next_vm: 0,
            tasks: Vec::new(),
            scheduled: Vec::new(),
            sla_met: [0; 4],
            sla_done: [0; 4],
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Register a task. The engine announces it to the scheduler at its
    /// arrival time.
    pub fn spawn_task(&mut self, spec: &TaskSpec) -> TaskId {
        let id = TaskId(self.tasks.len() as u32);
        self.tasks.push(SimTask {
            spec: spec.clone(),
            remaining: spec.instructions as f64,
            vm: None,
            priority: Priority::Low,
            completed_at: None,
            sla_warned: false,
        });
        id
    }

    // ---- time ----------------------------------------------------------

    /// Advance the clock, integrating energy and task progress.
    pub fn advance_to(&mut self, t: SimTime) {
        if t <= self.now {
            return;
        }
        let dt_us = (t - self.now) as f64;

        for idx in 0..self.machines.len() {
            let machine = MachineId(idx as u32);
            let resident = self.running_tasks_on(machine);
            let s_active = self.machines[idx].s_state.is_active();
            let p_idx = self.machines[idx].p_state.index();

            let power_w = if s_active {
                if resident.is_empty() {
                    self.cfg.idle_power_w
                } else {
                    self.cfg.active_power_w[p_idx]
                }
            } else {
                self.cfg.sleep_power_w
            };
            self.machines[idx].energy_joules += power_w * dt_us / 1e6;

            if s_active && !resident.is_empty() {
                let rate = self.progress_rate(idx, resident.len());
                for task in resident {
                    let entry = &mut self.tasks[task.0 as usize];
                    entry.remaining = (entry.remaining - rate * dt_us).max(0.0);
                }
            }
        }
        self.now = t;
    }

    /// Per-task instruction rate on a machine, instructions per microsecond.
    fn progress_rate(&self, machine_idx: usize, n_tasks: usize) -> f64 {
        let m = &self.machines[machine_idx];
        let mips = m.spec.mips[m.p_state.index()] as f64;
        let share = (m.spec.num_cpus as f64 / n_tasks as f64).min(1.0);
        mips * share
    }

    fn running_tasks_on(&self, machine: MachineId) -> Vec<TaskId> {
        let mut tasks = Vec::new();
        for vm in self.vms.values() {
            if vm.machine == Some(machine) {
                for &task in &vm.tasks {
                    if self.tasks[task.0 as usize].completed_at.is_none() {
                        tasks.push(task);
                    }
                }
            }
        }
        tasks
    }

    /// Earliest estimated task completion at current rates.
    pub fn next_completion(&self) -> Option<(SimTime, TaskId)> {
        let mut best: Option<(SimTime, TaskId)> = None;
        for (idx, m) in self.machines.iter().enumerate() {
            if !m.s_state.is_active() {
                continue;
            }
            let resident = self.running_tasks_on(MachineId(idx as u32));
            if resident.is_empty() {
                continue;
            }
            let rate = self.progress_rate(idx, resident.len());
            if rate <= 0.0 {
                continue;
            }
            for task in resident {
                let remaining = self.tasks[task.0 as usize].remaining;
                let eta = self.now + (remaining / rate).ceil() as SimTime;
                if best.map_or(true, |(t, _)| eta < t) {
                    best = Some((eta, task));
                }
            }
        }
        best
    }

    /// Finalize a task if its work is done. Removes it from its VM and
    /// records SLA attainment. Returns false when the estimate was stale.
    pub fn try_complete(&mut self, task: TaskId, t: SimTime) -> bool {
        let entry = &self.tasks[task.0 as usize];
        if entry.completed_at.is_some() || entry.vm.is_none() {
            return false;
        }
        if entry.remaining > DONE_EPSILON {
            return false;
        }
        let vm = self.tasks[task.0 as usize].vm.take().unwrap();
        if let Some(vm) = self.vms.get_mut(&vm) {
            vm.tasks.retain(|x| *x != task);
        }
        let entry = &mut self.tasks[task.0 as usize];
        entry.completed_at = Some(t);
        let idx = entry.spec.sla.index();
        self.sla_done[idx] += 1;
        if t <= entry.spec.deadline {
            self.sla_met[idx] += 1;
        }
        true
    }

    pub fn is_completed(&self, task: TaskId) -> bool {
        self.tasks[task.0 as usize].completed_at.is_some()
    }

    pub fn completed_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.completed_at.is_some()).count()
    }

    /// Newly scheduled async completions since the last drain, for the
    /// engine to enqueue. Effects apply in [`SimCluster::apply_callback`].
    pub fn drain_scheduled(&mut self) -> Vec<(SimTime, Callback)> {
        std::mem::take(&mut self.scheduled)
    }

    /// Apply the substrate-side effect of a due callback, right before it is
    /// dispatched to the scheduler.
    pub fn apply_callback(&mut self, cb: Callback) {
        match cb {
            Callback::StateChange(machine) => {
                let m = &mut self.machines[machine.0 as usize];
                if let Some(target) = m.requested_state.take() {
                    m.s_state = target;
                }
            }
            Callback::Migration(vm) => {
                if let Some(entry) = self.vms.get_mut(&vm) {
                    if let Some(target) = entry.migrating_to.take() {
                        entry.machine = Some(target);
                    }
                }
            }
            Callback::MemoryWarning(_) | Callback::SlaWarning(_) => {}
        }
    }

    /// Scan for memory pressure and deadline risk; each warning fires once
    /// per excursion/task.
    pub fn collect_warnings(&mut self) -> Vec<Callback> {
        let mut warnings = Vec::new();

        for idx in 0..self.machines.len() {
            let machine = MachineId(idx as u32);
            let used = self.memory_used_mb(machine);
            let m = &mut self.machines[idx];
            let pressured = m.s_state.is_active()
                && used as f64 > m.spec.memory_mb as f64 * self.cfg.memory_pressure_ratio;
            if pressured && !m.pressure_flagged {
                m.pressure_flagged = true;
                warnings.push(Callback::MemoryWarning(machine));
            } else if !pressured {
                m.pressure_flagged = false;
            }
        }

        for idx in 0..self.tasks.len() {
            let task = TaskId(idx as u32);
            let entry = &self.tasks[idx];
            if entry.sla_warned || entry.completed_at.is_some() {
                continue;
            }
            let Some(vm) = entry.vm else { continue };
            let Some(machine) = self.vms.get(&vm).and_then(|v| v.machine) else {
                continue;
            };
            let m_idx = machine.0 as usize;
            if !self.machines[m_idx].s_state.is_active() {
                continue;
            }
            let n = self.running_tasks_on(machine).len().max(1);
            let rate = self.progress_rate(m_idx, n);
            let at_risk = if rate <= 0.0 {
                true
            } else {
                let eta = self.now + (entry.remaining / rate) as SimTime;
                eta > entry.spec.deadline
            };
            if at_risk {
                self.tasks[idx].sla_warned = true;
                warnings.push(Callback::SlaWarning(task));
            }
        }

        warnings
    }

    // ---- internals -----------------------------------------------------

    fn memory_used_mb(&self, machine: MachineId) -> u64 {
        let mut used = 0;
        for vm in self.vms.values() {
            if vm.machine == Some(machine) {
                used += self.cfg.vm_overhead_mb;
                for &task in &vm.tasks {
                    used += self.tasks[task.0 as usize].spec.memory_mb;
                }
            }
        }
        used
    }

    fn machine(&self, id: MachineId) -> Result<&SimMachine> {
        self.machines
            .get(id.0 as usize)
            .ok_or(SubstrateError::MachineNotFound(id))
    }

    fn task(&self, id: TaskId) -> Result<&SimTask> {
        self.tasks
            .get(id.0 as usize)
            .ok_or(SubstrateError::TaskNotFound(id))
    }
}

impl Substrate for SimCluster {
    fn machine_total(&self) -> u32 {
        self.machines.len() as u32
    }

    fn machine_info(&self, id: MachineId) -> Result<MachineInfo> {
        let m = self.machine(id)?;
        let active_tasks = self.running_tasks_on(id).len() as u32;
        let active_vms = self
            .vms
            .values()
            .filter(|vm| vm.machine == Some(id))
            .count() as u32;
        Ok(MachineInfo {
            id,
            arch: m.spec.arch,
            num_cpus: m.spec.num_cpus,
            memory_mb: m.spec.memory_mb,
            memory_used_mb: self.memory_used_mb(id),
            has_gpus: m.spec.has_gpus,
            s_state: m.s_state,
            p_state: m.p_state,
            mips: m.spec.mips,
            active_tasks,
            active_vms,
        })
    }

    fn machine_set_state(&mut self, id: MachineId, state: SState) -> Result<()> {
        let transition = self.cfg.state_transition_us;
        let due = self.now + transition;
        let m = self
            .machines
            .get_mut(id.0 as usize)
            .ok_or(SubstrateError::MachineNotFound(id))?;
        if m.requested_state.is_some() {
            return Err(SubstrateError::PowerTransitionInFlight(id));
        }
        m.requested_state = Some(state);
        self.scheduled.push((due, Callback::StateChange(id)));
        Ok(())
    }

    fn machine_set_core_performance(
        &mut self,
        id: MachineId,
        _core: u32,
        pstate: PState,
    ) -> Result<()> {
        let m = self
            .machines
            .get_mut(id.0 as usize)
            .ok_or(SubstrateError::MachineNotFound(id))?;
        m.p_state = pstate;
        Ok(())
    }

    fn machine_energy_kwh(&self, id: MachineId) -> Result<f64> {
        Ok(self.machine(id)?.energy_joules / 3.6e6)
    }

    fn cluster_energy_kwh(&self) -> f64 {
        self.machines.iter().map(|m| m.energy_joules).sum::<f64>() / 3.6e6
    }

    fn vm_create(&mut self, kind: VmKind, arch: CpuArch) -> Result<VmId> {
        if !kind.supports(arch) {
            return Err(SubstrateError::IncompatibleVm { kind, arch });
        }
        let id = VmId(self.next_vm);
        self.next_vm += 1;
        self.vms.insert(
            id,
            SimVm {
                kind,
                arch,
                machine: None,
                tasks: Vec::new(),
                migrating_to: None,
            },
        );
        Ok(id)
    }

    fn vm_attach(&mut self, vm: VmId, machine: MachineId) -> Result<()> {
        let arch = self.machine(machine)?.spec.arch;
        let entry = self.vms.get_mut(&vm).ok_or(SubstrateError::VmNotFound(vm))?;
        if entry.arch != arch {
            return Err(SubstrateError::IncompatibleVm {
                kind: entry.kind,
                arch,
            });
        }
        entry.machine = Some(machine);
        Ok(())
    }

    fn vm_shutdown(&mut self, vm: VmId) -> Result<()> {
        let entry = self.vms.remove(&vm).ok_or(SubstrateError::VmNotFound(vm))?;
        // Resident tasks are abandoned; they make no further progress.
        for task in entry.tasks {
            self.tasks[task.0 as usize].vm = None;
        }
        Ok(())
    }

    fn vm_migrate(&mut self, vm: VmId, target: MachineId) -> Result<()> {
        let (target_arch, target_active) = {
            let m = self.machine(target)?;
            (m.spec.arch, m.s_state.is_active())
        };
        if !target_active {
            return Err(SubstrateError::MachineNotActive(target));
        }
        let due = self.now + self.cfg.migration_us;
        let entry = self.vms.get_mut(&vm).ok_or(SubstrateError::VmNotFound(vm))?;
        if entry.machine.is_none() {
            return Err(SubstrateError::VmUnattached(vm));
        }
        if entry.migrating_to.is_some() {
            return Err(SubstrateError::MigrationInFlight(vm));
        }
        if entry.arch != target_arch {
            return Err(SubstrateError::IncompatibleVm {
                kind: entry.kind,
                arch: target_arch,
            });
        }
        entry.migrating_to = Some(target);
        self.scheduled.push((due, Callback::Migration(vm)));
        Ok(())
    }

    fn vm_info(&self, vm: VmId) -> Result<VmInfo> {
        let entry = self.vms.get(&vm).ok_or(SubstrateError::VmNotFound(vm))?;
        Ok(VmInfo {
            id: vm,
            kind: entry.kind,
            arch: entry.arch,
            machine: entry.machine,
            tasks: entry.tasks.clone(),
        })
    }

    fn vm_is_pending_migration(&self, vm: VmId) -> bool {
        self.vms
            .get(&vm)
            .is_some_and(|entry| entry.migrating_to.is_some())
    }

    fn vm_add_task(&mut self, vm: VmId, task: TaskId, priority: Priority) -> Result<()> {
        if task.0 as usize >= self.tasks.len() {
            return Err(SubstrateError::TaskNotFound(task));
        }
        let entry = self.vms.get_mut(&vm).ok_or(SubstrateError::VmNotFound(vm))?;
        if entry.machine.is_none() {
            return Err(SubstrateError::VmUnattached(vm));
        }
        entry.tasks.push(task);
        let t = &mut self.tasks[task.0 as usize];
        t.vm = Some(vm);
        t.priority = priority;
        Ok(())
    }

    fn vm_remove_task(&mut self, vm: VmId, task: TaskId) -> Result<()> {
        let entry = self.vms.get_mut(&vm).ok_or(SubstrateError::VmNotFound(vm))?;
        entry.tasks.retain(|t| *t != task);
        if let Some(t) = self.tasks.get_mut(task.0 as usize) {
            t.vm = None;
        }
        Ok(())
    }

    fn task_info(&self, task: TaskId) -> Result<TaskInfo> {
        let t = self.task(task)?;
        Ok(TaskInfo {
            id: task,
            required_arch: t.spec.arch,
            required_vm: t.spec.vm_kind,
            memory_mb: t.spec.memory_mb,
            gpu_capable: t.spec.gpu_capable,
            sla: t.spec.sla,
            total_instructions: t.spec.instructions,
            remaining_instructions: t.remaining.ceil() as u64,
            target_completion: t.spec.deadline,
        })
    }

    fn set_task_priority(&mut self, task: TaskId, priority: Priority) -> Result<()> {
        let t = self
            .tasks
            .get_mut(task.0 as usize)
            .ok_or(SubstrateError::TaskNotFound(task))?;
        t.priority = priority;
        Ok(())
    }

    fn task_priority(&self, task: TaskId) -> Result<Priority> {
        Ok(self.task(task)?.priority)
    }

    fn sla_report(&self, sla: SlaClass) -> f64 {
        let idx = sla.index();
        if self.sla_done[idx] == 0 {
            100.0
        } else {
            f64::from(self.sla_met[idx]) / f64::from(self.sla_done[idx]) * 100.0
        }
    }
}
