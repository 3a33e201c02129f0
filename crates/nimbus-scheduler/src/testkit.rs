//! Test-only in-memory substrate
//!
//! A deliberately small stand-in for the real cluster: synchronous state,
//! recorded side effects, and manual completion of the asynchronous
//! operations so tests control exactly when `StateChangeComplete` and
//! `MigrationComplete` semantics apply.

use std::collections::{BTreeMap, BTreeSet};

use nimbus_core::{
    CpuArch, MachineId, MachineInfo, PState, Priority, Result, SState, SlaClass, Substrate,
    SubstrateError, TaskId, TaskInfo, VmId, VmInfo, VmKind,
};

const VM_OVERHEAD_MB: u64 = 8;
const DEFAULT_MIPS: [u64; 4] = [3000, 2200, 1500, 800];

/// Build a task snapshot with unhurried defaults; tests override what they
/// probe.
pub fn mock_task(id: u32, arch: CpuArch, kind: VmKind, sla: SlaClass) -> TaskInfo {
    TaskInfo {
        id: TaskId(id),
        required_arch: arch,
        required_vm: kind,
        memory_mb: 512,
        gpu_capable: false,
        sla,
        total_instructions: 1_000_000,
        remaining_instructions: 1_000_000,
        target_completion: 1_000_000_000,
    }
}

#[derive(Debug)]
pub struct MockSubstrate {
    machines: Vec<MachineInfo>,
    vms: BTreeMap<VmId, VmInfo>,
    tasks: BTreeMap<TaskId, TaskInfo>,
    priorities: BTreeMap<TaskId, Priority>,
    poisoned: BTreeSet<TaskId>,
    next_vm: u32,
    /// Recorded state-change requests, oldest first. Not applied until
    /// [`MockSubstrate::complete_state`].
    pub state_requests: Vec<(MachineId, SState)>,
    /// Recorded per-core performance sets.
    pub perf_sets: Vec<(MachineId, u32, PState)>,
    /// In-flight migrations. Not applied until
    /// [`MockSubstrate::complete_migration`].
    pub migrations: Vec<(VmId, MachineId)>,
    pub energy_kwh: f64,
    pub sla_percent: [f64; 4],
}

impl MockSubstrate {
    pub fn new() -> Self {
        Self {
            machines: Vec::new(),
            vms: BTreeMap::new(),
            tasks: BTreeMap::new(),
            priorities: BTreeMap::new(),
            poisoned: BTreeSet::new(),
            next_vm: 0,
            state_requests: Vec::new(),
            perf_sets: Vec::new(),
            migrations: Vec::new(),
            energy_kwh: 0.0,
            sla_percent: [100.0; 4],
        }
    }

    pub fn add_machine(
        &mut self,
        arch: CpuArch,
        num_cpus: u32,
        memory_mb: u64,
        has_gpus: bool,
        s_state: SState,
    ) -> MachineId {
        let id = MachineId(self.machines.len() as u32);
        self.machines.push(MachineInfo {
            id,
            arch,
            num_cpus,
            memory_mb,
            memory_used_mb: 0,
            has_gpus,
            s_state,
            p_state: PState::P3,
            mips: DEFAULT_MIPS,
            active_tasks: 0,
            active_vms: 0,
        });
        id
    }

    pub fn add_task(&mut self, info: TaskInfo) {
        self.tasks.insert(info.id, info);
    }

    pub fn set_pstate(&mut self, machine: MachineId, pstate: PState) {
        self.machines[machine.0 as usize].p_state = pstate;
    }

    /// Make `task_info` fail for a task, simulating a transient substrate
    /// error.
    pub fn poison_task(&mut self, task: TaskId) {
        self.poisoned.insert(task);
    }

    /// Apply the oldest pending state request for a machine and return the
    /// state it settled in.
    pub fn complete_state(&mut self, machine: MachineId) -> SState {
        let pos = self
            .state_requests
            .iter()
            .position(|(m, _)| *m == machine)
            .expect("no pending state request");
        let (_, state) = self.state_requests.remove(pos);
        self.machines[machine.0 as usize].s_state = state;
        state
    }

    /// Apply an in-flight migration and return the new host.
    pub fn complete_migration(&mut self, vm: VmId) -> MachineId {
        let pos = self
            .migrations
            .iter()
            .position(|(v, _)| *v == vm)
            .expect("no in-flight migration");
        let (_, target) = self.migrations.remove(pos);

        let footprint = self.vm_footprint_mb(vm);
        let task_count = self.vms[&vm].tasks.len() as u32;
        if let Some(old) = self.vms[&vm].machine {
            let m = &mut self.machines[old.0 as usize];
            m.memory_used_mb = m.memory_used_mb.saturating_sub(footprint);
            m.active_tasks = m.active_tasks.saturating_sub(task_count);
            m.active_vms = m.active_vms.saturating_sub(1);
        }
        let m = &mut self.machines[target.0 as usize];
        m.memory_used_mb += footprint;
        m.active_tasks += task_count;
        m.active_vms += 1;
        self.vms.get_mut(&vm).unwrap().machine = Some(target);
        target
    }

    fn vm_footprint_mb(&self, vm: VmId) -> u64 {
        VM_OVERHEAD_MB
            + self.vms[&vm]
                .tasks
                .iter()
                .filter_map(|t| self.tasks.get(t))
                .map(|t| t.memory_mb)
                .sum::<u64>()
    }

    fn machine_mut(&mut self, id: MachineId) -> Result<&mut MachineInfo> {
        let idx = id.0 as usize;
        if idx >= self.machines.len() {
            return Err(SubstrateError::MachineNotFound(id));
        }
        Ok(&mut self.machines[idx])
    }
}

impl Substrate for MockSubstrate {
    fn machine_total(&self) -> u32 {
        self.machines.len() as u32
    }

    fn machine_info(&self, id: MachineId) -> Result<MachineInfo> {
        self.machines
            .get(id.0 as usize)
            .cloned()
            .ok_or(SubstrateError::MachineNotFound(id))
    }

    fn machine_set_state(&mut self, id: MachineId, state: SState) -> Result<()> {
        self.machine_mut(id)?;
        self.state_requests.push((id, state));
        Ok(())
    }

    fn machine_set_core_performance(
        &mut self,
        id: MachineId,
        core: u32,
        pstate: PState,
    ) -> Result<()> {
        let machine = self.machine_mut(id)?;
        machine.p_state = pstate;
        self.perf_sets.push((id, core, pstate));
        Ok(())
    }

    fn machine_energy_kwh(&self, id: MachineId) -> Result<f64> {
        self.machines
            .get(id.0 as usize)
            .map(|_| 0.0)
            .ok_or(SubstrateError::MachineNotFound(id))
    }

    fn cluster_energy_kwh(&self) -> f64 {
        self.energy_kwh
    }

    fn vm_create(&mut self, kind: VmKind, arch: CpuArch) -> Result<VmId> {
        if !kind.supports(arch) {
            return Err(SubstrateError::IncompatibleVm { kind, arch });
        }
        let id = VmId(self.next_vm);
        self.next_vm += 1;
        self.vms.insert(
            id,
            VmInfo {
                id,
                kind,
                arch,
                machine: None,
                tasks: Vec::new(),
            },
        );
        Ok(id)
    }

    fn vm_attach(&mut self, vm: VmId, machine: MachineId) -> Result<()> {
        if !self.vms.contains_key(&vm) {
            return Err(SubstrateError::VmNotFound(vm));
        }
        let m = self.machine_mut(machine)?;
        m.active_vms += 1;
        m.memory_used_mb += VM_OVERHEAD_MB;
        self.vms.get_mut(&vm).unwrap().machine = Some(machine);
        Ok(())
    }

    fn vm_shutdown(&mut self, vm: VmId) -> Result<()> {
        let footprint = if self.vms.contains_key(&vm) {
            self.vm_footprint_mb(vm)
        } else {
            return Err(SubstrateError::VmNotFound(vm));
        };
        let info = self.vms.remove(&vm).unwrap();
        if let Some(machine) = info.machine {
            let m = &mut self.machines[machine.0 as usize];
            m.active_vms = m.active_vms.saturating_sub(1);
            m.active_tasks = m.active_tasks.saturating_sub(info.tasks.len() as u32);
            m.memory_used_mb = m.memory_used_mb.saturating_sub(footprint);
        }
        Ok(())
    }

    fn vm_migrate(&mut self, vm: VmId, target: MachineId) -> Result<()> {
        let info = self.vms.get(&vm).ok_or(SubstrateError::VmNotFound(vm))?;
        if info.machine.is_none() {
            return Err(SubstrateError::VmUnattached(vm));
        }
        if self.migrations.iter().any(|(v, _)| *v == vm) {
            return Err(SubstrateError::MigrationInFlight(vm));
        }
        self.machine_mut(target)?;
        self.migrations.push((vm, target));
        Ok(())
    }

    fn vm_info(&self, vm: VmId) -> Result<VmInfo> {
        self.vms
            .get(&vm)
            .cloned()
            .ok_or(SubstrateError::VmNotFound(vm))
    }

    fn vm_is_pending_migration(&self, vm: VmId) -> bool {
        self.migrations.iter().any(|(v, _)| *v == vm)
    }

    fn vm_add_task(&mut self, vm: VmId, task: TaskId, priority: Priority) -> Result<()> {
        let memory = self
            .tasks
            .get(&task)
            .ok_or(SubstrateError::TaskNotFound(task))?
            .memory_mb;
        let machine = {
            let info = self.vms.get_mut(&vm).ok_or(SubstrateError::VmNotFound(vm))?;
            info.tasks.push(task);
            info.machine.ok_or(SubstrateError::VmUnattached(vm))?
        };
        let m = &mut self.machines[machine.0 as usize];
        m.active_tasks += 1;
        m.memory_used_mb += memory;
        self.priorities.insert(task, priority);
        Ok(())
    }

    fn vm_remove_task(&mut self, vm: VmId, task: TaskId) -> Result<()> {
        let memory = self
            .tasks
            .get(&task)
            .ok_or(SubstrateError::TaskNotFound(task))?
            .memory_mb;
        let machine = {
            let info = self.vms.get_mut(&vm).ok_or(SubstrateError::VmNotFound(vm))?;
            info.tasks.retain(|t| *t != task);
            info.machine
        };
        if let Some(machine) = machine {
            let m = &mut self.machines[machine.0 as usize];
            m.active_tasks = m.active_tasks.saturating_sub(1);
            m.memory_used_mb = m.memory_used_mb.saturating_sub(memory);
        }
        Ok(())
    }

    fn task_info(&self, task: TaskId) -> Result<TaskInfo> {
        if self.poisoned.contains(&task) {
            return Err(SubstrateError::TaskNotFound(task));
        }
        self.tasks
            .get(&task)
            .cloned()
            .ok_or(SubstrateError::TaskNotFound(task))
    }

    fn set_task_priority(&mut self, task: TaskId, priority: Priority) -> Result<()> {
        if !self.tasks.contains_key(&task) {
            return Err(SubstrateError::TaskNotFound(task));
        }
        self.priorities.insert(task, priority);
        Ok(())
    }

    fn task_priority(&self, task: TaskId) -> Result<Priority> {
        self.priorities
            .get(&task)
            .copied()
            .ok_or(SubstrateError::TaskNotFound(task))
    }

    fn sla_report(&self, sla: SlaClass) -> f64 {
        self.sla_percent[sla.index()]
    }
}
