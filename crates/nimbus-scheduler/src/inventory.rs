//! Authoritative bookkeeping of machines, VMs and tasks
//!
//! The inventory is the single owner of every mapping the scheduler relies
//! on: task→VM, VM→machine, machine→VM list, per-machine task counts, and the
//! pending flags for power transitions and live migrations. The other
//! components read it and request mutations through it; none of them mutates
//! shared state directly.
//!
//! Substrate snapshots stay advisory whenever a pending flag is set: a
//! machine that is powering up or down, or that hosts a migrating VM, is
//! frozen out of every scheduling decision until the completion callback
//! clears the flag.

use std::collections::{BTreeMap, BTreeSet};

use nimbus_core::{MachineId, SimTime, TaskId, VmId};

/// In-memory model of the cluster from the scheduler's point of view.
///
/// Clearing a pending flag ([`Inventory::clear_pending_state`],
/// [`Inventory::clear_migration`]) returns whether the flag was actually
/// set. Callers treat `false` as a completion that was never requested:
/// logged at warn level and otherwise tolerated, never a panic.
#[derive(Debug, Default)]
pub struct Inventory {
    machine_count: u32,
    /// Machines believed to be in S0 (confirmed by the substrate).
    active: BTreeSet<MachineId>,
    vms_on: BTreeMap<MachineId, Vec<VmId>>,
    host_of: BTreeMap<VmId, MachineId>,
    task_vm: BTreeMap<TaskId, VmId>,
    task_count: BTreeMap<MachineId, u32>,
    pending_state: BTreeSet<MachineId>,
    /// In-flight migrations, VM to target machine.
    pending_migrations: BTreeMap<VmId, MachineId>,
    /// Confirmation time of each machine's last entry into S0, for the
    /// power-off dwell guard.
    powered_on_at: BTreeMap<MachineId, SimTime>,
}

impl Inventory {
    pub fn new(machine_count: u32) -> Self {
        Self {
            machine_count,
            ..Default::default()
        }
    }

    pub fn machine_count(&self) -> u32 {
        self.machine_count
    }

    /// All machine ids, ascending.
    pub fn machines(&self) -> impl Iterator<Item = MachineId> {
        (0..self.machine_count).map(MachineId)
    }

    // ---- active set ----------------------------------------------------

    pub fn is_active(&self, machine: MachineId) -> bool {
        self.active.contains(&machine)
    }

    pub fn set_active(&mut self, machine: MachineId) {
        self.active.insert(machine);
    }

    pub fn clear_active(&mut self, machine: MachineId) {
        self.active.remove(&machine);
    }

    /// Machines believed active, ascending id order.
    pub fn active_machines(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.active.iter().copied()
    }

    /// Active machines with no power transition in flight. This is the count
    /// the power-off floor is checked against.
    pub fn usable_count(&self) -> usize {
        self.active
            .iter()
            .filter(|m| !self.pending_state.contains(m))
            .count()
    }

    // ---- pending flags -------------------------------------------------

    pub fn mark_pending_state(&mut self, machine: MachineId) {
        self.pending_state.insert(machine);
    }

    /// Returns whether the flag was actually set.
    pub fn clear_pending_state(&mut self, machine: MachineId) -> bool {
        self.pending_state.remove(&machine)
    }

    pub fn has_pending_state(&self, machine: MachineId) -> bool {
        self.pending_state.contains(&machine)
    }

    /// Whether any machine has a power transition in flight.
    pub fn any_pending_state(&self) -> bool {
        !self.pending_state.is_empty()
    }

    pub fn mark_migration(&mut self, vm: VmId, target: MachineId) {
        self.pending_migrations.insert(vm, target);
    }

    /// Returns whether the flag was actually set.
    pub fn clear_migration(&mut self, vm: VmId) -> bool {
        self.pending_migrations.remove(&vm).is_some()
    }

    pub fn is_migrating(&self, vm: VmId) -> bool {
        self.pending_migrations.contains_key(&vm)
    }

    /// Whether a machine is the destination of an in-flight migration. Such
    /// a machine must stay up until the migration lands.
    pub fn is_migration_target(&self, machine: MachineId) -> bool {
        self.pending_migrations.values().any(|m| *m == machine)
    }

    /// Whether any migration is in flight anywhere in the cluster.
    pub fn migration_in_flight(&self) -> bool {
        !self.pending_migrations.is_empty()
    }

    /// A frozen machine is excluded from placement, DVFS and power decisions:
    /// either its own power transition is pending, or one of its VMs is
    /// migrating.
    pub fn is_frozen(&self, machine: MachineId) -> bool {
        if self.pending_state.contains(&machine) {
            return true;
        }
        self.vms_on(machine)
            .iter()
            .any(|vm| self.pending_migrations.contains_key(vm))
    }

    // ---- VM placement --------------------------------------------------

    pub fn attach_vm(&mut self, vm: VmId, machine: MachineId) {
        self.host_of.insert(vm, machine);
        self.vms_on.entry(machine).or_default().push(vm);
    }

    /// Remove every VM from a machine (used when retiring it). Returns the
    /// detached VMs.
    pub fn detach_vms(&mut self, machine: MachineId) -> Vec<VmId> {
        let vms = self.vms_on.remove(&machine).unwrap_or_default();
        for vm in &vms {
            self.host_of.remove(vm);
        }
        vms
    }

    pub fn vms_on(&self, machine: MachineId) -> &[VmId] {
        self.vms_on.get(&machine).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn host_of(&self, vm: VmId) -> Option<MachineId> {
        self.host_of.get(&vm).copied()
    }

    /// All VMs the scheduler knows about, ascending id order.
    pub fn all_vms(&self) -> impl Iterator<Item = VmId> + '_ {
        self.host_of.keys().copied()
    }

    /// Re-home a VM after its migration completed. Shifts the VM's resident
    /// task count from the old host to the new one.
    pub fn complete_migration(&mut self, vm: VmId, new_host: MachineId) {
        let moved_tasks = self.tasks_in_vm(vm).len() as u32;
        if let Some(old) = self.host_of.insert(vm, new_host) {
            if let Some(list) = self.vms_on.get_mut(&old) {
                list.retain(|v| *v != vm);
            }
            let old_count = self.task_count.entry(old).or_insert(0);
            *old_count = old_count.saturating_sub(moved_tasks);
        }
        self.vms_on.entry(new_host).or_default().push(vm);
        *self.task_count.entry(new_host).or_insert(0) += moved_tasks;
    }

    // ---- task placement ------------------------------------------------

    pub fn bind_task(&mut self, task: TaskId, vm: VmId) {
        self.task_vm.insert(task, vm);
        if let Some(machine) = self.host_of(vm) {
            *self.task_count.entry(machine).or_insert(0) += 1;
        }
    }

    /// Forget a task. Returns its former `(vm, machine)` binding, or `None`
    /// if the task was never placed.
    pub fn release_task(&mut self, task: TaskId) -> Option<(VmId, Option<MachineId>)> {
        let vm = self.task_vm.remove(&task)?;
        let machine = self.host_of(vm);
        if let Some(machine) = machine {
            let count = self.task_count.entry(machine).or_insert(0);
            *count = count.saturating_sub(1);
        }
        Some((vm, machine))
    }

    pub fn vm_of_task(&self, task: TaskId) -> Option<VmId> {
        self.task_vm.get(&task).copied()
    }

    pub fn has_task(&self, task: TaskId) -> bool {
        self.task_vm.contains_key(&task)
    }

    pub fn task_count(&self, machine: MachineId) -> u32 {
        self.task_count.get(&machine).copied().unwrap_or(0)
    }

    pub fn placed_task_total(&self) -> usize {
        self.task_vm.len()
    }

    pub fn tasks_in_vm(&self, vm: VmId) -> Vec<TaskId> {
        self.task_vm
            .iter()
            .filter(|(_, v)| **v == vm)
            .map(|(t, _)| *t)
            .collect()
    }

    pub fn tasks_on_machine(&self, machine: MachineId) -> Vec<TaskId> {
        self.task_vm
            .iter()
            .filter(|(_, vm)| self.host_of(**vm) == Some(machine))
            .map(|(t, _)| *t)
            .collect()
    }

    // ---- dwell guard ---------------------------------------------------

    pub fn record_power_on(&mut self, machine: MachineId, now: SimTime) {
        self.powered_on_at.insert(machine, now);
    }

    pub fn powered_on_at(&self, machine: MachineId) -> Option<SimTime> {
        self.powered_on_at.get(&machine).copied()
    }
}
