//! The substrate interface
//!
//! The Substrate trait is the interface the scheduler talks to the cluster
//! through. The scheduler works through this interface ONLY - never concrete
//! types - so the same core runs against the in-memory reference cluster or
//! any other host.
//!
//! The control loop is single-threaded cooperative: every call completes
//! synchronously in control flow. Operations that are slow in *simulated*
//! time ([`Substrate::machine_set_state`], [`Substrate::vm_migrate`]) return
//! immediately and are confirmed by a later callback into the scheduler.

use crate::error::Result;
use crate::types::*;

/// Services the substrate provides to the scheduler.
pub trait Substrate {
    /// Number of machines in the cluster. Machine ids are dense in
    /// `0..machine_total()`.
    fn machine_total(&self) -> u32;

    /// Refreshed snapshot of a machine.
    fn machine_info(&self, id: MachineId) -> Result<MachineInfo>;

    /// Request a sleep-state transition. Asynchronous in simulated time;
    /// completion is signaled through the `StateChangeComplete` callback.
    /// The snapshot returned by [`Substrate::machine_info`] may keep showing
    /// the old state until then.
    fn machine_set_state(&mut self, id: MachineId, state: SState) -> Result<()>;

    /// Set the performance state of one core. Synchronous.
    fn machine_set_core_performance(&mut self, id: MachineId, core: u32, pstate: PState)
        -> Result<()>;

    /// Energy consumed by one machine so far, in kWh.
    fn machine_energy_kwh(&self, id: MachineId) -> Result<f64>;

    /// Energy consumed by the whole cluster so far, in kWh.
    fn cluster_energy_kwh(&self) -> f64;

    /// Create an unattached VM of the given guest family and architecture.
    fn vm_create(&mut self, kind: VmKind, arch: CpuArch) -> Result<VmId>;

    /// Attach an unattached VM to an active machine.
    fn vm_attach(&mut self, vm: VmId, machine: MachineId) -> Result<()>;

    /// Tear down a VM. Any resident tasks are abandoned by the substrate.
    fn vm_shutdown(&mut self, vm: VmId) -> Result<()>;

    /// Start a live migration. Asynchronous in simulated time; completion is
    /// signaled through the `MigrationComplete` callback. At most one
    /// migration may be in flight per VM.
    fn vm_migrate(&mut self, vm: VmId, target: MachineId) -> Result<()>;

    /// Refreshed snapshot of a VM.
    fn vm_info(&self, vm: VmId) -> Result<VmInfo>;

    /// Substrate-side view of whether a migration is in flight. Advisory:
    /// the scheduler's own bookkeeping drives policy and consults this only
    /// as a defensive check right before [`Substrate::vm_migrate`].
    fn vm_is_pending_migration(&self, vm: VmId) -> bool;

    /// Add a task to a VM at the given priority.
    fn vm_add_task(&mut self, vm: VmId, task: TaskId, priority: Priority) -> Result<()>;

    /// Remove a task from a VM.
    fn vm_remove_task(&mut self, vm: VmId, task: TaskId) -> Result<()>;

    /// Refreshed snapshot of a task.
    fn task_info(&self, task: TaskId) -> Result<TaskInfo>;

    /// Reprioritize a task in place.
    fn set_task_priority(&mut self, task: TaskId, priority: Priority) -> Result<()>;

    /// Current priority of a task.
    fn task_priority(&self, task: TaskId) -> Result<Priority>;

    /// Percentage of completed tasks of the given class that met their
    /// deadline.
    fn sla_report(&self, sla: SlaClass) -> f64;

    // Convenience accessors over task_info. Hosts may override with cheaper
    // lookups.

    fn required_arch(&self, task: TaskId) -> Result<CpuArch> {
        Ok(self.task_info(task)?.required_arch)
    }

    fn required_vm(&self, task: TaskId) -> Result<VmKind> {
        Ok(self.task_info(task)?.required_vm)
    }

    fn required_sla(&self, task: TaskId) -> Result<SlaClass> {
        Ok(self.task_info(task)?.sla)
    }

    fn task_gpu_capable(&self, task: TaskId) -> Result<bool> {
        Ok(self.task_info(task)?.gpu_capable)
    }

    fn task_memory_mb(&self, task: TaskId) -> Result<u64> {
        Ok(self.task_info(task)?.memory_mb)
    }

    fn remaining_instructions(&self, task: TaskId) -> Result<u64> {
        Ok(self.task_info(task)?.remaining_instructions)
    }
}
