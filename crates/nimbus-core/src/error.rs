//! Error types for substrate operations

use thiserror::Error;

use crate::types::{CpuArch, MachineId, SState, TaskId, VmId, VmKind};

/// Result type for substrate operations
pub type Result<T> = std::result::Result<T, SubstrateError>;

/// Errors reported by the machine/VM/task substrate.
///
/// Validity is always explicit: a VM or machine that is mid-transition is
/// reported through a typed error or a pending flag, never probed by catching
/// arbitrary failures.
#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("Machine {0} not found")]
    MachineNotFound(MachineId),

    #[error("VM {0} not found")]
    VmNotFound(VmId),

    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("VM {0} is not attached to any machine")]
    VmUnattached(VmId),

    #[error("VM family {kind} cannot run on {arch}")]
    IncompatibleVm { kind: VmKind, arch: CpuArch },

    #[error("Insufficient memory: need {need_mb}MB, have {have_mb}MB")]
    InsufficientMemory { need_mb: u64, have_mb: u64 },

    #[error("VM {0} has a migration in flight")]
    MigrationInFlight(VmId),

    #[error("Machine {0} has a power transition in flight")]
    PowerTransitionInFlight(MachineId),

    #[error("Machine {machine} cannot go from {from:?} to {to:?}")]
    InvalidStateRequest {
        machine: MachineId,
        from: SState,
        to: SState,
    },

    #[error("Machine {0} is not active")]
    MachineNotActive(MachineId),
}
