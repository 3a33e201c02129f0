//! Core types shared across Nimbus components

use serde::{Deserialize, Serialize};

/// Simulated time in microseconds since the start of the run.
pub type SimTime = u64;

/// Unique identifier for a physical machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MachineId(pub u32);

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Unique identifier for a virtual machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VmId(pub u32);

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vm{}", self.0)
    }
}

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u32);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// CPU architecture of a machine or task requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CpuArch {
    X86,
    Arm,
    Power,
    RiscV,
}

impl std::fmt::Display for CpuArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CpuArch::X86 => write!(f, "x86"),
            CpuArch::Arm => write!(f, "arm"),
            CpuArch::Power => write!(f, "power"),
            CpuArch::RiscV => write!(f, "riscv"),
        }
    }
}

/// Guest-OS family of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmKind {
    Linux,
    LinuxRt,
    Win,
    Aix,
}

impl VmKind {
    /// Whether this guest family can run on the given architecture.
    pub fn supports(self, arch: CpuArch) -> bool {
        match self {
            VmKind::Linux | VmKind::LinuxRt => true,
            VmKind::Win => matches!(arch, CpuArch::X86 | CpuArch::Arm),
            VmKind::Aix => matches!(arch, CpuArch::Power),
        }
    }

    /// The guest family to fall back to when the requested one cannot run on
    /// `arch`. Linux is legal on every architecture.
    pub fn coerce_for(self, arch: CpuArch) -> VmKind {
        if self.supports(arch) {
            self
        } else {
            VmKind::Linux
        }
    }
}

impl std::fmt::Display for VmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmKind::Linux => write!(f, "linux"),
            VmKind::LinuxRt => write!(f, "linux-rt"),
            VmKind::Win => write!(f, "win"),
            VmKind::Aix => write!(f, "aix"),
        }
    }
}

/// ACPI-style machine sleep state. S0 is fully active, S5 is soft-off;
/// everything in between is a sleep depth the scheduler never requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SState {
    S0,
    S1,
    S2,
    S3,
    S4,
    S5,
}

impl SState {
    pub fn is_active(self) -> bool {
        self == SState::S0
    }

    pub fn is_off(self) -> bool {
        self == SState::S5
    }
}

/// Per-core performance state. P0 is maximum frequency/power, P3 minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PState {
    P0,
    P1,
    P2,
    P3,
}

impl PState {
    /// Index into `performance[4]`-style tables.
    pub fn index(self) -> usize {
        match self {
            PState::P0 => 0,
            PState::P1 => 1,
            PState::P2 => 2,
            PState::P3 => 3,
        }
    }
}

/// Task scheduling priority inside a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Mid,
    High,
}

/// Service-level class, strictest first. Sla0 expects ~95% of tasks inside a
/// tight deadline multiplier; Sla3 is best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SlaClass {
    Sla0,
    Sla1,
    Sla2,
    Sla3,
}

impl SlaClass {
    pub const ALL: [SlaClass; 4] = [SlaClass::Sla0, SlaClass::Sla1, SlaClass::Sla2, SlaClass::Sla3];

    /// Index into per-class tables (factors, counters).
    pub fn index(self) -> usize {
        match self {
            SlaClass::Sla0 => 0,
            SlaClass::Sla1 => 1,
            SlaClass::Sla2 => 2,
            SlaClass::Sla3 => 3,
        }
    }
}

impl std::fmt::Display for SlaClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SLA{}", self.index())
    }
}

/// Snapshot of a machine as reported by the substrate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub id: MachineId,
    pub arch: CpuArch,
    pub num_cpus: u32,
    pub memory_mb: u64,
    pub memory_used_mb: u64,
    pub has_gpus: bool,
    pub s_state: SState,
    pub p_state: PState,
    /// MIPS rating per performance state, indexed by [`PState::index`].
    pub mips: [u64; 4],
    pub active_tasks: u32,
    pub active_vms: u32,
}

impl MachineInfo {
    /// Task load normalized by core count.
    pub fn load(&self) -> f64 {
        if self.num_cpus == 0 {
            0.0
        } else {
            f64::from(self.active_tasks) / f64::from(self.num_cpus)
        }
    }

    /// Free memory in MB.
    pub fn memory_free_mb(&self) -> u64 {
        self.memory_mb.saturating_sub(self.memory_used_mb)
    }
}

/// Snapshot of a VM as reported by the substrate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: VmId,
    pub kind: VmKind,
    pub arch: CpuArch,
    /// Host machine, or `None` while unattached.
    pub machine: Option<MachineId>,
    pub tasks: Vec<TaskId>,
}

/// Snapshot of a task as reported by the substrate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub required_arch: CpuArch,
    pub required_vm: VmKind,
    pub memory_mb: u64,
    pub gpu_capable: bool,
    pub sla: SlaClass,
    pub total_instructions: u64,
    pub remaining_instructions: u64,
    /// Deadline in simulated time.
    pub target_completion: SimTime,
}
