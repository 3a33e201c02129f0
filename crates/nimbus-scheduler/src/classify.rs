//! Workload classification from observable task facts
//!
//! The class is derived from what the substrate reports about a task -
//! instruction volume, memory footprint, GPU capability - through explicit
//! thresholds. It tags placement logs and the per-class completion stats in
//! the simulation results; it never feeds back into placement decisions.

use nimbus_core::TaskInfo;
use serde::{Deserialize, Serialize};

/// GPU task at or above this footprint is model training, below it is
/// throughput compute (mining, hashing).
const GPU_TRAINING_MEMORY_MB: u64 = 8192;

/// Instruction volume that separates long-running batch compute from
/// interactive work.
const BATCH_INSTRUCTIONS: u64 = 10_000_000_000;

/// Memory footprint that separates wide scientific jobs from streaming ones.
const SCIENTIFIC_MEMORY_MB: u64 = 4096;

/// Instruction volume below which a task is a short request.
const REQUEST_INSTRUCTIONS: u64 = 100_000_000;

/// Broad workload families, for logging and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskClass {
    AiTraining,
    Crypto,
    Scientific,
    Streaming,
    WebRequest,
}

impl TaskClass {
    pub const ALL: [TaskClass; 5] = [
        TaskClass::AiTraining,
        TaskClass::Crypto,
        TaskClass::Scientific,
        TaskClass::Streaming,
        TaskClass::WebRequest,
    ];
}

impl std::fmt::Display for TaskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskClass::AiTraining => write!(f, "ai-training"),
            TaskClass::Crypto => write!(f, "crypto"),
            TaskClass::Scientific => write!(f, "scientific"),
            TaskClass::Streaming => write!(f, "streaming"),
            TaskClass::WebRequest => write!(f, "web-request"),
        }
    }
}

/// Classify a task from its substrate snapshot.
pub fn classify(info: &TaskInfo) -> TaskClass {
    if info.gpu_capable {
        if info.memory_mb >= GPU_TRAINING_MEMORY_MB {
            return TaskClass::AiTraining;
        }
        return TaskClass::Crypto;
    }
    if info.total_instructions >= BATCH_INSTRUCTIONS && info.memory_mb >= SCIENTIFIC_MEMORY_MB {
        return TaskClass::Scientific;
    }
    if info.total_instructions < REQUEST_INSTRUCTIONS {
        return TaskClass::WebRequest;
    }
    TaskClass::Streaming
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::{CpuArch, SlaClass, TaskId, VmKind};

    fn task(instructions: u64, memory_mb: u64, gpu: bool) -> TaskInfo {
        TaskInfo {
            id: TaskId(0),
            required_arch: CpuArch::X86,
            required_vm: VmKind::Linux,
            memory_mb,
            gpu_capable: gpu,
            sla: SlaClass::Sla2,
            total_instructions: instructions,
            remaining_instructions: instructions,
            target_completion: 1_000_000,
        }
    }

    #[test]
    fn test_gpu_with_large_memory_is_training() {
        assert_eq!(classify(&task(5_000_000_000, 16384, true)), TaskClass::AiTraining);
    }

    #[test]
    fn test_gpu_with_small_memory_is_crypto() {
        assert_eq!(classify(&task(50_000_000_000, 512, true)), TaskClass::Crypto);
    }

    #[test]
    fn test_long_wide_batch_is_scientific() {
        assert_eq!(classify(&task(20_000_000_000, 8192, false)), TaskClass::Scientific);
    }

    #[test]
    fn test_short_task_is_web_request() {
        assert_eq!(classify(&task(5_000_000, 128, false)), TaskClass::WebRequest);
    }

    #[test]
    fn test_medium_task_is_streaming() {
        assert_eq!(classify(&task(2_000_000_000, 1024, false)), TaskClass::Streaming);
        // Long but narrow also streams
        assert_eq!(classify(&task(20_000_000_000, 256, false)), TaskClass::Streaming);
    }
}
