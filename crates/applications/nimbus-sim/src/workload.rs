//! Synthetic workload generation
//!
//! Seeded, deterministic task mixes: Poisson arrivals over the requested
//! span, log-normal instruction volumes for the long-running families, and
//! per-family architecture/memory/SLA mixes that line up with the workload
//! classifier's thresholds.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, LogNormal};

use nimbus_core::{CpuArch, SimTime, SlaClass, VmKind};

use crate::cluster::{MachineSpec, TaskSpec};

/// Nominal MIPS used to size deadlines (the P1 rating of the standard
/// machines).
const NOMINAL_MIPS: f64 = 2200.0;

/// Deadline slack multiplier per SLA class, strictest first.
const SLA_SLACK: [f64; 4] = [1.3, 1.6, 2.5, 8.0];

/// The 16-machine reference fleet: 8 x86 4-core/16GB, 4 ARM 2-core/8GB,
/// 4 POWER 8-core/32GB with GPUs.
pub fn standard_fleet() -> Vec<MachineSpec> {
    let mut fleet = Vec::with_capacity(16);
    for _ in 0..8 {
        fleet.push(MachineSpec::new(CpuArch::X86, 4, 16_384, false));
    }
    for _ in 0..4 {
        fleet.push(MachineSpec::new(CpuArch::Arm, 2, 8_192, false));
    }
    for _ in 0..4 {
        fleet.push(MachineSpec::new(CpuArch::Power, 8, 32_768, true));
    }
    fleet
}

/// Deterministic synthetic workload source
pub struct WorkloadGenerator {
    rng: StdRng,
}

impl WorkloadGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generate `count` tasks arriving across `span` microseconds.
    pub fn generate(&mut self, count: usize, span: SimTime) -> Vec<TaskSpec> {
        if count == 0 {
            return Vec::new();
        }
        let rate = count as f64 / span.max(1) as f64;
        let gaps = Exp::new(rate).expect("positive arrival rate");
        let mut clock = 0.0f64;

        (0..count)
            .map(|_| {
                clock += gaps.sample(&mut self.rng);
                let arrival = (clock as SimTime).min(span);
                self.task_at(arrival)
            })
            .collect()
    }

    fn task_at(&mut self, arrival: SimTime) -> TaskSpec {
        let roll: f64 = self.rng.gen();
        if roll < 0.10 {
            self.ai_training(arrival)
        } else if roll < 0.20 {
            self.crypto(arrival)
        } else if roll < 0.40 {
            self.scientific(arrival)
        } else if roll < 0.70 {
            self.streaming(arrival)
        } else {
            self.web_request(arrival)
        }
    }

    fn ai_training(&mut self, arrival: SimTime) -> TaskSpec {
        let instructions = self.log_normal(1e10, 0.6, 2e9, 5e10);
        let memory_mb = self.random_memory(8_192, 16_384);
        let sla = if self.rng.gen::<f64>() < 0.3 {
            SlaClass::Sla2
        } else {
            SlaClass::Sla3
        };
        self.build(arrival, CpuArch::Power, VmKind::Linux, memory_mb, true, sla, instructions)
    }

    fn crypto(&mut self, arrival: SimTime) -> TaskSpec {
        let instructions = self.rng.gen_range(1_000_000_000..20_000_000_000u64);
        let memory_mb = self.random_memory(128, 1_024);
        self.build(
            arrival,
            CpuArch::Power,
            VmKind::Linux,
            memory_mb,
            true,
            SlaClass::Sla3,
            instructions,
        )
    }

    fn scientific(&mut self, arrival: SimTime) -> TaskSpec {
        let instructions = self.log_normal(2e10, 0.5, 1e10, 8e10);
        let memory_mb = self.random_memory(4_096, 8_192);
        let (arch, vm_kind) = if self.rng.gen::<f64>() < 0.5 {
            (CpuArch::X86, VmKind::Linux)
        } else {
            (CpuArch::Power, VmKind::Aix)
        };
        let sla = if self.rng.gen::<f64>() < 0.5 {
            SlaClass::Sla2
        } else {
            SlaClass::Sla3
        };
        self.build(arrival, arch, vm_kind, memory_mb, false, sla, instructions)
    }

    fn streaming(&mut self, arrival: SimTime) -> TaskSpec {
        let instructions = self.log_normal(2e9, 0.8, 2e8, 9e9);
        let memory_mb = self.random_memory(512, 2_048);
        let (arch, vm_kind) = match self.rng.gen_range(0..3) {
            0 => (CpuArch::X86, VmKind::Linux),
            1 => (CpuArch::X86, VmKind::Win),
            _ => (CpuArch::Arm, VmKind::LinuxRt),
        };
        let sla = if self.rng.gen::<f64>() < 0.5 {
            SlaClass::Sla1
        } else {
            SlaClass::Sla2
        };
        self.build(arrival, arch, vm_kind, memory_mb, false, sla, instructions)
    }

    fn web_request(&mut self, arrival: SimTime) -> TaskSpec {
        let instructions = self.rng.gen_range(10_000_000..80_000_000u64);
        let memory_mb = self.random_memory(64, 256);
        let arch = if self.rng.gen::<f64>() < 0.6 {
            CpuArch::X86
        } else {
            CpuArch::Arm
        };
        let roll: f64 = self.rng.gen();
        let sla = if roll < 0.4 {
            SlaClass::Sla0
        } else if roll < 0.8 {
            SlaClass::Sla1
        } else {
            SlaClass::Sla2
        };
        self.build(arrival, arch, VmKind::Linux, memory_mb, false, sla, instructions)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &mut self,
        arrival: SimTime,
        arch: CpuArch,
        vm_kind: VmKind,
        memory_mb: u64,
        gpu_capable: bool,
        sla: SlaClass,
        instructions: u64,
    ) -> TaskSpec {
        let nominal_us = instructions as f64 / NOMINAL_MIPS;
        let deadline = arrival + (nominal_us * SLA_SLACK[sla.index()]) as SimTime;
        TaskSpec {
            arrival,
            arch,
            vm_kind,
            memory_mb,
            gpu_capable,
            sla,
            instructions,
            deadline,
        }
    }

    fn random_memory(&mut self, low: u64, high: u64) -> u64 {
        self.rng.gen_range(low..=high)
    }

    fn log_normal(&mut self, median: f64, sigma: f64, min: f64, max: f64) -> u64 {
        let dist = LogNormal::new(median.ln(), sigma).expect("valid log-normal");
        dist.sample(&mut self.rng).clamp(min, max) as u64
    }
}
