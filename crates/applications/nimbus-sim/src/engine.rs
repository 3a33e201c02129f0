//! Discrete-event engine
//!
//! Drives the scheduler callbacks in simulated-time order: task arrivals,
//! periodic ticks, completion checks, and the substrate's deferred
//! state-change/migration confirmations and warnings. Completion events are
//! estimates taken at scheduling time; if rates changed in between, a stale
//! event is ignored and a fresh estimate is queued.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use nimbus_core::{SimTime, SlaClass, Substrate, TaskId};
use nimbus_scheduler::classify::classify;
use nimbus_scheduler::{Scheduler, TaskClass};

use crate::cluster::{Callback, SimCluster, TaskSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Arrival(TaskId),
    CompletionCheck(TaskId),
    Tick,
    Due(Callback),
}

/// Timed event wrapper; the heap pops the earliest time, then the lowest
/// sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TimedEvent {
    time: SimTime,
    seq: u64,
    kind: EventKind,
}

impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap on (time, seq)
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-class completion stats
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassStats {
    pub class: TaskClass,
    pub total: usize,
    pub completed: usize,
}

/// Result of a simulation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub duration_us: SimTime,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    /// Percent of completed tasks that met their deadline, per SLA class.
    pub sla_attainment: [f64; 4],
    pub energy_kwh: f64,
    /// Tasks still waiting in the pending queue at shutdown.
    pub waiting_at_end: usize,
    pub per_class: Vec<ClassStats>,
}

/// The simulation driver
pub struct Engine {
    cluster: SimCluster,
    scheduler: Scheduler,
    tick_us: SimTime,
    events: BinaryHeap<TimedEvent>,
    seq: u64,
    /// Completion estimates already queued, to keep duplicates out of the
    /// heap.
    queued_checks: HashSet<(SimTime, TaskId)>,
}

impl Engine {
    pub fn new(cluster: SimCluster, scheduler: Scheduler, tick_us: SimTime) -> Self {
        Self {
            cluster,
            scheduler,
            tick_us,
            events: BinaryHeap::new(),
            seq: 0,
            queued_checks: HashSet::new(),
        }
    }

    pub fn cluster(&self) -> &SimCluster {
        &self.cluster
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run the workload to the given horizon and shut down.
    pub fn run(&mut self, specs: &[TaskSpec], duration: SimTime) -> RunResult {
        self.scheduler.on_init(&mut self.cluster);
        self.after_handler(0);

        let mut task_ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = self.cluster.spawn_task(spec);
            task_ids.push(id);
            self.push(spec.arrival, EventKind::Arrival(id));
        }
        self.push(self.tick_us, EventKind::Tick);

        while let Some(event) = self.events.pop() {
            if event.time > duration {
                break;
            }
            self.cluster.advance_to(event.time);

            match event.kind {
                EventKind::Arrival(task) => {
                    self.scheduler.on_new_task(&mut self.cluster, event.time, task);
                }
                EventKind::CompletionCheck(task) => {
                    self.queued_checks.remove(&(event.time, task));
                    if self.cluster.try_complete(task, event.time) {
                        self.scheduler
                            .on_task_complete(&mut self.cluster, event.time, task);
                    }
                }
                EventKind::Tick => {
                    self.scheduler.on_periodic(&mut self.cluster, event.time);
                    let next = event.time + self.tick_us;
                    if next <= duration {
                        self.push(next, EventKind::Tick);
                    }
                }
                EventKind::Due(cb) => {
                    self.cluster.apply_callback(cb);
                    match cb {
                        Callback::StateChange(machine) => self
                            .scheduler
                            .on_state_change_complete(&mut self.cluster, event.time, machine),
                        Callback::Migration(vm) => self
                            .scheduler
                            .on_migration_complete(&mut self.cluster, event.time, vm),
                        Callback::MemoryWarning(machine) => self
                            .scheduler
                            .on_memory_warning(&mut self.cluster, event.time, machine),
                        Callback::SlaWarning(task) => self
                            .scheduler
                            .on_sla_warning(&mut self.cluster, event.time, task),
                    }
                }
            }

            self.after_handler(event.time);
        }

        self.cluster.advance_to(duration);
        self.scheduler.on_shutdown(&mut self.cluster, duration);
        debug!("run finished at t={duration}");
        self.collect(duration, &task_ids)
    }

    /// Pick up whatever the last handler scheduled: deferred substrate
    /// confirmations, freshly observed warnings, and a new completion
    /// estimate.
    fn after_handler(&mut self, now: SimTime) {
        for (time, cb) in self.cluster.drain_scheduled() {
            self.push(time, EventKind::Due(cb));
        }
        for cb in self.cluster.collect_warnings() {
            self.push(now, EventKind::Due(cb));
        }
        if let Some((eta, task)) = self.cluster.next_completion() {
            if self.queued_checks.insert((eta, task)) {
                self.push(eta, EventKind::CompletionCheck(task));
            }
        }
    }

    fn push(&mut self, time: SimTime, kind: EventKind) {
        self.events.push(TimedEvent {
            time,
            seq: self.seq,
            kind,
        });
        self.seq += 1;
    }

    fn collect(&self, duration: SimTime, task_ids: &[TaskId]) -> RunResult {
        let mut per_class: Vec<ClassStats> = TaskClass::ALL
            .iter()
            .map(|class| ClassStats {
                class: *class,
                total: 0,
                completed: 0,
            })
            .collect();
        for &task in task_ids {
            if let Ok(info) = self.cluster.task_info(task) {
                let class = classify(&info);
                let stats = per_class
                    .iter_mut()
                    .find(|s| s.class == class)
                    .expect("all classes present");
                stats.total += 1;
                if self.cluster.is_completed(task) {
                    stats.completed += 1;
                }
            }
        }

        RunResult {
            duration_us: duration,
            total_tasks: task_ids.len(),
            completed_tasks: self.cluster.completed_count(),
            sla_attainment: [
                self.cluster.sla_report(SlaClass::Sla0),
                self.cluster.sla_report(SlaClass::Sla1),
                self.cluster.sla_report(SlaClass::Sla2),
                self.cluster.sla_report(SlaClass::Sla3),
            ],
            energy_kwh: self.cluster.cluster_energy_kwh(),
            waiting_at_end: self.scheduler.pending_tasks(),
            per_class,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MachineSpec, SimConfig};
    use crate::workload::{standard_fleet, WorkloadGenerator};
    use nimbus_core::{CpuArch, MachineId, PState, Priority, VmKind};
    use nimbus_scheduler::SchedulerConfig;

    fn spec(arrival: SimTime) -> TaskSpec {
        // 600k instructions over a 2s window: urgency 0.3, no SLA risk.
        TaskSpec {
            arrival,
            arch: CpuArch::X86,
            vm_kind: VmKind::Linux,
            memory_mb: 2048,
            gpu_capable: false,
            sla: SlaClass::Sla1,
            instructions: 600_000,
            deadline: arrival + 2_000_000,
        }
    }

    #[test]
    fn test_happy_placement() {
        let mut cluster = SimCluster::new(SimConfig::default(), standard_fleet());
        let mut sched = Scheduler::new(SchedulerConfig::default());
        sched.on_init(&mut cluster);

        let task = cluster.spawn_task(&spec(100));
        cluster.advance_to(100);
        sched.on_new_task(&mut cluster, 100, task);

        // Lowest-id x86 machine, first VM, strict-class priority, and the
        // light-load SLA1 performance point.
        let vm = sched.inventory().vm_of_task(task).unwrap();
        assert_eq!(sched.inventory().host_of(vm), Some(MachineId(0)));
        assert_eq!(cluster.task_priority(task).unwrap(), Priority::High);
        assert_eq!(
            cluster.machine_info(MachineId(0)).unwrap().p_state,
            PState::P1
        );
    }

    #[test]
    fn test_gpu_task_queues_until_gpu_machine_wakes() {
        // The standard fleet keeps its GPU (POWER) machines beyond the
        // default floor of 12, so they start powered off.
        let cluster = SimCluster::new(SimConfig::default(), standard_fleet());
        let sched = Scheduler::new(SchedulerConfig::default());
        let mut engine = Engine::new(cluster, sched, 50_000);

        let gpu_task = TaskSpec {
            arrival: 1_000,
            arch: CpuArch::Power,
            vm_kind: VmKind::Aix,
            memory_mb: 4096,
            gpu_capable: true,
            sla: SlaClass::Sla2,
            instructions: 100_000_000,
            deadline: 5_000_000,
        };
        let result = engine.run(&[gpu_task], 2_000_000);

        assert_eq!(result.completed_tasks, 1);
        assert_eq!(result.waiting_at_end, 0);
        assert_eq!(result.sla_attainment[SlaClass::Sla2.index()], 100.0);
        // The first POWER machine was woken to run it and burned more energy
        // than its sibling that slept through the run.
        let woken = engine.cluster().machine_energy_kwh(MachineId(12)).unwrap();
        let asleep = engine.cluster().machine_energy_kwh(MachineId(13)).unwrap();
        assert!(woken > asleep);
    }

    #[test]
    fn test_smoke_run_accounts_for_every_task() {
        let cluster = SimCluster::new(SimConfig::default(), standard_fleet());
        let sched = Scheduler::new(SchedulerConfig::default());
        let mut engine = Engine::new(cluster, sched, 50_000);

        let duration = 20_000_000;
        let specs = WorkloadGenerator::new(7).generate(40, duration * 8 / 10);
        let result = engine.run(&specs, duration);

        assert_eq!(result.total_tasks, 40);
        assert!(result.completed_tasks > 0, "nothing completed");
        assert!(result.energy_kwh > 0.0);

        // Every accepted, uncompleted task is bound XOR queued.
        let placed = engine.scheduler().inventory().placed_task_total();
        assert_eq!(
            result.completed_tasks + placed + result.waiting_at_end,
            result.total_tasks
        );

        let class_total: usize = result.per_class.iter().map(|c| c.total).sum();
        assert_eq!(class_total, result.total_tasks);
    }

    #[test]
    fn test_surplus_machine_stays_retired() {
        // Two machines, floor of one: the surplus machine is retired at init
        // and the light workload never justifies waking it.
        let specs = vec![
            MachineSpec::new(CpuArch::X86, 4, 16384, false),
            MachineSpec::new(CpuArch::X86, 4, 16384, false),
        ];
        let cluster = SimCluster::new(SimConfig::default(), specs);
        let cfg = SchedulerConfig::default().with_initial_active_machines(1);
        let sched = Scheduler::new(cfg);
        let mut engine = Engine::new(cluster, sched, 50_000);

        let result = engine.run(&[spec(1_000)], 10_000_000);
        assert_eq!(result.completed_tasks, 1);
        // The surplus machine was retired at init and never woken.
        assert!(engine.cluster().machine_info(MachineId(1)).unwrap().s_state.is_off());
    }
}
