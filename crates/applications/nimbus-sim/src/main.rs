//! Nimbus Simulation CLI
//!
//! Runs a synthetic workload against the scheduling core on the reference
//! in-memory cluster and prints the SLA/energy report.

use std::fs;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nimbus_core::SimTime;
use nimbus_scheduler::{report, Scheduler, SchedulerConfig};
use nimbus_sim::{standard_fleet, Engine, SimCluster, SimConfig, WorkloadGenerator};

#[derive(Parser, Debug)]
#[command(name = "nimbus-sim")]
#[command(about = "Simulate SLA-aware, energy-minimizing cluster scheduling", long_about = None)]
struct Args {
    /// Simulated duration in seconds
    #[arg(short, long, default_value_t = 30.0)]
    duration: f64,

    /// Number of tasks to generate
    #[arg(short, long, default_value_t = 200)]
    tasks: usize,

    /// Workload RNG seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Periodic check interval in simulated milliseconds
    #[arg(long, default_value_t = 50)]
    tick_ms: u64,

    /// Scheduler configuration JSON file (defaults apply when omitted)
    #[arg(long)]
    config: Option<String>,

    /// Write run results as JSON to this path
    #[arg(short, long)]
    output: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nimbus_sim=info,nimbus_scheduler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let sched_cfg = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {path}"))?;
            serde_json::from_str(&text).with_context(|| format!("failed to parse config {path}"))?
        }
        None => SchedulerConfig::default(),
    };

    let duration_us = (args.duration * 1e6) as SimTime;
    info!(
        "simulating {} tasks over {}s (seed {})",
        args.tasks, args.duration, args.seed
    );

    let specs = WorkloadGenerator::new(args.seed).generate(args.tasks, duration_us * 8 / 10);
    let cluster = SimCluster::new(SimConfig::default(), standard_fleet());
    let scheduler = Scheduler::new(sched_cfg);
    let mut engine = Engine::new(cluster, scheduler, args.tick_ms * 1_000);

    let result = engine.run(&specs, duration_us);

    println!(
        "\n{:<14} {:>8} {:>10}",
        "Class", "Tasks", "Completed"
    );
    println!("{}", "-".repeat(34));
    for stats in &result.per_class {
        println!(
            "{:<14} {:>8} {:>10}",
            stats.class.to_string(),
            stats.total,
            stats.completed
        );
    }
    println!(
        "\nCompleted {}/{} tasks, {} still waiting\n",
        result.completed_tasks, result.total_tasks, result.waiting_at_end
    );

    report::print_report(engine.cluster(), duration_us);

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&result)?;
        fs::write(path, json).with_context(|| format!("failed to write results to {path}"))?;
        info!("results written to {path}");
    }

    Ok(())
}
