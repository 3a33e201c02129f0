//! Final run report
//!
//! Written to stdout when the host signals the end of the simulation. The
//! line format is fixed; downstream tooling greps for it.

use std::io::{self, Write};

use nimbus_core::{SimTime, SlaClass, Substrate};

/// Render the end-of-run report into any writer.
pub fn render<W: Write>(w: &mut W, sub: &dyn Substrate, now: SimTime) -> io::Result<()> {
    writeln!(w, "SLA violation report")?;
    for sla in [SlaClass::Sla0, SlaClass::Sla1, SlaClass::Sla2] {
        writeln!(w, "{sla}: {}%", sub.sla_report(sla))?;
    }
    writeln!(w, "Total Energy {} KW-Hour", sub.cluster_energy_kwh())?;
    writeln!(w, "Simulation run finished in {} seconds", now as f64 / 1e6)?;
    Ok(())
}

/// Render the report to stdout.
pub fn print_report(sub: &dyn Substrate, now: SimTime) {
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    // stdout write failures at the very end of a run are not actionable
    let _ = render(&mut lock, sub, now);
}
