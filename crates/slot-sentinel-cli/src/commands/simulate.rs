//! `slot-sentinel simulate`: run a scenario file and report what happened.

use std::path::Path;

use anyhow::Result;

use crate::config::FileConfig;
use crate::output::EventPrinter;
use crate::scenario::{self, Scenario};

pub async fn run(path: &Path, config: &FileConfig, printer: EventPrinter, quiet: bool) -> Result<()> {
    let scenario = Scenario::load(path)?;
    tracing::info!(
        path = %path.display(),
        steps = scenario.steps.len(),
        run_ms = scenario.duration().as_millis() as u64,
        "running scenario"
    );

    let events = slot_sentinel::EventBus::new(256);
    super::start_relay(config, &events)?;

    let summary = scenario::run(scenario, |event| {
        events.emit(event.clone());
        if !quiet {
            printer.print(event);
        }
    })
    .await?;

    if printer.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        eprintln!();
        eprintln!("  Final state:    {}", summary.snapshot.state);
        eprintln!("  Armed:          {}", summary.snapshot.armed);
        eprintln!("  Capacity lock:  {}", summary.snapshot.capacity_locked);
        eprintln!("  Backoff level:  {}", summary.snapshot.backoff_level);
        eprintln!("  Polls issued:   {}", summary.polls);
        eprintln!("  Unit clicks:    {}", summary.unit_calls);
        eprintln!("  Sub-unit looks: {}", summary.sub_unit_calls);
        eprintln!("  Refreshes:      {}", summary.refreshes);
        eprintln!("  Reloads:        {}", summary.reloads);
        for unit in &summary.activated {
            eprintln!("  Activated:      {} ({})", unit.label, unit.id);
        }
        eprintln!("  Events:         {}", summary.events);
        eprintln!();
    }
    Ok(())
}
