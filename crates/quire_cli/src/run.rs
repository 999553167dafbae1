//! `quire run`: build every document and write the output directory.

use quire_cache::BuildStatus;
use quire_engine::{BatchReport, DocOutcome, RunOptions};

use crate::pipeline::open_controller;
use crate::{GlobalArgs, RunArgs};

/// Runs the `quire run` command.
///
/// Returns exit code 0 when every document completed, 1 otherwise.
pub fn run(args: &RunArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let controller = open_controller(global)?;
    let options = RunOptions {
        targets: args.targets.clone(),
        workers: args.workers,
        mode: args.mode.map(Into::into),
    };

    if !global.quiet {
        let name = &controller.config().project.name;
        if name.is_empty() {
            eprintln!("   Building project");
        } else {
            eprintln!("   Building {name}");
        }
    }

    let report = controller.run(&options)?;

    for failure in &report.failures {
        eprintln!("error: {failure}");
    }
    if !global.quiet {
        for doc in &report.documents {
            if let DocOutcome::Completed { warning: Some(w) } = &doc.outcome {
                eprintln!("warning: {}: {w}", doc.key);
            }
        }
        eprintln!("{}", summary_line(&report));
    }

    Ok(if report.is_success() { 0 } else { 1 })
}

/// One-line summary printed at the end of a run.
pub fn summary_line(report: &BatchReport) -> String {
    let completed = report.count(DocOutcome::is_completed);
    let failed = report.count(|o| matches!(o, DocOutcome::Failed(_)));
    let skipped = report.count(|o| matches!(o, DocOutcome::Skipped { .. } | DocOutcome::NotRun));
    let mut line = format!(
        "   Finished batch {}: {completed} document(s), {} generated, {} cached",
        report.batch_id,
        report.artifacts_with(BuildStatus::Generated),
        report.artifacts_with(BuildStatus::Cached),
    );
    if failed > 0 {
        line.push_str(&format!(", {failed} failed"));
    }
    if skipped > 0 {
        line.push_str(&format!(", {skipped} skipped"));
    }
    line
}
