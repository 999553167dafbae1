//! `quire history`: print the ledger records of one batch.

use quire_cache::RunRecord;

use crate::pipeline::open_controller;
use crate::GlobalArgs;

/// Runs the `quire history` command.
pub fn run(batch: Option<u64>, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let controller = open_controller(global)?;
    let Some((id, records)) = controller.history(batch) else {
        match batch {
            Some(id) => eprintln!("error: no records for batch {id}"),
            None => eprintln!("no batches recorded yet"),
        }
        return Ok(if batch.is_some() { 1 } else { 0 });
    };

    if !global.quiet {
        let ids = controller.batch_ids();
        eprintln!("   Batch {id} ({} recorded batch(es))", ids.len());
    }
    for record in &records {
        println!("{}", format_record(record));
    }
    Ok(0)
}

/// One ledger record as a table row.
pub fn format_record(record: &RunRecord) -> String {
    format!(
        "{:>4}  {:<9}  {}  {}{}",
        record.batch_order,
        record.status.to_string(),
        record.fingerprint,
        record.artifact_key,
        record.ext
    )
}
