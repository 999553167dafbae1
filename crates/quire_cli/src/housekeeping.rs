//! `quire gc` and `quire reset`: working directory maintenance.

use crate::pipeline::open_controller;
use crate::GlobalArgs;

/// Runs the `quire gc` command.
pub fn gc(global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let controller = open_controller(global)?;
    let removed = controller.gc()?;
    if !global.quiet {
        eprintln!("   Removed {removed} unused artifact(s)");
    }
    Ok(0)
}

/// Runs the `quire reset` command.
pub fn reset(global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let controller = open_controller(global)?;
    let workdir = controller.workdir();
    controller.reset()?;
    if !global.quiet {
        eprintln!("   Removed {}", workdir.display());
    }
    Ok(0)
}
