//! `quire filters`: list every filter a project can use.

use quire_engine::FilterInfo;

use crate::pipeline::open_controller;
use crate::GlobalArgs;

/// Runs the `quire filters` command.
pub fn run(global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let controller = open_controller(global)?;
    let mut infos = controller.registry().infos();
    infos.sort_by(|a, b| a.alias.cmp(&b.alias));
    for info in infos {
        println!("{}", describe(info));
    }
    Ok(0)
}

/// One filter as `alias  mode  inputs -> outputs`.
pub fn describe(info: &FilterInfo) -> String {
    format!(
        "{:<12} {:<20} {} -> {}",
        info.alias,
        format!("{:?}", info.mode),
        info.input_extensions.join(","),
        info.output_extensions.join(",")
    )
}
