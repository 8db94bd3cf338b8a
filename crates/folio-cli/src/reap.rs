//! Reap command implementation for Folio CLI.

use std::ffi::OsString;
use std::path::Path;

use folio_core::RendererConfig;

/// Terminate orphaned renderers and print their pids.
pub fn execute(renderer: Option<&Path>, args: &[String]) -> anyhow::Result<()> {
    let program = RendererConfig::resolve_program(renderer)?;
    let args: Vec<OsString> = args.iter().map(OsString::from).collect();

    let reaped = folio_core::reap_orphans(&program, &args)?;
    if reaped.is_empty() {
        tracing::info!("no orphaned renderers found for {}", program.display());
    }
    for pid in reaped {
        println!("{pid}");
    }
    Ok(())
}
