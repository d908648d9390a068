//! The `clean` stage: unconditional rollback of project state.

use crate::error::StageError;
use crate::workspace::{self, BuildWorkspace};
use std::path::Path;
use tracing::info;

/// Restore mutated projects from their backups and drop every sidecar.
/// The cache root itself is never touched here.
pub fn run(cwd: &Path) -> Result<(), StageError> {
    let (restored, mut sidecars) = workspace::sweep_stale_state(cwd)?;
    // Opening the workspace restores nested sub-projects along the way;
    // without a pods checkout there is simply nothing more to roll back.
    if let Ok(ws) = BuildWorkspace::open(cwd) {
        for project in &ws.projects {
            sidecars += workspace::remove_sidecars(project.xcodeproj_dir())?;
        }
    }
    info!("clean: {restored} projects restored, {sidecars} sidecars removed");
    Ok(())
}
