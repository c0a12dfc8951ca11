use std::os::unix::process::CommandExt;
use std::process::Command;

use crate::error::{GolemError, Result};

/// Replace the current process with a fresh copy of itself, same argv.
///
/// Only returns if the exec fails.
pub fn respawn_self() -> Result<()> {
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    tracing::info!(exe = %exe.display(), ?args, "Restarting process");

    let err = Command::new(&exe).args(&args).exec();
    Err(GolemError::Io(err))
}
