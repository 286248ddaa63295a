#![forbid(unsafe_code)]

//! Availability checks for the external programs grabtube drives.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Result, bail};
use log::debug;
use serde::Serialize;
use tokio::process::Command;

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub ytdlp: bool,
    pub ffmpeg: bool,
}

pub async fn check_dependencies(ytdlp: &Path, ffmpeg: &Path) -> DependencyReport {
    let (ytdlp, ffmpeg) = tokio::join!(
        ensure_program_available(ytdlp, "--version"),
        ensure_program_available(ffmpeg, "-version"),
    );
    DependencyReport {
        ytdlp: ytdlp.is_ok(),
        ffmpeg: ffmpeg.is_ok(),
    }
}

/// Runs `<program> <version_flag>` and fails when the program is missing,
/// hangs, or returns a failure status.
pub async fn ensure_program_available(program: &Path, version_flag: &str) -> Result<()> {
    let mut command = Command::new(program);
    command
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let status = tokio::time::timeout(VERSION_CHECK_TIMEOUT, command.status()).await;
    debug!("version check for {}: {:?}", program.display(), status);
    match status {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => bail!(
            "{} is installed but returned a failure status ({status})",
            program.display()
        ),
        Ok(Err(err)) => bail!("{} is not installed or not in PATH: {err}", program.display()),
        Err(_) => bail!("{} did not answer {version_flag} in time", program.display()),
    }
}
