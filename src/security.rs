#![forbid(unsafe_code)]

//! Process and input hygiene shared by the grabtube binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

use crate::error::{GrabError, GrabResult};

const MAX_TITLE_CHARS: usize = 100;
const FALLBACK_TITLE: &str = "download";

/// Fails fast when a binary is started as root. The tools spawned on behalf of
/// remote users must never inherit root privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Reduces a media title to something safe to use as a download filename.
pub fn sanitize_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let truncated: String = kept.trim().chars().take(MAX_TITLE_CHARS).collect();
    if truncated.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        truncated
    }
}

/// Only plain web URLs are handed to the extraction tool.
pub fn validate_url(url: &str) -> GrabResult<&str> {
    let url = url.trim();
    if url.is_empty() {
        return Err(GrabError::validation("url must not be empty"));
    }
    let lower = url.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(GrabError::validation("url must start with http:// or https://"));
    }
    if url.chars().any(char::is_whitespace) {
        return Err(GrabError::validation("url must not contain whitespace"));
    }
    Ok(url)
}

/// Format ids come straight from yt-dlp listings (`137`, `hls-720p`,
/// `dash-video=1000`); anything else is rejected before it reaches `-f`.
pub fn validate_format_id(format_id: &str) -> GrabResult<&str> {
    let format_id = format_id.trim();
    if format_id.is_empty() {
        return Err(GrabError::validation("format id must not be empty"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '=');
    if !format_id.chars().all(allowed) {
        return Err(GrabError::validation(format!(
            "format id {format_id:?} contains unsupported characters"
        )));
    }
    Ok(format_id)
}
