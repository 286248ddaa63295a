#![forbid(unsafe_code)]

//! Metadata lookups through `yt-dlp --dump-json`.
//!
//! The query is awaited inline by callers, so it runs under a hard time
//! budget and the child is killed when the budget runs out. Launch failures,
//! non-zero exits, timeouts and unparseable output map to distinct
//! [`GrabError`] variants.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::RuntimeSettings;
use crate::error::{GrabError, GrabResult};
use crate::formats::{FormatDescriptor, FormatLists, classify};
use crate::security::validate_url;

pub const YTDLP_LABEL: &str = "yt-dlp";
const UNKNOWN: &str = "Unknown";

/// Subset of the `--dump-json` payload we read. Everything is optional
/// because extractors for smaller sites leave most fields out.
#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    extractor: Option<String>,
    extractor_key: Option<String>,
    formats: Option<Vec<FormatDescriptor>>,
}

/// What `/api/info` returns: display metadata plus the ranked formats.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    pub title: String,
    pub uploader: String,
    pub duration: u64,
    pub thumbnail: Option<String>,
    pub platform: String,
    #[serde(flatten)]
    pub formats: FormatLists,
}

#[derive(Debug, Clone)]
pub struct MetadataClient {
    ytdlp: PathBuf,
    timeout: Duration,
}

impl MetadataClient {
    pub fn new(ytdlp: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ytdlp: ytdlp.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self::new(settings.ytdlp_bin.clone(), settings.metadata_timeout)
    }

    pub async fn fetch(&self, url: &str) -> GrabResult<MediaInfo> {
        let url = validate_url(url)?;
        let mut command = Command::new(&self.ytdlp);
        command
            .arg("--dump-json")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--")
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!("querying metadata for {url}");
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(GrabError::failure(
                    YTDLP_LABEL,
                    format!("could not launch {}: {err}", self.ytdlp.display()),
                ));
            }
            Err(_) => {
                return Err(GrabError::UpstreamTimeout {
                    tool: YTDLP_LABEL.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            return Err(GrabError::failure(
                YTDLP_LABEL,
                format!("{} ({})", last_error_line(&output.stderr), output.status),
            ));
        }

        let info = parse_media_info(&output.stdout)?;
        info!(
            "metadata for {url}: {:?} ({} audio / {} video formats)",
            info.title,
            info.formats.audio.len(),
            info.formats.video.len()
        );
        Ok(info)
    }
}

/// Parses one `--dump-json` document and classifies its formats.
pub fn parse_media_info(raw: &[u8]) -> GrabResult<MediaInfo> {
    let info: RawInfo =
        serde_json::from_slice(raw).map_err(|err| GrabError::UpstreamMalformed {
            tool: YTDLP_LABEL.to_string(),
            detail: err.to_string(),
        })?;

    let descriptors = info.formats.unwrap_or_default();
    let duration = info
        .duration
        .filter(|value| value.is_finite() && *value > 0.0)
        .map(|value| value.round() as u64)
        .unwrap_or(0);

    Ok(MediaInfo {
        title: info.title.unwrap_or_else(|| UNKNOWN.to_string()),
        uploader: info.uploader.unwrap_or_else(|| UNKNOWN.to_string()),
        duration,
        thumbnail: info.thumbnail,
        platform: info
            .extractor
            .or(info.extractor_key)
            .unwrap_or_else(|| UNKNOWN.to_string()),
        formats: classify(&descriptors),
    })
}

/// yt-dlp prints its reason on the last `ERROR:` line of stderr.
pub(crate) fn last_error_line(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
    let line = lines
        .clone()
        .rev()
        .find(|line| line.starts_with("ERROR"))
        .or_else(|| lines.next_back())
        .unwrap_or("no error output");
    line.chars().take(300).collect()
}
