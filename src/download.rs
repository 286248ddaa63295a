#![forbid(unsafe_code)]

//! Runs a single yt-dlp transfer for a job and reports progress as it goes.
//!
//! Output lands in the work directory as `<job-id>.<ext>`; yt-dlp picks the
//! extension, so the finished file is found by scanning for that prefix.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use log::{debug, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::{DEFAULT_FFMPEG_BIN, RuntimeSettings};
use crate::error::{GrabError, GrabResult};
use crate::formats::MediaKind;
use crate::metadata::{YTDLP_LABEL, last_error_line};
use crate::progress::{ProgressParser, ProgressUpdate, YtDlpProgressParser};
use crate::security::{validate_format_id, validate_url};

const AUDIO_CODEC: &str = "mp3";
const MERGE_CONTAINER: &str = "mp4";

/// Suffixes yt-dlp uses for files that are still being written.
const SCRATCH_SUFFIXES: &[&str] = &["part", "ytdl", "temp", "tmp"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub format_id: String,
    #[serde(default)]
    pub title: String,
    /// Whether the chosen video format already carries an audio track.
    #[serde(default)]
    pub has_audio: bool,
}

impl DownloadRequest {
    pub fn validate(&self) -> GrabResult<()> {
        validate_url(&self.url)?;
        validate_format_id(&self.format_id)?;
        Ok(())
    }

    /// The `-f` selector handed to yt-dlp.
    pub fn format_selector(&self) -> String {
        let format_id = self.format_id.trim();
        match self.kind {
            MediaKind::Video if !self.has_audio => format!("{format_id}+bestaudio/best"),
            _ => format_id.to_string(),
        }
    }
}

/// A finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutput {
    pub path: PathBuf,
    pub ext: String,
    pub size: u64,
}

#[derive(Clone)]
pub struct Downloader {
    ytdlp: PathBuf,
    ffmpeg: Option<PathBuf>,
    work_dir: PathBuf,
    parser: Arc<dyn ProgressParser>,
}

impl Downloader {
    pub fn new(ytdlp: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            ytdlp: ytdlp.into(),
            ffmpeg: None,
            work_dir: work_dir.into(),
            parser: Arc::new(YtDlpProgressParser),
        }
    }

    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        let mut downloader = Self::new(settings.ytdlp_bin.clone(), settings.download_dir.clone());
        if settings.ffmpeg_bin != Path::new(DEFAULT_FFMPEG_BIN) {
            downloader.ffmpeg = Some(settings.ffmpeg_bin.clone());
        }
        downloader
    }

    pub fn with_parser(mut self, parser: Arc<dyn ProgressParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn build_args(&self, job_id: &str, request: &DownloadRequest) -> Vec<String> {
        let template = self.work_dir.join(format!("{job_id}.%(ext)s"));
        let mut args = vec!["-f".to_string(), request.format_selector()];
        match request.kind {
            MediaKind::Audio => {
                args.extend(
                    [
                        "--extract-audio",
                        "--audio-format",
                        AUDIO_CODEC,
                        "--audio-quality",
                        "0",
                    ]
                    .map(String::from),
                );
            }
            MediaKind::Video if !request.has_audio => {
                args.push("--merge-output-format".to_string());
                args.push(MERGE_CONTAINER.to_string());
            }
            MediaKind::Video => {}
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().into_owned());
        }
        args.push("-o".to_string());
        args.push(template.to_string_lossy().into_owned());
        args.extend(["--no-playlist", "--newline", "--"].map(String::from));
        args.push(request.url.trim().to_string());
        args
    }

    /// Runs the transfer to completion, feeding parsed output lines to
    /// `on_update`. Partial files are removed on every failure path.
    pub async fn run(
        &self,
        job_id: &str,
        request: &DownloadRequest,
        cancel: &CancellationToken,
        on_update: impl FnMut(ProgressUpdate),
    ) -> GrabResult<DownloadOutput> {
        let result = self.run_inner(job_id, request, cancel, on_update).await;
        if result.is_err() {
            remove_job_files(&self.work_dir, job_id).await;
        }
        result
    }

    async fn run_inner(
        &self,
        job_id: &str,
        request: &DownloadRequest,
        cancel: &CancellationToken,
        mut on_update: impl FnMut(ProgressUpdate),
    ) -> GrabResult<DownloadOutput> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let mut command = Command::new(&self.ytdlp);
        command
            .args(self.build_args(job_id, request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            GrabError::failure(
                YTDLP_LABEL,
                format!("could not launch {}: {err}", self.ytdlp.display()),
            )
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GrabError::LocalIo("yt-dlp stdout was not captured".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| GrabError::LocalIo("yt-dlp stderr was not captured".into()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = tokio::select! {
                _ = cancel.cancelled() => None,
                read = reader.read_until(b'\n', &mut line) => Some(read),
            };
            match read {
                None => {
                    let _ = child.kill().await;
                    return Err(GrabError::Cancelled);
                }
                Some(Ok(0)) => break,
                Some(Ok(_)) => {
                    let text = String::from_utf8_lossy(&line);
                    if let Some(update) = self.parser.parse_line(&text) {
                        on_update(update);
                    }
                }
                Some(Err(err)) => {
                    debug!("job {job_id}: stopped reading yt-dlp output: {err}");
                    break;
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = status else {
            let _ = child.kill().await;
            return Err(GrabError::Cancelled);
        };
        let status = status?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(GrabError::failure(
                YTDLP_LABEL,
                format!("{} ({status})", last_error_line(&stderr)),
            ));
        }

        let path = find_output(&self.work_dir, job_id).await?.ok_or_else(|| {
            GrabError::LocalIo("yt-dlp reported success but produced no output file".into())
        })?;
        let size = tokio::fs::metadata(&path).await?.len();
        let ext = path
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(DownloadOutput { path, ext, size })
    }
}

/// Finds `<job_id>.<ext>`, skipping intermediate `<job_id>.f137.mp4` streams
/// and files still being written.
async fn find_output(work_dir: &Path, job_id: &str) -> GrabResult<Option<PathBuf>> {
    let prefix = format!("{job_id}.");
    let mut entries = tokio::fs::read_dir(work_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(ext) = name.strip_prefix(&prefix) else {
            continue;
        };
        if ext.is_empty() || ext.contains('.') || SCRATCH_SUFFIXES.contains(&ext) {
            continue;
        }
        if entry.file_type().await?.is_file() {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Best-effort removal of everything a job wrote into the work directory.
pub async fn remove_job_files(work_dir: &Path, job_id: &str) {
    let prefix = format!("{job_id}.");
    let Ok(mut entries) = tokio::fs::read_dir(work_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        if let Err(err) = tokio::fs::remove_file(entry.path()).await {
            warn!("could not remove {}: {err}", entry.path().display());
        }
    }
}
