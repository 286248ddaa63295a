#![forbid(unsafe_code)]

//! Terminal front end: inspect a URL, download one format, or check that the
//! external tools are installed. Downloads go through the same job tracker
//! the HTTP backend uses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use grabtube_tools::config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings};
use grabtube_tools::download::DownloadRequest;
use grabtube_tools::formats::{FormatLists, MediaKind};
use grabtube_tools::jobs::{JobSnapshot, JobStatus, JobTracker};
use grabtube_tools::metadata::{MediaInfo, MetadataClient};
use grabtube_tools::security::ensure_not_root;
use grabtube_tools::tools::check_dependencies;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use tokio::signal;

const WORK_SUBDIR: &str = ".grab-partial";
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "grab", author, version, about, long_about = None)]
struct Cli {
    /// Alternate `.env` file to read settings from
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show metadata and the ranked audio/video formats for a URL
    Info { url: String },

    /// Download a single format
    Get {
        url: String,

        /// Format id as listed by `grab info`
        #[arg(short, long)]
        format: String,

        /// Extract audio to mp3 instead of keeping the video
        #[arg(long)]
        audio: bool,

        /// Directory the finished file is moved to
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Check that yt-dlp and ffmpeg can be executed
    Deps,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    ensure_not_root("grab")?;

    let overrides = RuntimeOverrides {
        env_path: cli.env_file.clone(),
        ..RuntimeOverrides::default()
    };

    match cli.command {
        Command::Info { url } => {
            let settings = resolve_runtime_settings(overrides)?;
            let info = MetadataClient::from_settings(&settings).fetch(&url).await?;
            print_info(&info);
        }
        Command::Get {
            url,
            format,
            audio,
            output_dir,
        } => {
            let settings = resolve_runtime_settings(RuntimeOverrides {
                download_dir: Some(output_dir.join(WORK_SUBDIR)),
                ..overrides
            })?;
            let destination = run_download(&settings, &url, &format, audio, &output_dir).await?;
            println!("Saved {}", destination.display());
        }
        Command::Deps => {
            let settings = resolve_runtime_settings(overrides)?;
            let report = check_dependencies(&settings.ytdlp_bin, &settings.ffmpeg_bin).await;
            println!("yt-dlp: {}", availability(report.ytdlp));
            println!("ffmpeg: {}", availability(report.ffmpeg));
            if !(report.ytdlp && report.ffmpeg) {
                bail!("missing external tools");
            }
        }
    }
    Ok(())
}

fn availability(found: bool) -> &'static str {
    if found { "available" } else { "missing" }
}

async fn run_download(
    settings: &RuntimeSettings,
    url: &str,
    format_id: &str,
    audio: bool,
    output_dir: &Path,
) -> Result<PathBuf> {
    let info = MetadataClient::from_settings(settings).fetch(url).await?;
    let request = build_request(url, format_id, audio, &info);
    info!(
        "downloading {:?} as {} format {}",
        info.title,
        request.kind.as_str(),
        request.format_id
    );

    tokio::fs::create_dir_all(&settings.download_dir)
        .await
        .with_context(|| format!("creating {}", settings.download_dir.display()))?;
    let tracker = JobTracker::from_settings(settings);
    let job_id = tracker.submit(request)?;

    let bar = progress_bar();
    let finished = tokio::select! {
        snapshot = follow_job(&tracker, &job_id, &bar) => Some(snapshot),
        _ = signal::ctrl_c() => None,
    };
    let Some(snapshot) = finished else {
        bar.abandon_with_message("interrupted");
        tracker.shutdown(Duration::from_secs(5)).await;
        bail!("download interrupted");
    };

    match snapshot.status {
        JobStatus::Completed => bar.finish_with_message("done"),
        _ => {
            bar.abandon_with_message(snapshot.message.clone());
            bail!("download failed: {}", snapshot.message);
        }
    }

    let source = snapshot
        .file
        .context("completed download has no output file")?;
    let filename = snapshot.filename.unwrap_or_else(|| "download".to_string());
    let destination = unique_destination(output_dir, &filename);
    tokio::fs::rename(&source, &destination)
        .await
        .with_context(|| format!("moving {} to {}", source.display(), destination.display()))?;
    if let Err(err) = tokio::fs::remove_dir(&settings.download_dir).await {
        debug!("leaving {}: {err}", settings.download_dir.display());
    }
    Ok(destination)
}

/// Works out the job request for a format id picked from `grab info`.
/// Unknown ids are passed through as silent video so yt-dlp can still merge
/// best audio into them.
fn build_request(url: &str, format_id: &str, audio: bool, info: &MediaInfo) -> DownloadRequest {
    let (kind, has_audio) = if audio {
        (MediaKind::Audio, true)
    } else {
        info.formats
            .lookup(format_id)
            .unwrap_or((MediaKind::Video, false))
    };
    DownloadRequest {
        url: url.to_string(),
        kind,
        format_id: format_id.to_string(),
        title: info.title.clone(),
        has_audio,
    }
}

async fn follow_job(tracker: &JobTracker, job_id: &str, bar: &ProgressBar) -> JobSnapshot {
    loop {
        let snapshot = tracker.poll(job_id);
        bar.set_position(snapshot.progress.round() as u64);
        bar.set_message(snapshot.message.clone());
        if snapshot.status != JobStatus::Downloading {
            return snapshot;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Appends ` (n)` before the extension until the name is free.
fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (filename, String::new()),
    };
    (1..)
        .map(|n| dir.join(format!("{stem} ({n}){ext}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

fn print_info(info: &MediaInfo) {
    println!("{}", info.title);
    println!(
        "  by {} on {} ({})",
        info.uploader,
        info.platform,
        format_duration(info.duration)
    );
    print_formats(&info.formats);
}

fn print_formats(formats: &FormatLists) {
    println!();
    println!("Audio formats:");
    if formats.audio.is_empty() {
        println!("  (none)");
    }
    for format in &formats.audio {
        println!(
            "  {:<12} {:<6} {:>6.0} kbps  {:>10}  {}",
            format.id,
            format.ext,
            format.bitrate,
            format.filesize.map(format_size).unwrap_or_else(|| "?".into()),
            format.note
        );
    }

    println!();
    println!("Video formats:");
    if formats.video.is_empty() {
        println!("  (none)");
    }
    for format in &formats.video {
        println!(
            "  {:<12} {:<6} {:>10} {:>4.0}fps {:<9} {:>10}  {}",
            format.id,
            format.ext,
            format.resolution,
            format.fps,
            if format.has_audio { "+audio" } else { "video-only" },
            format_size(format.filesize),
            format.note
        );
    }
}

fn format_duration(seconds: u64) -> String {
    let (hours, minutes, seconds) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "?".to_string();
    }
    format!("{:.1} MiB", bytes as f64 / 1_048_576.0)
}
