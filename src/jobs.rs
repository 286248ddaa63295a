#![forbid(unsafe_code)]

//! In-memory tracker for download jobs.
//!
//! Every accepted download gets an entry in a mutex-guarded map and a tokio
//! task that drives yt-dlp. The task is the only writer for its entry; HTTP
//! handlers only read snapshots and, after delivery, delete the entry. A
//! semaphore caps how many yt-dlp processes run at once.
//!
//! Lifecycle: `Downloading -> Completed | Failed | Cancelled`, applied exactly
//! once. `NotFound` is only ever returned for unknown ids. Finished jobs that
//! nobody retrieves are swept once they are older than the job TTL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{DEFAULT_JOB_TTL_SECS, RuntimeSettings};
use crate::download::{DownloadOutput, DownloadRequest, Downloader, remove_job_files};
use crate::error::{GrabError, GrabResult};
use crate::progress::ProgressUpdate;
use crate::security::sanitize_title;

const MSG_WAITING: &str = "Waiting for a free worker";
const MSG_STARTING: &str = "Starting download";
const MSG_DONE: &str = "Download complete";
const MSG_CANCELLED: &str = "Download cancelled";
const MSG_NOT_FOUND: &str = "Download not found";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Downloading,
    Completed,
    Failed,
    Cancelled,
    NotFound,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Point-in-time copy of a job, as handed to pollers. The on-disk path is
/// kept out of API responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(skip)]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    fn downloading(id: &str, message: &str) -> Self {
        Self {
            id: id.to_string(),
            status: JobStatus::Downloading,
            progress: 0.0,
            message: message.to_string(),
            filename: None,
            filesize: None,
            file: None,
            created_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    fn not_found(id: &str) -> Self {
        Self {
            status: JobStatus::NotFound,
            created_at: None,
            ..Self::downloading(id, MSG_NOT_FOUND)
        }
    }
}

/// A completed job's file, opened for delivery.
#[derive(Debug)]
pub struct RetrievedFile {
    pub file: tokio::fs::File,
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
}

struct Job {
    state: JobSnapshot,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<JobTrackerInner>,
}

struct JobTrackerInner {
    jobs: Mutex<HashMap<String, Job>>,
    downloader: Downloader,
    workers: Arc<Semaphore>,
    cleanup_delay: Duration,
    job_ttl: Duration,
}

impl JobTracker {
    pub fn new(downloader: Downloader, max_jobs: usize, cleanup_delay: Duration) -> Self {
        Self::build(
            downloader,
            max_jobs,
            cleanup_delay,
            Duration::from_secs(DEFAULT_JOB_TTL_SECS),
        )
    }

    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self::build(
            Downloader::from_settings(settings),
            settings.max_jobs,
            settings.cleanup_delay,
            settings.job_ttl,
        )
    }

    fn build(
        downloader: Downloader,
        max_jobs: usize,
        cleanup_delay: Duration,
        job_ttl: Duration,
    ) -> Self {
        // `Semaphore::new` panics above MAX_PERMITS.
        let permits = max_jobs.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            inner: Arc::new(JobTrackerInner {
                jobs: Mutex::new(HashMap::new()),
                downloader,
                workers: Arc::new(Semaphore::new(permits)),
                cleanup_delay,
                job_ttl,
            }),
        }
    }

    /// Registers a job and starts its worker. Must be called from within a
    /// tokio runtime; returns as soon as the job is registered.
    pub fn submit(&self, request: DownloadRequest) -> GrabResult<String> {
        request.validate()?;

        let job_id = next_job_id();
        let cancel = CancellationToken::new();
        self.inner.jobs.lock().insert(
            job_id.clone(),
            Job {
                state: JobSnapshot::downloading(&job_id, MSG_WAITING),
                cancel: cancel.clone(),
            },
        );
        info!(
            "job {job_id}: accepted {} download of {} (format {})",
            request.kind.as_str(),
            request.url,
            request.format_id
        );

        let inner = self.inner.clone();
        let job_id_clone = job_id.clone();
        tokio::spawn(async move {
            let title = request.title.clone();
            let inner_for_run = inner.clone();
            let id_for_run = job_id_clone.clone();
            let outcome = tokio::spawn(async move {
                run_job(&inner_for_run, &id_for_run, &request, &cancel).await
            })
            .await;

            match outcome {
                Ok(Ok(output)) => complete_job(&inner, &job_id_clone, &title, output).await,
                Ok(Err(GrabError::Cancelled)) => {
                    finish_job(&inner, &job_id_clone, JobStatus::Cancelled, MSG_CANCELLED);
                }
                Ok(Err(err)) => {
                    warn!("job {job_id_clone}: {err}");
                    finish_job(&inner, &job_id_clone, JobStatus::Failed, &err.to_string());
                }
                Err(err) => {
                    warn!("job {job_id_clone}: worker aborted: {err}");
                    remove_job_files(inner.downloader.work_dir(), &job_id_clone).await;
                    finish_job(
                        &inner,
                        &job_id_clone,
                        JobStatus::Failed,
                        &format!("Download worker aborted: {err}"),
                    );
                }
            }
        });

        Ok(job_id)
    }

    /// Current state of a job, or the `NotFound` sentinel.
    pub fn poll(&self, job_id: &str) -> JobSnapshot {
        self.inner
            .jobs
            .lock()
            .get(job_id)
            .map(|job| job.state.clone())
            .unwrap_or_else(|| JobSnapshot::not_found(job_id))
    }

    /// Opens a completed job's file and schedules removal of the file and the
    /// tracker entry after the cleanup delay. The removal is not synchronized
    /// with the caller's read; on Unix the open handle keeps the data
    /// readable, elsewhere a slow reader can lose the race.
    pub async fn retrieve(&self, job_id: &str) -> Option<RetrievedFile> {
        let snapshot = self.poll(job_id);
        if snapshot.status != JobStatus::Completed {
            return None;
        }
        let path = snapshot.file?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                warn!("job {job_id}: completed file unavailable: {err}");
                return None;
            }
        };
        self.schedule_cleanup(job_id, path.clone());
        Some(RetrievedFile {
            file,
            path,
            filename: snapshot.filename.unwrap_or_default(),
            size: snapshot.filesize.unwrap_or_default(),
        })
    }

    fn schedule_cleanup(&self, job_id: &str, path: PathBuf) {
        let inner = self.inner.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(inner.cleanup_delay).await;
            if let Err(err) = tokio::fs::remove_file(&path).await {
                debug!("job {job_id}: cleanup of {} skipped: {err}", path.display());
            }
            inner.jobs.lock().remove(&job_id);
            debug!("job {job_id}: cleaned up");
        });
    }

    /// Drops terminal jobs that finished at least one TTL ago, together with
    /// any output file they still own. Returns how many entries went away.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let ttl = self.inner.job_ttl;
        let expired: Vec<(String, Option<PathBuf>)> = {
            let mut jobs = self.inner.jobs.lock();
            let ids: Vec<String> = jobs
                .iter()
                .filter(|(_, job)| is_expired(&job.state, now, ttl))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| jobs.remove(&id).map(|job| (id, job.state.file)))
                .collect()
        };

        for (job_id, file) in &expired {
            let Some(path) = file else { continue };
            if let Err(err) = tokio::fs::remove_file(path).await {
                debug!("job {job_id}: expired file {} not removed: {err}", path.display());
            }
        }
        if !expired.is_empty() {
            info!("swept {} expired job(s)", expired.len());
        }
        expired.len()
    }

    /// Runs `sweep_expired` periodically until the tracker is dropped.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let weak: Weak<JobTrackerInner> = Arc::downgrade(&self.inner);
        let period = (self.inner.job_ttl / 4)
            .clamp(Duration::from_secs(1), Duration::from_secs(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("job tracker dropped, sweeper stopping");
                    return;
                };
                JobTracker { inner }.sweep_expired().await;
            }
        })
    }

    pub fn active_jobs(&self) -> usize {
        self.inner
            .jobs
            .lock()
            .values()
            .filter(|job| job.state.status == JobStatus::Downloading)
            .count()
    }

    /// Cancels every in-flight job and waits up to `grace` for the workers to
    /// record the outcome. Jobs cannot be aborted individually.
    pub async fn shutdown(&self, grace: Duration) {
        let cancelled = {
            let jobs = self.inner.jobs.lock();
            jobs.values()
                .filter(|job| job.state.status == JobStatus::Downloading)
                .inspect(|job| job.cancel.cancel())
                .count()
        };
        if cancelled == 0 {
            return;
        }
        info!("cancelling {cancelled} in-flight download(s)");
        let deadline = tokio::time::Instant::now() + grace;
        while self.active_jobs() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn run_job(
    inner: &JobTrackerInner,
    job_id: &str,
    request: &DownloadRequest,
    cancel: &CancellationToken,
) -> GrabResult<DownloadOutput> {
    let permit = tokio::select! {
        _ = cancel.cancelled() => return Err(GrabError::Cancelled),
        permit = inner.workers.clone().acquire_owned() => permit,
    };
    let _permit = permit.map_err(|_| GrabError::LocalIo("worker pool closed".into()))?;
    set_message(inner, job_id, MSG_STARTING);

    inner
        .downloader
        .run(job_id, request, cancel, |update| {
            apply_update(inner, job_id, update)
        })
        .await
}

fn set_message(inner: &JobTrackerInner, job_id: &str, message: &str) {
    apply_update(
        inner,
        job_id,
        ProgressUpdate {
            percent: None,
            message: Some(message.to_string()),
        },
    );
}

/// Applies a parsed output line. Progress never moves backwards: yt-dlp
/// restarts at 0% for the audio stream of a merged download.
fn apply_update(inner: &JobTrackerInner, job_id: &str, update: ProgressUpdate) {
    let mut jobs = inner.jobs.lock();
    let Some(job) = jobs.get_mut(job_id) else {
        return;
    };
    if job.state.status != JobStatus::Downloading {
        return;
    }
    if let Some(percent) = update.percent {
        job.state.progress = job.state.progress.max(percent.clamp(0.0, 100.0));
    }
    if let Some(message) = update.message {
        job.state.message = message;
    }
}

async fn complete_job(inner: &JobTrackerInner, job_id: &str, title: &str, output: DownloadOutput) {
    let filename = if output.ext.is_empty() {
        sanitize_title(title)
    } else {
        format!("{}.{}", sanitize_title(title), output.ext)
    };
    let recorded = transition(inner, job_id, JobStatus::Completed, MSG_DONE, |state| {
        state.progress = 100.0;
        state.filename = Some(filename.clone());
        state.filesize = Some(output.size);
        state.file = Some(output.path.clone());
    });
    if recorded {
        info!(
            "job {job_id}: completed {filename} ({} bytes)",
            output.size
        );
    } else if let Err(err) = tokio::fs::remove_file(&output.path).await {
        debug!("job {job_id}: orphaned output not removed: {err}");
    }
}

fn finish_job(inner: &JobTrackerInner, job_id: &str, status: JobStatus, message: &str) -> bool {
    let recorded = transition(inner, job_id, status, message, |_| {});
    if recorded {
        info!("job {job_id}: {status:?}: {message}");
    }
    recorded
}

/// Moves a job out of `Downloading`. Returns `false` when the job is unknown
/// or already terminal, leaving it untouched.
fn transition(
    inner: &JobTrackerInner,
    job_id: &str,
    status: JobStatus,
    message: &str,
    fill: impl FnOnce(&mut JobSnapshot),
) -> bool {
    let mut jobs = inner.jobs.lock();
    let Some(job) = jobs.get_mut(job_id) else {
        return false;
    };
    if job.state.status != JobStatus::Downloading {
        return false;
    }
    job.state.status = status;
    job.state.message = message.to_string();
    job.state.finished_at = Some(Utc::now());
    fill(&mut job.state);
    true
}

fn is_expired(state: &JobSnapshot, now: DateTime<Utc>, ttl: Duration) -> bool {
    if !state.status.is_terminal() {
        return false;
    }
    state
        .finished_at
        .and_then(|finished| (now - finished).to_std().ok())
        .is_some_and(|age| age >= ttl)
}

fn next_job_id() -> String {
    format!("{:016x}{:016x}", OsRng.next_u64(), OsRng.next_u64())
}
