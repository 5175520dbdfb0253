use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::enhance::EnhanceOutcome;
use crate::generator::GenerationRequest;
use crate::service::{GenerationOutput, GenerationPhase, GenerationProgress};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_RETENTION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutput {
    pub prompt: String,
    pub video_url: String,
    pub gif_url: String,
    pub frames: usize,
    pub width: usize,
    pub height: usize,
    pub upscaled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhancement: Option<EnhanceOutcome>,
}

fn output_url(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("/outputs/{name}")
}

impl From<GenerationOutput> for JobOutput {
    fn from(output: GenerationOutput) -> Self {
        Self {
            video_url: output_url(&output.video.mp4),
            gif_url: output_url(&output.video.gif),
            prompt: output.prompt,
            frames: output.video.frames,
            width: output.video.width,
            height: output.video.height,
            upscaled: output.upscaled,
            enhancement: output.enhancement,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub request: GenerationRequest,
    pub enhance: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Option<GenerationProgress>,
    pub error: Option<String>,
    pub output: Option<JobOutput>,
    pub cancel_token: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    pub request: GenerationRequest,
    pub enhance: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Option<GenerationProgress>,
    pub error: Option<String>,
    pub output: Option<JobOutput>,
    pub duration_ms: Option<i64>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            status: job.status,
            request: job.request.clone(),
            enhance: job.enhance,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            progress: job.progress,
            error: job.error.clone(),
            output: job.output.clone(),
            duration_ms: job_duration_ms(job),
        }
    }
}

fn job_duration_ms(job: &Job) -> Option<i64> {
    let completed_at = job.completed_at?;
    let started_at = job.started_at.unwrap_or(job.created_at);
    Some((completed_at - started_at).num_milliseconds().max(0))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobWsEvent {
    Progress {
        phase: GenerationPhase,
        current: u64,
        total: u64,
    },
    Status {
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<JobOutput>,
    },
}

impl From<GenerationProgress> for JobWsEvent {
    fn from(value: GenerationProgress) -> Self {
        Self::Progress {
            phase: value.phase,
            current: value.current,
            total: value.total,
        }
    }
}

impl JobWsEvent {
    pub fn status_of(job: &Job) -> Self {
        Self::Status {
            status: job.status,
            error: job.error.clone(),
            output: job.output.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Status { status, .. } if status.is_terminal())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelError {
    NotFound,
    AlreadyFinished(JobStatus),
}

/// In-memory job table plus one broadcast channel per live job.
///
/// Finished jobs are dropped once they are older than the retention window,
/// matching the lifetime of their output files.
pub struct JobTable {
    jobs: DashMap<String, Job>,
    senders: DashMap<String, broadcast::Sender<JobWsEvent>>,
    retention: TimeDelta,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            senders: DashMap::new(),
            retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Removes terminal jobs that completed before `now - retention`.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return 0;
        };
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.is_some_and(|done| done < cutoff))
        });
        // Drop channels whose job was pruned.
        self.senders.retain(|id, _| self.jobs.contains_key(id));
        before.saturating_sub(self.jobs.len())
    }

    pub fn create(&self, request: GenerationRequest, enhance: bool) -> Job {
        self.prune_expired(Utc::now());
        let id = Uuid::new_v4().to_string();
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        self.senders.insert(id.clone(), tx);

        let job = Job {
            id: id.clone(),
            status: JobStatus::Queued,
            request,
            enhance,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: None,
            error: None,
            output: None,
            cancel_token: CancellationToken::new(),
        };
        self.jobs.insert(id, job.clone());
        job
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|job| job.clone())
    }

    /// Newest first.
    pub fn list(&self) -> Vec<JobResponse> {
        self.prune_expired(Utc::now());
        let mut jobs: Vec<JobResponse> = self
            .jobs
            .iter()
            .map(|entry| JobResponse::from(entry.value()))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<JobWsEvent>> {
        self.senders.get(id).map(|sender| sender.subscribe())
    }

    fn broadcast(&self, id: &str, event: JobWsEvent) {
        // Clone the sender so the map shard is not held while sending.
        let sender = self.senders.get(id).map(|sender| sender.clone());
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }

    /// Stores the latest progress. The first event also moves a queued job
    /// to running, since it is only emitted once the GPU permit is held.
    pub fn record_progress(&self, id: &str, progress: GenerationProgress) {
        let started = {
            let Some(mut job) = self.jobs.get_mut(id) else {
                return;
            };
            if job.status.is_terminal() {
                return;
            }
            job.progress = Some(progress);
            if job.status == JobStatus::Queued {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                Some(JobWsEvent::status_of(&job))
            } else {
                None
            }
        };

        if let Some(event) = started {
            self.broadcast(id, event);
        }
        self.broadcast(id, JobWsEvent::from(progress));
    }

    /// Records the result unless the job was cancelled meanwhile, then
    /// closes its event channel.
    pub fn finish(&self, id: &str, result: anyhow::Result<GenerationOutput>) -> Option<JobStatus> {
        let event = {
            let Some(mut job) = self.jobs.get_mut(id) else {
                self.senders.remove(id);
                return None;
            };
            if job.status != JobStatus::Cancelled {
                match result {
                    Ok(output) => {
                        job.status = JobStatus::Completed;
                        job.output = Some(JobOutput::from(output));
                    }
                    Err(err) => {
                        job.status = JobStatus::Failed;
                        job.error = Some(format!("{err:#}"));
                    }
                }
                job.completed_at = Some(Utc::now());
            }
            JobWsEvent::status_of(&job)
        };

        let status = match &event {
            JobWsEvent::Status { status, .. } => Some(*status),
            JobWsEvent::Progress { .. } => None,
        };
        if status != Some(JobStatus::Cancelled) {
            self.broadcast(id, event);
        }
        self.senders.remove(id);
        status
    }

    pub fn cancel(&self, id: &str) -> Result<Job, CancelError> {
        let snapshot = {
            let mut job = self.jobs.get_mut(id).ok_or(CancelError::NotFound)?;
            if job.status.is_terminal() {
                return Err(CancelError::AlreadyFinished(job.status));
            }
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            job.cancel_token.cancel();
            job.clone()
        };
        self.broadcast(id, JobWsEvent::status_of(&snapshot));
        Ok(snapshot)
    }
}
