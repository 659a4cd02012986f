//! Issue-tracker orchestration.
//!
//! New crashes get an issue opened in the tracker and recurring crashes get a
//! comment. All tracker traffic goes through a job queue so a slow or broken
//! tracker never holds up report ingestion.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crashboard_state::QueueBackend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::aggregator::CrashAggregator;
use crate::config::NotifierSettings;
use crate::error::{CrashboardError, Result};
use crate::fingerprint::Fingerprint;
use crate::model::{AttributeDelta, MergedView};
use crate::text::crash_uri;

const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Downstream issue tracker.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Opens an issue and returns its reference.
    async fn open_issue(&self, request: &IssueRequest) -> Result<String>;

    async fn add_comment(&self, issue: &str, body: &str) -> Result<()>;
}

pub fn issue_title(fingerprint: Fingerprint) -> String {
    format!("Crash report {}", fingerprint)
}

pub fn issue_body(reporter_host: &str, fingerprint: Fingerprint) -> String {
    format!(
        "Full report is at [{}]({}{})",
        fingerprint,
        reporter_host.trim_end_matches('/'),
        crash_uri(fingerprint)
    )
}

pub fn issue_comment(count: i64) -> String {
    format!("More crashes incoming. Current crash count is at {}.", count)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum IssueJob {
    CreateIssue { fingerprint: Fingerprint },
    /// Re-evaluates a crash whose issue may still be in flight.
    Recheck { fingerprint: Fingerprint, attempt: u32 },
    Recurrence { fingerprint: Fingerprint },
}

impl IssueJob {
    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            Self::CreateIssue { fingerprint }
            | Self::Recheck { fingerprint, .. }
            | Self::Recurrence { fingerprint } => *fingerprint,
        }
    }
}

pub struct IssueOrchestrator {
    queue: Arc<dyn QueueBackend>,
    tracker: Arc<dyn IssueTracker>,
    settings: NotifierSettings,
}

impl IssueOrchestrator {
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        tracker: Arc<dyn IssueTracker>,
        settings: NotifierSettings,
    ) -> Self {
        Self {
            queue,
            tracker,
            settings,
        }
    }

    /// Decides what, if anything, the tracker should hear about `view`.
    ///
    /// `attempt` counts earlier rechecks of the same crash.
    pub fn plan(&self, view: &MergedView, attempt: u32) -> Option<(IssueJob, Duration)> {
        let fingerprint = view.fingerprint;
        match &view.issue {
            None if view.count == 1 => Some((IssueJob::CreateIssue { fingerprint }, Duration::ZERO)),
            None if view.count > 1 => {
                if attempt >= self.settings.max_rechecks {
                    warn!(%fingerprint, attempt, "giving up waiting for issue");
                    None
                } else {
                    Some((
                        IssueJob::Recheck {
                            fingerprint,
                            attempt: attempt + 1,
                        },
                        self.settings.defer_delay(),
                    ))
                }
            }
            Some(_)
                if view.count > 0 && view.count % self.settings.notify_frequency.max(1) == 0 =>
            {
                Some((IssueJob::Recurrence { fingerprint }, Duration::ZERO))
            }
            _ => None,
        }
    }

    /// Enqueues the job `view` calls for, returning it.
    #[tracing::instrument(skip(self, view), fields(fingerprint = %view.fingerprint))]
    pub async fn manage(&self, view: &MergedView) -> Result<Option<IssueJob>> {
        self.enqueue(view, 0).await
    }

    async fn enqueue(&self, view: &MergedView, attempt: u32) -> Result<Option<IssueJob>> {
        let Some((job, delay)) = self.plan(view, attempt) else {
            debug!("no pending issue work");
            return Ok(None);
        };

        let payload = serde_json::to_vec(&job)?;
        let id = self
            .queue
            .publish_delayed(&self.settings.queue, &payload, delay)
            .await?;
        info!(message_id = %id, ?job, ?delay, "enqueued issue job");
        Ok(Some(job))
    }

    /// Processes every visible job, returning how many were handled.
    ///
    /// Failed jobs are logged and dropped.
    pub async fn run_pending(&self, aggregator: &CrashAggregator) -> Result<usize> {
        let mut handled = 0;

        while let Some(message) = self
            .queue
            .receive(&self.settings.queue, VISIBILITY_TIMEOUT)
            .await?
        {
            match serde_json::from_slice::<IssueJob>(&message.payload) {
                Ok(job) => {
                    if let Err(e) = self.process(&job, aggregator).await {
                        error!(fingerprint = %job.fingerprint(), error = %e, "issue job failed");
                    }
                }
                Err(e) => error!(message_id = %message.id, error = %e, "dropping malformed issue job"),
            }
            self.queue.ack(&self.settings.queue, &message.id).await?;
            handled += 1;
        }

        Ok(handled)
    }

    async fn process(&self, job: &IssueJob, aggregator: &CrashAggregator) -> Result<()> {
        let fingerprint = job.fingerprint();
        let Some(view) = aggregator.get_crash(fingerprint).await? else {
            debug!(%fingerprint, "crash vanished before issue job ran");
            return Ok(());
        };

        match job {
            IssueJob::CreateIssue { .. } => {
                if view.issue.is_some() {
                    return Ok(());
                }
                let request = IssueRequest {
                    title: issue_title(fingerprint),
                    body: issue_body(&self.settings.reporter_host, fingerprint),
                    labels: vec![fingerprint.to_string()],
                };
                let issue = self.tracker.open_issue(&request).await?;
                info!(%fingerprint, %issue, "opened issue");
                aggregator
                    .update_attributes(fingerprint, &AttributeDelta::issue(issue))
                    .await?;
            }
            IssueJob::Recheck { attempt, .. } => {
                self.enqueue(&view, *attempt).await?;
            }
            IssueJob::Recurrence { .. } => {
                let issue = view
                    .issue
                    .as_deref()
                    .ok_or_else(|| CrashboardError::Notify("crash has no issue".to_string()))?;
                self.tracker
                    .add_comment(issue, &issue_comment(view.count))
                    .await?;
                debug!(%fingerprint, %issue, "posted recurrence comment");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedIssue {
    pub number: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub comments: Vec<String>,
}

/// In-process tracker handing out sequential issue numbers.
#[derive(Default)]
pub struct MemoryIssueTracker {
    next: AtomicU64,
    unavailable: AtomicBool,
    issues: Mutex<Vec<TrackedIssue>>,
}

impl MemoryIssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn issues(&self) -> Vec<TrackedIssue> {
        self.issues.lock().clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CrashboardError::Notify("tracker unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IssueTracker for MemoryIssueTracker {
    async fn open_issue(&self, request: &IssueRequest) -> Result<String> {
        self.check_available()?;
        let number = (self.next.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        self.issues.lock().push(TrackedIssue {
            number: number.clone(),
            title: request.title.clone(),
            body: request.body.clone(),
            labels: request.labels.clone(),
            comments: Vec::new(),
        });
        Ok(number)
    }

    async fn add_comment(&self, issue: &str, body: &str) -> Result<()> {
        self.check_available()?;
        let mut issues = self.issues.lock();
        let tracked = issues
            .iter_mut()
            .find(|i| i.number == issue)
            .ok_or_else(|| CrashboardError::Notify(format!("no such issue: {}", issue)))?;
        tracked.comments.push(body.to_string());
        Ok(())
    }
}
