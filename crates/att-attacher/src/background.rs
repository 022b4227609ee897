//! Background promotion and deletion
//!
//! Job payloads are plain JSON so they can cross process boundaries:
//!
//! ```json
//! {"type":"promote","record_class":"Photo","record_id":1,"attribute_name":"image",
//!  "attachment":{"id":"abc.jpg","storage":"cache","metadata":{}}}
//! ```

use std::sync::Arc;

use att_core::{Id, RecordKey};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::attacher::{delete_file, Attacher, AttacherContext};
use crate::error::{AttachmentError, AttachmentResult};
use crate::file::UploadedFile;
use crate::record::{AtomicOptions, RecordStore};

/// Promote a cached attachment of a persisted record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoteJob {
    pub record_class: String,
    pub record_id: Id,
    pub attribute_name: String,
    pub attachment: UploadedFile,
}

/// Delete a file that is no longer referenced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestroyJob {
    pub attachment: UploadedFile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    Promote(PromoteJob),
    Destroy(DestroyJob),
}

/// Result of a performed job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Promoted(UploadedFile),
    /// The record changed before the promotion could be persisted
    Discarded,
    Destroyed,
}

impl PromoteJob {
    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(self.record_class.clone(), self.record_id)
    }

    /// Reattach to the record and promote atomically. A concurrent change of
    /// the record is not an error: the job is discarded.
    #[instrument(skip_all, fields(record = %self.record_key(), name = %self.attribute_name))]
    pub async fn perform(
        &self,
        store: &dyn RecordStore,
        ctx: Arc<AttacherContext>,
        options: AtomicOptions,
    ) -> AttachmentResult<JobOutcome> {
        let result = async {
            let mut attacher = Attacher::retrieve(
                store,
                self.record_key(),
                self.attribute_name.clone(),
                &self.attachment,
                ctx,
            )
            .await?;
            attacher.atomic_promote(store, options).await
        }
        .await;

        match result {
            Ok(file) => Ok(JobOutcome::Promoted(file)),
            Err(AttachmentError::AttachmentChanged(reason)) => {
                info!(reason = %reason, "Promotion discarded");
                Ok(JobOutcome::Discarded)
            }
            Err(e) => Err(e),
        }
    }
}

impl DestroyJob {
    #[instrument(skip_all, fields(id = %self.attachment.id()))]
    pub async fn perform(&self, ctx: &AttacherContext) -> AttachmentResult<JobOutcome> {
        delete_file(ctx.storages(), &self.attachment).await?;
        Ok(JobOutcome::Destroyed)
    }
}

impl Job {
    pub fn from_json(data: &str) -> AttachmentResult<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_json(&self) -> AttachmentResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::Promote(_) => "promote",
            Job::Destroy(_) => "destroy",
        }
    }

    pub async fn perform(
        &self,
        store: &dyn RecordStore,
        ctx: Arc<AttacherContext>,
        options: AtomicOptions,
    ) -> AttachmentResult<JobOutcome> {
        match self {
            Job::Promote(job) => job.perform(store, ctx, options).await,
            Job::Destroy(job) => job.perform(&ctx).await,
        }
    }
}

/// Sending side of the in-process job channel
#[derive(Debug, Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn enqueue(&self, job: Job) -> AttachmentResult<()> {
        debug!(kind = job.kind(), "Job enqueued");
        self.sender
            .send(job)
            .map_err(|_| AttachmentError::QueueClosed)
    }
}

/// Counters of a finished worker run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub promoted: usize,
    pub discarded: usize,
    pub destroyed: usize,
    pub failed: usize,
}

impl WorkerStats {
    fn record(&mut self, result: AttachmentResult<JobOutcome>) {
        match result {
            Ok(JobOutcome::Promoted(_)) => self.promoted += 1,
            Ok(JobOutcome::Discarded) => self.discarded += 1,
            Ok(JobOutcome::Destroyed) => self.destroyed += 1,
            Err(e) => {
                error!(error = %e, "Job failed");
                self.failed += 1;
            }
        }
    }
}

/// Performs jobs from a channel until every sender is dropped
pub struct Worker {
    receiver: mpsc::UnboundedReceiver<Job>,
    store: Arc<dyn RecordStore>,
    ctx: Arc<AttacherContext>,
    options: AtomicOptions,
    concurrency: usize,
}

impl Worker {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<Job>,
        store: Arc<dyn RecordStore>,
        ctx: &AttacherContext,
        options: AtomicOptions,
    ) -> Self {
        Self {
            receiver,
            store,
            ctx: Arc::new(ctx.without_jobs()),
            options,
            concurrency: 1,
        }
    }

    /// Maximum number of jobs performed at once
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn run(mut self) -> WorkerStats {
        info!(concurrency = self.concurrency, "Worker started");
        let mut stats = WorkerStats::default();
        let mut tasks = JoinSet::new();

        while let Some(job) = self.receiver.recv().await {
            while tasks.len() >= self.concurrency {
                if let Some(joined) = tasks.join_next().await {
                    stats.record(flatten(joined));
                }
            }

            let store = self.store.clone();
            let ctx = self.ctx.clone();
            let options = self.options;
            tasks.spawn(async move { job.perform(&*store, ctx, options).await });
        }

        while let Some(joined) = tasks.join_next().await {
            stats.record(flatten(joined));
        }

        info!(
            promoted = stats.promoted,
            discarded = stats.discarded,
            destroyed = stats.destroyed,
            failed = stats.failed,
            "Worker stopped"
        );
        stats
    }
}

fn flatten(
    joined: Result<AttachmentResult<JobOutcome>, tokio::task::JoinError>,
) -> AttachmentResult<JobOutcome> {
    joined.unwrap_or_else(|e| Err(AttachmentError::JobFailed(e.to_string())))
}
