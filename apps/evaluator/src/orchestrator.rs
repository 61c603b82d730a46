//! Job Orchestrator — the submission surface and the worker pool.
//!
//! `submit` validates references, persists the job, and returns its id
//! without waiting on any model call. A fixed pool of workers drains the
//! queue; each worker takes the per-job lease before running the pipeline,
//! so a requeued or duplicated id is executed by at most one worker at a
//! time. `status` reads persisted state only and never blocks on workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::document::DocumentKind;
use crate::models::job::{EvaluationJob, JobSnapshot};
use crate::pipeline::EvaluationPipeline;
use crate::store::{DocumentStore, JobStore};

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub worker_count: usize,
    /// Lease TTL; a worker that holds a lease longer than this is presumed
    /// dead and its job becomes stealable.
    pub lease_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            lease_ttl: Duration::from_secs(600),
        }
    }
}

pub struct Orchestrator {
    jobs: Arc<dyn JobStore>,
    documents: Arc<dyn DocumentStore>,
    queue: mpsc::UnboundedSender<Uuid>,
    workers: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Spawns the worker pool and returns the submission handle.
    pub fn start(
        jobs: Arc<dyn JobStore>,
        documents: Arc<dyn DocumentStore>,
        pipeline: Arc<EvaluationPipeline>,
        config: OrchestratorConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Uuid>();
        let rx = Arc::new(Mutex::new(rx));
        let process = Uuid::new_v4();

        let mut workers = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let owner = worker_owner(process, index);
            let rx = rx.clone();
            let jobs = jobs.clone();
            let pipeline = pipeline.clone();
            let lease_ttl = config.lease_ttl;
            workers.push(tokio::spawn(async move {
                loop {
                    // The lock is held for the recv only, never across a job.
                    let next = { rx.lock().await.recv().await };
                    let Some(job_id) = next else { break };

                    match jobs.try_acquire(job_id, &owner, lease_ttl).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(%job_id, %owner, "lease held elsewhere, skipping");
                            continue;
                        }
                        Err(e) => {
                            warn!(%job_id, %owner, error = %e, "lease acquisition failed");
                            continue;
                        }
                    }

                    if let Err(e) = pipeline.run(job_id).await {
                        // Terminal failure state is already persisted; the
                        // error here is for the operator log only.
                        warn!(%job_id, %owner, error = %e, "job finished in failure");
                    }
                    if let Err(e) = jobs.release(job_id, &owner).await {
                        warn!(%job_id, %owner, error = %e, "lease release failed");
                    }
                }
                debug!(%owner, "worker stopped");
            }));
        }

        info!(workers = config.worker_count, "orchestrator started");
        Self {
            jobs,
            documents,
            queue: tx,
            workers,
        }
    }

    /// Validates both document references, persists a queued job, and hands
    /// it to the pool. Returns the job id immediately.
    pub async fn submit(
        &self,
        cv_document_id: Uuid,
        project_document_id: Uuid,
        job_title: &str,
    ) -> Result<Uuid, PipelineError> {
        if job_title.trim().is_empty() {
            return Err(PipelineError::InvalidReference(
                "job_title must not be empty".to_string(),
            ));
        }
        self.expect_kind(cv_document_id, DocumentKind::Cv).await?;
        self.expect_kind(project_document_id, DocumentKind::ProjectReport)
            .await?;

        let job = EvaluationJob::new(cv_document_id, project_document_id, job_title);
        let id = job.id;
        self.jobs.insert_job(&job).await?;
        if self.queue.send(id).is_err() {
            // Pool is shut down; the job stays queued and is picked up by
            // recovery on the next start.
            warn!(job_id = %id, "worker pool closed, job left queued");
        }
        info!(job_id = %id, job_title, "job submitted");
        Ok(id)
    }

    /// Point-in-time view of a job. Never waits on running work.
    pub async fn status(&self, job_id: Uuid) -> Result<JobSnapshot, PipelineError> {
        self.jobs.snapshot(job_id).await
    }

    /// Requeues every persisted non-terminal job. Called at startup to pick
    /// up work a previous process left behind, and periodically to notice
    /// jobs enqueued by other writers. Requeueing a job that is already
    /// running is harmless: its lease blocks the duplicate.
    pub async fn recover(&self) -> Result<usize, PipelineError> {
        let pending = self.jobs.non_terminal_jobs().await?;
        let count = pending.len();
        for id in pending {
            if self.queue.send(id).is_err() {
                break;
            }
        }
        if count > 0 {
            debug!(count, "requeued non-terminal jobs");
        }
        Ok(count)
    }

    /// Graceful shutdown: closes the queue and waits for in-flight jobs to
    /// reach their next checkpoint or terminal state.
    pub async fn close(self) {
        drop(self.queue);
        for handle in self.workers {
            let _ = handle.await;
        }
        info!("orchestrator stopped");
    }

    async fn expect_kind(&self, id: Uuid, expected: DocumentKind) -> Result<(), PipelineError> {
        let doc = match self.documents.get_document(id).await {
            Ok(doc) => doc,
            Err(PipelineError::NotFound(message)) => {
                return Err(PipelineError::InvalidReference(message))
            }
            Err(e) => return Err(e),
        };
        if doc.kind != expected {
            return Err(PipelineError::InvalidReference(format!(
                "document {id} is {}, expected {}",
                doc.kind.as_str(),
                expected.as_str()
            )));
        }
        Ok(())
    }
}

/// Lease owner identity for one worker. Carries a per-process nonce:
/// equally indexed workers in different processes sharing the job store
/// must never alias each other's leases.
fn worker_owner(process: Uuid, index: usize) -> String {
    format!("{process}-worker-{index}")
}
