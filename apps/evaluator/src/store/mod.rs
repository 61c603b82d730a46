//! Persistence seams for the pipeline.
//!
//! The storage engine is an external collaborator; the pipeline only sees
//! these narrow traits. `memory` backs tests and single-process runs,
//! `pg` is the Postgres implementation used by the worker binary.

pub mod memory;
pub mod pg;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::document::Document;
use crate::models::job::{
    EvaluationJob, EvaluationResult, JobError, JobSnapshot, JobStatus, StageResult,
};

/// Read access to ingested documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fails with `NotFound` for unknown ids.
    async fn get_document(&self, id: Uuid) -> Result<Document, PipelineError>;

    /// All reference-kind documents, for context-store ingestion at startup.
    async fn reference_documents(&self) -> Result<Vec<Document>, PipelineError>;
}

/// Job persistence. Stage boundaries are the checkpoints: everything a
/// worker commits here survives a crash and drives resumption.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &EvaluationJob) -> Result<(), PipelineError>;

    async fn get_job(&self, id: Uuid) -> Result<EvaluationJob, PipelineError>;

    /// Whatever is persisted right now. Fails with `NotFound` for unknown ids.
    async fn snapshot(&self, id: Uuid) -> Result<JobSnapshot, PipelineError>;

    /// Refuses stage regression and any transition out of a terminal state.
    async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<(), PipelineError>;

    /// First write wins: a re-run after crash recovery never overwrites or
    /// duplicates an already-committed stage result.
    async fn record_stage_result(&self, id: Uuid, result: &StageResult)
        -> Result<(), PipelineError>;

    /// Committed stage results in stage order.
    async fn stage_results(&self, id: Uuid) -> Result<Vec<StageResult>, PipelineError>;

    async fn mark_completed(
        &self,
        id: Uuid,
        result: &EvaluationResult,
    ) -> Result<(), PipelineError>;

    /// Terminal failure. Already-committed stage results are retained.
    async fn mark_failed(&self, id: Uuid, error: &JobError) -> Result<(), PipelineError>;

    /// Acquires the per-job execution lease. Returns false when another live
    /// owner holds it or the job is terminal. Leases older than `ttl` are
    /// treated as abandoned by a crashed worker and stolen.
    async fn try_acquire(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, PipelineError>;

    async fn release(&self, id: Uuid, owner: &str) -> Result<(), PipelineError>;

    /// Jobs left non-terminal by a previous process, oldest first.
    async fn non_terminal_jobs(&self) -> Result<Vec<Uuid>, PipelineError>;
}
