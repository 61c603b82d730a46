//! In-memory store implementations, used by tests and single-process runs.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::document::Document;
use crate::models::job::{
    EvaluationJob, EvaluationResult, JobError, JobSnapshot, JobStatus, StageResult,
};
use crate::store::{DocumentStore, JobStore};

#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<Uuid, Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, document: Document) {
        self.documents.write().await.insert(document.id, document);
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_document(&self, id: Uuid) -> Result<Document, PipelineError> {
        self.documents
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("document {id}")))
    }

    async fn reference_documents(&self) -> Result<Vec<Document>, PipelineError> {
        let mut docs: Vec<Document> = self
            .documents
            .read()
            .await
            .values()
            .filter(|d| d.kind.is_reference())
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.ingested_at);
        Ok(docs)
    }
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    acquired_at: DateTime<Utc>,
}

struct JobRecord {
    job: EvaluationJob,
    stage_results: Vec<StageResult>,
    result: Option<EvaluationResult>,
    error: Option<JobError>,
    lease: Option<Lease>,
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn advance_status(job: &mut EvaluationJob, status: JobStatus) -> Result<(), PipelineError> {
    if job.status.is_terminal() {
        return Err(anyhow!(
            "job {} is terminal ({}), refusing transition to {status}",
            job.id,
            job.status
        )
        .into());
    }
    if status.rank() < job.status.rank() {
        return Err(anyhow!(
            "status regression on job {}: {} -> {status}",
            job.id,
            job.status
        )
        .into());
    }
    let now = Utc::now();
    if job.status == JobStatus::Queued && status != JobStatus::Queued {
        job.started_at.get_or_insert(now);
    }
    if status.is_terminal() {
        job.completed_at = Some(now);
    }
    job.status = status;
    job.updated_at = now;
    Ok(())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: &EvaluationJob) -> Result<(), PipelineError> {
        self.jobs.write().await.insert(
            job.id,
            JobRecord {
                job: job.clone(),
                stage_results: Vec::new(),
                result: None,
                error: None,
                lease: None,
            },
        );
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<EvaluationJob, PipelineError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .map(|r| r.job.clone())
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))
    }

    async fn snapshot(&self, id: Uuid) -> Result<JobSnapshot, PipelineError> {
        let jobs = self.jobs.read().await;
        let record = jobs
            .get(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        let mut stage_results = record.stage_results.clone();
        stage_results.sort_by_key(|r| r.stage);
        Ok(JobSnapshot {
            status: record.job.status,
            result: record.result.clone(),
            error: record.error.clone(),
            stage_results,
        })
    }

    async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<(), PipelineError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        advance_status(&mut record.job, status)
    }

    async fn record_stage_result(
        &self,
        id: Uuid,
        result: &StageResult,
    ) -> Result<(), PipelineError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        if record.stage_results.iter().any(|r| r.stage == result.stage) {
            return Ok(());
        }
        record.stage_results.push(result.clone());
        record.job.updated_at = Utc::now();
        Ok(())
    }

    async fn stage_results(&self, id: Uuid) -> Result<Vec<StageResult>, PipelineError> {
        let jobs = self.jobs.read().await;
        let record = jobs
            .get(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        let mut results = record.stage_results.clone();
        results.sort_by_key(|r| r.stage);
        Ok(results)
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        result: &EvaluationResult,
    ) -> Result<(), PipelineError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        advance_status(&mut record.job, JobStatus::Completed)?;
        record.result = Some(result.clone());
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &JobError) -> Result<(), PipelineError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        advance_status(&mut record.job, JobStatus::Failed)?;
        record.error = Some(error.clone());
        Ok(())
    }

    async fn try_acquire(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, PipelineError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        if record.job.status.is_terminal() {
            return Ok(false);
        }
        let now = Utc::now();
        let expired = |lease: &Lease| {
            now.signed_duration_since(lease.acquired_at)
                > chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::max_value())
        };
        match &record.lease {
            Some(lease) if lease.owner != owner && !expired(lease) => Ok(false),
            _ => {
                record.lease = Some(Lease {
                    owner: owner.to_string(),
                    acquired_at: now,
                });
                Ok(true)
            }
        }
    }

    async fn release(&self, id: Uuid, owner: &str) -> Result<(), PipelineError> {
        let mut jobs = self.jobs.write().await;
        if let Some(record) = jobs.get_mut(&id) {
            if record
                .lease
                .as_ref()
                .is_some_and(|lease| lease.owner == owner)
            {
                record.lease = None;
            }
        }
        Ok(())
    }

    async fn non_terminal_jobs(&self) -> Result<Vec<Uuid>, PipelineError> {
        let jobs = self.jobs.read().await;
        let mut pending: Vec<&JobRecord> = jobs
            .values()
            .filter(|r| !r.job.status.is_terminal())
            .collect();
        pending.sort_by_key(|r| r.job.created_at);
        Ok(pending.iter().map(|r| r.job.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::models::job::Stage;

    use super::*;

    fn stage_result(stage: Stage) -> StageResult {
        StageResult {
            stage,
            scores: BTreeMap::new(),
            aggregate: Some(0.5),
            feedback: "fine".to_string(),
            context_degraded: false,
            completed_at: Utc::now(),
        }
    }

    async fn store_with_job() -> (InMemoryJobStore, Uuid) {
        let store = InMemoryJobStore::new();
        let job = EvaluationJob::new(Uuid::new_v4(), Uuid::new_v4(), "Backend Engineer");
        let id = job.id;
        store.insert_job(&job).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_snapshot_of_unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let err = store.snapshot(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_status_cannot_regress() {
        let (store, id) = store_with_job().await;
        store.set_status(id, JobStatus::ProjectStage).await.unwrap();
        let err = store.set_status(id, JobStatus::CvStage).await.unwrap_err();
        assert!(err.to_string().contains("regression"));
        assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::ProjectStage);
    }

    #[tokio::test]
    async fn test_terminal_status_is_frozen() {
        let (store, id) = store_with_job().await;
        store
            .mark_failed(
                id,
                &JobError {
                    stage: Stage::Cv,
                    kind: "upstream_unavailable".to_string(),
                    message: "down".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(store.set_status(id, JobStatus::SynthesisStage).await.is_err());
    }

    #[tokio::test]
    async fn test_stage_results_are_first_write_wins() {
        let (store, id) = store_with_job().await;
        let mut first = stage_result(Stage::Cv);
        first.feedback = "original".to_string();
        let mut second = stage_result(Stage::Cv);
        second.feedback = "duplicate from re-run".to_string();

        store.record_stage_result(id, &first).await.unwrap();
        store.record_stage_result(id, &second).await.unwrap();

        let results = store.stage_results(id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].feedback, "original");
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_between_live_owners() {
        let (store, id) = store_with_job().await;
        let ttl = Duration::from_secs(600);
        assert!(store.try_acquire(id, "worker-0", ttl).await.unwrap());
        assert!(!store.try_acquire(id, "worker-1", ttl).await.unwrap());
        // Re-entrant for the same owner.
        assert!(store.try_acquire(id, "worker-0", ttl).await.unwrap());

        store.release(id, "worker-0").await.unwrap();
        assert!(store.try_acquire(id, "worker-1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_stolen() {
        let (store, id) = store_with_job().await;
        let ttl = Duration::from_millis(20);
        assert!(store.try_acquire(id, "worker-0", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The lease is past its TTL: treated as abandoned and stolen.
        assert!(store.try_acquire(id, "worker-1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_jobs_cannot_be_acquired() {
        let (store, id) = store_with_job().await;
        store
            .mark_failed(
                id,
                &JobError {
                    stage: Stage::Cv,
                    kind: "upstream_unavailable".to_string(),
                    message: "down".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(!store
            .try_acquire(id, "worker-0", Duration::from_secs(600))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_a_no_op() {
        let (store, id) = store_with_job().await;
        let ttl = Duration::from_secs(600);
        assert!(store.try_acquire(id, "worker-0", ttl).await.unwrap());
        store.release(id, "worker-1").await.unwrap();
        assert!(!store.try_acquire(id, "worker-1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_terminal_jobs_lists_oldest_first() {
        let store = InMemoryJobStore::new();
        let mut a = EvaluationJob::new(Uuid::new_v4(), Uuid::new_v4(), "A");
        let mut b = EvaluationJob::new(Uuid::new_v4(), Uuid::new_v4(), "B");
        a.created_at = Utc::now() - chrono::Duration::seconds(10);
        b.created_at = Utc::now();
        store.insert_job(&b).await.unwrap();
        store.insert_job(&a).await.unwrap();

        let mut done = EvaluationJob::new(Uuid::new_v4(), Uuid::new_v4(), "C");
        done.status = JobStatus::Completed;
        store.insert_job(&done).await.unwrap();

        assert_eq!(store.non_terminal_jobs().await.unwrap(), vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_mark_completed_stores_result_and_timestamps() {
        let (store, id) = store_with_job().await;
        store.set_status(id, JobStatus::CvStage).await.unwrap();
        let result = EvaluationResult {
            cv_match_rate: 0.77,
            cv_feedback: "solid".to_string(),
            project_score: 3.85,
            project_feedback: "good".to_string(),
            overall_summary: "hire".to_string(),
            cv_detailed_scores: serde_json::json!({}),
            project_detailed_scores: serde_json::json!({}),
            context_degraded: false,
        };
        store.mark_completed(id, &result).await.unwrap();

        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        let snapshot = store.snapshot(id).await.unwrap();
        assert_eq!(snapshot.result.unwrap().cv_match_rate, 0.77);
    }

    #[tokio::test]
    async fn test_document_store_not_found_and_reference_listing() {
        let store = InMemoryDocumentStore::new();
        assert!(matches!(
            store.get_document(Uuid::new_v4()).await.unwrap_err(),
            PipelineError::NotFound(_)
        ));

        store
            .insert(Document {
                id: Uuid::new_v4(),
                kind: crate::models::document::DocumentKind::CvRubric,
                filename: "rubric.pdf".to_string(),
                text: "criteria".to_string(),
                ingested_at: Utc::now(),
            })
            .await;
        store
            .insert(Document {
                id: Uuid::new_v4(),
                kind: crate::models::document::DocumentKind::Cv,
                filename: "cv.pdf".to_string(),
                text: "cv".to_string(),
                ingested_at: Utc::now(),
            })
            .await;

        let refs = store.reference_documents().await.unwrap();
        assert_eq!(refs.len(), 1);
        assert!(refs[0].kind.is_reference());
    }
}
