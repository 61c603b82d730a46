//! Postgres-backed stores. Plain `sqlx::query` with binds throughout; status
//! and kind columns are text and parsed back through the enum parsers.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::document::{Document, DocumentKind, ReferenceChunk};
use crate::models::job::{
    EvaluationJob, EvaluationResult, JobError, JobSnapshot, JobStatus, StageResult,
};
use crate::retrieval::{rank_chunks, ContextStore, ScoredChunk};
use crate::store::{DocumentStore, JobStore};

const CREATE_DOCUMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id          UUID PRIMARY KEY,
    kind        TEXT NOT NULL,
    filename    TEXT NOT NULL,
    text        TEXT NOT NULL,
    ingested_at TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_JOBS: &str = r#"
CREATE TABLE IF NOT EXISTS evaluation_jobs (
    id                  UUID PRIMARY KEY,
    cv_document_id      UUID NOT NULL,
    project_document_id UUID NOT NULL,
    job_title           TEXT NOT NULL,
    status              TEXT NOT NULL,
    result              JSONB,
    error               JSONB,
    lease_owner         TEXT,
    lease_acquired_at   TIMESTAMPTZ,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL,
    started_at          TIMESTAMPTZ,
    completed_at        TIMESTAMPTZ
)
"#;

const CREATE_STAGE_RESULTS: &str = r#"
CREATE TABLE IF NOT EXISTS stage_results (
    job_id       UUID NOT NULL,
    stage        TEXT NOT NULL,
    payload      JSONB NOT NULL,
    completed_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (job_id, stage)
)
"#;

const CREATE_REFERENCE_CHUNKS: &str = r#"
CREATE TABLE IF NOT EXISTS reference_chunks (
    document_id UUID NOT NULL,
    chunk_index INT NOT NULL,
    scope       TEXT NOT NULL,
    text        TEXT NOT NULL,
    PRIMARY KEY (document_id, chunk_index)
)
"#;

/// Creates all tables if they do not exist. Idempotent; run once at startup.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), PipelineError> {
    for ddl in [
        CREATE_DOCUMENTS,
        CREATE_JOBS,
        CREATE_STAGE_RESULTS,
        CREATE_REFERENCE_CHUNKS,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

fn parse_kind(s: &str) -> Result<DocumentKind, PipelineError> {
    DocumentKind::parse(s)
        .ok_or_else(|| PipelineError::Internal(anyhow::anyhow!("unknown document kind: {s}")))
}

fn parse_status(s: &str) -> Result<JobStatus, PipelineError> {
    JobStatus::parse(s)
        .ok_or_else(|| PipelineError::Internal(anyhow::anyhow!("unknown job status: {s}")))
}

fn document_from_row(row: &PgRow) -> Result<Document, PipelineError> {
    let kind: String = row.try_get("kind")?;
    Ok(Document {
        id: row.try_get("id")?,
        kind: parse_kind(&kind)?,
        filename: row.try_get("filename")?,
        text: row.try_get("text")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<EvaluationJob, PipelineError> {
    let status: String = row.try_get("status")?;
    Ok(EvaluationJob {
        id: row.try_get("id")?,
        cv_document_id: row.try_get("cv_document_id")?,
        project_document_id: row.try_get("project_document_id")?,
        job_title: row.try_get("job_title")?,
        status: parse_status(&status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, doc: &Document) -> Result<(), PipelineError> {
        sqlx::query(
            "INSERT INTO documents (id, kind, filename, text, ingested_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(doc.id)
        .bind(doc.kind.as_str())
        .bind(&doc.filename)
        .bind(&doc.text)
        .bind(doc.ingested_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get_document(&self, id: Uuid) -> Result<Document, PipelineError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("document {id}")))?;
        document_from_row(&row)
    }

    async fn reference_documents(&self) -> Result<Vec<Document>, PipelineError> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE kind NOT IN ('cv', 'project_report')
             ORDER BY ingested_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }
}

/// Persisted chunk corpus with the same keyword ranking as the in-memory
/// store. Rows are written once at ingestion and read-only afterward, so
/// the corpus survives restarts without re-chunking.
#[derive(Clone)]
pub struct PgContextStore {
    pool: PgPool,
}

impl PgContextStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContextStore for PgContextStore {
    async fn search(
        &self,
        query: &str,
        scopes: &[DocumentKind],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        let scope_tags: Vec<String> = scopes.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(
            "SELECT document_id, chunk_index, scope, text FROM reference_chunks
             WHERE scope = ANY($1)",
        )
        .bind(&scope_tags)
        .fetch_all(&self.pool)
        .await?;

        let mut chunks = Vec::with_capacity(rows.len());
        for row in rows {
            let scope: String = row.try_get("scope")?;
            chunks.push(ReferenceChunk {
                document_id: row.try_get("document_id")?,
                chunk_index: row.try_get("chunk_index")?,
                scope: parse_kind(&scope)?,
                text: row.try_get("text")?,
            });
        }
        Ok(rank_chunks(query, chunks, k))
    }

    async fn add_chunks(&self, chunks: Vec<ReferenceChunk>) -> Result<(), PipelineError> {
        // Startup re-ingestion of an already-chunked document is a no-op.
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO reference_chunks (document_id, chunk_index, scope, text)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (document_id, chunk_index) DO NOTHING",
            )
            .bind(chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(chunk.scope.as_str())
            .bind(&chunk.text)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, job: &EvaluationJob) -> Result<(), PipelineError> {
        sqlx::query(
            "INSERT INTO evaluation_jobs
             (id, cv_document_id, project_document_id, job_title, status,
              created_at, updated_at, started_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(job.id)
        .bind(job.cv_document_id)
        .bind(job.project_document_id)
        .bind(&job.job_title)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<EvaluationJob, PipelineError> {
        let row = sqlx::query("SELECT * FROM evaluation_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        job_from_row(&row)
    }

    async fn snapshot(&self, id: Uuid) -> Result<JobSnapshot, PipelineError> {
        let row = sqlx::query("SELECT status, result, error FROM evaluation_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        let status: String = row.try_get("status")?;
        let result: Option<serde_json::Value> = row.try_get("result")?;
        let error: Option<serde_json::Value> = row.try_get("error")?;
        Ok(JobSnapshot {
            status: parse_status(&status)?,
            result: result
                .map(serde_json::from_value::<EvaluationResult>)
                .transpose()
                .map_err(|e| PipelineError::Internal(e.into()))?,
            error: error
                .map(serde_json::from_value::<JobError>)
                .transpose()
                .map_err(|e| PipelineError::Internal(e.into()))?,
            stage_results: self.stage_results(id).await?,
        })
    }

    async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status FROM evaluation_jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        let current = parse_status(&row.try_get::<String, _>("status")?)?;
        if current.is_terminal() {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "job {id} is terminal ({current}), cannot move to {status}"
            )));
        }
        if status.rank() < current.rank() {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "job {id} status would regress: {current} -> {status}"
            )));
        }
        sqlx::query(
            "UPDATE evaluation_jobs
             SET status = $2,
                 updated_at = now(),
                 started_at = CASE WHEN started_at IS NULL THEN now() ELSE started_at END
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_stage_result(
        &self,
        id: Uuid,
        result: &StageResult,
    ) -> Result<(), PipelineError> {
        let payload =
            serde_json::to_value(result).map_err(|e| PipelineError::Internal(e.into()))?;
        // First write wins: a resumed run never overwrites a committed stage.
        sqlx::query(
            "INSERT INTO stage_results (job_id, stage, payload, completed_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (job_id, stage) DO NOTHING",
        )
        .bind(id)
        .bind(result.stage.as_str())
        .bind(payload)
        .bind(result.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stage_results(&self, id: Uuid) -> Result<Vec<StageResult>, PipelineError> {
        let rows = sqlx::query("SELECT payload FROM stage_results WHERE job_id = $1")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: serde_json::Value = row.try_get("payload")?;
            let result: StageResult =
                serde_json::from_value(payload).map_err(|e| PipelineError::Internal(e.into()))?;
            results.push(result);
        }
        results.sort_by_key(|r| r.stage);
        Ok(results)
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        result: &EvaluationResult,
    ) -> Result<(), PipelineError> {
        let payload =
            serde_json::to_value(result).map_err(|e| PipelineError::Internal(e.into()))?;
        sqlx::query(
            "UPDATE evaluation_jobs
             SET status = 'completed', result = $2, updated_at = now(), completed_at = now()
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &JobError) -> Result<(), PipelineError> {
        let payload = serde_json::to_value(error).map_err(|e| PipelineError::Internal(e.into()))?;
        sqlx::query(
            "UPDATE evaluation_jobs
             SET status = 'failed', error = $2, updated_at = now(), completed_at = now()
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_acquire(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, PipelineError> {
        // Single conditional UPDATE: the row lock makes acquisition atomic
        // across workers and processes.
        let outcome = sqlx::query(
            "UPDATE evaluation_jobs
             SET lease_owner = $2, lease_acquired_at = now()
             WHERE id = $1
               AND status NOT IN ('completed', 'failed')
               AND (lease_owner IS NULL
                    OR lease_owner = $2
                    OR lease_acquired_at < now() - make_interval(secs => $3))",
        )
        .bind(id)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn release(&self, id: Uuid, owner: &str) -> Result<(), PipelineError> {
        sqlx::query(
            "UPDATE evaluation_jobs
             SET lease_owner = NULL, lease_acquired_at = NULL
             WHERE id = $1 AND lease_owner = $2",
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn non_terminal_jobs(&self) -> Result<Vec<Uuid>, PipelineError> {
        let rows = sqlx::query(
            "SELECT id FROM evaluation_jobs
             WHERE status NOT IN ('completed', 'failed')
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get::<Uuid, _>("id")?);
        }
        Ok(ids)
    }
}
