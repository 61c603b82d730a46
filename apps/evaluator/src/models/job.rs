use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One ordered step of the evaluation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Cv,
    Project,
    Synthesis,
}

impl Stage {
    /// Execution order. Stages within one job always run in this sequence.
    pub const ALL: [Stage; 3] = [Stage::Cv, Stage::Project, Stage::Synthesis];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Cv => "cv",
            Stage::Project => "project",
            Stage::Synthesis => "synthesis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cv" => Some(Stage::Cv),
            "project" => Some(Stage::Project),
            "synthesis" => Some(Stage::Synthesis),
            _ => None,
        }
    }

    /// The in-progress job status while this stage runs.
    pub fn status(&self) -> JobStatus {
        match self {
            Stage::Cv => JobStatus::CvStage,
            Stage::Project => JobStatus::ProjectStage,
            Stage::Synthesis => JobStatus::SynthesisStage,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public job status. Transitions are monotonic: a poller never observes a
/// later status followed by an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    CvStage,
    ProjectStage,
    SynthesisStage,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::CvStage => "cv_stage",
            JobStatus::ProjectStage => "project_stage",
            JobStatus::SynthesisStage => "synthesis_stage",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "cv_stage" => Some(JobStatus::CvStage),
            "project_stage" => Some(JobStatus::ProjectStage),
            "synthesis_stage" => Some(JobStatus::SynthesisStage),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Position in the monotonic stage order. `Failed` is reachable from any
    /// non-terminal state, so it ranks above everything.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::CvStage => 1,
            JobStatus::ProjectStage => 2,
            JobStatus::SynthesisStage => 3,
            JobStatus::Completed => 4,
            JobStatus::Failed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work. Mutated only by the single worker holding its lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationJob {
    pub id: Uuid,
    pub cv_document_id: Uuid,
    pub project_document_id: Uuid,
    pub job_title: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EvaluationJob {
    pub fn new(cv_document_id: Uuid, project_document_id: Uuid, job_title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            cv_document_id,
            project_document_id,
            job_title: job_title.to_string(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// A single criterion judgment from the model. The numeric aggregate is
/// always recomputed server-side from these, never taken from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionScore {
    pub score: f64,
    pub reasoning: String,
}

/// Typed per-stage output, persisted as soon as the stage validates.
/// Stage n+1 reads committed StageResults only, never drafts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    /// Per-criterion scores. Empty for the synthesis stage.
    pub scores: BTreeMap<String, CriterionScore>,
    /// Weighted aggregate on the stage's declared range (cv: 0.0-1.0,
    /// project: 1.0-5.0). None for synthesis.
    pub aggregate: Option<f64>,
    pub feedback: String,
    /// True when the stage ran on rubric-only context because retrieval was
    /// unavailable. Flag only; the aggregate is never discounted for it.
    pub context_degraded: bool,
    pub completed_at: DateTime<Utc>,
}

/// Terminal failure detail attached to a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub stage: Stage,
    pub kind: String,
    pub message: String,
}

/// The result payload returned once a job completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub cv_match_rate: f64,
    pub cv_feedback: String,
    pub project_score: f64,
    pub project_feedback: String,
    pub overall_summary: String,
    pub cv_detailed_scores: Value,
    pub project_detailed_scores: Value,
    pub context_degraded: bool,
}

/// Snapshot of whatever is persisted for a job at call time. Never blocks.
/// The final result object appears once completed; `stage_results` carries
/// whatever stages have committed, so a failed job still exposes its
/// partial credit.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EvaluationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stage_results: Vec<StageResult>,
}
