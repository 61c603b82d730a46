use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a document is. Candidate documents (cv, project_report) are evaluated;
/// the remaining kinds are the reference corpus and double as retrieval scope
/// tags for the context store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Cv,
    ProjectReport,
    JobDescription,
    CaseStudyBrief,
    CvRubric,
    ProjectRubric,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Cv => "cv",
            DocumentKind::ProjectReport => "project_report",
            DocumentKind::JobDescription => "job_description",
            DocumentKind::CaseStudyBrief => "case_study_brief",
            DocumentKind::CvRubric => "cv_rubric",
            DocumentKind::ProjectRubric => "project_rubric",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cv" => Some(DocumentKind::Cv),
            "project_report" => Some(DocumentKind::ProjectReport),
            "job_description" => Some(DocumentKind::JobDescription),
            "case_study_brief" => Some(DocumentKind::CaseStudyBrief),
            "cv_rubric" => Some(DocumentKind::CvRubric),
            "project_rubric" => Some(DocumentKind::ProjectRubric),
            _ => None,
        }
    }

    /// Reference documents feed the context store; candidate documents do not.
    pub fn is_reference(&self) -> bool {
        !matches!(self, DocumentKind::Cv | DocumentKind::ProjectReport)
    }
}

/// An ingested artifact. Immutable once stored; jobs reference documents by
/// id and never own them. Text extraction happens upstream of this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub kind: DocumentKind,
    pub filename: String,
    pub text: String,
    pub ingested_at: DateTime<Utc>,
}

/// A fragment of a reference document, created once at ingestion time and
/// read-only afterward. The embedding itself lives behind the context-store
/// boundary; this is the row the pipeline sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceChunk {
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub scope: DocumentKind,
    pub text: String,
}
