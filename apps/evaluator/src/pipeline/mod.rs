//! Evaluation Pipeline — the chained three-stage state machine that turns a
//! queued job into a final result.
//!
//! Stage order is fixed: cv, project, synthesis. Each stage commits its
//! typed result before the next stage starts, and the next stage reads
//! committed results only. A failed stage marks the job failed with the
//! stage name and error kind; committed results from earlier stages are
//! kept for resumption.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::llm_client::{prompts, GenerativeClient, RetryPolicy};
use crate::models::document::{Document, DocumentKind};
use crate::models::job::{
    CriterionScore, EvaluationJob, EvaluationResult, JobError, Stage, StageResult,
};
use crate::retrieval::{ContextBlock, RetrievalAssembler};
use crate::rubric::{RubricRegistry, ScoringRubric, MAX_CRITERION_SCORE, MIN_CRITERION_SCORE};
use crate::store::{DocumentStore, JobStore};

/// Model output shape for the two scored stages.
#[derive(Debug, Deserialize)]
struct ScoredEvaluation {
    scores: BTreeMap<String, CriterionScore>,
    feedback: String,
}

/// Model output shape for the synthesis stage.
#[derive(Debug, Deserialize)]
struct SynthesisOutput {
    overall_summary: String,
}

fn validate_scored(evaluation: &ScoredEvaluation, rubric: &ScoringRubric) -> Result<(), String> {
    for criterion in &rubric.criteria {
        let entry = evaluation
            .scores
            .get(&criterion.name)
            .ok_or_else(|| format!("missing score for criterion '{}'", criterion.name))?;
        if entry.score < MIN_CRITERION_SCORE || entry.score > MAX_CRITERION_SCORE {
            return Err(format!(
                "score {} for '{}' outside {MIN_CRITERION_SCORE}-{MAX_CRITERION_SCORE}",
                entry.score, criterion.name
            ));
        }
    }
    if evaluation.scores.len() != rubric.criteria.len() {
        return Err(format!(
            "expected {} criteria, got {}",
            rubric.criteria.len(),
            evaluation.scores.len()
        ));
    }
    if evaluation.feedback.trim().is_empty() {
        return Err("empty feedback".to_string());
    }
    Ok(())
}

/// Runs one job from its current checkpoint to a terminal state.
pub struct EvaluationPipeline {
    jobs: Arc<dyn JobStore>,
    documents: Arc<dyn DocumentStore>,
    assembler: RetrievalAssembler,
    client: GenerativeClient,
    rubrics: Arc<RubricRegistry>,
    retrieval_retry: RetryPolicy,
}

impl EvaluationPipeline {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        documents: Arc<dyn DocumentStore>,
        assembler: RetrievalAssembler,
        client: GenerativeClient,
        rubrics: Arc<RubricRegistry>,
    ) -> Self {
        Self {
            jobs,
            documents,
            assembler,
            client,
            rubrics,
            retrieval_retry: RetryPolicy::default(),
        }
    }

    pub fn with_retrieval_retry(mut self, retry: RetryPolicy) -> Self {
        self.retrieval_retry = retry;
        self
    }

    /// Executes remaining stages for `job_id` and commits the final result.
    ///
    /// Already-committed stage results are skipped, so re-running a job that
    /// crashed mid-pipeline resumes from its last checkpoint instead of
    /// repaying completed model calls.
    pub async fn run(&self, job_id: Uuid) -> Result<(), PipelineError> {
        let job = self.jobs.get_job(job_id).await?;
        if job.status.is_terminal() {
            debug!(%job_id, status = %job.status, "job already terminal, nothing to do");
            return Ok(());
        }

        let mut committed: BTreeMap<Stage, StageResult> = self
            .jobs
            .stage_results(job_id)
            .await?
            .into_iter()
            .map(|r| (r.stage, r))
            .collect();

        for stage in Stage::ALL {
            if committed.contains_key(&stage) {
                info!(%job_id, stage = stage.as_str(), "stage already committed, resuming past it");
                continue;
            }

            self.jobs.set_status(job_id, stage.status()).await?;
            info!(%job_id, stage = stage.as_str(), "stage started");

            let outcome = match stage {
                Stage::Cv => self.cv_stage(&job).await,
                Stage::Project => self.project_stage(&job).await,
                Stage::Synthesis => self.synthesis_stage(&job, &committed).await,
            };

            match outcome {
                Ok(result) => {
                    self.jobs.record_stage_result(job_id, &result).await?;
                    info!(
                        %job_id,
                        stage = stage.as_str(),
                        aggregate = result.aggregate,
                        degraded = result.context_degraded,
                        "stage committed"
                    );
                    committed.insert(stage, result);
                }
                Err(e) => {
                    let error = JobError {
                        stage,
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    };
                    warn!(%job_id, stage = stage.as_str(), kind = %error.kind, error = %e, "stage failed");
                    self.jobs.mark_failed(job_id, &error).await?;
                    return Err(PipelineError::EvaluationStageFailed {
                        stage,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let result = self.assemble_result(&committed)?;
        self.jobs.mark_completed(job_id, &result).await?;
        info!(
            %job_id,
            cv_match_rate = result.cv_match_rate,
            project_score = result.project_score,
            degraded = result.context_degraded,
            "job completed"
        );
        Ok(())
    }

    fn assemble_result(
        &self,
        committed: &BTreeMap<Stage, StageResult>,
    ) -> Result<EvaluationResult, PipelineError> {
        let cv = committed_stage(committed, Stage::Cv)?;
        let project = committed_stage(committed, Stage::Project)?;
        let synthesis = committed_stage(committed, Stage::Synthesis)?;
        Ok(EvaluationResult {
            cv_match_rate: stage_aggregate(cv)?,
            cv_feedback: cv.feedback.clone(),
            project_score: stage_aggregate(project)?,
            project_feedback: project.feedback.clone(),
            overall_summary: synthesis.feedback.clone(),
            cv_detailed_scores: serde_json::to_value(&cv.scores)
                .map_err(|e| PipelineError::Internal(e.into()))?,
            project_detailed_scores: serde_json::to_value(&project.scores)
                .map_err(|e| PipelineError::Internal(e.into()))?,
            context_degraded: cv.context_degraded || project.context_degraded,
        })
    }

    async fn cv_stage(&self, job: &EvaluationJob) -> Result<StageResult, PipelineError> {
        let rubric = self.rubric(&job.job_title, Stage::Cv)?;
        let cv = self.fetch_candidate(job.cv_document_id, DocumentKind::Cv).await?;

        let query = format!(
            "job requirements and scoring criteria for {}",
            job.job_title
        );
        let context = self
            .retrieve_or_degrade(
                &query,
                &[DocumentKind::JobDescription, DocumentKind::CvRubric],
                rubric,
            )
            .await;

        let prompt = prompts::CV_PROMPT_TEMPLATE
            .replace("{job_title}", &job.job_title)
            .replace("{context}", &context.text)
            .replace("{cv_text}", &cv.text)
            .replace("{score_schema}", &rubric.schema_block())
            .replace("{criteria}", &rubric.criteria_block());

        let evaluation: ScoredEvaluation = self
            .client
            .generate(prompts::CV_SYSTEM, &prompt, |e: &ScoredEvaluation| {
                validate_scored(e, rubric)
            })
            .await?;

        // Aggregation is server-side and deterministic: the weighted sum on
        // the 1-5 scale, normalized to a 0-1 match rate.
        let weighted = rubric.weighted_score(&evaluation.scores)?;
        let match_rate = (weighted / MAX_CRITERION_SCORE).clamp(0.0, 1.0);

        Ok(StageResult {
            stage: Stage::Cv,
            scores: evaluation.scores,
            aggregate: Some(match_rate),
            feedback: evaluation.feedback,
            context_degraded: context.degraded,
            completed_at: Utc::now(),
        })
    }

    async fn project_stage(&self, job: &EvaluationJob) -> Result<StageResult, PipelineError> {
        let rubric = self.rubric(&job.job_title, Stage::Project)?;
        let report = self
            .fetch_candidate(job.project_document_id, DocumentKind::ProjectReport)
            .await?;

        let context = self
            .retrieve_or_degrade(
                "case study requirements and evaluation criteria",
                &[DocumentKind::CaseStudyBrief, DocumentKind::ProjectRubric],
                rubric,
            )
            .await;

        let prompt = prompts::PROJECT_PROMPT_TEMPLATE
            .replace("{context}", &context.text)
            .replace("{project_text}", &report.text)
            .replace("{score_schema}", &rubric.schema_block())
            .replace("{criteria}", &rubric.criteria_block());

        let evaluation: ScoredEvaluation = self
            .client
            .generate(prompts::PROJECT_SYSTEM, &prompt, |e: &ScoredEvaluation| {
                validate_scored(e, rubric)
            })
            .await?;

        // The project aggregate stays on the rubric's native 1-5 scale.
        let weighted = rubric
            .weighted_score(&evaluation.scores)?
            .clamp(MIN_CRITERION_SCORE, MAX_CRITERION_SCORE);

        Ok(StageResult {
            stage: Stage::Project,
            scores: evaluation.scores,
            aggregate: Some(weighted),
            feedback: evaluation.feedback,
            context_degraded: context.degraded,
            completed_at: Utc::now(),
        })
    }

    async fn synthesis_stage(
        &self,
        job: &EvaluationJob,
        committed: &BTreeMap<Stage, StageResult>,
    ) -> Result<StageResult, PipelineError> {
        let cv = committed_stage(committed, Stage::Cv)?;
        let project = committed_stage(committed, Stage::Project)?;
        let cv_match_rate = stage_aggregate(cv)?;
        let project_score = stage_aggregate(project)?;

        let prompt = prompts::SYNTHESIS_PROMPT_TEMPLATE
            .replace("{job_title}", &job.job_title)
            .replace("{cv_match_rate}", &format!("{cv_match_rate:.2}"))
            .replace("{cv_feedback}", &cv.feedback)
            .replace("{project_score}", &format!("{project_score:.1}"))
            .replace("{project_feedback}", &project.feedback);

        let output: SynthesisOutput = self
            .client
            .generate(prompts::SYNTHESIS_SYSTEM, &prompt, |o: &SynthesisOutput| {
                if o.overall_summary.trim().is_empty() {
                    Err("empty overall_summary".to_string())
                } else {
                    Ok(())
                }
            })
            .await?;

        Ok(StageResult {
            stage: Stage::Synthesis,
            scores: BTreeMap::new(),
            aggregate: None,
            feedback: output.overall_summary,
            context_degraded: false,
            completed_at: Utc::now(),
        })
    }

    fn rubric(&self, job_title: &str, stage: Stage) -> Result<&ScoringRubric, PipelineError> {
        self.rubrics
            .load(job_title, stage)
            .ok_or_else(|| PipelineError::Internal(anyhow!("no rubric for stage {stage}")))
    }

    /// Loads a candidate document, re-checking its kind: the job may have
    /// been submitted against ids whose documents changed since validation.
    async fn fetch_candidate(
        &self,
        id: Uuid,
        expected: DocumentKind,
    ) -> Result<Document, PipelineError> {
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
        Ok(doc)
    }

    /// Retrieval with graceful degradation: transient store failures are
    /// retried with backoff, and after exhaustion (or an empty corpus) the
    /// stage proceeds on rubric-only context with the degraded flag set.
    /// Degradation never fails the stage and never discounts its score.
    async fn retrieve_or_degrade(
        &self,
        query: &str,
        scopes: &[DocumentKind],
        rubric: &ScoringRubric,
    ) -> ContextBlock {
        for attempt in 1..=self.retrieval_retry.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retrieval_retry.delay(attempt - 1)).await;
            }
            match self.assembler.retrieve(query, scopes).await {
                Ok(block) if block.chunk_count > 0 => return block,
                Ok(_) => {
                    // No matching chunks is deterministic; retrying won't help.
                    warn!(query, "no reference chunks matched, using rubric-only context");
                    break;
                }
                Err(e) => {
                    warn!(attempt, query, error = %e, "retrieval attempt failed");
                }
            }
        }
        ContextBlock::degraded(rubric.criteria_block())
    }
}

fn committed_stage<'a>(
    committed: &'a BTreeMap<Stage, StageResult>,
    stage: Stage,
) -> Result<&'a StageResult, PipelineError> {
    committed
        .get(&stage)
        .ok_or_else(|| PipelineError::Internal(anyhow!("missing committed {stage} stage result")))
}

fn stage_aggregate(result: &StageResult) -> Result<f64, PipelineError> {
    result.aggregate.ok_or_else(|| {
        PipelineError::Internal(anyhow!(
            "{} stage result has no aggregate",
            result.stage
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::llm_client::{BackendError, CompletionBackend};
    use crate::models::job::JobStatus;
    use crate::retrieval::{
        ingest_reference_documents, ContextStore, InMemoryContextStore, ScoredChunk,
        DEFAULT_CONTEXT_BUDGET, DEFAULT_TOP_K,
    };
    use crate::store::memory::{InMemoryDocumentStore, InMemoryJobStore};

    use super::*;

    /// Backend scripted with a fixed response sequence; records prompts.
    struct ScriptBackend {
        script: Mutex<VecDeque<Result<String, BackendError>>>,
        calls: AtomicU32,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptBackend {
        fn new(script: Vec<Result<String, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn prompt(&self, index: usize) -> String {
            self.prompts.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptBackend {
        async fn complete(
            &self,
            _system: &str,
            prompt: &str,
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Transient("script exhausted".to_string())))
        }
    }

    use crate::models::document::ReferenceChunk;

    /// A context store whose index is down.
    struct DownContextStore;

    #[async_trait]
    impl ContextStore for DownContextStore {
        async fn search(
            &self,
            _query: &str,
            _scopes: &[DocumentKind],
            _k: usize,
        ) -> Result<Vec<ScoredChunk>, PipelineError> {
            Err(PipelineError::RetrievalUnavailable("index offline".to_string()))
        }

        async fn add_chunks(&self, _chunks: Vec<ReferenceChunk>) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    fn document(kind: DocumentKind, text: &str) -> Document {
        Document {
            id: Uuid::new_v4(),
            kind,
            filename: format!("{}.pdf", kind.as_str()),
            text: text.to_string(),
            ingested_at: Utc::now(),
        }
    }

    fn cv_response(t: f64, e: f64, a: f64, c: f64) -> String {
        format!(
            r#"{{"scores": {{
                "technical_skills_match": {{"score": {t}, "reasoning": "stack alignment"}},
                "experience_level": {{"score": {e}, "reasoning": "years and depth"}},
                "relevant_achievements": {{"score": {a}, "reasoning": "measurable impact"}},
                "cultural_fit": {{"score": {c}, "reasoning": "collaboration signals"}}
            }}, "feedback": "Solid backend profile with growing AI exposure."}}"#
        )
    }

    fn project_response(co: f64, q: f64, r: f64, d: f64, cr: f64) -> String {
        format!(
            r#"{{"scores": {{
                "correctness": {{"score": {co}, "reasoning": "meets the brief"}},
                "code_quality": {{"score": {q}, "reasoning": "modular and tested"}},
                "resilience": {{"score": {r}, "reasoning": "error handling coverage"}},
                "documentation": {{"score": {d}, "reasoning": "clear setup notes"}},
                "creativity": {{"score": {cr}, "reasoning": "extras beyond the brief"}}
            }}, "feedback": "Working pipeline; resilience could go further."}}"#
        )
    }

    fn synthesis_response(summary: &str) -> String {
        format!(r#"{{"overall_summary": "{summary}"}}"#)
    }

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        backend: Arc<ScriptBackend>,
        pipeline: EvaluationPipeline,
        job_id: Uuid,
    }

    async fn fixture_with_store(
        script: Vec<Result<String, BackendError>>,
        context_store: Arc<dyn ContextStore>,
    ) -> Fixture {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let cv = document(DocumentKind::Cv, "Five years of Rust and Python backend work.");
        let report = document(
            DocumentKind::ProjectReport,
            "Built an async evaluation service with retries and RAG context.",
        );
        let references = vec![
            document(
                DocumentKind::JobDescription,
                "Backend Engineer: Rust, SQL, LLM chaining, retrieval pipelines.",
            ),
            document(
                DocumentKind::CvRubric,
                "Scoring criteria: technical skills, experience, achievements, fit.",
            ),
            document(
                DocumentKind::CaseStudyBrief,
                "Case study requirements: asynchronous evaluation pipeline with retries.",
            ),
            document(
                DocumentKind::ProjectRubric,
                "Evaluation criteria: correctness, quality, resilience, docs, creativity.",
            ),
        ];
        let job = EvaluationJob::new(cv.id, report.id, "Backend Engineer");
        let job_id = job.id;

        documents.insert(cv).await;
        documents.insert(report).await;
        ingest_reference_documents(context_store.as_ref(), &references)
            .await
            .unwrap();

        let jobs = Arc::new(InMemoryJobStore::new());
        jobs.insert_job(&job).await.unwrap();

        let backend = ScriptBackend::new(script);
        let pipeline = EvaluationPipeline::new(
            jobs.clone(),
            documents,
            RetrievalAssembler::new(context_store, DEFAULT_TOP_K, DEFAULT_CONTEXT_BUDGET),
            GenerativeClient::new(backend.clone(), RetryPolicy::default()),
            Arc::new(RubricRegistry::builtin()),
        );

        Fixture {
            jobs,
            backend,
            pipeline,
            job_id,
        }
    }

    async fn fixture(script: Vec<Result<String, BackendError>>) -> Fixture {
        fixture_with_store(script, Arc::new(InMemoryContextStore::new())).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_completes_with_deterministic_aggregates() {
        let f = fixture(vec![
            Ok(cv_response(4.0, 4.0, 4.0, 3.0)),
            Ok(project_response(4.0, 4.0, 4.0, 3.0, 4.0)),
            Ok(synthesis_response("Strong candidate; recommend onsite.")),
        ])
        .await;

        f.pipeline.run(f.job_id).await.unwrap();

        let snapshot = f.jobs.snapshot(f.job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        let result = snapshot.result.unwrap();
        // [4,4,4,3] . [0.4,0.25,0.2,0.15] = 3.85 -> 0.77
        assert!((result.cv_match_rate - 0.77).abs() < 1e-9, "{}", result.cv_match_rate);
        // [4,4,4,3,4] . [0.3,0.25,0.2,0.15,0.1] = 3.85
        assert!((result.project_score - 3.85).abs() < 1e-9, "{}", result.project_score);
        assert_eq!(result.overall_summary, "Strong candidate; recommend onsite.");
        assert!(!result.context_degraded);
        assert!(result.cv_detailed_scores.get("technical_skills_match").is_some());
        assert!(result.project_detailed_scores.get("resilience").is_some());
        assert_eq!(f.backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompts_carry_retrieved_context_and_rubric() {
        let f = fixture(vec![
            Ok(cv_response(4.0, 4.0, 4.0, 3.0)),
            Ok(project_response(4.0, 4.0, 4.0, 3.0, 4.0)),
            Ok(synthesis_response("Hire.")),
        ])
        .await;

        f.pipeline.run(f.job_id).await.unwrap();

        let cv_prompt = f.backend.prompt(0);
        assert!(cv_prompt.contains("[job_description]:"));
        assert!(cv_prompt.contains("technical_skills_match (40% weight)"));
        assert!(cv_prompt.contains("Five years of Rust"));
        let project_prompt = f.backend.prompt(1);
        assert!(project_prompt.contains("[case_study_brief]:"));
        assert!(project_prompt.contains("correctness (30% weight)"));
        let synthesis_prompt = f.backend.prompt(2);
        assert!(synthesis_prompt.contains("Match Rate: 0.77"));
        assert!(synthesis_prompt.contains("Score: 3.9/5.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_pipeline_failure_keeps_earlier_stage_results() {
        // CV succeeds, then the upstream goes down for good.
        let f = fixture(vec![Ok(cv_response(4.0, 4.0, 4.0, 3.0))]).await;

        let err = f.pipeline.run(f.job_id).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::EvaluationStageFailed {
                stage: Stage::Project,
                kind: "upstream_unavailable",
                ..
            }
        ));

        let snapshot = f.jobs.snapshot(f.job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        let error = snapshot.error.unwrap();
        assert_eq!(error.stage, Stage::Project);
        assert_eq!(error.kind, "upstream_unavailable");

        // Partial credit survives and is visible to pollers.
        assert_eq!(snapshot.stage_results.len(), 1);
        assert_eq!(snapshot.stage_results[0].stage, Stage::Cv);
        let results = f.jobs.stage_results(f.job_id).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_resumes_from_committed_stages() {
        // Only the project and synthesis responses are scripted: the cv
        // result is already committed, so it must not trigger a model call.
        let f = fixture(vec![
            Ok(project_response(4.0, 4.0, 4.0, 3.0, 4.0)),
            Ok(synthesis_response("Proceed.")),
        ])
        .await;

        let cv_result = StageResult {
            stage: Stage::Cv,
            scores: BTreeMap::new(),
            aggregate: Some(0.72),
            feedback: "committed before the crash".to_string(),
            context_degraded: false,
            completed_at: Utc::now(),
        };
        f.jobs.record_stage_result(f.job_id, &cv_result).await.unwrap();
        f.jobs.set_status(f.job_id, JobStatus::CvStage).await.unwrap();

        f.pipeline.run(f.job_id).await.unwrap();

        assert_eq!(f.backend.calls(), 2);
        let result = f.jobs.snapshot(f.job_id).await.unwrap().result.unwrap();
        assert!((result.cv_match_rate - 0.72).abs() < 1e-9);
        assert_eq!(result.cv_feedback, "committed before the crash");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrieval_outage_degrades_instead_of_failing() {
        let f = fixture_with_store(
            vec![
                Ok(cv_response(4.0, 4.0, 4.0, 3.0)),
                Ok(project_response(4.0, 4.0, 4.0, 3.0, 4.0)),
                Ok(synthesis_response("Fine despite the outage.")),
            ],
            Arc::new(DownContextStore),
        )
        .await;

        f.pipeline.run(f.job_id).await.unwrap();

        let result = f.jobs.snapshot(f.job_id).await.unwrap().result.unwrap();
        assert!(result.context_degraded);
        // Scores are never discounted for degraded context.
        assert!((result.cv_match_rate - 0.77).abs() < 1e-9);
        // The rubric stands in for the missing context.
        let cv_prompt = f.backend.prompt(0);
        assert!(cv_prompt.contains("technical_skills_match (40% weight)"));
        assert!(!cv_prompt.contains("[job_description]:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistently_malformed_output_fails_the_job_as_malformed() {
        let f = fixture(vec![
            Ok("not json".to_string()),
            Ok("still not json".to_string()),
            Ok("{\"scores\": {}}".to_string()),
        ])
        .await;

        let err = f.pipeline.run(f.job_id).await.unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
        let error = f.jobs.snapshot(f.job_id).await.unwrap().error.unwrap();
        assert_eq!(error.stage, Stage::Cv);
        assert_eq!(error.kind, "malformed_response");
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_scores_are_retried_then_accepted() {
        let f = fixture(vec![
            Ok(cv_response(9.0, 4.0, 4.0, 3.0)),
            Ok(cv_response(4.0, 4.0, 4.0, 3.0)),
            Ok(project_response(4.0, 4.0, 4.0, 3.0, 4.0)),
            Ok(synthesis_response("Good.")),
        ])
        .await;

        f.pipeline.run(f.job_id).await.unwrap();
        assert_eq!(f.backend.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_document_kind_fails_as_invalid_reference() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        // Both ids point at the same project report; the cv slot is wrong.
        let report = document(DocumentKind::ProjectReport, "report text");
        let job = EvaluationJob::new(report.id, report.id, "Backend Engineer");
        let job_id = job.id;
        documents.insert(report).await;

        let jobs = Arc::new(InMemoryJobStore::new());
        jobs.insert_job(&job).await.unwrap();

        let backend = ScriptBackend::new(vec![]);
        let pipeline = EvaluationPipeline::new(
            jobs.clone(),
            documents,
            RetrievalAssembler::new(
                Arc::new(InMemoryContextStore::new()),
                DEFAULT_TOP_K,
                DEFAULT_CONTEXT_BUDGET,
            ),
            GenerativeClient::new(backend, RetryPolicy::default()),
            Arc::new(RubricRegistry::builtin()),
        );

        let err = pipeline.run(job_id).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_reference");
        let error = jobs.snapshot(job_id).await.unwrap().error.unwrap();
        assert_eq!(error.stage, Stage::Cv);
        assert_eq!(error.kind, "invalid_reference");
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_job_is_not_rerun() {
        let f = fixture(vec![Ok(cv_response(4.0, 4.0, 4.0, 3.0))]).await;
        f.jobs
            .mark_failed(
                f.job_id,
                &JobError {
                    stage: Stage::Cv,
                    kind: "upstream_unavailable".to_string(),
                    message: "down".to_string(),
                },
            )
            .await
            .unwrap();

        f.pipeline.run(f.job_id).await.unwrap();
        assert_eq!(f.backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_screening_scenario_end_to_end() {
        // A middling-but-promising candidate: decent skills, spotty
        // resilience story in the project.
        let f = fixture(vec![
            Ok(cv_response(3.0, 4.0, 3.0, 4.0)),
            Ok(project_response(4.0, 4.0, 2.0, 4.0, 4.0)),
            Ok(synthesis_response(
                "Good AI/backend foundations; the submission lacks retry hardening. \
                 Recommend a focused follow-up on resilience before advancing.",
            )),
        ])
        .await;

        f.pipeline.run(f.job_id).await.unwrap();

        let result = f.jobs.snapshot(f.job_id).await.unwrap().result.unwrap();
        // [3,4,3,4] weighted = 3.4 -> 0.68
        assert!(result.cv_match_rate > 0.6 && result.cv_match_rate < 0.7);
        // [4,4,2,4,4] weighted = 3.6
        assert!(result.project_score >= 3.5 && result.project_score <= 4.0);
        assert!(result.overall_summary.contains("resilience"));
    }
}
