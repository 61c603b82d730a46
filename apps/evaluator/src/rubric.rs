//! Scoring rubrics: weighted criteria that turn per-criterion model
//! judgments into a single reproducible number.
//!
//! Rubrics are data, not policy. The built-in set covers the default role;
//! a JSON file can replace it or add per-job-title sets at startup. Loaded
//! once, immutable, shared read-only by every worker.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::models::job::{CriterionScore, Stage};

pub const MIN_CRITERION_SCORE: f64 = 1.0;
pub const MAX_CRITERION_SCORE: f64 = 5.0;

/// Weights must sum to 1.0 within this tolerance.
const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    /// Fraction of the stage score this criterion carries.
    pub weight: f64,
    /// Human-readable description of the 1-5 scale for this criterion.
    pub scale: String,
}

/// An ordered set of weighted criteria for one scored stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringRubric {
    pub criteria: Vec<Criterion>,
}

impl ScoringRubric {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.criteria.is_empty() {
            return Err(anyhow!("rubric has no criteria").into());
        }
        let mut seen = std::collections::HashSet::new();
        for c in &self.criteria {
            if !seen.insert(c.name.as_str()) {
                return Err(anyhow!("duplicate rubric criterion '{}'", c.name).into());
            }
            if c.weight <= 0.0 || c.weight > 1.0 {
                return Err(anyhow!(
                    "criterion '{}' has weight {} outside (0, 1]",
                    c.name,
                    c.weight
                )
                .into());
            }
        }
        let total: f64 = self.criteria.iter().map(|c| c.weight).sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(anyhow!("rubric weights sum to {total}, expected 1.0").into());
        }
        Ok(())
    }

    /// Deterministic weighted sum of per-criterion scores: sum of s_i * w_i.
    /// Every rubric criterion must be present in `scores`.
    pub fn weighted_score(
        &self,
        scores: &BTreeMap<String, CriterionScore>,
    ) -> Result<f64, PipelineError> {
        let mut total = 0.0;
        for c in &self.criteria {
            let entry = scores.get(&c.name).ok_or_else(|| {
                PipelineError::Internal(anyhow!("missing score for criterion '{}'", c.name))
            })?;
            total += entry.score * c.weight;
        }
        Ok(total)
    }

    /// Renders the criteria for prompt injection, one line per criterion.
    pub fn criteria_block(&self) -> String {
        let mut out = String::new();
        for c in &self.criteria {
            let _ = writeln!(
                out,
                "- {} ({:.0}% weight): {}",
                c.name,
                c.weight * 100.0,
                c.scale
            );
        }
        out.trim_end().to_string()
    }

    /// Renders the expected `scores` object body for the response schema
    /// section of a prompt.
    pub fn schema_block(&self) -> String {
        self.criteria
            .iter()
            .map(|c| format!(r#""{}": {{"score": <1-5>, "reasoning": "<explanation>"}}"#, c.name))
            .collect::<Vec<_>>()
            .join(",\n    ")
    }
}

/// The CV and project rubrics that apply to one job title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricSet {
    pub cv: ScoringRubric,
    pub project: ScoringRubric,
}

impl RubricSet {
    fn validate(&self) -> Result<(), PipelineError> {
        self.cv.validate()?;
        self.project.validate()
    }
}

/// On-disk shape for rubric overrides.
#[derive(Debug, Deserialize)]
struct RubricFile {
    default: RubricSet,
    #[serde(default)]
    titles: HashMap<String, RubricSet>,
}

/// Immutable registry, one rubric set per job title with a default fallback.
pub struct RubricRegistry {
    default: RubricSet,
    by_title: HashMap<String, RubricSet>,
}

impl RubricRegistry {
    /// Built-in rubric set for the default backend-engineer screening role.
    pub fn builtin() -> Self {
        let cv = ScoringRubric {
            criteria: vec![
                Criterion {
                    name: "technical_skills_match".to_string(),
                    weight: 0.40,
                    scale: "Alignment with the role's stack: backend frameworks, databases, \
                            APIs, cloud, and AI/LLM exposure (prompt design, RAG, chaining)"
                        .to_string(),
                },
                Criterion {
                    name: "experience_level".to_string(),
                    weight: 0.25,
                    scale: "Years of experience and complexity of shipped projects, \
                            especially AI-powered systems"
                        .to_string(),
                },
                Criterion {
                    name: "relevant_achievements".to_string(),
                    weight: 0.20,
                    scale: "Impact of past work: scaling, performance, adoption, measurable \
                            outcomes"
                        .to_string(),
                },
                Criterion {
                    name: "cultural_fit".to_string(),
                    weight: 0.15,
                    scale: "Communication, learning mindset, ownership, teamwork".to_string(),
                },
            ],
        };
        let project = ScoringRubric {
            criteria: vec![
                Criterion {
                    name: "correctness".to_string(),
                    weight: 0.30,
                    scale: "Implements prompt design, LLM chaining, RAG context injection, \
                            and async job handling per the brief"
                        .to_string(),
                },
                Criterion {
                    name: "code_quality".to_string(),
                    weight: 0.25,
                    scale: "Clean, modular, reusable, tested code".to_string(),
                },
                Criterion {
                    name: "resilience".to_string(),
                    weight: 0.20,
                    scale: "Handles long-running calls, retries, nondeterminism, and API \
                            failures"
                        .to_string(),
                },
                Criterion {
                    name: "documentation".to_string(),
                    weight: 0.15,
                    scale: "README clarity, setup instructions, trade-off explanations"
                        .to_string(),
                },
                Criterion {
                    name: "creativity".to_string(),
                    weight: 0.10,
                    scale: "Extra features beyond the brief's requirements".to_string(),
                },
            ],
        };
        Self {
            default: RubricSet { cv, project },
            by_title: HashMap::new(),
        }
    }

    /// Loads and validates a registry from JSON.
    pub fn from_json(s: &str) -> Result<Self, PipelineError> {
        let file: RubricFile = serde_json::from_str(s)
            .map_err(|e| PipelineError::Internal(anyhow!("invalid rubric file: {e}")))?;
        file.default.validate()?;
        for (title, set) in &file.titles {
            set.validate()
                .map_err(|e| PipelineError::Internal(anyhow!("rubric for '{title}': {e}")))?;
        }
        Ok(Self {
            default: file.default,
            by_title: file.titles,
        })
    }

    /// Looks up the rubric for a job title and stage. Synthesis has no rubric.
    pub fn load(&self, job_title: &str, stage: Stage) -> Option<&ScoringRubric> {
        let set = self.by_title.get(job_title).unwrap_or(&self.default);
        match stage {
            Stage::Cv => Some(&set.cv),
            Stage::Project => Some(&set.project),
            Stage::Synthesis => None,
        }
    }
}
