// All prompt constants for the evaluation stages. Criteria and weights are
// injected from the rubric at call time; nothing about scoring policy is
// hardcoded here.

/// System prompt for the CV stage — enforces JSON-only output.
pub const CV_SYSTEM: &str = "You are an expert HR professional evaluating candidate CVs. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// CV evaluation prompt template.
/// Replace: {job_title}, {context}, {cv_text}, {score_schema}, {criteria}
pub const CV_PROMPT_TEMPLATE: &str = r#"You are evaluating a candidate's CV for a {job_title} position.

JOB REQUIREMENTS AND EVALUATION CRITERIA:
{context}

CANDIDATE CV:
{cv_text}

Score the CV against every criterion below on a 1-5 scale. Return a JSON object with this EXACT structure:
{
  "scores": {
    {score_schema}
  },
  "feedback": "<comprehensive feedback in 2-3 sentences>"
}

CRITERIA:
{criteria}

Rules:
- Score every listed criterion; do not add or omit criteria.
- Do NOT compute any weighted total or match rate yourself; report per-criterion scores only.
- Respond ONLY with valid JSON, no additional text."#;

/// System prompt for the project stage — enforces JSON-only output.
pub const PROJECT_SYSTEM: &str = "You are an expert technical reviewer evaluating project reports. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Project evaluation prompt template.
/// Replace: {context}, {project_text}, {score_schema}, {criteria}
pub const PROJECT_PROMPT_TEMPLATE: &str = r#"You are evaluating a candidate's project report against a take-home case study.

CASE STUDY REQUIREMENTS AND EVALUATION CRITERIA:
{context}

PROJECT REPORT:
{project_text}

Score the report against every criterion below on a 1-5 scale. Return a JSON object with this EXACT structure:
{
  "scores": {
    {score_schema}
  },
  "feedback": "<comprehensive feedback in 2-3 sentences>"
}

CRITERIA:
{criteria}

Rules:
- Score every listed criterion; do not add or omit criteria.
- Do NOT compute any weighted total or overall score yourself; report per-criterion scores only.
- Respond ONLY with valid JSON, no additional text."#;

/// System prompt for the synthesis stage.
pub const SYNTHESIS_SYSTEM: &str = "You are an expert HR professional providing final candidate \
    assessments. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// Synthesis prompt template. No retrieval: its only inputs are the two
/// committed stage results.
/// Replace: {job_title}, {cv_match_rate}, {cv_feedback}, {project_score}, {project_feedback}
pub const SYNTHESIS_PROMPT_TEMPLATE: &str = r#"You are providing a final assessment for a {job_title} candidate.

CV EVALUATION RESULTS:
- Match Rate: {cv_match_rate}
- Feedback: {cv_feedback}

PROJECT EVALUATION RESULTS:
- Score: {project_score}/5.0
- Feedback: {project_feedback}

Write a concise overall summary (3-5 sentences) covering:
1. Key strengths of the candidate
2. Areas for improvement or gaps
3. A recommendation for next steps

Be professional, specific, and actionable. Return a JSON object:
{
  "overall_summary": "<3-5 sentence assessment>"
}"#;
