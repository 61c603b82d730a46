//! Asynchronous applicant-screening pipeline.
//!
//! Compares an uploaded CV and project report against reference documents
//! (job description, case-study brief, scoring rubrics) through a chain of
//! retrieval-augmented generative calls, and exposes a submit/poll job
//! contract to the web layer that embeds this crate.

pub mod config;
pub mod db;
pub mod errors;
pub mod llm_client;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod retrieval;
pub mod rubric;
pub mod store;
