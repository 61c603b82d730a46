//! Retrieval Assembler — turns a query intent into a bounded prompt context.
//!
//! The context store itself (embeddings, vector index) is an external
//! collaborator behind the `ContextStore` trait; this module owns chunking
//! at ingestion time, relevance-ordered assembly, and the character budget.
//! `InMemoryContextStore` is the keyword-overlap implementation used in
//! tests and single-process deployments.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::document::{Document, DocumentKind, ReferenceChunk};

pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_CONTEXT_BUDGET: usize = 6000;
const CHUNK_SIZE: usize = 1000;
const CHUNK_OVERLAP: usize = 200;

/// A retrieval hit with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub scope: DocumentKind,
    pub text: String,
    pub relevance: f64,
}

/// Similarity search over the reference-chunk corpus, scoped by document
/// kind. Read-only from the pipeline's perspective after ingestion.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn search(
        &self,
        query: &str,
        scopes: &[DocumentKind],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, PipelineError>;

    async fn add_chunks(&self, chunks: Vec<ReferenceChunk>) -> Result<(), PipelineError>;
}

/// Assembled prompt context for one stage.
#[derive(Debug, Clone)]
pub struct ContextBlock {
    pub text: String,
    pub chunk_count: usize,
    /// True when retrieval was skipped and the block holds rubric text only.
    pub degraded: bool,
}

impl ContextBlock {
    pub fn degraded(text: String) -> Self {
        Self {
            text,
            chunk_count: 0,
            degraded: true,
        }
    }
}

/// Fetches top-k chunks and formats them into a bounded context block.
pub struct RetrievalAssembler {
    store: Arc<dyn ContextStore>,
    top_k: usize,
    max_chars: usize,
}

impl RetrievalAssembler {
    pub fn new(store: Arc<dyn ContextStore>, top_k: usize, max_chars: usize) -> Self {
        Self {
            store,
            top_k,
            max_chars,
        }
    }

    /// Retrieves and concatenates relevant chunks, descending by relevance,
    /// ties broken by original chunk order so equal-relevance output is
    /// deterministic. Whole chunks are dropped past the character budget.
    pub async fn retrieve(
        &self,
        query: &str,
        scopes: &[DocumentKind],
    ) -> Result<ContextBlock, PipelineError> {
        let mut chunks = self.store.search(query, scopes, self.top_k).await?;
        chunks.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });

        let mut parts: Vec<String> = Vec::new();
        let mut used = 0usize;
        for chunk in &chunks {
            let part = format!("[{}]: {}", chunk.scope.as_str(), chunk.text);
            let sep = if parts.is_empty() { 0 } else { 2 };
            if used + sep + part.len() > self.max_chars {
                break;
            }
            used += sep + part.len();
            parts.push(part);
        }

        Ok(ContextBlock {
            chunk_count: parts.len(),
            text: parts.join("\n\n"),
            degraded: false,
        })
    }
}

/// Splits text into overlapping chunks, preferring sentence boundaries in
/// the back half of each window.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_size {
        return vec![text.trim().to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let mut end = (start + chunk_size).min(chars.len());
        if end < chars.len() {
            if let Some(boundary) = (start..end).rev().find(|&i| chars[i] == '.' || chars[i] == '\n')
            {
                if boundary > start + chunk_size / 2 {
                    end = boundary + 1;
                }
            }
        }
        let chunk: String = chars[start..end].iter().collect();
        chunks.push(chunk.trim().to_string());
        if end >= chars.len() {
            break;
        }
        // Overlap must never move the window backwards.
        start = end.saturating_sub(overlap).max(start + 1);
    }
    chunks
}

/// Chunks every reference document into the context store. Runs once at
/// process start, ahead of any job. Failures are isolated per document.
pub async fn ingest_reference_documents(
    store: &dyn ContextStore,
    documents: &[Document],
) -> Result<usize, PipelineError> {
    let mut total = 0usize;
    for doc in documents {
        if !doc.kind.is_reference() {
            continue;
        }
        let pieces = chunk_text(&doc.text, CHUNK_SIZE, CHUNK_OVERLAP);
        let count = pieces.len();
        let chunks = pieces
            .into_iter()
            .enumerate()
            .map(|(i, text)| ReferenceChunk {
                document_id: doc.id,
                chunk_index: i as i32,
                scope: doc.kind,
                text,
            })
            .collect();
        match store.add_chunks(chunks).await {
            Ok(()) => {
                total += count;
                info!(
                    document_id = %doc.id,
                    kind = doc.kind.as_str(),
                    chunks = count,
                    "reference document ingested"
                );
            }
            Err(e) => {
                warn!(document_id = %doc.id, error = %e, "failed to ingest reference document");
            }
        }
    }
    Ok(total)
}

/// Keyword-overlap ranking shared by the non-vector context stores:
/// relevance is the number of query terms present in a chunk, ties broken
/// by original chunk order. Deterministic; the production vector index
/// plugs in behind the `ContextStore` trait with its own scoring.
pub(crate) fn rank_chunks(query: &str, chunks: Vec<ReferenceChunk>, k: usize) -> Vec<ScoredChunk> {
    let terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect();

    let mut hits: Vec<ScoredChunk> = chunks
        .into_iter()
        .filter_map(|c| {
            let lower = c.text.to_lowercase();
            let overlap = terms.iter().filter(|t| lower.contains(t.as_str())).count();
            if overlap == 0 {
                return None;
            }
            Some(ScoredChunk {
                document_id: c.document_id,
                chunk_index: c.chunk_index,
                scope: c.scope,
                text: c.text,
                relevance: overlap as f64,
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.document_id.cmp(&b.document_id))
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
    });
    hits.truncate(k);
    hits
}

/// Keyword-overlap context store held in process memory. Used by tests and
/// single-process runs; `store::pg::PgContextStore` is the persisted twin.
#[derive(Default)]
pub struct InMemoryContextStore {
    chunks: RwLock<Vec<ReferenceChunk>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn search(
        &self,
        query: &str,
        scopes: &[DocumentKind],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        let chunks = self.chunks.read().await;
        let scoped: Vec<ReferenceChunk> = chunks
            .iter()
            .filter(|c| scopes.contains(&c.scope))
            .cloned()
            .collect();
        Ok(rank_chunks(query, scoped, k))
    }

    async fn add_chunks(&self, chunks: Vec<ReferenceChunk>) -> Result<(), PipelineError> {
        self.chunks.write().await.extend(chunks);
        Ok(())
    }
}
