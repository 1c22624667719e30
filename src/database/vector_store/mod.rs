
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::storage::ResourceStore;
use crate::Result;
use crate::config::VECTOR_STORE_RESOURCE;
use crate::embeddings::{EmbeddingProvider, chunk_content};
use crate::rag::RagConfig;

/// Chunks embedded between cooperative yields
const EMBEDDING_BATCH_SIZE: usize = 10;
/// Weight of query words found in a chunk's path or title
const PATH_MATCH_BOOST: f32 = 0.3;
/// Floor added to keyword search scores when the path or title matches
const PATH_MATCH_BONUS: f32 = 0.5;

/// Where a chunk came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Identifier of the source document; chunk ids are derived from it
    pub source: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl ChunkMetadata {
    /// Metadata stamped with the current time
    #[inline]
    pub fn new(source: impl Into<String>, path: impl Into<String>, title: Option<String>) -> Self {
        Self {
            source: source.into(),
            path: path.into(),
            title,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    /// `{source}-{index}`
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub metadata: ChunkMetadata,
}

impl DocumentChunk {
    /// Whether this chunk was generated from `source_id`
    #[inline]
    pub fn belongs_to(&self, source_id: &str) -> bool {
        self.id
            .strip_prefix(source_id)
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
    }
}

/// Persisted form of the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorStoreData {
    pub chunks: Vec<DocumentChunk>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl VectorStoreData {
    #[inline]
    pub fn new(chunks: Vec<DocumentChunk>) -> Self {
        let now = Utc::now().timestamp_millis();
        let created_at = chunks
            .iter()
            .map(|c| c.metadata.timestamp)
            .min()
            .unwrap_or(now);

        Self {
            chunks,
            created_at,
            updated_at: now.max(created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub chunk: DocumentChunk,
    /// Always within `0.0..=1.0`
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VectorStoreStats {
    pub indexed_files: usize,
    /// Bytes of chunk content
    pub total_content_size: usize,
    pub chunk_count: usize,
    pub embedded_chunks: usize,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

/// Second-pass ordering applied to search results when re-ranking is enabled
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, results: Vec<SearchResult>) -> Result<Vec<SearchResult>>;
}

/// Leaves results as they are
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughReranker;

#[async_trait]
impl Reranker for PassthroughReranker {
    #[inline]
    async fn rerank(&self, _query: &str, results: Vec<SearchResult>) -> Result<Vec<SearchResult>> {
        Ok(results)
    }
}

/// In-memory chunk collection persisted as a single JSON resource.
///
/// One instance owns the chunks of one vault. It never shares them through
/// globals, so several stores can live side by side.
pub struct VectorStore {
    chunks: Vec<DocumentChunk>,
    storage: Arc<dyn ResourceStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Arc<dyn Reranker>,
    resource_path: String,
}

impl std::fmt::Debug for VectorStore {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("chunks", &self.chunks.len())
            .field("resource_path", &self.resource_path)
            .finish_non_exhaustive()
    }
}

impl VectorStore {
    /// Create an empty store. Call [`VectorStore::load`] to pick up persisted
    /// chunks.
    ///
    /// # Arguments
    /// * `storage` - Where the store is persisted
    /// * `embedder` - Used for document chunks and queries alike
    #[inline]
    pub fn new(storage: Arc<dyn ResourceStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            chunks: Vec::new(),
            storage,
            embedder,
            reranker: Arc::new(PassthroughReranker),
            resource_path: VECTOR_STORE_RESOURCE.to_string(),
        }
    }

    #[inline]
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    #[inline]
    pub fn with_resource_path(mut self, path: impl Into<String>) -> Self {
        self.resource_path = path.into();
        self
    }

    #[inline]
    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        Arc::clone(&self.embedder)
    }

    #[inline]
    pub fn chunks(&self) -> &[DocumentChunk] {
        &self.chunks
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Replace the in-memory chunks with the persisted ones.
    ///
    /// A missing or unreadable-as-JSON resource leaves the store empty. Only
    /// failing to reach storage at all is reported as an error.
    #[inline]
    pub async fn load(&mut self) -> Result<()> {
        let Some(bytes) = self.storage.read_resource(&self.resource_path).await? else {
            debug!("No persisted vector store at {}", self.resource_path);
            self.chunks.clear();
            return Ok(());
        };

        match serde_json::from_slice::<VectorStoreData>(&bytes) {
            Ok(data) => {
                info!(
                    "Loaded {} chunks from {}",
                    data.chunks.len(),
                    self.resource_path
                );
                self.chunks = data.chunks;
            }
            Err(e) => {
                warn!(
                    "Persisted vector store {} is corrupt, starting empty: {}",
                    self.resource_path, e
                );
                self.chunks.clear();
            }
        }

        Ok(())
    }

    #[inline]
    pub async fn save(&self) -> Result<()> {
        let data = VectorStoreData::new(self.chunks.clone());
        let bytes = serde_json::to_vec(&data)?;

        self.storage
            .write_resource(&self.resource_path, &bytes)
            .await?;

        debug!(
            "Saved {} chunks ({} bytes) to {}",
            self.chunks.len(),
            bytes.len(),
            self.resource_path
        );
        Ok(())
    }

    /// Chunk, embed and store a document, replacing any chunks previously
    /// stored for `source_id`. Returns the number of chunks stored.
    #[inline]
    pub async fn add_document(
        &mut self,
        source_id: &str,
        text: &str,
        metadata: ChunkMetadata,
        config: &RagConfig,
    ) -> Result<usize> {
        let chunks = Self::build_chunks(self.embedder.as_ref(), source_id, text, metadata, config)
            .await;
        self.replace_document(source_id, chunks).await
    }

    /// Chunk and embed a document without touching any store.
    ///
    /// Chunks whose embedding cannot be produced are kept without one.
    #[inline]
    pub async fn build_chunks(
        embedder: &dyn EmbeddingProvider,
        source_id: &str,
        text: &str,
        metadata: ChunkMetadata,
        config: &RagConfig,
    ) -> Vec<DocumentChunk> {
        let model = config.effective_embedding_model();
        let contents = chunk_content(text, config);
        let mut chunks = Vec::with_capacity(contents.len());

        for batch in contents.chunks(EMBEDDING_BATCH_SIZE) {
            for content in batch {
                let embedding = embed_chunk(embedder, content, &metadata, model).await;
                chunks.push(DocumentChunk {
                    id: format!("{}-{}", source_id, chunks.len()),
                    content: content.clone(),
                    embedding,
                    metadata: metadata.clone(),
                });
            }
            tokio::task::yield_now().await;
        }

        let embedded = chunks.iter().filter(|c| c.embedding.is_some()).count();
        debug!(
            "Prepared {} chunks for {} ({} embedded)",
            chunks.len(),
            source_id,
            embedded
        );
        chunks
    }

    /// Swap in freshly built chunks for `source_id` and persist
    #[inline]
    pub async fn replace_document(
        &mut self,
        source_id: &str,
        chunks: Vec<DocumentChunk>,
    ) -> Result<usize> {
        let count = chunks.len();
        let removed = self.purge(source_id);
        self.chunks.extend(chunks);

        debug!(
            "Replaced {} chunks of {} with {}",
            removed, source_id, count
        );

        self.save().await?;
        Ok(count)
    }

    /// Drop every chunk of `source_id`. Returns how many were removed.
    #[inline]
    pub async fn remove_document(&mut self, source_id: &str) -> Result<usize> {
        let removed = self.purge(source_id);
        if removed > 0 {
            info!("Removed {} chunks of {}", removed, source_id);
            self.save().await?;
        }
        Ok(removed)
    }

    fn purge(&mut self, source_id: &str) -> usize {
        let before = self.chunks.len();
        self.chunks.retain(|chunk| !chunk.belongs_to(source_id));
        before - self.chunks.len()
    }

    #[inline]
    pub async fn clear(&mut self) -> Result<()> {
        let count = self.chunks.len();
        self.chunks.clear();
        self.save().await?;
        info!("Cleared {} chunks from the vector store", count);
        Ok(())
    }

    /// Rank chunks against `query`.
    ///
    /// Uses vector similarity when the query can be embedded and keyword
    /// matching otherwise.
    #[inline]
    pub async fn search(
        &self,
        query: &str,
        config: &RagConfig,
        embedding_model: &str,
    ) -> Result<Vec<SearchResult>> {
        let query_embedding = match self.embedder.generate_embedding(query, embedding_model).await
        {
            Ok(Some(embedding)) if !embedding.is_empty() => Some(embedding),
            Ok(_) => {
                debug!("No embedding for query, using keyword search");
                None
            }
            Err(e) => {
                warn!("Failed to embed query, using keyword search: {}", e);
                None
            }
        };

        let results = match query_embedding {
            Some(embedding) => self.vector_search(query, &embedding, config),
            None => self.simple_search(query, config),
        };

        if config.re_ranking_enabled {
            return self.reranker.rerank(query, results).await;
        }

        Ok(results)
    }

    fn vector_search(
        &self,
        query: &str,
        query_embedding: &[f32],
        config: &RagConfig,
    ) -> Vec<SearchResult> {
        let words = query_words(query);

        let scored = self.chunks.iter().map(|chunk| {
            let similarity = chunk
                .embedding
                .as_deref()
                .map_or(0.0, |embedding| cosine_similarity(query_embedding, embedding));

            let boost = if words.is_empty() {
                0.0
            } else {
                path_matches(chunk, &words) as f32 / words.len() as f32 * PATH_MATCH_BOOST
            };

            (chunk, (similarity + boost).min(1.0))
        });

        rank(scored, config)
    }

    /// Keyword overlap ranking for when no query embedding is available
    #[inline]
    pub fn simple_search(&self, query: &str, config: &RagConfig) -> Vec<SearchResult> {
        let words = query_words(query);
        if words.is_empty() {
            return Vec::new();
        }
        let word_count = words.len() as f32;

        let scored = self.chunks.iter().filter_map(|chunk| {
            let in_path = path_matches(chunk, &words);
            let score = if in_path > 0 {
                in_path as f32 / word_count + PATH_MATCH_BONUS
            } else {
                let content = chunk.content.to_lowercase();
                words.iter().filter(|w| content.contains(w.as_str())).count() as f32 / word_count
            };

            (score > 0.0).then_some((chunk, score.min(1.0)))
        });

        rank(scored, config)
    }

    /// Recomputed from the live chunks on every call
    #[inline]
    pub fn get_detailed_stats(&self) -> VectorStoreStats {
        let sources: HashSet<&str> = self
            .chunks
            .iter()
            .map(|c| c.metadata.source.as_str())
            .collect();
        let timestamps = self.chunks.iter().map(|c| c.metadata.timestamp);

        VectorStoreStats {
            indexed_files: sources.len(),
            total_content_size: self.chunks.iter().map(|c| c.content.len()).sum(),
            chunk_count: self.chunks.len(),
            embedded_chunks: self
                .chunks
                .iter()
                .filter(|c| c.embedding.is_some())
                .count(),
            created_at: timestamps.clone().min(),
            updated_at: timestamps.max(),
        }
    }
}

/// Embed chunk text, retrying with the path and title prepended
async fn embed_chunk(
    embedder: &dyn EmbeddingProvider,
    content: &str,
    metadata: &ChunkMetadata,
    model: &str,
) -> Option<Vec<f32>> {
    match embedder.generate_embedding(content, model).await {
        Ok(Some(embedding)) if !embedding.is_empty() => return Some(embedding),
        Ok(_) => debug!("No embedding for chunk of {}, retrying with path", metadata.path),
        Err(e) => debug!(
            "Embedding chunk of {} failed, retrying with path: {}",
            metadata.path, e
        ),
    }

    let combined = format!(
        "{} {} {}",
        metadata.path,
        metadata.title.as_deref().unwrap_or_default(),
        content
    );

    match embedder.generate_embedding(&combined, model).await {
        Ok(Some(embedding)) if !embedding.is_empty() => Some(embedding),
        Ok(_) => {
            warn!("No embedding available for chunk of {}", metadata.path);
            None
        }
        Err(e) => {
            warn!("Failed to embed chunk of {}: {}", metadata.path, e);
            None
        }
    }
}

fn query_words(query: &str) -> Vec<String> {
    query.split_whitespace().map(str::to_lowercase).collect()
}

fn path_matches(chunk: &DocumentChunk, words: &[String]) -> usize {
    let path = chunk.metadata.path.to_lowercase();
    let title = chunk
        .metadata
        .title
        .as_deref()
        .map(str::to_lowercase)
        .unwrap_or_default();

    words
        .iter()
        .filter(|w| path.contains(w.as_str()) || title.contains(w.as_str()))
        .count()
}

/// Apply the similarity threshold, order by score and keep the top K
fn rank<'a>(
    scored: impl Iterator<Item = (&'a DocumentChunk, f32)>,
    config: &RagConfig,
) -> Vec<SearchResult> {
    let threshold = config.similarity_threshold;

    let mut results: Vec<SearchResult> = scored
        .filter(|(_, score)| threshold <= 0.0 || *score >= threshold)
        .map(|(chunk, score)| SearchResult {
            chunk: chunk.clone(),
            similarity: score.clamp(0.0, 1.0),
        })
        .collect();

    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
    });
    results.truncate(config.top_k);
    results
}

/// Cosine similarity of two vectors.
///
/// Returns `0.0` for zero-magnitude or differently sized vectors.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    if similarity.is_nan() {
        return 0.0;
    }
    similarity.clamp(-1.0, 1.0) as f32
}
