// RAG module
// Orchestrates indexing of the vault and retrieval over the vector store

pub mod config;


use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::database::{
    ChunkMetadata, ResourceStore, SearchResult, VectorStore, VectorStoreStats,
};
use crate::embeddings::{EmbeddingManager, EmbeddingProvider};
use crate::grader::DocumentGrader;
use crate::vault::{VaultDocument, VaultEvent, VaultReader, extract_tags, extract_title};
use crate::{RagError, Result};

pub use config::{
    ChunkingStrategy, DEFAULT_EMBEDDING_MODEL, DEFAULT_GRADING_PROMPT, GraderModelSource,
    IndexingMode, RagConfig,
};

/// Files indexed between pauses
const FILE_BATCH_SIZE: usize = 5;
const FILE_BATCH_PAUSE: Duration = Duration::from_millis(10);
/// Files between progress notices
const PROGRESS_INTERVAL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Ready,
    /// Ready, and re-indexing files as the vault reports changes
    Watching,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexProgress {
    pub processed: usize,
    pub total: usize,
    pub failed: usize,
}

/// Outcome of a vault-wide indexing run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexingReport {
    /// Documents found in the vault
    pub total: usize,
    pub indexed: usize,
    pub failed: usize,
    /// Documents rejected by the folder, type or tag filters
    pub skipped: usize,
    pub chunks_created: usize,
    /// The index was cleared or the manager torn down mid-run
    pub cancelled: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RagStats {
    pub enabled: bool,
    pub state: ManagerState,
    pub indexing: bool,
    pub indexed_files: usize,
    pub chunk_count: usize,
    pub embedding_model: String,
}

enum IndexOutcome {
    Indexed(usize),
    Skipped,
    Cancelled,
}

/// State shared with the watcher task
struct Shared {
    config: RwLock<RagConfig>,
    store: tokio::sync::RwLock<VectorStore>,
    vault: Arc<dyn VaultReader>,
    /// Bumped whenever in-flight indexing must not commit anymore
    generation: AtomicU64,
    indexing: AtomicBool,
}

impl Shared {
    fn config(&self) -> RagConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn cancel_indexing(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Read, chunk, embed and commit one document unless `generation` has
    /// moved on by the time it is ready
    async fn index_document(
        &self,
        document: &VaultDocument,
        config: &RagConfig,
        generation: u64,
    ) -> Result<IndexOutcome> {
        let content = self.vault.read_document(document).await?;

        if config.has_tag_filters() && !config.accepts_tags(&extract_tags(&content)) {
            debug!("Skipping {} due to tag filters", document.path);
            self.store.write().await.remove_document(&document.path).await?;
            return Ok(IndexOutcome::Skipped);
        }

        let title = extract_title(&content, &document.path);
        let metadata = ChunkMetadata::new(&document.path, &document.path, Some(title));

        let embedder = self.store.read().await.embedder();
        let chunks =
            VectorStore::build_chunks(embedder.as_ref(), &document.path, &content, metadata, config)
                .await;

        let mut store = self.store.write().await;
        if self.generation() != generation {
            debug!("Index changed while preparing {}, discarding", document.path);
            return Ok(IndexOutcome::Cancelled);
        }
        let count = store.replace_document(&document.path, chunks).await?;

        debug!("Indexed {} ({} chunks)", document.path, count);
        Ok(IndexOutcome::Indexed(count))
    }
}

struct IndexingGuard<'a>(&'a AtomicBool);

impl Drop for IndexingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Entry point of the retrieval pipeline.
///
/// Owns the configuration, the vector store, the grader and the embedding
/// worker. All operations take `&self`, so a manager can be shared behind an
/// `Arc`.
pub struct RagManager {
    shared: Arc<Shared>,
    grader: DocumentGrader,
    embeddings: EmbeddingManager,
    state: Mutex<ManagerState>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RagManager {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagManager")
            .field("state", &self.state())
            .field("embeddings", &self.embeddings)
            .finish_non_exhaustive()
    }
}

impl RagManager {
    /// Assemble a manager from its parts.
    ///
    /// `store` should embed through `embeddings` so indexing and queries
    /// share the one worker; [`RagManager::with_providers`] wires that up.
    #[inline]
    pub fn new(
        config: RagConfig,
        vault: Arc<dyn VaultReader>,
        store: VectorStore,
        grader: DocumentGrader,
        embeddings: EmbeddingManager,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                store: tokio::sync::RwLock::new(store),
                vault,
                generation: AtomicU64::new(0),
                indexing: AtomicBool::new(false),
            }),
            grader,
            embeddings,
            state: Mutex::new(ManagerState::Uninitialized),
            watcher: Mutex::new(None),
        }
    }

    #[inline]
    pub fn with_providers(
        config: RagConfig,
        vault: Arc<dyn VaultReader>,
        storage: Arc<dyn ResourceStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        grader: DocumentGrader,
    ) -> Self {
        let embeddings = EmbeddingManager::new(embedder);
        let store = VectorStore::new(storage, Arc::new(embeddings.clone()));
        Self::new(config, vault, store, grader, embeddings)
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_watcher(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn state(&self) -> ManagerState {
        *self.lock_state()
    }

    #[inline]
    pub fn config(&self) -> RagConfig {
        self.shared.config()
    }

    #[inline]
    pub fn is_indexing(&self) -> bool {
        self.shared.indexing.load(Ordering::SeqCst)
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ManagerState::Uninitialized => Err(RagError::NotInitialized),
            ManagerState::Destroyed => Err(RagError::Destroyed),
            ManagerState::Ready | ManagerState::Watching => Ok(()),
        }
    }

    /// Load the persisted index and start the embedding worker.
    ///
    /// Also starts watching the vault when `embed_changed_files` is set, and
    /// indexes the whole vault in automatic mode if the index is empty.
    #[inline]
    pub async fn initialize(&self) -> Result<()> {
        match self.state() {
            ManagerState::Destroyed => return Err(RagError::Destroyed),
            ManagerState::Ready | ManagerState::Watching => {
                debug!("RAG manager already initialized");
                return Ok(());
            }
            ManagerState::Uninitialized => {}
        }

        self.shared.store.write().await.load().await?;
        self.embeddings.start();
        *self.lock_state() = ManagerState::Ready;

        let config = self.config();
        if config.enabled && config.embed_changed_files {
            self.attach_watcher()?;
        }

        let empty = self.shared.store.read().await.is_empty();
        info!("RAG manager initialized (index empty: {})", empty);

        if config.enabled && config.indexing_mode == IndexingMode::Automatic && empty {
            info!("Automatic indexing mode with an empty index, indexing vault");
            let report = self.index_vault().await?;
            debug!("Automatic indexing finished: {:?}", report);
        }

        Ok(())
    }

    #[inline]
    pub async fn index_vault(&self) -> Result<IndexingReport> {
        self.index_vault_with_progress(|_| {}).await
    }

    /// Index every accepted document of the vault.
    ///
    /// Files are processed in small batches with a pause in between. A file
    /// that fails is counted and skipped. `progress` is called every
    /// [`PROGRESS_INTERVAL`] files and once at the end.
    #[inline]
    pub async fn index_vault_with_progress<F>(&self, progress: F) -> Result<IndexingReport>
    where
        F: Fn(IndexProgress) + Send + Sync,
    {
        self.ensure_ready()?;
        let config = self.config();
        let started = Instant::now();

        if !config.enabled {
            info!("RAG is disabled, not indexing");
            return Ok(IndexingReport::default());
        }

        if self.shared.indexing.swap(true, Ordering::SeqCst) {
            return Err(RagError::IndexingInProgress);
        }
        let _guard = IndexingGuard(&self.shared.indexing);
        let generation = self.shared.generation();

        let documents = self.shared.vault.list_markdown_documents().await?;
        let mut report = IndexingReport {
            total: documents.len(),
            ..IndexingReport::default()
        };

        let candidates: Vec<&VaultDocument> = documents
            .iter()
            .filter(|document| config.accepts_path(&document.path))
            .collect();
        report.skipped = documents.len() - candidates.len();

        info!(
            "Indexing {} of {} vault documents",
            candidates.len(),
            documents.len()
        );

        let total = candidates.len();
        let mut processed = 0;

        'batches: for (batch_index, batch) in candidates.chunks(FILE_BATCH_SIZE).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(FILE_BATCH_PAUSE).await;
            }

            for document in batch {
                if self.shared.generation() != generation {
                    report.cancelled = true;
                    break 'batches;
                }

                match self
                    .shared
                    .index_document(document, &config, generation)
                    .await
                {
                    Ok(IndexOutcome::Indexed(chunks)) => {
                        report.indexed += 1;
                        report.chunks_created += chunks;
                    }
                    Ok(IndexOutcome::Skipped) => report.skipped += 1,
                    Ok(IndexOutcome::Cancelled) => {
                        report.cancelled = true;
                        break 'batches;
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!("Failed to index {}: {}", document.path, e);
                    }
                }

                processed += 1;
                if processed % PROGRESS_INTERVAL == 0 {
                    info!(
                        "Indexed {}/{} files ({} failed)",
                        processed, total, report.failed
                    );
                    progress(IndexProgress {
                        processed,
                        total,
                        failed: report.failed,
                    });
                }
            }
        }

        progress(IndexProgress {
            processed,
            total,
            failed: report.failed,
        });
        report.duration = started.elapsed();

        if report.cancelled {
            warn!(
                "Indexing cancelled after {} files ({} indexed, {} failed)",
                processed, report.indexed, report.failed
            );
        } else {
            info!(
                "{} files indexed, {} failed, {} skipped ({} chunks) in {:?}",
                report.indexed, report.failed, report.skipped, report.chunks_created, report.duration
            );
        }

        Ok(report)
    }

    /// Index a single vault document. Returns the number of chunks stored.
    #[inline]
    pub async fn index_file(&self, document: &VaultDocument) -> Result<usize> {
        self.ensure_ready()?;
        let config = self.config();

        if !config.enabled || !config.accepts_path(&document.path) {
            debug!("Not indexing {}", document.path);
            return Ok(0);
        }

        let generation = self.shared.generation();
        match self
            .shared
            .index_document(document, &config, generation)
            .await?
        {
            IndexOutcome::Indexed(count) => Ok(count),
            IndexOutcome::Skipped | IndexOutcome::Cancelled => Ok(0),
        }
    }

    /// Index text that does not come from the vault, keyed by
    /// `metadata.source`
    #[inline]
    pub async fn index_content(&self, text: &str, metadata: ChunkMetadata) -> Result<usize> {
        self.ensure_ready()?;
        let config = self.config();
        if !config.enabled {
            return Ok(0);
        }

        let source = metadata.source.clone();
        let embedder = self.shared.store.read().await.embedder();
        let chunks =
            VectorStore::build_chunks(embedder.as_ref(), &source, text, metadata, &config).await;

        self.shared
            .store
            .write()
            .await
            .replace_document(&source, chunks)
            .await
    }

    /// Drop a document from the index. Returns the number of chunks removed.
    #[inline]
    pub async fn remove_file(&self, path: &str) -> Result<usize> {
        self.ensure_ready()?;
        self.shared.store.write().await.remove_document(path).await
    }

    /// Rank indexed chunks against `text`.
    ///
    /// Returns nothing while RAG is disabled. With grading enabled, results
    /// the grader rejects are dropped; if grading cannot run at all the
    /// ungraded results are returned.
    #[inline]
    pub async fn query(&self, text: &str) -> Result<Vec<SearchResult>> {
        let config = self.config();
        if !config.enabled {
            return Ok(Vec::new());
        }
        self.ensure_ready()?;

        let results = self
            .shared
            .store
            .read()
            .await
            .search(text, &config, config.effective_embedding_model())
            .await?;

        if !config.enable_grading_threshold || results.is_empty() {
            return Ok(results);
        }

        match self
            .grader
            .filter_results(text, results.clone(), &config)
            .await
        {
            Ok(filtered) => Ok(filtered),
            Err(e) => {
                error!("Grading failed, using ungraded results: {}", e);
                Ok(results)
            }
        }
    }

    /// Concatenate the best matches for `text` into a context block of at
    /// most `max_chars` characters (`context_window_limit` by default). The
    /// last block is cut short rather than left out.
    #[inline]
    pub async fn get_relevant_context(&self, text: &str, max_chars: Option<usize>) -> Result<String> {
        let results = self.query(text).await?;
        let budget = max_chars.unwrap_or_else(|| self.config().context_window_limit);

        let mut context = String::new();
        let mut used = 0;

        for result in &results {
            if used >= budget {
                break;
            }

            let block = format!(
                "Document: {}\nContent: {}\n\n",
                result.chunk.metadata.path, result.chunk.content
            );
            let block_chars = block.chars().count();

            if used + block_chars <= budget {
                context.push_str(&block);
                used += block_chars;
            } else {
                context.extend(block.chars().take(budget - used));
                break;
            }
        }

        debug!(
            "Built context of {} chars from {} results",
            context.chars().count(),
            results.len()
        );
        Ok(context)
    }

    /// Drop the index and rebuild it from the vault
    #[inline]
    pub async fn refresh_index(&self) -> Result<IndexingReport> {
        self.clear_index().await?;
        self.index_vault().await
    }

    /// Drop every chunk. Indexing in flight stops without committing more.
    #[inline]
    pub async fn clear_index(&self) -> Result<()> {
        self.ensure_ready()?;
        self.shared.cancel_indexing();
        self.shared.store.write().await.clear().await
    }

    #[inline]
    pub async fn get_stats(&self) -> RagStats {
        let config = self.config();
        let store_stats = self.shared.store.read().await.get_detailed_stats();

        RagStats {
            enabled: config.enabled,
            state: self.state(),
            indexing: self.is_indexing(),
            indexed_files: store_stats.indexed_files,
            chunk_count: store_stats.chunk_count,
            embedding_model: config.effective_embedding_model().to_string(),
        }
    }

    #[inline]
    pub async fn get_detailed_stats(&self) -> VectorStoreStats {
        self.shared.store.read().await.get_detailed_stats()
    }

    /// Replace the configuration.
    ///
    /// Disabling RAG discards the index. The vault watcher follows
    /// `embed_changed_files`.
    #[inline]
    pub async fn update_config(&self, config: RagConfig) -> Result<()> {
        config
            .validate()
            .map_err(|e| RagError::Config(e.to_string()))?;
        if self.state() == ManagerState::Destroyed {
            return Err(RagError::Destroyed);
        }

        let enabled = config.enabled;
        let watch = config.enabled && config.embed_changed_files;
        *self
            .shared
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
        info!("RAG configuration updated (enabled: {})", enabled);

        if !enabled {
            self.shared.cancel_indexing();
            self.shared.store.write().await.clear().await?;
        }

        if self.state() != ManagerState::Uninitialized {
            let watching = self.lock_watcher().is_some();
            if watch && !watching {
                self.attach_watcher()?;
            } else if !watch && watching {
                self.detach_watcher();
            }
        }

        Ok(())
    }

    /// Stop watching, cancel indexing and release the embedding worker.
    /// The manager cannot be used afterwards.
    #[inline]
    pub async fn destroy(&self) {
        if self.state() == ManagerState::Destroyed {
            return;
        }

        self.shared.cancel_indexing();
        self.detach_watcher();
        *self.lock_state() = ManagerState::Destroyed;
        self.embeddings.shutdown().await;
        info!("RAG manager destroyed");
    }

    fn attach_watcher(&self) -> Result<()> {
        let mut watcher = self.lock_watcher();
        if watcher.is_some() {
            return Ok(());
        }

        let events = self.shared.vault.watch()?;
        *watcher = Some(tokio::spawn(run_watcher(Arc::clone(&self.shared), events)));
        *self.lock_state() = ManagerState::Watching;

        info!("Watching vault for changes");
        Ok(())
    }

    fn detach_watcher(&self) {
        let Some(handle) = self.lock_watcher().take() else {
            return;
        };

        handle.abort();
        let mut state = self.lock_state();
        if *state == ManagerState::Watching {
            *state = ManagerState::Ready;
        }
        info!("Stopped watching vault");
    }
}

/// Re-index each modified file as soon as it is reported
async fn run_watcher(shared: Arc<Shared>, mut events: mpsc::Receiver<VaultEvent>) {
    while let Some(event) = events.recv().await {
        let config = shared.config();
        if !config.enabled {
            continue;
        }

        match event {
            VaultEvent::Modified(document) => {
                if !config.accepts_path(&document.path) {
                    continue;
                }

                let generation = shared.generation();
                match shared.index_document(&document, &config, generation).await {
                    Ok(IndexOutcome::Indexed(count)) => {
                        info!("Re-indexed {} ({} chunks)", document.path, count);
                    }
                    Ok(IndexOutcome::Skipped | IndexOutcome::Cancelled) => {}
                    Err(e) => warn!("Failed to re-index {}: {}", document.path, e),
                }
            }
            VaultEvent::Deleted(path) => {
                let removed = shared.store.write().await.remove_document(&path).await;
                match removed {
                    Ok(0) => {}
                    Ok(count) => info!("Removed {} ({} chunks)", path, count),
                    Err(e) => warn!("Failed to remove {} from the index: {}", path, e),
                }
            }
        }
    }

    debug!("Vault event stream closed");
}
