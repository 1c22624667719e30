#[cfg(test)]
mod tests;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{Config, VECTOR_STORE_RESOURCE, get_config_dir};
use crate::database::FileResourceStore;
use crate::embeddings::{ChatProvider, EmbeddingProvider, OllamaClient};
use crate::grader::{DocumentGrader, StaticModel};
use crate::rag::{GraderModelSource, IndexProgress, IndexingMode, RagManager};
use crate::vault::FsVault;

/// Characters of chunk content shown per query result
const SNIPPET_CHARS: usize = 160;

/// What a command does with the index once it is open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Reads or clears the stored index
    Read,
    /// Rebuilds the index from the vault
    Index,
    /// Keeps the index in sync with the vault
    Watch,
}

/// Models the configured pipeline needs installed in Ollama
fn required_models(config: &Config) -> Vec<String> {
    let mut models = vec![config.rag.effective_embedding_model().to_string()];

    if config.rag.enable_grading_threshold {
        let grader = match config.rag.grader_model_source {
            GraderModelSource::Dedicated => config.rag.grader_model.clone(),
            GraderModelSource::Chat => Some(config.ollama.chat_model.clone()),
        };
        if let Some(model) = grader.filter(|model| !model.trim().is_empty()) {
            if !models.contains(&model) {
                models.push(model);
            }
        }
    }

    models
}

/// Fail before any work is queued when Ollama is unreachable or a model is
/// missing
async fn verify_ollama(client: &OllamaClient, models: Vec<String>) -> Result<()> {
    let base_url = client.base_url().clone();
    let client = client.clone();

    let checked = tokio::task::spawn_blocking(move || {
        let names: Vec<&str> = models.iter().map(String::as_str).collect();
        client.health_check(&names)
    })
    .await
    .context("Ollama health check did not complete")?;

    if let Err(e) = checked {
        error!("Ollama at {} is not ready: {:#}", base_url, e);
        bail!("Cannot use Ollama at {}: {:#}", base_url, e);
    }

    info!("Ollama connected at {}", base_url);
    Ok(())
}

/// Assemble the manager a command works with.
///
/// Only [`Mode::Watch`] follows the vault and honours automatic indexing;
/// every other command leaves the vault alone when the manager initializes.
fn build_manager(
    config: &Config,
    root: &Path,
    embedder: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatProvider>,
    mode: Mode,
) -> RagManager {
    let mut rag_config = config.rag.clone();
    rag_config.embed_changed_files = mode == Mode::Watch;
    if mode != Mode::Watch {
        rag_config.indexing_mode = IndexingMode::Manual;
    }

    let grader = DocumentGrader::new(
        chat,
        Arc::new(StaticModel(config.ollama.chat_model.clone())),
    );

    RagManager::with_providers(
        rag_config,
        Arc::new(FsVault::from_config(root, &config.vault)),
        Arc::new(FileResourceStore::new(config.data_dir())),
        embedder,
        grader,
    )
}

/// Build a manager from the saved configuration and initialize it.
///
/// `vault` overrides the configured vault root. Commands that embed the
/// vault check Ollama first.
async fn open_manager(vault: Option<PathBuf>, mode: Mode) -> Result<RagManager> {
    let config_dir = get_config_dir()?;
    let config = Config::load(&config_dir).context("Failed to load configuration")?;

    let Some(root) = vault.or_else(|| config.vault.root.clone()) else {
        bail!(
            "No vault configured. Set vault.root in {} or pass --vault",
            config.config_file_path().display()
        );
    };
    if !root.is_dir() {
        bail!("Vault directory does not exist: {}", root.display());
    }

    let client = OllamaClient::new(&config.ollama).context("Failed to create Ollama client")?;
    if mode != Mode::Read {
        verify_ollama(&client, required_models(&config)).await?;
    }
    let client = Arc::new(client);
    let chat: Arc<OllamaClient> = Arc::clone(&client);

    info!(
        "Opening vault {} with index in {}",
        root.display(),
        config.data_dir().join(VECTOR_STORE_RESOURCE).display()
    );

    let manager = build_manager(&config, &root, client, chat, mode);
    manager
        .initialize()
        .await
        .context("Failed to initialize RAG manager")?;

    Ok(manager)
}

/// Write a default configuration file unless one exists
#[inline]
pub fn init_config() -> Result<()> {
    let config_dir = get_config_dir()?;
    let config = Config::load(&config_dir).context("Failed to load configuration")?;
    let path = config.config_file_path();

    if path.exists() {
        println!("Configuration already exists: {}", path.display());
    } else {
        config.save()?;
        println!("Wrote default configuration to {}", path.display());
    }
    println!("Edit it to set vault.root, then run 'vault-rag index'.");

    Ok(())
}

/// Index the whole vault, showing progress on an interactive terminal
#[inline]
pub async fn index_vault(vault: Option<PathBuf>) -> Result<()> {
    let manager = open_manager(vault, Mode::Index).await?;

    let bar = if console::user_attended_stderr() {
        ProgressBar::new(0).with_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} [{pos}/{len}] Indexing {msg}")
                .expect("style template is valid"),
        )
    } else {
        ProgressBar::hidden()
    };

    let result = manager
        .index_vault_with_progress(|progress: IndexProgress| {
            bar.set_length(progress.total as u64);
            bar.set_position(progress.processed as u64);
            if progress.failed > 0 {
                bar.set_message(format!("({} failed)", progress.failed));
            }
        })
        .await;
    bar.finish_and_clear();
    manager.destroy().await;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!("Indexing failed: {}", e);
            return Err(e.into());
        }
    };

    if report.cancelled {
        println!("{}", style("Indexing was cancelled").yellow());
    }
    println!(
        "Indexed {} of {} documents ({} chunks) in {:.1}s",
        style(report.indexed).green(),
        report.total,
        report.chunks_created,
        report.duration.as_secs_f64()
    );
    if report.skipped > 0 {
        println!("Skipped by filters: {}", report.skipped);
    }
    if report.failed > 0 {
        println!("Failed: {}", style(report.failed).red());
    }

    Ok(())
}

/// Search the index and print the matching chunks
#[inline]
pub async fn query(text: &str) -> Result<()> {
    let manager = open_manager(None, Mode::Read).await?;
    let results = manager.query(text).await;
    manager.destroy().await;
    let results = results?;

    if results.is_empty() {
        println!("No relevant documents found for '{}'", text);
        return Ok(());
    }

    for (rank, result) in results.iter().enumerate() {
        let chunk = &result.chunk;
        let heading = match &chunk.metadata.title {
            Some(title) => format!("{} ({})", chunk.metadata.path, title),
            None => chunk.metadata.path.clone(),
        };
        println!(
            "{}. {} {}",
            rank + 1,
            style(heading).bold(),
            style(format!("[{:.3}]", result.similarity)).dim()
        );

        let snippet: String = chunk
            .content
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(SNIPPET_CHARS)
            .collect();
        println!("   {}", snippet);
    }

    Ok(())
}

/// Print the context block that would accompany a question
#[inline]
pub async fn context(text: &str, max_chars: Option<usize>) -> Result<()> {
    let manager = open_manager(None, Mode::Read).await?;
    let context = manager.get_relevant_context(text, max_chars).await;
    manager.destroy().await;

    print!("{}", context?);
    Ok(())
}

#[inline]
pub async fn show_stats() -> Result<()> {
    let manager = open_manager(None, Mode::Read).await?;
    let stats = manager.get_stats().await;
    let detailed = manager.get_detailed_stats().await;
    manager.destroy().await;

    println!("{}", style("Index Status").bold().cyan());
    println!("  Enabled: {}", stats.enabled);
    println!("  Embedding model: {}", stats.embedding_model);
    println!("  Indexed files: {}", style(detailed.indexed_files).green());
    println!(
        "  Chunks: {} ({} embedded)",
        detailed.chunk_count, detailed.embedded_chunks
    );
    println!("  Content size: {} bytes", detailed.total_content_size);

    let format_time = |millis: Option<i64>| {
        millis
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map_or_else(|| "never".to_string(), |time| time.to_rfc3339())
    };
    println!("  Created: {}", format_time(detailed.created_at));
    println!("  Updated: {}", format_time(detailed.updated_at));

    Ok(())
}

#[inline]
pub async fn clear_index() -> Result<()> {
    let manager = open_manager(None, Mode::Read).await?;
    let result = manager.clear_index().await;
    manager.destroy().await;
    result?;

    println!("Index cleared");
    Ok(())
}

/// Keep the index in sync with the vault until interrupted
#[inline]
pub async fn watch_vault(vault: Option<PathBuf>) -> Result<()> {
    let manager = open_manager(vault, Mode::Watch).await?;
    println!("Watching vault for changes. Press Ctrl-C to stop.");

    let result = tokio::signal::ctrl_c().await;
    manager.destroy().await;
    result.context("Failed to listen for Ctrl-C")?;

    println!("Stopped watching");
    Ok(())
}
