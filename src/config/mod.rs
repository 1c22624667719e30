// Configuration management module
// TOML-backed settings for the Ollama connection, the RAG pipeline and the vault

pub mod settings;

use anyhow::{Context, Result};
use console::style;

pub use settings::{Config, ConfigError, OllamaConfig, VECTOR_STORE_RESOURCE, VaultConfig};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}

/// Print the effective configuration
#[inline]
pub fn show_config() -> Result<()> {
    let config_dir = get_config_dir()?;
    let config = Config::load(&config_dir).context("Failed to load configuration")?;

    eprintln!("{}", style("Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Ollama Settings:").bold().yellow());
    match config.ollama_url() {
        Ok(url) => eprintln!("  URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  URL: {} ({})", style("Invalid").red(), e),
    }
    eprintln!("  Chat model: {}", style(&config.ollama.chat_model).cyan());
    eprintln!(
        "  Timeout: {}s, retries: {}",
        style(config.ollama.timeout_seconds).cyan(),
        style(config.ollama.retry_attempts).cyan()
    );

    let rag = &config.rag;
    eprintln!();
    eprintln!("{}", style("RAG Settings:").bold().yellow());
    eprintln!("  Enabled: {}", style(rag.enabled).cyan());
    eprintln!(
        "  Embedding model: {}",
        style(rag.effective_embedding_model()).cyan()
    );
    eprintln!(
        "  Chunking: {:?}, size {}, overlap {}, min {}",
        rag.chunking_strategy, rag.chunk_size, rag.chunk_overlap, rag.min_chunk_size
    );
    eprintln!(
        "  Top K: {}, similarity threshold: {}",
        style(rag.top_k).cyan(),
        style(rag.similarity_threshold).cyan()
    );
    eprintln!(
        "  Context window: {} chars",
        style(rag.context_window_limit).cyan()
    );
    eprintln!(
        "  Grading: {} (source {:?}, parallelism {})",
        style(rag.enable_grading_threshold).cyan(),
        rag.grader_model_source,
        rag.grader_parallel_processing
    );
    eprintln!(
        "  Indexing mode: {:?}, embed changed files: {}",
        rag.indexing_mode, rag.embed_changed_files
    );

    eprintln!();
    eprintln!("{}", style("Vault:").bold().yellow());
    match &config.vault.root {
        Some(root) => eprintln!("  Root: {}", style(root.display()).cyan()),
        None => eprintln!("  Root: {}", style("not set").red()),
    }
    eprintln!("  Extensions: {}", config.vault.extensions.join(", "));

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );

    Ok(())
}
