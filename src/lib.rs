use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Grading error: {0}")]
    Grading(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Vault error: {0}")]
    Vault(String),

    #[error("RAG manager is not initialized. Call initialize() first.")]
    NotInitialized,

    #[error("RAG manager has been destroyed")]
    Destroyed,

    #[error("Embedding worker is not running")]
    EmbeddingWorkerStopped,

    #[error("Vault indexing is already in progress")]
    IndexingInProgress,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod grader;
pub mod rag;
pub mod vault;
