// Embeddings module
// Provider seams for embedding and chat models, the Ollama client, the
// background embedding worker and content chunking

pub mod chunking;
pub mod manager;
pub mod ollama;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use chunking::{ChunkLimits, chunk_content};
pub use manager::EmbeddingManager;
pub use ollama::OllamaClient;

/// Turns text into a vector for a given model.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns `Ok(None)` when no embedding is available for the text.
    /// That is an expected outcome, unlike `Err`.
    async fn generate_embedding(&self, text: &str, model: &str) -> Result<Option<Vec<f32>>>;
}

#[async_trait]
impl<T: EmbeddingProvider + ?Sized> EmbeddingProvider for Arc<T> {
    #[inline]
    async fn generate_embedding(&self, text: &str, model: &str) -> Result<Option<Vec<f32>>> {
        (**self).generate_embedding(text, model).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    #[inline]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    #[inline]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Single-shot chat completion.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], model: &str) -> Result<String>;
}

#[async_trait]
impl<T: ChatProvider + ?Sized> ChatProvider for Arc<T> {
    #[inline]
    async fn chat(&self, messages: &[ChatMessage], model: &str) -> Result<String> {
        (**self).chat(messages, model).await
    }
}
