// Database module
// Persistent resource storage and the in-memory vector store built on it

pub mod storage;
pub mod vector_store;

pub use storage::{FileResourceStore, MemoryResourceStore, ResourceStore};
pub use vector_store::{
    ChunkMetadata, DocumentChunk, PassthroughReranker, Reranker, SearchResult, VectorStore,
    VectorStoreData, VectorStoreStats, cosine_similarity,
};
