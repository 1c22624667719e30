#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text:latest";

pub const DEFAULT_GRADING_PROMPT: &str = r#"You are grading whether a retrieved note helps answer a question.

Question: {query}

Note path: {path}
Note content:
{document}

Rate the note on three independent scales from 0.0 to 1.0:
- relevance: how directly the note addresses the question
- accuracy: how likely the note's statements relevant to the question are correct
- support_quality: how well the note could be cited as support for an answer

Respond with only a JSON object of the form:
{"relevance": 0.0, "accuracy": 0.0, "support_quality": 0.0, "reasoning": "one sentence"}"#;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    #[default]
    Sentence,
    Paragraph,
    Fixed,
    /// Currently chunked exactly like `Sentence`
    Semantic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexingMode {
    Automatic,
    #[default]
    Manual,
}

/// Which model the document grader talks to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GraderModelSource {
    /// Whatever chat model is active when grading runs
    #[default]
    Chat,
    /// The model named by `grader_model`
    Dedicated,
}

/// Snapshot of every option of the retrieval pipeline.
///
/// A manager holds one of these and replaces it wholesale on update, so a
/// query always observes a consistent set of values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RagConfig {
    pub enabled: bool,
    /// Soft maximum chunk length in characters
    pub chunk_size: usize,
    /// Characters repeated at chunk boundaries
    pub chunk_overlap: usize,
    /// Chunks shorter than this are discarded
    pub min_chunk_size: usize,
    pub top_k: usize,
    /// Results scoring below this are dropped; 0 disables the filter
    pub similarity_threshold: f32,
    /// Empty means [`DEFAULT_EMBEDDING_MODEL`]
    pub embedding_model: String,
    pub chunking_strategy: ChunkingStrategy,
    /// Re-index files as soon as the vault reports a modification
    pub embed_changed_files: bool,
    pub indexing_mode: IndexingMode,
    /// Character budget for `get_relevant_context`
    pub context_window_limit: usize,
    pub enable_grading_threshold: bool,
    pub min_relevance_score: f32,
    pub min_accuracy_score: f32,
    pub min_support_quality_score: f32,
    pub grader_model_source: GraderModelSource,
    pub grader_model: Option<String>,
    /// Maximum number of grading calls in flight
    pub grader_parallel_processing: usize,
    pub grading_prompt: String,
    pub re_ranking_enabled: bool,
    pub include_folders: Vec<String>,
    pub exclude_folders: Vec<String>,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub file_types: Vec<String>,
}

impl Default for RagConfig {
    #[inline]
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_size: 100,
            top_k: 5,
            similarity_threshold: 0.5,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            chunking_strategy: ChunkingStrategy::Sentence,
            embed_changed_files: false,
            indexing_mode: IndexingMode::Manual,
            context_window_limit: 8000,
            enable_grading_threshold: false,
            min_relevance_score: 0.6,
            min_accuracy_score: 0.5,
            min_support_quality_score: 0.5,
            grader_model_source: GraderModelSource::Chat,
            grader_model: None,
            grader_parallel_processing: 3,
            grading_prompt: DEFAULT_GRADING_PROMPT.to_string(),
            re_ranking_enabled: false,
            include_folders: Vec::new(),
            exclude_folders: Vec::new(),
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
            file_types: vec!["md".to_string()],
        }
    }
}

impl RagConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.top_k == 0 {
            return Err(ConfigError::InvalidTopK(self.top_k));
        }

        let scores = [
            ("similarity_threshold", self.similarity_threshold),
            ("min_relevance_score", self.min_relevance_score),
            ("min_accuracy_score", self.min_accuracy_score),
            ("min_support_quality_score", self.min_support_quality_score),
        ];
        for (field, value) in scores {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidScore { field, value });
            }
        }

        if !(1..=32).contains(&self.grader_parallel_processing) {
            return Err(ConfigError::InvalidGraderParallelism(
                self.grader_parallel_processing,
            ));
        }

        if self.context_window_limit == 0 {
            return Err(ConfigError::InvalidContextWindow(self.context_window_limit));
        }

        if self.file_types.iter().all(|ext| ext.trim().is_empty()) {
            return Err(ConfigError::NoFileTypes);
        }

        if self.grader_model_source == GraderModelSource::Dedicated
            && self
                .grader_model
                .as_deref()
                .is_none_or(|model| model.trim().is_empty())
        {
            return Err(ConfigError::MissingGraderModel);
        }

        Ok(())
    }

    #[inline]
    pub fn effective_embedding_model(&self) -> &str {
        if self.embedding_model.trim().is_empty() {
            DEFAULT_EMBEDDING_MODEL
        } else {
            &self.embedding_model
        }
    }

    /// Whether a vault-relative path passes the folder and file type filters
    #[inline]
    pub fn accepts_path(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');

        let extension = path
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.contains('/'))
            .unwrap_or_default();
        let type_ok = self
            .file_types
            .iter()
            .any(|ft| ft.trim_start_matches('.').eq_ignore_ascii_case(extension));
        if !type_ok {
            return false;
        }

        if self
            .exclude_folders
            .iter()
            .any(|folder| in_folder(path, folder))
        {
            return false;
        }

        self.include_folders.is_empty()
            || self
                .include_folders
                .iter()
                .any(|folder| in_folder(path, folder))
    }

    /// Whether a document carrying `tags` passes the tag filters
    #[inline]
    pub fn accepts_tags(&self, tags: &[String]) -> bool {
        let has = |wanted: &String| {
            let wanted = wanted.trim_start_matches('#');
            tags.iter().any(|tag| tag.eq_ignore_ascii_case(wanted))
        };

        if self.exclude_tags.iter().any(has) {
            return false;
        }

        self.include_tags.is_empty() || self.include_tags.iter().any(has)
    }

    /// Whether the tag filters require reading document content
    #[inline]
    pub fn has_tag_filters(&self) -> bool {
        !self.include_tags.is_empty() || !self.exclude_tags.is_empty()
    }
}

fn in_folder(path: &str, folder: &str) -> bool {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        return true;
    }
    path.strip_prefix(folder)
        .is_some_and(|rest| rest.starts_with('/'))
}
