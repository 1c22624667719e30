// Document grader
// LLM-based second pass over search results


use std::sync::{Arc, PoisonError, RwLock};

use futures::{StreamExt, stream};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::database::SearchResult;
use crate::embeddings::{ChatMessage, ChatProvider};
use crate::rag::{GraderModelSource, RagConfig};
use crate::{RagError, Result};

const GRADER_SYSTEM_PROMPT: &str =
    "You are a strict relevance grader. Respond with a single JSON object and nothing else.";

/// Resolves the active chat model at the moment it is needed
pub trait ModelSource: Send + Sync {
    fn current_model(&self) -> Option<String>;
}

/// A model name fixed at construction
#[derive(Debug, Clone)]
pub struct StaticModel(pub String);

impl ModelSource for StaticModel {
    #[inline]
    fn current_model(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// A model name that can be changed after the grader is built.
///
/// Clones share the same value.
#[derive(Debug, Clone, Default)]
pub struct SharedModel {
    model: Arc<RwLock<Option<String>>>,
}

impl SharedModel {
    #[inline]
    pub fn new(model: Option<String>) -> Self {
        Self {
            model: Arc::new(RwLock::new(model)),
        }
    }

    #[inline]
    pub fn set(&self, model: Option<String>) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = model;
    }
}

impl ModelSource for SharedModel {
    #[inline]
    fn current_model(&self) -> Option<String> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeRequest {
    pub query: String,
    pub chunk_id: String,
    pub content: String,
    pub path: String,
    pub title: Option<String>,
}

impl GradeRequest {
    #[inline]
    pub fn for_result(query: &str, result: &SearchResult) -> Self {
        Self {
            query: query.to_string(),
            chunk_id: result.chunk.id.clone(),
            content: result.chunk.content.clone(),
            path: result.chunk.metadata.path.clone(),
            title: result.chunk.metadata.title.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentGrade {
    pub chunk_id: String,
    pub should_use: bool,
    pub relevance_score: f32,
    pub accuracy_score: f32,
    pub support_quality_score: f32,
    pub reasoning: Option<String>,
    /// False when grading failed and the chunk was kept by default
    pub graded: bool,
}

impl DocumentGrade {
    fn ungraded(chunk_id: &str) -> Self {
        Self {
            chunk_id: chunk_id.to_string(),
            should_use: true,
            relevance_score: 0.0,
            accuracy_score: 0.0,
            support_quality_score: 0.0,
            reasoning: None,
            graded: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawGrade {
    #[serde(alias = "relevance_score", alias = "relevanceScore")]
    relevance: f32,
    #[serde(alias = "accuracy_score", alias = "accuracyScore")]
    accuracy: f32,
    #[serde(
        alias = "supportQuality",
        alias = "support_quality_score",
        alias = "supportQualityScore"
    )]
    support_quality: f32,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Grades retrieved chunks with a chat model.
pub struct DocumentGrader {
    chat: Arc<dyn ChatProvider>,
    chat_model: Arc<dyn ModelSource>,
}

impl std::fmt::Debug for DocumentGrader {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentGrader")
            .field("chat_model", &self.chat_model.current_model())
            .finish_non_exhaustive()
    }
}

impl DocumentGrader {
    /// # Arguments
    /// * `chat` - Provider the grading prompts are sent to
    /// * `chat_model` - The active chat model, consulted on every grading run
    ///   unless a dedicated grader model is configured
    #[inline]
    pub fn new(chat: Arc<dyn ChatProvider>, chat_model: Arc<dyn ModelSource>) -> Self {
        Self { chat, chat_model }
    }

    /// Pick the model for this grading run
    #[inline]
    pub fn resolve_model(&self, config: &RagConfig) -> Result<String> {
        let model = match config.grader_model_source {
            GraderModelSource::Dedicated => config.grader_model.clone(),
            GraderModelSource::Chat => self.chat_model.current_model(),
        };

        model
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| {
                RagError::Grading(format!(
                    "No grader model available for source {:?}",
                    config.grader_model_source
                ))
            })
    }

    /// Grade every request, at most `grader_parallel_processing` at a time.
    ///
    /// Grades come back in request order. A chunk whose grading call fails is
    /// kept. Only the absence of a usable model fails the whole run.
    #[inline]
    pub async fn grade_documents(
        &self,
        requests: &[GradeRequest],
        config: &RagConfig,
    ) -> Result<Vec<DocumentGrade>> {
        let model = self.resolve_model(config)?;
        let parallel = config.grader_parallel_processing.max(1);

        debug!(
            "Grading {} documents with {} ({} in parallel)",
            requests.len(),
            model,
            parallel
        );

        let grades: Vec<DocumentGrade> = stream::iter(requests)
            .map(|request| self.grade_one(request, &model, config))
            .buffered(parallel)
            .collect()
            .await;

        Ok(grades)
    }

    /// Drop the results the grader rejects, keeping rank order
    #[inline]
    pub async fn filter_results(
        &self,
        query: &str,
        results: Vec<SearchResult>,
        config: &RagConfig,
    ) -> Result<Vec<SearchResult>> {
        let requests: Vec<GradeRequest> = results
            .iter()
            .map(|result| GradeRequest::for_result(query, result))
            .collect();

        let grades = self.grade_documents(&requests, config).await?;

        let before = results.len();
        let kept: Vec<SearchResult> = results
            .into_iter()
            .zip(grades)
            .filter_map(|(result, grade)| grade.should_use.then_some(result))
            .collect();

        info!("Grading kept {} of {} results", kept.len(), before);
        Ok(kept)
    }

    async fn grade_one(
        &self,
        request: &GradeRequest,
        model: &str,
        config: &RagConfig,
    ) -> DocumentGrade {
        let prompt = build_prompt(&config.grading_prompt, request);
        let messages = [
            ChatMessage::system(GRADER_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];

        let reply = match self.chat.chat(&messages, model).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Grading {} failed, keeping it: {}", request.chunk_id, e);
                return DocumentGrade::ungraded(&request.chunk_id);
            }
        };

        let Some(raw) = parse_grade(&reply) else {
            warn!(
                "Unparsable grade for {}, keeping it: {:?}",
                request.chunk_id, reply
            );
            return DocumentGrade::ungraded(&request.chunk_id);
        };

        let relevance = clamp_score(raw.relevance);
        let accuracy = clamp_score(raw.accuracy);
        let support = clamp_score(raw.support_quality);

        let should_use = relevance >= config.min_relevance_score
            && accuracy >= config.min_accuracy_score
            && support >= config.min_support_quality_score;

        debug!(
            "Graded {}: relevance {:.2}, accuracy {:.2}, support {:.2} -> {}",
            request.chunk_id, relevance, accuracy, support, should_use
        );

        DocumentGrade {
            chunk_id: request.chunk_id.clone(),
            should_use,
            relevance_score: relevance,
            accuracy_score: accuracy,
            support_quality_score: support,
            reasoning: raw.reasoning,
            graded: true,
        }
    }
}

fn build_prompt(template: &str, request: &GradeRequest) -> String {
    let path = match &request.title {
        Some(title) => format!("{} ({})", request.path, title),
        None => request.path.clone(),
    };

    fill_template(
        template,
        &[
            ("{query}", request.query.as_str()),
            ("{path}", path.as_str()),
            ("{document}", request.content.as_str()),
        ],
    )
}

/// Substitute placeholders in one pass; inserted values are never rescanned
fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut filled = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        filled.push_str(&rest[..open]);
        let candidate = &rest[open..];

        match values.iter().find(|(key, _)| candidate.starts_with(key)) {
            Some((key, value)) => {
                filled.push_str(value);
                rest = &candidate[key.len()..];
            }
            None => {
                filled.push('{');
                rest = &candidate[1..];
            }
        }
    }

    filled.push_str(rest);
    filled
}

fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Parse the first JSON object in a model reply. Models often wrap the
/// object in prose or code fences.
fn parse_grade(reply: &str) -> Option<RawGrade> {
    let object = first_json_object(reply)?;
    serde_json::from_str(object).ok()
}

fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0_usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }

    None
}
