use super::*;
use crate::embeddings::ChatMessage;
use crate::rag::ManagerState;
use crate::{RagError, Result as RagResult};
use async_trait::async_trait;
use serde_json::json;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct CountingEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    async fn generate_embedding(&self, _text: &str, _model: &str) -> RagResult<Option<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(vec![1.0, 0.0]))
    }
}

struct NoChat;

#[async_trait]
impl ChatProvider for NoChat {
    async fn chat(&self, _messages: &[ChatMessage], _model: &str) -> RagResult<String> {
        Err(RagError::Llm("no chat in this test".to_string()))
    }
}

fn vault_with_notes() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    for name in ["one", "two", "three", "four"] {
        fs::write(
            dir.path().join(format!("{}.md", name)),
            format!("# {}\n\nA short note called {}.", name, name),
        )
        .expect("write note");
    }
    dir
}

fn automatic_config(home: &TempDir) -> Config {
    let mut config = Config::load(home.path()).expect("defaults load");
    config.rag.indexing_mode = IndexingMode::Automatic;
    config
}

#[tokio::test]
async fn index_command_embeds_each_note_once() {
    let vault = vault_with_notes();
    let home = TempDir::new().expect("Failed to create temp dir");
    let config = automatic_config(&home);
    let embedder = Arc::new(CountingEmbedder::default());
    let provider: Arc<CountingEmbedder> = Arc::clone(&embedder);

    let manager = build_manager(&config, vault.path(), provider, Arc::new(NoChat), Mode::Index);
    manager.initialize().await.expect("initialize");
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);

    let report = manager.index_vault().await.expect("index");
    manager.destroy().await;

    assert_eq!(report.indexed, 4);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn read_commands_leave_the_vault_alone() {
    let vault = vault_with_notes();
    let home = TempDir::new().expect("Failed to create temp dir");
    let config = automatic_config(&home);
    let embedder = Arc::new(CountingEmbedder::default());
    let provider: Arc<CountingEmbedder> = Arc::clone(&embedder);

    let manager = build_manager(&config, vault.path(), provider, Arc::new(NoChat), Mode::Read);
    manager.initialize().await.expect("initialize");
    let stats = manager.get_stats().await;
    manager.destroy().await;

    assert_eq!(stats.chunk_count, 0);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn watch_command_keeps_automatic_indexing() {
    let vault = vault_with_notes();
    let home = TempDir::new().expect("Failed to create temp dir");
    let config = automatic_config(&home);
    let embedder = Arc::new(CountingEmbedder::default());
    let provider: Arc<CountingEmbedder> = Arc::clone(&embedder);

    let manager = build_manager(&config, vault.path(), provider, Arc::new(NoChat), Mode::Watch);
    manager.initialize().await.expect("initialize");
    let state = manager.state();
    let stats = manager.get_stats().await;
    manager.destroy().await;

    assert_eq!(state, ManagerState::Watching);
    assert_eq!(stats.indexed_files, 4);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
}

#[test]
fn required_models_follow_grading_settings() {
    let mut config = Config::default();
    let embedding = config.rag.effective_embedding_model().to_string();
    assert_eq!(required_models(&config), vec![embedding.clone()]);

    config.rag.enable_grading_threshold = true;
    assert_eq!(
        required_models(&config),
        vec![embedding.clone(), config.ollama.chat_model.clone()]
    );

    config.rag.grader_model_source = GraderModelSource::Dedicated;
    config.rag.grader_model = Some("judge:latest".to_string());
    assert_eq!(
        required_models(&config),
        vec![embedding, "judge:latest".to_string()]
    );
}

fn ollama_for(server: &MockServer) -> OllamaClient {
    let url = Url::parse(&server.uri()).expect("mock server uri is valid");
    OllamaClient::with_base_url(url)
        .with_timeout(Duration::from_secs(5))
        .with_retry_attempts(1)
        .with_retry_delay(Duration::from_millis(1))
}

#[tokio::test]
async fn missing_models_stop_the_command() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{ "name": "nomic-embed-text:latest" }]
        })))
        .mount(&server)
        .await;
    let client = ollama_for(&server);

    let ready = verify_ollama(&client, vec!["nomic-embed-text:latest".to_string()]).await;
    let missing = verify_ollama(
        &client,
        vec![
            "nomic-embed-text:latest".to_string(),
            "llama3.2:latest".to_string(),
        ],
    )
    .await;

    assert!(ready.is_ok());
    let err = missing.expect_err("chat model is not installed");
    assert!(format!("{:#}", err).contains("llama3.2:latest"));
}

#[tokio::test]
async fn unreachable_ollama_stops_the_command() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let client = ollama_for(&server);

    let result = verify_ollama(&client, vec!["nomic-embed-text:latest".to_string()]).await;

    assert!(result.is_err());
}
