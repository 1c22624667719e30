#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// End-to-end tests: a vault on disk, a mocked Ollama server and the file-backed store

use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;
use vault_rag::config::VECTOR_STORE_RESOURCE;
use vault_rag::database::FileResourceStore;
use vault_rag::embeddings::OllamaClient;
use vault_rag::grader::{DocumentGrader, StaticModel};
use vault_rag::rag::{RagConfig, RagManager};
use vault_rag::vault::FsVault;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Embeds a prompt by which of three keywords it mentions
struct KeywordEmbeddings;

impl Respond for KeywordEmbeddings {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(body) = request.body_json::<Value>() else {
            return ResponseTemplate::new(400);
        };
        let prompt = body["prompt"].as_str().unwrap_or_default().to_lowercase();
        let dimension = |word: &str| if prompt.contains(word) { 1.0 } else { 0.0 };

        ResponseTemplate::new(200).set_body_json(json!({
            "embedding": [dimension("alpha"), dimension("beta"), dimension("gamma"), 0.1]
        }))
    }
}

fn grade_reply(relevance: f32) -> ResponseTemplate {
    let grade = json!({
        "relevanceScore": relevance,
        "accuracyScore": 0.9,
        "supportQualityScore": 0.9,
        "reasoning": "scored by the mock"
    });
    ResponseTemplate::new(200).set_body_json(json!({
        "message": { "role": "assistant", "content": grade.to_string() }
    }))
}

fn create_vault() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let root = dir.path();

    fs::create_dir_all(root.join("notes")).expect("mkdir");
    fs::create_dir_all(root.join(".obsidian")).expect("mkdir");
    fs::write(
        root.join("notes/alpha.md"),
        "# Alpha Project\n\nThe alpha project ships the storage engine in March.",
    )
    .expect("write");
    fs::write(
        root.join("notes/beta.md"),
        "# Beta\n\nBeta covers the testing schedule only.",
    )
    .expect("write");
    fs::write(root.join("gamma.md"), "Gamma mentions alpha in passing.").expect("write");
    fs::write(root.join(".obsidian/alpha.md"), "alpha settings").expect("write");

    dir
}

fn open_manager(server: &MockServer, vault: &Path, data: &Path, config: RagConfig) -> RagManager {
    let url = Url::parse(&server.uri()).expect("mock server uri is valid");
    let client = Arc::new(
        OllamaClient::with_base_url(url)
            .with_timeout(Duration::from_secs(5))
            .with_retry_attempts(2)
            .with_retry_delay(Duration::from_millis(1)),
    );
    let chat: Arc<OllamaClient> = Arc::clone(&client);
    let grader = DocumentGrader::new(chat, Arc::new(StaticModel("llama-test".to_string())));

    RagManager::with_providers(
        config,
        Arc::new(FsVault::new(vault)),
        Arc::new(FileResourceStore::new(data)),
        client,
        grader,
    )
}

async fn mock_embeddings(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .respond_with(KeywordEmbeddings)
        .mount(server)
        .await;
}

#[tokio::test]
async fn indexes_vault_and_reloads_persisted_index() {
    let server = MockServer::start().await;
    mock_embeddings(&server).await;
    let vault = create_vault();
    let data = TempDir::new().expect("Failed to create temp dir");

    let manager = open_manager(&server, vault.path(), data.path(), RagConfig::default());
    manager.initialize().await.expect("initialize");
    let report = manager.index_vault().await.expect("index");

    assert_eq!(report.total, 3);
    assert_eq!(report.indexed, 3);
    assert_eq!(report.failed, 0);
    assert!(!report.cancelled);

    let results = manager.query("alpha").await.expect("query");
    let paths: Vec<&str> = results
        .iter()
        .map(|r| r.chunk.metadata.path.as_str())
        .collect();
    assert_eq!(paths.first(), Some(&"notes/alpha.md"));
    assert!(paths.contains(&"gamma.md"));
    assert!(!paths.contains(&"notes/beta.md"));
    assert_eq!(
        results[0].chunk.metadata.title.as_deref(),
        Some("Alpha Project")
    );

    let chunk_count = manager.get_stats().await.chunk_count;
    manager.destroy().await;
    assert!(data.path().join(VECTOR_STORE_RESOURCE).exists());

    let reopened = open_manager(&server, vault.path(), data.path(), RagConfig::default());
    reopened.initialize().await.expect("initialize");
    let stats = reopened.get_stats().await;
    assert_eq!(stats.chunk_count, chunk_count);
    assert_eq!(stats.indexed_files, 3);

    let context = reopened
        .get_relevant_context("alpha", Some(400))
        .await
        .expect("context");
    assert!(context.starts_with("Document: notes/alpha.md\nContent: "));
    assert!(context.chars().count() <= 400);
    reopened.destroy().await;
}

#[tokio::test]
async fn embedding_outage_falls_back_to_keyword_search() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let vault = create_vault();
    let data = TempDir::new().expect("Failed to create temp dir");

    let manager = open_manager(&server, vault.path(), data.path(), RagConfig::default());
    manager.initialize().await.expect("initialize");
    let report = manager.index_vault().await.expect("index");
    assert_eq!(report.indexed, 3);

    let detailed = manager.get_detailed_stats().await;
    assert_eq!(detailed.embedded_chunks, 0);
    assert!(detailed.chunk_count >= 3);

    let results = manager.query("beta").await.expect("query");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.metadata.path, "notes/beta.md");
    assert!((results[0].similarity - 1.0).abs() < f32::EPSILON);
    manager.destroy().await;
}

#[tokio::test]
async fn grading_filters_rejected_documents() {
    let server = MockServer::start().await;
    mock_embeddings(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(grade_reply(0.1))
        .mount(&server)
        .await;
    let vault = create_vault();
    let data = TempDir::new().expect("Failed to create temp dir");
    let config = RagConfig {
        enable_grading_threshold: true,
        ..RagConfig::default()
    };

    let manager = open_manager(&server, vault.path(), data.path(), config);
    manager.initialize().await.expect("initialize");
    manager.index_vault().await.expect("index");

    let results = manager.query("alpha").await.expect("query");

    assert!(results.is_empty());
    manager.destroy().await;
}

#[tokio::test]
async fn grading_outage_keeps_results() {
    let server = MockServer::start().await;
    mock_embeddings(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let vault = create_vault();
    let data = TempDir::new().expect("Failed to create temp dir");
    let config = RagConfig {
        enable_grading_threshold: true,
        ..RagConfig::default()
    };

    let manager = open_manager(&server, vault.path(), data.path(), config);
    manager.initialize().await.expect("initialize");
    manager.index_vault().await.expect("index");

    let results = manager.query("alpha").await.expect("query");

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].chunk.metadata.path, "notes/alpha.md");
    manager.destroy().await;
}

#[tokio::test]
async fn excluded_folders_are_not_indexed() {
    let server = MockServer::start().await;
    mock_embeddings(&server).await;
    let vault = create_vault();
    let data = TempDir::new().expect("Failed to create temp dir");
    let config = RagConfig {
        exclude_folders: vec!["notes".to_string()],
        ..RagConfig::default()
    };

    let manager = open_manager(&server, vault.path(), data.path(), config);
    manager.initialize().await.expect("initialize");
    let report = manager.index_vault().await.expect("index");

    assert_eq!(report.indexed, 1);
    assert_eq!(report.skipped, 2);
    let results = manager.query("alpha").await.expect("query");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.metadata.path, "gamma.md");
    manager.destroy().await;
}
