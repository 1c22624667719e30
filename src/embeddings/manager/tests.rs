use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct CountingProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    async fn generate_embedding(&self, text: &str, model: &str) -> Result<Option<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match model {
            "broken" => Err(RagError::Embedding("model crashed".to_string())),
            "none" => Ok(None),
            _ => Ok(Some(vec![text.len() as f32, 1.0])),
        }
    }
}

fn manager() -> (EmbeddingManager, Arc<CountingProvider>) {
    let provider = Arc::new(CountingProvider::default());
    (EmbeddingManager::new(provider.clone()), provider)
}

#[tokio::test]
async fn requests_before_start_fail() {
    let (manager, provider) = manager();

    let result = manager.generate_embedding("text", "model").await;

    assert!(matches!(result, Err(RagError::EmbeddingWorkerStopped)));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    assert!(!manager.is_running());
}

#[tokio::test]
async fn forwards_requests_to_provider() {
    let (manager, provider) = manager();
    manager.start();

    let embedding = manager
        .generate_embedding("four", "model")
        .await
        .expect("worker is running");
    let missing = manager
        .generate_embedding("four", "none")
        .await
        .expect("worker is running");

    assert_eq!(embedding, Some(vec![4.0, 1.0]));
    assert_eq!(missing, None);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn provider_errors_pass_through() {
    let (manager, _provider) = manager();
    manager.start();

    let result = manager.generate_embedding("text", "broken").await;

    assert!(matches!(result, Err(RagError::Embedding(_))));
    assert!(manager.is_running(), "a failed job does not stop the worker");
}

#[tokio::test]
async fn start_is_idempotent_and_clones_share_worker() {
    let (manager, provider) = manager();
    manager.start();
    manager.start();

    let clone = manager.clone();
    let (a, b) = tokio::join!(
        manager.generate_embedding("a", "model"),
        clone.generate_embedding("bb", "model")
    );

    assert_eq!(a.expect("first"), Some(vec![1.0, 1.0]));
    assert_eq!(b.expect("second"), Some(vec![2.0, 1.0]));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    assert!(clone.is_running());
}

#[tokio::test]
async fn shutdown_stops_the_worker() {
    let (manager, _provider) = manager();
    manager.start();
    assert!(manager.is_running());

    manager.shutdown().await;

    assert!(!manager.is_running());
    let result = manager.generate_embedding("text", "model").await;
    assert!(matches!(result, Err(RagError::EmbeddingWorkerStopped)));

    // A stopped worker can be started again
    manager.start();
    assert!(manager.generate_embedding("x", "model").await.is_ok());
}

#[tokio::test]
async fn shutdown_without_start_is_noop() {
    let (manager, _provider) = manager();

    manager.shutdown().await;

    assert!(!manager.is_running());
}
