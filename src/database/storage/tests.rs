use super::*;
use tempfile::TempDir;

#[tokio::test]
async fn file_store_missing_resource_is_none() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = FileResourceStore::new(dir.path());

    let bytes = store
        .read_resource("vector-store.json")
        .await
        .expect("missing file is not an error");

    assert!(bytes.is_none());
}

#[tokio::test]
async fn file_store_writes_and_reads_back() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = FileResourceStore::new(dir.path().join("data"));

    store
        .write_resource("nested/store.json", b"{\"chunks\":[]}")
        .await
        .expect("write should succeed");

    let bytes = store
        .read_resource("nested/store.json")
        .await
        .expect("read should succeed");
    assert_eq!(bytes.as_deref(), Some(b"{\"chunks\":[]}".as_slice()));

    // Nothing is left behind from the temporary write
    assert!(!dir.path().join("data/nested/store.json.tmp").exists());
}

#[tokio::test]
async fn file_store_overwrites() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = FileResourceStore::new(dir.path());

    store.write_resource("a.json", b"first").await.expect("write");
    store.write_resource("a.json", b"second").await.expect("write");

    let bytes = store.read_resource("a.json").await.expect("read");
    assert_eq!(bytes.as_deref(), Some(b"second".as_slice()));
}

#[tokio::test]
async fn file_store_rejects_escaping_paths() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = FileResourceStore::new(dir.path());

    for path in ["../outside.json", "/etc/passwd", "", "a/../../b"] {
        let result = store.write_resource(path, b"x").await;
        assert!(
            matches!(result, Err(RagError::Storage(_))),
            "path {:?} should be rejected",
            path
        );
    }
}

#[tokio::test]
async fn memory_store_round_trip() {
    let store = MemoryResourceStore::new();

    assert!(store.read_resource("x").await.expect("read").is_none());

    store.write_resource("x", b"payload").await.expect("write");

    assert_eq!(
        store.read_resource("x").await.expect("read").as_deref(),
        Some(b"payload".as_slice())
    );
}
