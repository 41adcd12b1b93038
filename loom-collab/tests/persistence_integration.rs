//! Persistence integration tests.
//!
//! Verifies:
//! - Catalog CRUD through the local store
//! - Duplicate keeps connections under fresh ids
//! - Export/import roundtrip
//! - Data survives reopening the store
//! - Server recovery from persistent storage

use loom_collab::server::{ServerConfig, SyncServer};
use loom_collab::storage::{LocalStore, StoreConfig, StoreError, DEFAULT_TITLE};
use loom_core::{DocumentPayload, NodeKind};
use std::collections::HashSet;
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open(path: &std::path::Path) -> LocalStore {
    LocalStore::open(StoreConfig::for_testing(path)).unwrap()
}

/// Agent → Tool → Output chain.
fn chain() -> DocumentPayload {
    let mut payload = DocumentPayload::new();
    let agent = payload.add_node(NodeKind::Agent, Some("Planner"), None);
    let tool = payload.add_node(NodeKind::Tool, None, None);
    let output = payload.add_node(NodeKind::Output, None, None);
    payload.connect(&agent, &tool, None, None).unwrap();
    payload.connect(&tool, &output, Some("out"), Some("in")).unwrap();
    payload
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

#[test]
fn test_catalog_lifecycle() {
    let dir = tempdir().unwrap();
    let store = open(&dir.path().join("db"));

    let first = store.create(Some("First")).unwrap();
    let second = store.create(None).unwrap();
    assert_eq!(second.title, DEFAULT_TITLE);
    assert_eq!(store.list().len(), 2);

    std::thread::sleep(std::time::Duration::from_millis(5));
    store.save_payload(&first.id, &chain());
    let meta = store.meta(&first.id).unwrap();
    assert_eq!((meta.node_count, meta.edge_count), (3, 2));
    assert_eq!(store.list()[0].id, first.id, "most recently updated first");

    assert!(store.rename(&second.id, "Second").unwrap());
    assert_eq!(store.meta(&second.id).unwrap().title, "Second");

    assert!(store.delete(&first.id).unwrap());
    assert!(!store.contains(&first.id));
    assert!(store.payload(&first.id).is_none());
    assert!(!store.delete(&first.id).unwrap());
    assert_eq!(store.list().len(), 1);
}

#[test]
fn test_duplicate_remaps_connections() {
    let dir = tempdir().unwrap();
    let store = open(&dir.path().join("db"));
    let meta = store.create(Some("Flow")).unwrap();
    let original = chain();
    store.save_payload(&meta.id, &original);

    let copy_meta = store.duplicate(&meta.id).unwrap();
    assert_ne!(copy_meta.id, meta.id);
    assert_eq!(copy_meta.title, "Flow (Copy)");

    let copy = store.payload(&copy_meta.id).unwrap();
    assert_eq!(copy.nodes.len(), 3);
    assert_eq!(copy.edges.len(), 2);

    let old_ids: HashSet<_> = original.nodes.iter().map(|n| n.id.clone()).collect();
    let new_ids: HashSet<_> = copy.nodes.iter().map(|n| n.id.clone()).collect();
    assert!(old_ids.is_disjoint(&new_ids));
    for edge in &copy.edges {
        assert!(new_ids.contains(&edge.source));
        assert!(new_ids.contains(&edge.target));
    }
    assert_eq!(store.payload(&meta.id).unwrap(), original.without_ui_state());
}

#[test]
fn test_duplicate_missing_document() {
    let dir = tempdir().unwrap();
    let store = open(&dir.path().join("db"));
    assert!(matches!(store.duplicate("ghost"), Err(StoreError::NotFound(_))));
}

#[test]
fn test_export_import_roundtrip() {
    let dir = tempdir().unwrap();
    let store = open(&dir.path().join("db"));
    let meta = store.create(Some("Portable")).unwrap();
    store.save_payload(&meta.id, &chain());

    let json = store.export(&meta.id).unwrap();
    let imported = store.import(&json).unwrap();

    assert_ne!(imported.id, meta.id);
    assert_eq!(imported.title, "Portable");
    let original = store.payload(&meta.id).unwrap();
    let restored = store.payload(&imported.id).unwrap();
    assert_eq!(restored.nodes, original.nodes);
    assert_eq!(restored.edges, original.edges);
    assert_eq!(store.list().len(), 2);
}

#[test]
fn test_import_drops_dangling_edges() {
    let dir = tempdir().unwrap();
    let store = open(&dir.path().join("db"));
    let meta = store.create(Some("Broken")).unwrap();
    store.save_payload(&meta.id, &chain());

    let json = store.export(&meta.id).unwrap();
    let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
    value["document"]["nodes"].as_array_mut().unwrap().remove(2);

    let imported = store.import(&value.to_string()).unwrap();
    assert_eq!((imported.node_count, imported.edge_count), (2, 1));
}

// ─── Durability ──────────────────────────────────────────────────────────────

#[test]
fn test_documents_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    let id = {
        let store = open(&path);
        let meta = store.create(Some("Durable")).unwrap();
        store.save_payload(&meta.id, &chain());
        meta.id
    };

    let store = open(&path);
    let meta = store.meta(&id).unwrap();
    assert_eq!(meta.title, "Durable");
    assert_eq!(store.payload(&id).unwrap().nodes.len(), 3);
}

#[test]
fn test_usage_reported_against_quota() {
    let dir = tempdir().unwrap();
    let store = open(&dir.path().join("db"));
    for _ in 0..5 {
        let meta = store.create(None).unwrap();
        store.save_payload(&meta.id, &chain());
    }
    let usage = store.usage();
    assert!(usage.used_bytes > 0);
    assert!(usage.percent < 100.0);
}

// ─── Server recovery ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_in_memory_server_has_no_store() {
    let server = SyncServer::in_memory();
    assert!(server.store().is_none());
    assert_eq!(server.recover().await, 0);
}

#[tokio::test]
async fn test_server_recovery_preserves_content() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("server-db");

    let id = {
        let store = open(&path);
        let meta = store.create(Some("Recovered")).unwrap();
        store.save_payload(&meta.id, &chain());
        meta.id
    };

    let server = SyncServer::new(ServerConfig {
        storage_path: Some(path),
        ..ServerConfig::default()
    })
    .unwrap();
    assert_eq!(server.recover().await, 1);

    let doc = server.document(&id).await.unwrap();
    assert_eq!(doc.title, "Recovered");
    assert_eq!(doc.payload.nodes.len(), 3);
    assert_eq!(doc.payload.edges.len(), 2);
}

#[tokio::test]
async fn test_with_storage_constructor() {
    let dir = tempdir().unwrap();
    let server = SyncServer::with_storage("127.0.0.1:0", dir.path().join("db")).unwrap();
    assert_eq!(server.bind_addr(), "127.0.0.1:0");
    assert!(server.store().is_some());
}
