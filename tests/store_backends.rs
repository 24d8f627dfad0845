//! Store Backend Integration Tests
//!
//! Every backend must honor the same contract; each test runs against the
//! file, SQLite and memory stores.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use stagectl::adapters::LocalExecutor;
use stagectl::store::{self, PipelineStore, StoreBackend};
use stagectl::{EngineError, LifecycleController, Stage, StageConfig, StageRegistry};

fn open_all(temp: &TempDir) -> Vec<Arc<dyn PipelineStore>> {
    let root = temp.path();
    vec![
        store::open(StoreBackend::File, &root.join("pipelines")).unwrap(),
        store::open(StoreBackend::Sqlite, &root.join("pipelines.db")).unwrap(),
        store::open(StoreBackend::Memory, Path::new("unused")).unwrap(),
    ]
}

#[tokio::test]
async fn test_create_is_exclusive() {
    let temp = TempDir::new().unwrap();
    for store in open_all(&temp) {
        let created = store.create("p1").await.unwrap();
        assert_eq!(created.id(), "p1", "{}", store.backend());

        let err = store.create("p1").await.unwrap_err();
        assert!(
            matches!(err, EngineError::AlreadyExists(_)),
            "{}: {:?}",
            store.backend(),
            err
        );
    }
}

#[tokio::test]
async fn test_save_replaces_record() {
    let temp = TempDir::new().unwrap();
    for store in open_all(&temp) {
        let mut pipeline = store.create("p1").await.unwrap();
        let mut config = StageConfig::new();
        config.insert("threads".to_string(), json!(4));
        pipeline
            .append_stage(Stage::new("stageA", "compute", config))
            .unwrap();
        store.save(&pipeline).await.unwrap();

        let loaded = store.load("p1").await.unwrap();
        assert_eq!(loaded.stage_order(), vec!["stageA"], "{}", store.backend());
        assert_eq!(
            loaded.stage("stageA").unwrap().config.get("threads"),
            Some(&json!(4))
        );
        assert_eq!(loaded.created_at, pipeline.created_at);
    }
}

#[tokio::test]
async fn test_missing_records() {
    let temp = TempDir::new().unwrap();
    for store in open_all(&temp) {
        let err = store.load("ghost").await.unwrap_err();
        assert!(err.is_pipeline_missing(), "{}", store.backend());

        // Delete of an absent id is not an error
        store.delete("ghost").await.unwrap();
    }
}

#[tokio::test]
async fn test_list_is_sorted() {
    let temp = TempDir::new().unwrap();
    for store in open_all(&temp) {
        for id in ["zeta", "alpha", "mid"] {
            store.create(id).await.unwrap();
        }
        store.delete("mid").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["alpha", "zeta"], "{}", store.backend());
    }
}

#[tokio::test]
async fn test_current_pointer() {
    let temp = TempDir::new().unwrap();
    for store in open_all(&temp) {
        assert_eq!(store.current().await.unwrap(), None);

        store.set_current(Some("p1")).await.unwrap();
        store.set_current(Some("p2")).await.unwrap();
        assert_eq!(store.current().await.unwrap().as_deref(), Some("p2"));

        store.set_current(None).await.unwrap();
        assert_eq!(store.current().await.unwrap(), None, "{}", store.backend());

        assert!(store.set_current(Some("bad/id")).await.is_err());
    }
}

#[tokio::test]
async fn test_concurrent_creates_have_one_winner() {
    let temp = TempDir::new().unwrap();
    for store in open_all(&temp) {
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.create("race").await }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(EngineError::AlreadyExists(_)) => {}
                Err(other) => panic!("{}: unexpected error {:?}", store.backend(), other),
            }
        }
        assert_eq!(winners, 1, "{}", store.backend());
    }
}

/// A controller with its own store handle, as a separate CLI process has
fn controller_over(backend: StoreBackend, path: &Path) -> Arc<LifecycleController> {
    Arc::new(LifecycleController::new(
        store::open(backend, path).unwrap(),
        Arc::new(StageRegistry::builtin()),
        Arc::new(LocalExecutor::default()),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_controllers_sharing_a_store_never_lose_appends() {
    let temp = TempDir::new().unwrap();
    let shared = [
        (StoreBackend::File, temp.path().join("pipelines")),
        (StoreBackend::Sqlite, temp.path().join("pipelines.db")),
    ];

    for (backend, path) in shared {
        let first = controller_over(backend, &path);
        let second = controller_over(backend, &path);
        first.create("p1").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let controller = if i % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move {
                controller
                    .append("p1", "compute", None, true, StageConfig::new())
                    .await
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            let stage = handle.await.unwrap().unwrap();
            assert!(ids.insert(stage.id.clone()), "{}: {} handed out twice", backend, stage.id);
        }

        let stored = second.inspect(Some("p1")).await.unwrap();
        assert_eq!(ids.len(), 16, "{}", backend);
        assert_eq!(stored.stages().len(), 16, "{}", backend);
    }
}

#[tokio::test]
async fn test_destroy_is_not_undone_by_a_queued_edit() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("pipelines");
    let first = controller_over(StoreBackend::File, &path);
    let second = controller_over(StoreBackend::File, &path);
    first.create("p1").await.unwrap();

    let lock = first.store().lock_record("p1").await.unwrap();
    let destroy = tokio::spawn({
        let first = first.clone();
        async move { first.destroy("p1").await }
    });
    let edit = tokio::spawn({
        let second = second.clone();
        async move {
            second
                .append("p1", "compute", None, true, StageConfig::new())
                .await
        }
    });
    drop(lock);

    assert!(destroy.await.unwrap().unwrap().is_some());
    if let Err(e) = edit.await.unwrap() {
        assert!(e.is_pipeline_missing(), "{:?}", e);
    }
    // Whichever ran first, the destroy has the last word
    assert!(second.inspect(Some("p1")).await.unwrap_err().is_pipeline_missing());
}
