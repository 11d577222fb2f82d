#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use overseer::instance::{EventTask, INSTANCE_CONFIG_CATEGORY, LifecycleSettings};
use overseer::registry::{InstanceQuery, InstanceRegistry, RegistryEvent, RegistrySettings};
use overseer::storage::{BackendKind, FileStore, StorageBackend};
use overseer::{
    Command, InstanceConfig, InstanceConfigUpdate, InstanceStatus, RegistryError, StorageError,
    Store, Subscriber,
};
use tokio::sync::broadcast;

fn store(dir: &Path) -> Store {
    Store::file(dir.join("storage"), Duration::from_secs(5))
}

fn settings(dir: &Path) -> RegistrySettings {
    RegistrySettings {
        instance_data_dir: dir.join("InstanceData"),
        lifecycle: LifecycleSettings {
            stop_timeout: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(2),
            restart_delay: Duration::from_millis(100),
            event_capacity: 256,
        },
        shutdown_timeout: Duration::from_secs(10),
    }
}

fn registry(dir: &Path) -> InstanceRegistry {
    InstanceRegistry::new(store(dir), settings(dir))
}

/// File storage that refuses to delete anything
struct UndeletableStore(FileStore);

#[async_trait]
impl StorageBackend for UndeletableStore {
    async fn store(
        &self,
        category: &str,
        identifier: &str,
        blob: String,
    ) -> Result<(), StorageError> {
        self.0.store(category, identifier, blob).await
    }

    async fn load(&self, category: &str, identifier: &str) -> Result<Option<String>, StorageError> {
        self.0.load(category, identifier).await
    }

    async fn list(&self, category: &str) -> Result<Vec<String>, StorageError> {
        self.0.list(category).await
    }

    async fn delete(&self, _category: &str, _identifier: &str) -> Result<(), StorageError> {
        Err(StorageError::Remote("delete refused".into()))
    }
}

fn command(start_command: &str) -> InstanceConfigUpdate {
    InstanceConfigUpdate {
        display_name: Some("test".into()),
        start_command: Some(start_command.into()),
        ..Default::default()
    }
}

async fn next_event(rx: &mut broadcast::Receiver<RegistryEvent>) -> RegistryEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for registry event")
        .expect("registry event channel closed")
}

#[tokio::test]
async fn created_instance_survives_a_restart() {
    let tmp = tempfile::tempdir().unwrap();

    let first = registry(tmp.path());
    let handle = first
        .create_instance(InstanceConfigUpdate {
            display_name: Some("lobby".into()),
            start_command: Some("sleep 30".into()),
            tags: Some(vec!["mc".into()]),
            ..Default::default()
        })
        .await
        .unwrap();
    let id = handle.id().to_string();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(first.exists(&id).await);

    let created = handle.config().await;
    assert_eq!(created.working_dir, tmp.path().join("InstanceData").join(&id));
    assert!(created.working_dir.is_dir());
    assert_eq!(created.input_encoding, "utf8");

    let second = registry(tmp.path());
    assert_eq!(second.load_instances().await.unwrap(), 1);
    let reloaded = second.get(&id).await.unwrap();
    assert_eq!(reloaded.config().await, created);
    assert_eq!(reloaded.status(), InstanceStatus::Stopped);
}

#[tokio::test]
async fn autostart_runs_after_load_and_clears_ignore() {
    let tmp = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();

    let mut config = InstanceConfig::new("0123456789abcdef0123456789abcdef");
    config.working_dir = workdir.path().to_path_buf();
    config.start_command = "sleep 30".into();
    config.event_task = EventTask {
        auto_start: true,
        auto_restart: false,
        ignore: true,
    };
    store(tmp.path())
        .store(INSTANCE_CONFIG_CATEGORY, &config.id, &config)
        .await
        .unwrap();

    let registry = registry(tmp.path());
    registry.load_instances().await.unwrap();

    let handle = registry.get(&config.id).await.unwrap();
    assert_eq!(handle.status(), InstanceStatus::Running);
    assert!(!handle.config().await.event_task.ignore);

    registry.exit().await;
}

#[tokio::test]
async fn corrupt_record_does_not_abort_boot() {
    let tmp = tempfile::tempdir().unwrap();
    let first = registry(tmp.path());
    let good = first.create_instance(command("sleep 30")).await.unwrap();

    let category_dir = tmp.path().join("storage").join(INSTANCE_CONFIG_CATEGORY);
    std::fs::write(category_dir.join("broken.json"), "{ not json").unwrap();

    let second = registry(tmp.path());
    assert_eq!(second.load_instances().await.unwrap(), 1);
    assert!(second.exists(good.id()).await);
    assert!(!second.exists("broken").await);
}

#[tokio::test]
async fn start_on_running_instance_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    let handle = registry.create_instance(command("sleep 30")).await.unwrap();

    handle.exec(Command::Start).await.unwrap();
    let err = handle.exec(Command::Start).await.unwrap_err();
    assert_eq!(err.error_code(), "illegal_transition");
    assert_eq!(handle.status(), InstanceStatus::Running);

    registry.exit().await;
}

#[tokio::test]
async fn start_then_kill_back_to_back() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    let handle = registry.create_instance(command("sleep 30")).await.unwrap();
    let mut events = registry.subscribe();

    let (start, kill) = tokio::join!(handle.exec(Command::Start), handle.exec(Command::Kill));
    start.unwrap();
    kill.unwrap();
    assert_eq!(handle.status(), InstanceStatus::Stopped);

    // Exactly one process was opened and it is gone
    assert!(matches!(next_event(&mut events).await, RegistryEvent::Open { .. }));
    assert!(matches!(next_event(&mut events).await, RegistryEvent::Exit { .. }));
    assert_eq!(registry.overview().await.running, 0);
}

#[tokio::test]
async fn forwarded_output_reaches_subscriber_once() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    let handle = registry.create_instance(command("cat")).await.unwrap();
    let id = handle.id().to_string();
    let mut events = registry.subscribe();

    handle.exec(Command::Start).await.unwrap();
    let (viewer, mut viewer_rx) = Subscriber::channel("conn-1", 16);
    assert!(registry.forward(&id, viewer).await);

    handle.write_input("line1\n").await.unwrap();
    let chunk = tokio::time::timeout(Duration::from_secs(5), viewer_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chunk.data, "line1\n");

    assert!(registry.stop_forward(&id, "conn-1").await);
    assert!(!registry.stop_forward(&id, "conn-1").await);

    handle.write_input("line2\n").await.unwrap();
    // Wait until the aggregate stream has seen line2, then check the viewer
    loop {
        if let RegistryEvent::Data { chunk, .. } = next_event(&mut events).await {
            if chunk.contains("line2") {
                break;
            }
        }
    }
    assert!(viewer_rx.try_recv().is_err());

    registry.exit().await;
}

#[tokio::test]
async fn forwarding_an_unknown_instance_is_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    let (viewer, _rx) = Subscriber::channel("conn-1", 16);
    assert!(!registry.forward("nope", viewer).await);
}

#[tokio::test]
async fn aggregated_events_carry_instance_meta() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    let handle = registry
        .create_instance(InstanceConfigUpdate {
            display_name: Some("crashy".into()),
            start_command: Some("exit 3".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut events = registry.subscribe();

    handle.exec(Command::Start).await.unwrap();

    match next_event(&mut events).await {
        RegistryEvent::Open { meta } => {
            assert_eq!(meta.id, handle.id());
            assert_eq!(meta.display_name, "crashy");
        }
        other => panic!("expected open, got {:?}", other),
    }
    match next_event(&mut events).await {
        RegistryEvent::Exit { meta, status } => {
            assert_eq!(meta.display_name, "crashy");
            assert_eq!(status.code, Some(3));
        }
        other => panic!("expected exit, got {:?}", other),
    }
    assert!(matches!(
        next_event(&mut events).await,
        RegistryEvent::Failure { .. }
    ));
}

#[tokio::test]
async fn add_instance_rejects_duplicates() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    let handle = registry.create_instance(command("sleep 30")).await.unwrap();

    let err = registry.add_instance(handle.clone()).await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateIdentifier(_)));
    assert_eq!(registry.overview().await.total, 1);
}

#[tokio::test]
async fn remove_instance() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let err = registry.remove_instance("unknown", false).await.unwrap_err();
    assert_eq!(err.error_code(), "instance_not_found");

    let handle = registry.create_instance(command("sleep 30")).await.unwrap();
    let id = handle.id().to_string();
    let working_dir = handle.config().await.working_dir;
    handle.exec(Command::Start).await.unwrap();

    registry.remove_instance(&id, true).await.unwrap();
    assert!(!registry.exists(&id).await);
    assert_eq!(handle.status(), InstanceStatus::Stopped);

    // Working directory goes away in the background
    for _ in 0..50 {
        if !working_dir.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!working_dir.exists());

    let reloaded = self::registry(tmp.path());
    assert_eq!(reloaded.load_instances().await.unwrap(), 0);
    assert!(!reloaded.exists(&id).await);
}

#[tokio::test]
async fn failed_record_delete_leaves_instance_in_place() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = UndeletableStore(FileStore::new(tmp.path().join("storage")));
    let store = Store::new(Arc::new(backend), BackendKind::File, Duration::from_secs(5));
    let registry = InstanceRegistry::new(store, settings(tmp.path()));

    let handle = registry.create_instance(command("sleep 30")).await.unwrap();
    let id = handle.id().to_string();
    handle.exec(Command::Start).await.unwrap();

    let err = registry.remove_instance(&id, true).await.unwrap_err();
    assert_eq!(err.error_code(), "remote_store");
    assert!(registry.exists(&id).await);
    assert_eq!(handle.status(), InstanceStatus::Running);
    assert!(handle.config().await.working_dir.is_dir());

    handle.exec(Command::Kill).await.unwrap();
    let reloaded = self::registry(tmp.path());
    assert_eq!(reloaded.load_instances().await.unwrap(), 1);
    assert!(reloaded.exists(&id).await);
}

#[tokio::test]
async fn supplied_working_dir_is_created() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    let working_dir = tmp.path().join("custom").join("nested");

    let handle = registry
        .create_instance(InstanceConfigUpdate {
            working_dir: Some(working_dir.clone()),
            ..command("pwd")
        })
        .await
        .unwrap();

    assert_eq!(handle.config().await.working_dir, working_dir);
    assert!(working_dir.is_dir());
    handle.exec(Command::Start).await.unwrap();
}

#[tokio::test]
async fn exit_kills_instances_stuck_in_stop() {
    let tmp = tempfile::tempdir().unwrap();
    let mut settings = settings(tmp.path());
    settings.lifecycle.stop_timeout = Duration::from_secs(20);
    settings.shutdown_timeout = Duration::from_millis(500);
    let registry = InstanceRegistry::new(store(tmp.path()), settings);

    let handle = registry
        .create_instance(command("trap '' INT; while true; do sleep 1; done"))
        .await
        .unwrap();
    handle.exec(Command::Start).await.unwrap();

    let stopping = handle.clone();
    let stop = tokio::spawn(async move { stopping.exec(Command::Stop).await });
    let mut status = handle.watch_status();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == InstanceStatus::Stopping),
    )
    .await
    .expect("instance never started stopping")
    .unwrap();

    let started = Instant::now();
    assert_eq!(registry.exit().await, 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(handle.status(), InstanceStatus::Stopped);
    stop.await.unwrap().unwrap();

    let stored: InstanceConfig = store(tmp.path())
        .load(INSTANCE_CONFIG_CATEGORY, handle.id())
        .await
        .unwrap()
        .unwrap();
    assert!(stored.event_task.ignore);
}

#[tokio::test]
async fn dropping_the_registry_stops_its_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let handle = registry.create_instance(command("sleep 30")).await.unwrap();
    handle.exec(Command::Start).await.unwrap();
    let mut status = handle.watch_status();
    drop(handle);
    drop(registry);

    // Closes once the actor and its output pump are gone
    tokio::time::timeout(Duration::from_secs(5), async {
        while status.changed().await.is_ok() {}
    })
    .await
    .expect("instance outlived its registry");
    assert_eq!(*status.borrow(), InstanceStatus::Stopped);
}

#[tokio::test]
async fn exit_kills_only_running_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let a = registry.create_instance(command("sleep 30")).await.unwrap();
    let b = registry.create_instance(command("sleep 30")).await.unwrap();
    let idle = registry.create_instance(command("sleep 30")).await.unwrap();
    a.exec(Command::Start).await.unwrap();
    b.exec(Command::Start).await.unwrap();
    assert_eq!(registry.overview().await.running, 2);

    assert_eq!(registry.exit().await, 2);

    for handle in [&a, &b, &idle] {
        assert_eq!(handle.status(), InstanceStatus::Stopped);
    }
    // Killed instances were persisted after the kill
    let store = store(tmp.path());
    for handle in [&a, &b] {
        let stored: InstanceConfig = store
            .load(INSTANCE_CONFIG_CATEGORY, handle.id())
            .await
            .unwrap()
            .unwrap();
        assert!(stored.event_task.ignore);
        assert!(stored.last_started_at.is_some());
    }
    let untouched: InstanceConfig = store
        .load(INSTANCE_CONFIG_CATEGORY, idle.id())
        .await
        .unwrap()
        .unwrap();
    assert!(!untouched.event_task.ignore);
}

#[tokio::test]
async fn irregular_identifiers_are_rejected_without_io() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store(tmp.path());
    let config = InstanceConfig::new("x");

    assert!(matches!(
        store.store(INSTANCE_CONFIG_CATEGORY, "../evil", &config).await,
        Err(StorageError::IrregularIdentifier(_))
    ));
    assert!(matches!(
        store
            .load::<InstanceConfig>(INSTANCE_CONFIG_CATEGORY, "../evil")
            .await,
        Err(StorageError::IrregularIdentifier(_))
    ));
    assert!(matches!(
        store.delete(INSTANCE_CONFIG_CATEGORY, "../evil").await,
        Err(StorageError::IrregularIdentifier(_))
    ));
    assert!(!tmp.path().join("storage").exists());
    assert!(!tmp.path().join("evil.json").exists());
}

#[tokio::test]
async fn list_filters_and_pages() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    for name in ["alpha", "beta", "gamma"] {
        registry
            .create_instance(InstanceConfigUpdate {
                display_name: Some(name.into()),
                start_command: Some("sleep 30".into()),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let page = registry
        .list(&InstanceQuery {
            page_size: 2,
            ..Default::default()
        })
        .await;
    assert_eq!(page.total, 3);
    assert_eq!(page.max_page, 2);
    let names: Vec<_> = page.items.iter().map(|s| s.display_name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    let page = registry
        .list(&InstanceQuery {
            display_name: Some("AMM".into()),
            ..Default::default()
        })
        .await;
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].display_name, "gamma");
}
