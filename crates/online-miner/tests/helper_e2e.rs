use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use photos_index::config::Config;
use photos_index::error::ERROR_NOT_SUPPORTED;
use photos_index::events::MinersChanged;
use photos_index::managers::{Account, SourceManager};
use photos_index::online_miner::OnlineMinerManager;
use photos_index::tracker::{BlankNodes, Cursor, SparqlConnection, TrackerQueue};
use photos_index::{Error, Result};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingStore {
    queries: AtomicUsize,
    updates: Mutex<Vec<String>>,
}

impl RecordingStore {
    fn updates(&self) -> Vec<String> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl SparqlConnection for RecordingStore {
    async fn query(&self, _sparql: &str) -> Result<Cursor> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(Cursor {
            columns: vec!["datasource".into(), "version".into()],
            rows: vec![vec![
                Some("photos:goa-account:gone".into()),
                Some("1".into()),
            ]],
        })
    }

    async fn update(&self, sparql: &str) -> Result<()> {
        self.updates.lock().unwrap().push(sparql.to_string());
        Ok(())
    }

    async fn update_blank(&self, _sparql: &str) -> Result<BlankNodes> {
        Ok(Vec::new())
    }
}

fn install_helper(dir: &Path) {
    let link = dir.join("photos-online-miner-test");
    std::os::unix::fs::symlink(env!("CARGO_BIN_EXE_photos-online-miner"), link).unwrap();
}

fn config_for(dir: &TempDir, refresh_interval: Duration) -> Config {
    Config {
        libexec_dir: dir.path().to_path_buf(),
        package_tarname: "photos".into(),
        providers: vec!["local".into(), "test".into()],
        tmp_dir: Some(dir.path().to_path_buf()),
        refresh_interval,
        ..Config::default()
    }
}

fn sources_with_account() -> Arc<SourceManager> {
    let sources = Arc::new(SourceManager::new());
    sources.account_added(&Account {
        id: "acc".into(),
        provider_type: "test".into(),
        provider_name: "Test".into(),
    });
    sources
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn helper_refreshes_through_manager_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    install_helper(dir.path());

    let sources = sources_with_account();
    let store = Arc::new(RecordingStore::default());
    let queue = TrackerQueue::new(store.clone() as Arc<dyn SparqlConnection>);

    let manager = OnlineMinerManager::start(
        &config_for(&dir, Duration::from_secs(3600)),
        sources,
        Some(queue),
        CancellationToken::new(),
    )
    .unwrap();

    tokio::time::timeout(Duration::from_secs(20), async {
        while !manager.has_timer("test") {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("refresh did not complete");

    assert!(manager.running().is_empty());
    let updates = store.updates();
    assert!(
        updates
            .iter()
            .any(|update| update.contains("<photos:goa-account:gone>")),
        "stale datasource not deleted: {updates:?}"
    );

    let err = manager
        .insert_shared_content("test", "acc", "shared", "urn:source", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { ref name, .. } if name == ERROR_NOT_SUPPORTED));

    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_timer_fires_and_refreshes_again() {
    let dir = tempfile::tempdir().unwrap();
    install_helper(dir.path());

    let store = Arc::new(RecordingStore::default());
    let queue = TrackerQueue::new(store.clone() as Arc<dyn SparqlConnection>);
    let manager = OnlineMinerManager::start(
        &config_for(&dir, Duration::from_millis(200)),
        sources_with_account(),
        Some(queue),
        CancellationToken::new(),
    )
    .unwrap();
    let mut events = manager.subscribe();

    // The first refresh started inside `start`; its completion is the first
    // update seen here. The timer then starts the second one.
    let mut running = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), async {
        while running.len() < 3 {
            let MinersChanged(miners) = events.recv().await.unwrap();
            running.push(
                miners
                    .iter()
                    .map(|miner| miner.provider_type().to_string())
                    .collect::<Vec<_>>(),
            );
        }
    })
    .await
    .expect("refresh was not repeated");

    assert_eq!(
        running,
        vec![Vec::<String>::new(), vec!["test".to_string()], Vec::new()]
    );
    assert!(store.queries.load(Ordering::SeqCst) >= 2);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !manager.has_timer("test") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("refresh was not rescheduled");

    manager.shutdown();
}
