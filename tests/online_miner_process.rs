use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use photos_index::error::ERROR_UNKNOWN_OBJECT;
use photos_index::online_miner::OnlineMinerProcess;
use photos_index::online_miner::peer::{MinerBackend, MinerObject};
use photos_index::online_miner::proxy::OBJECT_PATH;
use photos_index::tracker::SparqlConnection;
use photos_index::{Error, Result};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

const ADDRESS: &str = "unix:path=/nonexistent/bus";

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

struct Answering;

#[async_trait]
impl MinerBackend for Answering {
    async fn refresh_db(&self, _sparql: &dyn SparqlConnection, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn insert_shared_content(
        &self,
        _sparql: &dyn SparqlConnection,
        _account_id: &str,
        _shared_id: &str,
        _source_urn: &str,
        _cancel: CancellationToken,
    ) -> Result<()> {
        Ok(())
    }
}

/// A connected pair whose helper side exports a miner object at `path`.
async fn miner_pair(path: &str) -> (zbus::Connection, zbus::Connection) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let guid = zbus::Guid::generate().to_string();
    let server_side = async {
        zbus::connection::Builder::unix_stream(ours)
            .server(guid.as_str())
            .unwrap()
            .p2p()
            .build()
            .await
            .unwrap()
    };
    let helper_side = async {
        zbus::connection::Builder::unix_stream(theirs)
            .p2p()
            .serve_at(path, MinerObject::new(Arc::new(Answering), CancellationToken::new()))
            .unwrap()
            .build()
            .await
            .unwrap()
    };
    tokio::join!(server_side, helper_side)
}

#[tokio::test]
async fn missing_helper_fails_the_call() {
    let miner = OnlineMinerProcess::new("test", ADDRESS, "/nonexistent/photos-online-miner-test");
    let err = miner.refresh_db(None).await.unwrap_err();
    assert!(matches!(err, Error::Spawn { .. }), "got {err:?}");
    assert_eq!(miner.pending_calls(), 0);
    assert!(miner.pid().is_none());
}

#[tokio::test]
async fn helper_exiting_before_connect_fails_every_waiter() {
    let dir = tempfile::tempdir().unwrap();
    let helper = script(dir.path(), "quitter", "exit 3");
    let miner = OnlineMinerProcess::new("test", ADDRESS, helper);

    let (first, second) = tokio::join!(miner.refresh_db(None), miner.refresh_db(None));
    for result in [first, second] {
        assert!(matches!(result, Err(Error::MinerTerminated(ref p)) if p == "test"));
    }
    assert!(miner.pid().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_releases_queued_calls_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let helper = script(dir.path(), "sleeper", "exec sleep 30");
    let miner = OnlineMinerProcess::new("test", ADDRESS, helper);

    let waiting = {
        let miner = Arc::clone(&miner);
        tokio::spawn(async move { miner.refresh_db(None).await })
    };
    eventually(|| miner.pending_calls() == 1).await;
    let pid = miner.pid().expect("helper running");

    let (server_side, _helper_side) = miner_pair(OBJECT_PATH).await;
    miner.set_connection(server_side).await;
    waiting.await.unwrap().unwrap();
    assert_eq!(miner.pending_calls(), 0);
    assert!(miner.has_connection());

    // Connected: calls go straight through without spawning again.
    miner.refresh_db(None).await.unwrap();
    miner
        .insert_shared_content("acc", "shared", "urn:src", None)
        .await
        .unwrap();
    assert_eq!(miner.pid(), Some(pid));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn helper_exit_drops_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let helper = script(dir.path(), "short-lived", "exec sleep 2");
    let miner = OnlineMinerProcess::new("test", ADDRESS, helper);

    let waiting = {
        let miner = Arc::clone(&miner);
        tokio::spawn(async move { miner.refresh_db(None).await })
    };
    eventually(|| miner.pending_calls() == 1).await;
    let (server_side, _helper_side) = miner_pair(OBJECT_PATH).await;
    miner.set_connection(server_side).await;
    waiting.await.unwrap().unwrap();

    eventually(|| !miner.has_connection() && miner.pid().is_none()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_miner_object_becomes_sticky_error() {
    let dir = tempfile::tempdir().unwrap();
    let helper = script(dir.path(), "sleeper", "exec sleep 30");
    let miner = OnlineMinerProcess::new("test", ADDRESS, helper);

    let first = {
        let miner = Arc::clone(&miner);
        tokio::spawn(async move {
            miner
                .insert_shared_content("acc", "one", "urn:src", None)
                .await
        })
    };
    let second = {
        let miner = Arc::clone(&miner);
        tokio::spawn(async move {
            miner
                .insert_shared_content("acc", "two", "urn:src", None)
                .await
        })
    };
    eventually(|| miner.pending_calls() == 2).await;

    // The helper exports its object somewhere else.
    let (server_side, _helper_side) = miner_pair("/org/example/Elsewhere").await;
    miner.set_connection(server_side).await;

    let first = first.await.unwrap().unwrap_err();
    let second = second.await.unwrap().unwrap_err();
    assert!(
        matches!(first, Error::Remote { ref name, .. } if name == ERROR_UNKNOWN_OBJECT),
        "got {first:?}"
    );
    assert_eq!(first.to_string(), second.to_string());
    assert_eq!(miner.pending_calls(), 0);

    // Later calls fail at once with the same error.
    let later = tokio::time::timeout(Duration::from_secs(1), miner.refresh_db(None))
        .await
        .expect("sticky error not returned at once")
        .unwrap_err();
    assert_eq!(later.to_string(), first.to_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_waiting_call() {
    let dir = tempfile::tempdir().unwrap();
    let helper = script(dir.path(), "sleeper", "exec sleep 30");
    let miner = OnlineMinerProcess::new("test", ADDRESS, helper);
    let cancel = CancellationToken::new();

    let waiting = {
        let miner = Arc::clone(&miner);
        let cancel = cancel.clone();
        tokio::spawn(async move { miner.refresh_db(Some(&cancel)).await })
    };
    eventually(|| miner.pid().is_some()).await;
    cancel.cancel();

    let err = waiting.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
}
