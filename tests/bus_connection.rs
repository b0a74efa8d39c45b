use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use photos_index::bus::address::BusAddress;
use photos_index::bus::connection::{PeerCredentials, client};
use photos_index::bus::server::{BusServer, ServerHandler};
use photos_index::error::ERROR_INVALID_ARGS;
use photos_index::online_miner::peer::{self, MinerBackend};
use photos_index::online_miner::proxy;
use photos_index::tracker::endpoint::{ENDPOINT_PATH, Endpoint};
use photos_index::tracker::{BlankNodes, Cursor, SparqlConnection, TrackerBus, TrackerQueue};
use photos_index::{Error, Result};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Acceptor {
    allow: bool,
    seen: Mutex<Vec<Option<PeerCredentials>>>,
    accepted: mpsc::UnboundedSender<(zbus::Connection, PeerCredentials)>,
    /// Exported on every accepted connection when set.
    queue: Option<Arc<TrackerQueue>>,
}

#[async_trait]
impl ServerHandler for Acceptor {
    fn authorize_authenticated_peer(&self, credentials: Option<&PeerCredentials>) -> bool {
        self.seen.lock().unwrap().push(credentials.copied());
        self.allow
    }

    async fn new_connection(&self, connection: zbus::Connection, credentials: PeerCredentials) {
        if let Some(queue) = &self.queue {
            let endpoint = Endpoint::new(Arc::clone(queue), CancellationToken::new());
            connection
                .object_server()
                .at(ENDPOINT_PATH, endpoint)
                .await
                .unwrap();
        }
        self.accepted.send((connection, credentials)).unwrap();
    }
}

struct Fixture {
    _dir: TempDir,
    server: BusServer,
    handler: Arc<Acceptor>,
    accepted: mpsc::UnboundedReceiver<(zbus::Connection, PeerCredentials)>,
}

fn serve(allow: bool, queue: Option<Arc<TrackerQueue>>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let listen: BusAddress = format!("unix:tmpdir={}", dir.path().display())
        .parse()
        .unwrap();
    let server = BusServer::bind(&listen).unwrap();
    let (tx, accepted) = mpsc::unbounded_channel();
    let handler = Arc::new(Acceptor {
        allow,
        seen: Mutex::new(Vec::new()),
        accepted: tx,
        queue,
    });
    server.start(Arc::downgrade(&handler));
    Fixture {
        _dir: dir,
        server,
        handler,
        accepted,
    }
}

async fn accept(fixture: &mut Fixture) -> (zbus::Connection, PeerCredentials) {
    tokio::time::timeout(Duration::from_secs(5), fixture.accepted.recv())
        .await
        .expect("no connection accepted")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn authorized_peer_gets_handshake_and_credentials() {
    let mut fixture = serve(true, None);
    let address = fixture.server.client_address();
    assert!(address.to_string().contains(&format!("guid={}", fixture.server.guid())));

    let (_client, (_server_side, credentials)) = tokio::join!(
        async { client(&address).unwrap().build().await.unwrap() },
        accept(&mut fixture),
    );
    assert_eq!(credentials.pid, Some(std::process::id()));
    assert_eq!(fixture.handler.seen.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_peer_never_sees_handshake() {
    let mut fixture = serve(false, None);
    let refused = tokio::time::timeout(
        Duration::from_secs(5),
        client(&fixture.server.client_address()).unwrap().build(),
    )
    .await
    .expect("refused peer left hanging");
    assert!(refused.is_err());
    assert_eq!(fixture.handler.seen.lock().unwrap().len(), 1);
    assert!(fixture.accepted.try_recv().is_err());
}

/// Answers selects with one fixed cursor and records every update.
#[derive(Default)]
struct FixedStore {
    updates: Mutex<Vec<String>>,
}

fn fixed_cursor() -> Cursor {
    Cursor {
        columns: vec!["urn".into(), "title".into(), "author".into()],
        rows: vec![
            vec![
                Some("urn:photo:1".into()),
                Some("Beach, at dusk".into()),
                None,
            ],
            vec![Some("urn:photo:2".into()), Some(String::new()), Some("Ada".into())],
        ],
    }
}

#[async_trait]
impl SparqlConnection for FixedStore {
    async fn query(&self, _sparql: &str) -> Result<Cursor> {
        Ok(fixed_cursor())
    }

    async fn update(&self, sparql: &str) -> Result<()> {
        self.updates.lock().unwrap().push(sparql.to_string());
        Ok(())
    }

    async fn update_blank(&self, sparql: &str) -> Result<BlankNodes> {
        self.updates.lock().unwrap().push(sparql.to_string());
        Ok(vec![vec![BTreeMap::from([("photo".to_string(), "urn:bnode:7".to_string())])]])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn endpoint_serves_the_queue_to_the_peer() {
    let store = Arc::new(FixedStore::default());
    let queue = TrackerQueue::new(store.clone() as Arc<dyn SparqlConnection>);
    let mut fixture = serve(true, Some(queue));

    let address = fixture.server.client_address();
    let (helper_side, _accepted) = tokio::join!(
        async { client(&address).unwrap().build().await.unwrap() },
        accept(&mut fixture),
    );
    let sparql = TrackerBus::peer(&helper_side).await.unwrap();

    let cursor = sparql.query("SELECT ?urn ?title ?author {}").await.unwrap();
    assert_eq!(cursor, fixed_cursor());

    sparql.update("INSERT DATA { <urn:a> a nmm:Photo }").await.unwrap();
    let blank = sparql
        .update_blank("INSERT DATA { _:photo a nmm:Photo }")
        .await
        .unwrap();
    assert_eq!(blank[0][0]["photo"], "urn:bnode:7");
    assert_eq!(
        *store.updates.lock().unwrap(),
        vec![
            "INSERT DATA { <urn:a> a nmm:Photo }".to_string(),
            "INSERT DATA { _:photo a nmm:Photo }".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_failures_reach_the_peer_by_name() {
    struct Failing;

    #[async_trait]
    impl SparqlConnection for Failing {
        async fn query(&self, _sparql: &str) -> Result<Cursor> {
            Err(Error::Sparql("syntax error".into()))
        }

        async fn update(&self, _sparql: &str) -> Result<()> {
            Err(Error::remote(ERROR_INVALID_ARGS, "bad statement"))
        }

        async fn update_blank(&self, _sparql: &str) -> Result<BlankNodes> {
            Ok(Vec::new())
        }
    }

    let queue = TrackerQueue::new(Arc::new(Failing) as Arc<dyn SparqlConnection>);
    let mut fixture = serve(true, Some(queue));
    let address = fixture.server.client_address();
    let (helper_side, _accepted) = tokio::join!(
        async { client(&address).unwrap().build().await.unwrap() },
        accept(&mut fixture),
    );
    let sparql = TrackerBus::peer(&helper_side).await.unwrap();

    let err = sparql.query("SELECT").await.unwrap_err();
    assert!(err.to_string().contains("syntax error"), "got {err:?}");
    let err = sparql.update("INSERT").await.unwrap_err();
    assert!(matches!(err, Error::Remote { ref name, ref message } if name == ERROR_INVALID_ARGS && message == "bad statement"));
}

/// The first refresh takes a while; later ones return at once.
#[derive(Default)]
struct SlowBackend {
    refreshes: AtomicUsize,
}

#[async_trait]
impl MinerBackend for SlowBackend {
    async fn refresh_db(&self, _sparql: &dyn SparqlConnection, _cancel: CancellationToken) -> Result<()> {
        if self.refreshes.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(())
    }

    async fn insert_shared_content(
        &self,
        _sparql: &dyn SparqlConnection,
        account_id: &str,
        _shared_id: &str,
        _source_urn: &str,
        _cancel: CancellationToken,
    ) -> Result<()> {
        if account_id.is_empty() {
            return Err(Error::remote(ERROR_INVALID_ARGS, "empty account"));
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_runtime_serves_and_cancels_calls() {
    let mut fixture = serve(true, None);
    let address = fixture.server.client_address();
    let backend = Arc::new(SlowBackend::default());
    let stop = CancellationToken::new();
    let runtime = {
        let backend = backend.clone();
        let stop = stop.clone();
        tokio::spawn(async move { peer::run(&address, "test", backend, stop).await })
    };
    let (connection, _credentials) = accept(&mut fixture).await;
    let miner = proxy::connect(&connection).await.unwrap();

    let cancel = CancellationToken::new();
    let refresh = {
        let miner = miner.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { proxy::cancellable(Some(&cancel), miner.refresh_db()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    assert!(refresh.await.unwrap().unwrap_err().is_cancelled());

    proxy::cancellable(None, miner.refresh_db()).await.unwrap();
    assert_eq!(backend.refreshes.load(Ordering::SeqCst), 2);

    let unknown: Error = miner.cancel(999).await.unwrap_err().into();
    assert!(
        matches!(unknown, Error::Remote { ref name, ref message } if name == ERROR_INVALID_ARGS && message == "Invalid serial"),
        "got {unknown:?}"
    );

    miner
        .insert_shared_content("acc", "shared", "urn:src")
        .await
        .unwrap();
    let invalid: Error = miner
        .insert_shared_content("", "shared", "urn:src")
        .await
        .unwrap_err()
        .into();
    assert!(matches!(invalid, Error::Remote { ref name, .. } if name == ERROR_INVALID_ARGS));

    stop.cancel();
    runtime.await.unwrap().unwrap();
}
