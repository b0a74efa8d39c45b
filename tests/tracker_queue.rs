use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use photos_index::query::Query;
use photos_index::tracker::{BlankNodes, Cursor, SparqlConnection, SparqlResponse, TrackerQueue};
use photos_index::{AppContext, Error, Result};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Records statements and checks that at most one runs at a time.
#[derive(Default)]
struct FakeStore {
    log: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl FakeStore {
    fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    async fn run(&self, sparql: &str) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.log.lock().unwrap().push(sparql.to_string());
        if sparql.contains("wait") {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if sparql.contains("broken") {
            return Err(Error::Sparql("syntax error".into()));
        }
        Ok(())
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl SparqlConnection for FakeStore {
    async fn query(&self, sparql: &str) -> Result<Cursor> {
        self.run(sparql).await?;
        Ok(Cursor {
            columns: vec!["urn".into()],
            rows: vec![vec![Some(sparql.to_string())]],
        })
    }

    async fn update(&self, sparql: &str) -> Result<()> {
        self.run(sparql).await
    }

    async fn update_blank(&self, sparql: &str) -> Result<BlankNodes> {
        self.run(sparql).await?;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn statements_run_one_at_a_time_in_order() {
    let store = Arc::new(FakeStore::default());
    let queue = TrackerQueue::new(store.clone() as Arc<dyn SparqlConnection>);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    for i in 0..5 {
        let done = done_tx.clone();
        queue.update(Query::new(format!("update {i}"), None), None, move |result| {
            assert!(matches!(result, Ok(SparqlResponse::Updated)));
            done.send(i).unwrap();
        });
    }
    assert!(queue.is_running());

    let mut completed = Vec::new();
    for _ in 0..5 {
        completed.push(done_rx.recv().await.unwrap());
    }
    assert_eq!(completed, vec![0, 1, 2, 3, 4]);
    assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(store.log()[0], "update 0");
    assert!(queue.is_empty());
}

#[tokio::test]
async fn failures_do_not_stall_the_queue() {
    let store = Arc::new(FakeStore::default());
    let queue = TrackerQueue::new(store as Arc<dyn SparqlConnection>);

    let failed = queue
        .select_async(Query::new("broken select", None), None)
        .await;
    assert!(matches!(failed, Err(Error::Sparql(_))));

    let cursor = queue
        .select_async(Query::new("select ok", None), None)
        .await
        .unwrap();
    assert_eq!(cursor.first_value(), Some("select ok"));
}

#[tokio::test]
async fn cancelled_statement_answers_at_once_but_holds_the_store() {
    let gate = Arc::new(Notify::new());
    let store = Arc::new(FakeStore::gated(gate.clone()));
    let queue = TrackerQueue::new(store.clone() as Arc<dyn SparqlConnection>);

    let cancel = CancellationToken::new();
    let (blocked_tx, blocked_rx) = oneshot::channel();
    queue.update(Query::new("wait forever", None), Some(cancel.clone()), move |result| {
        let _ = blocked_tx.send(result);
    });
    let (next_tx, mut next_rx) = oneshot::channel();
    queue.update(Query::new("after", None), None, move |result| {
        let _ = next_tx.send(result);
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.len(), 2);
    cancel.cancel();

    let err = tokio::time::timeout(Duration::from_secs(1), blocked_rx)
        .await
        .expect("cancellation not delivered while the store was busy")
        .unwrap()
        .unwrap_err();
    assert!(err.is_cancelled());

    // The store is still working on the cancelled statement.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.log(), vec!["wait forever"]);
    assert!(queue.is_running());
    assert!(next_rx.try_recv().is_err());

    gate.notify_one();
    assert!(matches!(next_rx.await.unwrap(), Ok(SparqlResponse::Updated)));
    assert_eq!(store.log(), vec!["wait forever", "after"]);
    assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_callback_does_not_wedge_the_queue() {
    let store = Arc::new(FakeStore::default());
    let queue = TrackerQueue::new(store.clone() as Arc<dyn SparqlConnection>);

    queue.update(Query::new("first", None), None, |_| panic!("callback failed"));
    tokio::time::timeout(
        Duration::from_secs(2),
        queue.update_async(Query::new("second", None), None),
    )
    .await
    .expect("queue stopped dispatching")
    .unwrap();
    assert!(!queue.is_running());
    assert_eq!(store.log(), vec!["first", "second"]);
}

#[tokio::test]
async fn callbacks_may_enqueue_more_work() {
    let store = Arc::new(FakeStore::default());
    let queue = TrackerQueue::new(store.clone() as Arc<dyn SparqlConnection>);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let inner_queue = Arc::clone(&queue);
    queue.select(Query::new("first", None), None, move |result| {
        assert!(result.is_ok());
        inner_queue.update(Query::new("second", None), None, move |result| {
            assert!(result.is_ok());
            done_tx.send(()).unwrap();
        });
    });

    tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .expect("nested statement never ran")
        .unwrap();
    assert_eq!(store.log(), vec!["first", "second"]);
}

#[tokio::test]
async fn context_caches_queue_initialization() {
    let ctx = AppContext::new(Default::default());
    let opened = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let opened = Arc::clone(&opened);
        let err = ctx
            .tracker_queue_with(|| async move {
                opened.fetch_add(1, Ordering::SeqCst);
                Err(Error::TrackerInit("no store".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TrackerInit(_)));
    }
    assert_eq!(opened.load(Ordering::SeqCst), 1);
}
