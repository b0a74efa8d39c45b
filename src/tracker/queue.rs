use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::query::Query;
use crate::tracker::connection::{BlankNodes, Cursor, SparqlConnection};

/// Successful outcome of a queued statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SparqlResponse {
    Cursor(Cursor),
    Updated,
    Blank(BlankNodes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    Update,
    UpdateBlank,
}

/// Completion callback. Whatever it captures is released after it runs.
pub type Callback = Box<dyn FnOnce(Result<SparqlResponse>) + Send + 'static>;

struct Task {
    query: Query,
    kind: QueryKind,
    cancel: Option<CancellationToken>,
    /// Taken early when the task is cancelled while its statement runs.
    callback: Option<Callback>,
}

#[derive(Default)]
struct State {
    tasks: VecDeque<Task>,
    running: bool,
}

/// Runs statements against one shared connection, one at a time, in the
/// order they were queued.
///
/// Cancelling a dispatched task answers its callback right away, but the
/// next task waits until the store call itself has returned. Enqueueing
/// spawns onto the current tokio runtime.
pub struct TrackerQueue {
    connection: Arc<dyn SparqlConnection>,
    state: Mutex<State>,
}

impl fmt::Debug for TrackerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TrackerQueue")
            .field("pending", &state.tasks.len())
            .field("running", &state.running)
            .finish()
    }
}

impl TrackerQueue {
    pub fn new(connection: Arc<dyn SparqlConnection>) -> Arc<Self> {
        Arc::new(Self {
            connection,
            state: Mutex::new(State::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("tracker queue mutex poisoned")
    }

    /// Tasks not completed yet, including the one in flight.
    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn select(
        self: &Arc<Self>,
        query: Query,
        cancel: Option<CancellationToken>,
        callback: impl FnOnce(Result<SparqlResponse>) + Send + 'static,
    ) {
        self.push(query, QueryKind::Select, cancel, Box::new(callback));
    }

    pub fn update(
        self: &Arc<Self>,
        query: Query,
        cancel: Option<CancellationToken>,
        callback: impl FnOnce(Result<SparqlResponse>) + Send + 'static,
    ) {
        self.push(query, QueryKind::Update, cancel, Box::new(callback));
    }

    pub fn update_blank(
        self: &Arc<Self>,
        query: Query,
        cancel: Option<CancellationToken>,
        callback: impl FnOnce(Result<SparqlResponse>) + Send + 'static,
    ) {
        self.push(query, QueryKind::UpdateBlank, cancel, Box::new(callback));
    }

    pub async fn select_async(
        self: &Arc<Self>,
        query: Query,
        cancel: Option<CancellationToken>,
    ) -> Result<Cursor> {
        match self.run_async(query, QueryKind::Select, cancel).await? {
            SparqlResponse::Cursor(cursor) => Ok(cursor),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_async(
        self: &Arc<Self>,
        query: Query,
        cancel: Option<CancellationToken>,
    ) -> Result<()> {
        match self.run_async(query, QueryKind::Update, cancel).await? {
            SparqlResponse::Updated => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_blank_async(
        self: &Arc<Self>,
        query: Query,
        cancel: Option<CancellationToken>,
    ) -> Result<BlankNodes> {
        match self.run_async(query, QueryKind::UpdateBlank, cancel).await? {
            SparqlResponse::Blank(nodes) => Ok(nodes),
            other => Err(unexpected(other)),
        }
    }

    async fn run_async(
        self: &Arc<Self>,
        query: Query,
        kind: QueryKind,
        cancel: Option<CancellationToken>,
    ) -> Result<SparqlResponse> {
        let (tx, rx) = oneshot::channel();
        self.push(
            query,
            kind,
            cancel,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await.map_err(|_| Error::Abandoned)?
    }

    fn push(
        self: &Arc<Self>,
        query: Query,
        kind: QueryKind,
        cancel: Option<CancellationToken>,
        callback: Callback,
    ) {
        self.lock().tasks.push_back(Task {
            query,
            kind,
            cancel,
            callback: Some(callback),
        });
        self.check_queue();
    }

    fn check_queue(self: &Arc<Self>) {
        let (query, kind, cancel) = {
            let mut state = self.lock();
            if state.running {
                return;
            }
            let Some(head) = state.tasks.front() else {
                return;
            };
            let next = (head.query.clone(), head.kind, head.cancel.clone());
            state.running = true;
            next
        };

        debug!(
            tag = query.tag().unwrap_or(""),
            source_id = query.source_id().unwrap_or(""),
            source_name = query.source().map(|s| s.name()).unwrap_or(""),
            kind = ?kind,
            sparql = query.sparql(),
            "dispatching query"
        );

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let result = queue.execute(&query, kind, cancel).await;
            queue.complete(result);
        });
    }

    async fn execute(
        self: &Arc<Self>,
        query: &Query,
        kind: QueryKind,
        cancel: Option<CancellationToken>,
    ) -> Result<SparqlResponse> {
        let sparql = query.sparql();
        let call = async {
            match kind {
                QueryKind::Select => self.connection.query(sparql).await.map(SparqlResponse::Cursor),
                QueryKind::Update => self
                    .connection
                    .update(sparql)
                    .await
                    .map(|()| SparqlResponse::Updated),
                QueryKind::UpdateBlank => self
                    .connection
                    .update_blank(sparql)
                    .await
                    .map(SparqlResponse::Blank),
            }
        };
        let Some(token) = cancel else {
            return call.await;
        };
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        tokio::pin!(call);
        tokio::select! {
            biased;
            result = &mut call => return result,
            _ = token.cancelled() => {}
        }
        let callback = self.lock().tasks.front_mut().and_then(|task| task.callback.take());
        if let Some(callback) = callback {
            invoke(callback, Err(Error::Cancelled));
        }
        // The store keeps working on the statement; nothing else may run
        // until it returns.
        let _ = call.await;
        Err(Error::Cancelled)
    }

    fn complete(self: &Arc<Self>, result: Result<SparqlResponse>) {
        let task = {
            let mut state = self.lock();
            state.running = false;
            state.tasks.pop_front()
        };
        if let Some(callback) = task.and_then(|task| task.callback) {
            invoke(callback, result);
        }
        self.check_queue();
    }
}

fn invoke(callback: Callback, result: Result<SparqlResponse>) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
        error!("tracker queue callback panicked");
    }
}

fn unexpected(response: SparqlResponse) -> Error {
    Error::Protocol(format!("unexpected tracker response {response:?}"))
}
