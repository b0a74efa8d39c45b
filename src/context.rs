use std::sync::Arc;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::controllers::{OffsetController, SearchController};
use crate::error::Result;
use crate::managers::{CollectionManager, SearchMatchManager, SearchTypeManager, SourceManager};
use crate::online_miner::OnlineMinerManager;
use crate::tracker::{SparqlConnection, TrackerBus, TrackerQueue};

/// The managers and controllers the query builder reads.
#[derive(Debug)]
pub struct SearchContextState {
    pub sources: Arc<SourceManager>,
    pub search_types: SearchTypeManager,
    pub search_matches: SearchMatchManager,
    pub collections: CollectionManager,
    pub search: Arc<SearchController>,
    pub offsets: OffsetController,
}

impl SearchContextState {
    pub fn new(offset_step: u32) -> Self {
        let search = Arc::new(SearchController::new());
        Self {
            sources: Arc::new(SourceManager::new()),
            search_types: SearchTypeManager::new(),
            search_matches: SearchMatchManager::new(Arc::clone(&search)),
            collections: CollectionManager::new(),
            search,
            offsets: OffsetController::new(offset_step),
        }
    }
}

impl Default for SearchContextState {
    fn default() -> Self {
        Self::new(crate::query::DEFAULT_STEP)
    }
}

/// Process-wide state, shared by reference counting.
///
/// The tracker queue and the online miner manager are created on first use.
/// A failed initialization is remembered and every later caller gets a copy
/// of the same error.
#[derive(Debug)]
pub struct AppContext {
    config: Config,
    state: SearchContextState,
    queue: OnceCell<Result<Arc<TrackerQueue>>>,
    miners: OnceCell<Result<Arc<OnlineMinerManager>>>,
    cancel: CancellationToken,
}

impl AppContext {
    pub fn new(config: Config) -> Arc<Self> {
        let state = SearchContextState::new(config.offset_step);
        Arc::new(Self {
            config,
            state,
            queue: OnceCell::new(),
            miners: OnceCell::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &SearchContextState {
        &self.state
    }

    /// Cancelled on shutdown; every long-running task watches a child of it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The shared queue over the configured tracker store.
    pub async fn tracker_queue(&self) -> Result<Arc<TrackerQueue>> {
        let config = &self.config.tracker;
        self.tracker_queue_with(|| async move {
            let store = TrackerBus::open(config).await?;
            Ok(Arc::new(store) as Arc<dyn SparqlConnection>)
        })
        .await
    }

    /// Like [`AppContext::tracker_queue`] with a caller-supplied opener. The
    /// opener only runs if the queue has not been initialized yet.
    pub async fn tracker_queue_with<F, Fut>(&self, open: F) -> Result<Arc<TrackerQueue>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn SparqlConnection>>>,
    {
        self.queue
            .get_or_init(|| async { open().await.map(TrackerQueue::new) })
            .await
            .clone()
    }

    pub async fn online_miner_manager(&self) -> Result<Arc<OnlineMinerManager>> {
        self.miners
            .get_or_init(|| async {
                let queue = match self.tracker_queue().await {
                    Ok(queue) => Some(queue),
                    Err(err) => {
                        warn!(error = %err, "Unable to create the tracker queue");
                        None
                    }
                };
                OnlineMinerManager::start(
                    &self.config,
                    Arc::clone(&self.state.sources),
                    queue,
                    self.cancel.child_token(),
                )
            })
            .await
            .clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(Ok(miners)) = self.miners.get() {
            miners.shutdown();
        }
    }
}
