use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::address::BusAddress;
use crate::bus::connection::PeerCredentials;
use crate::bus::server::{BusServer, ServerHandler};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{ManagerEvent, MinersChanged};
use crate::managers::{Manager, SourceManager};
use crate::online_miner::process::OnlineMinerProcess;
use crate::schedule::ScheduledTask;
use crate::tracker::endpoint::{ENDPOINT_PATH, Endpoint};
use crate::tracker::queue::TrackerQueue;

/// Presence of this variable disables every miner refresh.
pub const DISABLE_MINERS_ENV: &str = "GNOME_PHOTOS_DISABLE_MINERS";

const EVENT_CAPACITY: usize = 16;

#[derive(Default)]
struct State {
    timers: HashMap<String, ScheduledTask>,
    running: Vec<Arc<OnlineMinerProcess>>,
}

/// Owns the private bus server and one [`OnlineMinerProcess`] per online
/// provider, and keeps every provider's cache fresh.
///
/// A provider is idle, running a RefreshDB, or waiting for its refresh
/// timer. Only successful refreshes are rescheduled.
pub struct OnlineMinerManager {
    server: BusServer,
    processes: BTreeMap<String, Arc<OnlineMinerProcess>>,
    sources: Arc<SourceManager>,
    queue: Option<Arc<TrackerQueue>>,
    refresh_interval: Duration,
    state: Mutex<State>,
    changed: broadcast::Sender<MinersChanged>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for OnlineMinerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlineMinerManager")
            .field("address", &self.server.client_address().to_string())
            .field("providers", &self.processes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl OnlineMinerManager {
    /// Starts the bus server, creates the miners and runs a first refresh.
    ///
    /// Without a tracker queue miners still run but cannot write anything.
    pub fn start(
        config: &Config,
        sources: Arc<SourceManager>,
        queue: Option<Arc<TrackerQueue>>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let listen: BusAddress = config.bus_listen_address().parse()?;
        let server = BusServer::bind(&listen)?;
        let address = server.client_address().to_string();

        let processes = config
            .online_providers()
            .map(|provider| {
                let process =
                    OnlineMinerProcess::new(provider, address.clone(), config.online_miner_path(provider));
                (provider.to_string(), process)
            })
            .collect();

        if queue.is_none() {
            warn!("tracker queue unavailable; online miners cannot store results");
        }

        let (changed, _) = broadcast::channel(EVENT_CAPACITY);
        let manager = Arc::new(Self {
            server,
            processes,
            sources,
            queue,
            refresh_interval: config.refresh_interval,
            state: Mutex::new(State::default()),
            changed,
            cancel,
        });
        manager.server.start(Arc::downgrade(&manager));
        manager.watch_sources();
        info!(address = %address, providers = manager.processes.len(), "online miner manager started");

        manager.refresh_all();
        Ok(manager)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("online miner manager mutex poisoned")
    }

    pub fn address(&self) -> BusAddress {
        self.server.client_address()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MinersChanged> {
        self.changed.subscribe()
    }

    pub fn get(&self, provider_type: &str) -> Option<&Arc<OnlineMinerProcess>> {
        self.processes.get(provider_type)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Arc<OnlineMinerProcess>> {
        self.processes.values()
    }

    /// Miners with a RefreshDB in flight, most recent first.
    pub fn running(&self) -> Vec<Arc<OnlineMinerProcess>> {
        self.lock().running.clone()
    }

    pub fn has_timer(&self, provider_type: &str) -> bool {
        self.lock().timers.contains_key(provider_type)
    }

    fn watch_sources(self: &Arc<Self>) {
        let mut events = self.sources.base().subscribe();
        let manager = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ManagerEvent::ObjectAdded(_) | ManagerEvent::ObjectRemoved(_))
                    | Err(RecvError::Lagged(_)) => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.refresh_all();
                    }
                    Ok(_) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Refreshes every miner whose provider has an account source.
    pub fn refresh_all(self: &Arc<Self>) {
        for (provider_type, miner) in &self.processes {
            if !self.sources.has_provider_type(provider_type) {
                continue;
            }
            if miner.provider_name().is_none() {
                match self.sources.get_provider_name_for_provider_type(provider_type) {
                    Some(name) if !name.is_empty() => miner.set_provider_name(name),
                    _ => {
                        warn!(provider = %provider_type, "no provider name for online miner");
                        continue;
                    }
                }
            }
            self.refresh(miner);
        }
    }

    /// Starts a RefreshDB unless one is already running for this miner.
    pub fn refresh(self: &Arc<Self>, miner: &Arc<OnlineMinerProcess>) {
        if std::env::var_os(DISABLE_MINERS_ENV).is_some() {
            return;
        }
        let provider_type = miner.provider_type().to_string();

        let snapshot = {
            let mut state = self.lock();
            if state.running.iter().any(|running| Arc::ptr_eq(running, miner)) {
                debug!(provider = %provider_type, "skipped refresh: already running");
                return;
            }
            if let Some(timer) = state.timers.remove(&provider_type) {
                timer.cancel();
                debug!(provider = %provider_type, "removed refresh timer");
            }
            state.running.insert(0, Arc::clone(miner));
            state.running.clone()
        };
        let _ = self.changed.send(MinersChanged(snapshot));

        debug!(provider = %provider_type, "calling RefreshDB");
        let manager = Arc::downgrade(self);
        let miner = Arc::clone(miner);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let result = miner.refresh_db(Some(&cancel)).await;
            if let Some(manager) = manager.upgrade() {
                manager.refresh_db_done(&miner, result);
            }
        });
    }

    fn refresh_db_done(self: &Arc<Self>, miner: &Arc<OnlineMinerProcess>, result: Result<()>) {
        let provider_type = miner.provider_type().to_string();
        debug!(provider = %provider_type, "finished RefreshDB");

        let reschedule = match result {
            Ok(()) => true,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                warn!(provider = %provider_type, error = %err, "Unable to update the cache");
                false
            }
        };

        let snapshot = {
            let mut state = self.lock();
            state.running.retain(|running| !Arc::ptr_eq(running, miner));
            state.running.clone()
        };
        let _ = self.changed.send(MinersChanged(snapshot));

        if !reschedule {
            return;
        }
        let mut state = self.lock();
        let timer = self.schedule_refresh(Arc::downgrade(self), Arc::clone(miner));
        state.timers.insert(provider_type.clone(), timer);
        drop(state);
        debug!(provider = %provider_type, interval = ?self.refresh_interval, "added refresh timer");
    }

    fn schedule_refresh(&self, manager: Weak<Self>, miner: Arc<OnlineMinerProcess>) -> ScheduledTask {
        ScheduledTask::after(self.refresh_interval, move || async move {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            manager.lock().timers.remove(miner.provider_type());
            manager.refresh(&miner);
        })
    }

    /// Forwards shared content to the provider's helper.
    pub async fn insert_shared_content(
        &self,
        provider_type: &str,
        account_id: &str,
        shared_id: &str,
        source_urn: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let miner = self
            .processes
            .get(provider_type)
            .ok_or_else(|| Error::UnknownProvider(provider_type.to_string()))?;
        miner
            .insert_shared_content(account_id, shared_id, source_urn, cancel)
            .await
    }

    /// Cancels in-flight calls and timers and stops accepting helpers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.server.stop();
        let mut state = self.lock();
        for (_, timer) in state.timers.drain() {
            timer.cancel();
        }
    }

    /// Exports the SPARQL endpoint on the helper's connection. Done before
    /// the helper's calls are released so its first query finds it.
    async fn create_endpoint(&self, miner: &OnlineMinerProcess, connection: &zbus::Connection) {
        let Some(queue) = &self.queue else {
            warn!(provider = %miner.provider_type(), "Unable to create SPARQL endpoint: no tracker queue");
            return;
        };
        let endpoint = Endpoint::new(Arc::clone(queue), self.cancel.child_token());
        if let Err(err) = connection.object_server().at(ENDPOINT_PATH, endpoint).await {
            warn!(provider = %miner.provider_type(), error = %err, "Unable to create SPARQL endpoint");
        }
    }

    fn find_by_credentials(&self, credentials: &PeerCredentials) -> Option<&Arc<OnlineMinerProcess>> {
        self.processes
            .values()
            .find(|miner| miner.matches_credentials(credentials))
    }
}

#[async_trait]
impl ServerHandler for OnlineMinerManager {
    fn authorize_authenticated_peer(&self, credentials: Option<&PeerCredentials>) -> bool {
        debug!(?credentials, "received authorization request");
        let Some(credentials) = credentials else {
            warn!("Unable to authorize peer: credentials not found");
            return false;
        };
        match self.find_by_credentials(credentials) {
            Some(miner) if miner.has_connection() => {
                warn!(provider = %miner.provider_type(), "Unable to authorize peer: connection exists");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    async fn new_connection(&self, connection: zbus::Connection, credentials: PeerCredentials) {
        debug!("received new connection");
        let Some(miner) = self.find_by_credentials(&credentials) else {
            return;
        };
        let miner = Arc::clone(miner);
        self.create_endpoint(&miner, &connection).await;
        miner.set_connection(connection).await;
    }
}

impl Drop for OnlineMinerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
