//! Helper side of the online miner protocol.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zbus::fdo;
use zbus::message::Header;

use crate::bus::address::BusAddress;
use crate::bus::connection::{client, closed};
use crate::error::{Error, Result};
use crate::online_miner::proxy::OBJECT_PATH;
use crate::tracker::bus::TrackerBus;
use crate::tracker::connection::SparqlConnection;

/// Provider-specific work done by a miner helper.
///
/// `sparql` reaches the store through the endpoint the manager exports on
/// the helper's connection.
#[async_trait]
pub trait MinerBackend: Send + Sync + 'static {
    async fn refresh_db(&self, sparql: &dyn SparqlConnection, cancel: CancellationToken) -> Result<()>;

    async fn insert_shared_content(
        &self,
        sparql: &dyn SparqlConnection,
        account_id: &str,
        shared_id: &str,
        source_urn: &str,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// The miner object a helper exports to the manager.
///
/// Calls in flight are tracked by serial so `Cancel` can stop them.
pub struct MinerObject {
    backend: Arc<dyn MinerBackend>,
    ongoing: Arc<Mutex<HashMap<u32, CancellationToken>>>,
    cancel: CancellationToken,
}

impl MinerObject {
    pub fn new(backend: Arc<dyn MinerBackend>, cancel: CancellationToken) -> Self {
        Self {
            backend,
            ongoing: Arc::default(),
            cancel,
        }
    }

    fn ongoing(&self) -> MutexGuard<'_, HashMap<u32, CancellationToken>> {
        self.ongoing.lock().expect("ongoing mutex poisoned")
    }

    /// Runs one backend call under a token registered for `serial`.
    async fn track<F, Fut>(&self, serial: u32, call: F) -> fdo::Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let token = self.cancel.child_token();
        self.ongoing().insert(serial, token.clone());
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = call(token.clone()) => result,
        };
        self.ongoing().remove(&serial);
        Ok(result?)
    }
}

#[zbus::interface(name = "org.gnome.OnlineMiners.Miner")]
impl MinerObject {
    #[zbus(name = "RefreshDB")]
    async fn refresh_db(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> fdo::Result<()> {
        let serial = header.primary().serial_num().get();
        let sparql = TrackerBus::peer(connection).await?;
        let backend = Arc::clone(&self.backend);
        self.track(serial, |token| async move {
            backend.refresh_db(&sparql, token).await
        })
        .await
    }

    async fn insert_shared_content(
        &self,
        account_id: String,
        shared_id: String,
        source_urn: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> fdo::Result<()> {
        let serial = header.primary().serial_num().get();
        let sparql = TrackerBus::peer(connection).await?;
        let backend = Arc::clone(&self.backend);
        self.track(serial, |token| async move {
            backend
                .insert_shared_content(&sparql, &account_id, &shared_id, &source_urn, token)
                .await
        })
        .await
    }

    async fn cancel(&self, serial: u32) -> fdo::Result<()> {
        let token = self.ongoing().get(&serial).cloned();
        match token {
            Some(token) => {
                debug!(serial, "cancelling call");
                token.cancel();
                Ok(())
            }
            None => Err(fdo::Error::InvalidArgs("Invalid serial".into())),
        }
    }
}

/// Connects to the manager at `address` and serves the miner object until
/// the connection closes or `cancel` fires.
pub async fn run(
    address: &BusAddress,
    provider_type: &str,
    backend: Arc<dyn MinerBackend>,
    cancel: CancellationToken,
) -> Result<()> {
    let calls = cancel.child_token();
    let connection = client(address)?
        .serve_at(OBJECT_PATH, MinerObject::new(backend, calls.clone()))?
        .build()
        .await?;
    info!(provider = provider_type, %address, "online miner connected");

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = closed(&connection) => debug!(provider = provider_type, "manager went away"),
    }
    calls.cancel();
    debug!(provider = provider_type, "online miner stopped");
    Ok(())
}
