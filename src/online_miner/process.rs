use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::connection::{PeerCredentials, closed};
use crate::error::{Error, Result};
use crate::online_miner::proxy::{MinerProxy, cancellable, connect};

type ProxyWaiter = oneshot::Sender<Result<MinerProxy<'static>>>;

#[derive(Default)]
struct State {
    connection: Option<zbus::Connection>,
    proxy: Option<MinerProxy<'static>>,
    error: Option<Error>,
    pid: Option<u32>,
    /// Kills the helper that is currently live.
    child_cancel: Option<CancellationToken>,
    /// Bumped on every spawn and reset so stale exit handlers are ignored.
    generation: u64,
    pending: VecDeque<ProxyWaiter>,
}

/// Supervises the helper subprocess of one online provider.
///
/// Calls made before the helper connected back wait in a FIFO and are
/// resolved, in order, once [`OnlineMinerProcess::set_connection`] runs or
/// the helper exits.
pub struct OnlineMinerProcess {
    provider_type: String,
    provider_name: Mutex<Option<String>>,
    address: String,
    helper: PathBuf,
    cancel: CancellationToken,
    state: Mutex<State>,
}

impl fmt::Debug for OnlineMinerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnlineMinerProcess")
            .field("provider_type", &self.provider_type)
            .field("helper", &self.helper)
            .finish_non_exhaustive()
    }
}

impl OnlineMinerProcess {
    pub fn new(
        provider_type: impl Into<String>,
        address: impl Into<String>,
        helper: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider_type: provider_type.into(),
            provider_name: Mutex::new(None),
            address: address.into(),
            helper: helper.into(),
            cancel: CancellationToken::new(),
            state: Mutex::new(State::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("online miner mutex poisoned")
    }

    pub fn provider_type(&self) -> &str {
        &self.provider_type
    }

    pub fn provider_name(&self) -> Option<String> {
        self.provider_name
            .lock()
            .expect("provider name mutex poisoned")
            .clone()
    }

    pub fn set_provider_name(&self, name: impl Into<String>) {
        *self
            .provider_name
            .lock()
            .expect("provider name mutex poisoned") = Some(name.into());
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connection(&self) -> Option<zbus::Connection> {
        self.lock().connection.clone()
    }

    pub fn has_connection(&self) -> bool {
        self.lock().connection.is_some()
    }

    /// PID of the live helper, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    /// Number of calls waiting for the helper to connect.
    pub fn pending_calls(&self) -> usize {
        self.lock().pending.len()
    }

    /// True when `credentials` belong to this process's live helper.
    pub fn matches_credentials(&self, credentials: &PeerCredentials) -> bool {
        match (self.lock().pid, credentials.pid) {
            (Some(pid), Some(peer)) => pid == peer,
            _ => false,
        }
    }

    pub async fn refresh_db(self: &Arc<Self>, cancel: Option<&CancellationToken>) -> Result<()> {
        let proxy = self.proxy(cancel).await?;
        cancellable(cancel, proxy.refresh_db()).await
    }

    pub async fn insert_shared_content(
        self: &Arc<Self>,
        account_id: &str,
        shared_id: &str,
        source_urn: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let proxy = self.proxy(cancel).await?;
        cancellable(
            cancel,
            proxy.insert_shared_content(account_id, shared_id, source_urn),
        )
        .await
    }

    /// Resolves to the proxy, spawning the helper when nothing is live.
    async fn proxy(
        self: &Arc<Self>,
        cancel: Option<&CancellationToken>,
    ) -> Result<MinerProxy<'static>> {
        let waiter = {
            let mut state = self.lock();
            if state.connection.is_some() {
                if let Some(err) = &state.error {
                    return Err(err.clone());
                }
                if let Some(proxy) = &state.proxy {
                    return Ok(proxy.clone());
                }
            }

            let (tx, rx) = oneshot::channel();
            state.pending.push_back(tx);
            if state.pid.is_none() {
                if let Err(err) = self.spawn(&mut state) {
                    warn!(provider = %self.provider_type, error = %err, "unable to spawn online miner");
                    let pending = mem::take(&mut state.pending);
                    drop(state);
                    resolve(pending, Err(err));
                }
            }
            rx
        };

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            proxy = waiter => proxy.unwrap_or(Err(Error::ConnectionClosed)),
            _ = cancelled => Err(Error::Cancelled),
        }
    }

    fn spawn(self: &Arc<Self>, state: &mut State) -> Result<()> {
        let child = Command::new(&self.helper)
            .arg("--address")
            .arg(&self.address)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::Spawn {
                path: self.helper.clone(),
                source: err.into(),
            })?;

        let pid = child.id();
        state.generation += 1;
        state.pid = pid;
        let child_cancel = self.cancel.child_token();
        state.child_cancel = Some(child_cancel.clone());
        info!(provider = %self.provider_type, pid, "spawned online miner");

        tokio::spawn(wait_for_exit(
            Arc::downgrade(self),
            child,
            state.generation,
            child_cancel,
        ));
        Ok(())
    }

    fn exited(&self, generation: u64, status: Option<ExitStatus>) {
        match status {
            Some(status) if status.success() => {
                debug!(provider = %self.provider_type, "online miner exited");
            }
            Some(status) => {
                warn!(provider = %self.provider_type, %status, "Unable to successfully terminate online miner");
            }
            None => debug!(provider = %self.provider_type, "online miner killed"),
        }

        let pending = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.pid = None;
            state.child_cancel = None;
            state.connection = None;
            state.proxy = None;
            state.error = None;
            state.generation += 1;
            mem::take(&mut state.pending)
        };
        resolve(
            pending,
            Err(Error::MinerTerminated(self.provider_type.clone())),
        );
    }

    /// Adopts the connection made by this process's helper and releases the
    /// calls waiting for it.
    ///
    /// When the miner object cannot be reached the error sticks: every call
    /// fails with it until the helper goes away.
    pub async fn set_connection(self: &Arc<Self>, connection: zbus::Connection) {
        let outcome = connect(&connection).await;
        let (pending, generation) = {
            let mut state = self.lock();
            match &outcome {
                Ok(proxy) => state.proxy = Some(proxy.clone()),
                Err(err) => {
                    warn!(provider = %self.provider_type, error = %err, "unable to create online miner proxy");
                    state.error = Some(err.clone());
                }
            }
            state.connection = Some(connection.clone());
            (mem::take(&mut state.pending), state.generation)
        };
        debug!(provider = %self.provider_type, waiting = pending.len(), "online miner connected");
        resolve(pending, outcome);

        let process = Arc::downgrade(self);
        tokio::spawn(async move {
            closed(&connection).await;
            if let Some(process) = process.upgrade() {
                process.connection_closed(generation);
            }
        });
    }

    fn connection_closed(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        debug!(provider = %self.provider_type, "online miner connection closed");
        if let Some(child) = state.child_cancel.take() {
            child.cancel();
        }
        state.connection = None;
        state.proxy = None;
        state.error = None;
        state.pid = None;
        state.generation += 1;
    }
}

impl Drop for OnlineMinerProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn resolve(pending: VecDeque<ProxyWaiter>, outcome: Result<MinerProxy<'static>>) {
    for waiter in pending {
        let _ = waiter.send(outcome.clone());
    }
}

async fn wait_for_exit(
    process: Weak<OnlineMinerProcess>,
    mut child: Child,
    generation: u64,
    cancel: CancellationToken,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            None
        }
    };
    if let Some(process) = process.upgrade() {
        process.exited(generation, status);
    }
}
