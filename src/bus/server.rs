use std::path::PathBuf;
use std::sync::Weak;

use async_trait::async_trait;
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zbus::connection::Builder;

use crate::bus::address::{BusAddress, Transport, generate_guid};
use crate::bus::connection::PeerCredentials;
use crate::error::{Error, Result};

/// Decides which peers may connect and takes ownership of the accepted ones.
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// Peers without credentials are passed as `None`. A refused peer is
    /// disconnected before the D-Bus handshake completes.
    fn authorize_authenticated_peer(&self, credentials: Option<&PeerCredentials>) -> bool;

    async fn new_connection(&self, connection: zbus::Connection, credentials: PeerCredentials);
}

/// Listening side of the private peer-to-peer bus.
///
/// The socket file is removed when the server is dropped.
#[derive(Debug)]
pub struct BusServer {
    guid: String,
    socket_path: PathBuf,
    listener: std::sync::Mutex<Option<UnixListener>>,
    cancel: CancellationToken,
}

impl BusServer {
    /// Binds `address`. A `tmpdir` address gets a fresh `dbus-*` socket.
    pub fn bind(address: &BusAddress) -> Result<Self> {
        let socket_path = match &address.transport {
            Transport::Path(path) => path.clone(),
            Transport::TmpDir(dir) => {
                let suffix: String = rand::rng()
                    .sample_iter(&Alphanumeric)
                    .take(10)
                    .map(char::from)
                    .collect();
                dir.join(format!("dbus-{suffix}"))
            }
        };
        let listener = UnixListener::bind(&socket_path).map_err(|err| {
            Error::Address(format!("unable to listen on {}: {err}", socket_path.display()))
        })?;
        let guid = address.guid.clone().unwrap_or_else(generate_guid);
        info!(socket = %socket_path.display(), guid = %guid, "bus server listening");

        Ok(Self {
            guid,
            socket_path,
            listener: std::sync::Mutex::new(Some(listener)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Address handed to clients, including the guid.
    pub fn client_address(&self) -> BusAddress {
        BusAddress::path(self.socket_path.clone(), Some(self.guid.clone()))
    }

    /// Starts accepting peers. Calling it again has no effect.
    pub fn start<H: ServerHandler>(&self, handler: Weak<H>) {
        let listener = self
            .listener
            .lock()
            .expect("bus server mutex poisoned")
            .take();
        let Some(listener) = listener else {
            return;
        };
        tokio::spawn(accept_loop(
            listener,
            handler,
            self.guid.clone(),
            self.cancel.clone(),
        ));
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %err, socket = %self.socket_path.display(), "socket already gone");
        }
    }
}

async fn accept_loop<H: ServerHandler>(
    listener: UnixListener,
    handler: Weak<H>,
    guid: String,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(error = %err, "bus accept failed");
                continue;
            }
        };
        let Some(strong) = handler.upgrade() else {
            break;
        };

        let credentials = PeerCredentials::from_stream(&stream);
        if !strong.authorize_authenticated_peer(credentials.as_ref()) {
            debug!(?credentials, "refusing unauthorized peer");
            continue;
        }
        let Some(credentials) = credentials else {
            continue;
        };
        drop(strong);

        let handler = handler.clone();
        let guid = guid.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let connection = tokio::select! {
                _ = cancel.cancelled() => return,
                connection = handshake(stream, &guid) => connection,
            };
            match connection {
                Ok(connection) => {
                    debug!(?credentials, "accepted bus peer");
                    if let Some(handler) = handler.upgrade() {
                        handler.new_connection(connection, credentials).await;
                    }
                }
                Err(err) => debug!(error = %err, "peer handshake failed"),
            }
        });
    }
}

async fn handshake(stream: UnixStream, guid: &str) -> Result<zbus::Connection> {
    let connection = Builder::unix_stream(stream)
        .server(guid)?
        .p2p()
        .build()
        .await?;
    Ok(connection)
}
