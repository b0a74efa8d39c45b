//! Client side of the private bus and helpers shared by both ends.

use futures_util::StreamExt;
use tokio::net::UnixStream;
use zbus::MessageStream;
use zbus::connection::Builder;

use crate::bus::address::BusAddress;
use crate::error::{Error, Result};

/// Identity of the process on the other end of a unix socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: Option<u32>,
    pub uid: u32,
}

impl PeerCredentials {
    pub fn from_stream(stream: &UnixStream) -> Option<Self> {
        let cred = stream.peer_cred().ok()?;
        Some(Self {
            pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
            uid: cred.uid(),
        })
    }
}

/// Builder for a peer-to-peer connection to the server at `address`.
///
/// A guid in the address is checked against the one the server announces.
/// Objects to export are added with `serve_at` before `build`.
pub fn client(address: &BusAddress) -> Result<Builder<'static>> {
    if address.socket_path().is_none() {
        return Err(Error::Address(format!("{address} cannot be connected to")));
    }
    Ok(Builder::address(address.to_string().as_str())?.p2p())
}

/// Resolves once the peer has gone away.
pub async fn closed(connection: &zbus::Connection) {
    let mut messages = MessageStream::from(connection);
    while let Some(message) = messages.next().await {
        if message.is_err() {
            break;
        }
    }
}
