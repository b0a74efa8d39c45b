//! Client side of the miner object every helper exports.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use zbus::proxy::CacheProperties;

use crate::error::{Error, Result};

/// Object path of the miner object exported by every helper.
pub const OBJECT_PATH: &str = "/org/gnome/Photos/OnlineMiner";

#[zbus::proxy(
    interface = "org.gnome.OnlineMiners.Miner",
    default_path = "/org/gnome/Photos/OnlineMiner",
    gen_blocking = false
)]
pub trait Miner {
    #[zbus(name = "RefreshDB")]
    fn refresh_db(&self) -> zbus::Result<()>;

    fn insert_shared_content(
        &self,
        account_id: &str,
        shared_id: &str,
        source_urn: &str,
    ) -> zbus::Result<()>;

    fn cancel(&self, serial: u32) -> zbus::Result<()>;
}

/// Builds the proxy for the helper on `connection` and checks that the
/// miner object is actually exported.
pub async fn connect(connection: &zbus::Connection) -> Result<MinerProxy<'static>> {
    let proxy = MinerProxy::builder(connection)
        .cache_properties(CacheProperties::No)
        .build()
        .await?;
    connection
        .call_method(
            None::<&str>,
            OBJECT_PATH,
            Some("org.freedesktop.DBus.Peer"),
            "Ping",
            &(),
        )
        .await?;
    Ok(proxy)
}

/// Runs `call` until it finishes or `cancel` fires. A cancelled call is
/// dropped; its reply is ignored when it arrives.
pub async fn cancellable<T>(
    cancel: Option<&CancellationToken>,
    call: impl Future<Output = zbus::Result<T>>,
) -> Result<T> {
    let Some(token) = cancel else {
        return Ok(call.await?);
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = call => Ok(result?),
    }
}
