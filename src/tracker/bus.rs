//! Tracker3 `Endpoint` D-Bus protocol.
//!
//! Queries carry the SPARQL text in the call and get their rows back through
//! a pipe passed as a file descriptor. Updates send the statement through a
//! pipe instead. Integers on the pipes use host byte order.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, OwnedFd};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tracing::debug;
use zbus::proxy::CacheProperties;
use zbus::zvariant::{Fd, Value};

use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::tracker::connection::{BlankNodes, Cursor, SparqlConnection};

/// Object path every Tracker3 endpoint is exported at.
pub const ENDPOINT_PATH: &str = "/org/freedesktop/Tracker3/Endpoint";

const VALUE_TYPE_UNBOUND: i32 = 0;
const VALUE_TYPE_STRING: i32 = 2;

#[zbus::proxy(
    interface = "org.freedesktop.Tracker3.Endpoint",
    default_path = "/org/freedesktop/Tracker3/Endpoint",
    gen_blocking = false
)]
pub trait Endpoint {
    fn query(
        &self,
        query: &str,
        output_stream: Fd<'_>,
        arguments: &HashMap<&str, Value<'_>>,
    ) -> zbus::Result<Vec<String>>;

    fn update(&self, input_stream: Fd<'_>) -> zbus::Result<()>;

    fn update_blank(&self, input_stream: Fd<'_>) -> zbus::Result<BlankNodes>;
}

/// SPARQL connection to a Tracker3 endpoint on a D-Bus connection.
///
/// Used for the shared store on the session bus and by helpers for the
/// endpoint the manager exports on their private connection.
#[derive(Debug, Clone)]
pub struct TrackerBus {
    proxy: EndpointProxy<'static>,
}

impl TrackerBus {
    /// Talks to the endpoint exported by the peer of a private connection.
    pub async fn peer(connection: &zbus::Connection) -> Result<Self> {
        let proxy = EndpointProxy::builder(connection)
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        Ok(Self { proxy })
    }

    /// Connects to the configured store and checks that it answers.
    pub async fn open(config: &TrackerConfig) -> Result<Self> {
        let init = |err: Error| Error::TrackerInit(err.to_string());
        let connection = match &config.bus_address {
            Some(address) => zbus::connection::Builder::address(address.as_str())
                .map_err(|err| init(err.into()))?
                .build()
                .await
                .map_err(|err| init(err.into()))?,
            None => zbus::Connection::session()
                .await
                .map_err(|err| init(err.into()))?,
        };

        connection
            .call_method(
                Some(config.dbus_service.as_str()),
                ENDPOINT_PATH,
                Some("org.freedesktop.DBus.Peer"),
                "Ping",
                &(),
            )
            .await
            .map_err(|err| init(err.into()))?;

        let proxy = EndpointProxy::builder(&connection)
            .destination(config.dbus_service.clone())
            .map_err(|err| init(err.into()))?
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .map_err(|err| init(err.into()))?;
        debug!(service = %config.dbus_service, "connected to tracker endpoint");
        Ok(Self { proxy })
    }
}

#[async_trait]
impl SparqlConnection for TrackerBus {
    async fn query(&self, sparql: &str) -> Result<Cursor> {
        let (reader, writer) = io::pipe()?;
        let mut reader = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
        let rows = tokio::spawn(async move {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await.map(|_| data)
        });

        let columns = self
            .proxy
            .query(sparql, Fd::from(writer.as_fd()), &HashMap::new())
            .await;
        // The endpoint holds its own copy; ours must go for the read to end.
        drop(writer);
        let columns = columns?;

        let data = rows
            .await
            .map_err(|err| Error::Protocol(format!("cursor reader failed: {err}")))??;
        decode_cursor(columns, &data)
    }

    async fn update(&self, sparql: &str) -> Result<()> {
        let input = StatementPipe::new(sparql)?;
        let result = self.proxy.update(Fd::from(input.reader.as_fd())).await;
        input.finish(result.map_err(Error::from)).await
    }

    async fn update_blank(&self, sparql: &str) -> Result<BlankNodes> {
        let input = StatementPipe::new(sparql)?;
        let result = self.proxy.update_blank(Fd::from(input.reader.as_fd())).await;
        input.finish(result.map_err(Error::from)).await
    }
}

/// Pipe whose write end is fed the length-prefixed statement in the
/// background while the read end travels with the call.
struct StatementPipe {
    reader: io::PipeReader,
    written: tokio::task::JoinHandle<io::Result<()>>,
}

impl StatementPipe {
    fn new(sparql: &str) -> Result<Self> {
        let (reader, writer) = io::pipe()?;
        let mut writer = pipe::Sender::from_owned_fd(OwnedFd::from(writer))?;
        let payload = encode_statement(sparql)?;
        let written = tokio::spawn(async move { writer.write_all(&payload).await });
        Ok(Self { reader, written })
    }

    async fn finish<T>(self, result: Result<T>) -> Result<T> {
        drop(self.reader);
        let value = result?;
        self.written
            .await
            .map_err(|err| Error::Protocol(format!("statement writer failed: {err}")))??;
        Ok(value)
    }
}

pub(crate) fn encode_statement(sparql: &str) -> Result<Vec<u8>> {
    let len = i32::try_from(sparql.len())
        .map_err(|_| Error::Protocol("statement too long".into()))?;
    let mut payload = Vec::with_capacity(sparql.len() + 4);
    payload.extend_from_slice(&len.to_ne_bytes());
    payload.extend_from_slice(sparql.as_bytes());
    Ok(payload)
}

/// Reads one length-prefixed statement from the pipe behind `fd`.
pub(crate) async fn read_statement(fd: OwnedFd) -> Result<String> {
    let mut input = pipe::Receiver::from_owned_fd(fd)?;
    let mut len = [0u8; 4];
    input.read_exact(&mut len).await?;
    let len = usize::try_from(i32::from_ne_bytes(len))
        .map_err(|_| Error::Protocol("negative statement length".into()))?;
    let mut sparql = vec![0u8; len];
    input.read_exact(&mut sparql).await?;
    String::from_utf8(sparql).map_err(|err| Error::Protocol(err.to_string()))
}

/// Writes `cursor` to the pipe behind `fd` and closes it.
pub(crate) async fn write_cursor(fd: OwnedFd, cursor: &Cursor) -> Result<()> {
    let mut output = pipe::Sender::from_owned_fd(fd)?;
    output.write_all(&encode_cursor(cursor)?).await?;
    Ok(())
}

/// Per row: the column count, one value type per column, the end offset of
/// each cell, then every cell as a NUL-terminated string.
pub(crate) fn encode_cursor(cursor: &Cursor) -> Result<Vec<u8>> {
    let to_i32 = |value: usize| {
        i32::try_from(value).map_err(|_| Error::Protocol("cursor row too large".into()))
    };
    let mut out = Vec::new();
    for row in &cursor.rows {
        out.extend_from_slice(&to_i32(row.len())?.to_ne_bytes());
        for cell in row {
            let kind = if cell.is_some() {
                VALUE_TYPE_STRING
            } else {
                VALUE_TYPE_UNBOUND
            };
            out.extend_from_slice(&kind.to_ne_bytes());
        }
        let mut offset: i64 = -1;
        for cell in row {
            offset += cell.as_deref().map_or(0, str::len) as i64 + 1;
            out.extend_from_slice(&to_i32(offset as usize)?.to_ne_bytes());
        }
        for cell in row {
            out.extend_from_slice(cell.as_deref().unwrap_or("").as_bytes());
            out.push(0);
        }
    }
    Ok(out)
}

pub(crate) fn decode_cursor(columns: Vec<String>, mut data: &[u8]) -> Result<Cursor> {
    fn take<'a>(data: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
        if data.len() < len {
            return Err(Error::Protocol("truncated cursor".into()));
        }
        let (head, tail) = data.split_at(len);
        *data = tail;
        Ok(head)
    }
    fn int(data: &mut &[u8]) -> Result<i32> {
        let bytes = take(data, 4)?;
        Ok(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    let mut rows = Vec::new();
    while !data.is_empty() {
        let n = usize::try_from(int(&mut data)?)
            .map_err(|_| Error::Protocol("negative column count".into()))?;
        let kinds = (0..n).map(|_| int(&mut data)).collect::<Result<Vec<_>>>()?;
        let ends = (0..n).map(|_| int(&mut data)).collect::<Result<Vec<_>>>()?;
        let size = ends.last().map_or(0, |end| *end as usize + 1);
        let cells = take(&mut data, size)?;

        let mut start = 0usize;
        let mut row = Vec::with_capacity(n);
        for (kind, end) in kinds.into_iter().zip(ends) {
            let end = usize::try_from(end)
                .ok()
                .filter(|end| *end >= start && *end < cells.len())
                .ok_or_else(|| Error::Protocol("bad cell offset".into()))?;
            let text = std::str::from_utf8(&cells[start..end])
                .map_err(|err| Error::Protocol(err.to_string()))?;
            row.push((kind != VALUE_TYPE_UNBOUND).then(|| text.to_string()));
            start = end + 1;
        }
        rows.push(row);
    }
    Ok(Cursor { columns, rows })
}
