use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use zbus::fdo;
use zbus::zvariant::{self, OwnedValue};

use crate::query::Query;
use crate::tracker::bus::{read_statement, write_cursor};
use crate::tracker::connection::BlankNodes;
use crate::tracker::queue::TrackerQueue;

pub use crate::tracker::bus::ENDPOINT_PATH;

const ENDPOINT_TAG: &str = "sparql-endpoint";

/// Tracker3 endpoint exported on a helper's private connection. Every
/// statement goes through the shared queue.
///
/// Statements still queued when `cancel` fires fail as cancelled.
#[derive(Debug)]
pub struct Endpoint {
    queue: Arc<TrackerQueue>,
    cancel: CancellationToken,
}

impl Endpoint {
    pub fn new(queue: Arc<TrackerQueue>, cancel: CancellationToken) -> Self {
        Self { queue, cancel }
    }

    fn tagged(&self, sparql: String) -> Query {
        Query::new(sparql, None).with_tag(ENDPOINT_TAG)
    }
}

#[zbus::interface(name = "org.freedesktop.Tracker3.Endpoint")]
impl Endpoint {
    async fn query(
        &self,
        query: String,
        output_stream: zvariant::OwnedFd,
        arguments: HashMap<String, OwnedValue>,
    ) -> fdo::Result<Vec<String>> {
        if !arguments.is_empty() {
            return Err(fdo::Error::NotSupported(
                "query arguments are not supported".into(),
            ));
        }
        let cursor = self
            .queue
            .select_async(self.tagged(query), Some(self.cancel.child_token()))
            .await?;

        let columns = cursor.columns.clone();
        let output = OwnedFd::from(output_stream);
        tokio::spawn(async move {
            if let Err(err) = write_cursor(output, &cursor).await {
                debug!(error = %err, "reader went away before the cursor was written");
            }
        });
        Ok(columns)
    }

    async fn update(&self, input_stream: zvariant::OwnedFd) -> fdo::Result<()> {
        let sparql = read_statement(OwnedFd::from(input_stream)).await?;
        self.queue
            .update_async(self.tagged(sparql), Some(self.cancel.child_token()))
            .await?;
        Ok(())
    }

    async fn update_blank(&self, input_stream: zvariant::OwnedFd) -> fdo::Result<BlankNodes> {
        let sparql = read_statement(OwnedFd::from(input_stream)).await?;
        let nodes = self
            .queue
            .update_blank_async(self.tagged(sparql), Some(self.cancel.child_token()))
            .await?;
        Ok(nodes)
    }
}
