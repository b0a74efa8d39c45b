use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Rows returned by a select query. Unbound cells are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Cursor {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First cell of the first row, as used by count queries.
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }
}

/// Blank node names generated by an update, per solution and per statement.
pub type BlankNodes = Vec<Vec<BTreeMap<String, String>>>;

/// Client side of a SPARQL store.
#[async_trait]
pub trait SparqlConnection: Send + Sync + 'static {
    async fn query(&self, sparql: &str) -> Result<Cursor>;

    async fn update(&self, sparql: &str) -> Result<()>;

    async fn update_blank(&self, sparql: &str) -> Result<BlankNodes>;
}
