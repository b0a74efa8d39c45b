use std::sync::Arc;

use bitflags::bitflags;

use crate::filterable::Filterable;
use crate::managers::Source;

/// Page size of the paged overview queries.
pub const DEFAULT_STEP: u32 = 50;

/// `nao:identifier` prefix of user-created albums.
pub const COLLECTIONS_IDENTIFIER: &str = "photos:collection:";

bitflags! {
    /// Selects the implied search type and whether filtering applies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueryFlags: u32 {
        const COLLECTIONS = 1 << 0;
        const FAVORITES = 1 << 1;
        const OVERVIEW = 1 << 2;
        const SEARCH = 1 << 3;
        const UNFILTERED = 1 << 4;
    }
}

impl QueryFlags {
    pub const NONE: Self = Self::empty();
}

/// A SPARQL string plus the context it was built in.
#[derive(Debug, Clone)]
pub struct Query {
    sparql: String,
    source: Option<Arc<Source>>,
    tag: Option<String>,
}

impl Query {
    pub fn new(sparql: impl Into<String>, source: Option<Arc<Source>>) -> Self {
        Self {
            sparql: sparql.into(),
            source,
            tag: None,
        }
    }

    /// Attaches a short label shown next to the query in debug logs.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn sparql(&self) -> &str {
        &self.sparql
    }

    pub fn source(&self) -> Option<&Arc<Source>> {
        self.source.as_ref()
    }

    pub fn source_id(&self) -> Option<&str> {
        self.source.as_deref().map(Filterable::id)
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}
