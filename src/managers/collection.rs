use crate::filterable::Filterable;
use crate::managers::base::{BaseManager, Manager};

/// An album. Its id is the collection's urn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    urn: String,
    name: String,
}

impl Collection {
    pub fn new(urn: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            urn: urn.into(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Filterable for Collection {
    fn id(&self) -> &str {
        &self.urn
    }

    fn where_clause(&self) -> String {
        format!("{{ ?urn nie:isPartOf <{}> }}", self.urn)
    }
}

/// Tracks the collection currently opened, if any.
#[derive(Debug)]
pub struct CollectionManager {
    base: BaseManager<Collection>,
}

impl CollectionManager {
    pub fn new() -> Self {
        Self {
            base: BaseManager::new("collections", "Albums"),
        }
    }
}

impl Default for CollectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager for CollectionManager {
    type Object = Collection;

    fn base(&self) -> &BaseManager<Collection> {
        &self.base
    }
}
