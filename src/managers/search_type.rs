use std::sync::Arc;

use crate::filterable::{BLANK_FILTER, Filterable, STOCK_ALL};
use crate::managers::base::{BaseManager, Manager};
use crate::query::{COLLECTIONS_IDENTIFIER, QueryFlags};

pub const STOCK_COLLECTIONS: &str = "collections";
pub const STOCK_FAVORITES: &str = "favorites";
pub const STOCK_PHOTOS: &str = "photos";

/// Kind of item a query looks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchType {
    id: String,
    name: String,
    where_clause: String,
    filter: String,
}

impl SearchType {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        where_clause: impl Into<String>,
        filter: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            where_clause: where_clause.into(),
            filter: filter.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Filterable for SearchType {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn filter(&self) -> String {
        self.filter.clone()
    }

    fn where_clause(&self) -> String {
        self.where_clause.clone()
    }
}

#[derive(Debug)]
pub struct SearchTypeManager {
    base: BaseManager<SearchType>,
}

impl SearchTypeManager {
    pub fn new() -> Self {
        let item_filter = "fn:contains (?type, 'nmm#Photo')";
        let col_filter = format!(
            "(fn:contains (?type, 'nfo#DataContainer') \
             && ?count > 0 \
             && (fn:starts-with (nao:identifier (?urn), '{COLLECTIONS_IDENTIFIER}') \
             || (?urn = nfo:image-category-screenshot)))"
        );
        let mixed_filter = format!("({col_filter} || {item_filter})");

        let base = BaseManager::new("search-type", "Type");
        base.add_object(Arc::new(SearchType::new(
            STOCK_ALL,
            "All",
            "?urn a rdfs:Resource. \
             OPTIONAL {?item a nie:InformationElement; nie:isPartOf ?urn}",
            mixed_filter.clone(),
        )));
        base.add_object(Arc::new(SearchType::new(
            STOCK_COLLECTIONS,
            "Albums",
            "?urn a nfo:DataContainer. \
             ?item a nie:InformationElement; nie:isPartOf ?urn.",
            col_filter,
        )));
        base.add_object(Arc::new(SearchType::new(
            STOCK_FAVORITES,
            "Favorites",
            "?urn a rdfs:Resource; nao:hasTag nao:predefined-tag-favorite. \
             OPTIONAL {?item a nie:InformationElement; nie:isPartOf ?urn}",
            mixed_filter,
        )));
        base.add_object(Arc::new(SearchType::new(
            STOCK_PHOTOS,
            "Photos",
            "?urn a nmm:Photo",
            BLANK_FILTER,
        )));
        base.set_active_object_by_id(STOCK_PHOTOS);
        Self { base }
    }

    /// The search type implied by `flags`; only `SEARCH` honours the
    /// user's choice.
    pub fn for_flags(&self, flags: QueryFlags) -> Option<Arc<SearchType>> {
        if flags.contains(QueryFlags::COLLECTIONS) {
            self.base.get_object_by_id(STOCK_COLLECTIONS)
        } else if flags.contains(QueryFlags::FAVORITES) {
            self.base.get_object_by_id(STOCK_FAVORITES)
        } else if flags.contains(QueryFlags::OVERVIEW) {
            self.base.get_object_by_id(STOCK_PHOTOS)
        } else if flags.contains(QueryFlags::SEARCH) {
            self.base.active_object()
        } else {
            self.base.get_object_by_id(STOCK_ALL)
        }
    }
}

impl Default for SearchTypeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager for SearchTypeManager {
    type Object = SearchType;

    fn base(&self) -> &BaseManager<SearchType> {
        &self.base
    }

    fn filter(&self, flags: QueryFlags) -> String {
        self.for_flags(flags)
            .map(|search_type| search_type.filter())
            .unwrap_or_else(|| BLANK_FILTER.to_string())
    }

    fn where_clause(&self, flags: QueryFlags) -> String {
        self.for_flags(flags)
            .map(|search_type| search_type.where_clause())
            .unwrap_or_default()
    }
}
