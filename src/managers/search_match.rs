use std::sync::{Arc, Mutex};

use crate::controllers::SearchController;
use crate::filterable::{BLANK_FILTER, Filterable, STOCK_ALL};
use crate::managers::base::{BaseManager, Manager};
use crate::query::QueryFlags;

pub const STOCK_TITLE: &str = "title";
pub const STOCK_AUTHOR: &str = "author";

const TERM_PLACEHOLDER: &str = "%s";

/// Which property a search term is matched against.
///
/// The filter is a template; `%s` is replaced by the current term.
#[derive(Debug)]
pub struct SearchMatch {
    id: String,
    name: String,
    template: String,
    term: Mutex<String>,
}

impl SearchMatch {
    pub fn new(id: impl Into<String>, name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            template: template.into(),
            term: Mutex::new(String::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_filter_term(&self, term: &str) {
        let mut current = self.term.lock().expect("search match mutex poisoned");
        if *current != term {
            *current = term.to_string();
        }
    }

    pub fn filter_term(&self) -> String {
        self.term.lock().expect("search match mutex poisoned").clone()
    }
}

impl Filterable for SearchMatch {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn filter(&self) -> String {
        self.template
            .replacen(TERM_PLACEHOLDER, &self.filter_term(), 1)
    }
}

#[derive(Debug)]
pub struct SearchMatchManager {
    base: BaseManager<SearchMatch>,
    search: Arc<SearchController>,
    /// Held while the shared filter terms are rewritten and read back.
    filtering: Mutex<()>,
}

impl SearchMatchManager {
    pub fn new(search: Arc<SearchController>) -> Self {
        let base = BaseManager::new("search-match", "Match");
        // Never used: `all` resolves to the union of the other matches.
        base.add_object(Arc::new(SearchMatch::new(STOCK_ALL, "All", "(false)")));
        base.add_object(Arc::new(SearchMatch::new(
            STOCK_TITLE,
            "Title",
            "fn:contains (\
             tracker:case-fold (tracker:coalesce (nie:title (?urn), nfo:fileName(?urn))), \
             \"%s\")",
        )));
        base.add_object(Arc::new(SearchMatch::new(
            STOCK_AUTHOR,
            "Author",
            "fn:contains (\
             tracker:case-fold (tracker:coalesce (nco:fullname (?creator), nco:fullname(?publisher))), \
             \"%s\")",
        )));
        base.set_active_object_by_id(STOCK_ALL);
        Self {
            base,
            search,
            filtering: Mutex::new(()),
        }
    }

    pub fn search_controller(&self) -> &Arc<SearchController> {
        &self.search
    }
}

impl Manager for SearchMatchManager {
    type Object = SearchMatch;

    fn base(&self) -> &BaseManager<SearchMatch> {
        &self.base
    }

    fn filter(&self, flags: QueryFlags) -> String {
        if !flags.contains(QueryFlags::SEARCH) {
            return BLANK_FILTER.to_string();
        }

        let terms = self.search.terms();
        if terms.is_empty() {
            return BLANK_FILTER.to_string();
        }

        let matches = self.base.get_objects();
        let _filtering = self.filtering.lock().expect("search match filter mutex poisoned");
        let filters: Vec<String> = terms
            .iter()
            .map(|term| {
                for search_match in &matches {
                    search_match.set_filter_term(term);
                }
                match self.base.active_object() {
                    Some(active) if active.id() != STOCK_ALL => active.filter(),
                    _ => self.base.get_all_filter(),
                }
            })
            .collect();

        format!("({})", filters.join(" && "))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::{STOCK_TITLE, SearchMatchManager};
    use crate::controllers::SearchController;
    use crate::managers::Manager;
    use crate::query::QueryFlags;

    #[test]
    fn each_term_gets_its_own_filter() {
        let search = Arc::new(SearchController::new());
        search.set_string("Beach  Dusk");
        let manager = SearchMatchManager::new(Arc::clone(&search));
        manager.base().set_active_object_by_id(STOCK_TITLE);

        let filter = manager.filter(QueryFlags::SEARCH);
        assert!(filter.contains("\"beach\")"));
        assert!(filter.contains("\"dusk\")"));
        assert_eq!(filter.matches(" && ").count(), 1);
        assert_eq!(manager.filter(QueryFlags::empty()), "(true)");
    }

    #[test]
    fn concurrent_filters_do_not_mix_terms() {
        let search = Arc::new(SearchController::new());
        search.set_string("aaaa bbbb");
        let manager = SearchMatchManager::new(Arc::clone(&search));
        manager.base().set_active_object_by_id(STOCK_TITLE);
        let expected = manager.filter(QueryFlags::SEARCH);

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..5000 {
                        assert_eq!(manager.filter(QueryFlags::SEARCH), expected);
                    }
                });
            }
        });
    }
}
