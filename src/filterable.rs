use std::fmt::Debug;

/// Filter fragment that matches everything.
pub const BLANK_FILTER: &str = "(true)";

/// Id of the "match everything" entry every stock manager carries.
pub const STOCK_ALL: &str = "all";

/// An entry of a manager that contributes to the SPARQL query.
pub trait Filterable: Debug + Send + Sync + 'static {
    /// Stable id, unique within its manager.
    fn id(&self) -> &str;

    /// Built-in entries survive reconciliation.
    fn is_builtin(&self) -> bool {
        false
    }

    /// Boolean expression placed inside the query's `FILTER (...)`.
    fn filter(&self) -> String {
        BLANK_FILTER.to_string()
    }

    /// Graph pattern placed inside the query's `WHERE { ... }`.
    fn where_clause(&self) -> String {
        String::new()
    }
}
