//! SPARQL text for the item views and for the jobs that modify items.
//!
//! The item queries are assembled from the managers in a
//! [`SearchContextState`]: the search type contributes the graph pattern,
//! the collection manager narrows to an album, and source, search match and
//! search type are AND-ed into one `FILTER`.

use std::path::Path;
use std::sync::LazyLock;

use chrono::{SecondsFormat, Utc};
use directories::UserDirs;
use regex::Regex;
use url::Url;

use crate::context::SearchContextState;
use crate::controllers::OffsetController;
use crate::managers::Manager;
use crate::query::{Query, QueryFlags};

const COLUMNS: [&str; 12] = [
    "?urn",
    "nie:url (?urn)",
    "nfo:fileName (?urn)",
    "nie:mimeType (?urn)",
    "nie:title (?urn)",
    "tracker:coalesce (nco:fullname (?creator), nco:fullname (?publisher), '')",
    "tracker:coalesce (nfo:fileLastModified (?urn), nie:contentLastModified (?urn)) AS ?mtime",
    "nao:identifier (?urn)",
    "rdf:type (?urn)",
    "nie:dataSource (?urn)",
    "( EXISTS { ?urn nao:hasTag nao:predefined-tag-favorite } )",
    "( EXISTS { ?urn nco:contributor ?contributor FILTER ( ?contributor != ?creator ) } )",
];

const OPTIONAL: &str =
    "OPTIONAL { ?urn nco:creator ?creator . } OPTIONAL { ?urn nco:publisher ?publisher . }";

static URN_VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\?urn\b").expect("valid urn regex"));

fn filter(state: &SearchContextState, flags: QueryFlags) -> String {
    format!(
        "FILTER ({} && {} && {})",
        state.sources.filter(flags),
        state.search_matches.filter(flags),
        state.search_types.filter(flags)
    )
}

fn where_clause(state: &SearchContextState, flags: QueryFlags) -> String {
    let mut pattern = state.search_types.where_clause(flags);

    // The collection filters read ?type and ?count.
    if pattern.contains("?item") {
        pattern = format!(
            "{{ SELECT ?urn rdf:type (?urn) AS ?type COUNT (?item) AS ?count \
             WHERE {{ {pattern} }} GROUP BY ?urn }}"
        );
    }

    let mut sparql = format!("WHERE {{ {pattern} {OPTIONAL} ");
    if !flags.contains(QueryFlags::UNFILTERED) {
        let collection = state.collections.where_clause(flags);
        if !collection.is_empty() {
            sparql.push_str(&collection);
            sparql.push(' ');
        }
        sparql.push_str(&filter(state, flags));
        sparql.push(' ');
    }
    sparql.push('}');
    sparql
}

fn item_query(state: &SearchContextState, columns: &str, flags: QueryFlags, tail: &str) -> Query {
    let sparql = format!(
        "SELECT DISTINCT {columns} {}{tail}",
        where_clause(state, flags)
    );
    Query::new(sparql, state.sources.base().active_object())
}

/// Paged item listing ordered by modification time.
pub fn global_query(
    state: &SearchContextState,
    flags: QueryFlags,
    offsets: &OffsetController,
) -> Query {
    let tail = format!(
        " ORDER BY DESC(?mtime) LIMIT {} OFFSET {}",
        offsets.step(),
        offsets.offset()
    );
    item_query(state, &COLUMNS.join(" "), flags, &tail)
}

/// The columns of a single item, identified by `resource`.
pub fn single_query(state: &SearchContextState, flags: QueryFlags, resource: &str) -> Query {
    let replacement = format!("<{resource}>");
    let columns: Vec<String> = std::iter::once(format!("({replacement} AS ?urn)"))
        .chain(
            COLUMNS[1..]
                .iter()
                .map(|column| URN_VARIABLE.replace_all(column, replacement.as_str()).into_owned()),
        )
        .collect();
    let where_clause = URN_VARIABLE
        .replace_all(&where_clause(state, flags), replacement.as_str())
        .into_owned();

    let sparql = format!("SELECT DISTINCT {} {where_clause}", columns.join(" "));
    Query::new(sparql, state.sources.base().active_object())
}

/// Number of items matching `flags`.
pub fn count_query(state: &SearchContextState, flags: QueryFlags) -> Query {
    item_query(state, "COUNT(?urn)", flags, "")
}

pub fn create_collection_query(name: &str, identifier: &str) -> Query {
    let sparql = format!(
        "INSERT {{ _:res a nfo:DataContainer ; a nie:DataObject ; \
         nie:contentLastModified \"{}\" ; \
         nie:title \"{}\" ; \
         nao:identifier \"{}\" }}",
        now_iso8601(),
        escape_string(name),
        escape_string(identifier)
    );
    Query::new(sparql, None).with_tag("create-collection")
}

/// Adds `item_urn` to, or removes it from, `collection_urn`.
pub fn set_collection_query(item_urn: &str, collection_urn: &str, setting: bool) -> Query {
    let verb = if setting { "INSERT" } else { "DELETE" };
    let sparql = format!("{verb} DATA {{ <{item_urn}> nie:isPartOf <{collection_urn}> }}");
    Query::new(sparql, None).with_tag("set-collection")
}

pub fn delete_resource_query(urn: &str) -> Query {
    let sparql = format!("DELETE {{ <{urn}> a rdfs:Resource }}");
    Query::new(sparql, None).with_tag("delete-resource")
}

/// Collections that contain `resource`.
pub fn fetch_collections_query(resource: &str) -> Query {
    let sparql = format!(
        "SELECT ?urn WHERE {{ ?urn a nfo:DataContainer . <{resource}> nie:isPartOf ?urn }}"
    );
    Query::new(sparql, None).with_tag("fetch-collections")
}

pub fn update_mtime_query(resource: &str) -> Query {
    let sparql = format!(
        "INSERT OR REPLACE {{ <{resource}> nie:contentLastModified \"{}\" }}",
        now_iso8601()
    );
    Query::new(sparql, None).with_tag("update-mtime")
}

pub fn set_favorite_query(resource: &str, favorite: bool) -> Query {
    let verb = if favorite { "INSERT" } else { "DELETE" };
    let sparql = format!("{verb} {{ <{resource}> nao:hasTag nao:predefined-tag-favorite }}");
    Query::new(sparql, None).with_tag("set-favorite")
}

/// Items below the user's desktop, download or pictures folder.
pub fn filter_local() -> String {
    let dirs = UserDirs::new();
    let dirs = dirs.as_ref();
    filter_local_for([
        dirs.and_then(UserDirs::desktop_dir),
        dirs.and_then(UserDirs::download_dir),
        dirs.and_then(UserDirs::picture_dir),
    ])
}

/// Missing folders contribute an empty prefix.
pub fn filter_local_for(dirs: [Option<&Path>; 3]) -> String {
    let clauses: Vec<String> = dirs
        .iter()
        .map(|dir| {
            let uri = dir
                .and_then(|dir| Url::from_file_path(dir).ok())
                .map(String::from)
                .unwrap_or_default();
            format!("(fn:starts-with (nie:url (?urn), \"{uri}\"))")
        })
        .collect();
    format!("({})", clauses.join(" || "))
}

/// Escapes `value` for use inside a quoted SPARQL string literal.
pub fn escape_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\t' => escaped.push_str("\\t"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\u{8}' => escaped.push_str("\\b"),
            '\u{c}' => escaped.push_str("\\f"),
            '"' => escaped.push_str("\\\""),
            '\'' => escaped.push_str("\\'"),
            '\\' => escaped.push_str("\\\\"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{escape_string, filter_local_for};

    #[test]
    fn escapes_quotes_and_backslashes() {
        assert_eq!(escape_string(r#"a"b'c\d"#), r#"a\"b\'c\\d"#);
        assert_eq!(escape_string("tab\there"), "tab\\there");
    }

    #[test]
    fn local_filter_uses_file_uris() {
        let filter = filter_local_for([
            Some(Path::new("/home/ada/Desktop")),
            None,
            Some(Path::new("/home/ada/Pictures")),
        ]);
        assert_eq!(
            filter,
            "((fn:starts-with (nie:url (?urn), \"file:///home/ada/Desktop\")) \
             || (fn:starts-with (nie:url (?urn), \"\")) \
             || (fn:starts-with (nie:url (?urn), \"file:///home/ada/Pictures\")))"
        );
    }
}
