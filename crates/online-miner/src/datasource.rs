//! Keeps one `nie:DataSource` per online account of a provider.

use std::collections::BTreeSet;

use async_trait::async_trait;
use photos_index::error::ERROR_NOT_SUPPORTED;
use photos_index::online_miner::peer::MinerBackend;
use photos_index::query_builder::escape_string;
use photos_index::tracker::SparqlConnection;
use photos_index::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Bumped whenever the layout of mined data changes; older datasources are
/// dropped and mined again.
pub const MINER_VERSION: u32 = 1;

const DATASOURCE_PREFIX: &str = "photos:goa-account:";
const GRAPH: &str = "tracker:Pictures";

pub fn datasource_urn(account_id: &str) -> String {
    format!("{DATASOURCE_PREFIX}{account_id}")
}

pub fn miner_identifier(provider_type: &str) -> String {
    format!("photos:{provider_type}:miner")
}

/// Parses the comma separated account list handed to the helper.
pub fn parse_accounts(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct DatasourceBackend {
    provider_type: String,
    accounts: BTreeSet<String>,
}

impl DatasourceBackend {
    pub fn new(provider_type: impl Into<String>, accounts: BTreeSet<String>) -> Self {
        Self {
            provider_type: provider_type.into(),
            accounts,
        }
    }

    fn existing_query(&self) -> String {
        format!(
            "SELECT ?datasource nie:version (?root) FROM {GRAPH} WHERE {{ \
             ?datasource a nie:DataSource ; nao:identifier \"{}\" . \
             ?root a nie:InformationElement ; nie:rootElementOf ?datasource . }}",
            escape_string(&miner_identifier(&self.provider_type))
        )
    }

    fn insert_query(&self, account_id: &str) -> String {
        let datasource = datasource_urn(account_id);
        format!(
            "INSERT OR REPLACE INTO {GRAPH} {{ \
             <{datasource}> a nie:DataSource ; nao:identifier \"{}\" . \
             <{datasource}:root-element> a nie:InformationElement ; \
             nie:rootElementOf <{datasource}> ; nie:version \"{MINER_VERSION}\" . }}",
            escape_string(&miner_identifier(&self.provider_type))
        )
    }
}

/// Drops everything mined into `datasource`.
fn delete_query(datasource: &str) -> String {
    format!(
        "WITH {GRAPH} DELETE {{ ?u a rdfs:Resource }} WHERE {{ ?u nie:dataSource <{datasource}> }}"
    )
}

fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl MinerBackend for DatasourceBackend {
    async fn refresh_db(&self, sparql: &dyn SparqlConnection, cancel: CancellationToken) -> Result<()> {
        let cursor = sparql.query(&self.existing_query()).await?;
        check(&cancel)?;

        let mut current = BTreeSet::new();
        for row in &cursor.rows {
            let Some(datasource) = row.first().cloned().flatten() else {
                continue;
            };
            let version = row.get(1).cloned().flatten();
            let account = datasource.strip_prefix(DATASOURCE_PREFIX).map(str::to_string);
            let fresh = version.as_deref() == Some(MINER_VERSION.to_string().as_str());

            match account {
                Some(account) if fresh && self.accounts.contains(&account) => {
                    current.insert(account);
                }
                _ => {
                    debug!(%datasource, ?version, "removing stale datasource");
                    sparql.update(&delete_query(&datasource)).await?;
                    check(&cancel)?;
                }
            }
        }

        for account in self.accounts.difference(&current) {
            info!(provider = %self.provider_type, %account, "creating datasource");
            sparql.update(&self.insert_query(account)).await?;
            check(&cancel)?;
        }
        Ok(())
    }

    async fn insert_shared_content(
        &self,
        _sparql: &dyn SparqlConnection,
        _account_id: &str,
        _shared_id: &str,
        _source_urn: &str,
        _cancel: CancellationToken,
    ) -> Result<()> {
        Err(Error::remote(
            ERROR_NOT_SUPPORTED,
            format!("{} does not support shared content", self.provider_type),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_ignore_blanks() {
        let accounts = parse_accounts(" a, ,b,,a ");
        assert_eq!(accounts.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn insert_targets_pictures_graph() {
        let backend = DatasourceBackend::new("google", BTreeSet::new());
        let query = backend.insert_query("acc");
        assert!(query.starts_with("INSERT OR REPLACE INTO tracker:Pictures"));
        assert!(query.contains("<photos:goa-account:acc> a nie:DataSource"));
        assert!(query.contains("nie:rootElementOf <photos:goa-account:acc>"));
        assert!(query.contains("nao:identifier \"photos:google:miner\""));
    }
}
