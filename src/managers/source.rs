use std::sync::Arc;

use serde::Deserialize;

use crate::filterable::{Filterable, STOCK_ALL};
use crate::managers::base::{BaseManager, Manager};
use crate::query::QueryFlags;
use crate::query_builder;

pub const STOCK_LOCAL: &str = "local";

const ACCOUNT_ID_PREFIX: &str = "gd:goa-account:";
const MOUNT_ID_PREFIX: &str = "gd:mount:";

/// An online account as reported by the accounts service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Account {
    pub id: String,
    pub provider_type: String,
    pub provider_name: String,
}

/// A mounted volume that may contain pictures.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Mount {
    pub root_uri: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    All,
    Local,
    Account {
        provider_type: String,
        provider_name: String,
    },
    Mount {
        root_uri: String,
    },
}

/// Where items come from: everything, the local folders, an online account
/// or a mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    id: String,
    name: String,
    builtin: bool,
    kind: SourceKind,
}

impl Source {
    pub fn all() -> Self {
        Self {
            id: STOCK_ALL.to_string(),
            name: "All".to_string(),
            builtin: true,
            kind: SourceKind::All,
        }
    }

    pub fn local() -> Self {
        Self {
            id: STOCK_LOCAL.to_string(),
            name: "Local".to_string(),
            builtin: true,
            kind: SourceKind::Local,
        }
    }

    pub fn from_account(account: &Account) -> Self {
        Self {
            id: account_source_id(&account.id),
            name: account.provider_name.clone(),
            builtin: false,
            kind: SourceKind::Account {
                provider_type: account.provider_type.clone(),
                provider_name: account.provider_name.clone(),
            },
        }
    }

    pub fn from_mount(mount: &Mount) -> Self {
        Self {
            id: mount_source_id(&mount.root_uri),
            name: mount.name.clone(),
            builtin: false,
            kind: SourceKind::Mount {
                root_uri: mount.root_uri.clone(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn provider_type(&self) -> Option<&str> {
        match &self.kind {
            SourceKind::Account { provider_type, .. } => Some(provider_type),
            _ => None,
        }
    }

    pub fn provider_name(&self) -> Option<&str> {
        match &self.kind {
            SourceKind::Account { provider_name, .. } => Some(provider_name),
            _ => None,
        }
    }
}

impl Filterable for Source {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_builtin(&self) -> bool {
        self.builtin
    }

    fn filter(&self) -> String {
        match &self.kind {
            // `all` is replaced by the manager's union filter before it is used.
            SourceKind::All | SourceKind::Local => query_builder::filter_local(),
            SourceKind::Account { .. } => {
                format!("(nie:dataSource (?urn) = \"{}\")", self.id)
            }
            SourceKind::Mount { root_uri } => {
                format!("(fn:starts-with (nie:url (?urn), \"{root_uri}\"))")
            }
        }
    }
}

pub fn account_source_id(account_id: &str) -> String {
    format!("{ACCOUNT_ID_PREFIX}{account_id}")
}

pub fn mount_source_id(root_uri: &str) -> String {
    format!("{MOUNT_ID_PREFIX}{root_uri}")
}

#[derive(Debug)]
pub struct SourceManager {
    base: BaseManager<Source>,
}

impl SourceManager {
    pub fn new() -> Self {
        let base = BaseManager::new("search-source", "Sources");
        base.add_object(Arc::new(Source::all()));
        base.add_object(Arc::new(Source::local()));
        base.set_active_object_by_id(STOCK_ALL);
        Self { base }
    }

    pub fn account_added(&self, account: &Account) -> bool {
        self.base.add_object(Arc::new(Source::from_account(account)))
    }

    pub fn account_removed(&self, account_id: &str) -> bool {
        self.base
            .remove_object_by_id(&account_source_id(account_id))
    }

    /// Replaces the account's source so that changed properties take effect.
    pub fn account_changed(&self, account: &Account) {
        self.account_removed(&account.id);
        self.account_added(account);
    }

    /// Reconciles the account sources against a fresh account listing.
    /// Mount sources are kept.
    pub fn refresh_accounts(&self, accounts: &[Account]) {
        let mut sources: Vec<Arc<Source>> = accounts
            .iter()
            .map(|account| Arc::new(Source::from_account(account)))
            .collect();
        sources.extend(
            self.base
                .get_objects()
                .into_iter()
                .filter(|source| matches!(source.kind, SourceKind::Mount { .. })),
        );
        self.base.process_new_objects(&sources);
    }

    pub fn mount_added(&self, mount: &Mount) -> bool {
        self.base.add_object(Arc::new(Source::from_mount(mount)))
    }

    pub fn mount_removed(&self, root_uri: &str) -> bool {
        self.base.remove_object_by_id(&mount_source_id(root_uri))
    }

    pub fn has_provider_type(&self, provider_type: &str) -> bool {
        !self.get_for_provider_type(provider_type).is_empty()
    }

    pub fn has_online_sources(&self) -> bool {
        self.base
            .get_objects()
            .iter()
            .any(|source| source.provider_type().is_some())
    }

    pub fn get_provider_name_for_provider_type(&self, provider_type: &str) -> Option<String> {
        self.get_for_provider_type(provider_type)
            .first()
            .and_then(|source| source.provider_name().map(str::to_string))
    }

    pub fn get_for_provider_type(&self, provider_type: &str) -> Vec<Arc<Source>> {
        self.base
            .get_objects()
            .into_iter()
            .filter(|source| source.provider_type() == Some(provider_type))
            .collect()
    }
}

impl Default for SourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager for SourceManager {
    type Object = Source;

    fn base(&self) -> &BaseManager<Source> {
        &self.base
    }

    fn filter(&self, flags: QueryFlags) -> String {
        let source = if flags.contains(QueryFlags::SEARCH) {
            self.base.active_object()
        } else {
            self.base.get_object_by_id(STOCK_ALL)
        };

        match source {
            Some(source) if source.id() == STOCK_ALL => self.base.get_all_filter(),
            Some(source) => source.filter(),
            None => self.base.get_all_filter(),
        }
    }
}
