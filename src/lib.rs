pub mod config;
pub mod context;
pub mod controllers;
pub mod error;
pub mod events;
pub mod filterable;
pub mod logging;
pub mod query;
pub mod query_builder;
pub mod schedule;
pub mod bus {
    pub mod address;
    pub mod connection;
    pub mod server;
}
pub mod managers {
    pub mod base;
    pub mod collection;
    pub mod search_match;
    pub mod search_type;
    pub mod source;

    pub use base::{BaseManager, Manager};
    pub use collection::{Collection, CollectionManager};
    pub use search_match::{SearchMatch, SearchMatchManager};
    pub use search_type::{SearchType, SearchTypeManager};
    pub use source::{Account, Mount, Source, SourceKind, SourceManager};
}
pub mod online_miner {
    pub mod manager;
    pub mod peer;
    pub mod process;
    pub mod proxy;

    pub use manager::OnlineMinerManager;
    pub use process::OnlineMinerProcess;
}
pub mod tracker {
    pub mod bus;
    pub mod connection;
    pub mod endpoint;
    pub mod queue;

    pub use bus::TrackerBus;
    pub use connection::{BlankNodes, Cursor, SparqlConnection};
    pub use queue::{SparqlResponse, TrackerQueue};
}

pub use context::{AppContext, SearchContextState};
pub use error::{Error, Result};
