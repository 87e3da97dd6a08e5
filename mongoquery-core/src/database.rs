// mongoquery-core/src/database.rs
// Database handle: shares one connection between the queries it creates

use std::path::Path;
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::driver::Connector;
use crate::error::Result;
use crate::events::Hook;
use crate::options::Options;
use crate::query::Query;

/// Cheap to clone; every clone talks through the same endpoint pool.
#[derive(Debug, Clone)]
pub struct Database {
    connection: Arc<Connection>,
}

impl Database {
    /// Validate `config` and prepare the pool. No link is opened until the
    /// first query needs one.
    pub fn open(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Ok(Self::from_connection(Connection::new(config, connector)?))
    }

    /// Load settings from a TOML file (defaults when it is missing), apply
    /// `MONGOQUERY_*` environment overrides, then open.
    pub fn open_path<P: AsRef<Path>>(path: P, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::open(ConnectionConfig::load_from_path(path)?, connector)
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self {
            connection: Arc::new(connection),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Empty query.
    pub fn query(&self) -> Query {
        Query::new(self.connection.clone())
    }

    /// Query on a physical collection.
    pub fn table(&self, table: &str) -> Query {
        self.query().table(table)
    }

    /// Query on a logical name; prefix and naming rules apply.
    pub fn name(&self, name: &str) -> Query {
        self.query().name(name)
    }

    /// Register a lifecycle callback.
    pub fn listen<F>(&self, hook: Hook, callback: F)
    where
        F: Fn(&Options, Option<&serde_json::Value>) -> Option<serde_json::Value> + Send + Sync + 'static,
    {
        self.connection.events().listen(hook, callback);
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        self.connection.list_collections(&Options::new(), None)
    }

    /// Last statement sent, when `debug` is on.
    pub fn last_query(&self) -> Option<String> {
        self.connection.last_query()
    }

    /// Drop every memoized link; the next query reconnects.
    pub fn close(&self) {
        self.connection.close();
    }
}
