// mongoquery-core/src/lib.rs
// Query option accumulation, payload compilation and endpoint topology

pub mod error;
pub mod document;
pub mod config;
pub mod options;
pub mod matcher;
pub mod aggregation;
pub mod find_options;
pub mod driver;
pub mod cache;
pub mod events;
pub mod lazy;
pub mod resolver;
pub mod topology;
pub mod memory;
pub mod builder;
pub mod connection;
pub mod query;
pub mod database;

// Public exports
pub use error::{DriverError, MongoQueryError, Result};
pub use document::{DocumentId, ObjectId};
pub use config::{ConnectionConfig, Deploy, PkType, TypeKind, TypeMap};
pub use options::{Logic, Options, Where};
pub use find_options::{FindOptions, FindQuery};
pub use driver::{BulkWrite, Command, Connector, Cursor, Link, Namespace, WriteResult};
pub use cache::{Cache, CacheDirective, MemoryCache};
pub use events::Hook;
pub use lazy::{Clock, LazyOutcome, ManualClock, SystemClock};
pub use resolver::{PrefixResolver, TableResolver};
pub use topology::{EndpointSlot, Role, Topology};
pub use memory::{MemoryConnector, MemoryStore};
pub use builder::Builder;
pub use connection::Connection;
pub use query::Query;
pub use database::Database;
