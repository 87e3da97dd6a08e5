// mongoquery-core/src/driver.rs
// Driver boundary: payload types handed to the driver and the traits it implements

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::TypeMap;
use crate::document::{DocumentId, ObjectId};
use crate::error::{MongoQueryError, Result};
use crate::find_options::FindQuery;

/// `database.collection`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    /// A table name that already carries a `db.` prefix keeps it.
    pub fn resolve(default_db: &str, table: &str) -> Self {
        match table.split_once('.') {
            Some((db, coll)) => Namespace {
                database: db.to_string(),
                collection: coll.to_string(),
            },
            None => Namespace {
                database: default_db.to_string(),
                collection: table.to_string(),
            },
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReadPreference {
    pub mode: ReadMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_sets: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_staleness_seconds: Option<i64>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteConcern {
    /// Number of acknowledging members or a tag such as `"majority"`.
    pub w: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wtimeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<bool>,
}

impl WriteConcern {
    pub fn majority() -> Self {
        Self {
            w: Value::from("majority"),
            wtimeout_ms: None,
            journal: None,
        }
    }
}

/// One operation inside a bulk write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    Insert {
        document: Value,
    },
    Update {
        filter: Value,
        update: Value,
        /// false: first match only
        multi: bool,
        upsert: bool,
    },
    Delete {
        filter: Value,
        /// 1 removes the first match, 0 removes every match
        limit: u32,
    },
}

/// Ordered batch of write operations submitted in one round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWrite {
    pub operations: Vec<WriteModel>,
}

impl BulkWrite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an insert. A document without `_id` gets a fresh ObjectId, which is
    /// returned; a caller supplied `_id` is returned as-is.
    pub fn insert(&mut self, mut document: Value) -> Option<DocumentId> {
        let id = match &mut document {
            Value::Object(map) => match map.get("_id") {
                Some(existing) => DocumentId::from_value(existing),
                None => {
                    let oid = ObjectId::new();
                    map.insert("_id".to_string(), oid.to_value());
                    Some(DocumentId::ObjectId(oid))
                }
            },
            _ => None,
        };
        self.operations.push(WriteModel::Insert { document });
        id
    }

    pub fn update(&mut self, filter: Value, update: Value, multi: bool, upsert: bool) {
        self.operations.push(WriteModel::Update {
            filter,
            update,
            multi,
            upsert,
        });
    }

    pub fn delete(&mut self, filter: Value, limit: u32) {
        self.operations.push(WriteModel::Delete { filter, limit });
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Administrative command document, keyed by the command name.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    document: Map<String, Value>,
}

impl Command {
    pub fn new(document: Value) -> Result<Self> {
        match document {
            Value::Object(map) if !map.is_empty() => Ok(Command { document: map }),
            other => Err(MongoQueryError::InvalidQuery(format!(
                "command must be a non-empty document, got {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &str {
        self.document.keys().next().map(String::as_str).unwrap_or("")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.document.get(key)
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.document.clone())
    }
}

/// Counters reported by the driver for a bulk write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResult {
    pub matched: u64,
    pub modified: u64,
    pub inserted: u64,
    pub deleted: u64,
    pub upserted: u64,
    pub inserted_ids: Vec<DocumentId>,
}

/// Result stream of a query or command.
pub trait Cursor: Send {
    /// Materialize every remaining row under `type_map`.
    fn to_rows(self: Box<Self>, type_map: &TypeMap) -> Result<Vec<Value>>;
}

/// Cursor over rows that are already in memory.
#[derive(Debug, Clone, Default)]
pub struct RowCursor {
    rows: Vec<Value>,
}

impl RowCursor {
    pub fn new(rows: Vec<Value>) -> Self {
        Self { rows }
    }
}

impl Cursor for RowCursor {
    fn to_rows(self: Box<Self>, _type_map: &TypeMap) -> Result<Vec<Value>> {
        Ok(self.rows)
    }
}

/// A live connection to one server endpoint.
pub trait Link: Send + Sync {
    fn execute_query(
        &self,
        namespace: &Namespace,
        query: &FindQuery,
        read_preference: Option<&ReadPreference>,
    ) -> Result<Box<dyn Cursor>>;

    fn execute_bulk_write(
        &self,
        namespace: &Namespace,
        bulk: &BulkWrite,
        write_concern: Option<&WriteConcern>,
    ) -> Result<WriteResult>;

    fn execute_command(
        &self,
        database: &str,
        command: &Command,
        read_preference: Option<&ReadPreference>,
    ) -> Result<Box<dyn Cursor>>;
}

/// Opens links. Authentication, connection and argument failures come back as
/// [`crate::DriverError`] and are not retried by the caller.
pub trait Connector: Send + Sync {
    fn connect(&self, dsn: &str, params: &Map<String, Value>) -> Result<Arc<dyn Link>>;
}
