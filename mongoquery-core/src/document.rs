// mongoquery-core/src/document.rs
// Driver-native identifiers and the id rewriting applied to result rows

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{MongoQueryError, Result};

/// Extended-JSON key under which an ObjectId travels inside a document.
pub const OID_KEY: &str = "$oid";

/// 12-byte ObjectId: 4-byte big-endian seconds timestamp + 8 random bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generate a fresh id stamped with the current time.
    pub fn new() -> Self {
        let mut bytes = [0u8; 12];
        let secs = Utc::now().timestamp() as u32;
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..].copy_from_slice(&Uuid::new_v4().as_bytes()[..8]);
        ObjectId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    /// Parse the 24 hex character form.
    pub fn parse_str(s: &str) -> Result<Self> {
        if s.len() != 24 {
            return Err(MongoQueryError::InvalidQuery(format!("invalid ObjectId: {}", s)));
        }
        let raw = hex::decode(s)
            .map_err(|_| MongoQueryError::InvalidQuery(format!("invalid ObjectId: {}", s)))?;
        let mut bytes = [0u8; 12];
        bytes.copy_from_slice(&raw);
        Ok(ObjectId(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Seconds since the epoch recorded in the id.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// `{"$oid": "<hex>"}`
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(OID_KEY.to_string(), Value::String(self.to_hex()));
        Value::Object(map)
    }

    /// Recognise the extended-JSON form produced by [`ObjectId::to_value`].
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) if map.len() == 1 => map
                .get(OID_KEY)
                .and_then(Value::as_str)
                .and_then(|s| ObjectId::parse_str(s).ok()),
            _ => None,
        }
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = MongoQueryError;

    fn from_str(s: &str) -> Result<Self> {
        ObjectId::parse_str(s)
    }
}

/// Identifier of a stored document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentId {
    ObjectId(ObjectId),
    Int(i64),
    String(String),
}

impl DocumentId {
    pub fn from_value(value: &Value) -> Option<Self> {
        if let Some(oid) = ObjectId::from_value(value) {
            return Some(DocumentId::ObjectId(oid));
        }
        match value {
            Value::Number(n) => n.as_i64().map(DocumentId::Int),
            Value::String(s) => Some(DocumentId::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DocumentId::ObjectId(oid) => oid.to_value(),
            DocumentId::Int(n) => Value::from(*n),
            DocumentId::String(s) => Value::String(s.clone()),
        }
    }

    /// Plain representation handed back to callers (ObjectIds become hex strings).
    pub fn to_plain_value(&self) -> Value {
        match self {
            DocumentId::ObjectId(oid) => Value::String(oid.to_hex()),
            other => other.to_value(),
        }
    }
}

impl From<ObjectId> for DocumentId {
    fn from(oid: ObjectId) -> Self {
        DocumentId::ObjectId(oid)
    }
}

/// Move a native `_id` ObjectId into a plain string `id` field.
/// Rows whose `_id` is not an ObjectId are left alone.
pub fn convert_object_id(row: &mut Value) {
    if let Value::Object(map) = row {
        let oid = match map.get("_id").and_then(ObjectId::from_value) {
            Some(oid) => oid,
            None => return,
        };
        map.remove("_id");
        map.insert("id".to_string(), Value::String(oid.to_hex()));
    }
}

/// Replace every ObjectId in a value by its hex string. Used when rendering
/// statements for the log.
pub fn flatten_object_ids(value: &Value) -> Value {
    if let Some(oid) = ObjectId::from_value(value) {
        return Value::String(oid.to_hex());
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), flatten_object_ids(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(flatten_object_ids).collect()),
        other => other.clone(),
    }
}
