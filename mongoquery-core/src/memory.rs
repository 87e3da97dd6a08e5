// mongoquery-core/src/memory.rs
// In-process driver: collections held in memory, shared by every link the
// connector hands out.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::trace;

use crate::aggregation::Pipeline;
use crate::document::{DocumentId, ObjectId};
use crate::driver::{
    BulkWrite, Command, Connector, Cursor, Link, Namespace, ReadPreference, RowCursor,
    WriteConcern, WriteModel, WriteResult,
};
use crate::error::{DriverError, MongoQueryError, Result};
use crate::find_options::{apply_limit_skip, apply_projection, apply_sort, FindQuery};
use crate::matcher::{get_path, Filter};

/// Documents per `database.collection`
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<String, Vec<Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one collection.
    pub fn documents(&self, namespace: &Namespace) -> Vec<Value> {
        self.collections
            .get(&namespace.to_string())
            .map(|docs| docs.clone())
            .unwrap_or_default()
    }

    pub fn collection_names(&self, database: &str) -> Vec<String> {
        let prefix = format!("{}.", database);
        let mut names: Vec<String> = self
            .collections
            .iter()
            .filter_map(|entry| entry.key().strip_prefix(&prefix).map(str::to_string))
            .collect();
        names.sort();
        names
    }

    fn matching(&self, namespace: &Namespace, filter: &Value) -> Result<Vec<Value>> {
        let filter = Filter::from_json(filter)?;
        Ok(self
            .documents(namespace)
            .into_iter()
            .filter(|doc| filter.matches(doc))
            .collect())
    }
}

/// Connector for [`MemoryStore`]. Records every connect call and can be told
/// to refuse a DSN with a given driver error.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    refused: DashMap<String, DriverError>,
    connects: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    pub fn refuse(&self, dsn: &str, error: DriverError) {
        self.refused.insert(dsn.to_string(), error);
    }

    pub fn allow(&self, dsn: &str) {
        self.refused.remove(dsn);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn dsns(&self) -> Vec<String> {
        self.connects.lock().iter().map(|(dsn, _)| dsn.clone()).collect()
    }

    pub fn last_params(&self) -> Map<String, Value> {
        self.connects
            .lock()
            .last()
            .map(|(_, params)| params.clone())
            .unwrap_or_default()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, dsn: &str, params: &Map<String, Value>) -> Result<Arc<dyn Link>> {
        if let Some(err) = self.refused.get(dsn) {
            return Err(err.clone().into());
        }
        if !dsn.starts_with("mongodb://") && !dsn.starts_with("mongodb+srv://") {
            return Err(DriverError::InvalidArgument(format!("invalid connection string: {}", dsn)).into());
        }
        self.connects.lock().push((dsn.to_string(), params.clone()));
        Ok(Arc::new(MemoryLink {
            store: self.store.clone(),
            dsn: dsn.to_string(),
        }))
    }
}

#[derive(Debug)]
pub struct MemoryLink {
    store: Arc<MemoryStore>,
    dsn: String,
}

impl MemoryLink {
    pub fn dsn(&self) -> &str {
        &self.dsn
    }
}

fn runtime(msg: impl Into<String>) -> MongoQueryError {
    DriverError::Runtime(msg.into()).into()
}

/// Set a dot-notation path, creating intermediate objects.
fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = match current.as_object_mut() {
            Some(map) => map,
            None => return,
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map.entry(part.to_string()).or_insert_with(|| Value::Object(Map::new()));
    }
}

fn remove_path(doc: &mut Value, path: &str) {
    match path.rsplit_once('.') {
        Some((parent, last)) => {
            let parent = parent.split('.').try_fold(&mut *doc, |cur, part| cur.get_mut(part));
            if let Some(Value::Object(map)) = parent {
                map.remove(last);
            }
        }
        None => {
            if let Value::Object(map) = doc {
                map.remove(path);
            }
        }
    }
}

fn each_values(operand: &Value) -> Vec<Value> {
    match operand.get("$each") {
        Some(Value::Array(items)) => items.clone(),
        _ => vec![operand.clone()],
    }
}

fn array_at<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Vec<Value>> {
    if get_path(doc, path).is_none() {
        set_path(doc, path, Value::Array(Vec::new()));
    }
    path.split('.')
        .try_fold(doc, |cur, part| cur.get_mut(part))
        .and_then(Value::as_array_mut)
}

/// Apply an update document; returns whether anything changed.
fn apply_update(doc: &mut Value, update: &Value) -> Result<bool> {
    let ops = update
        .as_object()
        .ok_or_else(|| runtime("update must be a document"))?;
    let before = doc.clone();

    if !ops.keys().all(|k| k.starts_with('$')) {
        // replacement keeps the identifier
        let id = doc.get("_id").cloned();
        *doc = update.clone();
        if let (Some(id), Value::Object(map)) = (id, &mut *doc) {
            map.insert("_id".to_string(), id);
        }
        return Ok(*doc != before);
    }

    for (op, fields) in ops {
        let fields = fields
            .as_object()
            .ok_or_else(|| runtime(format!("{} requires a document", op)))?;
        for (field, operand) in fields {
            match op.as_str() {
                "$set" => set_path(doc, field, operand.clone()),
                "$unset" => remove_path(doc, field),
                "$inc" => {
                    let next = match (get_path(doc, field), operand) {
                        (None, step) => step.clone(),
                        (Some(cur), step) => match (cur.as_i64(), step.as_i64()) {
                            (Some(a), Some(b)) => Value::from(a + b),
                            _ => match (cur.as_f64(), step.as_f64()) {
                                (Some(a), Some(b)) => Value::from(a + b),
                                _ => return Err(runtime(format!("cannot $inc non-numeric field {}", field))),
                            },
                        },
                    };
                    set_path(doc, field, next);
                }
                "$push" | "$pushAll" | "$addToSet" => {
                    let values = if op == "$pushAll" {
                        operand.as_array().cloned().unwrap_or_default()
                    } else {
                        each_values(operand)
                    };
                    let items = array_at(doc, field)
                        .ok_or_else(|| runtime(format!("{} target {} is not an array", op, field)))?;
                    for v in values {
                        if op != "$addToSet" || !items.contains(&v) {
                            items.push(v);
                        }
                    }
                }
                "$pop" => {
                    if let Some(items) = array_at(doc, field) {
                        if operand.as_i64() == Some(-1) {
                            if !items.is_empty() {
                                items.remove(0);
                            }
                        } else {
                            items.pop();
                        }
                    }
                }
                "$pull" | "$pullAll" => {
                    let values = if op == "$pullAll" {
                        operand.as_array().cloned().unwrap_or_default()
                    } else {
                        vec![operand.clone()]
                    };
                    if let Some(items) = array_at(doc, field) {
                        items.retain(|v| !values.contains(v));
                    }
                }
                other => return Err(runtime(format!("Unsupported update operator: {}", other))),
            }
        }
    }
    Ok(*doc != before)
}

/// Seed document for an upsert: equality fields of the filter.
fn upsert_seed(filter: &Value) -> Value {
    let mut seed = Value::Object(Map::new());
    fn collect(filter: &Value, seed: &mut Value) {
        if let Value::Object(map) = filter {
            for (key, value) in map {
                match key.as_str() {
                    "$and" => {
                        for branch in value.as_array().into_iter().flatten() {
                            collect(branch, seed);
                        }
                    }
                    k if k.starts_with('$') => {}
                    field => match value {
                        Value::Object(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.contains_key("$oid") => {
                            if let Some(v) = ops.get("$eq") {
                                set_path(seed, field, v.clone());
                            }
                        }
                        v => set_path(seed, field, v.clone()),
                    },
                }
            }
        }
    }
    collect(filter, &mut seed);
    seed
}

fn ensure_id(doc: &mut Value) -> Option<DocumentId> {
    let map = doc.as_object_mut()?;
    if !map.contains_key("_id") {
        map.insert("_id".to_string(), ObjectId::new().to_value());
    }
    map.get("_id").and_then(DocumentId::from_value)
}

impl Link for MemoryLink {
    fn execute_query(
        &self,
        namespace: &Namespace,
        query: &FindQuery,
        _read_preference: Option<&ReadPreference>,
    ) -> Result<Box<dyn Cursor>> {
        trace!(%namespace, filter = %query.filter, "memory find");
        let mut docs = self.store.matching(namespace, &query.filter)?;
        if let Some(sort) = &query.options.sort {
            apply_sort(&mut docs, sort);
        }
        let docs = apply_limit_skip(docs, query.options.limit, query.options.skip);
        let rows = match &query.options.projection {
            Some(p) if !p.is_empty() => docs
                .iter()
                .map(|d| apply_projection(d, p))
                .collect::<Result<Vec<_>>>()?,
            _ => docs,
        };
        Ok(Box::new(RowCursor::new(rows)))
    }

    fn execute_bulk_write(
        &self,
        namespace: &Namespace,
        bulk: &BulkWrite,
        _write_concern: Option<&WriteConcern>,
    ) -> Result<WriteResult> {
        let mut result = WriteResult::default();
        let mut docs = self
            .store
            .collections
            .entry(namespace.to_string())
            .or_default();

        for op in &bulk.operations {
            match op {
                WriteModel::Insert { document } => {
                    let mut document = document.clone();
                    let id = ensure_id(&mut document)
                        .ok_or_else(|| DriverError::BulkWrite("document must be an object".into()))?;
                    if docs.iter().any(|d| d.get("_id") == document.get("_id")) {
                        return Err(DriverError::BulkWrite(format!(
                            "E11000 duplicate key error collection: {} _id: {}",
                            namespace,
                            id.to_plain_value()
                        ))
                        .into());
                    }
                    docs.push(document);
                    result.inserted += 1;
                    result.inserted_ids.push(id);
                }
                WriteModel::Update { filter, update, multi, upsert } => {
                    let matcher = Filter::from_json(filter)?;
                    let mut matched = 0;
                    for doc in docs.iter_mut().filter(|d| matcher.matches(d)) {
                        matched += 1;
                        if apply_update(doc, update)? {
                            result.modified += 1;
                        }
                        if !multi {
                            break;
                        }
                    }
                    result.matched += matched;
                    if matched == 0 && *upsert {
                        let mut doc = upsert_seed(filter);
                        apply_update(&mut doc, update)?;
                        ensure_id(&mut doc);
                        docs.push(doc);
                        result.upserted += 1;
                    }
                }
                WriteModel::Delete { filter, limit } => {
                    let matcher = Filter::from_json(filter)?;
                    let before = docs.len();
                    if *limit == 1 {
                        if let Some(pos) = docs.iter().position(|d| matcher.matches(d)) {
                            docs.remove(pos);
                        }
                    } else {
                        docs.retain(|d| !matcher.matches(d));
                    }
                    result.deleted += (before - docs.len()) as u64;
                }
            }
        }
        Ok(result)
    }

    fn execute_command(
        &self,
        database: &str,
        command: &Command,
        _read_preference: Option<&ReadPreference>,
    ) -> Result<Box<dyn Cursor>> {
        let collection = |key: &str| -> Result<Namespace> {
            command
                .get(key)
                .and_then(Value::as_str)
                .map(|c| Namespace::resolve(database, c))
                .ok_or_else(|| DriverError::InvalidArgument(format!("{} requires a collection name", key)).into())
        };
        let query = command.get("query").cloned().unwrap_or(Value::Null);

        let rows = match command.name() {
            "count" => {
                let docs = self.store.matching(&collection("count")?, &query)?;
                let skip = command.get("skip").and_then(Value::as_u64);
                let limit = command.get("limit").and_then(Value::as_u64);
                let n = apply_limit_skip(docs, limit, skip).len();
                vec![json!({"n": n, "ok": 1})]
            }
            "distinct" => {
                let key = command
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DriverError::InvalidArgument("distinct requires a key".into()))?;
                let mut seen = HashSet::new();
                let mut values = Vec::new();
                for doc in self.store.matching(&collection("distinct")?, &query)? {
                    let found = match get_path(&doc, key) {
                        Some(Value::Array(items)) => items.clone(),
                        Some(v) => vec![v.clone()],
                        None => Vec::new(),
                    };
                    for v in found {
                        if seen.insert(v.to_string()) {
                            values.push(v);
                        }
                    }
                }
                vec![json!({"values": values, "ok": 1})]
            }
            "aggregate" => {
                let pipeline = Pipeline::from_json(command.get("pipeline").unwrap_or(&Value::Null))?;
                let docs = self.store.documents(&collection("aggregate")?);
                pipeline.execute(docs)?
            }
            "listCollections" => self
                .store
                .collection_names(database)
                .into_iter()
                .map(|name| json!({"name": name, "type": "collection"}))
                .collect(),
            "drop" => {
                let ns = collection("drop")?;
                self.store.collections.remove(&ns.to_string());
                vec![json!({"ns": ns.to_string(), "ok": 1})]
            }
            "ping" => vec![json!({"ok": 1})],
            other => return Err(runtime(format!("no such command: '{}'", other))),
        };
        Ok(Box::new(RowCursor::new(rows)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TypeMap;
    use crate::find_options::FindOptions;

    fn link() -> (Arc<dyn Link>, Namespace) {
        let connector = MemoryConnector::new();
        let link = connector.connect("mongodb://localhost:27017", &Map::new()).unwrap();
        (link, Namespace::resolve("app", "users"))
    }

    fn rows(cursor: Box<dyn Cursor>) -> Vec<Value> {
        cursor.to_rows(&TypeMap::default()).unwrap()
    }

    fn seed(link: &Arc<dyn Link>, ns: &Namespace, docs: Vec<Value>) {
        let mut bulk = BulkWrite::new();
        for doc in docs {
            bulk.insert(doc);
        }
        link.execute_bulk_write(ns, &bulk, None).unwrap();
    }

    #[test]
    fn test_connect_rejects_bad_dsn_and_refused_hosts() {
        let connector = MemoryConnector::new();
        let err = connector.connect("localhost", &Map::new()).err().unwrap();
        assert!(matches!(err, MongoQueryError::Driver(DriverError::InvalidArgument(_))));

        connector.refuse("mongodb://down:1", DriverError::Connection("timed out".into()));
        let err = connector.connect("mongodb://down:1", &Map::new()).err().unwrap();
        assert!(matches!(err, MongoQueryError::Driver(DriverError::Connection(_))));
        assert_eq!(connector.connect_count(), 0);

        connector.allow("mongodb://down:1");
        assert!(connector.connect("mongodb://down:1", &Map::new()).is_ok());
    }

    #[test]
    fn test_insert_and_find() {
        let (link, ns) = link();
        seed(&link, &ns, vec![json!({"name": "a", "age": 3}), json!({"name": "b", "age": 1})]);

        let query = FindQuery::new(
            json!({"age": {"$gte": 1}}),
            FindOptions::new().with_sort(vec![("age".into(), 1)]).with_limit(1),
        );
        let found = rows(link.execute_query(&ns, &query, None).unwrap());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["name"], "b");
        assert!(ObjectId::from_value(&found[0]["_id"]).is_some());
    }

    #[test]
    fn test_duplicate_id_is_bulk_write_error() {
        let (link, ns) = link();
        seed(&link, &ns, vec![json!({"_id": 1})]);
        let mut bulk = BulkWrite::new();
        bulk.insert(json!({"_id": 1}));
        let err = link.execute_bulk_write(&ns, &bulk, None).err().unwrap();
        assert!(matches!(err, MongoQueryError::Driver(DriverError::BulkWrite(_))));
    }

    #[test]
    fn test_update_operators() {
        let (link, ns) = link();
        seed(&link, &ns, vec![json!({"_id": 1, "n": 1, "tags": ["a"], "gone": true})]);

        let mut bulk = BulkWrite::new();
        bulk.update(
            json!({"_id": 1}),
            json!({
                "$inc": {"n": 4},
                "$set": {"profile.city": "Győr"},
                "$unset": {"gone": ""},
                "$push": {"tags": "b"},
                "$addToSet": {"labels": {"$each": ["x", "x", "y"]}}
            }),
            false,
            false,
        );
        let result = link.execute_bulk_write(&ns, &bulk, None).unwrap();
        assert_eq!((result.matched, result.modified), (1, 1));

        let doc = &link.store_snapshot(&ns)[0];
        assert_eq!(doc["n"], 5);
        assert_eq!(doc["profile"]["city"], "Győr");
        assert!(doc.get("gone").is_none());
        assert_eq!(doc["tags"], json!(["a", "b"]));
        assert_eq!(doc["labels"], json!(["x", "y"]));
    }

    #[test]
    fn test_update_multi_and_upsert() {
        let (link, ns) = link();
        seed(&link, &ns, vec![json!({"k": 1}), json!({"k": 1})]);

        let mut bulk = BulkWrite::new();
        bulk.update(json!({"k": 1}), json!({"$set": {"seen": true}}), false, false);
        let single = link.execute_bulk_write(&ns, &bulk, None).unwrap();
        assert_eq!(single.modified, 1);

        let mut bulk = BulkWrite::new();
        bulk.update(json!({"k": 1}), json!({"$set": {"seen": true}}), true, false);
        let multi = link.execute_bulk_write(&ns, &bulk, None).unwrap();
        assert_eq!((multi.matched, multi.modified), (2, 1));

        let mut bulk = BulkWrite::new();
        bulk.update(json!({"k": 9}), json!({"$set": {"new": true}}), true, true);
        let upsert = link.execute_bulk_write(&ns, &bulk, None).unwrap();
        assert_eq!(upsert.upserted, 1);
        let created: Vec<Value> = link
            .store_snapshot(&ns)
            .into_iter()
            .filter(|d| d["k"] == 9)
            .collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["new"], true);
    }

    #[test]
    fn test_delete_single_and_multi() {
        let (link, ns) = link();
        seed(&link, &ns, vec![json!({"k": 1}), json!({"k": 1}), json!({"k": 2})]);

        let mut bulk = BulkWrite::new();
        bulk.delete(json!({"k": 1}), 1);
        assert_eq!(link.execute_bulk_write(&ns, &bulk, None).unwrap().deleted, 1);

        let mut bulk = BulkWrite::new();
        bulk.delete(json!({}), 0);
        assert_eq!(link.execute_bulk_write(&ns, &bulk, None).unwrap().deleted, 2);
    }

    #[test]
    fn test_commands() {
        let (link, ns) = link();
        seed(
            &link,
            &ns,
            vec![json!({"c": "x", "v": 2}), json!({"c": "y", "v": 5}), json!({"c": "x", "v": 1})],
        );

        let count = Command::new(json!({"count": "users", "query": {"c": "x"}})).unwrap();
        assert_eq!(rows(link.execute_command("app", &count, None).unwrap())[0]["n"], 2);

        let distinct = Command::new(json!({"distinct": "users", "key": "c"})).unwrap();
        assert_eq!(
            rows(link.execute_command("app", &distinct, None).unwrap())[0]["values"],
            json!(["x", "y"])
        );

        let aggregate = Command::new(json!({
            "aggregate": "users",
            "pipeline": [
                {"$match": {}},
                {"$group": {"_id": null, "aggregate": {"$sum": "$v"}}},
                {"$project": {"_id": 0, "aggregate": 1}}
            ],
            "cursor": {}
        }))
        .unwrap();
        assert_eq!(
            rows(link.execute_command("app", &aggregate, None).unwrap()),
            vec![json!({"aggregate": 8})]
        );

        let list = Command::new(json!({"listCollections": 1})).unwrap();
        assert_eq!(
            rows(link.execute_command("app", &list, None).unwrap())[0]["name"],
            "users"
        );

        let bogus = Command::new(json!({"frobnicate": 1})).unwrap();
        let err = link.execute_command("app", &bogus, None).err().unwrap();
        assert!(matches!(err, MongoQueryError::Driver(DriverError::Runtime(_))));
    }

    trait Snapshot {
        fn store_snapshot(&self, ns: &Namespace) -> Vec<Value>;
    }

    impl Snapshot for Arc<dyn Link> {
        fn store_snapshot(&self, ns: &Namespace) -> Vec<Value> {
            let query = FindQuery::new(json!({}), FindOptions::new());
            rows(self.execute_query(ns, &query, None).unwrap())
        }
    }
}
