// mongoquery-core/src/builder.rs
// Compiles a finalized option record into driver payloads

use indexmap::IndexMap;
use serde_json::{json, Map, Value};

use crate::config::{split_list, ConnectionConfig, PkType};
use crate::document::{flatten_object_ids, DocumentId, ObjectId};
use crate::driver::{BulkWrite, Command, Namespace, WriteModel};
use crate::error::{MongoQueryError, Result};
use crate::find_options::{FindOptions, FindQuery};
use crate::options::{Clause, Condition, DataValue, Logic, Options, Where, UPDATE_OPERATORS};

fn invalid(msg: impl Into<String>) -> MongoQueryError {
    MongoQueryError::InvalidQuery(msg.into())
}

/// Compiled form of one `(operator, operand)` pair.
enum Expr {
    /// Bare value: `{field: value}`
    Equals(Value),
    /// `{field: {"$op": operand, ...}}`
    Operators(Map<String, Value>),
    /// Replaces the whole item, field ignored (`$where`).
    Document(Value),
}

fn operators(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Expr {
    Expr::Operators(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

/// Comma separated strings become lists, arrays pass through.
fn value_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::String(s) => split_list(s).into_iter().map(Value::from).collect(),
        other => vec![other.clone()],
    }
}

fn range_bounds(op: &str, value: &Value) -> Result<(Value, Value)> {
    match value_list(value).as_slice() {
        [low, high] => Ok((low.clone(), high.clone())),
        _ => Err(invalid(format!("{} requires two bounds, got {}", op, value))),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false")),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Turns option records into find queries, bulk writes and commands.
#[derive(Debug, Clone)]
pub struct Builder {
    pk_convert_id: bool,
    pk_type: PkType,
}

impl Builder {
    pub fn new(pk_convert_id: bool, pk_type: PkType) -> Self {
        Self {
            pk_convert_id,
            pk_type,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.pk_convert_id, config.pk_type)
    }

    /// Logical field name to stored field name.
    pub fn parse_key(&self, key: &str) -> String {
        if self.pk_convert_id && key == "id" {
            "_id".to_string()
        } else {
            key.trim().to_string()
        }
    }

    /// Identifier strings on `_id` become ObjectIds when they parse as one.
    pub fn parse_value(&self, key: &str, value: Value) -> Value {
        if key != "_id" || self.pk_type != PkType::ObjectId {
            return value;
        }
        match value {
            Value::String(s) => match ObjectId::parse_str(&s) {
                Ok(oid) => oid.to_value(),
                Err(_) => Value::String(s),
            },
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.parse_value(key, item))
                    .collect(),
            ),
            other => other,
        }
    }

    fn operator_expr(&self, key: &str, op: &str, value: &Value) -> Result<Expr> {
        let lowered = op.trim().to_ascii_lowercase();
        let single = |v: &Value| self.parse_value(key, v.clone());
        let list = |v: &Value| {
            Value::Array(
                value_list(v)
                    .into_iter()
                    .map(|item| self.parse_value(key, item))
                    .collect(),
            )
        };
        let expr = match lowered.as_str() {
            "=" | "eq" => Expr::Equals(single(value)),
            "<>" | "neq" | "ne" => operators([("$ne", single(value))]),
            ">" | "gt" => operators([("$gt", single(value))]),
            ">=" | "egt" | "gte" => operators([("$gte", single(value))]),
            "<" | "lt" => operators([("$lt", single(value))]),
            "<=" | "elt" | "lte" => operators([("$lte", single(value))]),
            "mod" => operators([("$mod", Value::Array(value_list(value)))]),
            "in" => operators([("$in", list(value))]),
            "not in" | "nin" => operators([("$nin", list(value))]),
            "all" => operators([("$all", list(value))]),
            "null" => Expr::Equals(Value::Null),
            "not null" | "notnull" => operators([("$ne", Value::Null)]),
            "exists" => operators([("$exists", Value::Bool(truthy(value)))]),
            "type" => operators([("$type", value.clone())]),
            "size" => {
                let n = match value {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                }
                .ok_or_else(|| invalid(format!("size requires a non-negative integer, got {}", value)))?;
                operators([("$size", Value::from(n))])
            }
            "between" => {
                let (low, high) = range_bounds(op, value)?;
                operators([("$gte", single(&low)), ("$lte", single(&high))])
            }
            "not between" => {
                let (low, high) = range_bounds(op, value)?;
                operators([("$not", json!({"$gte": single(&low), "$lte": single(&high)}))])
            }
            "like" | "regex" => operators([("$regex", value.clone()), ("$options", Value::from("i"))]),
            "near" => operators([("$near", value.clone())]),
            "exp" => Expr::Document(json!({ "$where": value })),
            raw if raw.starts_with('$') => {
                let mut map = Map::new();
                map.insert(op.trim().to_string(), single(value));
                Expr::Operators(map)
            }
            _ => return Err(invalid(format!("unknown filter operator: {}", op))),
        };
        Ok(expr)
    }

    /// One `field -> condition` entry as a filter document.
    fn where_item(&self, field: &str, condition: &Condition) -> Result<Value> {
        let key = self.parse_key(field);
        let value = match condition {
            Condition::Compare { op, value } => match self.operator_expr(&key, op, value)? {
                Expr::Equals(v) => v,
                Expr::Operators(map) => Value::Object(map),
                Expr::Document(doc) => return Ok(doc),
            },
            Condition::Many(pairs) => {
                let mut merged = Map::new();
                for (op, operand) in pairs {
                    match self.operator_expr(&key, op, operand)? {
                        Expr::Equals(v) => {
                            merged.insert("$eq".to_string(), v);
                        }
                        Expr::Operators(map) => merged.extend(map),
                        Expr::Document(_) => {
                            return Err(invalid(format!("{} cannot be combined on {}", op, field)))
                        }
                    }
                }
                Value::Object(merged)
            }
            Condition::Deferred { .. } => {
                return Err(invalid(format!("deferred condition bound to field {}", field)))
            }
        };
        let mut item = Map::new();
        item.insert(key, value);
        Ok(Value::Object(item))
    }

    fn push(filter: &mut Map<String, Value>, key: &str, item: Value) {
        if let Value::Array(items) = filter
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            items.push(item);
        }
    }

    fn compile_clause(
        &self,
        filter: &mut Map<String, Value>,
        logic: Logic,
        clause: &Clause,
        options: &Options,
    ) -> Result<()> {
        match (&clause.field, &clause.condition) {
            (_, Condition::Deferred { op, predicate }) => {
                let nested = predicate(options);
                let compiled = self.compile_where(&nested, options)?;
                if compiled.as_object().map_or(true, Map::is_empty) {
                    return Ok(());
                }
                let target = match op.as_deref() {
                    None => logic.key(),
                    Some(op) if op.eq_ignore_ascii_case("not") => "$nor",
                    Some(op) => Logic::parse(op)?.key(),
                };
                Self::push(filter, target, compiled);
            }
            (None, Condition::Compare { op, value }) if op == "exp" => {
                Self::push(filter, logic.key(), json!({ "$where": value }));
            }
            (None, other) => {
                return Err(invalid(format!("condition without a field: {:?}", other)));
            }
            (Some(field), condition) if field.contains('|') => {
                for name in field.split('|') {
                    Self::push(filter, "$or", self.where_item(name, condition)?);
                }
            }
            (Some(field), condition) if field.contains('&') => {
                for name in field.split('&') {
                    Self::push(filter, "$and", self.where_item(name, condition)?);
                }
            }
            (Some(field), condition) => {
                Self::push(filter, logic.key(), self.where_item(field, condition)?);
            }
        }
        Ok(())
    }

    fn compile_where(&self, filter_tree: &Where, options: &Options) -> Result<Value> {
        let mut filter = Map::new();
        for (logic, group) in filter_tree.groups() {
            for clause in group.iter() {
                self.compile_clause(&mut filter, logic, clause, options)?;
            }
        }
        Ok(Value::Object(filter))
    }

    /// Filter document for `options`. Deferred predicates see the record itself.
    pub fn parse_where(&self, options: &Options) -> Result<Value> {
        self.compile_where(&options.filter, options)
    }

    /// Insert document from `data`.
    pub fn parse_data(&self, data: &IndexMap<String, DataValue>) -> Map<String, Value> {
        data.iter()
            .map(|(field, value)| {
                let key = self.parse_key(field);
                let value = self.parse_value(&key, value.to_value());
                (key, value)
            })
            .collect()
    }

    /// Update body from `data`: operator entries go under their operator,
    /// `exp` entries are copied as given, plain values land in `$set`.
    pub fn parse_set(&self, data: &IndexMap<String, DataValue>) -> Result<Value> {
        let mut body = Map::new();
        for (field, value) in data {
            match value {
                DataValue::Plain(v) if field.starts_with('$') => {
                    body.insert(field.clone(), v.clone());
                }
                DataValue::Plain(v) => {
                    let key = self.parse_key(field);
                    let v = self.parse_value(&key, v.clone());
                    Self::group_entry(&mut body, "$set", key, v);
                }
                DataValue::Op(op, operand) if op == "exp" => {
                    body.insert(self.parse_key(field), operand.clone());
                }
                DataValue::Op(op, operand) if UPDATE_OPERATORS.contains(&op.as_str()) => {
                    Self::group_entry(&mut body, op, self.parse_key(field), operand.clone());
                }
                DataValue::Op(op, _) => {
                    return Err(invalid(format!("unknown update operator: {}", op)));
                }
            }
        }
        Ok(Value::Object(body))
    }

    fn group_entry(body: &mut Map<String, Value>, op: &str, key: String, value: Value) {
        if let Value::Object(group) = body
            .entry(op.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
        {
            group.insert(key, value);
        }
    }

    /// Find payload. `one` caps the effective limit at 1 without touching the record.
    pub fn select(&self, options: &Options, one: bool) -> Result<FindQuery> {
        let projection: Map<String, Value> = options
            .projection_fields()
            .into_iter()
            .map(|(field, v)| (self.parse_key(&field), v))
            .collect();
        let sort: Vec<(String, i32)> = options
            .sort
            .iter()
            .map(|(field, dir)| (self.parse_key(field), *dir))
            .collect();

        let find = FindOptions {
            projection: Some(projection),
            sort: Some(sort),
            limit: Some(if one { 1 } else { options.limit_value() }),
            skip: options.skip,
            batch_size: options.batch_size,
            collation: options.collation.clone(),
            hint: options.hint.clone(),
            modifiers: options.modifiers.clone(),
            tailable: options.tailable.unwrap_or(false),
            no_cursor_timeout: options.no_cursor_timeout.unwrap_or(false),
            await_data: options.await_data.unwrap_or(false),
            exhaust: options.exhaust.unwrap_or(false),
            partial: options.partial.unwrap_or(false),
            oplog_replay: options.oplog_replay.unwrap_or(false),
            slave_ok: options.slave_ok.unwrap_or(false),
        };
        Ok(FindQuery::new(self.parse_where(options)?, find))
    }

    /// Single insert; returns the identifier the document will carry.
    pub fn insert(&self, options: &Options) -> Result<(BulkWrite, Option<DocumentId>)> {
        let mut bulk = BulkWrite::new();
        let id = bulk.insert(Value::Object(self.parse_data(&options.data)));
        Ok((bulk, id))
    }

    /// Each row merged over the record's `data`.
    pub fn insert_all(
        &self,
        options: &Options,
        rows: &[Map<String, Value>],
    ) -> Result<(BulkWrite, Vec<DocumentId>)> {
        let mut bulk = BulkWrite::new();
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let mut data = options.data.clone();
            for (field, value) in row {
                data.insert(field.clone(), DataValue::from_value(value.clone()));
            }
            if let Some(id) = bulk.insert(Value::Object(self.parse_data(&data))) {
                ids.push(id);
            }
        }
        Ok((bulk, ids))
    }

    /// A limit of 1 updates the first match only.
    pub fn update(&self, options: &Options) -> Result<BulkWrite> {
        let mut bulk = BulkWrite::new();
        bulk.update(
            self.parse_where(options)?,
            self.parse_set(&options.data)?,
            options.limit_value() != 1,
            options.upsert.unwrap_or(false),
        );
        Ok(bulk)
    }

    pub fn delete(&self, options: &Options) -> Result<BulkWrite> {
        let mut bulk = BulkWrite::new();
        let limit = if options.limit_value() == 1 { 1 } else { 0 };
        bulk.delete(self.parse_where(options)?, limit);
        Ok(bulk)
    }

    pub fn count(&self, options: &Options) -> Result<Command> {
        let mut cmd = Map::new();
        cmd.insert("count".into(), Value::from(options.table_name()));
        cmd.insert("query".into(), self.parse_where(options)?);
        if let Some(hint) = &options.hint {
            cmd.insert("hint".into(), hint.clone());
        }
        if let Some(skip) = options.skip.filter(|n| *n > 0) {
            cmd.insert("skip".into(), Value::from(skip));
        }
        if options.limit_value() > 0 {
            cmd.insert("limit".into(), Value::from(options.limit_value()));
        }
        if let Some(ms) = options.max_time_ms {
            cmd.insert("maxTimeMS".into(), Value::from(ms));
        }
        Command::new(Value::Object(cmd))
    }

    fn aggregate_command(&self, options: &Options, group: Value, reshape: Option<Value>) -> Result<Command> {
        let mut pipeline = Vec::new();
        let filter = self.parse_where(options)?;
        if filter.as_object().map_or(false, |m| !m.is_empty()) {
            pipeline.push(json!({ "$match": filter }));
        }
        pipeline.push(json!({ "$group": group }));
        if let Some(project) = reshape {
            pipeline.push(json!({ "$project": project }));
        }
        let mut cmd = Map::new();
        cmd.insert("aggregate".into(), Value::from(options.table_name()));
        cmd.insert("allowDiskUse".into(), Value::Bool(true));
        cmd.insert("pipeline".into(), Value::Array(pipeline));
        cmd.insert("cursor".into(), Value::Object(Map::new()));
        if let Some(collation) = &options.collation {
            cmd.insert("collation".into(), collation.clone());
        }
        Command::new(Value::Object(cmd))
    }

    /// `{$group: {_id: null, aggregate: {$op: "$field"}}}` then a reshape that
    /// leaves only `aggregate`.
    pub fn aggregate(&self, options: &Options, op: &str, field: &str) -> Result<Command> {
        let op = op.trim().trim_start_matches('$').to_ascii_lowercase();
        if op.is_empty() {
            return Err(invalid("aggregate operator is empty"));
        }
        let mut accumulator = Map::new();
        accumulator.insert(format!("${}", op), Value::from(format!("${}", self.parse_key(field))));
        self.aggregate_command(
            options,
            json!({ "_id": null, "aggregate": accumulator }),
            Some(json!({ "_id": 0, "aggregate": 1 })),
        )
    }

    /// Grouped aggregation: every `(op, field)` is reported as `field_op`.
    pub fn multi_aggregate(
        &self,
        options: &Options,
        aggregates: &[(String, String)],
        group_by: &[String],
    ) -> Result<Command> {
        let mut id = Map::new();
        for field in group_by {
            let key = self.parse_key(field);
            id.insert(key.clone(), Value::from(format!("${}", key)));
        }
        let mut group = Map::new();
        group.insert("_id".into(), Value::Object(id));
        for (op, field) in aggregates {
            let op = op.trim().trim_start_matches('$').to_ascii_lowercase();
            let mut accumulator = Map::new();
            accumulator.insert(format!("${}", op), Value::from(format!("${}", self.parse_key(field))));
            group.insert(format!("{}_{}", field, op), Value::Object(accumulator));
        }
        self.aggregate_command(options, Value::Object(group), None)
    }

    pub fn distinct(&self, options: &Options, field: &str) -> Result<Command> {
        let mut cmd = Map::new();
        cmd.insert("distinct".into(), Value::from(options.table_name()));
        cmd.insert("key".into(), Value::from(self.parse_key(field)));
        cmd.insert("query".into(), self.parse_where(options)?);
        if let Some(ms) = options.max_time_ms {
            cmd.insert("maxTimeMS".into(), Value::from(ms));
        }
        Command::new(Value::Object(cmd))
    }

    pub fn list_collections(&self) -> Result<Command> {
        Command::new(json!({ "listCollections": 1 }))
    }
}

/// Statement log line for a bulk write.
pub fn render_bulk(namespace: &Namespace, bulk: &BulkWrite) -> String {
    let inserts: Vec<Value> = bulk
        .operations
        .iter()
        .filter_map(|op| match op {
            WriteModel::Insert { document } => Some(flatten_object_ids(document)),
            _ => None,
        })
        .collect();

    let mut parts = Vec::new();
    match inserts.len() {
        0 => {}
        1 => parts.push(format!("{}.insert({});", namespace, inserts[0])),
        _ => parts.push(format!("{}.insert({});", namespace, Value::Array(inserts))),
    }
    for op in &bulk.operations {
        match op {
            WriteModel::Insert { .. } => {}
            WriteModel::Update { filter, update, .. } => parts.push(format!(
                "{}.update({},{});",
                namespace,
                flatten_object_ids(filter),
                flatten_object_ids(update)
            )),
            WriteModel::Delete { filter, .. } => {
                parts.push(format!("{}.remove({});", namespace, flatten_object_ids(filter)))
            }
        }
    }
    parts.join(" ")
}

/// Statement log line for a command.
pub fn render_command(database: &str, command: &Command) -> String {
    let body = flatten_object_ids(&command.to_value());
    match command.name() {
        "aggregate" => format!("{}.runCommand({});", database, body),
        name => format!("{}.{}({});", database, name, body),
    }
}
