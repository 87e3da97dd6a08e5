// mongoquery-core/src/options.rs
// Option record: the accumulated description of one pending operation

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::cache::CacheDirective;
use crate::config::{split_list, TypeMap};
use crate::driver::{ReadPreference, WriteConcern};
use crate::error::{MongoQueryError, Result};

/// Rows per page when neither the page directive nor the limit says otherwise.
pub const DEFAULT_PER_PAGE: u64 = 20;

/// Boolean combinator a condition is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Logic {
    And,
    Or,
    Xor,
}

impl Logic {
    /// Operator name in the compiled filter.
    pub fn key(self) -> &'static str {
        match self {
            Logic::And => "$and",
            Logic::Or => "$or",
            Logic::Xor => "$xor",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim_start_matches('$').to_ascii_lowercase().as_str() {
            "and" => Ok(Logic::And),
            "or" => Ok(Logic::Or),
            "xor" => Ok(Logic::Xor),
            other => Err(MongoQueryError::InvalidQuery(format!(
                "unknown logical operator: {}",
                other
            ))),
        }
    }
}

/// Deferred filter: receives the finished record and returns the conditions
/// to compile in its place.
pub type Predicate = Arc<dyn Fn(&Options) -> Where + Send + Sync>;

#[derive(Clone)]
pub enum Condition {
    /// `(operator, operand)`
    Compare { op: String, value: Value },
    /// Several operator pairs on one field, all of which must hold.
    Many(Vec<(String, Value)>),
    /// Resolved when the record is compiled.
    Deferred { op: Option<String>, predicate: Predicate },
}

impl Condition {
    pub fn eq(value: impl Into<Value>) -> Self {
        Condition::compare("=", value)
    }

    pub fn compare(op: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Compare {
            op: op.into(),
            value: value.into(),
        }
    }

    /// Interpret a loose value: `["op", operand]` pairs, lists of pairs,
    /// anything else is an equality test.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(items) => Condition::from_structured(items),
            other => Condition::eq(other),
        }
    }

    fn from_structured(items: Vec<Value>) -> Self {
        if let [Value::String(op), value] = items.as_slice() {
            return Condition::compare(op.clone(), value.clone());
        }
        let pairs: Option<Vec<(String, Value)>> = items
            .iter()
            .map(|item| match item {
                Value::Array(pair) => match pair.as_slice() {
                    [Value::String(op), value] => Some((op.clone(), value.clone())),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        match pairs {
            Some(pairs) if !pairs.is_empty() => Condition::Many(pairs),
            _ => Condition::eq(Value::Array(items)),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare { op, value } => write!(f, "({}, {})", op, value),
            Condition::Many(pairs) => f.debug_list().entries(pairs).finish(),
            Condition::Deferred { op, .. } => write!(f, "Deferred({:?})", op),
        }
    }
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Condition::Compare { op: a, value: va },
                Condition::Compare { op: b, value: vb },
            ) => a == b && va == vb,
            (Condition::Many(a), Condition::Many(b)) => a == b,
            (
                Condition::Deferred { op: a, predicate: pa },
                Condition::Deferred { op: b, predicate: pb },
            ) => a == b && Arc::ptr_eq(pa, pb),
            _ => false,
        }
    }
}

/// One entry of a logical group. Positional entries (raw expressions,
/// deferred predicates) have no field.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub field: Option<String>,
    pub condition: Condition,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereGroup {
    clauses: Vec<Clause>,
}

impl WhereGroup {
    /// Keyed entries overwrite in place, new keys and positional entries append.
    pub fn set(&mut self, field: Option<String>, condition: Condition) {
        if let Some(name) = &field {
            if let Some(existing) = self
                .clauses
                .iter_mut()
                .find(|c| c.field.as_deref() == Some(name.as_str()))
            {
                existing.condition = condition;
                return;
            }
        }
        self.clauses.push(Clause { field, condition });
    }

    pub fn get(&self, field: &str) -> Option<&Condition> {
        self.clauses
            .iter()
            .find(|c| c.field.as_deref() == Some(field))
            .map(|c| &c.condition)
    }

    pub fn remove(&mut self, field: &str) -> Option<Condition> {
        let pos = self
            .clauses
            .iter()
            .position(|c| c.field.as_deref() == Some(field))?;
        Some(self.clauses.remove(pos).condition)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Clause> {
        self.clauses.iter()
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

/// Left-hand side of a filter call.
#[derive(Clone)]
pub enum FilterField {
    Name(String),
    /// Already structured `field -> condition` batch.
    Batch(Vec<(String, Condition)>),
    Deferred(Predicate),
}

impl FilterField {
    pub fn deferred<F>(predicate: F) -> Self
    where
        F: Fn(&Options) -> Where + Send + Sync + 'static,
    {
        FilterField::Deferred(Arc::new(predicate))
    }
}

impl From<&str> for FilterField {
    fn from(s: &str) -> Self {
        FilterField::Name(s.to_string())
    }
}

impl From<String> for FilterField {
    fn from(s: String) -> Self {
        FilterField::Name(s)
    }
}

impl From<Map<String, Value>> for FilterField {
    fn from(map: Map<String, Value>) -> Self {
        FilterField::Batch(
            map.into_iter()
                .map(|(k, v)| (k, Condition::from_value(v)))
                .collect(),
        )
    }
}

fn is_null_keyword(op: &str) -> bool {
    matches!(
        op.to_ascii_lowercase().as_str(),
        "null" | "notnull" | "not null"
    )
}

fn op_text(op: Value) -> String {
    match op {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Filter tree: logical groups in first-use order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Where {
    groups: IndexMap<Logic, WhereGroup>,
}

impl Where {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consuming form of [`Where::add`], handy inside deferred predicates.
    pub fn filter(
        mut self,
        logic: Logic,
        field: impl Into<FilterField>,
        op: Option<Value>,
        operand: Option<Value>,
    ) -> Self {
        self.add(logic, field.into(), op, operand);
        self
    }

    pub fn and(self, field: &str, op: &str, value: impl Into<Value>) -> Self {
        self.filter(Logic::And, field, Some(Value::from(op)), Some(value.into()))
    }

    pub fn or(self, field: &str, op: &str, value: impl Into<Value>) -> Self {
        self.filter(Logic::Or, field, Some(Value::from(op)), Some(value.into()))
    }

    /// Normalize one filter call and merge it into `logic`'s group.
    pub fn add(
        &mut self,
        logic: Logic,
        field: FilterField,
        op: Option<Value>,
        operand: Option<Value>,
    ) {
        let entries: Vec<(Option<String>, Condition)> = match field {
            FilterField::Deferred(predicate) => {
                let op = op.and_then(|v| v.as_str().map(str::to_string));
                vec![(None, Condition::Deferred { op, predicate })]
            }
            FilterField::Batch(items) => items.into_iter().map(|(k, c)| (Some(k), c)).collect(),
            FilterField::Name(name) => match (op, operand) {
                (None, None) if name.trim().is_empty() => Vec::new(),
                (None, None) => vec![(None, Condition::compare("exp", name))],
                (Some(Value::Array(items)), _) => {
                    vec![(Some(name), Condition::from_structured(items))]
                }
                (Some(Value::String(op)), _) if is_null_keyword(&op) => {
                    vec![(Some(name), Condition::compare(op, ""))]
                }
                (Some(value), None) | (None, Some(value)) => {
                    vec![(Some(name), Condition::eq(value))]
                }
                (Some(op), Some(value)) => {
                    vec![(Some(name), Condition::compare(op_text(op), value))]
                }
            },
        };
        if entries.is_empty() {
            return;
        }
        let group = self.groups.entry(logic).or_default();
        for (field, condition) in entries {
            group.set(field, condition);
        }
    }

    pub fn remove_field(&mut self, field: &str, logic: Logic) {
        if let Some(group) = self.groups.get_mut(&logic) {
            group.remove(field);
        }
    }

    pub fn group(&self, logic: Logic) -> Option<&WhereGroup> {
        self.groups.get(&logic)
    }

    pub fn replace_group(&mut self, logic: Logic, group: WhereGroup) {
        self.groups.insert(logic, group);
    }

    pub fn groups(&self) -> impl Iterator<Item = (Logic, &WhereGroup)> {
        self.groups.iter().map(|(logic, group)| (*logic, group))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.values().all(WhereGroup::is_empty)
    }
}

/// Update operators a data entry may carry.
pub const UPDATE_OPERATORS: &[&str] = &[
    "$inc", "$set", "$unset", "$push", "$pushAll", "$addToSet", "$pop", "$pull", "$pullAll",
];

/// Document body entry for insert/update.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Plain(Value),
    /// `(operator, operand)`, an update operator or `exp`
    Op(String, Value),
}

impl DataValue {
    pub fn inc(step: i64) -> Self {
        DataValue::Op("$inc".to_string(), Value::from(step))
    }

    /// `["$push", x]` style pairs become operator entries.
    pub fn from_value(value: Value) -> Self {
        if let Value::Array(items) = &value {
            if let [Value::String(op), operand] = items.as_slice() {
                if op == "exp" || UPDATE_OPERATORS.contains(&op.as_str()) {
                    return DataValue::Op(op.clone(), operand.clone());
                }
            }
        }
        DataValue::Plain(value)
    }

    /// Plain value form, as stored on the record after an insert.
    pub fn to_value(&self) -> Value {
        match self {
            DataValue::Plain(v) => v.clone(),
            DataValue::Op(op, v) => Value::Array(vec![Value::from(op.as_str()), v.clone()]),
        }
    }
}

impl From<Value> for DataValue {
    fn from(value: Value) -> Self {
        DataValue::from_value(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: i64,
    pub per_page: i64,
}

/// Projection after field selection.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Wildcard; finalizes to an empty mapping.
    All,
    Fields(IndexMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldEntry {
    Name(String),
    /// Computed or renamed field, emitted as given.
    Computed(String, Value),
}

/// Argument of a field selection call.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSpec {
    All,
    Entries(Vec<FieldEntry>),
}

impl From<&str> for FieldSpec {
    fn from(s: &str) -> Self {
        if s.trim() == "*" {
            FieldSpec::All
        } else {
            FieldSpec::Entries(split_list(s).into_iter().map(FieldEntry::Name).collect())
        }
    }
}

impl From<Vec<&str>> for FieldSpec {
    fn from(names: Vec<&str>) -> Self {
        FieldSpec::Entries(
            names
                .into_iter()
                .map(|n| FieldEntry::Name(n.trim().to_string()))
                .collect(),
        )
    }
}

impl From<Map<String, Value>> for FieldSpec {
    fn from(map: Map<String, Value>) -> Self {
        FieldSpec::Entries(
            map.into_iter()
                .map(|(k, v)| FieldEntry::Computed(k, v))
                .collect(),
        )
    }
}

/// Parse a `"length"` or `"offset,length"` limit string.
pub fn parse_limit(s: &str) -> Result<(u64, u64)> {
    let bad = || MongoQueryError::InvalidQuery(format!("malformed limit: {:?}", s));
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [length] => Ok((0, length.parse().map_err(|_| bad())?)),
        [offset, length] => Ok((
            offset.parse().map_err(|_| bad())?,
            length.parse().map_err(|_| bad())?,
        )),
        _ => Err(bad()),
    }
}

/// Strongly typed option record. Each field is `None` until a builder call
/// or [`Options::finalize`] sets it.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub table: Option<String>,
    /// Logical table name without prefix.
    pub name: Option<String>,
    pub filter: Where,
    pub data: IndexMap<String, DataValue>,
    pub projection: Option<Projection>,
    pub sort: IndexMap<String, i32>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub page: Option<Page>,
    pub type_map: Option<TypeMap>,
    pub modifiers: Map<String, Value>,
    pub comment: Option<String>,
    pub max_time_ms: Option<u64>,
    pub batch_size: Option<u32>,
    pub collation: Option<Value>,
    pub hint: Option<Value>,
    pub read_preference: Option<ReadPreference>,
    pub write_concern: Option<WriteConcern>,
    pub tailable: Option<bool>,
    pub no_cursor_timeout: Option<bool>,
    pub await_data: Option<bool>,
    pub exhaust: Option<bool>,
    pub partial: Option<bool>,
    pub oplog_replay: Option<bool>,
    pub slave_ok: Option<bool>,
    /// Group-by fields for multi-aggregation.
    pub group: Vec<String>,
    pub upsert: Option<bool>,
    /// Allow a delete with an empty filter.
    pub force: Option<bool>,
    pub cache: Option<CacheDirective>,
    pub fetch_cursor: Option<bool>,
    pub master: Option<bool>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_filter(
        &mut self,
        logic: Logic,
        field: FilterField,
        op: Option<Value>,
        operand: Option<Value>,
    ) {
        self.filter.add(logic, field, op, operand);
    }

    pub fn remove_filter_field(&mut self, field: &str, logic: Logic) {
        self.filter.remove_field(field, logic);
    }

    pub fn set_data(&mut self, field: impl Into<String>, value: impl Into<DataValue>) {
        self.data.insert(field.into(), value.into());
    }

    /// Shallow merge; later values win per field.
    pub fn merge_data(&mut self, data: Map<String, Value>) {
        for (field, value) in data {
            self.data.insert(field, DataValue::from_value(value));
        }
    }

    /// `data[field] = ("$inc", step)` for every comma separated field.
    pub fn increment(&mut self, fields: &str, step: i64) {
        for field in split_list(fields) {
            self.data.insert(field, DataValue::inc(step));
        }
    }

    pub fn decrement(&mut self, fields: &str, step: i64) {
        self.increment(fields, -step);
    }

    pub fn set_limit(&mut self, offset: u64, length: u64) {
        self.skip = Some(offset);
        self.limit = Some(length);
    }

    pub fn set_limit_str(&mut self, s: &str) -> Result<()> {
        let (offset, length) = parse_limit(s)?;
        self.set_limit(offset, length);
        Ok(())
    }

    pub fn set_page(&mut self, number: i64, per_page: i64) {
        self.page = Some(Page { number, per_page });
    }

    /// Case-insensitive `"asc"` sorts ascending, anything else descending.
    pub fn order_by(&mut self, field: impl Into<String>, direction: &str) {
        let dir = if direction.eq_ignore_ascii_case("asc") { 1 } else { -1 };
        self.sort.insert(field.into(), dir);
    }

    pub fn replace_sort<I, S>(&mut self, sort: I)
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        self.sort = sort.into_iter().map(|(f, d)| (f.into(), d)).collect();
    }

    /// Replace the projection with the given selection.
    pub fn select_fields(&mut self, fields: FieldSpec, exclude: bool) {
        let entries = match fields {
            FieldSpec::All => {
                self.projection = Some(Projection::All);
                return;
            }
            FieldSpec::Entries(entries) => entries,
        };
        let flag = if exclude { 0 } else { 1 };
        let projection = entries
            .into_iter()
            .map(|entry| match entry {
                FieldEntry::Name(name) => (name, Value::from(flag)),
                FieldEntry::Computed(name, value) => (name, value),
            })
            .collect();
        self.projection = Some(Projection::Fields(projection));
    }

    /// Filter on the primary key `pk`. The resulting condition becomes the
    /// whole `and` group; conditions added there earlier are dropped.
    pub fn primary_key_filter(&mut self, pk: &str, data: Value) {
        let condition = match data {
            Value::Object(mut map) => match map.remove(pk) {
                Some(value) => Condition::eq(value),
                None => Condition::compare("in", Value::Array(map.into_iter().map(|(_, v)| v).collect())),
            },
            Value::Array(items) => Condition::compare("in", Value::Array(items)),
            Value::String(s) if s.contains(',') => Condition::compare("in", Value::String(s)),
            other => Condition::eq(other),
        };
        let mut group = WhereGroup::default();
        group.set(Some(pk.to_string()), condition);
        self.filter.replace_group(Logic::And, group);
    }

    /// Fill defaults and expand pagination. Running it again changes nothing.
    pub fn finalize<F>(&mut self, default_table: F, default_type_map: TypeMap)
    where
        F: FnOnce() -> String,
    {
        if self.table.is_none() {
            self.table = Some(default_table());
        }
        if let Some(comment) = &self.comment {
            self.modifiers
                .insert("$comment".to_string(), Value::from(comment.as_str()));
        }
        if let Some(ms) = self.max_time_ms {
            self.modifiers.insert("$maxTimeMS".to_string(), Value::from(ms));
        }
        match &self.projection {
            None | Some(Projection::All) => {
                self.projection = Some(Projection::Fields(IndexMap::new()));
            }
            Some(Projection::Fields(_)) => {}
        }
        if self.type_map.is_none() {
            self.type_map = Some(default_type_map);
        }
        if self.limit.is_none() {
            self.limit = Some(0);
        }
        if self.master.is_none() {
            self.master = Some(false);
        }
        if self.fetch_cursor.is_none() {
            self.fetch_cursor = Some(false);
        }
        if let Some(page) = self.page {
            let number = page.number.max(1) as u64;
            let per_page = if page.per_page > 0 {
                page.per_page as u64
            } else {
                match self.limit {
                    Some(n) if n > 0 => n,
                    _ => DEFAULT_PER_PAGE,
                }
            };
            self.skip = Some(per_page.saturating_mul(number - 1));
            self.limit = Some(per_page);
        }
    }

    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or("")
    }

    pub fn limit_value(&self) -> u64 {
        self.limit.unwrap_or(0)
    }

    pub fn is_master(&self) -> bool {
        self.master.unwrap_or(false)
    }

    /// Projection entries, empty meaning every field.
    pub fn projection_fields(&self) -> IndexMap<String, Value> {
        match &self.projection {
            Some(Projection::Fields(fields)) => fields.clone(),
            _ => IndexMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn name(s: &str) -> FilterField {
        FilterField::from(s)
    }

    #[test]
    fn test_filter_same_field_overwrites() {
        let mut w = Where::new();
        w.add(Logic::And, name("age"), Some(json!(">")), Some(json!(18)));
        w.add(Logic::And, name("name"), Some(json!("a")), None);
        w.add(Logic::And, name("age"), Some(json!("<")), Some(json!(65)));

        let group = w.group(Logic::And).unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group.get("age"), Some(&Condition::compare("<", 65)));
        assert_eq!(group.get("name"), Some(&Condition::eq("a")));
    }

    #[test]
    fn test_filter_groups_are_separate() {
        let w = Where::new().and("a", "=", 1).or("a", "=", 2);
        assert_eq!(w.group(Logic::And).unwrap().len(), 1);
        assert_eq!(w.group(Logic::Or).unwrap().get("a"), Some(&Condition::compare("=", 2)));
    }

    #[test]
    fn test_filter_null_keywords() {
        let mut w = Where::new();
        w.add(Logic::And, name("deleted"), Some(json!("NULL")), None);
        w.add(Logic::And, name("email"), Some(json!("not null")), None);
        let group = w.group(Logic::And).unwrap();
        assert_eq!(group.get("deleted"), Some(&Condition::compare("NULL", "")));
        assert_eq!(group.get("email"), Some(&Condition::compare("not null", "")));
    }

    #[test]
    fn test_filter_raw_expression_and_noop() {
        let mut w = Where::new();
        w.add(Logic::And, name("  "), None, None);
        assert!(w.is_empty());
        assert!(w.group(Logic::And).is_none());

        w.add(Logic::And, name("this.a > 1"), None, None);
        let clause = w.group(Logic::And).unwrap().iter().next().unwrap().clone();
        assert_eq!(clause.field, None);
        assert_eq!(clause.condition, Condition::compare("exp", "this.a > 1"));
    }

    #[test]
    fn test_filter_structured_operator_kept() {
        let mut w = Where::new();
        w.add(Logic::And, name("score"), Some(json!([[">", 1], ["<", 5]])), None);
        w.add(Logic::And, name("tag"), Some(json!(["in", ["a", "b"]])), None);
        let group = w.group(Logic::And).unwrap();
        assert_eq!(
            group.get("score"),
            Some(&Condition::Many(vec![(">".into(), json!(1)), ("<".into(), json!(5))]))
        );
        assert_eq!(group.get("tag"), Some(&Condition::compare("in", json!(["a", "b"]))));
    }

    #[test]
    fn test_filter_batch_merge() {
        let mut w = Where::new().and("a", "=", 1);
        let batch = json!({"a": 2, "b": ["like", "x"]});
        if let Value::Object(map) = batch {
            w.add(Logic::And, map.into(), None, None);
        }
        let group = w.group(Logic::And).unwrap();
        assert_eq!(group.get("a"), Some(&Condition::eq(2)));
        assert_eq!(group.get("b"), Some(&Condition::compare("like", "x")));
    }

    #[test]
    fn test_deferred_predicates_append() {
        let mut w = Where::new();
        w.add(Logic::And, FilterField::deferred(|_| Where::new().and("x", "=", 1)), None, None);
        w.add(
            Logic::And,
            FilterField::deferred(|_| Where::new().and("y", "=", 1)),
            Some(json!("not")),
            None,
        );
        let group = w.group(Logic::And).unwrap();
        assert_eq!(group.len(), 2);
        match &group.iter().nth(1).unwrap().condition {
            Condition::Deferred { op, .. } => assert_eq!(op.as_deref(), Some("not")),
            other => panic!("unexpected {:?}", other),
        };
    }

    #[test]
    fn test_remove_filter_field() {
        let mut opts = Options::new();
        opts.add_filter(Logic::And, name("a"), Some(json!(1)), None);
        opts.add_filter(Logic::Or, name("a"), Some(json!(2)), None);
        opts.remove_filter_field("a", Logic::And);
        opts.remove_filter_field("missing", Logic::Xor);
        assert!(opts.filter.group(Logic::And).unwrap().is_empty());
        assert_eq!(opts.filter.group(Logic::Or).unwrap().len(), 1);
    }

    #[test]
    fn test_data_merge_and_increment() {
        let mut opts = Options::new();
        opts.set_data("a", json!(1));
        if let Value::Object(map) = json!({"a": 2, "b": 3}) {
            opts.merge_data(map);
        }
        opts.increment("hits, views", 2);
        opts.decrement("stock", 5);

        assert_eq!(opts.data["a"], DataValue::Plain(json!(2)));
        assert_eq!(opts.data["b"], DataValue::Plain(json!(3)));
        assert_eq!(opts.data["hits"], DataValue::inc(2));
        assert_eq!(opts.data["views"], DataValue::inc(2));
        assert_eq!(opts.data["stock"], DataValue::inc(-5));
    }

    #[test]
    fn test_data_value_recognises_operators() {
        assert_eq!(
            DataValue::from_value(json!(["$push", "x"])),
            DataValue::Op("$push".into(), json!("x"))
        );
        assert_eq!(
            DataValue::from_value(json!(["a", "b"])),
            DataValue::Plain(json!(["a", "b"]))
        );
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit("5").unwrap(), (0, 5));
        assert_eq!(parse_limit("2,5").unwrap(), (2, 5));
        assert_eq!(parse_limit(" 2 , 5 ").unwrap(), (2, 5));
        assert!(matches!(parse_limit("a,5"), Err(MongoQueryError::InvalidQuery(_))));
        assert!(parse_limit("1,2,3").is_err());
        assert!(parse_limit("-1").is_err());
    }

    #[test]
    fn test_order_by() {
        let mut opts = Options::new();
        opts.order_by("a", "ASC");
        opts.order_by("b", "desc");
        opts.order_by("c", "sideways");
        assert_eq!(opts.sort["a"], 1);
        assert_eq!(opts.sort["b"], -1);
        assert_eq!(opts.sort["c"], -1);

        opts.replace_sort(vec![("z", 1)]);
        assert_eq!(opts.sort.len(), 1);
    }

    #[test]
    fn test_select_fields() {
        let mut opts = Options::new();
        opts.select_fields("a, b".into(), false);
        assert_eq!(opts.projection_fields()["a"], json!(1));
        assert_eq!(opts.projection_fields()["b"], json!(1));

        opts.select_fields("a,b".into(), true);
        assert_eq!(opts.projection_fields()["a"], json!(0));
        assert_eq!(opts.projection_fields().len(), 2);

        if let Value::Object(map) = json!({"total": {"$size": "$items"}}) {
            opts.select_fields(map.into(), false);
        }
        assert_eq!(opts.projection_fields()["total"], json!({"$size": "$items"}));
        assert!(opts.projection_fields().get("a").is_none());

        opts.select_fields("*".into(), false);
        assert_eq!(opts.projection, Some(Projection::All));
    }

    #[test]
    fn test_primary_key_filter_shapes() {
        let mut opts = Options::new();
        opts.primary_key_filter("id", json!(["x", "y"]));
        assert_eq!(
            opts.filter.group(Logic::And).unwrap().get("id"),
            Some(&Condition::compare("in", json!(["x", "y"])))
        );

        opts.primary_key_filter("id", json!({"id": 7, "name": "n"}));
        assert_eq!(opts.filter.group(Logic::And).unwrap().get("id"), Some(&Condition::eq(7)));

        opts.primary_key_filter("id", json!("1,2"));
        assert_eq!(
            opts.filter.group(Logic::And).unwrap().get("id"),
            Some(&Condition::compare("in", "1,2"))
        );

        opts.primary_key_filter("id", json!(3));
        assert_eq!(opts.filter.group(Logic::And).unwrap().get("id"), Some(&Condition::eq(3)));
    }

    #[test]
    fn test_primary_key_filter_replaces_and_group() {
        let mut opts = Options::new();
        opts.add_filter(Logic::And, name("status"), Some(json!(1)), None);
        opts.add_filter(Logic::Or, name("flag"), Some(json!(true)), None);
        opts.primary_key_filter("_id", json!(5));

        let and = opts.filter.group(Logic::And).unwrap();
        assert_eq!(and.len(), 1);
        assert!(and.get("status").is_none());
        assert_eq!(opts.filter.group(Logic::Or).unwrap().len(), 1);
    }

    #[test]
    fn test_finalize_defaults() {
        let mut opts = Options::new();
        opts.comment = Some("report".into());
        opts.max_time_ms = Some(100);
        opts.finalize(|| "users".to_string(), TypeMap::default());

        assert_eq!(opts.table_name(), "users");
        assert_eq!(opts.limit, Some(0));
        assert_eq!(opts.master, Some(false));
        assert_eq!(opts.fetch_cursor, Some(false));
        assert_eq!(opts.projection, Some(Projection::Fields(IndexMap::new())));
        assert_eq!(opts.modifiers["$comment"], json!("report"));
        assert_eq!(opts.modifiers["$maxTimeMS"], json!(100));
    }

    #[test]
    fn test_finalize_keeps_table() {
        let mut opts = Options::new();
        opts.table = Some("t_orders".into());
        opts.finalize(|| panic!("resolver must not run"), TypeMap::default());
        assert_eq!(opts.table_name(), "t_orders");
    }

    #[test]
    fn test_finalize_page() {
        let mut opts = Options::new();
        opts.set_page(2, 10);
        opts.finalize(|| "t".into(), TypeMap::default());
        assert_eq!((opts.skip, opts.limit), (Some(10), Some(10)));

        let mut opts = Options::new();
        opts.set_page(0, 10);
        opts.finalize(|| "t".into(), TypeMap::default());
        assert_eq!((opts.skip, opts.limit), (Some(0), Some(10)));

        let mut opts = Options::new();
        opts.set_limit(0, 15);
        opts.set_page(3, 0);
        opts.finalize(|| "t".into(), TypeMap::default());
        assert_eq!((opts.skip, opts.limit), (Some(30), Some(15)));

        let mut opts = Options::new();
        opts.set_page(2, -1);
        opts.finalize(|| "t".into(), TypeMap::default());
        assert_eq!((opts.skip, opts.limit), (Some(20), Some(20)));
    }

    #[test]
    fn test_finalize_huge_page_saturates() {
        let mut opts = Options::new();
        opts.set_page(i64::MAX, 1000);
        opts.finalize(|| "t".into(), TypeMap::default());
        assert_eq!((opts.skip, opts.limit), (Some(u64::MAX), Some(1000)));
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut opts = Options::new();
        opts.set_page(4, 0);
        opts.comment = Some("c".into());
        opts.finalize(|| "t".into(), TypeMap::default());
        let (skip, limit, modifiers) = (opts.skip, opts.limit, opts.modifiers.clone());
        opts.finalize(|| "other".into(), TypeMap::default());
        assert_eq!((opts.skip, opts.limit), (skip, limit));
        assert_eq!(opts.modifiers, modifiers);
        assert_eq!(opts.table_name(), "t");
    }

    #[test]
    fn test_logic_parse() {
        assert_eq!(Logic::parse("OR").unwrap(), Logic::Or);
        assert_eq!(Logic::parse("$xor").unwrap(), Logic::Xor);
        assert!(Logic::parse("nand").is_err());
        assert_eq!(Logic::And.key(), "$and");
    }
}
