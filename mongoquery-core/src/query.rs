// mongoquery-core/src/query.rs
// Fluent query: builder calls accumulate into an option record, terminal
// calls hand it to the connection.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::cache::CacheDirective;
use crate::config::TypeMap;
use crate::connection::Connection;
use crate::driver::{Cursor, ReadPreference, WriteConcern};
use crate::error::{MongoQueryError, Result};
use crate::options::{DataValue, FieldSpec, FilterField, Logic, Options, Where};

/// Chainable query bound to one connection.
#[derive(Clone)]
pub struct Query {
    connection: Arc<Connection>,
    options: Options,
}

impl Query {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            options: Options::new(),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn get_options(&self) -> &Options {
        &self.options
    }

    /// Replace the whole record, e.g. with one saved from another query.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Physical collection name, used as given. `db.collection` selects another database.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.options.table = Some(table.into());
        self
    }

    pub fn collection(self, collection: impl Into<String>) -> Self {
        self.table(collection)
    }

    /// Logical name; the resolver adds the prefix when the record is finalized.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    // ---- filters ----

    /// General form: `field` with optional operator and operand, filed under `logic`.
    pub fn filter_with(
        mut self,
        logic: Logic,
        field: impl Into<FilterField>,
        op: Option<Value>,
        operand: Option<Value>,
    ) -> Self {
        self.options.add_filter(logic, field.into(), op, operand);
        self
    }

    /// `field op value` under `and`.
    pub fn filter(self, field: &str, op: &str, value: impl Into<Value>) -> Self {
        self.filter_with(Logic::And, field, Some(Value::from(op)), Some(value.into()))
    }

    pub fn filter_eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter_with(Logic::And, field, Some(value.into()), None)
    }

    /// Batch of `field -> value` or `field -> [op, operand]` entries.
    pub fn filter_map(self, conditions: Map<String, Value>) -> Self {
        self.filter_with(Logic::And, conditions, None, None)
    }

    /// Server-side expression, compiled to `$where`.
    pub fn filter_raw(self, expression: &str) -> Self {
        self.filter_with(Logic::And, expression, None, None)
    }

    /// Conditions produced from the finished record at compile time.
    pub fn filter_fn<F>(self, predicate: F) -> Self
    where
        F: Fn(&Options) -> Where + Send + Sync + 'static,
    {
        self.filter_with(Logic::And, FilterField::deferred(predicate), None, None)
    }

    /// Rows matching none of the predicate's conditions.
    pub fn filter_not<F>(self, predicate: F) -> Self
    where
        F: Fn(&Options) -> Where + Send + Sync + 'static,
    {
        self.filter_with(
            Logic::And,
            FilterField::deferred(predicate),
            Some(Value::from("not")),
            None,
        )
    }

    pub fn filter_or(self, field: &str, op: &str, value: impl Into<Value>) -> Self {
        self.filter_with(Logic::Or, field, Some(Value::from(op)), Some(value.into()))
    }

    pub fn filter_xor(self, field: &str, op: &str, value: impl Into<Value>) -> Self {
        self.filter_with(Logic::Xor, field, Some(Value::from(op)), Some(value.into()))
    }

    /// `field IS NULL`
    pub fn filter_null(self, field: &str) -> Self {
        self.filter_with(Logic::And, field, Some(Value::from("null")), None)
    }

    pub fn filter_not_null(self, field: &str) -> Self {
        self.filter_with(Logic::And, field, Some(Value::from("not null")), None)
    }

    pub fn remove_filter(mut self, field: &str, logic: Logic) -> Self {
        self.options.remove_filter_field(field, logic);
        self
    }

    /// Filter on the primary key. Replaces the current `and` group.
    pub fn pk(mut self, data: impl Into<Value>) -> Self {
        let pk = self.primary_key();
        self.options.primary_key_filter(&pk, data.into());
        self
    }

    // ---- document body ----

    pub fn data(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.set_data(field, DataValue::from_value(value.into()));
        self
    }

    pub fn data_map(mut self, data: Map<String, Value>) -> Self {
        self.options.merge_data(data);
        self
    }

    /// `$inc` each comma separated field by `step`.
    pub fn inc(mut self, fields: &str, step: i64) -> Self {
        self.options.increment(fields, step);
        self
    }

    pub fn dec(mut self, fields: &str, step: i64) -> Self {
        self.options.decrement(fields, step);
        self
    }

    // ---- projection, order, paging ----

    pub fn field(mut self, fields: impl Into<FieldSpec>) -> Self {
        self.options.select_fields(fields.into(), false);
        self
    }

    /// Every field except the listed ones.
    pub fn without_field(mut self, fields: impl Into<FieldSpec>) -> Self {
        self.options.select_fields(fields.into(), true);
        self
    }

    pub fn order(mut self, field: &str, direction: &str) -> Self {
        self.options.order_by(field, direction);
        self
    }

    /// Replace the sort with `(field, 1 | -1)` pairs.
    pub fn order_map<I, S>(mut self, sort: I) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        self.options.replace_sort(sort);
        self
    }

    pub fn limit(mut self, length: u64) -> Self {
        self.options.set_limit(0, length);
        self
    }

    pub fn limit_range(mut self, offset: u64, length: u64) -> Self {
        self.options.set_limit(offset, length);
        self
    }

    /// `"length"` or `"offset,length"`.
    pub fn limit_str(mut self, limit: &str) -> Result<Self> {
        self.options.set_limit_str(limit)?;
        Ok(self)
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.options.skip = Some(skip);
        self
    }

    /// Page numbers start at 1; `per_page <= 0` falls back to the limit, then 20.
    pub fn page(mut self, number: i64, per_page: i64) -> Self {
        self.options.set_page(number, per_page);
        self
    }

    // ---- passthrough flags ----

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.options.comment = Some(comment.into());
        self
    }

    pub fn max_time_ms(mut self, ms: u64) -> Self {
        self.options.max_time_ms = Some(ms);
        self
    }

    pub fn batch_size(mut self, size: u32) -> Self {
        self.options.batch_size = Some(size);
        self
    }

    pub fn collation(mut self, collation: Value) -> Self {
        self.options.collation = Some(collation);
        self
    }

    pub fn hint(mut self, hint: impl Into<Value>) -> Self {
        self.options.hint = Some(hint.into());
        self
    }

    pub fn modifiers(mut self, modifiers: Map<String, Value>) -> Self {
        self.options.modifiers = modifiers;
        self
    }

    pub fn type_map(mut self, type_map: TypeMap) -> Self {
        self.options.type_map = Some(type_map);
        self
    }

    pub fn read_preference(mut self, preference: ReadPreference) -> Self {
        self.options.read_preference = Some(preference);
        self
    }

    pub fn write_concern(mut self, concern: WriteConcern) -> Self {
        self.options.write_concern = Some(concern);
        self
    }

    pub fn tailable(mut self, on: bool) -> Self {
        self.options.tailable = Some(on);
        self
    }

    pub fn no_cursor_timeout(mut self, on: bool) -> Self {
        self.options.no_cursor_timeout = Some(on);
        self
    }

    pub fn await_data(mut self, on: bool) -> Self {
        self.options.await_data = Some(on);
        self
    }

    pub fn exhaust(mut self, on: bool) -> Self {
        self.options.exhaust = Some(on);
        self
    }

    pub fn partial(mut self, on: bool) -> Self {
        self.options.partial = Some(on);
        self
    }

    pub fn oplog_replay(mut self, on: bool) -> Self {
        self.options.oplog_replay = Some(on);
        self
    }

    pub fn slave_ok(mut self, on: bool) -> Self {
        self.options.slave_ok = Some(on);
        self
    }

    /// Group-by fields for [`Query::multi_aggregate`].
    pub fn group(mut self, fields: &str) -> Self {
        self.options.group = crate::config::split_list(fields);
        self
    }

    pub fn upsert(mut self, on: bool) -> Self {
        self.options.upsert = Some(on);
        self
    }

    /// Allow `delete` without a filter.
    pub fn force(mut self, on: bool) -> Self {
        self.options.force = Some(on);
        self
    }

    pub fn cache(mut self, directive: CacheDirective) -> Self {
        self.options.cache = Some(directive);
        self
    }

    pub fn fetch_cursor(mut self, on: bool) -> Self {
        self.options.fetch_cursor = Some(on);
        self
    }

    /// Route reads to a master endpoint.
    pub fn master(mut self, on: bool) -> Self {
        self.options.master = Some(on);
        self
    }

    fn primary_key(&self) -> String {
        self.connection
            .primary_key(&self.connection.table_for(&self.options))
    }

    // ---- reads ----

    pub fn select(&mut self) -> Result<Vec<Value>> {
        self.connection.select(&mut self.options)
    }

    pub fn find(&mut self) -> Result<Option<Value>> {
        self.connection.find(&mut self.options)
    }

    /// `field` of the first matching row, `default` when there is none.
    pub fn value(&mut self, field: &str, default: impl Into<Value>) -> Result<Value> {
        Ok(self
            .connection
            .value(&mut self.options, field)?
            .unwrap_or_else(|| default.into()))
    }

    /// Array of `field` values, or an object keyed by `key` when one is given.
    pub fn column(&mut self, field: &str, key: &str) -> Result<Value> {
        self.connection.column(&mut self.options, field, key)
    }

    pub fn cursor(&mut self) -> Result<Box<dyn Cursor>> {
        self.connection.cursor(&mut self.options)
    }

    /// Walk the result set `size` rows at a time, ordered ascending on
    /// `column` (primary key by default). Stops early and returns `false`
    /// when the callback does.
    pub fn chunk<F>(&mut self, size: u64, column: Option<&str>, mut callback: F) -> Result<bool>
    where
        F: FnMut(Vec<Value>) -> bool,
    {
        if size == 0 {
            return Err(MongoQueryError::InvalidQuery("chunk size must be positive".into()));
        }
        let column = match column {
            Some(c) => c.to_string(),
            None => self.primary_key(),
        };
        let saved = self.options.clone();

        self.options.set_limit(0, size);
        self.options.order_by(column.clone(), "asc");
        let mut rows = self.select()?;

        while !rows.is_empty() {
            let last = rows
                .last()
                .and_then(|row| row.get(&column))
                .cloned()
                .unwrap_or(Value::Null);
            if !callback(rows) {
                self.options = saved;
                return Ok(false);
            }
            if last.is_null() {
                break;
            }
            let mut next = saved.clone();
            next.set_limit(0, size);
            next.add_filter(
                Logic::And,
                FilterField::from(column.as_str()),
                Some(Value::from(">")),
                Some(last),
            );
            next.order_by(column.clone(), "asc");
            self.options = next;
            rows = self.select()?;
        }
        self.options = saved;
        Ok(true)
    }

    /// Documents matching the filter. A field argument does not narrow the count.
    pub fn count(&mut self, _field: Option<&str>) -> Result<u64> {
        self.connection.count(&mut self.options)
    }

    pub fn aggregate(&mut self, op: &str, field: &str) -> Result<Value> {
        self.connection.aggregate(&mut self.options, op, field)
    }

    pub fn max(&mut self, field: &str) -> Result<Value> {
        self.aggregate("max", field)
    }

    pub fn min(&mut self, field: &str) -> Result<Value> {
        self.aggregate("min", field)
    }

    pub fn sum(&mut self, field: &str) -> Result<Value> {
        self.aggregate("sum", field)
    }

    pub fn avg(&mut self, field: &str) -> Result<Value> {
        self.aggregate("avg", field)
    }

    /// `(op, field)` aggregates per group; `group_by` falls back to [`Query::group`].
    pub fn multi_aggregate(&mut self, aggregates: &[(&str, &str)], group_by: &[&str]) -> Result<Vec<Value>> {
        let aggregates: Vec<(String, String)> = aggregates
            .iter()
            .map(|(op, field)| (op.to_string(), field.to_string()))
            .collect();
        let group_by: Vec<String> = if group_by.is_empty() {
            self.options.group.clone()
        } else {
            group_by.iter().map(|f| f.to_string()).collect()
        };
        self.connection
            .multi_aggregate(&mut self.options, &aggregates, &group_by)
    }

    pub fn distinct(&mut self, field: &str) -> Result<Vec<Value>> {
        self.connection.distinct(&mut self.options, field)
    }

    pub fn list_collections(&mut self, database: Option<&str>) -> Result<Vec<String>> {
        self.connection.list_collections(&self.options, database)
    }

    /// Run a raw command document.
    pub fn cmd(&mut self, command: Value, database: Option<&str>) -> Result<Vec<Value>> {
        self.connection.cmd(&mut self.options, command, database)
    }

    // ---- writes ----

    /// Insert `data` merged over the record's data; returns the inserted count.
    pub fn insert(&mut self, data: Map<String, Value>) -> Result<u64> {
        self.options.merge_data(data);
        Ok(self.connection.insert(&mut self.options)?.0)
    }

    /// Insert and return the new identifier (ObjectIds as hex strings).
    pub fn insert_get_id(&mut self, data: Map<String, Value>) -> Result<Option<Value>> {
        self.options.merge_data(data);
        Ok(self.connection.insert(&mut self.options)?.1)
    }

    pub fn insert_all(&mut self, rows: &[Map<String, Value>]) -> Result<u64> {
        self.connection.insert_all(&mut self.options, rows)
    }

    /// Apply `data` merged over the record's data; returns the modified count.
    pub fn update(&mut self, data: Map<String, Value>) -> Result<u64> {
        self.options.merge_data(data);
        self.connection.update(&mut self.options)
    }

    /// Delete matching rows. `Some(true)` forces an unfiltered delete, any
    /// other value is taken as primary key data.
    pub fn delete(&mut self, data: Option<Value>) -> Result<u64> {
        match data {
            Some(Value::Bool(true)) => self.options.force = Some(true),
            Some(Value::Null) | None => {}
            Some(pk_data) => {
                let pk = self.primary_key();
                self.options.primary_key_filter(&pk, pk_data);
            }
        }
        self.connection.delete(&mut self.options)
    }

    pub fn set_field(&mut self, field: &str, value: impl Into<Value>) -> Result<u64> {
        self.options.set_data(field, DataValue::from_value(value.into()));
        self.connection.update(&mut self.options)
    }

    /// Increment `field`. `lazy` buffers the delta for that long and returns
    /// `None` until a flush writes the total.
    pub fn set_inc(&mut self, field: &str, step: i64, lazy: Option<Duration>) -> Result<Option<u64>> {
        self.connection.set_inc(&mut self.options, field, step, lazy)
    }

    pub fn set_dec(&mut self, field: &str, step: i64, lazy: Option<Duration>) -> Result<Option<u64>> {
        self.connection.set_inc(&mut self.options, field, -step, lazy)
    }

    /// Last statement sent through this query's connection (debug mode only).
    pub fn last_query(&self) -> Option<String> {
        self.connection.last_query()
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("connection", &self.connection.id())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::memory::MemoryConnector;
    use crate::options::{Condition, Projection};
    use serde_json::json;

    fn query() -> Query {
        let config = ConnectionConfig {
            database: "app".into(),
            pk_convert_id: true,
            ..Default::default()
        };
        let connection = Connection::new(config, Arc::new(MemoryConnector::new())).unwrap();
        Query::new(Arc::new(connection))
    }

    #[test]
    fn test_filters_land_in_their_groups() {
        let q = query()
            .table("users")
            .filter("age", ">", 18)
            .filter_eq("name", "a")
            .filter_or("vip", "=", true)
            .filter_null("deleted_at");
        let and = q.get_options().filter.group(Logic::And).unwrap();
        assert_eq!(and.len(), 3);
        assert_eq!(and.get("age"), Some(&Condition::compare(">", 18)));
        assert_eq!(and.get("name"), Some(&Condition::eq("a")));
        assert_eq!(q.get_options().filter.group(Logic::Or).unwrap().len(), 1);

        let q = q.remove_filter("age", Logic::And);
        assert!(q.get_options().filter.group(Logic::And).unwrap().get("age").is_none());
    }

    #[test]
    fn test_pk_replaces_and_group() {
        let q = query().table("users").filter_eq("name", "a").pk("x,y");
        let and = q.get_options().filter.group(Logic::And).unwrap();
        assert_eq!(and.len(), 1);
        assert_eq!(and.get("id"), Some(&Condition::compare("in", "x,y")));
    }

    #[test]
    fn test_paging_and_projection_calls() {
        let q = query().limit_str("2,5").unwrap();
        assert_eq!((q.get_options().skip, q.get_options().limit), (Some(2), Some(5)));
        assert!(query().limit_str("a,b").is_err());

        let q = query().without_field("secret,token").order("age", "ASC").order("name", "x");
        match &q.get_options().projection {
            Some(Projection::Fields(f)) => {
                assert_eq!(f.get("secret"), Some(&json!(0)));
                assert_eq!(f.get("token"), Some(&json!(0)));
            }
            other => panic!("unexpected projection {:?}", other),
        }
        let sort: Vec<(&str, i32)> = q
            .get_options()
            .sort
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        assert_eq!(sort, vec![("age", 1), ("name", -1)]);
    }

    #[test]
    fn test_data_and_increments() {
        let q = query().data("name", "a").inc("hits,views", 2).dec("stock", 1);
        let data = &q.get_options().data;
        assert_eq!(data.get("name").map(|d| d.to_value()), Some(json!("a")));
        assert_eq!(data.get("views").map(|d| d.to_value()), Some(json!(["$inc", 2])));
        assert_eq!(data.get("stock").map(|d| d.to_value()), Some(json!(["$inc", -1])));
    }

    #[test]
    fn test_options_can_be_restored() {
        let saved = query().table("orders").limit(3).get_options().clone();
        let q = query().options(saved);
        assert_eq!(q.get_options().table.as_deref(), Some("orders"));
        assert_eq!(q.get_options().limit, Some(3));
    }

    #[test]
    fn test_chunk_rejects_zero_size() {
        let err = query().table("t").chunk(0, None, |_| true).unwrap_err();
        assert!(matches!(err, MongoQueryError::InvalidQuery(_)));
    }
}
