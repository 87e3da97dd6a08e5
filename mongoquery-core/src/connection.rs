// mongoquery-core/src/connection.rs
// Execution pipeline: finalize, cache, endpoint, compile, driver, post-process, hooks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::builder::{render_bulk, render_command, Builder};
use crate::cache::{digest_key, Cache, MemoryCache};
use crate::config::{ConnectionConfig, Deploy, TypeMap};
use crate::document::convert_object_id;
use crate::driver::{BulkWrite, Command, Connector, Cursor, Namespace, WriteResult};
use crate::error::{MongoQueryError, Result};
use crate::events::{Events, Hook};
use crate::find_options::FindQuery;
use crate::lazy::{lazy_key, Clock, LazyOutcome, LazyWriter, SystemClock};
use crate::matcher::get_path;
use crate::options::{FieldSpec, Options};
use crate::resolver::{PrefixResolver, TableResolver};
use crate::topology::{EndpointSlot, Role, Topology};

fn precondition(msg: &str) -> MongoQueryError {
    MongoQueryError::Precondition(msg.to_string())
}

/// Map key for `column(.., key)`: strings as-is, anything else as JSON text.
fn key_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_empty_filter(filter: &Value) -> bool {
    filter.as_object().map_or(true, Map::is_empty)
}

/// One logical database handle. Owns the endpoint pool and the collaborators
/// every query executed through it shares.
pub struct Connection {
    id: Uuid,
    config: ConnectionConfig,
    topology: Topology,
    builder: Builder,
    cache: Arc<dyn Cache>,
    events: Events,
    resolver: Arc<dyn TableResolver>,
    clock: Arc<dyn Clock>,
    last_query: Mutex<String>,
    num_rows: AtomicU64,
    query_times: AtomicU64,
}

impl Connection {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            topology: Topology::new(config.clone(), connector),
            builder: Builder::from_config(&config),
            cache: Arc::new(MemoryCache::new()),
            events: Events::new(),
            resolver: Arc::new(PrefixResolver::from_config(&config)),
            clock: Arc::new(SystemClock),
            last_query: Mutex::new(String::new()),
            num_rows: AtomicU64::new(0),
            query_times: AtomicU64::new(0),
            config,
        })
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn TableResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn builder(&self) -> &Builder {
        &self.builder
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn resolver(&self) -> &Arc<dyn TableResolver> {
        &self.resolver
    }

    /// Last rendered statement; only kept when `debug` is on.
    pub fn last_query(&self) -> Option<String> {
        if !self.config.debug {
            return None;
        }
        let last = self.last_query.lock();
        (!last.is_empty()).then(|| last.clone())
    }

    /// Rows returned, or documents matched by the last write.
    pub fn num_rows(&self) -> u64 {
        self.num_rows.load(Ordering::Relaxed)
    }

    /// Driver round trips issued through this handle.
    pub fn query_times(&self) -> u64 {
        self.query_times.load(Ordering::Relaxed)
    }

    /// Primary key callers use for `table`.
    pub fn primary_key(&self, table: &str) -> String {
        self.resolver.primary_key(table)
    }

    pub fn close(&self) {
        self.topology.close();
    }

    /// Table the record targets, resolved the way finalization would.
    pub fn table_for(&self, options: &Options) -> String {
        match &options.table {
            Some(table) => table.clone(),
            None => self
                .resolver
                .table_name(options.name.as_deref().unwrap_or_default()),
        }
    }

    /// Fill the record's defaults in place.
    pub fn finalize(&self, options: &mut Options) {
        let resolver = &self.resolver;
        let name = options.name.clone().unwrap_or_default();
        options.finalize(|| resolver.table_name(&name), self.config.type_map);
    }

    fn role(options: &Options) -> Role {
        if options.is_master() {
            Role::Write
        } else {
            Role::Read
        }
    }

    fn namespace(&self, options: &Options, slot: EndpointSlot) -> Result<Namespace> {
        let table = options.table_name();
        if table.is_empty() {
            return Err(MongoQueryError::InvalidQuery("no collection selected".into()));
        }
        Ok(Namespace::resolve(&self.topology.database_for(slot), table))
    }

    fn record(&self, statement: String, started: Instant, slot: EndpointSlot) {
        self.query_times.fetch_add(1, Ordering::Relaxed);
        let elapsed_us = started.elapsed().as_micros() as u64;
        if self.config.deploy == Deploy::Distributed {
            let endpoint = if self.topology.is_master(slot) { "master" } else { "slave" };
            debug!(connection = %self.id, %slot, endpoint, elapsed_us, "{}", statement);
        } else {
            debug!(connection = %self.id, elapsed_us, "{}", statement);
        }
        if self.config.debug {
            *self.last_query.lock() = statement;
        }
    }

    fn rows(&self, cursor: Box<dyn Cursor>, type_map: Option<TypeMap>) -> Result<Vec<Value>> {
        let mut rows = cursor.to_rows(&type_map.unwrap_or(self.config.type_map))?;
        if self.config.pk_convert_id {
            rows.iter_mut().for_each(convert_object_id);
        }
        self.num_rows.store(rows.len() as u64, Ordering::Relaxed);
        Ok(rows)
    }

    /// Raw cursor for a compiled find.
    pub fn open_cursor(&self, options: &Options, query: &FindQuery) -> Result<Box<dyn Cursor>> {
        let (slot, link) = self.topology.endpoint(Self::role(options))?;
        let namespace = self.namespace(options, slot)?;
        let started = Instant::now();
        let cursor = link.execute_query(&namespace, query, options.read_preference.as_ref())?;
        self.record(query.render(&namespace), started, slot);
        Ok(cursor)
    }

    fn query_rows(&self, options: &Options, query: &FindQuery) -> Result<Vec<Value>> {
        let cursor = self.open_cursor(options, query)?;
        self.rows(cursor, options.type_map)
    }

    /// Serve from the cache when the record carries a directive, otherwise run
    /// `fetch` and store non-empty results.
    fn cached<F>(&self, options: &Options, kind: &str, payload: Value, fetch: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value>,
    {
        let directive = match &options.cache {
            Some(d) => d,
            None => return fetch(),
        };
        let key = directive
            .key
            .clone()
            .unwrap_or_else(|| digest_key("query", &json!([options.table_name(), kind, payload])));
        if let Some(hit) = self.cache.get(&key) {
            debug!(%key, "cache hit");
            return Ok(hit);
        }
        let result = fetch()?;
        let empty = match &result {
            Value::Null | Value::Bool(false) => true,
            Value::Array(items) => items.is_empty(),
            _ => false,
        };
        if !empty {
            self.cache
                .set(&key, result.clone(), directive.tag.as_deref(), directive.ttl);
        }
        Ok(result)
    }

    fn find_payload(query: &FindQuery) -> Value {
        json!([query.filter, query.options.to_document()])
    }

    pub fn select(&self, options: &mut Options) -> Result<Vec<Value>> {
        self.finalize(options);
        if let Some(result) = self.events.trigger(Hook::BeforeSelect, options, None) {
            return Ok(match result {
                Value::Array(rows) => rows,
                other => vec![other],
            });
        }
        let query = self.builder.select(options, false)?;
        let result = self.cached(options, "select", Self::find_payload(&query), || {
            Ok(Value::Array(self.query_rows(options, &query)?))
        })?;
        Ok(match result {
            Value::Array(rows) => rows,
            other => vec![other],
        })
    }

    pub fn find(&self, options: &mut Options) -> Result<Option<Value>> {
        self.finalize(options);
        if let Some(result) = self.events.trigger(Hook::BeforeFind, options, None) {
            return Ok(Some(result));
        }
        let query = self.builder.select(options, true)?;
        let result = self.cached(options, "find", Self::find_payload(&query), || {
            Ok(self
                .query_rows(options, &query)?
                .into_iter()
                .next()
                .unwrap_or(Value::Null))
        })?;
        Ok((!result.is_null()).then_some(result))
    }

    /// One field of the first matching row. The record's projection is left as it was.
    pub fn value(&self, options: &mut Options, field: &str) -> Result<Option<Value>> {
        self.finalize(options);
        let mut scoped = options.clone();
        scoped.select_fields(FieldSpec::from(vec![field]), false);
        let query = self.builder.select(&scoped, true)?;
        let result = self.cached(&scoped, "value", Self::find_payload(&query), || {
            Ok(self
                .query_rows(&scoped, &query)?
                .first()
                .and_then(|row| get_path(row, field).cloned())
                .unwrap_or(Value::Null))
        })?;
        Ok((!result.is_null()).then_some(result))
    }

    /// Values of `field` across the result set. With `key`, an object keyed by
    /// that field; with `key` and `*` or several fields, whole rows by key.
    pub fn column(&self, options: &mut Options, field: &str, key: &str) -> Result<Value> {
        self.finalize(options);
        let mut scoped = options.clone();
        let whole_rows = field.trim() == "*" || field.contains(',');
        let projection = if !key.is_empty() && field.trim() != "*" {
            format!("{},{}", key, field)
        } else {
            field.to_string()
        };
        scoped.select_fields(FieldSpec::from(projection.as_str()), false);

        let query = self.builder.select(&scoped, false)?;
        self.cached(&scoped, "column", Self::find_payload(&query), || {
            let rows = self.query_rows(&scoped, &query)?;
            if key.is_empty() {
                return Ok(Value::Array(
                    rows.iter()
                        .map(|row| get_path(row, field).cloned().unwrap_or(Value::Null))
                        .collect(),
                ));
            }
            let mut keyed = Map::new();
            for row in rows {
                let k = key_text(get_path(&row, key).unwrap_or(&Value::Null));
                let v = if whole_rows {
                    row
                } else {
                    get_path(&row, field).cloned().unwrap_or(Value::Null)
                };
                keyed.insert(k, v);
            }
            Ok(Value::Object(keyed))
        })
    }

    pub fn cursor(&self, options: &mut Options) -> Result<Box<dyn Cursor>> {
        self.finalize(options);
        options.fetch_cursor = Some(true);
        let query = self.builder.select(options, false)?;
        self.open_cursor(options, &query)
    }

    /// Run a command on the endpoint the record's master flag selects.
    /// `database` defaults to the endpoint's configured database.
    pub fn command(&self, options: &Options, command: &Command, database: Option<&str>) -> Result<Vec<Value>> {
        let (slot, link) = self.topology.endpoint(Self::role(options))?;
        let database = match database {
            Some(db) if !db.is_empty() => db.to_string(),
            _ => self.topology.database_for(slot),
        };
        let started = Instant::now();
        let cursor = link.execute_command(&database, command, options.read_preference.as_ref())?;
        self.record(render_command(&database, command), started, slot);
        self.rows(cursor, options.type_map)
    }

    /// Raw command document.
    pub fn cmd(&self, options: &mut Options, document: Value, database: Option<&str>) -> Result<Vec<Value>> {
        self.finalize(options);
        let command = Command::new(document)?;
        self.command(options, &command, database)
    }

    pub fn count(&self, options: &mut Options) -> Result<u64> {
        self.finalize(options);
        let command = self.builder.count(options)?;
        let result = self.cached(options, "count", command.to_value(), || {
            let rows = self.command(options, &command, None)?;
            Ok(rows
                .first()
                .and_then(|row| row.get("n"))
                .cloned()
                .unwrap_or(Value::from(0)))
        })?;
        Ok(result.as_f64().map_or(0, |n| n as u64))
    }

    /// `$op` over `field`; 0 when nothing matched.
    pub fn aggregate(&self, options: &mut Options, op: &str, field: &str) -> Result<Value> {
        self.finalize(options);
        let command = self.builder.aggregate(options, op, field)?;
        self.cached(options, "aggregate", command.to_value(), || {
            let rows = self.command(options, &command, None)?;
            let first = rows.first();
            Ok(first
                .and_then(|row| row.get("aggregate"))
                .or_else(|| first.and_then(|row| get_path(row, "result.0.aggregate")))
                .cloned()
                .unwrap_or(Value::from(0)))
        })
    }

    /// Grouped aggregation; the group key fields are lifted into each row.
    pub fn multi_aggregate(
        &self,
        options: &mut Options,
        aggregates: &[(String, String)],
        group_by: &[String],
    ) -> Result<Vec<Value>> {
        self.finalize(options);
        let command = self.builder.multi_aggregate(options, aggregates, group_by)?;
        let mut rows = self.command(options, &command, None)?;
        for row in rows.iter_mut() {
            if let Value::Object(map) = row {
                if let Some(Value::Object(id)) = map.remove("_id") {
                    map.extend(id);
                }
            }
        }
        Ok(rows)
    }

    pub fn distinct(&self, options: &mut Options, field: &str) -> Result<Vec<Value>> {
        self.finalize(options);
        let command = self.builder.distinct(options, field)?;
        let rows = self.command(options, &command, None)?;
        Ok(match rows.into_iter().next().and_then(|mut row| row.get_mut("values").map(Value::take)) {
            Some(Value::Array(values)) => values,
            _ => Vec::new(),
        })
    }

    pub fn list_collections(&self, options: &Options, database: Option<&str>) -> Result<Vec<String>> {
        let command = self.builder.list_collections()?;
        let rows = self.command(options, &command, database)?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("name").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    /// Submit a bulk write to a master endpoint and drop cache entries the
    /// record's directive names.
    fn execute(&self, options: &Options, bulk: &BulkWrite) -> Result<WriteResult> {
        let (slot, link) = self.topology.endpoint(Role::Write)?;
        let namespace = self.namespace(options, slot)?;
        let started = Instant::now();
        let result = link.execute_bulk_write(&namespace, bulk, options.write_concern.as_ref())?;
        self.record(render_bulk(&namespace, bulk), started, slot);
        self.num_rows.store(result.matched, Ordering::Relaxed);

        if let Some(directive) = &options.cache {
            match (&directive.key, &directive.tag) {
                (Some(key), _) if self.cache.has(key) => self.cache.delete(key),
                (_, Some(tag)) => self.cache.clear_tag(tag),
                _ => {}
            }
        }
        Ok(result)
    }

    /// Insert `data`. On success the identifier is written back into the
    /// record's data under the primary key and returned in plain form.
    pub fn insert(&self, options: &mut Options) -> Result<(u64, Option<Value>)> {
        self.finalize(options);
        if options.data.is_empty() {
            return Err(precondition("miss data to insert"));
        }
        let (bulk, id) = self.builder.insert(options)?;
        let result = self.execute(options, &bulk)?;
        if result.inserted == 0 {
            return Ok((0, None));
        }
        let id = id.map(|id| id.to_plain_value());
        if let Some(id) = &id {
            let pk = self.primary_key(options.table_name());
            options.set_data(pk, id.clone());
        }
        self.events.trigger(Hook::AfterInsert, options, id.as_ref());
        Ok((result.inserted, id))
    }

    pub fn insert_all(&self, options: &mut Options, rows: &[Map<String, Value>]) -> Result<u64> {
        self.finalize(options);
        if rows.is_empty() {
            return Ok(0);
        }
        let (bulk, _ids) = self.builder.insert_all(options, rows)?;
        Ok(self.execute(options, &bulk)?.inserted)
    }

    pub fn update(&self, options: &mut Options) -> Result<u64> {
        self.finalize(options);
        if options.data.is_empty() {
            return Err(precondition("miss update data"));
        }
        let bulk = self.builder.update(options)?;
        let result = self.execute(options, &bulk)?;
        if result.modified > 0 || result.upserted > 0 {
            self.events
                .trigger(Hook::AfterUpdate, options, Some(&Value::from(result.modified)));
        }
        Ok(result.modified)
    }

    pub fn delete(&self, options: &mut Options) -> Result<u64> {
        self.finalize(options);
        let filter = self.builder.parse_where(options)?;
        if is_empty_filter(&filter) && !options.force.unwrap_or(false) {
            return Err(precondition("delete without condition"));
        }
        let bulk = self.builder.delete(options)?;
        let result = self.execute(options, &bulk)?;
        if result.deleted > 0 {
            self.events
                .trigger(Hook::AfterDelete, options, Some(&Value::from(result.deleted)));
        }
        Ok(result.deleted)
    }

    /// `$inc` on `field` for the filtered rows. With a lazy window the delta is
    /// buffered and `Ok(None)` returned until the window closes; the flush then
    /// writes the accumulated total.
    pub fn set_inc(
        &self,
        options: &mut Options,
        field: &str,
        step: i64,
        lazy: Option<Duration>,
    ) -> Result<Option<u64>> {
        if options.filter.is_empty() {
            return Err(precondition("no data to update"));
        }
        self.finalize(options);
        let mut step = step;
        if let Some(window) = lazy.filter(|w| !w.is_zero()) {
            let filter = self.builder.parse_where(options)?;
            let key = lazy_key(options.table_name(), field, &filter);
            let writer = LazyWriter::new(self.cache.clone(), self.clock.clone());
            match writer.accumulate(&key, step, window) {
                LazyOutcome::Buffered => {
                    debug!(table = options.table_name(), field, "lazy increment buffered");
                    return Ok(None);
                }
                LazyOutcome::Flush(total) => step = total,
            }
        }
        options.increment(field, step);
        self.update(options).map(Some)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("topology", &self.topology)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
