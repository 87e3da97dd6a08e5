// mongoquery-core/src/find_options.rs
// Read payload: filter plus find options, and how they apply to in-memory rows

use serde_json::{Map, Value};

use crate::aggregation::ProjectStage;
use crate::document::flatten_object_ids;
use crate::driver::Namespace;
use crate::error::Result;
use crate::matcher::{compare_values, get_path};

/// Options for find queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Projection: field → 1 (include), 0 (exclude) or an expression
    pub projection: Option<Map<String, Value>>,

    /// Sort: [(field, direction)], direction: 1 (asc) or -1 (desc)
    pub sort: Option<Vec<(String, i32)>>,

    /// Limit: maximum number of documents to return, 0 for no limit
    pub limit: Option<u64>,

    /// Skip: number of documents to skip (for pagination)
    pub skip: Option<u64>,

    pub batch_size: Option<u32>,
    pub collation: Option<Value>,
    pub hint: Option<Value>,
    /// `$comment`, `$maxTimeMS` and other query modifiers
    pub modifiers: Map<String, Value>,
    pub tailable: bool,
    pub no_cursor_timeout: bool,
    pub await_data: bool,
    pub exhaust: bool,
    pub partial: bool,
    pub oplog_replay: bool,
    pub slave_ok: bool,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projection(mut self, projection: Map<String, Value>) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: Vec<(String, i32)>) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_modifier(mut self, key: &str, value: Value) -> Self {
        self.modifiers.insert(key.to_string(), value);
        self
    }

    /// Driver-shaped option document (camelCase keys, unset entries omitted).
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        if let Some(projection) = &self.projection {
            if !projection.is_empty() {
                doc.insert("projection".into(), Value::Object(projection.clone()));
            }
        }
        if let Some(sort) = &self.sort {
            if !sort.is_empty() {
                doc.insert("sort".into(), sort_document(sort));
            }
        }
        if let Some(skip) = self.skip {
            doc.insert("skip".into(), Value::from(skip));
        }
        if let Some(limit) = self.limit {
            doc.insert("limit".into(), Value::from(limit));
        }
        if let Some(n) = self.batch_size {
            doc.insert("batchSize".into(), Value::from(n));
        }
        if let Some(c) = &self.collation {
            doc.insert("collation".into(), c.clone());
        }
        if let Some(h) = &self.hint {
            doc.insert("hint".into(), h.clone());
        }
        if !self.modifiers.is_empty() {
            doc.insert("modifiers".into(), Value::Object(self.modifiers.clone()));
        }
        let flags = [
            ("tailable", self.tailable),
            ("noCursorTimeout", self.no_cursor_timeout),
            ("awaitData", self.await_data),
            ("exhaust", self.exhaust),
            ("allowPartialResults", self.partial),
            ("oplogReplay", self.oplog_replay),
            ("slaveOk", self.slave_ok),
        ];
        for (key, on) in flags {
            if on {
                doc.insert(key.into(), Value::Bool(true));
            }
        }
        Value::Object(doc)
    }
}

fn sort_document(sort: &[(String, i32)]) -> Value {
    Value::Object(
        sort.iter()
            .map(|(field, dir)| (field.clone(), Value::from(*dir)))
            .collect(),
    )
}

/// Compiled read: what `execute_query` receives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    pub filter: Value,
    pub options: FindOptions,
}

impl FindQuery {
    pub fn new(filter: Value, options: FindOptions) -> Self {
        Self { filter, options }
    }

    /// Shell-like rendering for the statement log.
    pub fn render(&self, namespace: &Namespace) -> String {
        let mut out = format!(
            "{}.find({}",
            namespace,
            flatten_object_ids(&self.filter)
        );
        match &self.options.projection {
            Some(p) if !p.is_empty() => out.push_str(&format!(", {})", Value::Object(p.clone()))),
            _ => out.push(')'),
        }
        if let Some(sort) = &self.options.sort {
            if !sort.is_empty() {
                out.push_str(&format!(".sort({})", sort_document(sort)));
            }
        }
        if let Some(skip) = self.options.skip.filter(|n| *n > 0) {
            out.push_str(&format!(".skip({})", skip));
        }
        if let Some(limit) = self.options.limit.filter(|n| *n > 0) {
            out.push_str(&format!(".limit({})", limit));
        }
        out.push(';');
        out
    }
}

/// Apply projection to a document
pub fn apply_projection(doc: &Value, projection: &Map<String, Value>) -> Result<Value> {
    if projection.is_empty() {
        return Ok(doc.clone());
    }
    let stage = ProjectStage::from_json(&Value::Object(projection.clone()))?;
    Ok(stage.project_document(doc))
}

/// Apply sort to documents
pub fn apply_sort(docs: &mut [Value], sort: &[(String, i32)]) {
    if sort.is_empty() {
        return;
    }

    docs.sort_by(|a, b| {
        for (field, direction) in sort {
            let cmp = sort_order(get_path(a, field), get_path(b, field));
            if cmp != std::cmp::Ordering::Equal {
                return if *direction >= 0 { cmp } else { cmp.reverse() };
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn sort_order(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less, // missing < any value
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_values(x, y)
            .unwrap_or_else(|| type_priority(x).cmp(&type_priority(y))),
    }
}

/// Type priority for mixed-type sorting
fn type_priority(val: &Value) -> u8 {
    match val {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Apply skip, then limit (0 means no limit)
pub fn apply_limit_skip(docs: Vec<Value>, limit: Option<u64>, skip: Option<u64>) -> Vec<Value> {
    let skipped = docs.into_iter().skip(skip.unwrap_or(0) as usize);
    match limit {
        Some(n) if n > 0 => skipped.take(n as usize).collect(),
        _ => skipped.collect(),
    }
}
