// mongoquery-core/src/aggregation.rs
// Aggregation pipeline evaluated by the in-memory driver

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::{MongoQueryError, Result};
use crate::find_options::apply_sort;
use crate::matcher::{compare_values, get_path, Filter};

/// Aggregation pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

/// Pipeline stage
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Filter),
    Project(ProjectStage),
    Group(GroupStage),
    Sort(Vec<(String, i32)>),
    Limit(usize),
    Skip(usize),
}

/// $project stage - reshape documents
#[derive(Debug, Clone)]
pub struct ProjectStage {
    fields: Vec<(String, ProjectField)>,
}

#[derive(Debug, Clone)]
pub enum ProjectField {
    Include,          // 1
    Exclude,          // 0
    Rename(String),   // "$fieldName"
    Literal(Value),
}

/// $group stage - group documents and compute aggregates
#[derive(Debug, Clone)]
pub struct GroupStage {
    id: GroupId,
    accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone)]
pub enum GroupId {
    Null,                          // one group for everything
    Field(String),                 // "$city"
    Fields(Vec<(String, String)>), // {"city": "$city", "kind": "$kind"}
}

#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(SumExpression),
    Avg(String),
    Min(String),
    Max(String),
    First(String),
    Last(String),
}

#[derive(Debug, Clone)]
pub enum SumExpression {
    Constant(f64), // {"$sum": 1} counts
    Field(String), // {"$sum": "$amount"}
}

fn agg_error(msg: impl Into<String>) -> MongoQueryError {
    MongoQueryError::InvalidQuery(msg.into())
}

fn field_ref(op: &str, value: &Value) -> Result<String> {
    match value.as_str() {
        Some(s) if s.starts_with('$') => Ok(s.trim_start_matches('$').to_string()),
        _ => Err(agg_error(format!("{} must be a field reference", op))),
    }
}

fn single_entry<'a>(what: &str, value: &'a Value) -> Result<(&'a String, &'a Value)> {
    match value {
        Value::Object(obj) if obj.len() == 1 => obj
            .iter()
            .next()
            .ok_or_else(|| agg_error(format!("{} must have exactly one operator", what))),
        _ => Err(agg_error(format!("{} must have exactly one operator", what))),
    }
}

impl Pipeline {
    /// Create pipeline from JSON array
    pub fn from_json(pipeline_json: &Value) -> Result<Self> {
        match pipeline_json {
            Value::Array(stages) => Ok(Pipeline {
                stages: stages.iter().map(Stage::from_json).collect::<Result<_>>()?,
            }),
            _ => Err(agg_error("Pipeline must be an array")),
        }
    }

    pub fn execute(&self, mut docs: Vec<Value>) -> Result<Vec<Value>> {
        for stage in &self.stages {
            docs = stage.execute(docs)?;
        }
        Ok(docs)
    }
}

impl Stage {
    fn from_json(stage_json: &Value) -> Result<Self> {
        let (name, spec) = single_entry("Stage", stage_json)?;
        match name.as_str() {
            "$match" => Ok(Stage::Match(Filter::from_json(spec)?)),
            "$project" => Ok(Stage::Project(ProjectStage::from_json(spec)?)),
            "$group" => Ok(Stage::Group(GroupStage::from_json(spec)?)),
            "$sort" => match spec {
                Value::Object(obj) => obj
                    .iter()
                    .map(|(field, dir)| match dir.as_i64() {
                        Some(d @ (1 | -1)) => Ok((field.clone(), d as i32)),
                        _ => Err(agg_error("Sort direction must be 1 or -1")),
                    })
                    .collect::<Result<_>>()
                    .map(Stage::Sort),
                _ => Err(agg_error("$sort must be an object")),
            },
            "$limit" => spec
                .as_u64()
                .map(|n| Stage::Limit(n as usize))
                .ok_or_else(|| agg_error("$limit must be a positive number")),
            "$skip" => spec
                .as_u64()
                .map(|n| Stage::Skip(n as usize))
                .ok_or_else(|| agg_error("$skip must be a positive number")),
            other => Err(agg_error(format!("Unknown pipeline stage: {}", other))),
        }
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        match self {
            Stage::Match(filter) => Ok(docs.into_iter().filter(|d| filter.matches(d)).collect()),
            Stage::Project(stage) => Ok(docs.iter().map(|d| stage.project_document(d)).collect()),
            Stage::Group(stage) => stage.execute(docs),
            Stage::Sort(fields) => {
                let mut docs = docs;
                apply_sort(&mut docs, fields);
                Ok(docs)
            }
            Stage::Limit(n) => Ok(docs.into_iter().take(*n).collect()),
            Stage::Skip(n) => Ok(docs.into_iter().skip(*n).collect()),
        }
    }
}

impl ProjectStage {
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| agg_error("$project must be an object"))?;
        let fields = obj
            .iter()
            .map(|(field, value)| {
                let action = match value {
                    Value::Bool(true) => ProjectField::Include,
                    Value::Bool(false) => ProjectField::Exclude,
                    Value::Number(n) if n.as_f64() == Some(0.0) => ProjectField::Exclude,
                    Value::Number(_) => ProjectField::Include,
                    Value::String(s) if s.starts_with('$') => ProjectField::Rename(s[1..].to_string()),
                    other => ProjectField::Literal(other.clone()),
                };
                (field.clone(), action)
            })
            .collect();
        Ok(ProjectStage { fields })
    }

    pub fn project_document(&self, doc: &Value) -> Value {
        let obj = match doc {
            Value::Object(obj) => obj,
            other => return other.clone(),
        };

        // Only exclusions: copy everything else
        let include_mode = self
            .fields
            .iter()
            .any(|(_, a)| !matches!(a, ProjectField::Exclude));

        let action_for = |field: &str| self.fields.iter().find(|(f, _)| f == field).map(|(_, a)| a);
        let mut result = Map::new();

        if include_mode {
            if !matches!(action_for("_id"), Some(ProjectField::Exclude)) {
                if let Some(id) = obj.get("_id") {
                    result.insert("_id".to_string(), id.clone());
                }
            }
            for (field, action) in &self.fields {
                match action {
                    ProjectField::Include => {
                        if let Some(value) = get_path(doc, field) {
                            result.insert(field.clone(), value.clone());
                        }
                    }
                    ProjectField::Rename(source) => {
                        if let Some(value) = get_path(doc, source) {
                            result.insert(field.clone(), value.clone());
                        }
                    }
                    ProjectField::Literal(value) => {
                        result.insert(field.clone(), value.clone());
                    }
                    ProjectField::Exclude => {}
                }
            }
        } else {
            for (field, value) in obj {
                if !matches!(action_for(field), Some(ProjectField::Exclude)) {
                    result.insert(field.clone(), value.clone());
                }
            }
        }

        Value::Object(result)
    }
}

impl GroupStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| agg_error("$group must be an object"))?;

        let id = match obj.get("_id") {
            Some(Value::Null) => GroupId::Null,
            Some(v @ Value::String(_)) => GroupId::Field(field_ref("Group _id", v)?),
            Some(Value::Object(parts)) => GroupId::Fields(
                parts
                    .iter()
                    .map(|(name, v)| Ok((name.clone(), field_ref("Group _id", v)?)))
                    .collect::<Result<_>>()?,
            ),
            Some(_) => return Err(agg_error("Group _id must be null, a field reference or a document")),
            None => return Err(agg_error("Group stage must have _id field")),
        };

        let accumulators = obj
            .iter()
            .filter(|(field, _)| field.as_str() != "_id")
            .map(|(field, value)| Ok((field.clone(), Accumulator::from_json(value)?)))
            .collect::<Result<_>>()?;

        Ok(GroupStage { id, accumulators })
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        // Groups keep first-seen order
        let mut groups: IndexMap<String, (Value, Vec<Value>)> = IndexMap::new();
        for doc in docs {
            let key = self.group_key(&doc);
            let slot = serde_json::to_string(&key)?;
            groups.entry(slot).or_insert_with(|| (key, Vec::new())).1.push(doc);
        }

        groups
            .into_values()
            .map(|(key, group_docs)| {
                let mut result = Map::new();
                result.insert("_id".to_string(), key);
                for (field, accumulator) in &self.accumulators {
                    result.insert(field.clone(), accumulator.compute(&group_docs));
                }
                Ok(Value::Object(result))
            })
            .collect()
    }

    fn group_key(&self, doc: &Value) -> Value {
        match &self.id {
            GroupId::Null => Value::Null,
            GroupId::Field(field) => get_path(doc, field).cloned().unwrap_or(Value::Null),
            GroupId::Fields(parts) => Value::Object(
                parts
                    .iter()
                    .map(|(name, path)| {
                        (name.clone(), get_path(doc, path).cloned().unwrap_or(Value::Null))
                    })
                    .collect(),
            ),
        }
    }
}

fn numbers<'a>(docs: &'a [Value], field: &'a str) -> impl Iterator<Item = f64> + 'a {
    docs.iter()
        .filter_map(move |doc| get_path(doc, field).and_then(Value::as_f64))
}

/// Integral results stay integers.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

impl Accumulator {
    fn from_json(spec: &Value) -> Result<Self> {
        let (op, value) = single_entry("Accumulator", spec)?;
        match op.as_str() {
            "$sum" => match value {
                Value::Number(n) => Ok(Accumulator::Sum(SumExpression::Constant(
                    n.as_f64().unwrap_or(0.0),
                ))),
                other => Ok(Accumulator::Sum(SumExpression::Field(field_ref(op, other)?))),
            },
            "$avg" => Ok(Accumulator::Avg(field_ref(op, value)?)),
            "$min" => Ok(Accumulator::Min(field_ref(op, value)?)),
            "$max" => Ok(Accumulator::Max(field_ref(op, value)?)),
            "$first" => Ok(Accumulator::First(field_ref(op, value)?)),
            "$last" => Ok(Accumulator::Last(field_ref(op, value)?)),
            _ => Err(agg_error(format!("Unknown accumulator: {}", op))),
        }
    }

    fn compute(&self, docs: &[Value]) -> Value {
        match self {
            Accumulator::Sum(SumExpression::Constant(n)) => number_value(n * docs.len() as f64),
            Accumulator::Sum(SumExpression::Field(field)) => number_value(numbers(docs, field).sum()),
            Accumulator::Avg(field) => {
                let (sum, count) = numbers(docs, field).fold((0.0, 0usize), |(s, c), n| (s + n, c + 1));
                if count > 0 {
                    Value::from(sum / count as f64)
                } else {
                    Value::Null
                }
            }
            Accumulator::Min(field) => extreme(docs, field, std::cmp::Ordering::Less),
            Accumulator::Max(field) => extreme(docs, field, std::cmp::Ordering::Greater),
            Accumulator::First(field) => docs
                .first()
                .and_then(|doc| get_path(doc, field))
                .cloned()
                .unwrap_or(Value::Null),
            Accumulator::Last(field) => docs
                .last()
                .and_then(|doc| get_path(doc, field))
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

fn extreme(docs: &[Value], field: &str, wanted: std::cmp::Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for value in docs.iter().filter_map(|doc| get_path(doc, field)) {
        if value.is_null() {
            continue;
        }
        best = match best {
            Some(current) if compare_values(value, current) != Some(wanted) => Some(current),
            _ => Some(value),
        };
    }
    best.cloned().unwrap_or(Value::Null)
}
