// mongoquery-core/src/matcher.rs
// Filter document evaluation used by the in-memory driver

use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Map, Value};

use crate::document::ObjectId;
use crate::error::{MongoQueryError, Result};

/// Field level operators
#[derive(Debug, Clone)]
pub enum FieldOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    All(Vec<Value>),
    Exists(bool),
    Type(String),
    Regex(Regex),
    Size(usize),
    Mod(f64, f64),
    Not(Vec<FieldOp>),
}

#[derive(Debug, Clone)]
enum FilterClause {
    Field(String, Vec<FieldOp>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    /// Exactly one branch matches.
    Xor(Vec<Filter>),
}

/// Parsed filter document. Every clause must hold.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<FilterClause>,
}

fn invalid(msg: impl Into<String>) -> MongoQueryError {
    MongoQueryError::InvalidQuery(msg.into())
}

/// Dot-notation lookup (`"address.city"`, `"items.0"`).
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$')) && !map.contains_key("$oid")
}

impl Filter {
    pub fn from_json(json: &Value) -> Result<Self> {
        let map = match json {
            Value::Object(map) => map,
            Value::Null => return Ok(Filter::default()),
            other => return Err(invalid(format!("filter must be a document, got {}", other))),
        };

        let mut clauses = Vec::new();
        for (key, value) in map {
            let clause = match key.as_str() {
                "$and" => FilterClause::And(Self::parse_branches(key, value)?),
                "$or" => FilterClause::Or(Self::parse_branches(key, value)?),
                "$nor" => FilterClause::Nor(Self::parse_branches(key, value)?),
                "$xor" => FilterClause::Xor(Self::parse_branches(key, value)?),
                "$where" => return Err(invalid("$where expressions are not evaluated in memory")),
                other if other.starts_with('$') => {
                    return Err(invalid(format!("Unknown logical operator: {}", other)))
                }
                field => FilterClause::Field(field.to_string(), Self::parse_field(value)?),
            };
            clauses.push(clause);
        }
        Ok(Filter { clauses })
    }

    fn parse_branches(op: &str, value: &Value) -> Result<Vec<Filter>> {
        match value {
            Value::Array(items) => items.iter().map(Filter::from_json).collect(),
            _ => Err(invalid(format!("{} requires array", op))),
        }
    }

    fn parse_field(value: &Value) -> Result<Vec<FieldOp>> {
        let map = match value {
            Value::Object(map) if is_operator_object(map) => map,
            other => return Ok(vec![FieldOp::Eq(other.clone())]),
        };

        let mut ops = Vec::new();
        for (op, operand) in map {
            let parsed = match op.as_str() {
                "$eq" => FieldOp::Eq(operand.clone()),
                "$ne" => FieldOp::Ne(operand.clone()),
                "$gt" => FieldOp::Gt(operand.clone()),
                "$gte" => FieldOp::Gte(operand.clone()),
                "$lt" => FieldOp::Lt(operand.clone()),
                "$lte" => FieldOp::Lte(operand.clone()),
                "$in" => FieldOp::In(Self::array_operand(op, operand)?),
                "$nin" => FieldOp::Nin(Self::array_operand(op, operand)?),
                "$all" => FieldOp::All(Self::array_operand(op, operand)?),
                "$exists" => FieldOp::Exists(match operand {
                    Value::Bool(b) => *b,
                    Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
                    _ => return Err(invalid("$exists requires bool")),
                }),
                "$type" => FieldOp::Type(match operand {
                    Value::String(s) => s.to_ascii_lowercase(),
                    other => other.to_string(),
                }),
                "$regex" => {
                    let pattern = operand
                        .as_str()
                        .ok_or_else(|| invalid("$regex requires string"))?;
                    let options = map.get("$options").and_then(Value::as_str).unwrap_or("");
                    let full = if options.contains('i') {
                        format!("(?i){}", pattern)
                    } else {
                        pattern.to_string()
                    };
                    FieldOp::Regex(Regex::new(&full).map_err(|e| invalid(e.to_string()))?)
                }
                "$options" => continue,
                "$size" => FieldOp::Size(
                    operand
                        .as_u64()
                        .ok_or_else(|| invalid("$size requires a non-negative integer"))?
                        as usize,
                ),
                "$mod" => match operand.as_array().map(Vec::as_slice) {
                    Some([divisor, remainder]) => match (divisor.as_f64(), remainder.as_f64()) {
                        (Some(d), Some(r)) if d != 0.0 => FieldOp::Mod(d, r),
                        _ => return Err(invalid("$mod requires [divisor, remainder]")),
                    },
                    _ => return Err(invalid("$mod requires [divisor, remainder]")),
                },
                "$not" => FieldOp::Not(Self::parse_field(operand)?),
                other => return Err(invalid(format!("Unknown operator: {}", other))),
            };
            ops.push(parsed);
        }
        Ok(ops)
    }

    fn array_operand(op: &str, operand: &Value) -> Result<Vec<Value>> {
        match operand {
            Value::Array(items) => Ok(items.clone()),
            _ => Err(invalid(format!("{} requires array", op))),
        }
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.clauses.iter().all(|clause| match clause {
            FilterClause::Field(field, ops) => {
                let value = get_path(doc, field);
                ops.iter().all(|op| matches_op(value, op))
            }
            FilterClause::And(branches) => branches.iter().all(|f| f.matches(doc)),
            FilterClause::Or(branches) => branches.iter().any(|f| f.matches(doc)),
            FilterClause::Nor(branches) => !branches.iter().any(|f| f.matches(doc)),
            FilterClause::Xor(branches) => branches.iter().filter(|f| f.matches(doc)).count() == 1,
        })
    }
}

fn equals(value: &Value, target: &Value) -> bool {
    if value == target {
        return true;
    }
    match (value, target) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(items), t) if !t.is_array() => items.iter().any(|v| equals(v, t)),
        _ => false,
    }
}

fn matches_op(value: Option<&Value>, op: &FieldOp) -> bool {
    match op {
        FieldOp::Eq(target) => match value {
            Some(v) => equals(v, target),
            None => target.is_null(),
        },
        FieldOp::Ne(target) => !matches_op(value, &FieldOp::Eq(target.clone())),
        FieldOp::Gt(target) => ordered(value, target, |o| o == Ordering::Greater),
        FieldOp::Gte(target) => ordered(value, target, |o| o != Ordering::Less),
        FieldOp::Lt(target) => ordered(value, target, |o| o == Ordering::Less),
        FieldOp::Lte(target) => ordered(value, target, |o| o != Ordering::Greater),
        FieldOp::In(targets) => targets
            .iter()
            .any(|t| matches_op(value, &FieldOp::Eq(t.clone()))),
        FieldOp::Nin(targets) => !targets
            .iter()
            .any(|t| matches_op(value, &FieldOp::Eq(t.clone()))),
        FieldOp::All(targets) => match value {
            Some(Value::Array(items)) => targets.iter().all(|t| items.iter().any(|v| equals(v, t))),
            _ => false,
        },
        FieldOp::Exists(should_exist) => value.is_some() == *should_exist,
        FieldOp::Type(name) => value.map_or(false, |v| type_name(v) == name.as_str()),
        FieldOp::Regex(re) => match value {
            Some(Value::String(s)) => re.is_match(s),
            Some(Value::Array(items)) => items
                .iter()
                .any(|v| v.as_str().map_or(false, |s| re.is_match(s))),
            _ => false,
        },
        FieldOp::Size(n) => matches!(value, Some(Value::Array(items)) if items.len() == *n),
        FieldOp::Mod(divisor, remainder) => value
            .and_then(Value::as_f64)
            .map_or(false, |v| (v % divisor).trunc() == *remainder),
        FieldOp::Not(ops) => !ops.iter().all(|inner| matches_op(value, inner)),
    }
}

fn ordered<F>(value: Option<&Value>, target: &Value, accept: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    match value {
        Some(Value::Array(items)) if !target.is_array() => items
            .iter()
            .any(|v| compare_values(v, target).map_or(false, &accept)),
        Some(v) => compare_values(v, target).map_or(false, accept),
        None => false,
    }
}

/// Ordering between two values of the same kind; `None` when they are not comparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (ObjectId::from_value(a), ObjectId::from_value(b)) {
        return Some(x.cmp(&y));
    }
    match (a, b) {
        (Value::Number(n1), Value::Number(n2)) => n1.as_f64()?.partial_cmp(&n2.as_f64()?),
        (Value::String(s1), Value::String(s2)) => Some(s1.cmp(s2)),
        (Value::Bool(b1), Value::Bool(b2)) => Some(b1.cmp(b2)),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    if ObjectId::from_value(value).is_some() {
        return "objectid";
    }
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
