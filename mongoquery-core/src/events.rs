// mongoquery-core/src/events.rs
// Lifecycle hooks around reads and writes

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::options::Options;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    BeforeSelect,
    BeforeFind,
    AfterInsert,
    AfterUpdate,
    AfterDelete,
}

/// Callback: receives the finalized record and, for `after_*` hooks, the
/// operation outcome. A non-empty return from a `before_*` hook replaces the
/// read result.
pub type HookFn = Arc<dyn Fn(&Options, Option<&Value>) -> Option<Value> + Send + Sync>;

fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Named hook registry
#[derive(Default)]
pub struct Events {
    hooks: RwLock<HashMap<Hook, Vec<HookFn>>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen<F>(&self, hook: Hook, callback: F)
    where
        F: Fn(&Options, Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .entry(hook)
            .or_default()
            .push(Arc::new(callback));
    }

    pub fn has(&self, hook: Hook) -> bool {
        self.hooks.read().get(&hook).map_or(false, |v| !v.is_empty())
    }

    /// Run callbacks in registration order; the first non-empty result is
    /// returned and the remaining callbacks are skipped.
    pub fn trigger(&self, hook: Hook, options: &Options, payload: Option<&Value>) -> Option<Value> {
        let callbacks: Vec<HookFn> = match self.hooks.read().get(&hook) {
            Some(list) => list.clone(),
            None => return None,
        };
        callbacks
            .iter()
            .filter_map(|cb| cb(options, payload))
            .find(|result| !is_empty_result(result))
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks = self.hooks.read();
        f.debug_map()
            .entries(hooks.iter().map(|(hook, list)| (hook, list.len())))
            .finish()
    }
}
