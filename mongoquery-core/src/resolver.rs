// mongoquery-core/src/resolver.rs
// Table name and primary key resolution

use crate::config::{ConnectionConfig, PkType};

/// Supplies defaults the option record does not carry itself.
pub trait TableResolver: Send + Sync {
    /// Physical table for a logical name.
    fn table_name(&self, name: &str) -> String;

    /// Primary key field as callers see it.
    fn primary_key(&self, table: &str) -> String;

    fn pk_type(&self, table: &str) -> PkType;
}

/// Prefix + snake_case naming with one primary key for every table.
#[derive(Debug, Clone)]
pub struct PrefixResolver {
    prefix: String,
    pk: String,
    pk_type: PkType,
}

impl PrefixResolver {
    pub fn new(prefix: impl Into<String>, pk: impl Into<String>, pk_type: PkType) -> Self {
        Self {
            prefix: prefix.into(),
            pk: pk.into(),
            pk_type,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(&config.prefix, config.logical_pk(), config.pk_type)
    }
}

/// `UserOrder` → `user_order`
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

impl TableResolver for PrefixResolver {
    fn table_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, snake_case(name))
    }

    fn primary_key(&self, _table: &str) -> String {
        self.pk.clone()
    }

    fn pk_type(&self, _table: &str) -> PkType {
        self.pk_type
    }
}
