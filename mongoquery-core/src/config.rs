// mongoquery-core/src/config.rs
// Connection configuration: defaults, TOML loading, environment overrides

use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MongoQueryError, Result};

/// Deployment layout. Serialized as the integer used in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Deploy {
    /// One server (or one replica set behind a single DSN).
    #[default]
    Centralized,
    /// Several servers listed side by side, optionally split into masters and slaves.
    Distributed,
}

impl TryFrom<u8> for Deploy {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Deploy::Centralized),
            1 => Ok(Deploy::Distributed),
            other => Err(format!("deploy must be 0 or 1, got {}", other)),
        }
    }
}

impl From<Deploy> for u8 {
    fn from(deploy: Deploy) -> Self {
        match deploy {
            Deploy::Centralized => 0,
            Deploy::Distributed => 1,
        }
    }
}

/// How primary key values are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PkType {
    /// Driver-native ObjectId generated on insert.
    #[default]
    #[serde(alias = "ObjectID", alias = "objectid")]
    ObjectId,
    /// Caller supplies the key.
    #[serde(alias = "auto")]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    #[default]
    Array,
    Object,
}

/// Shape rows are materialized into by the driver cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeMap {
    pub root: TypeKind,
    pub document: TypeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server address, comma separated in distributed mode.
    pub hostname: String,
    pub hostport: String,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Full connection string; when set, host/port/credentials are not used.
    pub dsn: String,
    /// Driver URI options passed verbatim on connect.
    pub params: Map<String, Value>,
    pub is_replica_set: bool,
    /// Replica set name; the database name is used when empty.
    pub replica_set: String,
    pub pk: String,
    pub pk_type: PkType,
    pub prefix: String,
    pub debug: bool,
    pub deploy: Deploy,
    pub rw_separate: bool,
    pub master_num: usize,
    pub slave_no: Option<usize>,
    /// Expose `_id` ObjectIds as a string `id` field and accept `id` in filters.
    pub pk_convert_id: bool,
    pub type_map: TypeMap,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            hostport: "27017".to_string(),
            database: String::new(),
            username: String::new(),
            password: String::new(),
            dsn: String::new(),
            params: Map::new(),
            is_replica_set: false,
            replica_set: String::new(),
            pk: "_id".to_string(),
            pk_type: PkType::ObjectId,
            prefix: String::new(),
            debug: false,
            deploy: Deploy::Centralized,
            rw_separate: false,
            master_num: 1,
            slave_no: None,
            pk_convert_id: false,
            type_map: TypeMap::default(),
        }
    }
}

/// Split a comma separated config entry, trimming blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl ConnectionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| MongoQueryError::Config(e.to_string()))
    }

    /// Load from a TOML file, falling back to defaults when it does not exist,
    /// then apply `MONGOQUERY_*` environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut cfg = match fs::read_to_string(path.as_ref()) {
            Ok(s) => Self::from_toml_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        cfg.apply_env_overrides_with(|key| env::var(key).ok());
        Ok(cfg)
    }

    /// Apply overrides looked up through `lookup` (the process environment in production).
    pub fn apply_env_overrides_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MONGOQUERY_HOSTNAME") {
            self.hostname = v;
        }
        if let Some(v) = lookup("MONGOQUERY_HOSTPORT") {
            self.hostport = v;
        }
        if let Some(v) = lookup("MONGOQUERY_DATABASE") {
            self.database = v;
        }
        if let Some(v) = lookup("MONGOQUERY_USERNAME") {
            self.username = v;
        }
        if let Some(v) = lookup("MONGOQUERY_PASSWORD") {
            self.password = v;
        }
        if let Some(v) = lookup("MONGOQUERY_DSN") {
            self.dsn = v;
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        split_list(&self.hostname)
    }

    /// Primary key name as seen by callers.
    pub fn logical_pk(&self) -> &str {
        if self.pk_convert_id && self.pk == "_id" {
            "id"
        } else {
            &self.pk
        }
    }

    pub fn replica_set_name(&self) -> &str {
        if self.replica_set.is_empty() {
            &self.database
        } else {
            &self.replica_set
        }
    }

    pub fn validate(&self) -> Result<()> {
        let hosts = self.hosts();
        if hosts.is_empty() && split_list(&self.dsn).is_empty() {
            return Err(MongoQueryError::Config(
                "either hostname or dsn must be configured".into(),
            ));
        }
        if self.deploy == Deploy::Distributed {
            if self.master_num == 0 {
                return Err(MongoQueryError::Config("master_num must be at least 1".into()));
            }
            let count = hosts.len().max(split_list(&self.dsn).len());
            if let Some(slave) = self.slave_no {
                if slave >= count {
                    return Err(MongoQueryError::Config(format!(
                        "slave_no {} is outside the {} configured hosts",
                        slave, count
                    )));
                }
            }
            if self.rw_separate && self.slave_no.is_none() && count <= self.master_num {
                return Err(MongoQueryError::Config(format!(
                    "rw_separate needs more than master_num ({}) hosts, got {}",
                    self.master_num, count
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.pk, "_id");
        assert_eq!(cfg.master_num, 1);
        assert_eq!(cfg.deploy, Deploy::Centralized);
        assert_eq!(cfg.logical_pk(), "_id");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let cfg = ConnectionConfig::from_toml_str(
            r#"
            hostname = "10.0.0.1,10.0.0.2,10.0.0.3"
            hostport = "27017"
            database = "app"
            deploy = 1
            rw_separate = true
            master_num = 1
            pk_convert_id = true
            pk_type = "ObjectID"

            [type_map]
            root = "object"

            [params]
            connectTimeoutMS = 500
            "#,
        )
        .unwrap();

        assert_eq!(cfg.hosts().len(), 3);
        assert_eq!(cfg.deploy, Deploy::Distributed);
        assert!(cfg.rw_separate);
        assert_eq!(cfg.pk_type, PkType::ObjectId);
        assert_eq!(cfg.logical_pk(), "id");
        assert_eq!(cfg.type_map.root, TypeKind::Object);
        assert_eq!(cfg.type_map.document, TypeKind::Array);
        assert_eq!(cfg.params.get("connectTimeoutMS"), Some(&Value::from(500)));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_bad_deploy_value() {
        let err = ConnectionConfig::from_toml_str("deploy = 7").unwrap_err();
        assert!(matches!(err, MongoQueryError::Config(_)));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = ConnectionConfig::load_from_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.master_num, 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.toml");
        fs::write(&path, "database = \"shop\"\nprefix = \"t_\"\n").unwrap();
        let cfg = ConnectionConfig::load_from_path(&path).unwrap();
        assert_eq!(cfg.prefix, "t_");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> =
            HashMap::from([("MONGOQUERY_DATABASE", "other"), ("MONGOQUERY_HOSTPORT", "27018")]);
        let mut cfg = ConnectionConfig::default();
        cfg.apply_env_overrides_with(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.database, "other");
        assert_eq!(cfg.hostport, "27018");
        assert_eq!(cfg.hostname, "127.0.0.1");
    }

    #[test]
    fn test_validate_rejects_split_without_slaves() {
        let cfg = ConnectionConfig {
            hostname: "a,b".into(),
            deploy: Deploy::Distributed,
            rw_separate: true,
            master_num: 2,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(MongoQueryError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_slave_out_of_range() {
        let cfg = ConnectionConfig {
            hostname: "a,b".into(),
            deploy: Deploy::Distributed,
            rw_separate: true,
            slave_no: Some(5),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(MongoQueryError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_hosts() {
        let cfg = ConnectionConfig {
            hostname: " , ".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
