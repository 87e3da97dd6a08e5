// mongoquery-core/src/topology.rs
// Endpoint selection across standalone, replica-set and distributed deployments,
// with one memoized link per endpoint slot.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{split_list, ConnectionConfig, Deploy};
use crate::driver::{Connector, Link};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployMode {
    Standalone,
    ReplicaSet,
    Distributed { rw_separate: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Read,
    Write,
}

/// One addressable connection target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointSlot {
    Standalone,
    ReplicaSet,
    Host(usize),
}

impl fmt::Display for EndpointSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointSlot::Standalone => f.write_str("standalone"),
            EndpointSlot::ReplicaSet => f.write_str("replica-set"),
            EndpointSlot::Host(i) => write!(f, "host#{}", i),
        }
    }
}

/// Connection string for one server, credentials included.
pub fn build_dsn(config: &ConnectionConfig) -> String {
    if !config.dsn.is_empty() {
        return config.dsn.clone();
    }
    let mut dsn = String::from("mongodb://");
    if !config.username.is_empty() {
        dsn.push_str(&config.username);
        if !config.password.is_empty() {
            dsn.push(':');
            dsn.push_str(&config.password);
        }
        dsn.push('@');
    }
    dsn.push_str(&config.hostname);
    if !config.hostport.is_empty() {
        dsn.push(':');
        dsn.push_str(&config.hostport);
    }
    dsn
}

/// Replica-set seed list. Every host uses the first configured port.
pub fn build_replica_set_dsn(config: &ConnectionConfig) -> String {
    let mut dsn = String::from("mongodb://");
    if !config.username.is_empty() {
        dsn.push_str(&config.username);
        if !config.password.is_empty() {
            dsn.push(':');
            dsn.push_str(&config.password);
        }
        dsn.push('@');
    }
    let ports = split_list(&config.hostport);
    let port = ports.first().map(String::as_str).unwrap_or("27017");
    let hosts: Vec<String> = config
        .hosts()
        .iter()
        .map(|h| format!("{}:{}", h, port))
        .collect();
    dsn.push_str(&hosts.join(","));
    dsn.push('/');
    dsn
}

/// Hide the password part of a connection string.
pub fn mask_dsn(dsn: &str) -> String {
    match Regex::new(r"://([^:@/]+):([^@]*)@") {
        Ok(re) => re.replace(dsn, "://$1:***@").into_owned(),
        Err(_) => dsn.to_string(),
    }
}

type SlotCell = Arc<Mutex<Option<Arc<dyn Link>>>>;

pub struct Topology {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    slots: DashMap<EndpointSlot, SlotCell>,
}

impl Topology {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            slots: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn mode(&self) -> DeployMode {
        match self.config.deploy {
            Deploy::Centralized if self.config.is_replica_set => DeployMode::ReplicaSet,
            Deploy::Centralized => DeployMode::Standalone,
            Deploy::Distributed => DeployMode::Distributed {
                rw_separate: self.config.rw_separate,
            },
        }
    }

    /// Number of configured servers in distributed mode.
    pub fn host_count(&self) -> usize {
        self.config
            .hosts()
            .len()
            .max(split_list(&self.config.dsn).len())
            .max(1)
    }

    pub fn select(&self, role: Role) -> EndpointSlot {
        self.select_with(role, &mut rand::thread_rng())
    }

    /// Pick the slot serving `role`; distributed draws come from `rng`.
    pub fn select_with<R: Rng + ?Sized>(&self, role: Role, rng: &mut R) -> EndpointSlot {
        let rw_separate = match self.mode() {
            DeployMode::Standalone => return EndpointSlot::Standalone,
            DeployMode::ReplicaSet => return EndpointSlot::ReplicaSet,
            DeployMode::Distributed { rw_separate } => rw_separate,
        };

        let count = self.host_count();
        if !rw_separate {
            return EndpointSlot::Host(rng.gen_range(0..count));
        }

        let masters = self.config.master_num.clamp(1, count);
        match role {
            Role::Write if self.config.is_replica_set => EndpointSlot::ReplicaSet,
            Role::Write => EndpointSlot::Host(rng.gen_range(0..masters)),
            Role::Read => match self.config.slave_no {
                Some(n) => EndpointSlot::Host(n.min(count - 1)),
                None if masters < count => EndpointSlot::Host(rng.gen_range(masters..count)),
                None => {
                    warn!(masters, count, "no slave configured, reading from a master");
                    EndpointSlot::Host(rng.gen_range(0..masters))
                }
            },
        }
    }

    /// True when the slot is served by a master (always true outside distributed mode).
    pub fn is_master(&self, slot: EndpointSlot) -> bool {
        match slot {
            EndpointSlot::Host(i) => i < self.config.master_num,
            _ => true,
        }
    }

    /// Connection settings for one host index; missing list entries fall back
    /// to the first one.
    pub fn slot_config(&self, index: usize) -> ConnectionConfig {
        let pick = |raw: &str| -> String {
            let list = split_list(raw);
            list.get(index)
                .or_else(|| list.first())
                .cloned()
                .unwrap_or_default()
        };
        ConnectionConfig {
            hostname: pick(&self.config.hostname),
            hostport: pick(&self.config.hostport),
            database: pick(&self.config.database),
            username: pick(&self.config.username),
            password: pick(&self.config.password),
            dsn: pick(&self.config.dsn),
            ..self.config.clone()
        }
    }

    pub fn database_for(&self, slot: EndpointSlot) -> String {
        match slot {
            EndpointSlot::Host(i) => self.slot_config(i).database,
            _ => self.config.database.clone(),
        }
    }

    fn connect_args(&self, slot: EndpointSlot) -> (String, Map<String, Value>) {
        let mut params = self.config.params.clone();
        match slot {
            EndpointSlot::Standalone => (build_dsn(&self.config), params),
            EndpointSlot::ReplicaSet => {
                params.insert(
                    "replicaSet".to_string(),
                    Value::from(self.config.replica_set_name()),
                );
                let dsn = if self.config.dsn.is_empty() {
                    build_replica_set_dsn(&self.config)
                } else {
                    self.config.dsn.clone()
                };
                (dsn, params)
            }
            EndpointSlot::Host(i) => (build_dsn(&self.slot_config(i)), params),
        }
    }

    /// Live link for `slot`, connecting on first use. A failed attempt leaves
    /// the slot empty and the driver error goes back to the caller unchanged.
    pub fn link(&self, slot: EndpointSlot) -> Result<Arc<dyn Link>> {
        // Clone the cell out so the map shard is unlocked while connecting;
        // only callers racing for this slot wait on the cell.
        let cell = self.slots.entry(slot).or_default().clone();
        let mut held = cell.lock();
        if let Some(link) = held.as_ref() {
            return Ok(link.clone());
        }

        let (dsn, params) = self.connect_args(slot);
        let started = Instant::now();
        let link = self.connector.connect(&dsn, &params)?;
        info!(
            %slot,
            dsn = %mask_dsn(&dsn),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "connected"
        );
        *held = Some(link.clone());
        Ok(link)
    }

    /// Select and connect in one step.
    pub fn endpoint(&self, role: Role) -> Result<(EndpointSlot, Arc<dyn Link>)> {
        let slot = self.select(role);
        debug!(%slot, ?role, "endpoint selected");
        Ok((slot, self.link(slot)?))
    }

    pub fn is_connected(&self, slot: EndpointSlot) -> bool {
        self.slots
            .get(&slot)
            .map_or(false, |cell| cell.lock().is_some())
    }

    /// Drop every memoized link.
    pub fn close(&self) {
        self.slots.clear();
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("mode", &self.mode())
            .field(
                "connected",
                &self.slots.iter().filter(|c| c.value().lock().is_some()).count(),
            )
            .finish()
    }
}
