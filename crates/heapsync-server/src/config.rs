//! Server configuration.

use anyhow::{bail, Context, Result};
use heapsync_core::HeapOptions;
use std::path::PathBuf;
use uuid::Uuid;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server unique identifier
    pub server_id: Option<Uuid>,

    /// Delivery configuration
    pub delivery: DeliveryConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Heaps hosted besides the status heap
    pub heaps: Vec<String>,
}

/// Delivery configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// MQTT broker URL
    pub mqtt_broker: String,

    /// Tenant identifier
    pub tenant: String,

    /// Per-subscriber queue length
    pub queue_capacity: usize,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Persistence type: "sqlite" or "memory"
    pub store_type: StoreType,

    /// Database path (for SQLite)
    pub db_path: PathBuf,

    /// Compact a heap's log after this many updates; `None` disables
    pub compact_every: Option<usize>,
}

/// Where heap logs live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    /// One `SQLite` database for every heap
    Sqlite,
    /// Nothing survives a restart
    Memory,
}

impl std::str::FromStr for StoreType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "sqlite" => Ok(StoreType::Sqlite),
            "memory" => Ok(StoreType::Memory),
            other => bail!("unknown store type '{other}' (expected sqlite or memory)"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: None,
            delivery: DeliveryConfig {
                mqtt_broker: "tcp://localhost:1883".to_string(),
                tenant: "default".to_string(),
                queue_capacity: heapsync_core::shared::DEFAULT_QUEUE_CAPACITY,
            },
            persistence: PersistenceConfig {
                store_type: StoreType::Sqlite,
                db_path: PathBuf::from("./heapsync.db"),
                compact_every: Some(256),
            },
            heaps: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `HEAPSYNC_SERVER_ID`: Server UUID
    /// - `HEAPSYNC_MQTT_BROKER`: MQTT broker URL
    /// - `HEAPSYNC_TENANT`: Tenant identifier
    /// - `HEAPSYNC_STORE_TYPE`: "sqlite" or "memory"
    /// - `HEAPSYNC_DB_PATH`: SQLite database path
    /// - `HEAPSYNC_QUEUE_CAPACITY`: Per-subscriber queue length
    /// - `HEAPSYNC_COMPACT_EVERY`: Updates between compactions, 0 disables
    /// - `HEAPSYNC_HEAPS`: JSON array of heap ids
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = lookup("HEAPSYNC_SERVER_ID") {
            config.server_id = Some(Uuid::parse_str(&id).context("Invalid HEAPSYNC_SERVER_ID")?);
        }

        if let Some(mqtt) = lookup("HEAPSYNC_MQTT_BROKER") {
            config.delivery.mqtt_broker = mqtt;
        }

        if let Some(tenant) = lookup("HEAPSYNC_TENANT") {
            config.delivery.tenant = tenant;
        }

        if let Some(store_type) = lookup("HEAPSYNC_STORE_TYPE") {
            config.persistence.store_type =
                store_type.parse().context("Invalid HEAPSYNC_STORE_TYPE")?;
        }

        if let Some(db_path) = lookup("HEAPSYNC_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(capacity) = lookup("HEAPSYNC_QUEUE_CAPACITY") {
            config.delivery.queue_capacity = capacity
                .parse()
                .context("Invalid HEAPSYNC_QUEUE_CAPACITY")?;
        }

        if let Some(every) = lookup("HEAPSYNC_COMPACT_EVERY") {
            let every: usize = every.parse().context("Invalid HEAPSYNC_COMPACT_EVERY")?;
            config.persistence.compact_every = (every > 0).then_some(every);
        }

        if let Some(heaps_json) = lookup("HEAPSYNC_HEAPS") {
            config.heaps =
                serde_json::from_str(&heaps_json).context("Invalid HEAPSYNC_HEAPS JSON")?;
        }

        Ok(config)
    }

    /// Options applied to every hosted heap.
    #[must_use]
    pub fn heap_options(&self) -> HeapOptions {
        HeapOptions {
            queue_capacity: self.delivery.queue_capacity,
            compact_every: self.persistence.compact_every,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.delivery.mqtt_broker, "tcp://localhost:1883");
        assert_eq!(config.delivery.tenant, "default");
        assert_eq!(config.delivery.queue_capacity, 64);
        assert_eq!(config.persistence.store_type, StoreType::Sqlite);
        assert_eq!(config.persistence.compact_every, Some(256));
        assert!(config.heaps.is_empty());
    }

    #[test]
    fn overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HEAPSYNC_TENANT", "plant-7"),
            ("HEAPSYNC_STORE_TYPE", "memory"),
            ("HEAPSYNC_COMPACT_EVERY", "0"),
            ("HEAPSYNC_QUEUE_CAPACITY", "8"),
            ("HEAPSYNC_HEAPS", r#"["orders", "inventory"]"#),
        ]))
        .unwrap();

        assert_eq!(config.delivery.tenant, "plant-7");
        assert_eq!(config.persistence.store_type, StoreType::Memory);
        assert_eq!(config.persistence.compact_every, None);
        assert_eq!(config.heaps, ["orders", "inventory"]);
        assert_eq!(config.heap_options().queue_capacity, 8);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(ServerConfig::from_lookup(lookup(&[("HEAPSYNC_STORE_TYPE", "redis")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("HEAPSYNC_HEAPS", "orders")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("HEAPSYNC_SERVER_ID", "x")])).is_err());
    }
}
