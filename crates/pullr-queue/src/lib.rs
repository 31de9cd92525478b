//! Job queue drivers for pullr.
//!
//! Provides queue implementations with manual acknowledgement:
//! - PostgreSQL (production, `SKIP LOCKED` claims plus `LISTEN`/`NOTIFY`)
//! - In-process memory queue (tests and local runs)
//!
//! Drivers are looked up by name in a [`QueueRegistry`] once at startup.

pub mod memory;
pub mod postgres;
pub mod retry;

pub use memory::MemoryQueue;
pub use postgres::PostgresQueue;
pub use pullr_core::queue::{Envelope, Listener, Queue};
pub use retry::connect_with_retry;

use futures::future::BoxFuture;
use pullr_config::QueueConfig;
use pullr_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Constructor for a queue driver.
pub type QueueConstructor =
    Box<dyn Fn(QueueConfig) -> BoxFuture<'static, Result<Arc<dyn Queue>>> + Send + Sync>;

/// Maps driver names to constructors.
pub struct QueueRegistry {
    drivers: BTreeMap<String, QueueConstructor>,
}

impl QueueRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            drivers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, constructor: QueueConstructor) {
        self.drivers.insert(name.into(), constructor);
    }

    /// Registered driver names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.drivers.keys().map(|k| k.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    /// Connect using the driver named in `config`.
    pub async fn connect(&self, config: &QueueConfig) -> Result<Arc<dyn Queue>> {
        let constructor = self.drivers.get(&config.driver).ok_or_else(|| {
            Error::Unsupported(format!(
                "queue driver '{}' (available: {})",
                config.driver,
                self.names().join(", ")
            ))
        })?;
        constructor(config.clone()).await
    }
}

impl Default for QueueRegistry {
    /// The built-in drivers.
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(
            "postgres",
            Box::new(|config| {
                Box::pin(async move {
                    let queue = PostgresQueue::connect(&config).await?;
                    Ok(Arc::new(queue) as Arc<dyn Queue>)
                })
            }),
        );
        registry.register(
            "memory",
            Box::new(|_config| {
                Box::pin(async move { Ok(Arc::new(MemoryQueue::new()) as Arc<dyn Queue>) })
            }),
        );
        registry
    }
}
