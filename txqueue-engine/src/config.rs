use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::core::{IdGenerator, QueueConfig, TransactionalQueueManager, UuidGenerator};
use crate::persistence::{PersistenceConfig, QueuePersistenceStrategy};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub persistence: PersistenceConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Configured persistence strategy, not yet opened
    pub fn build_strategy(&self, ids: Arc<dyn IdGenerator>) -> Arc<dyn QueuePersistenceStrategy> {
        self.persistence.build_strategy(ids)
    }

    /// Manager over the configured strategy with random identifiers.
    /// Call `start` before use.
    pub fn build_manager(&self) -> Arc<TransactionalQueueManager> {
        let strategy = self.build_strategy(Arc::new(UuidGenerator));
        Arc::new(TransactionalQueueManager::new(strategy, self.queue.clone()))
    }
}
