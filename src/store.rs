//! Config Store (C1) — durable ordered map of `StrategyConfig`, keyed by
//! name, with a single JSON file as the backing store (§4.1).

use std::path::PathBuf;

use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::StrategyConfig;
use crate::error::ConfigError;
use crate::mirror::{MirrorEvent, RemoteMirror};

pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<IndexMap<String, StrategyConfig>>,
    mirror: RemoteMirror,
}

impl ConfigStore {
    /// Load the store from `path`, creating an empty one if the file does
    /// not exist yet. A corrupt file is a `StoreUnavailable` (fatal at
    /// startup per §7).
    pub async fn open(path: PathBuf, mirror: RemoteMirror) -> Result<Self, ConfigError> {
        let inner = if path.exists() {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| ConfigError::StoreUnavailable(e.to_string()))?;
            let list: Vec<StrategyConfig> = serde_json::from_slice(&bytes)
                .map_err(|e| ConfigError::StoreUnavailable(format!("corrupt config store: {e}")))?;
            let mut map = IndexMap::new();
            for cfg in list {
                map.insert(cfg.name.clone(), cfg);
            }
            map
        } else {
            IndexMap::new()
        };

        Ok(Self {
            path,
            inner: RwLock::new(inner),
            mirror,
        })
    }

    pub async fn load_all(&self) -> Vec<StrategyConfig> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<StrategyConfig> {
        self.inner.read().await.get(name).cloned()
    }

    /// Insert or replace a row by `name`, then persist the whole map
    /// atomically (write to a temp file, then rename).
    pub async fn upsert(&self, mut cfg: StrategyConfig) -> Result<StrategyConfig, ConfigError> {
        cfg.validate()?;
        cfg.updated_at = Utc::now();

        let mut guard = self.inner.write().await;
        if let Some(existing) = guard.get(&cfg.name) {
            cfg.created_at = existing.created_at;
        } else {
            cfg.created_at = cfg.updated_at;
        }
        guard.insert(cfg.name.clone(), cfg.clone());
        self.persist(&guard).await?;
        drop(guard);

        self.mirror.send(MirrorEvent::ConfigUpserted(cfg.clone()));
        Ok(cfg)
    }

    pub async fn delete(&self, name: &str) -> Result<(), ConfigError> {
        let mut guard = self.inner.write().await;
        if guard.shift_remove(name).is_none() {
            return Err(ConfigError::UnknownStrategy(name.to_string()));
        }
        self.persist(&guard).await?;
        drop(guard);

        self.mirror.send(MirrorEvent::ConfigDeleted(name.to_string()));
        Ok(())
    }

    async fn persist(
        &self,
        map: &IndexMap<String, StrategyConfig>,
    ) -> Result<(), ConfigError> {
        let list: Vec<&StrategyConfig> = map.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)
            .map_err(|e| ConfigError::StoreUnavailable(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ConfigError::StoreUnavailable(e.to_string()))?;
            }
        }
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ConfigError::StoreUnavailable(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ConfigError::StoreUnavailable(e.to_string()))?;

        info!(path = %self.path.display(), rows = list.len(), "config store persisted");
        Ok(())
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .finish()
    }
}
