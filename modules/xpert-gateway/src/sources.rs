//! Source Registry.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::{GatewayError, GatewayResult};
use crate::jsonstore::JsonStore;
use crate::models::{CreateSourceRequest, SubscriptionSource};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SourcesFile {
    sources: Vec<SubscriptionSource>,
}

pub struct SourceRegistry {
    store: JsonStore<SourcesFile>,
}

impl SourceRegistry {
    pub async fn load(path: impl AsRef<Path>) -> Self {
        Self {
            store: JsonStore::load(path).await,
        }
    }

    pub async fn list(&self) -> Vec<SubscriptionSource> {
        self.store.read(|f| f.sources.clone()).await
    }

    pub async fn list_enabled(&self) -> Vec<SubscriptionSource> {
        self.store
            .read(|f| f.sources.iter().filter(|s| s.enabled).cloned().collect())
            .await
    }

    pub async fn add(&self, req: CreateSourceRequest) -> GatewayResult<SubscriptionSource> {
        self.store
            .modify(|f| {
                let next_id = f.sources.iter().map(|s| s.id).max().unwrap_or(0) + 1;
                let source = SubscriptionSource {
                    id: next_id,
                    name: req.name,
                    url: req.url,
                    enabled: req.enabled,
                    priority: req.priority,
                    last_fetched: None,
                    last_config_count: 0,
                    last_success_rate: 0.0,
                };
                f.sources.push(source.clone());
                source
            })
            .await
            .map_err(GatewayError::from)
    }

    /// Returns the deleted source's id, used by the caller to cascade-delete
    /// its `AggregatedConfig` children.
    pub async fn delete(&self, id: i64) -> GatewayResult<()> {
        let existed = self
            .store
            .modify(|f| {
                let before = f.sources.len();
                f.sources.retain(|s| s.id != id);
                before != f.sources.len()
            })
            .await?;
        if existed {
            Ok(())
        } else {
            Err(GatewayError::NotFound(format!("source {id}")))
        }
    }

    pub async fn toggle(&self, id: i64) -> GatewayResult<SubscriptionSource> {
        self.store
            .modify(|f| {
                f.sources
                    .iter_mut()
                    .find(|s| s.id == id)
                    .map(|s| {
                        s.enabled = !s.enabled;
                        s.clone()
                    })
            })
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("source {id}")))
    }

    /// Success rate is hard-coded to 100 on any accepted config rather than
    /// a true active/total ratio. Preserved deliberately, not a bug.
    pub async fn update_metadata(&self, id: i64, config_count: i64) -> GatewayResult<()> {
        self.store
            .modify(|f| {
                if let Some(s) = f.sources.iter_mut().find(|s| s.id == id) {
                    s.last_fetched = Some(Utc::now());
                    s.last_config_count = config_count;
                    s.last_success_rate = if config_count > 0 { 100.0 } else { 0.0 };
                    true
                } else {
                    false
                }
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_registry() -> (SourceRegistry, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("sources-test-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let path = dir.join("sources.json");
        (SourceRegistry::load(&path).await, path)
    }

    #[tokio::test]
    async fn add_assigns_monotone_ids() {
        let (registry, _path) = temp_registry().await;
        let a = registry
            .add(CreateSourceRequest {
                name: "a".into(),
                url: "http://a".into(),
                priority: 0,
                enabled: true,
            })
            .await
            .unwrap();
        let b = registry
            .add(CreateSourceRequest {
                name: "b".into(),
                url: "http://b".into(),
                priority: 0,
                enabled: true,
            })
            .await
            .unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[tokio::test]
    async fn delete_nonexistent_is_not_found() {
        let (registry, _path) = temp_registry().await;
        assert!(matches!(
            registry.delete(999).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn id_after_delete_may_be_reused_when_list_is_empty() {
        let (registry, _path) = temp_registry().await;
        let a = registry
            .add(CreateSourceRequest {
                name: "a".into(),
                url: "http://a".into(),
                priority: 0,
                enabled: true,
            })
            .await
            .unwrap();
        registry.delete(a.id).await.unwrap();
        let b = registry
            .add(CreateSourceRequest {
                name: "b".into(),
                url: "http://b".into(),
                priority: 0,
                enabled: true,
            })
            .await
            .unwrap();
        assert_eq!(b.id, 1);
    }
}
