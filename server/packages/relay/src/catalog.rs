use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;
use utoipa::ToSchema;

use edge_relay_error::RelayError;

use crate::runtime::AgentRuntime;
use crate::tools::{ResourceDescriptor, ToolDescriptor};

/// Point-in-time snapshot of the runtime's tools and resources.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CatalogSnapshot {
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
}

/// Caches the runtime's tool/resource listing for the life of the process.
/// A failed fetch surfaces as `CatalogUnavailable` and leaves the cache
/// unpopulated, so a later call may still succeed; tools rarely change at
/// runtime, so staleness is acceptable and there is no invalidation.
pub struct ToolCatalog {
    runtime: Arc<dyn AgentRuntime>,
    cached: OnceCell<CatalogSnapshot>,
}

impl ToolCatalog {
    pub fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            runtime,
            cached: OnceCell::new(),
        }
    }

    pub async fn list(&self) -> Result<CatalogSnapshot, RelayError> {
        self.cached
            .get_or_try_init(|| async {
                let tools = self.runtime.list_tools().await.map_err(|err| {
                    RelayError::CatalogUnavailable {
                        message: err.to_string(),
                    }
                })?;
                let resources = self.runtime.list_resources().await.map_err(|err| {
                    RelayError::CatalogUnavailable {
                        message: err.to_string(),
                    }
                })?;
                Ok(CatalogSnapshot { tools, resources })
            })
            .await
            .map(|snapshot| snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn listing_is_fetched_once_and_cached() {
        let runtime = Arc::new(MockRuntime::new());
        let fetches = runtime.catalog_fetches();
        let catalog = ToolCatalog::new(runtime);

        let first = catalog.list().await.expect("catalog");
        let second = catalog.list().await.expect("catalog");
        assert_eq!(first.tools.len(), second.tools.len());
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_reported_and_not_cached() {
        let runtime = Arc::new(MockRuntime::without_catalog());
        let catalog = ToolCatalog::new(runtime);

        let err = catalog.list().await.unwrap_err();
        assert!(matches!(err, RelayError::CatalogUnavailable { .. }));

        // Still unavailable on retry; the failure was not cached as a result.
        let err = catalog.list().await.unwrap_err();
        assert!(matches!(err, RelayError::CatalogUnavailable { .. }));
    }
}
