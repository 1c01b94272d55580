use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use embudo_core::CatalogSnapshot;
use embudo_db::repositories::{FieldRuleRepository, StageRepository, TransitionRepository};
use embudo_db::{FunnelStore, RepositoryError};

/// Read-through cache of stages, transitions and field rules.
///
/// Admin writes call [`CatalogCache::invalidate`]. A load that overlaps an
/// invalidation is returned to its caller but not cached, so the next read reloads.
pub struct CatalogCache {
    store: Arc<dyn FunnelStore>,
    current: RwLock<Option<Arc<CatalogSnapshot>>>,
    generation: AtomicU64,
}

impl CatalogCache {
    pub fn new(store: Arc<dyn FunnelStore>) -> Self {
        Self { store, current: RwLock::new(None), generation: AtomicU64::new(0) }
    }

    pub async fn snapshot(&self) -> Result<Arc<CatalogSnapshot>, RepositoryError> {
        if let Some(snapshot) = self.current.read().await.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let generation = self.generation.load(Ordering::Acquire);
        let snapshot = Arc::new(self.load().await?);

        let mut current = self.current.write().await;
        if self.generation.load(Ordering::Acquire) == generation {
            *current = Some(Arc::clone(&snapshot));
        }
        Ok(snapshot)
    }

    pub async fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.current.write().await = None;
        debug!(event_name = "catalog.cache.invalidated", "funnel catalog cache invalidated");
    }

    async fn load(&self) -> Result<CatalogSnapshot, RepositoryError> {
        let stages = self.store.list_stages(true).await?;
        let transitions = self.store.list_transitions(None, true).await?;
        let field_rules = self.store.list_field_rules(None).await?;
        debug!(
            event_name = "catalog.cache.loaded",
            stages = stages.len(),
            transitions = transitions.len(),
            field_rules = field_rules.len(),
            "funnel catalog loaded"
        );
        Ok(CatalogSnapshot::new(stages, transitions, field_rules))
    }
}
