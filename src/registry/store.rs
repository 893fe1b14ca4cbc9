//! Source registry implementation
//!
//! The central map from [`StreamKey`] to live [`Source`]. Publishers and
//! players both go through [`SourceRegistry::fetch_or_create`], so whichever
//! arrives first creates the source.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::config::RegistryConfig;
use super::error::RegistryError;
use super::key::StreamKey;
use crate::protocol::request::Request;
use crate::server::config::VhostConfig;
use crate::source::Source;

/// Central registry for all live sources
///
/// Lookups of existing sources take only the read lock.
pub struct SourceRegistry {
    sources: RwLock<HashMap<StreamKey, Arc<Source>>>,
    config: RegistryConfig,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Source for the stream named by `request`, created with `vhost`
    /// settings if it does not exist yet.
    pub async fn fetch_or_create(
        &self,
        request: &Request,
        vhost: &VhostConfig,
    ) -> Result<Arc<Source>, RegistryError> {
        let key = request.stream_key();

        if let Some(source) = self.sources.read().await.get(&key) {
            return Ok(Arc::clone(source));
        }

        let mut sources = self.sources.write().await;
        // Another task may have created it between the two locks
        if let Some(source) = sources.get(&key) {
            return Ok(Arc::clone(source));
        }

        let limit = self.config.max_sources;
        if limit > 0 && sources.len() >= limit {
            tracing::warn!(stream = %key, limit = limit, "Refusing new source, limit reached");
            return Err(RegistryError::SourceLimitReached { limit });
        }

        let source = Arc::new(Source::new(key.clone(), vhost.clone()));
        sources.insert(key.clone(), Arc::clone(&source));

        tracing::info!(stream = %key, sources = sources.len(), "Source created");
        Ok(source)
    }

    pub async fn get(&self, key: &StreamKey) -> Option<Arc<Source>> {
        self.sources.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sources.read().await.is_empty()
    }

    /// Remove sources that have been idle longer than the cleanup delay.
    ///
    /// Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let delay = self.config.source_cleanup_delay;
        let mut sources = self.sources.write().await;

        let expired: Vec<StreamKey> = sources
            .iter()
            // A session that fetched a source holds it until it attaches or leaves
            .filter(|(_, source)| Arc::strong_count(source) == 1 && source.is_expired(delay))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            sources.remove(key);
            tracing::info!(stream = %key, "Source removed by cleanup");
        }
        expired.len()
    }

    /// Spawn background cleanup task
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.cleanup().await;
            }
        })
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
