//! Registry configuration

use std::time::Duration;

/// How the registry sweeps idle sources
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often the cleanup task runs
    pub cleanup_interval: Duration,
    /// How long a source must sit with no publisher and no consumers
    /// before it is removed
    pub source_cleanup_delay: Duration,
    /// Upper bound on live sources, 0 for unlimited
    pub max_sources: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(3),
            source_cleanup_delay: Duration::from_secs(30),
            max_sources: 0,
        }
    }
}

impl RegistryConfig {
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn source_cleanup_delay(mut self, delay: Duration) -> Self {
        self.source_cleanup_delay = delay;
        self
    }

    pub fn max_sources(mut self, max: usize) -> Self {
        self.max_sources = max;
        self
    }
}
