use crate::config::Config;
use parking_lot::RwLock;
use std::sync::Arc;

/// Single owner of the live configuration. Readers take an `Arc` snapshot;
/// `publish` swaps the whole value at once.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(cfg: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(cfg))),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.inner.read().clone()
    }

    /// Replaces the live config. Callers must pass a fully validated value.
    pub fn publish(&self, cfg: Config) {
        *self.inner.write() = Arc::new(cfg);
    }
}
