/// Shared launcher metadata with change notification.
///
/// Writers call [`MetadataCache::store`]; the dispatch loop holds a
/// [`MetadataListener`] and is woken on every change. A pending change can be
/// discarded with [`MetadataListener::reset_notification`] when the loop is
/// about to refresh the domain anyway.
use std::sync::Arc;
use tokio::sync::watch;

use crate::domain::DomainMetadata;

#[derive(Clone)]
pub struct MetadataCache {
    tx: Arc<watch::Sender<DomainMetadata>>,
}

impl MetadataCache {
    pub fn new(initial: DomainMetadata) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn load(&self) -> DomainMetadata {
        self.tx.borrow().clone()
    }

    /// Applies `update` and notifies every listener.
    pub fn store(&self, update: impl FnOnce(&mut DomainMetadata)) {
        self.tx.send_modify(update);
    }

    pub fn listen(&self) -> MetadataListener {
        MetadataListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(DomainMetadata::default())
    }
}

pub struct MetadataListener {
    rx: watch::Receiver<DomainMetadata>,
}

impl MetadataListener {
    /// Waits for the next change. Returns `false` once the cache is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Marks the current value as seen, dropping any pending notification.
    pub fn reset_notification(&mut self) {
        let _ = self.rx.borrow_and_update();
    }

    /// Returns the current value and marks it as seen.
    pub fn current(&mut self) -> DomainMetadata {
        self.rx.borrow_and_update().clone()
    }
}
