//! Storage attachments and storage hooks.

use std::collections::BTreeSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uniter_core::{HookInfo, HookKind, StorageTag};

use crate::error::{Result, UniterError};

/// Trait for the unit's storage attachments.
#[async_trait]
pub trait Storage: Send + Sync {
    /// The next storage hook, or `None` once the source is closed.
    async fn next_hook(&self) -> Option<HookInfo>;

    /// Reconcile the storage instances named in a change notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the attachments could not be refreshed.
    async fn update(&self, tags: &[StorageTag]) -> Result<()>;

    /// Record that `hook` ran.
    ///
    /// # Errors
    ///
    /// Returns an error if the attachment state could not be updated.
    async fn commit_hook(&self, hook: &HookInfo) -> Result<()>;
}

/// In-process storage attachments.
///
/// Every tag named in an update that is not yet attached gets a
/// storage-attached hook; attachment is recorded when that hook commits.
#[derive(Debug)]
pub struct LocalStorage {
    attached: Mutex<BTreeSet<StorageTag>>,
    pending: Mutex<BTreeSet<StorageTag>>,
    hook_tx: mpsc::Sender<HookInfo>,
    hook_rx: tokio::sync::Mutex<mpsc::Receiver<HookInfo>>,
}

impl LocalStorage {
    /// Create a storage tracker with a hook queue of `capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (hook_tx, hook_rx) = mpsc::channel(capacity);
        Self {
            attached: Mutex::new(BTreeSet::new()),
            pending: Mutex::new(BTreeSet::new()),
            hook_tx,
            hook_rx: tokio::sync::Mutex::new(hook_rx),
        }
    }

    /// Queue a storage-detaching hook for an attached instance.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::Storage` if `tag` is not attached.
    pub async fn detach(&self, tag: StorageTag) -> Result<()> {
        if !self.attached.lock().contains(&tag) {
            return Err(UniterError::Storage(format!("{tag} is not attached")));
        }
        self.hook_tx
            .send(HookInfo::storage(HookKind::StorageDetaching, tag))
            .await
            .map_err(|_| UniterError::EventsClosed("storage hook"))
    }

    /// The attached storage instances.
    #[must_use]
    pub fn attached(&self) -> Vec<StorageTag> {
        self.attached.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn next_hook(&self) -> Option<HookInfo> {
        self.hook_rx.lock().await.recv().await
    }

    async fn update(&self, tags: &[StorageTag]) -> Result<()> {
        let new: Vec<StorageTag> = {
            let attached = self.attached.lock();
            let mut pending = self.pending.lock();
            tags.iter()
                .filter(|tag| !attached.contains(*tag) && pending.insert((*tag).clone()))
                .cloned()
                .collect()
        };
        for tag in new {
            tracing::debug!(storage = %tag, "Queueing storage-attached hook");
            self.hook_tx
                .send(HookInfo::storage(HookKind::StorageAttached, tag))
                .await
                .map_err(|_| UniterError::EventsClosed("storage hook"))?;
        }
        Ok(())
    }

    async fn commit_hook(&self, hook: &HookInfo) -> Result<()> {
        let Some(tag) = &hook.storage_id else {
            return Ok(());
        };
        match hook.kind {
            HookKind::StorageAttached => {
                self.pending.lock().remove(tag);
                self.attached.lock().insert(tag.clone());
            }
            HookKind::StorageDetaching => {
                self.attached.lock().remove(tag);
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> StorageTag {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn update_queues_attach_once() {
        let storage = LocalStorage::new(8);
        storage.update(&[tag("data/0")]).await.unwrap();
        storage.update(&[tag("data/0")]).await.unwrap();

        let hook = storage.next_hook().await.unwrap();
        assert_eq!(hook, HookInfo::storage(HookKind::StorageAttached, tag("data/0")));
        storage.commit_hook(&hook).await.unwrap();
        assert_eq!(storage.attached(), vec![tag("data/0")]);

        storage.update(&[tag("data/0")]).await.unwrap();
        storage.detach(tag("data/0")).await.unwrap();
        let hook = storage.next_hook().await.unwrap();
        assert_eq!(hook.kind, HookKind::StorageDetaching);
        storage.commit_hook(&hook).await.unwrap();
        assert!(storage.attached().is_empty());
    }
}
