//! Relation membership and relation hooks.
//!
//! The [`Relations`] collaborator owns the unit's relations and the queue of
//! relation hooks they generate. Hooks are only offered between
//! [`Relations::start_hooks`] and [`Relations::stop_hooks`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uniter_core::{HookInfo, HookKind, RelationId};

use crate::error::{Result, UniterError};

/// Trait for the unit's relations.
#[async_trait]
pub trait Relations: Send + Sync {
    /// The name of relation `id`, e.g. `db`.
    ///
    /// # Errors
    ///
    /// Returns an error if the relation is unknown.
    async fn name(&self, id: RelationId) -> Result<String>;

    /// Begin offering relation hooks.
    fn start_hooks(&self);

    /// Stop offering relation hooks.
    ///
    /// # Errors
    ///
    /// Returns an error if the hook source could not be stopped cleanly.
    async fn stop_hooks(&self) -> Result<()>;

    /// The next relation hook. Pends while hooks are stopped and returns
    /// `None` once the source is closed.
    async fn next_hook(&self) -> Option<HookInfo>;

    /// Begin departing every relation because the unit is dying. Once
    /// dying, the hook source offers relation-broken for each remaining
    /// relation until it is committed. Calling this again has no effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the relations could not be updated.
    async fn set_dying(&self) -> Result<()>;

    /// Returns true once the unit has left every relation.
    fn is_empty(&self) -> bool;

    /// Reconcile the relations named in a change notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the relations could not be refreshed.
    async fn update(&self, ids: &[RelationId]) -> Result<()>;

    /// Record that `hook` ran.
    ///
    /// # Errors
    ///
    /// Returns an error if the relation state could not be updated.
    async fn commit_hook(&self, hook: &HookInfo) -> Result<()>;
}

/// In-process relations fed by the hosting agent.
///
/// Relations are added with [`LocalRelations::join`] and hooks are queued
/// with [`LocalRelations::push_hook`]. Relation-broken hooks for a dying
/// unit are generated on demand rather than queued.
#[derive(Debug)]
pub struct LocalRelations {
    relations: Mutex<BTreeMap<RelationId, String>>,
    started: watch::Sender<bool>,
    dying: watch::Sender<bool>,
    hook_tx: mpsc::Sender<HookInfo>,
    hook_rx: tokio::sync::Mutex<mpsc::Receiver<HookInfo>>,
}

impl LocalRelations {
    /// Create an empty relation set with a hook queue of `capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (hook_tx, hook_rx) = mpsc::channel(capacity);
        let (started, _) = watch::channel(false);
        let (dying, _) = watch::channel(false);
        Self {
            relations: Mutex::new(BTreeMap::new()),
            started,
            dying,
            hook_tx,
            hook_rx: tokio::sync::Mutex::new(hook_rx),
        }
    }

    /// Enter relation `id` under `name`.
    pub fn join(&self, id: RelationId, name: impl Into<String>) {
        let name = name.into();
        tracing::info!(relation_id = %id, relation = %name, "Joined relation");
        self.relations.lock().insert(id, name);
    }

    /// Queue a relation hook.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::Relations` if the hook names an unknown relation,
    /// or `UniterError::EventsClosed` if the queue is closed.
    pub async fn push_hook(&self, hook: HookInfo) -> Result<()> {
        hook.validate()?;
        let id = hook.relation_id.ok_or_else(|| {
            UniterError::Relations(format!("{} is not a relation hook", hook.kind))
        })?;
        if !self.relations.lock().contains_key(&id) {
            return Err(UniterError::Relations(format!("unknown relation {id}")));
        }
        self.hook_tx
            .send(hook)
            .await
            .map_err(|_| UniterError::EventsClosed("relation hook"))
    }

    /// Relation-broken for the lowest remaining relation, if the unit is
    /// dying.
    fn next_broken(&self) -> Option<HookInfo> {
        if !*self.dying.borrow() {
            return None;
        }
        let id = self.relations.lock().keys().next().copied()?;
        Some(HookInfo::relation(HookKind::RelationBroken, id, None))
    }

    /// The relations the unit is currently in.
    #[must_use]
    pub fn ids(&self) -> Vec<RelationId> {
        self.relations.lock().keys().copied().collect()
    }
}

#[async_trait]
impl Relations for LocalRelations {
    async fn name(&self, id: RelationId) -> Result<String> {
        self.relations
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| UniterError::Relations(format!("unknown relation {id}")))
    }

    fn start_hooks(&self) {
        self.started.send_replace(true);
    }

    async fn stop_hooks(&self) -> Result<()> {
        self.started.send_replace(false);
        Ok(())
    }

    async fn next_hook(&self) -> Option<HookInfo> {
        let mut started = self.started.subscribe();
        if started.wait_for(|on| *on).await.is_err() {
            return None;
        }
        let mut dying = self.dying.subscribe();
        loop {
            if let Some(hook) = self.next_broken() {
                return Some(hook);
            }
            let mut rx = self.hook_rx.lock().await;
            tokio::select! {
                hook = rx.recv() => {
                    let hook = hook?;
                    let joined = hook
                        .relation_id
                        .is_some_and(|id| self.relations.lock().contains_key(&id));
                    if joined {
                        return Some(hook);
                    }
                    tracing::debug!(hook = %hook.kind, "Dropping hook for departed relation");
                }
                changed = dying.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn set_dying(&self) -> Result<()> {
        let already = self.dying.send_replace(true);
        if !already {
            for id in self.ids() {
                tracing::info!(relation_id = %id, "Departing relation");
            }
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.relations.lock().is_empty()
    }

    async fn update(&self, ids: &[RelationId]) -> Result<()> {
        let relations = self.relations.lock();
        for id in ids {
            if !relations.contains_key(id) {
                tracing::warn!(
                    relation_id = %id,
                    "Change for a relation this unit has not joined"
                );
            }
        }
        Ok(())
    }

    async fn commit_hook(&self, hook: &HookInfo) -> Result<()> {
        if hook.kind == HookKind::RelationBroken {
            if let Some(id) = hook.relation_id {
                self.relations.lock().remove(&id);
                tracing::info!(relation_id = %id, "Left relation");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn hooks_wait_for_start() {
        let relations = LocalRelations::new(8);
        relations.join(RelationId::new(1), "db");
        let hook = HookInfo::relation(HookKind::RelationJoined, RelationId::new(1), Some("mysql/0"));
        relations.push_hook(hook.clone()).await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(20), relations.next_hook()).await;
        assert!(pending.is_err());

        relations.start_hooks();
        assert_eq!(relations.next_hook().await, Some(hook));
    }

    #[tokio::test]
    async fn rejects_hooks_for_unknown_relations() {
        let relations = LocalRelations::new(8);
        let hook = HookInfo::relation(HookKind::RelationChanged, RelationId::new(9), None);
        assert!(relations.push_hook(hook).await.is_err());
        assert!(relations.name(RelationId::new(9)).await.is_err());
    }

    #[tokio::test]
    async fn dying_breaks_every_relation() {
        let relations = LocalRelations::new(8);
        relations.join(RelationId::new(0), "db");
        relations.join(RelationId::new(4), "cache");
        relations.set_dying().await.unwrap();
        relations.start_hooks();

        while !relations.is_empty() {
            let hook = relations.next_hook().await.unwrap();
            assert_eq!(hook.kind, HookKind::RelationBroken);
            relations.commit_hook(&hook).await.unwrap();
        }
        assert!(relations.ids().is_empty());
    }

    #[tokio::test]
    async fn dying_does_not_wait_for_queue_space() {
        let relations = LocalRelations::new(2);
        for id in 0..3 {
            relations.join(RelationId::new(id), "db");
        }
        for _ in 0..2 {
            let hook =
                HookInfo::relation(HookKind::RelationChanged, RelationId::new(0), Some("mysql/0"));
            relations.push_hook(hook).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), relations.set_dying())
            .await
            .expect("set_dying returns with a full queue")
            .unwrap();
        relations.start_hooks();

        let mut broken = Vec::new();
        while !relations.is_empty() {
            let hook = relations.next_hook().await.unwrap();
            assert_eq!(hook.kind, HookKind::RelationBroken);
            broken.extend(hook.relation_id);
            relations.commit_hook(&hook).await.unwrap();
        }
        assert_eq!(broken, (0..3).map(RelationId::new).collect::<Vec<_>>());

        // Queued hooks for departed relations are not offered.
        let leftover = tokio::time::timeout(Duration::from_millis(20), relations.next_hook()).await;
        assert!(leftover.is_err());
    }

    #[tokio::test]
    async fn repeated_dying_offers_each_relation_once() {
        let relations = LocalRelations::new(8);
        relations.join(RelationId::new(2), "db");
        relations.set_dying().await.unwrap();
        relations.set_dying().await.unwrap();
        relations.start_hooks();

        let hook = relations.next_hook().await.unwrap();
        assert_eq!(hook.relation_id, Some(RelationId::new(2)));
        // An uncommitted relation-broken is offered again.
        assert_eq!(relations.next_hook().await, Some(hook.clone()));
        relations.commit_hook(&hook).await.unwrap();
        assert!(relations.is_empty());

        let pending = tokio::time::timeout(Duration::from_millis(20), relations.next_hook()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn dying_wakes_a_waiting_hook_source() {
        let relations = std::sync::Arc::new(LocalRelations::new(8));
        relations.join(RelationId::new(1), "db");
        relations.start_hooks();

        let waiting = {
            let relations = std::sync::Arc::clone(&relations);
            tokio::spawn(async move { relations.next_hook().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        relations.set_dying().await.unwrap();

        let hook = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("hook offered")
            .unwrap()
            .unwrap();
        assert_eq!(hook.kind, HookKind::RelationBroken);
    }
}
