//! Event sources consumed by the state machine.
//!
//! [`channel`] returns a linked [`EventSender`] (for whatever observes the
//! controller) and [`EventSource`] (owned by the state machine). Three
//! shapes of stream are provided:
//!
//! - **Latest-value slots** (resolved, upgrade): only the newest value is
//!   kept and it is only delivered while the state machine wants it.
//! - **Notifications** (config, meter status, leader settings): repeated
//!   changes coalesce into a single pending event that can be discarded.
//! - **Queues** (relations, storage, actions): bounded, delivered in order.
//!
//! Every `EventSource` receive method borrows `&self` and is cancel-safe, so
//! the mode loops can race them in one `tokio::select!` and drop the losers.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uniter_core::{ActionId, CharmUrl, RelationId, StorageTag};

use crate::error::{Result, UniterError};

/// How the operator asked for a failed hook to be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResolvedMode {
    /// Run the failed hook again.
    RetryHooks,
    /// Mark the failed hook as done without running it.
    NoHooks,
    /// A mode this agent does not understand.
    Unknown(String),
}

impl ResolvedMode {
    /// The mode's wire name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::RetryHooks => "retry-hooks",
            Self::NoHooks => "no-hooks",
            Self::Unknown(other) => other,
        }
    }
}

impl FromStr for ResolvedMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "retry-hooks" => Self::RetryHooks,
            "no-hooks" => Self::NoHooks,
            other => Self::Unknown(other.to_string()),
        })
    }
}

impl fmt::Display for ResolvedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ResolvedMode {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(mode) => mode,
            Err(never) => match never {},
        }
    }
}

impl From<ResolvedMode> for String {
    fn from(mode: ResolvedMode) -> Self {
        mode.as_str().to_string()
    }
}

/// A request to run a different charm revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    /// The charm to upgrade to.
    pub charm_url: CharmUrl,
    /// Whether the upgrade may proceed while the unit is in an error state.
    #[serde(default)]
    pub force: bool,
}

/// A latest-value cell shared by the sender and the source.
type Slot<T> = Arc<watch::Sender<Option<T>>>;

fn slot<T>() -> Slot<T> {
    Arc::new(watch::channel(None).0)
}

/// Wait until `take` extracts a value from `slot`.
///
/// `take` runs synchronously, so a value is only removed by the call that
/// returns it.
async fn wait_slot<T, R>(slot: &Slot<T>, mut take: impl FnMut(&mut Option<T>) -> Option<R>) -> R {
    let mut rx = slot.subscribe();
    loop {
        let mut taken = None;
        slot.send_if_modified(|value| {
            taken = take(value);
            taken.is_some()
        });
        if let Some(taken) = taken {
            return taken;
        }
        // The sender half lives in `slot` itself, so this never fails.
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Create a linked event sender and source.
///
/// `capacity` bounds each queued stream.
#[must_use]
pub fn channel(capacity: usize) -> (EventSender, EventSource) {
    let (relations_tx, relations_rx) = mpsc::channel(capacity);
    let (storage_tx, storage_rx) = mpsc::channel(capacity);
    let (actions_tx, actions_rx) = mpsc::channel(capacity);
    let (dying, _) = watch::channel(false);
    let dying = Arc::new(dying);

    let resolved = slot();
    let upgrade = slot();
    let config = slot();
    let meter_status = slot();
    let leader_settings = slot();

    let sender = EventSender {
        resolved: Arc::clone(&resolved),
        upgrade: Arc::clone(&upgrade),
        config: Arc::clone(&config),
        meter_status: Arc::clone(&meter_status),
        leader_settings: Arc::clone(&leader_settings),
        relations: relations_tx,
        storage: storage_tx,
        actions: actions_tx,
        dying: Arc::clone(&dying),
    };
    let source = EventSource {
        resolved,
        want_resolved: AtomicBool::new(false),
        upgrade,
        want_upgrade: AtomicBool::new(false),
        must_force_upgrade: AtomicBool::new(false),
        charm: Mutex::new(None),
        config,
        meter_status,
        leader_settings,
        want_leader_settings: AtomicBool::new(true),
        relations: tokio::sync::Mutex::new(relations_rx),
        storage: tokio::sync::Mutex::new(storage_rx),
        actions: tokio::sync::Mutex::new(actions_rx),
        dying,
    };
    (sender, source)
}

/// Publishes events to an [`EventSource`].
#[derive(Debug, Clone)]
pub struct EventSender {
    resolved: Slot<ResolvedMode>,
    upgrade: Slot<UpgradeRequest>,
    config: Slot<()>,
    meter_status: Slot<()>,
    leader_settings: Slot<()>,
    relations: mpsc::Sender<Vec<RelationId>>,
    storage: mpsc::Sender<Vec<StorageTag>>,
    actions: mpsc::Sender<ActionId>,
    dying: Arc<watch::Sender<bool>>,
}

impl EventSender {
    /// The operator resolved the unit's error state.
    pub fn resolve(&self, mode: ResolvedMode) {
        self.resolved.send_replace(Some(mode));
    }

    /// A new charm revision is available.
    pub fn request_upgrade(&self, charm_url: CharmUrl, force: bool) {
        self.upgrade
            .send_replace(Some(UpgradeRequest { charm_url, force }));
    }

    /// The application configuration changed.
    pub fn config_changed(&self) {
        self.config.send_replace(Some(()));
    }

    /// The unit's meter status changed.
    pub fn meter_status_changed(&self) {
        self.meter_status.send_replace(Some(()));
    }

    /// The leader published new settings.
    pub fn leader_settings_changed(&self) {
        self.leader_settings.send_replace(Some(()));
    }

    /// The unit started dying. Cannot be undone.
    pub fn set_dying(&self) {
        self.dying.send_replace(true);
    }

    /// Relations changed.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::EventsClosed` if the source was dropped.
    pub async fn relations_changed(&self, ids: Vec<RelationId>) -> Result<()> {
        self.relations
            .send(ids)
            .await
            .map_err(|_| UniterError::EventsClosed("relations"))
    }

    /// Storage attachments changed.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::EventsClosed` if the source was dropped.
    pub async fn storage_changed(&self, tags: Vec<StorageTag>) -> Result<()> {
        self.storage
            .send(tags)
            .await
            .map_err(|_| UniterError::EventsClosed("storage"))
    }

    /// An action was queued for the unit.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::EventsClosed` if the source was dropped.
    pub async fn enqueue_action(&self, id: ActionId) -> Result<()> {
        self.actions
            .send(id)
            .await
            .map_err(|_| UniterError::EventsClosed("actions"))
    }
}

/// The state machine's view of every event stream.
#[derive(Debug)]
pub struct EventSource {
    resolved: Slot<ResolvedMode>,
    want_resolved: AtomicBool,
    upgrade: Slot<UpgradeRequest>,
    want_upgrade: AtomicBool,
    must_force_upgrade: AtomicBool,
    charm: Mutex<Option<CharmUrl>>,
    config: Slot<()>,
    meter_status: Slot<()>,
    leader_settings: Slot<()>,
    want_leader_settings: AtomicBool,
    relations: tokio::sync::Mutex<mpsc::Receiver<Vec<RelationId>>>,
    storage: tokio::sync::Mutex<mpsc::Receiver<Vec<StorageTag>>>,
    actions: tokio::sync::Mutex<mpsc::Receiver<ActionId>>,
    dying: Arc<watch::Sender<bool>>,
}

impl EventSource {
    /// Deliver the next resolved event. One delivery per call to this method.
    pub fn want_resolved_event(&self) {
        self.want_resolved.store(true, Ordering::SeqCst);
    }

    /// The next resolved event, once wanted.
    pub async fn resolved_event(&self) -> ResolvedMode {
        wait_slot(&self.resolved, |value| {
            if !self.want_resolved.load(Ordering::SeqCst) {
                return None;
            }
            let mode = value.take()?;
            self.want_resolved.store(false, Ordering::SeqCst);
            Some(mode)
        })
        .await
    }

    /// Offer upgrade events; if `must_force`, only forced upgrades.
    pub fn want_upgrade_event(&self, must_force: bool) {
        self.want_upgrade.store(true, Ordering::SeqCst);
        self.must_force_upgrade.store(must_force, Ordering::SeqCst);
    }

    /// Record the charm now deployed, so requests for it are not offered.
    pub fn set_charm(&self, charm_url: CharmUrl) {
        *self.charm.lock() = Some(charm_url);
        // Re-evaluate waiting callers against the new charm.
        self.upgrade.send_modify(|_| {});
    }

    /// The charm last recorded with [`EventSource::set_charm`].
    #[must_use]
    pub fn charm(&self) -> Option<CharmUrl> {
        self.charm.lock().clone()
    }

    /// The next upgrade to a charm other than the deployed one.
    ///
    /// The request stays current after delivery; recording the new charm
    /// with [`EventSource::set_charm`] is what retires it.
    pub async fn upgrade_event(&self) -> CharmUrl {
        wait_slot(&self.upgrade, |value| {
            let request = value.as_ref()?;
            if !self.want_upgrade.load(Ordering::SeqCst) {
                return None;
            }
            if self.must_force_upgrade.load(Ordering::SeqCst) && !request.force {
                return None;
            }
            if self.charm.lock().as_ref() == Some(&request.charm_url) {
                return None;
            }
            Some(request.charm_url.clone())
        })
        .await
    }

    /// The next config change.
    pub async fn config_event(&self) {
        wait_slot(&self.config, Option::take).await;
    }

    /// Drop any pending config change.
    pub fn discard_config_event(&self) {
        self.config.send_replace(None);
    }

    /// The next meter status change.
    pub async fn meter_status_event(&self) {
        wait_slot(&self.meter_status, Option::take).await;
    }

    /// Offer or suppress leader-settings events. Suppressing drops any
    /// pending event.
    pub fn want_leader_settings_events(&self, want: bool) {
        self.want_leader_settings.store(want, Ordering::SeqCst);
        if want {
            self.leader_settings.send_modify(|_| {});
        } else {
            self.discard_leader_settings_event();
        }
    }

    /// The next leader settings change, while wanted.
    pub async fn leader_settings_event(&self) {
        wait_slot(&self.leader_settings, |value| {
            if self.want_leader_settings.load(Ordering::SeqCst) {
                value.take()
            } else {
                None
            }
        })
        .await;
    }

    /// Drop any pending leader settings change.
    pub fn discard_leader_settings_event(&self) {
        self.leader_settings.send_replace(None);
    }

    /// The next relations change. `None` once every sender is gone.
    pub async fn next_relations(&self) -> Option<Vec<RelationId>> {
        self.relations.lock().await.recv().await
    }

    /// The next storage change. `None` once every sender is gone.
    pub async fn next_storage(&self) -> Option<Vec<StorageTag>> {
        self.storage.lock().await.recv().await
    }

    /// The next queued action. `None` once every sender is gone.
    pub async fn next_action(&self) -> Option<ActionId> {
        self.actions.lock().await.recv().await
    }

    /// Whether the unit is dying.
    #[must_use]
    pub fn is_dying(&self) -> bool {
        *self.dying.borrow()
    }

    /// Resolves once the unit is dying.
    pub async fn unit_dying(&self) {
        let mut rx = self.dying.subscribe();
        let _ = rx.wait_for(|dying| *dying).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn never<F: std::future::Future>(future: F) -> bool {
        tokio::time::timeout(Duration::from_millis(20), future)
            .await
            .is_err()
    }

    fn url(s: &str) -> CharmUrl {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn resolved_is_latest_value_and_gated() {
        let (tx, events) = channel(4);
        tx.resolve(ResolvedMode::NoHooks);
        tx.resolve(ResolvedMode::RetryHooks);
        assert!(never(events.resolved_event()).await);

        events.want_resolved_event();
        assert_eq!(events.resolved_event().await, ResolvedMode::RetryHooks);

        events.want_resolved_event();
        assert!(never(events.resolved_event()).await);
    }

    #[tokio::test]
    async fn resolved_wakes_waiter() {
        let (tx, events) = channel(4);
        events.want_resolved_event();
        let (mode, ()) = tokio::join!(events.resolved_event(), async {
            tokio::task::yield_now().await;
            tx.resolve(ResolvedMode::NoHooks);
        });
        assert_eq!(mode, ResolvedMode::NoHooks);
    }

    #[tokio::test]
    async fn upgrade_respects_force_and_current_charm() {
        let (tx, events) = channel(4);
        events.set_charm(url("cs:foo-3"));
        tx.request_upgrade(url("cs:foo-3"), true);

        events.want_upgrade_event(false);
        assert!(never(events.upgrade_event()).await);

        tx.request_upgrade(url("cs:foo-4"), false);
        events.want_upgrade_event(true);
        assert!(never(events.upgrade_event()).await);

        events.want_upgrade_event(false);
        assert_eq!(events.upgrade_event().await, url("cs:foo-4"));

        events.set_charm(url("cs:foo-4"));
        assert!(never(events.upgrade_event()).await);
    }

    #[tokio::test]
    async fn notifications_coalesce_and_discard() {
        let (tx, events) = channel(4);
        tx.config_changed();
        tx.config_changed();
        events.config_event().await;
        assert!(never(events.config_event()).await);

        tx.meter_status_changed();
        events.meter_status_event().await;

        tx.config_changed();
        events.discard_config_event();
        assert!(never(events.config_event()).await);
    }

    #[tokio::test]
    async fn leader_settings_follow_want_flag() {
        let (tx, events) = channel(4);
        events.want_leader_settings_events(false);
        tx.leader_settings_changed();
        assert!(never(events.leader_settings_event()).await);

        events.want_leader_settings_events(true);
        tx.leader_settings_changed();
        events.leader_settings_event().await;
    }

    #[tokio::test]
    async fn queues_preserve_order() {
        let (tx, events) = channel(4);
        let first = ActionId::generate();
        let second = ActionId::generate();
        tx.enqueue_action(first).await.unwrap();
        tx.enqueue_action(second).await.unwrap();
        tx.relations_changed(vec![RelationId::new(1)]).await.unwrap();

        assert_eq!(events.next_action().await, Some(first));
        assert_eq!(events.next_action().await, Some(second));
        assert_eq!(events.next_relations().await, Some(vec![RelationId::new(1)]));

        drop(tx);
        assert_eq!(events.next_storage().await, None);
    }

    #[tokio::test]
    async fn dying_is_latched() {
        let (tx, events) = channel(4);
        assert!(!events.is_dying());
        tx.set_dying();
        events.unit_dying().await;
        assert!(events.is_dying());
    }

    #[test]
    fn resolved_mode_names() {
        assert_eq!("retry-hooks".parse::<ResolvedMode>().unwrap(), ResolvedMode::RetryHooks);
        assert_eq!(
            "sideways".parse::<ResolvedMode>().unwrap(),
            ResolvedMode::Unknown("sideways".into())
        );
        let json = serde_json::to_string(&ResolvedMode::NoHooks).unwrap();
        assert_eq!(json, "\"no-hooks\"");
    }
}
