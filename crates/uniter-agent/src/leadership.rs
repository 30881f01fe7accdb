//! Leadership tracking.
//!
//! A [`LeadershipTracker`] answers leadership questions with [`Ticket`]s:
//! futures that resolve once the answer is known. The state machine claims
//! leadership synchronously in the continue mode and otherwise waits on
//! tickets alongside its other event sources.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;

/// A pending leadership answer.
///
/// Resolves to `true` once the awaited condition holds. A ticket must not be
/// polled again after it has resolved.
pub struct Ticket(BoxFuture<'static, bool>);

impl Ticket {
    /// A ticket for an answer computed by `future`.
    pub fn new(future: impl Future<Output = bool> + Send + 'static) -> Self {
        Self(future.boxed())
    }

    /// A ticket that is already resolved.
    #[must_use]
    pub fn ready(answer: bool) -> Self {
        Self(futures::future::ready(answer).boxed())
    }
}

impl Future for Ticket {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        self.0.as_mut().poll(cx)
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ticket")
    }
}

/// Trait for the leadership tracker.
pub trait LeadershipTracker: Send + Sync {
    /// Try to become (or confirm being) the leader.
    fn claim_leader(&self) -> Ticket;

    /// Resolves once this unit is the leader.
    fn wait_leader(&self) -> Ticket;

    /// Resolves once this unit is not the leader.
    fn wait_minion(&self) -> Ticket;
}

/// A tracker whose answer is set by the hosting agent.
#[derive(Debug)]
pub struct LocalLeadershipTracker {
    leader: watch::Sender<bool>,
}

impl LocalLeadershipTracker {
    /// Create a tracker that starts with the given leadership.
    #[must_use]
    pub fn new(leader: bool) -> Self {
        let (tx, _) = watch::channel(leader);
        Self { leader: tx }
    }

    /// Change this unit's leadership.
    pub fn set_leader(&self, leader: bool) {
        let previous = self.leader.send_replace(leader);
        if previous != leader {
            tracing::info!(leader, "Leadership changed");
        }
    }

    /// Whether this unit is currently the leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }

    fn wait_for(&self, leader: bool) -> Ticket {
        let mut rx = self.leader.subscribe();
        Ticket::new(async move {
            let reached = rx.wait_for(|current| *current == leader).await.is_ok();
            if !reached {
                // The tracker is gone; the condition will never be observed.
                std::future::pending::<()>().await;
            }
            true
        })
    }
}

impl LeadershipTracker for LocalLeadershipTracker {
    fn claim_leader(&self) -> Ticket {
        Ticket::ready(self.is_leader())
    }

    fn wait_leader(&self) -> Ticket {
        self.wait_for(true)
    }

    fn wait_minion(&self) -> Ticket {
        self.wait_for(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn claim_reflects_current_leadership() {
        let tracker = LocalLeadershipTracker::new(false);
        assert!(!tracker.claim_leader().await);
        tracker.set_leader(true);
        assert!(tracker.claim_leader().await);
    }

    #[tokio::test]
    async fn wait_leader_resolves_on_election() {
        let tracker = LocalLeadershipTracker::new(false);
        let mut ticket = tracker.wait_leader();

        let pending = tokio::time::timeout(Duration::from_millis(20), &mut ticket).await;
        assert!(pending.is_err());

        tracker.set_leader(true);
        assert!(ticket.await);
    }

    #[tokio::test]
    async fn wait_minion_resolves_immediately_for_minions() {
        let tracker = LocalLeadershipTracker::new(false);
        assert!(tracker.wait_minion().await);
    }
}
