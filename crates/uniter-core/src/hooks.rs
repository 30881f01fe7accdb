//! Hook vocabulary.
//!
//! A hook is a named lifecycle callback invoked on the workload. [`HookKind`]
//! is the closed set of hooks the agent knows how to schedule, and
//! [`HookInfo`] is the immutable descriptor that identifies one invocation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::ids::{RelationId, StorageTag};

/// The kinds of hook the agent can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookKind {
    /// First hook run after the charm is deployed.
    Install,
    /// Run once after the first config-changed.
    Start,
    /// Application configuration changed.
    ConfigChanged,
    /// A new charm revision was deployed.
    UpgradeCharm,
    /// Last hook run before the unit is removed.
    Stop,
    /// Periodic metrics collection.
    CollectMetrics,
    /// The unit's meter status changed.
    MeterStatusChanged,
    /// This unit became the application leader.
    LeaderElected,
    /// This unit stopped being the application leader.
    LeaderDeposed,
    /// The leader published new settings.
    LeaderSettingsChanged,
    /// Periodic status refresh.
    UpdateStatus,
    /// A remote unit joined a relation.
    RelationJoined,
    /// A remote unit changed its relation settings.
    RelationChanged,
    /// A remote unit left a relation.
    RelationDeparted,
    /// The relation is going away.
    RelationBroken,
    /// A storage instance was attached.
    StorageAttached,
    /// A storage instance is about to be detached.
    StorageDetaching,
}

impl HookKind {
    /// All hook kinds, in declaration order.
    pub const ALL: [Self; 17] = [
        Self::Install,
        Self::Start,
        Self::ConfigChanged,
        Self::UpgradeCharm,
        Self::Stop,
        Self::CollectMetrics,
        Self::MeterStatusChanged,
        Self::LeaderElected,
        Self::LeaderDeposed,
        Self::LeaderSettingsChanged,
        Self::UpdateStatus,
        Self::RelationJoined,
        Self::RelationChanged,
        Self::RelationDeparted,
        Self::RelationBroken,
        Self::StorageAttached,
        Self::StorageDetaching,
    ];

    /// The hook's name as used for the hook file and in status messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Start => "start",
            Self::ConfigChanged => "config-changed",
            Self::UpgradeCharm => "upgrade-charm",
            Self::Stop => "stop",
            Self::CollectMetrics => "collect-metrics",
            Self::MeterStatusChanged => "meter-status-changed",
            Self::LeaderElected => "leader-elected",
            Self::LeaderDeposed => "leader-deposed",
            Self::LeaderSettingsChanged => "leader-settings-changed",
            Self::UpdateStatus => "update-status",
            Self::RelationJoined => "relation-joined",
            Self::RelationChanged => "relation-changed",
            Self::RelationDeparted => "relation-departed",
            Self::RelationBroken => "relation-broken",
            Self::StorageAttached => "storage-attached",
            Self::StorageDetaching => "storage-detaching",
        }
    }

    /// Returns true for hooks scoped to a relation.
    #[must_use]
    pub const fn is_relation(self) -> bool {
        matches!(
            self,
            Self::RelationJoined
                | Self::RelationChanged
                | Self::RelationDeparted
                | Self::RelationBroken
        )
    }

    /// Returns true for hooks scoped to a storage instance.
    #[must_use]
    pub const fn is_storage(self) -> bool {
        matches!(self, Self::StorageAttached | Self::StorageDetaching)
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::UnknownHook(s.to_string()))
    }
}

/// Describes a single hook invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookInfo {
    /// Which hook to run.
    pub kind: HookKind,
    /// The relation, for relation hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_id: Option<RelationId>,
    /// The remote unit that triggered a relation hook, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_unit: Option<String>,
    /// The storage instance, for storage hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_id: Option<StorageTag>,
}

impl HookInfo {
    /// Describe a hook with no relation or storage scope.
    #[must_use]
    pub const fn new(kind: HookKind) -> Self {
        Self {
            kind,
            relation_id: None,
            remote_unit: None,
            storage_id: None,
        }
    }

    /// Describe a relation hook.
    #[must_use]
    pub fn relation(kind: HookKind, relation_id: RelationId, remote_unit: Option<&str>) -> Self {
        Self {
            kind,
            relation_id: Some(relation_id),
            remote_unit: remote_unit.map(str::to_string),
            storage_id: None,
        }
    }

    /// Describe a storage hook.
    #[must_use]
    pub fn storage(kind: HookKind, storage_id: StorageTag) -> Self {
        Self {
            kind,
            relation_id: None,
            remote_unit: None,
            storage_id: Some(storage_id),
        }
    }

    /// Check that the descriptor's scope matches its kind.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidHook` describing the first inconsistency.
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |reason| CoreError::InvalidHook {
            kind: self.kind,
            reason,
        };
        if self.kind.is_relation() {
            if self.relation_id.is_none() {
                return Err(invalid("missing relation id"));
            }
        } else if self.relation_id.is_some() || self.remote_unit.is_some() {
            return Err(invalid("unexpected relation scope"));
        }
        if self.kind.is_storage() {
            if self.storage_id.is_none() {
                return Err(invalid("missing storage id"));
            }
        } else if self.storage_id.is_some() {
            return Err(invalid("unexpected storage scope"));
        }
        Ok(())
    }
}

impl From<HookKind> for HookInfo {
    fn from(kind: HookKind) -> Self {
        Self::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_parse() {
        for kind in HookKind::ALL {
            assert_eq!(kind.as_str().parse::<HookKind>().unwrap(), kind);
        }
        assert!("no-such-hook".parse::<HookKind>().is_err());
    }

    #[test]
    fn serde_matches_hook_names() {
        let json = serde_json::to_string(&HookKind::LeaderSettingsChanged).unwrap();
        assert_eq!(json, "\"leader-settings-changed\"");
    }

    #[test]
    fn classification() {
        assert!(HookKind::RelationBroken.is_relation());
        assert!(!HookKind::ConfigChanged.is_relation());
        assert!(HookKind::StorageAttached.is_storage());
        assert!(!HookKind::Stop.is_storage());
    }

    #[test]
    fn validate_scopes() {
        assert!(HookInfo::new(HookKind::Install).validate().is_ok());
        assert!(HookInfo::new(HookKind::RelationJoined).validate().is_err());
        assert!(
            HookInfo::relation(HookKind::RelationJoined, RelationId::new(0), Some("mysql/0"))
                .validate()
                .is_ok()
        );

        let mut hook = HookInfo::new(HookKind::Start);
        hook.relation_id = Some(RelationId::new(3));
        assert!(hook.validate().is_err());

        let tag: StorageTag = "data/0".parse().unwrap();
        assert!(HookInfo::storage(HookKind::StorageAttached, tag.clone())
            .validate()
            .is_ok());
        assert!(HookInfo::storage(HookKind::Install, tag).validate().is_err());
    }
}
