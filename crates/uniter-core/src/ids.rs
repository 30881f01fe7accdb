//! Core identifier types for the unit agent.
//!
//! This module provides strongly-typed identifiers for units, charms,
//! relations, actions and storage instances. All of them parse from and
//! display as the textual form used by the controller API.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The unit name is not of the form `application/number`.
    #[error("invalid unit name: {0:?}")]
    InvalidUnitName(String),

    /// The charm URL could not be parsed.
    #[error("invalid charm URL {url:?}: {reason}")]
    InvalidCharmUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The storage tag is not of the form `name/number`.
    #[error("invalid storage tag: {0:?}")]
    InvalidStorageTag(String),

    /// The string is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,
}

/// Returns true if `s` is a valid lowercase name segment (`[a-z][a-z0-9-]*`,
/// not ending in a hyphen).
fn is_valid_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    !s.ends_with('-') && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Splits `s` on its last `/` into a valid name and a number.
fn split_numbered(s: &str) -> Option<(&str, u32)> {
    let (name, number) = s.rsplit_once('/')?;
    if !is_valid_name(name) || number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    number.parse().ok().map(|n| (name, n))
}

/// The name of a unit, e.g. `wordpress/0`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitName {
    application: String,
    number: u32,
}

impl UnitName {
    /// Create a unit name from its parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the application name is not valid.
    pub fn new(application: &str, number: u32) -> Result<Self, IdError> {
        if !is_valid_name(application) {
            return Err(IdError::InvalidUnitName(format!("{application}/{number}")));
        }
        Ok(Self {
            application: application.to_string(),
            number,
        })
    }

    /// The application this unit belongs to.
    #[must_use]
    pub fn application(&self) -> &str {
        &self.application
    }

    /// The unit number within its application.
    #[must_use]
    pub const fn number(&self) -> u32 {
        self.number
    }
}

impl FromStr for UnitName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (application, number) =
            split_numbered(s).ok_or_else(|| IdError::InvalidUnitName(s.to_string()))?;
        Ok(Self {
            application: application.to_string(),
            number,
        })
    }
}

impl fmt::Debug for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitName({self})")
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application, self.number)
    }
}

impl TryFrom<String> for UnitName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UnitName> for String {
    fn from(name: UnitName) -> Self {
        name.to_string()
    }
}

/// A charm URL, e.g. `cs:trusty/wordpress-3` or `local:mysql`.
///
/// The revision is optional; URLs without one refer to the latest revision.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CharmUrl {
    schema: String,
    series: Option<String>,
    name: String,
    revision: Option<u32>,
}

impl CharmUrl {
    /// The URL schema (`cs` or `local`).
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// The series, if the URL names one.
    #[must_use]
    pub fn series(&self) -> Option<&str> {
        self.series.as_deref()
    }

    /// The charm name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The charm revision, if the URL names one.
    #[must_use]
    pub const fn revision(&self) -> Option<u32> {
        self.revision
    }

    /// Return a copy of this URL pinned to the given revision.
    #[must_use]
    pub fn with_revision(&self, revision: u32) -> Self {
        Self {
            revision: Some(revision),
            ..self.clone()
        }
    }
}

impl FromStr for CharmUrl {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| IdError::InvalidCharmUrl {
            url: s.to_string(),
            reason,
        };

        let (schema, rest) = s.split_once(':').ok_or_else(|| invalid("missing schema"))?;
        if schema != "cs" && schema != "local" {
            return Err(invalid("schema must be \"cs\" or \"local\""));
        }

        let (series, rest) = match rest.split_once('/') {
            Some((series, rest)) => {
                if !is_valid_name(series) {
                    return Err(invalid("invalid series"));
                }
                (Some(series.to_string()), rest)
            }
            None => (None, rest),
        };

        // A trailing all-digit segment is the revision.
        let (name, revision) = match rest.rsplit_once('-') {
            Some((name, rev)) if !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()) => {
                let revision = rev.parse().map_err(|_| invalid("revision out of range"))?;
                (name, Some(revision))
            }
            _ => (rest, None),
        };

        if !is_valid_name(name) {
            return Err(invalid("invalid charm name"));
        }

        Ok(Self {
            schema: schema.to_string(),
            series,
            name: name.to_string(),
            revision,
        })
    }
}

impl fmt::Debug for CharmUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CharmUrl({self})")
    }
}

impl fmt::Display for CharmUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.schema)?;
        if let Some(series) = &self.series {
            write!(f, "{series}/")?;
        }
        write!(f, "{}", self.name)?;
        if let Some(revision) = self.revision {
            write!(f, "-{revision}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for CharmUrl {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CharmUrl> for String {
    fn from(url: CharmUrl) -> Self {
        url.to_string()
    }
}

/// The identifier of a relation this unit participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationId(u32);

impl RelationId {
    /// Create a relation ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Return the numeric value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A UUID-based action identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActionId(uuid::Uuid);

impl ActionId {
    /// Create a new `ActionId` from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a new random `ActionId`.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Return the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl FromStr for ActionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
        Ok(Self(uuid))
    }
}

impl fmt::Debug for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionId({})", self.0)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ActionId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ActionId> for String {
    fn from(id: ActionId) -> Self {
        id.0.to_string()
    }
}

/// A storage instance tag, e.g. `data/0`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageTag {
    name: String,
    number: u32,
}

impl StorageTag {
    /// The storage name as declared by the charm.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instance number.
    #[must_use]
    pub const fn number(&self) -> u32 {
        self.number
    }
}

impl FromStr for StorageTag {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, number) =
            split_numbered(s).ok_or_else(|| IdError::InvalidStorageTag(s.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            number,
        })
    }
}

impl fmt::Debug for StorageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageTag({self})")
    }
}

impl fmt::Display for StorageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.number)
    }
}

impl TryFrom<String> for StorageTag {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StorageTag> for String {
    fn from(tag: StorageTag) -> Self {
        tag.to_string()
    }
}
