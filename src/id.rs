//! Hierarchical container identifiers.
//!
//! A [`ContainerId`] is a value plus an optional parent identifier, forming a
//! forest. Nested containers carry their full ancestry by value, so two
//! identifiers are equal only if their values and entire parent chains match.

use crate::constants::{MAX_NESTING_DEPTH, validate_container_id};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Identifier of a (possibly nested) container.
///
/// Immutable once constructed. Hashing and ordering cover the whole chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<Box<ContainerId>>,
}

impl ContainerId {
    /// Creates a root container identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            parent: None,
        }
    }

    /// Creates a root identifier with a fresh UUIDv7 value.
    #[must_use]
    pub fn random() -> Self {
        Self::new(uuid::Uuid::now_v7().to_string())
    }

    /// Creates a nested identifier under `parent`.
    #[must_use]
    pub fn nested(parent: &ContainerId, value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            parent: Some(Box::new(parent.clone())),
        }
    }

    /// Creates a nested identifier with a fresh UUIDv7 value.
    #[must_use]
    pub fn random_child(&self) -> Self {
        Self::nested(self, uuid::Uuid::now_v7().to_string())
    }

    /// Returns this level's value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns the parent identifier, if nested.
    pub fn parent(&self) -> Option<&ContainerId> {
        self.parent.as_deref()
    }

    /// Returns true if this identifier has a parent.
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Returns the top-level ancestor (self for root identifiers).
    pub fn root(&self) -> &ContainerId {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Returns the chain from the root down to (and including) self.
    pub fn ancestry(&self) -> Vec<&ContainerId> {
        let mut chain = Vec::new();
        let mut current = Some(self);
        while let Some(id) = current {
            chain.push(id);
            current = id.parent();
        }
        chain.reverse();
        chain
    }

    /// Number of ancestors (0 for a root identifier).
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(parent) = current {
            depth += 1;
            current = parent.parent();
        }
        depth
    }

    /// Returns true if `self` is a strict descendant of `other`.
    pub fn is_descendant_of(&self, other: &ContainerId) -> bool {
        let mut current = self.parent();
        while let Some(parent) = current {
            if parent == other {
                return true;
            }
            current = parent.parent();
        }
        false
    }

    /// Checks every segment of the chain against the allowed charset.
    pub fn validate(&self) -> Result<()> {
        if self.depth() >= MAX_NESTING_DEPTH {
            return Err(Error::InvalidContainerId {
                id: self.to_string(),
                reason: format!("nesting depth exceeds {MAX_NESTING_DEPTH}"),
            });
        }
        for id in self.ancestry() {
            validate_container_id(id.value()).map_err(|reason| Error::InvalidContainerId {
                id: self.to_string(),
                reason: reason.to_string(),
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(parent) = self.parent() {
            write!(f, "{parent}.")?;
        }
        write!(f, "{}", self.value)
    }
}
