//! Checked object names
//!
//! Every entity name keeps its case-preserving display form plus an
//! uppercase comparison form; ordering, equality, and hashing all use the
//! comparison form, so names differing only in case collide within a
//! registry scope.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Maximum length of an object name
pub const NAME_MAX_LEN: usize = 48;

/// A validated object name with display and comparison forms
#[derive(Debug, Clone)]
pub struct ObjectName {
    display: String,
    upper: String,
}

impl ObjectName {
    pub fn new(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(Error::InvalidName {
                value: value.to_string(),
                reason: "name must not be empty",
            });
        }
        if value.len() > NAME_MAX_LEN {
            return Err(Error::InvalidName {
                value: value.to_string(),
                reason: "name exceeds the maximum length",
            });
        }
        let mut chars = value.chars();
        let first = chars.next().unwrap_or_default();
        if !first.is_ascii_alphabetic() {
            return Err(Error::InvalidName {
                value: value.to_string(),
                reason: "name must start with a letter",
            });
        }
        if !chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')) {
            return Err(Error::InvalidName {
                value: value.to_string(),
                reason: "name contains invalid characters",
            });
        }
        Ok(Self {
            display: value.to_string(),
            upper: value.to_ascii_uppercase(),
        })
    }

    /// Case-preserving display form
    pub fn display(&self) -> &str {
        &self.display
    }

    /// Normalized comparison form
    pub fn value(&self) -> &str {
        &self.upper
    }
}

impl PartialEq for ObjectName {
    fn eq(&self, other: &Self) -> bool {
        self.upper == other.upper
    }
}

impl Eq for ObjectName {}

impl PartialOrd for ObjectName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.upper.cmp(&other.upper)
    }
}

impl Hash for ObjectName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.upper.hash(state);
    }
}

impl std::fmt::Display for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display)
    }
}

/// Declares a strongly typed wrapper around [`ObjectName`]
macro_rules! name_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(ObjectName);

        impl $name {
            pub fn new(value: &str) -> Result<Self> {
                Ok(Self(ObjectName::new(value)?))
            }

            pub fn display(&self) -> &str {
                self.0.display()
            }

            pub fn value(&self) -> &str {
                self.0.value()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

name_type!(
    /// Name of a cluster node
    NodeName
);
name_type!(
    /// Name of a resource definition and its per-node resources
    ResourceName
);
name_type!(
    /// Name of a node-local storage pool
    StorPoolName
);
name_type!(
    /// Name of a security type or subject domain
    SecTypeName
);
