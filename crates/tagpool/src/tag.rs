//! Tag - group identifier for slot reservations.

use std::fmt;
use std::sync::Arc;

/// Identifies the reservation group a task is admitted under.
///
/// `Generic` is the shared overflow pool: named tags borrow from it once
/// their own reservation is saturated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    /// The generic overflow pool.
    Generic,
    /// A named reservation group.
    Named(Arc<str>),
}

impl Tag {
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self::Named(name.into())
    }

    pub fn is_generic(&self) -> bool {
        matches!(self, Self::Generic)
    }
}

impl From<&str> for Tag {
    fn from(name: &str) -> Self {
        Self::Named(Arc::from(name))
    }
}

impl From<String> for Tag {
    fn from(name: String) -> Self {
        Self::Named(Arc::from(name))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => f.write_str("<generic>"),
            Self::Named(name) => f.write_str(name),
        }
    }
}
