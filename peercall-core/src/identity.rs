//! Peer identity
//!
//! The signaling channel addresses every message by user identity. This
//! module provides the identity type used for both the local user and the
//! remote participant of a call.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Identity of a user on the signaling channel
///
/// Identities are opaque strings handed out by the surrounding application
/// (account id, user id, ...). The engine only compares and forwards them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new peer identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this identity is usable as a signaling address
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
