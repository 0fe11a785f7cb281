//! Call registry
//!
//! Holds at most one current session and decides, for every inbound call
//! message, whether it belongs to that session. Messages for another call
//! are dropped with a warning unless the current session is already on its
//! way out, in which case the newer call supersedes it.

use crate::session::{CallError, SessionHandle};
use crate::types::CallId;
use parking_lot::Mutex;

/// What the registry needs to know about a session
pub trait CallSlot: Clone + Send + Sync + 'static {
    /// Unique key of the session
    fn key(&self) -> u64;

    /// Call id, once assigned
    fn call_id(&self) -> Option<CallId>;

    /// Whether a newer call may replace this one
    fn is_supersedable(&self) -> bool;

    /// Whether teardown has run
    fn is_released(&self) -> bool;
}

impl CallSlot for SessionHandle {
    fn key(&self) -> u64 {
        SessionHandle::key(self)
    }

    fn call_id(&self) -> Option<CallId> {
        SessionHandle::call_id(self)
    }

    fn is_supersedable(&self) -> bool {
        SessionHandle::is_supersedable(self)
    }

    fn is_released(&self) -> bool {
        SessionHandle::is_released(self)
    }
}

/// Routing decision for an inbound call message
#[derive(Debug, Clone)]
pub enum Route<S> {
    /// Deliver to the current session
    Deliver(S),
    /// Current session is still waiting for its own call id; the message
    /// was dropped
    Unassigned,
    /// The stale session was removed; the message has no session now
    Superseded {
        /// Session to tear down
        stale: S,
    },
    /// No current session
    NoSession,
    /// Message belongs to another call and was dropped
    Mismatch {
        /// Current call
        current: CallId,
    },
}

/// Outcome of registering an incoming call
#[derive(Debug, Clone)]
pub enum Admission<S> {
    /// Registered as current
    Admitted {
        /// Replaced session, to tear down
        stale: Option<S>,
    },
    /// Same call already registered
    Duplicate,
    /// A live call is in progress
    Busy {
        /// Current call, if known
        current: Option<CallId>,
    },
}

/// Registry of the single current call
pub struct CallRegistry<S: CallSlot = SessionHandle> {
    current: Mutex<Option<S>>,
}

impl<S: CallSlot> Default for CallRegistry<S> {
    fn default() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }
}

impl<S: CallSlot> CallRegistry<S> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live session; released sessions count as empty
    #[must_use]
    pub fn current(&self) -> Option<S> {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|s| s.is_released()) {
            *current = None;
        }
        current.clone()
    }

    /// Call id of the current session
    #[must_use]
    pub fn current_call_id(&self) -> Option<CallId> {
        self.current().and_then(|s| s.call_id())
    }

    /// Install an outgoing session
    ///
    /// Returns the session it replaced, which the caller must tear down.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Busy`] if a live call is in progress
    pub fn start(&self, session: S) -> Result<Option<S>, CallError> {
        let mut current = self.current.lock();
        let stale = match current.take() {
            Some(existing) if existing.is_released() => None,
            Some(existing) if existing.is_supersedable() => Some(existing),
            Some(existing) => {
                *current = Some(existing);
                return Err(CallError::Busy);
            }
            None => None,
        };
        *current = Some(session);
        Ok(stale)
    }

    /// Register an incoming call
    pub fn admit(&self, session: S) -> Admission<S> {
        let mut current = self.current.lock();
        let stale = match current.take() {
            Some(existing) if existing.is_released() => None,
            Some(existing) if existing.call_id().is_some() && existing.call_id() == session.call_id() => {
                *current = Some(existing);
                return Admission::Duplicate;
            }
            Some(existing) if existing.is_supersedable() => Some(existing),
            Some(existing) => {
                let current_id = existing.call_id();
                *current = Some(existing);
                tracing::warn!(
                    current = ?current_id,
                    incoming = ?session.call_id(),
                    "Incoming call while another is in progress, discarded"
                );
                return Admission::Busy { current: current_id };
            }
            None => None,
        };
        *current = Some(session);
        Admission::Admitted { stale }
    }

    /// Decide where a message for `call_id` goes
    pub fn route(&self, call_id: &CallId) -> Route<S> {
        let mut current = self.current.lock();
        let Some(session) = current.clone() else {
            return Route::NoSession;
        };
        if session.is_released() {
            *current = None;
            return Route::NoSession;
        }
        match session.call_id() {
            // Only call:initiated may assign an outgoing call's id
            None => {
                tracing::debug!(received = %call_id, "Current call has no id yet, message dropped");
                Route::Unassigned
            }
            Some(id) if &id == call_id => Route::Deliver(session),
            Some(_) if session.is_supersedable() => {
                tracing::info!(
                    stale = ?session.call_id(),
                    incoming = %call_id,
                    "Stale session superseded by newer call"
                );
                *current = None;
                Route::Superseded { stale: session }
            }
            Some(id) => {
                tracing::warn!(current = %id, received = %call_id, "Call id mismatch, message dropped");
                Route::Mismatch { current: id }
            }
        }
    }

    /// Remove the session with `key` if it is still current
    pub fn clear(&self, key: u64) -> bool {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|s| s.key() == key) {
            *current = None;
            return true;
        }
        false
    }
}
