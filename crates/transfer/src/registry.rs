use std::collections::HashMap;

use crate::TransferError;

/// Active sessions of one connection, keyed by peer-supplied id.
///
/// Owned by the connection's controller and only touched from its control
/// loop, so no locking is needed. A removed id is simply absent: lookups
/// after `remove` return `None` and never resurrect state.
#[derive(Debug)]
pub struct SessionRegistry<S> {
    sessions: HashMap<String, S>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session under `id`.
    ///
    /// Fails with [`TransferError::AlreadyExists`] while a session with the
    /// same id is still active; the existing session is left untouched.
    pub fn create(&mut self, id: &str, session: S) -> Result<&mut S, TransferError> {
        if self.sessions.contains_key(id) {
            return Err(TransferError::AlreadyExists(id.to_string()));
        }
        Ok(self.sessions.entry(id.to_string()).or_insert(session))
    }

    pub fn get(&self, id: &str) -> Option<&S> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut S> {
        self.sessions.get_mut(id)
    }

    /// Removes and returns the session; `None` if it was already gone.
    pub fn remove(&mut self, id: &str) -> Option<S> {
        self.sessions.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of all active sessions.
    pub fn ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }
}
