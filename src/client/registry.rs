//! Client-side table of live engine objects.

use std::collections::HashMap;

use crate::error::ProtocolError;
use crate::protocol::{Handle, HandleId};

struct Entry<O> {
    object: O,
    identity: u64,
    display: String,
}

/// Maps handle ids to live engine objects.
///
/// Ids come from a counter that only moves forward, so a deleted id is never
/// handed out again. A reverse index on the engine's identity key makes an
/// object that crosses the boundary twice keep its first id.
pub struct Registry<O> {
    entries: HashMap<HandleId, Entry<O>>,
    by_identity: HashMap<u64, HandleId>,
    next_id: u64,
    root: Option<HandleId>,
}

impl<O> Default for Registry<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Registry<O> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_identity: HashMap::new(),
            next_id: 1,
            root: None,
        }
    }

    /// Register `object` and return its handle, reusing the existing id if
    /// an object with the same identity is already registered.
    pub fn register(&mut self, object: O, identity: u64, display: impl FnOnce() -> String) -> Handle {
        if let Some(id) = self.by_identity.get(&identity) {
            let entry = &self.entries[id];
            return Handle::new(*id, entry.display.clone());
        }

        let id = HandleId(self.next_id);
        self.next_id += 1;
        let text = display();
        tracing::debug!(%id, display = %text, "registered object");

        self.by_identity.insert(identity, id);
        self.entries.insert(
            id,
            Entry {
                object,
                identity,
                display: text.clone(),
            },
        );
        Handle::new(id, text)
    }

    /// Register the engine's root object; it can never be removed.
    pub fn register_root(&mut self, object: O, identity: u64, display: impl FnOnce() -> String) -> Handle {
        let handle = self.register(object, identity, display);
        self.root = Some(handle.id);
        handle
    }

    pub fn get(&self, id: HandleId) -> Result<&O, ProtocolError> {
        self.entries
            .get(&id)
            .map(|entry| &entry.object)
            .ok_or(ProtocolError::UnknownHandle(id))
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn is_root(&self, id: HandleId) -> bool {
        self.root == Some(id)
    }

    /// Drop the entry for `id`. Absent ids and the root are ignored.
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&mut self, id: HandleId) -> bool {
        if self.is_root(id) {
            tracing::debug!(%id, "ignoring delete of root object");
            return false;
        }
        match self.entries.remove(&id) {
            Some(entry) => {
                self.by_identity.remove(&entry.identity);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
