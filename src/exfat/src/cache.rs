use crate::node::NodeKey;
use std::collections::HashMap;
use std::sync::Mutex;

/// Lookup table that maps a [`NodeKey`] to an open handle.
///
/// The filesystem must make sure a file/directory have only one active handle, so this is
/// consulted before a new handle is created and notified whenever a key changes.
pub trait NodeCache {
    type Handle;

    /// Moves `handle` from `old` to `new`.
    fn rekey(&self, handle: &Self::Handle, old: &NodeKey, new: &NodeKey);

    fn lookup(&self, key: &NodeKey) -> Option<Self::Handle>;
}

/// In-memory implementation of [`NodeCache`].
#[derive(Debug)]
pub struct NodeTable<H> {
    items: Mutex<HashMap<NodeKey, H>>,
}

impl<H: Clone> NodeTable<H> {
    pub fn new() -> Self {
        Self {
            items: Mutex::default(),
        }
    }

    /// Returns the handle that is already associated with `key`, otherwise insert `handle`.
    pub fn insert(&self, key: NodeKey, handle: H) -> H {
        self.items
            .lock()
            .unwrap()
            .entry(key)
            .or_insert(handle)
            .clone()
    }

    pub fn remove(&self, key: &NodeKey) -> Option<H> {
        self.items.lock().unwrap().remove(key)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: Clone> Default for NodeTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Clone> NodeCache for NodeTable<H> {
    type Handle = H;

    fn rekey(&self, handle: &H, old: &NodeKey, new: &NodeKey) {
        let mut items = self.items.lock().unwrap();

        items.remove(old);
        items.insert(*new, handle.clone());
    }

    fn lookup(&self, key: &NodeKey) -> Option<H> {
        self.items.lock().unwrap().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{EntryKey, Generation};
    use std::num::NonZeroU64;

    #[test]
    fn rekey_moves_handle() {
        let table = NodeTable::new();
        let e = EntryKey {
            cluster: 3,
            offset: 0,
        };
        let live = NodeKey::Live(e);
        let dead = NodeKey::Tombstoned(e, Generation::new(NonZeroU64::new(7).unwrap()));

        assert_eq!(table.insert(live, 1), 1);
        assert_eq!(table.insert(live, 2), 1);

        table.rekey(&1, &live, &dead);

        assert_eq!(table.lookup(&live), None);
        assert_eq!(table.lookup(&dead), Some(1));
        assert_eq!(table.len(), 1);
    }
}
