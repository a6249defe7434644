use crate::cluster::{LastCluster, Stream};
use crate::directory::entry::EntrySet;
use std::fmt::{Display, Formatter};
use std::num::NonZeroU64;

/// Address of the first entry of a set: the directory cluster that contains it and the byte offset
/// within that cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub cluster: u32,
    pub offset: u32,
}

impl EntryKey {
    /// Key of the root directory, which has no entry set.
    pub const ROOT: Self = Self {
        cluster: 0,
        offset: 0,
    };
}

impl Display for EntryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:#x}", self.cluster, self.offset)
    }
}

/// Disambiguator given to a deleted entry set.
///
/// Each value is handed out only once per mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(NonZeroU64);

impl Generation {
    pub(crate) fn new(v: NonZeroU64) -> Self {
        Self(v)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Identity of a [`Node`] in the handle cache.
///
/// A live node is identified by its address alone. Once the entry set is deleted the node carries a
/// unique [`Generation`] so a new file that reuses the same slots never resolves to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Live(EntryKey),
    Tombstoned(EntryKey, Generation),
}

impl NodeKey {
    pub fn entry(&self) -> EntryKey {
        match self {
            Self::Live(v) | Self::Tombstoned(v, _) => *v,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }
}

/// In-memory representation of an open file or directory.
///
/// The caller must serialize all operations on the same node (e.g. by keeping it behind a mutex);
/// every method of [`ExFat`](crate::ExFat) that mutates a node takes it by `&mut`.
#[derive(Debug)]
pub struct Node {
    directory: bool,
    stream: Stream,
    last: Option<LastCluster>,
    set: Option<EntrySet>,
    key: NodeKey,
}

impl Node {
    pub(crate) fn new(
        directory: bool,
        stream: Stream,
        set: Option<EntrySet>,
        key: NodeKey,
    ) -> Self {
        Self {
            directory,
            stream,
            last: None,
            set,
            key,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.directory
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    pub(crate) fn alloc_mut(&mut self) -> (&mut Stream, &mut Option<LastCluster>) {
        (&mut self.stream, &mut self.last)
    }

    pub(crate) fn last(&self) -> Option<LastCluster> {
        self.last
    }

    pub fn entry_set(&self) -> Option<&EntrySet> {
        self.set.as_ref()
    }

    pub fn entry_set_mut(&mut self) -> Option<&mut EntrySet> {
        self.set.as_mut()
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub(crate) fn set_key(&mut self, key: NodeKey) {
        self.key = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_identity() {
        let e = EntryKey {
            cluster: 4,
            offset: 0x40,
        };
        let g = Generation::new(NonZeroU64::new(1).unwrap());

        assert_eq!(NodeKey::Live(e), NodeKey::Live(e));
        assert_ne!(NodeKey::Live(e), NodeKey::Tombstoned(e, g));
        assert_eq!(NodeKey::Tombstoned(e, g).entry(), e);
        assert!(!NodeKey::Tombstoned(e, g).is_live());
    }
}
