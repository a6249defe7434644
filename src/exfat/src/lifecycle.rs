use crate::cache::NodeCache;
use crate::cluster::Stream;
use crate::directory::entry::{EntrySet, FileAttributes, NewSetError};
use crate::directory::FindSlotsError;
use crate::disk::BlockDevice;
use crate::errno::{Errno, EINVAL, ENOENT};
use crate::node::{Node, NodeKey};
use crate::resize::ResizeError;
use crate::writeback::WritebackError;
use crate::ExFat;
use log::{debug, info};
use std::num::NonZeroI32;
use thiserror::Error;

impl<D: BlockDevice> ExFat<D> {
    /// Sets the InUse bit of the entry set and writes it.
    ///
    /// `handle` is registered with `cache` under the live key of the node.
    pub fn activate<C: NodeCache>(
        &self,
        node: &mut Node,
        cache: &C,
        handle: &C::Handle,
    ) -> Result<(), LifecycleError> {
        let old = node.key();
        let entry = match old {
            NodeKey::Live(v) => v,
            NodeKey::Tombstoned(_, _) => return Err(LifecycleError::Deleted),
        };

        self.set_in_use(node, true)?;

        let new = NodeKey::Live(entry);

        cache.rekey(handle, &old, &new);
        node.set_key(new);

        debug!("Entry set at {} activated.", entry);

        Ok(())
    }

    /// Clears the InUse bit of the entry set and writes it durably.
    ///
    /// On success the node moves to a new tombstoned key in `cache` so the slots can be reused by
    /// another file while this node is still open. The set is never written again after this.
    pub fn deactivate<C: NodeCache>(
        &self,
        node: &mut Node,
        cache: &C,
        handle: &C::Handle,
    ) -> Result<(), LifecycleError> {
        let old = node.key();
        let entry = match old {
            NodeKey::Live(v) => v,
            NodeKey::Tombstoned(_, _) => return Err(LifecycleError::Deleted),
        };

        self.set_in_use(node, false)?;

        if let Some(set) = node.entry_set_mut() {
            set.set_deleted();
        }

        let new = NodeKey::Tombstoned(entry, self.next_generation());

        cache.rekey(handle, &old, &new);
        node.set_key(new);

        debug!("Entry set at {} deactivated.", entry);

        Ok(())
    }

    /// Creates an inactive node for a new file in `dir`.
    ///
    /// The records are reserved but nothing is visible on the disk until the node is passed to
    /// [`Self::activate()`]. A directory get one zeroed cluster.
    pub fn create(
        &self,
        dir: &mut Node,
        name: &str,
        attributes: FileAttributes,
    ) -> Result<Node, CreateError> {
        let mut set = EntrySet::new(name, attributes)?;
        let run = self.find_slots(dir, set.len())?;

        set.place(run.addrs());

        let directory = attributes.contains(FileAttributes::DIRECTORY);
        let mut node = Node::new(
            directory,
            Stream::empty(),
            Some(set),
            NodeKey::Live(run.key()),
        );

        if directory {
            self.set_length(&mut node, self.params.cluster_size())?;
        }

        info!("Created {} at {}.", name, run.key());

        Ok(node)
    }

    /// Deletes the entry set of `node` then releases its clusters.
    pub fn remove<C: NodeCache>(
        &self,
        node: &mut Node,
        cache: &C,
        handle: &C::Handle,
    ) -> Result<(), RemoveError> {
        self.deactivate(node, cache, handle)
            .map_err(RemoveError::DeactivateFailed)?;

        // The set is deleted so this will not touch the records.
        self.resize(node, 0).map_err(RemoveError::TruncateFailed)
    }

    fn set_in_use(&self, node: &mut Node, v: bool) -> Result<(), LifecycleError> {
        let set = match node.entry_set_mut() {
            Some(v) => v,
            None => return Err(LifecycleError::NoEntrySet),
        };

        let prev = set.in_use();

        set.set_in_use(v);

        if let Err(e) = self.writeback(node) {
            // Keep the in-memory state the same as the disk.
            if let Some(set) = node.entry_set_mut() {
                set.set_in_use(prev);
            }

            return Err(LifecycleError::WritebackFailed(e));
        }

        Ok(())
    }
}

/// Represents an error when [`ExFat::activate()`] or [`ExFat::deactivate()`] fails.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("the node has no entry set")]
    NoEntrySet,

    #[error("the entry set was already deleted")]
    Deleted,

    #[error("cannot write the entry set")]
    WritebackFailed(#[source] WritebackError),
}

impl Errno for LifecycleError {
    fn errno(&self) -> NonZeroI32 {
        match self {
            Self::NoEntrySet => EINVAL,
            Self::Deleted => ENOENT,
            Self::WritebackFailed(e) => e.errno(),
        }
    }
}

/// Represents an error when [`ExFat::create()`] fails.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("invalid file name")]
    InvalidName(#[from] NewSetError),

    #[error("cannot find free records")]
    FindSlotsFailed(#[from] FindSlotsError),

    #[error("cannot allocate the first cluster")]
    AllocFailed(#[from] ResizeError),
}

impl Errno for CreateError {
    fn errno(&self) -> NonZeroI32 {
        match self {
            Self::InvalidName(_) => EINVAL,
            Self::FindSlotsFailed(e) => e.errno(),
            Self::AllocFailed(e) => e.errno(),
        }
    }
}

/// Represents an error when [`ExFat::remove()`] fails.
#[derive(Debug, Error)]
pub enum RemoveError {
    #[error("cannot delete the entry set")]
    DeactivateFailed(#[source] LifecycleError),

    #[error("cannot release the clusters")]
    TruncateFailed(#[source] ResizeError),
}

impl Errno for RemoveError {
    fn errno(&self) -> NonZeroI32 {
        match self {
            Self::DeactivateFailed(e) => e.errno(),
            Self::TruncateFailed(e) => e.errno(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NodeTable;
    use crate::cluster::{Allocation, Cluster};
    use crate::errno::ENOSPC;
    use crate::testing::{params, volume, TestImage};

    type Table = NodeTable<u32>;

    fn new_file(
        fs: &ExFat<TestImage>,
        root: &mut Node,
        name: &str,
        cache: &Table,
        h: u32,
    ) -> Node {
        let mut f = fs.create(root, name, FileAttributes::ARCHIVE).unwrap();

        fs.activate(&mut f, cache, &h).unwrap();
        f
    }

    #[test]
    fn create_is_invisible_until_activated() {
        let fs = volume(&[]);
        let cache = Table::new();
        let mut root = fs.root().unwrap();
        let mut f = fs.create(&mut root, "new.txt", FileAttributes::ARCHIVE).unwrap();

        // Nothing was written so the slots are still free.
        assert!(fs.open_node(&root, 0).is_err());
        assert_eq!(fs.find_slots(&mut root, 3).unwrap().offset(), 0);

        fs.activate(&mut f, &cache, &1).unwrap();

        let opened = fs.open_node(&root, 0).unwrap();

        assert_eq!(opened.key(), f.key());
        assert_eq!(opened.entry_set().unwrap().name(), "new.txt");
        assert_eq!(cache.lookup(&f.key()), Some(1));
        assert_eq!(fs.find_slots(&mut root, 3).unwrap().offset(), 96);
    }

    #[test]
    fn create_directory() {
        let fs = volume(&[]);
        let cache = Table::new();
        let mut root = fs.root().unwrap();
        let mut d = fs
            .create(&mut root, "dir", FileAttributes::DIRECTORY)
            .unwrap();

        fs.activate(&mut d, &cache, &1).unwrap();

        let opened = fs.open_node(&root, 0).unwrap();

        assert!(opened.is_directory());
        assert_eq!(opened.stream().alloc(), Allocation::Contiguous(Cluster::new(4)));
        assert_eq!(opened.stream().data_length(), 4096);
        assert_eq!(opened.stream().valid_data_length(), 4096);
    }

    #[test]
    fn create_invalid_name() {
        let fs = volume(&[]);
        let mut root = fs.root().unwrap();
        let e = fs
            .create(&mut root, "", FileAttributes::ARCHIVE)
            .unwrap_err();

        assert_eq!(e.errno(), EINVAL);
    }

    #[test]
    fn create_directory_without_space() {
        let used: Vec<u32> = (4..66).collect();
        let fs = volume(&used);
        let mut root = fs.root().unwrap();
        let e = fs
            .create(&mut root, "dir", FileAttributes::DIRECTORY)
            .unwrap_err();

        assert_eq!(e.errno(), ENOSPC);
        assert!(fs.open_node(&root, 0).is_err());
    }

    #[test]
    fn deactivate_rekeys() {
        let fs = volume(&[]);
        let cache = Table::new();
        let mut root = fs.root().unwrap();
        let mut f = new_file(&fs, &mut root, "gone", &cache, 7);
        let live = f.key();

        fs.disk().clear_writes();
        fs.deactivate(&mut f, &cache, &7).unwrap();

        // Lookup by the old key must not find the node.
        assert_eq!(cache.lookup(&live), None);
        assert_eq!(cache.lookup(&f.key()), Some(7));
        assert!(!f.key().is_live());
        assert_eq!(f.key().entry(), live.entry());
        assert!(f.entry_set().unwrap().is_deleted());
        assert!(fs.disk().writes().iter().all(|&(_, durable)| durable));

        // The set is still on the disk but not in use.
        assert!(!fs.read_entry_set(&root, 0).unwrap().in_use());
        assert!(matches!(
            fs.open_node(&root, 0),
            Err(crate::directory::LoadEntrySetError::NotInUse(0))
        ));
    }

    #[test]
    fn slots_reused_after_delete() {
        let fs = volume(&[]);
        let cache = Table::new();
        let mut root = fs.root().unwrap();
        let mut a = new_file(&fs, &mut root, "a", &cache, 1);

        fs.deactivate(&mut a, &cache, &1).unwrap();

        let b = new_file(&fs, &mut root, "b", &cache, 2);

        assert_eq!(b.key().entry(), a.key().entry());
        assert_ne!(b.key(), a.key());
        assert_eq!(cache.lookup(&b.key()), Some(2));
        assert_eq!(cache.lookup(&a.key()), Some(1));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn deleted_is_terminal() {
        let fs = volume(&[]);
        let cache = Table::new();
        let mut root = fs.root().unwrap();
        let mut a = new_file(&fs, &mut root, "a", &cache, 1);

        fs.deactivate(&mut a, &cache, &1).unwrap();

        let b = new_file(&fs, &mut root, "b", &cache, 2);

        // Writing the stale node must not clobber the new file.
        fs.disk().clear_writes();
        fs.resize(&mut a, 100).unwrap();

        assert!(fs
            .disk()
            .writes()
            .iter()
            .all(|&(lba, _)| lba != params().cluster_sector(Cluster::new(3))));
        assert_eq!(fs.open_node(&root, 0).unwrap().key(), b.key());

        assert!(matches!(
            fs.deactivate(&mut a, &cache, &1),
            Err(LifecycleError::Deleted)
        ));
        assert!(matches!(
            fs.activate(&mut a, &cache, &1),
            Err(LifecycleError::Deleted)
        ));
    }

    #[test]
    fn root_cannot_be_deactivated() {
        let fs = volume(&[]);
        let cache = Table::new();
        let mut root = fs.root().unwrap();
        let e = fs.deactivate(&mut root, &cache, &0).unwrap_err();

        assert!(matches!(e, LifecycleError::NoEntrySet));
        assert_eq!(root.key(), NodeKey::Live(crate::node::EntryKey::ROOT));
        assert!(cache.is_empty());
    }

    #[test]
    fn remove_releases_clusters() {
        let fs = volume(&[]);
        let cache = Table::new();
        let mut root = fs.root().unwrap();
        let free = fs.free_clusters();
        let mut f = new_file(&fs, &mut root, "big", &cache, 1);

        fs.resize(&mut f, 3 * 4096).unwrap();
        fs.remove(&mut f, &cache, &1).unwrap();

        assert_eq!(fs.free_clusters(), free);
        assert_eq!(f.stream().alloc(), Allocation::Empty);
        assert!(!fs.read_entry_set(&root, 0).unwrap().in_use());

        // The records still describe the clusters the file had.
        assert_eq!(
            fs.read_entry_set(&root, 0).unwrap().stream().stream.data_length(),
            3 * 4096
        );
    }
}
