pub use self::bitmap::{AllocError, FreeError, LoadError};
pub use self::cache::*;
pub use self::cluster::{Allocation, Cluster, Stream};
pub use self::config::*;
pub use self::directory::entry::{EntryAddr, EntrySet, FileAttributes};
pub use self::directory::{FindSlotsError, LoadEntrySetError, SlotRun};
pub use self::disk::*;
pub use self::errno::*;
pub use self::fat::{FatError, LinkState};
pub use self::lifecycle::{CreateError, LifecycleError, RemoveError};
pub use self::node::*;
pub use self::param::*;
pub use self::resize::ResizeError;
pub use self::writeback::WritebackError;

use self::bitmap::Bitmap;
use self::fat::Fat;
use log::{debug, info};
use std::num::{NonZeroI32, NonZeroU64};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

mod bitmap;
mod cache;
mod cluster;
mod config;
pub mod directory;
mod disk;
mod errno;
mod fat;
mod lifecycle;
mod node;
mod param;
mod resize;
#[cfg(test)]
mod testing;
mod writeback;

/// A mounted exFAT volume.
///
/// This type owns the volume-wide state: the Allocation Bitmap with its shared search position and
/// the generation counter for deleted nodes. The nodes themselves are owned by the caller. A
/// volume can be shared between threads as long as each node is used by one thread at a time.
///
/// See https://learn.microsoft.com/en-us/windows/win32/fileio/exfat-specification for the on-disk
/// format.
pub struct ExFat<D: BlockDevice> {
    disk: D,
    params: Params,
    config: Config,
    bitmap: Bitmap,
    patch: Mutex<()>, // held while a sector shared by multiple nodes is rewritten
    generation: AtomicU64,
}

impl<D: BlockDevice> ExFat<D> {
    pub fn new(disk: D, params: Params, config: Config) -> Result<Self, OpenError> {
        params.validate()?;

        let bitmap = Bitmap::load(&params, &disk)?;

        info!(
            "exFAT volume with {} clusters of {} bytes ({} free).",
            params.cluster_count,
            params.cluster_size(),
            bitmap.free_count()
        );

        Ok(Self {
            disk,
            params,
            config,
            bitmap,
            patch: Mutex::default(),
            generation: AtomicU64::new(0),
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }

    pub fn into_disk(self) -> D {
        self.disk
    }

    pub fn free_clusters(&self) -> u32 {
        self.bitmap.free_count()
    }

    /// Reads the Allocation Bitmap bit of `cluster`.
    pub fn is_allocated(&self, cluster: Cluster) -> std::io::Result<bool> {
        self.bitmap.is_allocated(&self.disk, cluster)
    }

    /// Reads the FAT entry of `cluster`.
    pub fn link(&self, cluster: Cluster) -> Result<LinkState, FatError> {
        self.fat().read_link(cluster)
    }

    /// Gets a node for the root directory.
    ///
    /// The root directory has no entry set so its size come from the length of its cluster chain.
    pub fn root(&self) -> Result<Node, FatError> {
        // The cluster was checked by Params::validate().
        let first = Cluster::new(self.params.first_cluster_of_root_directory);
        let mut count = 0u64;

        for c in self.fat().chain(first) {
            c?;
            count += 1;
        }

        let length = count * self.params.cluster_size();

        debug!("Root directory at cluster {} has {} clusters.", first, count);

        Ok(Node::new(
            true,
            Stream {
                alloc: Allocation::Chained(first),
                data_length: length,
                valid_data_length: length,
            },
            None,
            NodeKey::Live(EntryKey::ROOT),
        ))
    }

    fn fat(&self) -> Fat<'_, D> {
        Fat::new(&self.params, &self.disk, &self.patch)
    }

    fn next_generation(&self) -> Generation {
        let v = self.generation.fetch_add(1, Ordering::Relaxed);

        Generation::new(NonZeroU64::MIN.saturating_add(v))
    }
}

/// Represents an error when [`ExFat::new()`] fails.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("invalid volume parameters")]
    InvalidParams(#[from] ParamsError),

    #[error("cannot load allocation bitmap")]
    LoadBitmapFailed(#[from] LoadError),
}

impl Errno for OpenError {
    fn errno(&self) -> NonZeroI32 {
        match self {
            Self::InvalidParams(_) => EINVAL,
            Self::LoadBitmapFailed(_) => EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{params, volume, TestImage};

    #[test]
    fn open_counts_free_clusters() {
        let fs = volume(&[10, 11]);

        assert_eq!(fs.free_clusters(), params().cluster_count - 4);
    }

    #[test]
    fn open_rejects_bad_params() {
        let mut p = params();

        p.number_of_fats = 3;

        let r = ExFat::new(TestImage::new(), p, Config::default());

        assert!(matches!(r, Err(OpenError::InvalidParams(_))));
        assert_eq!(r.err().unwrap().errno(), EINVAL);
    }

    #[test]
    fn root_size_from_chain() {
        let fs = volume(&[4]);

        fs.disk().set_fat(3, 4);
        fs.disk().set_fat(4, 0xFFFFFFFF);

        let root = fs.root().unwrap();

        assert!(root.is_directory());
        assert!(root.entry_set().is_none());
        assert_eq!(root.stream().data_length(), 8192);
        assert_eq!(root.stream().alloc(), Allocation::Chained(Cluster::new(3)));
        assert_eq!(root.key(), NodeKey::Live(EntryKey::ROOT));
    }

    #[test]
    fn generations_are_unique() {
        let fs = volume(&[]);
        let a = fs.next_generation();
        let b = fs.next_generation();

        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);
        assert_ne!(a, b);
    }
}
