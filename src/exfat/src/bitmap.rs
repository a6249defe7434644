use crate::cluster::Cluster;
use crate::disk::BlockDevice;
use crate::errno::{Errno, EINTEGRITY, EIO, ENOSPC};
use crate::param::Params;
use log::trace;
use std::num::NonZeroI32;
use std::sync::Mutex;
use thiserror::Error;

/// Allocation Bitmap of the volume.
///
/// Bit `n` represent cluster `n + 2`. The next-search position and the free count are shared by
/// all files and protected by one mutex, which is held for the whole allocate/free so each bit flip
/// is atomic.
pub(crate) struct Bitmap {
    offset: u64, // in sector
    sector_size: usize,
    cluster_count: u32,
    state: Mutex<State>,
}

struct State {
    hint: u32, // bit index
    free: u32,
}

impl Bitmap {
    pub fn load<D: BlockDevice + ?Sized>(params: &Params, disk: &D) -> Result<Self, LoadError> {
        let sector_size = params.bytes_per_sector as usize;
        let bits = sector_size as u64 * 8;
        let sectors = u64::from(params.cluster_count).div_ceil(bits);
        let mut used = 0u32;

        for i in 0..sectors {
            let lba = params.bitmap_offset + i;
            let block = match disk.read_block(lba, sector_size) {
                Ok(v) => v,
                Err(e) => return Err(LoadError::ReadFailed(lba, e)),
            };

            // Bits past ClusterCount in the last sector are not meaningful.
            let first = i * bits;
            let count = (u64::from(params.cluster_count) - first).min(bits) as usize;

            used += (0..count).filter(|&b| block[b / 8] & (1 << (b % 8)) != 0).count() as u32;
        }

        Ok(Self {
            offset: params.bitmap_offset,
            sector_size,
            cluster_count: params.cluster_count,
            state: Mutex::new(State {
                hint: 0,
                free: params.cluster_count - used,
            }),
        })
    }

    pub fn free_count(&self) -> u32 {
        self.state.lock().unwrap().free
    }

    /// Marks the first free cluster at or after `hint` as used, wrapping at the end of the heap.
    ///
    /// When `hint` is [`None`] the search start at the shared hint, which is moved past the
    /// allocated cluster on success.
    pub fn allocate<D: BlockDevice + ?Sized>(
        &self,
        disk: &D,
        hint: Option<Cluster>,
        durable: bool,
    ) -> Result<Cluster, AllocError> {
        let mut state = self.state.lock().unwrap();

        if state.free == 0 {
            return Err(AllocError::OutOfSpace);
        }

        let bits = self.sector_size * 8;
        let mut index = match hint {
            Some(v) => v.index() - 2,
            None => state.hint,
        };
        let mut remaining = self.cluster_count;

        if index >= self.cluster_count {
            index = 0;
        }

        while remaining != 0 {
            // Load the sector that contains the bit.
            let sector = index as usize / bits;
            let lba = self.offset + sector as u64;
            let mut block = match disk.read_block(lba, self.sector_size) {
                Ok(v) => v,
                Err(e) => return Err(AllocError::ReadFailed(lba, e)),
            };

            // Search within the sector.
            let base = (sector * bits) as u32;
            let end = (base + bits as u32).min(self.cluster_count);

            while index < end && remaining != 0 {
                let bit = (index - base) as usize;
                let mask = 1u8 << (bit % 8);

                remaining -= 1;

                if block[bit / 8] & mask != 0 {
                    index += 1;
                    continue;
                }

                block[bit / 8] |= mask;

                if let Err(e) = disk.write_block(&block, durable) {
                    return Err(AllocError::WriteFailed(lba, e));
                }

                state.free -= 1;
                state.hint = if index + 1 == self.cluster_count {
                    0
                } else {
                    index + 1
                };

                trace!("Cluster #{} allocated.", index + 2);

                return Ok(Cluster::new(index + 2));
            }

            index = if end == self.cluster_count { 0 } else { end };
        }

        // The free count said there is a free bit but we did not found any.
        Err(AllocError::OutOfSpace)
    }

    pub fn free<D: BlockDevice + ?Sized>(
        &self,
        disk: &D,
        cluster: Cluster,
        durable: bool,
    ) -> Result<(), FreeError> {
        let mut state = self.state.lock().unwrap();
        let (lba, byte, mask) = self.locate(cluster);
        let mut block = match disk.read_block(lba, self.sector_size) {
            Ok(v) => v,
            Err(e) => return Err(FreeError::ReadFailed(lba, e)),
        };

        if block[byte] & mask == 0 {
            return Err(FreeError::NotAllocated(cluster));
        }

        block[byte] &= !mask;

        if let Err(e) = disk.write_block(&block, durable) {
            return Err(FreeError::WriteFailed(lba, e));
        }

        state.free += 1;

        trace!("Cluster {} freed.", cluster);

        Ok(())
    }

    pub fn is_allocated<D: BlockDevice + ?Sized>(
        &self,
        disk: &D,
        cluster: Cluster,
    ) -> std::io::Result<bool> {
        let _state = self.state.lock().unwrap();
        let (lba, byte, mask) = self.locate(cluster);
        let block = disk.read_block(lba, self.sector_size)?;

        Ok(block[byte] & mask != 0)
    }

    fn locate(&self, cluster: Cluster) -> (u64, usize, u8) {
        let index = (cluster.index() - 2) as usize;
        let bits = self.sector_size * 8;
        let bit = index % bits;

        (
            self.offset + (index / bits) as u64,
            bit / 8,
            1u8 << (bit % 8),
        )
    }
}

/// Represents an error when [`Bitmap::load()`] fails.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read sector #{0}")]
    ReadFailed(u64, #[source] std::io::Error),
}

/// Represents an error when [`Bitmap::allocate()`] fails.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no free cluster available")]
    OutOfSpace,

    #[error("cannot read sector #{0}")]
    ReadFailed(u64, #[source] std::io::Error),

    #[error("cannot write sector #{0}")]
    WriteFailed(u64, #[source] std::io::Error),
}

impl Errno for AllocError {
    fn errno(&self) -> NonZeroI32 {
        match self {
            Self::OutOfSpace => ENOSPC,
            Self::ReadFailed(_, _) | Self::WriteFailed(_, _) => EIO,
        }
    }
}

/// Represents an error when [`Bitmap::free()`] fails.
#[derive(Debug, Error)]
pub enum FreeError {
    #[error("cluster {0} is not allocated")]
    NotAllocated(Cluster),

    #[error("cannot read sector #{0}")]
    ReadFailed(u64, #[source] std::io::Error),

    #[error("cannot write sector #{0}")]
    WriteFailed(u64, #[source] std::io::Error),
}

impl Errno for FreeError {
    fn errno(&self) -> NonZeroI32 {
        match self {
            Self::NotAllocated(_) => EINTEGRITY,
            Self::ReadFailed(_, _) | Self::WriteFailed(_, _) => EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{params, TestImage};

    fn bitmap(used: &[u32]) -> (Bitmap, TestImage) {
        let image = TestImage::new();

        image.set_used(used);

        (Bitmap::load(&params(), &image).unwrap(), image)
    }

    #[test]
    fn load_counts_free() {
        let (bitmap, _) = bitmap(&[2, 3, 10]);

        assert_eq!(bitmap.free_count(), params().cluster_count - 3);
    }

    #[test]
    fn allocate_from_hint() {
        let (bitmap, image) = bitmap(&[2, 3]);
        let c = bitmap.allocate(&image, Some(Cluster::new(10)), false).unwrap();

        assert_eq!(c, Cluster::new(10));
        assert!(bitmap.is_allocated(&image, c).unwrap());
        assert_eq!(bitmap.free_count(), params().cluster_count - 3);
    }

    #[test]
    fn shared_hint_advances() {
        let (bitmap, image) = bitmap(&[2, 3]);
        let a = bitmap.allocate(&image, None, false).unwrap();
        let b = bitmap.allocate(&image, None, false).unwrap();

        assert_eq!(a, Cluster::new(4));
        assert_eq!(b, Cluster::new(5));
    }

    #[test]
    fn allocate_wraps() {
        let p = params();
        let last = p.cluster_count + 1;
        let (bitmap, image) = bitmap(&[2, last]);
        let c = bitmap.allocate(&image, Some(Cluster::new(last)), false).unwrap();

        assert_eq!(c, Cluster::new(3));
    }

    #[test]
    fn out_of_space() {
        let all: Vec<u32> = (2..(params().cluster_count + 2)).collect();
        let (bitmap, image) = bitmap(&all);

        assert_eq!(bitmap.free_count(), 0);
        assert!(matches!(
            bitmap.allocate(&image, None, false),
            Err(AllocError::OutOfSpace)
        ));
    }

    #[test]
    fn double_free() {
        let (bitmap, image) = bitmap(&[2, 3]);
        let c = bitmap.allocate(&image, None, false).unwrap();

        bitmap.free(&image, c, false).unwrap();

        assert!(!bitmap.is_allocated(&image, c).unwrap());
        assert!(matches!(
            bitmap.free(&image, c, false),
            Err(FreeError::NotAllocated(v)) if v == c
        ));
    }
}
