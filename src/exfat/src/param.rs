use crate::cluster::Cluster;
use thiserror::Error;

/// Geometry of a mounted volume.
///
/// All offsets are in sectors relative to the beginning of the volume. The values are supplied by
/// whoever mounted the volume and never change while it is mounted.
#[derive(Debug, Clone)]
pub struct Params {
    pub fat_offset: u64,          // in sector
    pub fat_length: u64,          // in sector
    pub bitmap_offset: u64,       // in sector
    pub cluster_heap_offset: u64, // in sector
    pub cluster_count: u32,
    pub first_cluster_of_root_directory: u32,
    pub volume_flags: VolumeFlags,
    pub bytes_per_sector: u64,
    pub sectors_per_cluster: u64,
    pub number_of_fats: u8,
}

impl Params {
    pub(crate) fn validate(&self) -> Result<(), ParamsError> {
        let bps = self.bytes_per_sector;

        if !bps.is_power_of_two() || !(512..=4096).contains(&bps) {
            return Err(ParamsError::InvalidBytesPerSector);
        }

        // The cluster size cannot exceed 32MB.
        let spc = self.sectors_per_cluster;

        if !spc.is_power_of_two() || bps * spc > 32 * 1024 * 1024 {
            return Err(ParamsError::InvalidSectorsPerCluster);
        }

        if self.number_of_fats != 1 && self.number_of_fats != 2 {
            return Err(ParamsError::InvalidNumberOfFats);
        } else if self.volume_flags.active_fat() >= u16::from(self.number_of_fats) {
            return Err(ParamsError::InvalidNumberOfFats);
        }

        // Each cluster need one 32-bit entry in the FAT, including the first two reserved entries.
        let needed = (u64::from(self.cluster_count) + 2) * 4;

        if self.cluster_count == 0 || self.cluster_count > 0xFFFFFFF5 {
            return Err(ParamsError::InvalidClusterCount);
        } else if self.fat_length * bps < needed {
            return Err(ParamsError::InvalidFatLength);
        }

        if self.cluster(self.first_cluster_of_root_directory).is_none() {
            return Err(ParamsError::InvalidRootCluster);
        }

        Ok(())
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// Returns [`None`] if `index` is not a cluster in the heap.
    pub fn cluster(&self, index: u32) -> Option<Cluster> {
        if index >= 2 && index - 2 < self.cluster_count {
            Some(Cluster::new(index))
        } else {
            None
        }
    }

    /// Gets the first sector of `cluster`.
    pub fn cluster_sector(&self, cluster: Cluster) -> u64 {
        self.cluster_heap_offset + u64::from(cluster.index() - 2) * self.sectors_per_cluster
    }

    /// Gets the sector and the offset within it that hold the FAT entry of `cluster`.
    pub fn fat_entry(&self, cluster: Cluster) -> (u64, usize) {
        let fat = self.fat_offset + self.fat_length * u64::from(self.volume_flags.active_fat());
        let offset = u64::from(cluster.index()) * 4;

        (
            fat + offset / self.bytes_per_sector,
            (offset % self.bytes_per_sector) as usize,
        )
    }

    /// Number of clusters required to hold `bytes`.
    pub fn clusters_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.cluster_size())
    }
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(transparent)]
pub struct VolumeFlags(u16);

impl VolumeFlags {
    pub fn active_fat(self) -> u16 {
        self.0 & 1
    }
}

impl From<u16> for VolumeFlags {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

/// Represents an error when [`Params`] does not describe a usable volume.
#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("invalid BytesPerSector")]
    InvalidBytesPerSector,

    #[error("invalid SectorsPerCluster")]
    InvalidSectorsPerCluster,

    #[error("invalid NumberOfFats")]
    InvalidNumberOfFats,

    #[error("invalid ClusterCount")]
    InvalidClusterCount,

    #[error("FatLength is too small for ClusterCount")]
    InvalidFatLength,

    #[error("invalid FirstClusterOfRootDirectory")]
    InvalidRootCluster,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::params;

    #[test]
    fn fat_entry() {
        let p = params();

        assert_eq!(p.fat_entry(Cluster::new(2)), (p.fat_offset, 8));
        assert_eq!(p.fat_entry(Cluster::new(130)), (p.fat_offset + 1, 8));
    }

    #[test]
    fn cluster_range() {
        let p = params();

        assert!(p.cluster(0).is_none());
        assert!(p.cluster(1).is_none());
        assert!(p.cluster(2).is_some());
        assert!(p.cluster(p.cluster_count + 1).is_some());
        assert!(p.cluster(p.cluster_count + 2).is_none());
    }

    #[test]
    fn clusters_for() {
        let p = params();

        assert_eq!(p.clusters_for(0), 0);
        assert_eq!(p.clusters_for(1), 1);
        assert_eq!(p.clusters_for(4096), 1);
        assert_eq!(p.clusters_for(4097), 2);
    }

    #[test]
    fn validate() {
        let mut p = params();

        assert!(p.validate().is_ok());

        p.bytes_per_sector = 1000;
        assert!(matches!(p.validate(), Err(ParamsError::InvalidBytesPerSector)));

        p = params();
        p.volume_flags = VolumeFlags::from(1);
        assert!(matches!(p.validate(), Err(ParamsError::InvalidNumberOfFats)));

        p = params();
        p.first_cluster_of_root_directory = 1;
        assert!(matches!(p.validate(), Err(ParamsError::InvalidRootCluster)));
    }
}
