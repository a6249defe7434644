use crate::cluster::Cluster;
use crate::disk::BlockDevice;
use crate::errno::{Errno, EINTEGRITY, EIO};
use crate::param::Params;
use byteorder::{ByteOrder, LE};
use log::error;
use std::fmt::{Display, Formatter};
use std::num::NonZeroI32;
use std::sync::Mutex;
use thiserror::Error;

/// State of a FAT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Free,
    Next(Cluster),
    Bad,
    End,
}

impl LinkState {
    const FREE: u32 = 0;
    const BAD: u32 = 0xFFFFFFF7;
    const END: u32 = 0xFFFFFFFF;

    fn raw(self) -> u32 {
        match self {
            Self::Free => Self::FREE,
            Self::Next(v) => v.index(),
            Self::Bad => Self::BAD,
            Self::End => Self::END,
        }
    }
}

impl Display for LinkState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => f.write_str("free"),
            Self::Next(v) => write!(f, "next {}", v),
            Self::Bad => f.write_str("bad"),
            Self::End => f.write_str("end of chain"),
        }
    }
}

/// Accessor for the active FAT of the volume.
///
/// Nothing is cached here; each access goes to the [`BlockDevice`]. A FAT sector holds the links
/// of many files so `patch` must be held while one of its entries is replaced.
pub(crate) struct Fat<'a, D: BlockDevice + ?Sized> {
    params: &'a Params,
    disk: &'a D,
    patch: &'a Mutex<()>,
}

impl<'a, D: BlockDevice + ?Sized> Fat<'a, D> {
    pub fn new(params: &'a Params, disk: &'a D, patch: &'a Mutex<()>) -> Self {
        Self {
            params,
            disk,
            patch,
        }
    }

    pub fn read_link(&self, cluster: Cluster) -> Result<LinkState, FatError> {
        let (lba, offset) = self.params.fat_entry(cluster);
        let block = match self.disk.read_block(lba, self.params.bytes_per_sector as usize) {
            Ok(v) => v,
            Err(e) => return Err(FatError::ReadFailed(lba, e)),
        };

        let value = LE::read_u32(&block[offset..]);

        match value {
            LinkState::FREE => Ok(LinkState::Free),
            LinkState::BAD => Ok(LinkState::Bad),
            LinkState::END => Ok(LinkState::End),
            v => match self.params.cluster(v) {
                Some(v) => Ok(LinkState::Next(v)),
                None => {
                    error!("FAT entry of cluster {} has invalid value {:#x}.", cluster, value);
                    Err(FatError::InvalidLink(cluster, value))
                }
            },
        }
    }

    pub fn write_link(
        &self,
        cluster: Cluster,
        link: LinkState,
        durable: bool,
    ) -> Result<(), FatError> {
        let _patch = self.patch.lock().unwrap();
        let (lba, offset) = self.params.fat_entry(cluster);
        let mut block = match self.disk.read_block(lba, self.params.bytes_per_sector as usize) {
            Ok(v) => v,
            Err(e) => return Err(FatError::ReadFailed(lba, e)),
        };

        LE::write_u32(&mut block[offset..], link.raw());

        if let Err(e) = self.disk.write_block(&block, durable) {
            return Err(FatError::WriteFailed(lba, e));
        }

        Ok(())
    }

    /// Links `first..=last` together in order. The link of `last` is not touched.
    pub fn link_run(&self, first: Cluster, last: Cluster, durable: bool) -> Result<(), FatError> {
        for i in first.index()..last.index() {
            let next = Cluster::new(i + 1);

            self.write_link(Cluster::new(i), LinkState::Next(next), durable)?;
        }

        Ok(())
    }

    /// Gets the cluster that follows `cluster` in a chain that must continue.
    pub fn next(&self, cluster: Cluster) -> Result<Cluster, FatError> {
        match self.read_link(cluster)? {
            LinkState::Next(v) => Ok(v),
            v => {
                error!("Chain is broken at cluster {} ({}).", cluster, v);
                Err(FatError::UnexpectedLink(cluster, v))
            }
        }
    }

    pub fn chain(&self, first: Cluster) -> ClusterChain<'_, 'a, D> {
        ClusterChain {
            fat: self,
            next: Some(first),
            visited: 0,
        }
    }
}

/// Iterator over a cluster chain. The iteration stop after the cluster that is marked as the end.
pub(crate) struct ClusterChain<'f, 'a, D: BlockDevice + ?Sized> {
    fat: &'f Fat<'a, D>,
    next: Option<Cluster>,
    visited: u32,
}

impl<'f, 'a, D: BlockDevice + ?Sized> Iterator for ClusterChain<'f, 'a, D> {
    type Item = Result<Cluster, FatError>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;

        // A chain cannot be longer than the heap.
        if self.visited == self.fat.params.cluster_count {
            error!("Cluster chain contains a loop at cluster {}.", current);
            return Some(Err(FatError::ChainLoop(current)));
        }

        self.visited += 1;

        // Move to next entry.
        match self.fat.read_link(current) {
            Ok(LinkState::Next(v)) => self.next = Some(v),
            Ok(LinkState::End) => {}
            Ok(v) => return Some(Err(FatError::UnexpectedLink(current, v))),
            Err(e) => return Some(Err(e)),
        }

        Some(Ok(current))
    }
}

/// Represents an error when the FAT cannot be accessed or contains an inconsistent chain.
#[derive(Debug, Error)]
pub enum FatError {
    #[error("FAT entry of cluster {0} has invalid value {1:#x}")]
    InvalidLink(Cluster, u32),

    #[error("cluster {0} is {1} while the chain should continue")]
    UnexpectedLink(Cluster, LinkState),

    #[error("cluster chain loops back at cluster {0}")]
    ChainLoop(Cluster),

    #[error("cluster chain starting at {0} does not have {1} clusters")]
    LengthMismatch(Cluster, u64),

    #[error("contiguous run starting at {0} with {1} clusters is outside the cluster heap")]
    InvalidRun(Cluster, u64),

    #[error("cannot read sector #{0}")]
    ReadFailed(u64, #[source] std::io::Error),

    #[error("cannot write sector #{0}")]
    WriteFailed(u64, #[source] std::io::Error),
}

impl Errno for FatError {
    fn errno(&self) -> NonZeroI32 {
        match self {
            Self::InvalidLink(_, _)
            | Self::UnexpectedLink(_, _)
            | Self::ChainLoop(_)
            | Self::LengthMismatch(_, _)
            | Self::InvalidRun(_, _) => EINTEGRITY,
            Self::ReadFailed(_, _) | Self::WriteFailed(_, _) => EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{params, TestImage};

    #[test]
    fn link_round_trip() {
        let p = params();
        let image = TestImage::new();
        let lock = Mutex::default();
        let fat = Fat::new(&p, &image, &lock);
        let a = Cluster::new(5);

        fat.write_link(a, LinkState::Next(Cluster::new(9)), false).unwrap();
        assert_eq!(fat.read_link(a).unwrap(), LinkState::Next(Cluster::new(9)));

        fat.write_link(a, LinkState::Bad, false).unwrap();
        assert_eq!(fat.read_link(a).unwrap(), LinkState::Bad);

        fat.write_link(a, LinkState::End, false).unwrap();
        assert_eq!(fat.read_link(a).unwrap(), LinkState::End);
        assert_eq!(fat.read_link(Cluster::new(6)).unwrap(), LinkState::Free);
    }

    #[test]
    fn invalid_link() {
        let p = params();
        let image = TestImage::new();
        let lock = Mutex::default();
        let fat = Fat::new(&p, &image, &lock);

        image.set_fat(5, 1);
        image.set_fat(6, p.cluster_count + 2);

        assert!(matches!(
            fat.read_link(Cluster::new(5)),
            Err(FatError::InvalidLink(_, 1))
        ));
        assert!(matches!(
            fat.read_link(Cluster::new(6)),
            Err(FatError::InvalidLink(_, _))
        ));
    }

    #[test]
    fn chain() {
        let p = params();
        let image = TestImage::new();
        let lock = Mutex::default();
        let fat = Fat::new(&p, &image, &lock);

        fat.link_run(Cluster::new(5), Cluster::new(7), false).unwrap();
        fat.write_link(Cluster::new(7), LinkState::End, false).unwrap();

        let chain: Vec<u32> = fat
            .chain(Cluster::new(5))
            .map(|c| c.unwrap().index())
            .collect();

        assert_eq!(chain, [5, 6, 7]);
    }

    #[test]
    fn chain_loop() {
        let p = params();
        let image = TestImage::new();
        let lock = Mutex::default();
        let fat = Fat::new(&p, &image, &lock);

        image.set_fat(5, 6);
        image.set_fat(6, 5);

        let last = fat.chain(Cluster::new(5)).last().unwrap();

        assert!(matches!(last, Err(FatError::ChainLoop(_))));
    }

    #[test]
    fn chain_broken() {
        let p = params();
        let image = TestImage::new();
        let lock = Mutex::default();
        let fat = Fat::new(&p, &image, &lock);

        image.set_fat(5, 6);

        let r: Result<Vec<Cluster>, FatError> = fat.chain(Cluster::new(5)).collect();

        assert!(matches!(
            r,
            Err(FatError::UnexpectedLink(c, LinkState::Free)) if c.index() == 6
        ));
    }
}
