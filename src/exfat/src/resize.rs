use crate::bitmap::{AllocError, FreeError};
use crate::cluster::{Allocation, Cluster, LastCluster};
use crate::disk::{Block, BlockDevice};
use crate::errno::{Errno, EFBIG, EIO};
use crate::fat::{Fat, FatError, LinkState};
use crate::node::Node;
use crate::writeback::WritebackError;
use crate::ExFat;
use log::{debug, error, warn};
use std::cmp::Ordering;
use std::num::NonZeroI32;
use thiserror::Error;

impl<D: BlockDevice> ExFat<D> {
    /// Changes the data length of `node` to `length` bytes and writes the entry set back.
    ///
    /// When this fails while growing, `node` and the volume are left as they were before the call.
    ///
    /// When a truncate fails after the chain was cut, `node` already has the new length and its
    /// entry set is still written before the error is returned.
    pub fn resize(&self, node: &mut Node, length: u64) -> Result<(), ResizeError> {
        let before = *node.stream();

        if let Err(e) = self.set_length(node, length) {
            if *node.stream() != before {
                if let Err(w) = self.writeback(node) {
                    warn!("Cannot write the entry set of node {}: {}.", node.key().entry(), w);
                }
            }

            return Err(e);
        }

        self.writeback(node)?;

        Ok(())
    }

    /// Same as [`Self::resize()`] but does not write the entry set.
    pub(crate) fn set_length(&self, node: &mut Node, length: u64) -> Result<(), ResizeError> {
        let old = self.params.clusters_for(node.stream().data_length());
        let new = self.params.clusters_for(length);

        if new > u64::from(self.params.cluster_count) {
            return Err(ResizeError::TooLarge(length));
        }

        match new.cmp(&old) {
            Ordering::Less => return self.truncate(node, old, new, length),
            Ordering::Equal => {}
            Ordering::Greater => self.extend(node, old, new)?,
        }

        commit_length(node, length);

        Ok(())
    }

    /// Gets the physical clusters of `node` in logical order.
    pub fn clusters(&self, node: &Node) -> Result<Vec<Cluster>, FatError> {
        let count = self.params.clusters_for(node.stream().data_length());

        match node.stream().alloc() {
            Allocation::Empty => Ok(Vec::new()),
            Allocation::Contiguous(first) => {
                self.check_run(first, count)?;

                Ok((0..count)
                    .map(|i| Cluster::new(first.index() + i as u32))
                    .collect())
            }
            Allocation::Chained(first) => {
                let chain: Vec<Cluster> = self.fat().chain(first).collect::<Result<_, _>>()?;

                if chain.len() as u64 != count {
                    error!(
                        "Chain at cluster {} has {} clusters while the data length need {}.",
                        first,
                        chain.len(),
                        count
                    );

                    return Err(FatError::LengthMismatch(first, count));
                }

                Ok(chain)
            }
        }
    }

    /// Gets the physical cluster for logical cluster `index` of a file with `count` clusters.
    ///
    /// `last` is used as a starting point when it is not past `index`.
    fn locate(
        &self,
        alloc: Allocation,
        last: Option<LastCluster>,
        count: u64,
        index: u64,
    ) -> Result<Cluster, FatError> {
        let (first, contiguous) = match alloc {
            Allocation::Empty => unreachable!("locating a cluster of an empty file"),
            Allocation::Contiguous(v) => (v, true),
            Allocation::Chained(v) => (v, false),
        };

        if contiguous {
            self.check_run(first, count)?;

            return Ok(Cluster::new(first.index() + index as u32));
        }

        let (mut logical, mut physical) = match last {
            Some(v) if v.logical <= index && v.logical < count => (v.logical, v.physical),
            _ => (0, first),
        };

        let fat = self.fat();

        while logical < index {
            physical = fat.next(physical)?;
            logical += 1;
        }

        Ok(physical)
    }

    fn check_run(&self, first: Cluster, count: u64) -> Result<(), FatError> {
        let end = u64::from(first.index()) + count;

        if end > u64::from(self.params.cluster_count) + 2 {
            error!(
                "Contiguous run of {} clusters at cluster {} is past the end of the heap.",
                count, first
            );

            return Err(FatError::InvalidRun(first, count));
        }

        Ok(())
    }

    fn extend(&self, node: &mut Node, old: u64, new: u64) -> Result<(), ResizeError> {
        let fat = self.fat();
        let directory = node.is_directory();
        let mut alloc = node.stream().alloc();
        let tail = match old {
            0 => None,
            n => Some(self.locate(alloc, node.last(), n, n - 1)?),
        };

        // Allocate and link the new clusters one by one.
        let mut added = Vec::with_capacity((new - old) as usize);
        let mut prev = tail;

        for _ in old..new {
            match self.append(&fat, &mut alloc, prev, directory, &mut added) {
                Ok(v) => prev = Some(v),
                Err(e) => {
                    self.unwind(&fat, tail, &added);
                    return Err(e);
                }
            }
        }

        debug!(
            "Node {} grown from {} to {} clusters ({} allocated).",
            node.key().entry(),
            old,
            new,
            added.len()
        );

        // Commit.
        let (stream, last) = node.alloc_mut();

        stream.alloc = alloc;
        *last = prev.map(|physical| LastCluster {
            logical: new - 1,
            physical,
        });

        Ok(())
    }

    /// Allocates one cluster and links it after `prev`.
    fn append(
        &self,
        fat: &Fat<'_, D>,
        alloc: &mut Allocation,
        prev: Option<Cluster>,
        directory: bool,
        added: &mut Vec<Cluster>,
    ) -> Result<Cluster, ResizeError> {
        let durable = self.config.sync;
        let cluster = self.bitmap.allocate(&self.disk, None, durable)?;

        added.push(cluster);

        // A directory cluster must not contain stale entries.
        if directory {
            self.zero_cluster(cluster)?;
        }

        fat.write_link(cluster, LinkState::End, durable)?;

        let prev = match prev {
            Some(v) => v,
            None => {
                *alloc = Allocation::Contiguous(cluster);
                return Ok(cluster);
            }
        };

        if let Allocation::Contiguous(first) = *alloc {
            if cluster.index() != prev.index() + 1 {
                debug!(
                    "Cluster {} does not follow {}, switching to a chain.",
                    cluster, prev
                );

                fat.link_run(first, prev, durable)?;
                *alloc = Allocation::Chained(first);
            }
        }

        fat.write_link(prev, LinkState::Next(cluster), durable)?;

        Ok(cluster)
    }

    /// Releases the clusters that was allocated by a failed extend.
    ///
    /// Failures here are only logged; any cluster that cannot be released is left as an
    /// unreferenced allocation.
    fn unwind(&self, fat: &Fat<'_, D>, tail: Option<Cluster>, added: &[Cluster]) {
        let durable = self.config.sync;

        if let Some(t) = tail {
            if let Err(e) = fat.write_link(t, LinkState::End, durable) {
                warn!("Cannot terminate the chain at cluster {}: {}.", t, e);
            }
        }

        for &c in added.iter().rev() {
            if let Err(e) = fat.write_link(c, LinkState::Free, durable) {
                warn!("Cannot clear FAT entry of cluster {}: {}.", c, e);
            }

            if let Err(e) = self.bitmap.free(&self.disk, c, durable) {
                warn!("Cluster {} is left allocated: {}.", c, e);
            }
        }
    }

    fn zero_cluster(&self, cluster: Cluster) -> Result<(), ResizeError> {
        let first = self.params.cluster_sector(cluster);
        let size = self.params.bytes_per_sector as usize;

        for lba in first..(first + self.params.sectors_per_cluster) {
            if let Err(e) = self.disk.write_block(&Block::zeroed(lba, size), self.config.sync) {
                return Err(ResizeError::ZeroFillFailed(lba, e));
            }
        }

        Ok(())
    }

    /// Cuts the allocation of `node` down to `new` clusters and sets its length to `length`.
    ///
    /// Nothing is changed if the new tail cannot be terminated. Once it is, `node` always follows
    /// the shorter chain and a cluster that cannot be released is left as an unreferenced
    /// allocation. The first of such failures is returned.
    fn truncate(
        &self,
        node: &mut Node,
        old: u64,
        new: u64,
        length: u64,
    ) -> Result<(), ResizeError> {
        let durable = self.config.sync;
        let fat = self.fat();
        let alloc = node.stream().alloc();

        // Cut at the new tail and get the first cluster to release.
        let (first, start) = match alloc {
            Allocation::Empty => unreachable!("truncating an empty file"),
            Allocation::Contiguous(first) => {
                self.check_run(first, old)?;

                if new > 0 {
                    let tail = Cluster::new(first.index() + new as u32 - 1);

                    fat.write_link(tail, LinkState::End, durable)?;
                }

                (first, Cluster::new(first.index() + new as u32))
            }
            Allocation::Chained(first) => match new {
                0 => (first, first),
                n => {
                    let tail = self.locate(alloc, node.last(), n, n - 1)?;
                    let next = fat.next(tail)?;

                    fat.write_link(tail, LinkState::End, durable)?;

                    (first, next)
                }
            },
        };

        // Commit.
        commit_length(node, length);

        let (stream, last) = node.alloc_mut();

        if new == 0 {
            stream.alloc = Allocation::Empty;
        }

        *last = None;

        debug!(
            "Node {} truncated from {} to {} clusters.",
            node.key().entry(),
            old,
            new
        );

        // Release the rest.
        let count = old - new;
        let failed = match alloc {
            Allocation::Contiguous(_) => self.release_run(&fat, start, count),
            _ => self.release_chain(&fat, first, start, count),
        };

        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release_run(&self, fat: &Fat<'_, D>, start: Cluster, count: u64) -> Option<ResizeError> {
        let mut failed: Option<ResizeError> = None;

        for i in 0..count {
            let c = Cluster::new(start.index() + i as u32);

            if let Err(e) = self.release(fat, c) {
                failed.get_or_insert(e);
            }
        }

        failed
    }

    fn release_chain(
        &self,
        fat: &Fat<'_, D>,
        first: Cluster,
        start: Cluster,
        count: u64,
    ) -> Option<ResizeError> {
        let mut failed: Option<ResizeError> = None;
        let mut current = start;

        for i in 0..count {
            // The link must be read before the entry is overwritten.
            let link = match fat.read_link(current) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        "Cannot follow the chain at cluster {}, {} clusters are left allocated.",
                        current,
                        count - i
                    );

                    return Some(failed.unwrap_or(e.into()));
                }
            };

            if let Err(e) = self.release(fat, current) {
                failed.get_or_insert(e);
            }

            if i + 1 == count {
                if link != LinkState::End {
                    error!(
                        "Chain at cluster {} is longer than its data length ({}).",
                        first, link
                    );
                }

                break;
            }

            current = match link {
                LinkState::Next(v) => v,
                v => {
                    warn!(
                        "Chain at cluster {} ends early, {} clusters may be left allocated.",
                        first,
                        count - i - 1
                    );

                    return Some(failed.unwrap_or(FatError::UnexpectedLink(current, v).into()));
                }
            };
        }

        failed
    }

    /// Frees `cluster` and marks its FAT entry as dead.
    fn release(&self, fat: &Fat<'_, D>, cluster: Cluster) -> Result<(), ResizeError> {
        let durable = self.config.sync;
        let mut failed: Option<ResizeError> = None;

        if let Err(e) = self.bitmap.free(&self.disk, cluster, durable) {
            warn!("Cluster {} is left allocated: {}.", cluster, e);
            failed = Some(e.into());
        }

        if let Err(e) = fat.write_link(cluster, LinkState::End, durable) {
            warn!("Cannot update FAT entry of cluster {}: {}.", cluster, e);
            failed.get_or_insert(e.into());
        }

        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Sets the data length of `node`. The whole allocation of a directory is always valid.
fn commit_length(node: &mut Node, length: u64) {
    let directory = node.is_directory();
    let (stream, _) = node.alloc_mut();

    stream.data_length = length;

    if directory {
        stream.valid_data_length = length;
    } else {
        stream.valid_data_length = stream.valid_data_length.min(length);
    }
}

/// Represents an error when [`ExFat::resize()`] fails.
#[derive(Debug, Error)]
pub enum ResizeError {
    #[error("{0} bytes is larger than the volume")]
    TooLarge(u64),

    #[error("cannot allocate a cluster")]
    AllocFailed(#[from] AllocError),

    #[error("cannot free a cluster")]
    FreeFailed(#[from] FreeError),

    #[error("cannot update the FAT")]
    FatFailed(#[from] FatError),

    #[error("cannot zero sector #{0}")]
    ZeroFillFailed(u64, #[source] std::io::Error),

    #[error("cannot write the entry set")]
    WritebackFailed(#[from] WritebackError),
}

impl Errno for ResizeError {
    fn errno(&self) -> NonZeroI32 {
        match self {
            Self::TooLarge(_) => EFBIG,
            Self::AllocFailed(e) => e.errno(),
            Self::FreeFailed(e) => e.errno(),
            Self::FatFailed(e) => e.errno(),
            Self::ZeroFillFailed(_, _) => EIO,
            Self::WritebackFailed(e) => e.errno(),
        }
    }
}
