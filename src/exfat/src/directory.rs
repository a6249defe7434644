use self::entry::{
    DecodeError, EntryAddr, EntrySet, EntryType, FileAttributes, ENTRY_SIZE, MAX_SET_LEN,
};
use crate::cluster::Cluster;
use crate::disk::{Block, BlockDevice};
use crate::errno::{Errno, EINTEGRITY, EINVAL, EIO, ENOENT, ENOSPC, ENOTDIR};
use crate::fat::FatError;
use crate::node::{EntryKey, Node, NodeKey};
use crate::resize::ResizeError;
use crate::ExFat;
use log::{debug, trace};
use std::num::NonZeroI32;
use thiserror::Error;

pub mod entry;

/// Location of free directory records that can hold one entry set.
#[derive(Debug, Clone)]
pub struct SlotRun {
    offset: u64,
    key: EntryKey,
    addrs: Vec<EntryAddr>,
}

impl SlotRun {
    /// Byte offset of the first record within the directory.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn key(&self) -> EntryKey {
        self.key
    }

    pub fn addrs(&self) -> &[EntryAddr] {
        &self.addrs
    }
}

impl<D: BlockDevice> ExFat<D> {
    /// Finds `count` consecutive free records in `dir`, growing the directory when there is none.
    ///
    /// A record is free when its InUse bit is clear, which includes deleted records and the
    /// end-of-directory marker.
    pub fn find_slots(&self, dir: &mut Node, count: usize) -> Result<SlotRun, FindSlotsError> {
        if !dir.is_directory() {
            return Err(FindSlotsError::NotDirectory);
        } else if count == 0 || count > MAX_SET_LEN {
            return Err(FindSlotsError::InvalidCount(count));
        }

        // Scan the current allocation.
        let clusters = self.clusters(dir).map_err(FindSlotsError::ScanFailed)?;
        let length = dir.stream().data_length();

        if let Some(offset) = self.scan(&clusters, length, count)? {
            trace!("Found {} free records at {:#x} in {}.", count, offset, dir.key().entry());
            return Ok(self.slots_at(&clusters, offset, count));
        }

        // Grow the directory to fit the set after the last record.
        let cs = self.params.cluster_size();
        let grown = (length + (count * ENTRY_SIZE) as u64).next_multiple_of(cs);

        if grown > self.config.max_directory_size {
            return Err(FindSlotsError::DirectoryFull);
        }

        debug!(
            "Growing directory {} from {} to {} bytes.",
            dir.key().entry(),
            length,
            grown
        );

        self.resize(dir, grown).map_err(FindSlotsError::GrowFailed)?;

        let clusters = self.clusters(dir).map_err(FindSlotsError::ScanFailed)?;

        Ok(self.slots_at(&clusters, length, count))
    }

    /// Reads the entry set at byte `offset` of `dir`.
    ///
    /// The set is returned even when its InUse bit is clear.
    pub fn read_entry_set(&self, dir: &Node, offset: u64) -> Result<EntrySet, LoadEntrySetError> {
        if !dir.is_directory() {
            return Err(LoadEntrySetError::NotDirectory);
        }

        let clusters = self.clusters(dir).map_err(LoadEntrySetError::ScanFailed)?;
        let length = dir.stream().data_length();
        let mut reader = RecordReader::new(self, &clusters, length);

        // Read the primary record.
        let (addr, first) = reader.read(offset)?;
        let ty = EntryType::from(first[0]);

        if ty.with_in_use(true) != EntryType::FILE {
            return Err(LoadEntrySetError::NotFile(ty));
        }

        let secondaries = usize::from(first[1]);

        if secondaries < 1 || secondaries >= MAX_SET_LEN {
            return Err(LoadEntrySetError::InvalidSecondaryCount(first[1]));
        }

        // Read the secondaries.
        let mut raw = vec![first];
        let mut addrs = vec![addr];

        for i in 1..=secondaries {
            let (addr, record) = reader.read(offset + (i * ENTRY_SIZE) as u64)?;

            raw.push(record);
            addrs.push(addr);
        }

        EntrySet::decode(&self.params, &raw, &addrs).map_err(LoadEntrySetError::InvalidSet)
    }

    /// Gets a node for the in-use entry set at byte `offset` of `dir`.
    pub fn open_node(&self, dir: &Node, offset: u64) -> Result<Node, LoadEntrySetError> {
        let set = self.read_entry_set(dir, offset)?;

        if !set.in_use() {
            return Err(LoadEntrySetError::NotInUse(offset));
        }

        // Reading the set was successful so the chain is fine.
        let clusters = self.clusters(dir).map_err(LoadEntrySetError::ScanFailed)?;
        let key = self.key_at(&clusters, offset);
        let directory = set.file().attributes.contains(FileAttributes::DIRECTORY);
        let stream = set.stream().stream;

        Ok(Node::new(directory, stream, Some(set), NodeKey::Live(key)))
    }

    /// Gets the byte offset of the first run of `count` free records.
    fn scan(
        &self,
        clusters: &[Cluster],
        length: u64,
        count: usize,
    ) -> Result<Option<u64>, FindSlotsError> {
        let cs = self.params.cluster_size();
        let ss = self.params.bytes_per_sector;
        let mut start = 0;
        let mut run = 0;

        for (i, &cluster) in clusters.iter().enumerate() {
            let lba = self.params.cluster_sector(cluster);

            for s in 0..self.params.sectors_per_cluster {
                let base = i as u64 * cs + s * ss;

                if base >= length {
                    return Ok(None);
                }

                let block = match self.disk.read_block(lba + s, ss as usize) {
                    Ok(v) => v,
                    Err(e) => return Err(FindSlotsError::ReadFailed(lba + s, e)),
                };

                for (r, record) in block.chunks_exact(ENTRY_SIZE).enumerate() {
                    let offset = base + (r * ENTRY_SIZE) as u64;

                    if offset >= length {
                        return Ok(None);
                    } else if EntryType::from(record[0]).in_use() {
                        run = 0;
                        continue;
                    }

                    if run == 0 {
                        start = offset;
                    }

                    run += 1;

                    if run == count {
                        return Ok(Some(start));
                    }
                }
            }
        }

        Ok(None)
    }

    fn slots_at(&self, clusters: &[Cluster], offset: u64, count: usize) -> SlotRun {
        let addrs = (0..count)
            .map(|i| self.addr_at(clusters, offset + (i * ENTRY_SIZE) as u64))
            .collect();

        SlotRun {
            offset,
            key: self.key_at(clusters, offset),
            addrs,
        }
    }

    fn addr_at(&self, clusters: &[Cluster], offset: u64) -> EntryAddr {
        let cs = self.params.cluster_size();
        let ss = self.params.bytes_per_sector;
        let cluster = clusters[(offset / cs) as usize];
        let within = offset % cs;

        EntryAddr {
            lba: self.params.cluster_sector(cluster) + within / ss,
            offset: (within % ss) as usize,
        }
    }

    fn key_at(&self, clusters: &[Cluster], offset: u64) -> EntryKey {
        let cs = self.params.cluster_size();

        EntryKey {
            cluster: clusters[(offset / cs) as usize].index(),
            offset: (offset % cs) as u32,
        }
    }
}

/// Reads consecutive records, keeping the last sector around.
struct RecordReader<'a, D: BlockDevice> {
    fs: &'a ExFat<D>,
    clusters: &'a [Cluster],
    length: u64,
    block: Option<Block>,
}

impl<'a, D: BlockDevice> RecordReader<'a, D> {
    fn new(fs: &'a ExFat<D>, clusters: &'a [Cluster], length: u64) -> Self {
        Self {
            fs,
            clusters,
            length,
            block: None,
        }
    }

    fn read(&mut self, offset: u64) -> Result<(EntryAddr, [u8; ENTRY_SIZE]), LoadEntrySetError> {
        if offset % ENTRY_SIZE as u64 != 0 || offset + ENTRY_SIZE as u64 > self.length {
            return Err(LoadEntrySetError::OutOfRange(offset));
        }

        let addr = self.fs.addr_at(self.clusters, offset);
        let block = match self.block.take() {
            Some(v) if v.lba() == addr.lba => v,
            _ => {
                let size = self.fs.params.bytes_per_sector as usize;

                match self.fs.disk.read_block(addr.lba, size) {
                    Ok(v) => v,
                    Err(e) => return Err(LoadEntrySetError::ReadFailed(addr.lba, e)),
                }
            }
        };

        let mut record = [0u8; ENTRY_SIZE];

        record.copy_from_slice(&block[addr.offset..(addr.offset + ENTRY_SIZE)]);
        self.block = Some(block);

        Ok((addr, record))
    }
}

/// Represents an error when [`ExFat::find_slots()`] fails.
#[derive(Debug, Error)]
pub enum FindSlotsError {
    #[error("the node is not a directory")]
    NotDirectory,

    #[error("{0} is not a valid number of records for an entry set")]
    InvalidCount(usize),

    #[error("cannot enumerate clusters of the directory")]
    ScanFailed(#[source] FatError),

    #[error("cannot read sector #{0}")]
    ReadFailed(u64, #[source] std::io::Error),

    #[error("the directory reached its maximum size")]
    DirectoryFull,

    #[error("cannot grow the directory")]
    GrowFailed(#[source] ResizeError),
}

impl Errno for FindSlotsError {
    fn errno(&self) -> NonZeroI32 {
        match self {
            Self::NotDirectory => ENOTDIR,
            Self::InvalidCount(_) => EINVAL,
            Self::ScanFailed(e) => e.errno(),
            Self::ReadFailed(_, _) => EIO,
            Self::DirectoryFull => ENOSPC,
            Self::GrowFailed(e) => e.errno(),
        }
    }
}

/// Represents an error when [`ExFat::read_entry_set()`] or [`ExFat::open_node()`] fails.
#[derive(Debug, Error)]
pub enum LoadEntrySetError {
    #[error("the node is not a directory")]
    NotDirectory,

    #[error("cannot enumerate clusters of the directory")]
    ScanFailed(#[source] FatError),

    #[error("offset {0:#x} is not a record within the directory")]
    OutOfRange(u64),

    #[error("cannot read sector #{0}")]
    ReadFailed(u64, #[source] std::io::Error),

    #[error("record at the specified offset is {0}")]
    NotFile(EntryType),

    #[error("SecondaryCount {0} is not valid")]
    InvalidSecondaryCount(u8),

    #[error("invalid entry set")]
    InvalidSet(#[source] DecodeError),

    #[error("entry set at {0:#x} is not in use")]
    NotInUse(u64),
}

impl Errno for LoadEntrySetError {
    fn errno(&self) -> NonZeroI32 {
        match self {
            Self::NotDirectory => ENOTDIR,
            Self::ScanFailed(e) => e.errno(),
            Self::OutOfRange(_) => EINVAL,
            Self::ReadFailed(_, _) => EIO,
            Self::NotFile(_) | Self::InvalidSecondaryCount(_) | Self::InvalidSet(_) => EINTEGRITY,
            Self::NotInUse(_) => ENOENT,
        }
    }
}
