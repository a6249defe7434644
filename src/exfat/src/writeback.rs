use crate::directory::entry::{checksum, ENTRY_SIZE};
use crate::disk::{Block, BlockDevice};
use crate::errno::{Errno, EINTEGRITY, EIO};
use crate::node::Node;
use crate::ExFat;
use byteorder::{ByteOrder, LE};
use log::{error, trace};
use std::num::NonZeroI32;
use thiserror::Error;

impl<D: BlockDevice> ExFat<D> {
    /// Writes the entry set of `node` to the records it was placed in.
    ///
    /// The Stream Extension is refreshed from the node and the SetChecksum is recomputed. Records
    /// without a location are skipped. The write is durable when the set is not in use or when
    /// [`Config::sync`](crate::Config::sync) is enabled. Nothing is written for the root directory
    /// or for a set that was already deleted.
    pub fn writeback(&self, node: &mut Node) -> Result<(), WritebackError> {
        let stream = *node.stream();
        let set = match node.entry_set_mut() {
            Some(v) => v,
            None => return Ok(()),
        };

        if set.is_deleted() {
            trace!("Skipping writeback of a deleted set.");
            return Ok(());
        }

        set.stream_mut().stream = stream;

        // Patch the records sector by sector. Other sets may live in the same sectors.
        let raw = set.encode();
        let durable = self.config.sync || !set.in_use();
        let patch = self.patch.lock().unwrap();
        let mut block: Option<Block> = None;

        for (record, addr) in raw.iter().zip(set.addrs()) {
            let addr = match addr {
                Some(v) => v,
                None => continue,
            };

            let mut current = match block.take() {
                Some(v) if v.lba() == addr.lba => v,
                prev => {
                    if let Some(v) = prev {
                        self.write_records(&v, durable)?;
                    }

                    self.read_records(addr.lba)?
                }
            };

            current[addr.offset..(addr.offset + ENTRY_SIZE)].copy_from_slice(record);
            block = Some(current);
        }

        if let Some(v) = block {
            self.write_records(&v, durable)?;
        }

        drop(patch);

        if self.config.verify_writeback && set.addrs().all(|a| a.is_some()) {
            let expected = LE::read_u16(&raw[0][2..]);
            let mut reread = Vec::with_capacity(raw.len());

            for addr in set.addrs().flatten() {
                let block = self.read_records(addr.lba)?;
                let mut record = [0u8; ENTRY_SIZE];

                record.copy_from_slice(&block[addr.offset..(addr.offset + ENTRY_SIZE)]);
                reread.push(record);
            }

            let stored = LE::read_u16(&reread[0][2..]);
            let actual = checksum(&reread);

            if stored != expected || actual != expected {
                error!(
                    "Entry set was written with checksum {:#06x} but read back as {:#06x}.",
                    expected, actual
                );

                return Err(WritebackError::ChecksumMismatch { expected, actual });
            }
        }

        Ok(())
    }

    fn read_records(&self, lba: u64) -> Result<Block, WritebackError> {
        match self
            .disk
            .read_block(lba, self.params.bytes_per_sector as usize)
        {
            Ok(v) => Ok(v),
            Err(e) => Err(WritebackError::ReadFailed(lba, e)),
        }
    }

    fn write_records(&self, block: &Block, durable: bool) -> Result<(), WritebackError> {
        match self.disk.write_block(block, durable) {
            Ok(_) => {
                trace!("Entry records written to sector #{}.", block.lba());
                Ok(())
            }
            Err(e) => Err(WritebackError::WriteFailed(block.lba(), e)),
        }
    }
}

/// Represents an error when [`ExFat::writeback()`] fails.
#[derive(Debug, Error)]
pub enum WritebackError {
    #[error("cannot read sector #{0}")]
    ReadFailed(u64, #[source] std::io::Error),

    #[error("cannot write sector #{0}")]
    WriteFailed(u64, #[source] std::io::Error),

    #[error("entry set checksum {expected:#06x} was read back as {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },
}

impl Errno for WritebackError {
    fn errno(&self) -> NonZeroI32 {
        match self {
            Self::ReadFailed(_, _) | Self::WriteFailed(_, _) => EIO,
            Self::ChecksumMismatch { .. } => EINTEGRITY,
        }
    }
}
