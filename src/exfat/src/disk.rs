use std::fs::File;
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Provides sector-sized I/O for the volume.
///
/// A block written with [`BlockDevice::write_block()`] must be visible to the next
/// [`BlockDevice::read_block()`] as soon as the call returns, regardless of `durable`.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, lba: u64, size: usize) -> std::io::Result<Block>;

    /// When `durable` is `true` the data must reach the underlying storage before this returns.
    fn write_block(&self, block: &Block, durable: bool) -> std::io::Result<()>;
}

/// A buffer for one block on the [`BlockDevice`].
#[derive(Debug, Clone)]
pub struct Block {
    lba: u64,
    data: Box<[u8]>,
}

impl Block {
    pub fn new(lba: u64, data: impl Into<Box<[u8]>>) -> Self {
        Self {
            lba,
            data: data.into(),
        }
    }

    pub fn zeroed(lba: u64, size: usize) -> Self {
        Self::new(lba, vec![0u8; size])
    }

    pub fn lba(&self) -> u64 {
        self.lba
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

/// Backing storage of an [`Image`].
pub trait Storage: Read + Write + Seek {
    /// Makes every written byte reach the storage medium.
    fn sync(&mut self) -> std::io::Result<()>;
}

impl Storage for File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }
}

impl Storage for Cursor<Vec<u8>> {
    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Encapsulate an exFAT image as a [`BlockDevice`].
///
/// `I` can be a [`File`], an in-memory [`Cursor`] or anything else that implements [`Storage`].
pub struct Image<I: Storage> {
    inner: Mutex<I>,
}

impl<I: Storage> Image<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn into_inner(self) -> I {
        self.inner.into_inner().unwrap()
    }

    fn seek(inner: &mut I, lba: u64, size: usize) -> std::io::Result<()> {
        let offset = match lba.checked_mul(size as u64) {
            Some(v) => v,
            None => {
                return Err(std::io::Error::new(
                    ErrorKind::Other,
                    format!("block #{} is not available", lba),
                ));
            }
        };

        if inner.seek(SeekFrom::Start(offset))? != offset {
            return Err(std::io::Error::new(
                ErrorKind::Other,
                format!("block #{} is not available", lba),
            ));
        }

        Ok(())
    }
}

impl<I: Storage + Send> BlockDevice for Image<I> {
    fn read_block(&self, lba: u64, size: usize) -> std::io::Result<Block> {
        let mut inner = self.inner.lock().unwrap();
        let mut block = Block::zeroed(lba, size);

        Self::seek(&mut inner, lba, size)?;
        inner.read_exact(&mut block)?;

        Ok(block)
    }

    fn write_block(&self, block: &Block, durable: bool) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap();

        Self::seek(&mut inner, block.lba, block.len())?;
        inner.write_all(block)?;

        if durable {
            inner.flush()?;
            inner.sync()?;
        }

        Ok(())
    }
}
