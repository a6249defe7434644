use crate::config::Config;
use crate::disk::{Block, BlockDevice, Image};
use crate::param::{Params, VolumeFlags};
use crate::ExFat;
use byteorder::{ByteOrder, LE};
use std::io::{Cursor, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Geometry of the volume used by the tests: 4 KiB clusters, 64 clusters, the bitmap lives in
/// cluster 2 and the root directory in cluster 3.
pub(crate) fn params() -> Params {
    Params {
        fat_offset: 24,
        fat_length: 1,
        bitmap_offset: 32,
        cluster_heap_offset: 32,
        cluster_count: 64,
        first_cluster_of_root_directory: 3,
        volume_flags: VolumeFlags::default(),
        bytes_per_sector: 512,
        sectors_per_cluster: 8,
        number_of_fats: 1,
    }
}

/// In-memory volume that remembers every write.
pub(crate) struct TestImage {
    image: Image<Cursor<Vec<u8>>>,
    writes: Mutex<Vec<(u64, bool)>>,
}

impl TestImage {
    pub fn new() -> Self {
        let p = params();
        let sectors = p.cluster_heap_offset + u64::from(p.cluster_count) * p.sectors_per_cluster;
        let data = vec![0u8; (sectors * p.bytes_per_sector) as usize];

        Self {
            image: Image::new(Cursor::new(data)),
            writes: Mutex::default(),
        }
    }

    /// Sets the bitmap bits of `clusters` without going through the allocator.
    pub fn set_used(&self, clusters: &[u32]) {
        let p = params();

        for &c in clusters {
            let bit = (c - 2) as usize;

            self.patch(p.bitmap_offset, |b| b[bit / 8] |= 1 << (bit % 8));
        }
    }

    pub fn set_fat(&self, cluster: u32, value: u32) {
        let offset = cluster as usize * 4;

        self.patch(params().fat_offset, |b| LE::write_u32(&mut b[offset..], value));
    }

    pub fn fat(&self, cluster: u32) -> u32 {
        let block = self.image.read_block(params().fat_offset, 512).unwrap();

        LE::read_u32(&block[(cluster as usize * 4)..])
    }

    /// Writes raw bytes at the specified byte offset of the image.
    pub fn poke(&self, offset: u64, data: &[u8]) {
        let lba = offset / 512;
        let start = (offset % 512) as usize;

        self.patch(lba, |b| b[start..(start + data.len())].copy_from_slice(data));
    }

    pub fn peek(&self, offset: u64, len: usize) -> Vec<u8> {
        let block = self.image.read_block(offset / 512, 512).unwrap();
        let start = (offset % 512) as usize;

        block[start..(start + len)].to_vec()
    }

    pub fn writes(&self) -> Vec<(u64, bool)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    fn patch(&self, lba: u64, f: impl FnOnce(&mut [u8])) {
        let mut block = self.image.read_block(lba, 512).unwrap();

        f(&mut block);

        self.image.write_block(&block, false).unwrap();
    }
}

impl BlockDevice for TestImage {
    fn read_block(&self, lba: u64, size: usize) -> std::io::Result<Block> {
        self.image.read_block(lba, size)
    }

    fn write_block(&self, block: &Block, durable: bool) -> std::io::Result<()> {
        self.writes.lock().unwrap().push((block.lba(), durable));
        self.image.write_block(block, durable)
    }
}

/// Byte offset of `cluster` within the image.
pub(crate) fn cluster_offset(cluster: u32) -> u64 {
    let p = params();

    p.cluster_sector(crate::cluster::Cluster::new(cluster)) * p.bytes_per_sector
}

/// Creates a volume where the bitmap and a one cluster root directory are the only allocations
/// besides `used`.
pub(crate) fn volume(used: &[u32]) -> ExFat<TestImage> {
    volume_with(used, Config::default())
}

pub(crate) fn volume_with(used: &[u32], config: Config) -> ExFat<TestImage> {
    ExFat::new(image(used), params(), config).unwrap()
}

/// Creates the image behind [`volume()`].
pub(crate) fn image(used: &[u32]) -> TestImage {
    let image = TestImage::new();

    image.set_used(&[2, 3]);
    image.set_used(used);
    image.set_fat(2, 0xFFFFFFFF);
    image.set_fat(3, 0xFFFFFFFF);

    image
}

/// [`TestImage`] that fails every write to the Allocation Bitmap while `broken` is set.
pub(crate) struct BrokenBitmap {
    pub image: TestImage,
    pub broken: AtomicBool,
}

impl BlockDevice for BrokenBitmap {
    fn read_block(&self, lba: u64, size: usize) -> std::io::Result<Block> {
        self.image.read_block(lba, size)
    }

    fn write_block(&self, block: &Block, durable: bool) -> std::io::Result<()> {
        if block.lba() == params().bitmap_offset && self.broken.load(Ordering::Relaxed) {
            return Err(std::io::Error::new(ErrorKind::Other, "bitmap is read-only"));
        }

        self.image.write_block(block, durable)
    }
}
