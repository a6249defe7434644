/// Runtime configurations for a mounted volume.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Issue every metadata write as a durable write.
    ///
    /// When this is `false` only the entry sets that are being deleted are written durably.
    pub sync: bool,
    /// Re-read each entry set after it was written and verify its checksum.
    pub verify_writeback: bool,
    /// Maximum size of a directory, in bytes.
    pub max_directory_size: u64,
}

impl Config {
    /// The largest directory allowed by exFAT.
    pub const MAX_DIRECTORY_SIZE: u64 = 256 * 1024 * 1024;
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync: false,
            verify_writeback: false,
            max_directory_size: Self::MAX_DIRECTORY_SIZE,
        }
    }
}
