use crate::cluster::{Allocation, Cluster, Stream};
use crate::param::Params;
use bitflags::bitflags;
use byteorder::{ByteOrder, LE};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Size of a directory entry, in bytes.
pub const ENTRY_SIZE: usize = 32;

/// Maximum number of entries in a set: File + Stream Extension + 17 File Name.
pub const MAX_SET_LEN: usize = 19;

/// Maximum length of a file name, in UTF-16 code units.
pub const MAX_NAME_LEN: usize = 255;

const NAME_PER_ENTRY: usize = 15;

/// Type byte of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EntryType(u8);

impl EntryType {
    pub const PRIMARY: u8 = 0;
    pub const SECONDARY: u8 = 1;
    pub const CRITICAL: u8 = 0;
    pub const BENIGN: u8 = 1;

    pub const FILE: Self = Self(0x85);
    pub const STREAM_EXTENSION: Self = Self(0xC0);
    pub const FILE_NAME: Self = Self(0xC1);

    pub fn in_use(self) -> bool {
        (self.0 & 0x80) != 0
    }

    pub fn type_code(self) -> u8 {
        self.0 & 0x1f
    }

    pub fn type_importance(self) -> u8 {
        (self.0 & 0x20) >> 5
    }

    pub fn type_category(self) -> u8 {
        (self.0 & 0x40) >> 6
    }

    /// Same type with the InUse bit set to `v`.
    pub fn with_in_use(self, v: bool) -> Self {
        if v {
            Self(self.0 | 0x80)
        } else {
            Self(self.0 & !0x80)
        }
    }

    /// Compare the type ignoring the InUse bit.
    fn is(self, other: Self) -> bool {
        (self.0 | 0x80) == (other.0 | 0x80)
    }
}

impl From<u8> for EntryType {
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl Display for EntryType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0 & 0x7f != 0 {
            if !self.in_use() {
                f.write_str("unused ")?;
            }

            if self.type_importance() == EntryType::CRITICAL {
                f.write_str("critical ")?;
            } else {
                f.write_str("benign ")?;
            }

            if self.type_category() == EntryType::PRIMARY {
                f.write_str("primary ")?;
            } else {
                f.write_str("secondary ")?;
            }

            write!(f, "{}", self.type_code())
        } else {
            write!(f, "{:#04x}", self.0)
        }
    }
}

bitflags! {
    /// FileAttributes field of a File entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u16 {
        const READ_ONLY = 0x0001;
        const HIDDEN = 0x0002;
        const SYSTEM = 0x0004;
        const DIRECTORY = 0x0010;
        const ARCHIVE = 0x0020;
    }
}

bitflags! {
    /// GeneralSecondaryFlags field of a secondary entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecondaryFlags: u8 {
        const ALLOCATION_POSSIBLE = 0x01;
        const NO_FAT_CHAIN = 0x02;
    }
}

/// Location of one directory entry on the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryAddr {
    pub lba: u64,
    pub offset: usize, // within the sector
}

/// File directory entry.
///
/// The timestamps are kept in their on-disk encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub attributes: FileAttributes,
    pub create_timestamp: u32,
    pub last_modified_timestamp: u32,
    pub last_accessed_timestamp: u32,
    pub create_10ms_increment: u8,
    pub last_modified_10ms_increment: u8,
    pub create_utc_offset: u8,
    pub last_modified_utc_offset: u8,
    pub last_accessed_utc_offset: u8,
}

/// Stream Extension directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub name_length: u8,
    pub name_hash: u16,
    pub stream: Stream,
}

/// File Name directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub name: [u16; NAME_PER_ENTRY],
}

/// One record of an entry set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    File(FileEntry),
    Stream(StreamEntry),
    Name(NameEntry),
    /// A benign secondary entry we don't interpret. The InUse bit is still managed by the set.
    Other([u8; ENTRY_SIZE]),
}

impl Record {
    fn encode(&self, in_use: bool, raw: &mut [u8; ENTRY_SIZE]) {
        *raw = [0u8; ENTRY_SIZE];

        match self {
            Self::File(e) => {
                raw[0] = EntryType::FILE.with_in_use(in_use).0;
                LE::write_u16(&mut raw[4..], e.attributes.bits());
                LE::write_u32(&mut raw[8..], e.create_timestamp);
                LE::write_u32(&mut raw[12..], e.last_modified_timestamp);
                LE::write_u32(&mut raw[16..], e.last_accessed_timestamp);
                raw[20] = e.create_10ms_increment;
                raw[21] = e.last_modified_10ms_increment;
                raw[22] = e.create_utc_offset;
                raw[23] = e.last_modified_utc_offset;
                raw[24] = e.last_accessed_utc_offset;
            }
            Self::Stream(e) => {
                let s = &e.stream;
                let mut flags = SecondaryFlags::ALLOCATION_POSSIBLE;

                if s.alloc.is_contiguous() {
                    flags |= SecondaryFlags::NO_FAT_CHAIN;
                }

                raw[0] = EntryType::STREAM_EXTENSION.with_in_use(in_use).0;
                raw[1] = flags.bits();
                raw[3] = e.name_length;
                LE::write_u16(&mut raw[4..], e.name_hash);
                LE::write_u64(&mut raw[8..], s.valid_data_length);
                LE::write_u32(&mut raw[20..], s.alloc.first().map_or(0, Cluster::index));
                LE::write_u64(&mut raw[24..], s.data_length);
            }
            Self::Name(e) => {
                raw[0] = EntryType::FILE_NAME.with_in_use(in_use).0;

                for (i, &c) in e.name.iter().enumerate() {
                    LE::write_u16(&mut raw[(2 + i * 2)..], c);
                }
            }
            Self::Other(v) => {
                *raw = *v;
                raw[0] = EntryType(v[0]).with_in_use(in_use).0;
            }
        }
    }

    fn decode(params: &Params, raw: &[u8; ENTRY_SIZE]) -> Result<Self, RecordError> {
        let ty = EntryType(raw[0]);

        if ty.is(EntryType::FILE) {
            Ok(Self::File(FileEntry {
                attributes: FileAttributes::from_bits_retain(LE::read_u16(&raw[4..])),
                create_timestamp: LE::read_u32(&raw[8..]),
                last_modified_timestamp: LE::read_u32(&raw[12..]),
                last_accessed_timestamp: LE::read_u32(&raw[16..]),
                create_10ms_increment: raw[20],
                last_modified_10ms_increment: raw[21],
                create_utc_offset: raw[22],
                last_modified_utc_offset: raw[23],
                last_accessed_utc_offset: raw[24],
            }))
        } else if ty.is(EntryType::STREAM_EXTENSION) {
            let flags = SecondaryFlags::from_bits_retain(raw[1]);
            let valid_data_length = LE::read_u64(&raw[8..]);
            let first_cluster = LE::read_u32(&raw[20..]);
            let data_length = LE::read_u64(&raw[24..]);

            if !flags.contains(SecondaryFlags::ALLOCATION_POSSIBLE) || raw[3] == 0 {
                return Err(RecordError::InvalidStreamExtension);
            } else if valid_data_length > data_length {
                return Err(RecordError::InvalidValidDataLength);
            }

            let alloc = if first_cluster == 0 {
                if data_length != 0 {
                    return Err(RecordError::InvalidDataLength);
                }

                Allocation::Empty
            } else {
                let first = match params.cluster(first_cluster) {
                    Some(v) => v,
                    None => return Err(RecordError::InvalidFirstCluster(first_cluster)),
                };

                if data_length == 0 {
                    return Err(RecordError::InvalidDataLength);
                } else if flags.contains(SecondaryFlags::NO_FAT_CHAIN) {
                    Allocation::Contiguous(first)
                } else {
                    Allocation::Chained(first)
                }
            };

            Ok(Self::Stream(StreamEntry {
                name_length: raw[3],
                name_hash: LE::read_u16(&raw[4..]),
                stream: Stream {
                    alloc,
                    data_length,
                    valid_data_length,
                },
            }))
        } else if ty.is(EntryType::FILE_NAME) {
            let mut name = [0u16; NAME_PER_ENTRY];

            for (i, c) in name.iter_mut().enumerate() {
                *c = LE::read_u16(&raw[(2 + i * 2)..]);
            }

            Ok(Self::Name(NameEntry { name }))
        } else if ty.type_category() == EntryType::SECONDARY
            && ty.type_importance() == EntryType::BENIGN
        {
            Ok(Self::Other(*raw))
        } else {
            Err(RecordError::UnknownEntry(ty))
        }
    }
}

/// Computes the SetChecksum of the encoded records.
///
/// Bytes 2 and 3 of the first record (the checksum itself) are not included.
pub fn checksum(records: &[[u8; ENTRY_SIZE]]) -> u16 {
    let mut sum = 0u16;

    for (i, r) in records.iter().enumerate() {
        for (j, &b) in r.iter().enumerate() {
            if i == 0 && (j == 2 || j == 3) {
                continue;
            }

            sum = ((sum << 15) | (sum >> 1)).wrapping_add(b.into());
        }
    }

    sum
}

/// Computes the NameHash of a file name.
///
/// Only characters that upper-case to a single UTF-16 code unit are folded; others are hashed
/// as-is.
pub fn name_hash(name: &[u16]) -> u16 {
    let mut hash = 0u16;

    for &c in name {
        let c = upcase(c);

        hash = ((hash << 15) | (hash >> 1)).wrapping_add(c & 0xff);
        hash = ((hash << 15) | (hash >> 1)).wrapping_add(c >> 8);
    }

    hash
}

fn upcase(c: u16) -> u16 {
    let Some(ch) = char::from_u32(c.into()) else {
        return c;
    };

    let mut upper = ch.to_uppercase();

    match (upper.next(), upper.next()) {
        (Some(u), None) if (u as u32) <= 0xFFFF => u as u16,
        _ => c,
    }
}

/// One record of an [`EntrySet`] with the address it lives at.
#[derive(Debug, Clone)]
pub struct SetEntry {
    record: Record,
    addr: Option<EntryAddr>,
}

impl SetEntry {
    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn addr(&self) -> Option<EntryAddr> {
        self.addr
    }
}

/// The records that represent one file or directory.
///
/// The first record is always [`Record::File`] and the second is always [`Record::Stream`]. Every
/// record shares the InUse bit and the checksum of the set.
#[derive(Debug, Clone)]
pub struct EntrySet {
    entries: Vec<SetEntry>,
    in_use: bool,
    deleted: bool, // written to the disk with InUse cleared
}

impl EntrySet {
    /// Creates an unplaced and inactive set for a new file.
    pub fn new(name: &str, attributes: FileAttributes) -> Result<Self, NewSetError> {
        let name: Vec<u16> = name.encode_utf16().collect();

        if name.is_empty() {
            return Err(NewSetError::EmptyName);
        } else if name.len() > MAX_NAME_LEN {
            return Err(NewSetError::NameTooLong);
        }

        let mut entries = Vec::with_capacity(2 + name.len().div_ceil(NAME_PER_ENTRY));
        let file = FileEntry {
            attributes,
            create_timestamp: 0,
            last_modified_timestamp: 0,
            last_accessed_timestamp: 0,
            create_10ms_increment: 0,
            last_modified_10ms_increment: 0,
            create_utc_offset: 0,
            last_modified_utc_offset: 0,
            last_accessed_utc_offset: 0,
        };

        entries.push(Record::File(file));
        entries.push(Record::Stream(StreamEntry {
            name_length: name.len() as u8,
            name_hash: name_hash(&name),
            stream: Stream::empty(),
        }));

        for chunk in name.chunks(NAME_PER_ENTRY) {
            let mut e = NameEntry {
                name: [0u16; NAME_PER_ENTRY],
            };

            e.name[..chunk.len()].copy_from_slice(chunk);
            entries.push(Record::Name(e));
        }

        Ok(Self {
            entries: entries
                .into_iter()
                .map(|record| SetEntry { record, addr: None })
                .collect(),
            in_use: false,
            deleted: false,
        })
    }

    /// Decodes a set that was read from `addrs`.
    pub(crate) fn decode(
        params: &Params,
        raw: &[[u8; ENTRY_SIZE]],
        addrs: &[EntryAddr],
    ) -> Result<Self, DecodeError> {
        if raw.len() < 2 || raw.len() > MAX_SET_LEN || raw.len() != addrs.len() {
            return Err(DecodeError::InvalidLength(raw.len()));
        }

        let in_use = EntryType(raw[0][0]).in_use();
        let stored = LE::read_u16(&raw[0][2..]);
        let computed = checksum(raw);

        if stored != computed {
            return Err(DecodeError::ChecksumMismatch { stored, computed });
        }

        let mut entries = Vec::with_capacity(raw.len());

        for (i, r) in raw.iter().enumerate() {
            let record = match Record::decode(params, r) {
                Ok(v) => v,
                Err(e) => return Err(DecodeError::InvalidRecord(i, e)),
            };

            let valid = match i {
                0 => matches!(record, Record::File(_)),
                1 => matches!(record, Record::Stream(_)),
                _ => matches!(record, Record::Name(_) | Record::Other(_)),
            };

            if !valid || EntryType(r[0]).in_use() != in_use {
                return Err(DecodeError::UnexpectedRecord(i, EntryType(r[0])));
            }

            entries.push(SetEntry {
                record,
                addr: Some(addrs[i]),
            });
        }

        // Check if the name fit in the File Name entries.
        let names = entries
            .iter()
            .filter(|e| matches!(e.record, Record::Name(_)))
            .count();
        let name_length = match &entries[1].record {
            Record::Stream(s) => usize::from(s.name_length),
            _ => unreachable!(),
        };

        if names != name_length.div_ceil(NAME_PER_ENTRY) {
            return Err(DecodeError::WrongFileNames(names, name_length));
        }

        Ok(Self {
            entries,
            in_use,
            deleted: false,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SetEntry] {
        &self.entries
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub(crate) fn set_in_use(&mut self, v: bool) {
        self.in_use = v;
    }

    /// `true` once the set has been written with InUse cleared.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn set_deleted(&mut self) {
        self.deleted = true;
    }

    pub fn file(&self) -> &FileEntry {
        match &self.entries[0].record {
            Record::File(v) => v,
            _ => unreachable!(),
        }
    }

    pub fn file_mut(&mut self) -> &mut FileEntry {
        match &mut self.entries[0].record {
            Record::File(v) => v,
            _ => unreachable!(),
        }
    }

    pub fn stream(&self) -> &StreamEntry {
        match &self.entries[1].record {
            Record::Stream(v) => v,
            _ => unreachable!(),
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut StreamEntry {
        match &mut self.entries[1].record {
            Record::Stream(v) => v,
            _ => unreachable!(),
        }
    }

    /// Gets the name from the File Name entries.
    pub fn name(&self) -> String {
        let len = usize::from(self.stream().name_length);
        let units: Vec<u16> = self
            .entries
            .iter()
            .filter_map(|e| match &e.record {
                Record::Name(n) => Some(n.name),
                _ => None,
            })
            .flatten()
            .take(len)
            .collect();

        String::from_utf16_lossy(&units)
    }

    pub fn addrs(&self) -> impl Iterator<Item = Option<EntryAddr>> + '_ {
        self.entries.iter().map(|e| e.addr)
    }

    /// Assigns the on-disk location of each record. This is done once when the set is created.
    pub(crate) fn place(&mut self, addrs: &[EntryAddr]) {
        debug_assert_eq!(addrs.len(), self.entries.len());

        for (e, &a) in self.entries.iter_mut().zip(addrs) {
            e.addr = Some(a);
        }
    }

    /// Encodes all records and updates SecondaryCount and SetChecksum of the first one.
    pub fn encode(&self) -> Vec<[u8; ENTRY_SIZE]> {
        let mut raw = vec![[0u8; ENTRY_SIZE]; self.entries.len()];

        for (e, r) in self.entries.iter().zip(raw.iter_mut()) {
            e.record.encode(self.in_use, r);
        }

        raw[0][1] = (self.entries.len() - 1) as u8;

        let sum = checksum(&raw);

        LE::write_u16(&mut raw[0][2..], sum);

        raw
    }
}

/// Represents an error when [`EntrySet::new()`] fails.
#[derive(Debug, Error)]
pub enum NewSetError {
    #[error("file name is empty")]
    EmptyName,

    #[error("file name is too long")]
    NameTooLong,
}

/// Represents an error when a single record cannot be decoded.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("unknown entry ({0})")]
    UnknownEntry(EntryType),

    #[error("invalid stream extension")]
    InvalidStreamExtension,

    #[error("ValidDataLength is larger than DataLength")]
    InvalidValidDataLength,

    #[error("invalid DataLength")]
    InvalidDataLength,

    #[error("invalid FirstCluster {0}")]
    InvalidFirstCluster(u32),
}

/// Represents an error when [`EntrySet::decode()`] fails.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("entry set cannot contains {0} entries")]
    InvalidLength(usize),

    #[error("stored checksum {stored:#06x} does not match the computed one {computed:#06x}")]
    ChecksumMismatch { stored: u16, computed: u16 },

    #[error("entry #{0} is not valid")]
    InvalidRecord(usize, #[source] RecordError),

    #[error("entry #{0} cannot be {1}")]
    UnexpectedRecord(usize, EntryType),

    #[error("{0} file name entries cannot hold a name of {1} characters")]
    WrongFileNames(usize, usize),
}
