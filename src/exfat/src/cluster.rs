use std::fmt::{Display, Formatter};

/// Index of a cluster in the cluster heap.
///
/// A value of this type is always inside `[2, ClusterCount + 2)` of the volume it came from. Use
/// [`Params::cluster()`](crate::param::Params::cluster()) to get one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Cluster(u32);

impl Cluster {
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl Display for Cluster {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<Cluster> for u32 {
    fn from(v: Cluster) -> Self {
        v.0
    }
}

/// How the clusters of a file are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// The file has no clusters.
    Empty,
    /// Logical cluster `k` is at `first + k`. The FAT is not consulted.
    Contiguous(Cluster),
    /// The clusters are linked together by the FAT.
    Chained(Cluster),
}

impl Allocation {
    pub fn first(self) -> Option<Cluster> {
        match self {
            Self::Empty => None,
            Self::Contiguous(v) | Self::Chained(v) => Some(v),
        }
    }

    pub fn is_contiguous(self) -> bool {
        matches!(self, Self::Contiguous(_))
    }
}

/// Allocation state of a file (the part of the Stream Extension this crate manages).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stream {
    pub(crate) alloc: Allocation,
    pub(crate) data_length: u64,
    pub(crate) valid_data_length: u64,
}

impl Stream {
    pub fn empty() -> Self {
        Self {
            alloc: Allocation::Empty,
            data_length: 0,
            valid_data_length: 0,
        }
    }

    pub fn alloc(&self) -> Allocation {
        self.alloc
    }

    pub fn data_length(&self) -> u64 {
        self.data_length
    }

    pub fn valid_data_length(&self) -> u64 {
        self.valid_data_length
    }

    /// Records how many bytes of the allocated space have been written.
    ///
    /// The value is clamped to [`Self::data_length()`].
    pub fn set_valid_data_length(&mut self, v: u64) {
        self.valid_data_length = v.min(self.data_length);
    }
}

/// Last logical cluster that was resolved for a file and where it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LastCluster {
    pub logical: u64,
    pub physical: Cluster,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_first() {
        assert_eq!(Allocation::Empty.first(), None);
        assert_eq!(Allocation::Contiguous(Cluster(5)).first(), Some(Cluster(5)));
        assert_eq!(Allocation::Chained(Cluster(7)).first(), Some(Cluster(7)));
        assert!(Allocation::Contiguous(Cluster(5)).is_contiguous());
        assert!(!Allocation::Chained(Cluster(5)).is_contiguous());
    }

    #[test]
    fn valid_data_length_clamped() {
        let mut s = Stream {
            alloc: Allocation::Contiguous(Cluster(2)),
            data_length: 100,
            valid_data_length: 0,
        };

        s.set_valid_data_length(500);

        assert_eq!(s.valid_data_length(), 100);
    }
}
