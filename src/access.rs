use serde::Serialize;

/// Half-open byte range `[start, end)` over the user address space.
///
/// All overlap resolution in the region map happens on these ranges; a region
/// with `start == end` is empty and never intersects anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Region {
    /// First byte covered.
    pub start: u64,
    /// One past the last byte covered.
    pub end: u64,
}

impl Region {
    /// Region starting at `base` and spanning `len` bytes.
    ///
    /// # Panics
    /// If `base + len` overflows the address space.
    #[must_use]
    pub fn new(base: u64, len: u64) -> Self {
        let end = base.checked_add(len).expect("Region::new: address overflow");
        Self { start: base, end }
    }

    /// Number of bytes covered.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the region covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether the two regions share at least one byte.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The shared sub-range, if any.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Self { start, end })
    }

    /// Whether `other` lies entirely within `self`.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// How a task interacts with a declared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AccessMode {
    /// The task only reads the region.
    In,
    /// The task overwrites the region without reading it.
    Out,
    /// The task reads and then writes the region.
    InOut,
    /// The task joins the region's concurrent pool: members run in parallel
    /// with each other, ordered only against non-matching accesses.
    Concurrent,
    /// The task joins the region's commutative pool: members are mutually
    /// exclusive but run in an unspecified order.
    Commutative,
    /// The runtime may treat the access as either pool flavor; resolved as
    /// concurrent.
    Any,
}

impl AccessMode {
    /// Whether tasks with this mode observe the region's prior contents.
    #[must_use]
    pub fn reads(&self) -> bool {
        !matches!(self, Self::Out)
    }

    /// Whether tasks with this mode may mutate the region.
    #[must_use]
    pub fn writes(&self) -> bool {
        !matches!(self, Self::In)
    }

    /// Whether this mode joins a pool instead of serializing against peers.
    #[must_use]
    pub fn pooled(&self) -> bool {
        matches!(self, Self::Concurrent | Self::Commutative | Self::Any)
    }
}

/// A task's declaration of one memory interaction.
///
/// Immutable once the owning task is created; the domain resolves overlap
/// between descriptors of different tasks into ordering edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessDescriptor {
    /// Byte range touched.
    pub region: Region,
    /// Interaction flavor.
    pub mode: AccessMode,
}

impl AccessDescriptor {
    /// Descriptor over `[base, base + len)`.
    ///
    /// # Panics
    /// A null base with a non-zero length is a programming error and aborts
    /// submission outright.
    #[must_use]
    pub fn new(base: u64, len: u64, mode: AccessMode) -> Self {
        assert!(
            base != 0 || len == 0,
            "AccessDescriptor::new: null base with non-zero length"
        );
        Self {
            region: Region::new(base, len),
            mode,
        }
    }
}
