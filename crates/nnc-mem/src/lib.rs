//! Linear-memory layout for generated modules.
//!
//! This crate manages the address space of a module under construction:
//! an [`Arena`] hands out disjoint byte ranges of the module's linear
//! memory, and an [`NdArray`] is a shaped, row-major strided view over
//! one such range.
//!
//! The arena never reuses addresses during a build unless a region is
//! explicitly freed; [`Arena::free`] exists for short-lived scratch
//! buffers only.

#![warn(missing_docs)]

pub mod ndarray;

pub use ndarray::NdArray;

use thiserror::Error;

/// Errors for memory layout operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MemError {
    /// Allocation of zero bytes requested.
    #[error("cannot allocate zero bytes")]
    ZeroSizeAlloc,

    /// A region passed to `free` was never allocated (or already freed).
    #[error("unknown region [{begin}, {end})")]
    UnknownRegion {
        /// Region begin offset.
        begin: u32,
        /// Region end offset.
        end: u32,
    },

    /// An index is outside its dimension's extent.
    #[error("index {index} out of bounds for dimension {dim} of extent {extent}")]
    IndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// Which dimension.
        dim: usize,
        /// The dimension's extent.
        extent: usize,
    },

    /// Wrong number of indices for the array's rank.
    #[error("expected {expected} indices, got {got}")]
    RankMismatch {
        /// Array rank.
        expected: usize,
        /// Number of indices supplied.
        got: usize,
    },

    /// A shape does not cover its region exactly.
    #[error("shape {shape:?} with element size {element_size} does not cover {bytes} bytes")]
    ShapeMismatch {
        /// Requested shape.
        shape: Vec<usize>,
        /// Element size in bytes.
        element_size: u32,
        /// Region size in bytes.
        bytes: u32,
    },

    /// An empty shape (or a zero extent) was supplied.
    #[error("shape must be non-empty with positive extents")]
    EmptyShape,
}

/// Result type for memory layout operations.
pub type MemResult<T> = Result<T, MemError>;

/// Size of one linear-memory page in bytes.
pub const PAGE_SIZE: u32 = 65536;

/// A disjoint byte range of linear memory.
///
/// Regions are value handles: the arena keeps the authoritative sorted
/// list, and holders carry copies. A region stays valid for the whole
/// build unless explicitly freed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    begin: u32,
    end: u32,
}

impl Region {
    /// First byte offset.
    #[must_use]
    pub fn begin(&self) -> u32 {
        self.begin
    }

    /// One past the last byte offset.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.end
    }

    /// Size in bytes.
    #[must_use]
    pub fn bytes(&self) -> u32 {
        self.end - self.begin
    }
}

/// First-fit allocator over one linear address space.
///
/// Allocations are kept sorted by begin offset; `allocate` takes the
/// first gap large enough, or extends past the last allocation.
#[derive(Debug, Default)]
pub struct Arena {
    regions: Vec<Region>,
}

impl Arena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `bytes` bytes, returning the region.
    pub fn allocate(&mut self, bytes: u32) -> MemResult<Region> {
        if bytes == 0 {
            return Err(MemError::ZeroSizeAlloc);
        }

        let mut start = 0u32;
        let mut insert_at = self.regions.len();
        for (i, region) in self.regions.iter().enumerate() {
            if region.begin - start >= bytes {
                insert_at = i;
                break;
            }
            start = region.end;
        }

        let region = Region {
            begin: start,
            end: start + bytes,
        };
        self.regions.insert(insert_at, region);
        Ok(region)
    }

    /// Release a region without compacting.
    pub fn free(&mut self, region: Region) -> MemResult<()> {
        match self.regions.iter().position(|r| *r == region) {
            Some(i) => {
                self.regions.remove(i);
                Ok(())
            }
            None => Err(MemError::UnknownRegion {
                begin: region.begin,
                end: region.end,
            }),
        }
    }

    /// Number of live regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Total extent in bytes (end of the highest allocation).
    #[must_use]
    pub fn bytes(&self) -> u32 {
        self.regions.last().map_or(0, |r| r.end)
    }

    /// Extent rounded up to whole memory pages.
    #[must_use]
    pub fn pages(&self) -> u32 {
        self.bytes().div_ceil(PAGE_SIZE)
    }
}
