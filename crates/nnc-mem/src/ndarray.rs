//! Shaped, strided views over arena regions.

use crate::{MemError, MemResult, Region};

/// A row-major strided view over one [`Region`].
///
/// Strides are precomputed in bytes: the last dimension's stride is the
/// element size, and `stride[i] = shape[i + 1] * stride[i + 1]`. The
/// shape must cover the region exactly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NdArray {
    region: Region,
    element_size: u32,
    shape: Vec<usize>,
    strides: Vec<u32>,
}

impl NdArray {
    /// Create a view of `region` with the given shape.
    pub fn new(region: Region, shape: Vec<usize>, element_size: u32) -> MemResult<Self> {
        let mut array = Self {
            region,
            element_size,
            shape: Vec::new(),
            strides: Vec::new(),
        };
        array.reshape(shape)?;
        Ok(array)
    }

    /// Replace the shape, recomputing strides.
    pub fn reshape(&mut self, shape: Vec<usize>) -> MemResult<()> {
        if shape.is_empty() || shape.iter().any(|&d| d == 0) {
            return Err(MemError::EmptyShape);
        }

        let total: usize = shape.iter().product();
        let covered = total as u32 * self.element_size;
        if covered != self.region.bytes() {
            return Err(MemError::ShapeMismatch {
                shape,
                element_size: self.element_size,
                bytes: self.region.bytes(),
            });
        }

        let mut strides = vec![0u32; shape.len()];
        let last = shape.len() - 1;
        strides[last] = self.element_size;
        for i in (0..last).rev() {
            strides[i] = shape[i + 1] as u32 * strides[i + 1];
        }

        self.shape = shape;
        self.strides = strides;
        Ok(())
    }

    /// Absolute byte address of the element at `indices`.
    pub fn linear_address(&self, indices: &[usize]) -> MemResult<u32> {
        if indices.len() != self.shape.len() {
            return Err(MemError::RankMismatch {
                expected: self.shape.len(),
                got: indices.len(),
            });
        }

        let mut address = self.region.begin();
        for (dim, (&index, &extent)) in indices.iter().zip(self.shape.iter()).enumerate() {
            if index >= extent {
                return Err(MemError::IndexOutOfBounds {
                    index,
                    dim,
                    extent,
                });
            }
            address += index as u32 * self.strides[dim];
        }
        Ok(address)
    }

    /// The backing region.
    #[must_use]
    pub fn region(&self) -> Region {
        self.region
    }

    /// First byte address.
    #[must_use]
    pub fn begin(&self) -> u32 {
        self.region.begin()
    }

    /// Total size in bytes.
    #[must_use]
    pub fn bytes(&self) -> u32 {
        self.region.bytes()
    }

    /// Element size in bytes.
    #[must_use]
    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    /// The shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Byte stride of dimension `dim`.
    #[must_use]
    pub fn stride(&self, dim: usize) -> u32 {
        self.strides[dim]
    }

    /// Extent of the first dimension (rows, for 2-D arrays).
    #[must_use]
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Extent of the second dimension (columns, for 2-D arrays).
    ///
    /// A 1-D array is treated as a single column.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.shape.get(1).copied().unwrap_or(1)
    }
}
