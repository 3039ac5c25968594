//! Matrix kernel generators.
//!
//! Kernels emit bytecode loops into a [`FuncBuilder`]: dot products and
//! their transposed variants, element-wise arithmetic, broadcasts,
//! reductions, activation application, column hardmax/softmax and the
//! regularization helpers. [`ScalarKernels`] is the reference
//! generator; [`SimdKernels`] lowers the hot kernels to f32x4 lane
//! operations with a scalar remainder, falling back entirely to the
//! scalar form when an operand is smaller than one lane group.
//!
//! Every kernel validates operand shapes before emitting anything and
//! takes an exact list of scratch locals; the required count and types
//! are documented per kernel and checked at generation time.
//!
//! [`FuncBuilder`]: nnc_wasm::FuncBuilder

pub mod scalar;
pub mod simd;

pub use scalar::ScalarKernels;
pub use simd::SimdKernels;

use nnc_mem::NdArray;
use nnc_wasm::{FuncBuilder, WasmInstr, WasmType};
use thiserror::Error;

/// Errors raised while generating a kernel.
#[derive(Clone, Debug, Error)]
pub enum KernelError {
    /// Operand shapes are incompatible. Raised before any bytecode is
    /// emitted for the offending kernel.
    #[error("{op}: shape mismatch: {detail}")]
    ShapeMismatch {
        /// Kernel name.
        op: &'static str,
        /// What did not line up.
        detail: String,
    },

    /// Wrong number of scratch locals supplied. Programmer error in
    /// composing the generator.
    #[error("{op}: expected {expected} scratch locals, got {got}")]
    ScratchCount {
        /// Kernel name.
        op: &'static str,
        /// Required count.
        expected: usize,
        /// Supplied count.
        got: usize,
    },

    /// The kernel cannot be generated for this numeric kind.
    #[error("{op}: unsupported: {detail}")]
    Unsupported {
        /// Kernel name.
        op: &'static str,
        /// Why.
        detail: String,
    },
}

/// Result type for kernel generation.
pub type KernelResult<T> = Result<T, KernelError>;

/// Numeric kind descriptor.
///
/// Kernels are written once against this descriptor; it supplies the
/// element size and the load/store/arithmetic instructions as data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumKind {
    /// 32-bit float elements.
    F32,
    /// 64-bit float elements.
    F64,
}

impl NumKind {
    /// The element's value type.
    #[must_use]
    pub fn ty(self) -> WasmType {
        match self {
            Self::F32 => WasmType::F32,
            Self::F64 => WasmType::F64,
        }
    }

    /// Element size in bytes.
    #[must_use]
    pub fn size(self) -> u32 {
        self.ty().size_bytes()
    }

    /// Load one element (natural alignment, zero offset).
    #[must_use]
    pub fn load(self) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32Load(4, 0),
            Self::F64 => WasmInstr::F64Load(8, 0),
        }
    }

    /// Store one element.
    #[must_use]
    pub fn store(self) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32Store(4, 0),
            Self::F64 => WasmInstr::F64Store(8, 0),
        }
    }

    /// A constant of this kind.
    #[must_use]
    pub fn const_val(self, value: f64) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32Const(value as f32),
            Self::F64 => WasmInstr::F64Const(value),
        }
    }

    /// The zero constant.
    #[must_use]
    pub fn zero(self) -> WasmInstr {
        self.const_val(0.0)
    }

    /// Addition.
    #[must_use]
    pub fn add(self) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32Add,
            Self::F64 => WasmInstr::F64Add,
        }
    }

    /// Subtraction.
    #[must_use]
    pub fn sub(self) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32Sub,
            Self::F64 => WasmInstr::F64Sub,
        }
    }

    /// Multiplication.
    #[must_use]
    pub fn mul(self) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32Mul,
            Self::F64 => WasmInstr::F64Mul,
        }
    }

    /// Division.
    #[must_use]
    pub fn div(self) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32Div,
            Self::F64 => WasmInstr::F64Div,
        }
    }

    /// Absolute value.
    #[must_use]
    pub fn abs(self) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32Abs,
            Self::F64 => WasmInstr::F64Abs,
        }
    }

    /// Equality comparison.
    #[must_use]
    pub fn eq(self) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32Eq,
            Self::F64 => WasmInstr::F64Eq,
        }
    }

    /// Inequality comparison.
    #[must_use]
    pub fn ne(self) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32Ne,
            Self::F64 => WasmInstr::F64Ne,
        }
    }

    /// Greater-than comparison.
    #[must_use]
    pub fn gt(self) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32Gt,
            Self::F64 => WasmInstr::F64Gt,
        }
    }

    /// Less-than comparison.
    #[must_use]
    pub fn lt(self) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32Lt,
            Self::F64 => WasmInstr::F64Lt,
        }
    }

    /// Convert an unsigned i32 on the stack to this kind.
    #[must_use]
    pub fn convert_u32(self) -> WasmInstr {
        match self {
            Self::F32 => WasmInstr::F32ConvertI32U,
            Self::F64 => WasmInstr::F64ConvertI32U,
        }
    }
}

/// Element-wise binary operation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    /// `dst = lhs + rhs`
    Add,
    /// `dst = lhs - rhs`
    Sub,
    /// `dst = lhs ⊙ rhs`
    Mul,
}

impl BinOp {
    /// Scalar instruction for this operation.
    #[must_use]
    pub fn instr(self, kind: NumKind) -> WasmInstr {
        match self {
            Self::Add => kind.add(),
            Self::Sub => kind.sub(),
            Self::Mul => kind.mul(),
        }
    }

    /// f32x4 lane instruction for this operation.
    #[must_use]
    pub fn simd_instr(self) -> WasmInstr {
        match self {
            Self::Add => WasmInstr::F32x4Add,
            Self::Sub => WasmInstr::F32x4Sub,
            Self::Mul => WasmInstr::F32x4Mul,
        }
    }
}

/// A scalar operand: a build-time constant or a runtime local.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScalarSrc {
    /// Build-time constant.
    Const(f64),
    /// Value of a local at run time.
    Local(u32),
}

impl ScalarSrc {
    pub(crate) fn push(self, b: &mut FuncBuilder, kind: NumKind) {
        match self {
            Self::Const(v) => b.push(kind.const_val(v)),
            Self::Local(l) => b.push(WasmInstr::LocalGet(l)),
        }
    }
}

/// Base address of a matrix operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Base {
    /// The array's own region address, a build-time constant.
    Fixed,
    /// A runtime local holding the base address.
    Local(u32),
}

/// A relocatable matrix reference.
///
/// Wraps an [`NdArray`] with either its fixed base address or a runtime
/// local supplying the base, so one generated kernel can address either
/// a pre-allocated buffer or caller-supplied data.
#[derive(Clone, Debug)]
pub struct Mat {
    array: NdArray,
    base: Base,
}

/// An address term added to a matrix base.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Term {
    /// Value of a local (a byte offset).
    Local(u32),
    /// Constant byte offset.
    Const(u32),
}

impl Mat {
    /// Reference a buffer at its allocated address.
    #[must_use]
    pub fn fixed(array: NdArray) -> Self {
        Self {
            array,
            base: Base::Fixed,
        }
    }

    /// Reference a buffer whose base address arrives in `base_local`.
    #[must_use]
    pub fn relocatable(array: NdArray, base_local: u32) -> Self {
        Self {
            array,
            base: Base::Local(base_local),
        }
    }

    /// The underlying array view.
    #[must_use]
    pub fn array(&self) -> &NdArray {
        &self.array
    }

    /// Whether the base address is runtime-supplied.
    #[must_use]
    pub fn is_relocatable(&self) -> bool {
        matches!(self.base, Base::Local(_))
    }

    /// Rows of the viewed matrix.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.array.rows()
    }

    /// Columns of the viewed matrix.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.array.cols()
    }

    /// Total size in bytes.
    #[must_use]
    pub fn bytes(&self) -> u32 {
        self.array.bytes()
    }

    /// Push the base address onto the stack.
    pub(crate) fn push_base(&self, b: &mut FuncBuilder) {
        match self.base {
            Base::Fixed => b.push(WasmInstr::I32Const(self.array.begin() as i32)),
            Base::Local(l) => b.push(WasmInstr::LocalGet(l)),
        }
    }

    /// Push `base + Σ terms` onto the stack.
    pub(crate) fn push_addr(&self, b: &mut FuncBuilder, terms: &[Term]) {
        // Fold constant terms into the base when it is fixed.
        let const_sum: u32 = terms
            .iter()
            .filter_map(|t| match t {
                Term::Const(c) => Some(*c),
                Term::Local(_) => None,
            })
            .sum();

        match self.base {
            Base::Fixed => b.push(WasmInstr::I32Const((self.array.begin() + const_sum) as i32)),
            Base::Local(l) => {
                b.push(WasmInstr::LocalGet(l));
                if const_sum != 0 {
                    b.push(WasmInstr::I32Const(const_sum as i32));
                    b.push(WasmInstr::I32Add);
                }
            }
        }

        for term in terms {
            if let Term::Local(l) = term {
                b.push(WasmInstr::LocalGet(*l));
                b.push(WasmInstr::I32Add);
            }
        }
    }
}

pub(crate) fn check_scratch(
    op: &'static str,
    scratch: &[u32],
    expected: usize,
) -> KernelResult<()> {
    if scratch.len() == expected {
        Ok(())
    } else {
        Err(KernelError::ScratchCount {
            op,
            expected,
            got: scratch.len(),
        })
    }
}

pub(crate) fn check_same_shape(op: &'static str, a: &Mat, b: &Mat) -> KernelResult<()> {
    if a.array().shape() == b.array().shape() {
        Ok(())
    } else {
        Err(KernelError::ShapeMismatch {
            op,
            detail: format!(
                "{:?} vs {:?}",
                a.array().shape(),
                b.array().shape()
            ),
        })
    }
}
