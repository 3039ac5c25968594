//! Scalar matrix kernel generators.
//!
//! Every kernel here emits a plain bytecode loop nest, one element per
//! step. This is the reference form: the vectorized generator in
//! [`crate::simd`] must match these results bit for bit, including
//! reduction order.
//!
//! Loops iterate over relative byte offsets starting at zero; operand
//! addresses are formed by adding the offset to each [`Mat`]'s base, so
//! the same kernel serves fixed buffers and runtime-relocated ones.
//!
//! Scratch locals are supplied by the caller (they are reused across
//! the kernels of one generated function). Each kernel documents the
//! exact count and types it needs and rejects anything else.

use crate::{
    check_same_shape, check_scratch, BinOp, KernelError, KernelResult, Mat, NumKind, ScalarSrc,
    Term,
};
use nnc_wasm::{Bound, FuncBuilder, WasmInstr};

/// Scalar kernel generator for one numeric kind.
#[derive(Clone, Copy, Debug)]
pub struct ScalarKernels {
    kind: NumKind,
}

/// Scratch locals for the dot family: five `i32` offsets and one
/// accumulator of the element kind.
pub const DOT_SCRATCH: usize = 6;
/// Scratch locals for element-wise binary kernels: one `i32` offset.
pub const BINARY_SCRATCH: usize = 1;
/// Scratch locals for broadcast kernels: three `i32` offsets and one
/// element-kind value.
pub const BROADCAST_SCRATCH: usize = 4;
/// Scratch locals for scalar multiply: one `i32` offset.
pub const SCALAR_MUL_SCRATCH: usize = 1;
/// Scratch locals for element-wise application: one `i32` offset.
pub const APPLY_SCRATCH: usize = 1;
/// Scratch locals for column hardmax: three `i32` (column, offset, max
/// address) and two element-kind values (max, candidate).
pub const HARDMAX_SCRATCH: usize = 5;
/// Scratch locals for column softmax: two `i32` offsets and one
/// element-kind sum.
pub const SOFTMAX_SCRATCH: usize = 3;
/// Scratch locals for row sum: three `i32` offsets and one element-kind
/// accumulator.
pub const ROW_SUM_SCRATCH: usize = 4;
/// Scratch locals for absolute-sum: one `i32` offset and one
/// element-kind accumulator.
pub const ABS_SUM_SCRATCH: usize = 2;
/// Scratch locals for square-sum: one `i32` offset and two element-kind
/// values (accumulator, element).
pub const SQUARE_SUM_SCRATCH: usize = 3;
/// Scratch locals for mean: one `i32` offset and one element-kind
/// accumulator.
pub const MEAN_SCRATCH: usize = 2;
/// Scratch locals for linear scaled-add: one `i32` offset.
pub const SCALED_ADD_SCRATCH: usize = 1;
/// Scratch locals for sign scaled-add variants: one `i32` offset and
/// one element-kind value.
pub const SIGN_SCALED_ADD_SCRATCH: usize = 2;
/// Scratch locals for the confusion-matrix update: six `i32` offsets.
pub const CONFUSION_SCRATCH: usize = 6;
/// Scratch locals for correct-prediction counting: two `i32` offsets
/// and one `i32` flag.
pub const CORRECT_SCRATCH: usize = 3;

impl ScalarKernels {
    /// Create a generator for `kind` elements.
    #[must_use]
    pub fn new(kind: NumKind) -> Self {
        Self { kind }
    }

    /// The element kind.
    #[must_use]
    pub fn kind(&self) -> NumKind {
        self.kind
    }

    fn elem(&self) -> u32 {
        self.kind.size()
    }

    fn check_elem(&self, op: &'static str, mats: &[&Mat]) -> KernelResult<()> {
        for m in mats {
            if m.array().element_size() != self.elem() {
                return Err(KernelError::ShapeMismatch {
                    op,
                    detail: format!(
                        "element size {} does not match kind size {}",
                        m.array().element_size(),
                        self.elem()
                    ),
                });
            }
        }
        Ok(())
    }

    fn check_dot_shapes(
        op: &'static str,
        contraction_ok: bool,
        output_ok: bool,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
    ) -> KernelResult<()> {
        if contraction_ok && output_ok {
            Ok(())
        } else {
            Err(KernelError::ShapeMismatch {
                op,
                detail: format!(
                    "lhs {:?} rhs {:?} dst {:?}",
                    lhs.array().shape(),
                    rhs.array().shape(),
                    dst.array().shape()
                ),
            })
        }
    }

    pub(crate) fn validate_dot(&self, lhs: &Mat, rhs: &Mat, dst: &Mat) -> KernelResult<()> {
        self.check_elem("dot", &[lhs, rhs, dst])?;
        Self::check_dot_shapes(
            "dot",
            lhs.cols() == rhs.rows(),
            dst.rows() == lhs.rows() && dst.cols() == rhs.cols(),
            lhs,
            rhs,
            dst,
        )
    }

    pub(crate) fn validate_dot_lt(&self, lhs: &Mat, rhs: &Mat, dst: &Mat) -> KernelResult<()> {
        self.check_elem("dot_lt", &[lhs, rhs, dst])?;
        Self::check_dot_shapes(
            "dot_lt",
            lhs.rows() == rhs.rows(),
            dst.rows() == lhs.cols() && dst.cols() == rhs.cols(),
            lhs,
            rhs,
            dst,
        )
    }

    pub(crate) fn validate_dot_rt(&self, lhs: &Mat, rhs: &Mat, dst: &Mat) -> KernelResult<()> {
        self.check_elem("dot_rt", &[lhs, rhs, dst])?;
        Self::check_dot_shapes(
            "dot_rt",
            lhs.cols() == rhs.cols(),
            dst.rows() == lhs.rows() && dst.cols() == rhs.rows(),
            lhs,
            rhs,
            dst,
        )
    }

    pub(crate) fn validate_elementwise(
        &self,
        op: &'static str,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
    ) -> KernelResult<()> {
        self.check_elem(op, &[lhs, rhs, dst])?;
        check_same_shape(op, lhs, rhs)?;
        check_same_shape(op, lhs, dst)
    }

    pub(crate) fn validate_broadcast(
        &self,
        mat: &Mat,
        vec: &Mat,
        dst: &Mat,
    ) -> KernelResult<()> {
        self.check_elem("broadcast", &[mat, vec, dst])?;
        check_same_shape("broadcast", mat, dst)?;
        if vec.rows() != mat.rows() || vec.cols() != 1 {
            return Err(KernelError::ShapeMismatch {
                op: "broadcast",
                detail: format!(
                    "vector {:?} against matrix {:?}",
                    vec.array().shape(),
                    mat.array().shape()
                ),
            });
        }
        Ok(())
    }

    pub(crate) fn validate_row_sum(&self, src: &Mat, dst: &Mat) -> KernelResult<()> {
        self.check_elem("row_sum", &[src, dst])?;
        if dst.rows() != src.rows() || dst.cols() != 1 {
            return Err(KernelError::ShapeMismatch {
                op: "row_sum",
                detail: format!(
                    "src {:?} dst {:?}",
                    src.array().shape(),
                    dst.array().shape()
                ),
            });
        }
        Ok(())
    }

    /// `dst[m,p] = lhs[m,n] · rhs[n,p]`
    ///
    /// Scratch: `[i32; 5]` then one element-kind accumulator
    /// ([`DOT_SCRATCH`] total).
    pub fn dot(
        &self,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("dot", scratch, DOT_SCRATCH)?;
        self.validate_dot(lhs, rhs, dst)?;

        let e = self.elem();
        let (m, n, p) = (lhs.rows() as u32, lhs.cols() as u32, rhs.cols() as u32);
        let (dst_off, col, k, lhs_row, rhs_off) =
            (scratch[0], scratch[1], scratch[2], scratch[3], scratch[4]);
        let acc = scratch[5];

        b.set_local(lhs_row, Bound::Const(0));
        b.range_loop(dst_off, Bound::Const(0), Bound::Const(m * p * e), p * e, |b| {
            b.range_loop(col, Bound::Const(0), Bound::Const(p * e), e, |b| {
                b.push(self.kind.zero());
                b.push(WasmInstr::LocalSet(acc));
                b.set_local(rhs_off, Bound::Local(col));
                b.range_loop(k, Bound::Const(0), Bound::Const(n * e), e, |b| {
                    b.push(WasmInstr::LocalGet(acc));
                    lhs.push_addr(b, &[Term::Local(lhs_row), Term::Local(k)]);
                    b.push(self.kind.load());
                    rhs.push_addr(b, &[Term::Local(rhs_off)]);
                    b.push(self.kind.load());
                    b.push(self.kind.mul());
                    b.push(self.kind.add());
                    b.push(WasmInstr::LocalSet(acc));
                    // Advance rhs one row down its column.
                    b.set_local(rhs_off, Bound::LocalPlus(rhs_off, p * e));
                });
                dst.push_addr(b, &[Term::Local(dst_off), Term::Local(col)]);
                b.push(WasmInstr::LocalGet(acc));
                b.push(self.kind.store());
            });
            b.set_local(lhs_row, Bound::LocalPlus(lhs_row, n * e));
        });
        Ok(())
    }

    /// `dst[m,p] = lhsᵗ · rhs` where `lhs` is stored as `[n,m]`.
    ///
    /// The contraction walks `lhs` down a column (stride `m·e`) instead
    /// of across a row. Scratch as for [`dot`](Self::dot).
    pub fn dot_lt(
        &self,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("dot_lt", scratch, DOT_SCRATCH)?;
        self.validate_dot_lt(lhs, rhs, dst)?;

        let e = self.elem();
        let (m, n, p) = (lhs.cols() as u32, lhs.rows() as u32, rhs.cols() as u32);
        let (dst_off, col, rhs_off, lhs_off, lhs_col) =
            (scratch[0], scratch[1], scratch[2], scratch[3], scratch[4]);
        let acc = scratch[5];

        b.set_local(lhs_col, Bound::Const(0));
        b.range_loop(dst_off, Bound::Const(0), Bound::Const(m * p * e), p * e, |b| {
            b.range_loop(col, Bound::Const(0), Bound::Const(p * e), e, |b| {
                b.push(self.kind.zero());
                b.push(WasmInstr::LocalSet(acc));
                b.set_local(lhs_off, Bound::Local(lhs_col));
                // The contraction index rides the rhs offset directly:
                // one rhs row per step.
                b.range_loop(
                    rhs_off,
                    Bound::Local(col),
                    Bound::LocalPlus(col, n * p * e),
                    p * e,
                    |b| {
                        b.push(WasmInstr::LocalGet(acc));
                        lhs.push_addr(b, &[Term::Local(lhs_off)]);
                        b.push(self.kind.load());
                        rhs.push_addr(b, &[Term::Local(rhs_off)]);
                        b.push(self.kind.load());
                        b.push(self.kind.mul());
                        b.push(self.kind.add());
                        b.push(WasmInstr::LocalSet(acc));
                        b.set_local(lhs_off, Bound::LocalPlus(lhs_off, m * e));
                    },
                );
                dst.push_addr(b, &[Term::Local(dst_off), Term::Local(col)]);
                b.push(WasmInstr::LocalGet(acc));
                b.push(self.kind.store());
            });
            b.set_local(lhs_col, Bound::LocalPlus(lhs_col, e));
        });
        Ok(())
    }

    /// `dst[m,p] = lhs · rhsᵗ` where `rhs` is stored as `[p,n]`.
    ///
    /// The contraction is contiguous in both operands. Scratch as for
    /// [`dot`](Self::dot).
    pub fn dot_rt(
        &self,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("dot_rt", scratch, DOT_SCRATCH)?;
        self.validate_dot_rt(lhs, rhs, dst)?;

        let e = self.elem();
        let (m, n, p) = (lhs.rows() as u32, lhs.cols() as u32, rhs.rows() as u32);
        let (dst_off, col, k, lhs_row, rhs_row) =
            (scratch[0], scratch[1], scratch[2], scratch[3], scratch[4]);
        let acc = scratch[5];

        b.set_local(lhs_row, Bound::Const(0));
        b.range_loop(dst_off, Bound::Const(0), Bound::Const(m * p * e), p * e, |b| {
            b.set_local(rhs_row, Bound::Const(0));
            b.range_loop(col, Bound::Const(0), Bound::Const(p * e), e, |b| {
                b.push(self.kind.zero());
                b.push(WasmInstr::LocalSet(acc));
                b.range_loop(k, Bound::Const(0), Bound::Const(n * e), e, |b| {
                    b.push(WasmInstr::LocalGet(acc));
                    lhs.push_addr(b, &[Term::Local(lhs_row), Term::Local(k)]);
                    b.push(self.kind.load());
                    rhs.push_addr(b, &[Term::Local(rhs_row), Term::Local(k)]);
                    b.push(self.kind.load());
                    b.push(self.kind.mul());
                    b.push(self.kind.add());
                    b.push(WasmInstr::LocalSet(acc));
                });
                dst.push_addr(b, &[Term::Local(dst_off), Term::Local(col)]);
                b.push(WasmInstr::LocalGet(acc));
                b.push(self.kind.store());
                b.set_local(rhs_row, Bound::LocalPlus(rhs_row, n * e));
            });
            b.set_local(lhs_row, Bound::LocalPlus(lhs_row, n * e));
        });
        Ok(())
    }

    /// Element-wise `dst = lhs ∘ rhs` over equal shapes.
    ///
    /// Scratch: one `i32` offset.
    pub fn binary(
        &self,
        b: &mut FuncBuilder,
        op: BinOp,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("binary", scratch, BINARY_SCRATCH)?;
        self.validate_elementwise("binary", lhs, rhs, dst)?;

        let off = scratch[0];
        b.range_loop(off, Bound::Const(0), Bound::Const(dst.bytes()), self.elem(), |b| {
            dst.push_addr(b, &[Term::Local(off)]);
            lhs.push_addr(b, &[Term::Local(off)]);
            b.push(self.kind.load());
            rhs.push_addr(b, &[Term::Local(off)]);
            b.push(self.kind.load());
            b.push(op.instr(self.kind));
            b.push(self.kind.store());
        });
        Ok(())
    }

    /// `dst[i,j] = mat[i,j] ∘ vec[i,0]`, broadcasting a column vector
    /// across each matrix row.
    ///
    /// Scratch: `[i32; 3]` (row offset, column offset, vector offset)
    /// then one element-kind value.
    pub fn broadcast(
        &self,
        b: &mut FuncBuilder,
        op: BinOp,
        mat: &Mat,
        vec: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("broadcast", scratch, BROADCAST_SCRATCH)?;
        self.validate_broadcast(mat, vec, dst)?;

        let e = self.elem();
        let row_bytes = mat.cols() as u32 * e;
        let (row_off, col, vec_off) = (scratch[0], scratch[1], scratch[2]);
        let val = scratch[3];

        b.set_local(vec_off, Bound::Const(0));
        b.range_loop(row_off, Bound::Const(0), Bound::Const(mat.bytes()), row_bytes, |b| {
            vec.push_addr(b, &[Term::Local(vec_off)]);
            b.push(self.kind.load());
            b.push(WasmInstr::LocalSet(val));
            b.range_loop(col, Bound::Const(0), Bound::Const(row_bytes), e, |b| {
                dst.push_addr(b, &[Term::Local(row_off), Term::Local(col)]);
                mat.push_addr(b, &[Term::Local(row_off), Term::Local(col)]);
                b.push(self.kind.load());
                b.push(WasmInstr::LocalGet(val));
                b.push(op.instr(self.kind));
                b.push(self.kind.store());
            });
            b.set_local(vec_off, Bound::LocalPlus(vec_off, e));
        });
        Ok(())
    }

    /// `dst = src * scalar` for a constant or runtime scalar.
    ///
    /// Scratch: one `i32` offset.
    pub fn scalar_mul(
        &self,
        b: &mut FuncBuilder,
        src: &Mat,
        scalar: ScalarSrc,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("scalar_mul", scratch, SCALAR_MUL_SCRATCH)?;
        self.check_elem("scalar_mul", &[src, dst])?;
        check_same_shape("scalar_mul", src, dst)?;

        let off = scratch[0];
        b.range_loop(off, Bound::Const(0), Bound::Const(dst.bytes()), self.elem(), |b| {
            dst.push_addr(b, &[Term::Local(off)]);
            src.push_addr(b, &[Term::Local(off)]);
            b.push(self.kind.load());
            scalar.push(b, self.kind);
            b.push(self.kind.mul());
            b.push(self.kind.store());
        });
        Ok(())
    }

    /// `dst[i] = func(srcs[0][i], …, srcs[k][i])` calling the routine
    /// handle `func` once per element.
    ///
    /// Scratch: one `i32` offset.
    pub fn apply(
        &self,
        b: &mut FuncBuilder,
        srcs: &[&Mat],
        func: u32,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("apply", scratch, APPLY_SCRATCH)?;
        if srcs.is_empty() {
            return Err(KernelError::ShapeMismatch {
                op: "apply",
                detail: "no source operands".to_string(),
            });
        }
        self.check_elem("apply", srcs)?;
        self.check_elem("apply", &[dst])?;
        for src in srcs {
            check_same_shape("apply", src, dst)?;
        }

        let off = scratch[0];
        b.range_loop(off, Bound::Const(0), Bound::Const(dst.bytes()), self.elem(), |b| {
            dst.push_addr(b, &[Term::Local(off)]);
            for src in srcs {
                src.push_addr(b, &[Term::Local(off)]);
                b.push(self.kind.load());
            }
            b.push(WasmInstr::Call(func));
            b.push(self.kind.store());
        });
        Ok(())
    }

    /// Column-wise hardmax: per column, `1.0` at the maximum row and
    /// `0.0` elsewhere. On a tie the top-most maximal row wins: the max
    /// tracking updates only on strictly greater values, so later equal
    /// rows never displace the first.
    ///
    /// Scratch: `[i32; 3]` (column, offset, max address) then two
    /// element-kind values (running max, candidate).
    pub fn column_hardmax(
        &self,
        b: &mut FuncBuilder,
        src: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("column_hardmax", scratch, HARDMAX_SCRATCH)?;
        self.check_elem("column_hardmax", &[src, dst])?;
        check_same_shape("column_hardmax", src, dst)?;

        let e = self.elem();
        let row_bytes = src.cols() as u32 * e;
        let total = src.bytes();
        let (col, off, max_off) = (scratch[0], scratch[1], scratch[2]);
        let (max, cand) = (scratch[3], scratch[4]);

        b.range_loop(col, Bound::Const(0), Bound::Const(row_bytes), e, |b| {
            // Pass 1: offset of the column's maximum.
            b.set_local(max_off, Bound::Local(col));
            src.push_addr(b, &[Term::Local(col)]);
            b.push(self.kind.load());
            b.push(WasmInstr::LocalSet(max));
            b.range_loop(
                off,
                Bound::LocalPlus(col, row_bytes),
                Bound::Const(total),
                row_bytes,
                |b| {
                    src.push_addr(b, &[Term::Local(off)]);
                    b.push(self.kind.load());
                    b.push(WasmInstr::LocalTee(cand));
                    b.push(WasmInstr::LocalGet(max));
                    b.push(self.kind.gt());
                    b.if_then(|b| {
                        b.push(WasmInstr::LocalGet(cand));
                        b.push(WasmInstr::LocalSet(max));
                        b.push(WasmInstr::LocalGet(off));
                        b.push(WasmInstr::LocalSet(max_off));
                    });
                },
            );

            // Pass 2: write the indicator column.
            b.range_loop(off, Bound::Local(col), Bound::Const(total), row_bytes, |b| {
                dst.push_addr(b, &[Term::Local(off)]);
                b.push(WasmInstr::LocalGet(off));
                b.push(WasmInstr::LocalGet(max_off));
                b.push(WasmInstr::I32Eq);
                b.if_else(
                    Some(self.kind.ty()),
                    |b| b.push(self.kind.const_val(1.0)),
                    |b| b.push(self.kind.zero()),
                );
                b.push(self.kind.store());
            });
        });
        Ok(())
    }

    /// Column-wise softmax: `dst[i,j] = exp(src[i,j]) / Σ_r exp(src[r,j])`,
    /// calling the routine handle `exp_func` per element.
    ///
    /// Scratch: `[i32; 2]` (column, offset) then one element-kind sum.
    pub fn column_softmax(
        &self,
        b: &mut FuncBuilder,
        src: &Mat,
        dst: &Mat,
        exp_func: u32,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("column_softmax", scratch, SOFTMAX_SCRATCH)?;
        self.check_elem("column_softmax", &[src, dst])?;
        check_same_shape("column_softmax", src, dst)?;

        let e = self.elem();
        let row_bytes = src.cols() as u32 * e;
        let total = src.bytes();
        let (col, off) = (scratch[0], scratch[1]);
        let sum = scratch[2];

        b.range_loop(col, Bound::Const(0), Bound::Const(row_bytes), e, |b| {
            b.push(self.kind.zero());
            b.push(WasmInstr::LocalSet(sum));
            b.range_loop(off, Bound::Local(col), Bound::Const(total), row_bytes, |b| {
                b.push(WasmInstr::LocalGet(sum));
                src.push_addr(b, &[Term::Local(off)]);
                b.push(self.kind.load());
                b.push(WasmInstr::Call(exp_func));
                b.push(self.kind.add());
                b.push(WasmInstr::LocalSet(sum));
            });
            b.range_loop(off, Bound::Local(col), Bound::Const(total), row_bytes, |b| {
                dst.push_addr(b, &[Term::Local(off)]);
                src.push_addr(b, &[Term::Local(off)]);
                b.push(self.kind.load());
                b.push(WasmInstr::Call(exp_func));
                b.push(WasmInstr::LocalGet(sum));
                b.push(self.kind.div());
                b.push(self.kind.store());
            });
        });
        Ok(())
    }

    /// Horizontal sum: `dst[i,0] = Σ_j src[i,j]`.
    ///
    /// Scratch: `[i32; 3]` (row offset, offset, destination offset)
    /// then one element-kind accumulator.
    pub fn row_sum(
        &self,
        b: &mut FuncBuilder,
        src: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("row_sum", scratch, ROW_SUM_SCRATCH)?;
        self.validate_row_sum(src, dst)?;

        let e = self.elem();
        let row_bytes = src.cols() as u32 * e;
        let (row, off, dst_off) = (scratch[0], scratch[1], scratch[2]);
        let acc = scratch[3];

        b.set_local(dst_off, Bound::Const(0));
        b.range_loop(row, Bound::Const(0), Bound::Const(src.bytes()), row_bytes, |b| {
            b.push(self.kind.zero());
            b.push(WasmInstr::LocalSet(acc));
            b.range_loop(off, Bound::Local(row), Bound::LocalPlus(row, row_bytes), e, |b| {
                b.push(WasmInstr::LocalGet(acc));
                src.push_addr(b, &[Term::Local(off)]);
                b.push(self.kind.load());
                b.push(self.kind.add());
                b.push(WasmInstr::LocalSet(acc));
            });
            dst.push_addr(b, &[Term::Local(dst_off)]);
            b.push(WasmInstr::LocalGet(acc));
            b.push(self.kind.store());
            b.set_local(dst_off, Bound::LocalPlus(dst_off, e));
        });
        Ok(())
    }

    /// `Σ |src[i]|`, left in the accumulator scratch local.
    ///
    /// Scratch: one `i32` offset then one element-kind accumulator
    /// (which holds the result afterwards).
    pub fn abs_sum(&self, b: &mut FuncBuilder, src: &Mat, scratch: &[u32]) -> KernelResult<()> {
        check_scratch("abs_sum", scratch, ABS_SUM_SCRATCH)?;
        self.check_elem("abs_sum", &[src])?;

        let (off, acc) = (scratch[0], scratch[1]);
        b.push(self.kind.zero());
        b.push(WasmInstr::LocalSet(acc));
        b.range_loop(off, Bound::Const(0), Bound::Const(src.bytes()), self.elem(), |b| {
            b.push(WasmInstr::LocalGet(acc));
            src.push_addr(b, &[Term::Local(off)]);
            b.push(self.kind.load());
            b.push(self.kind.abs());
            b.push(self.kind.add());
            b.push(WasmInstr::LocalSet(acc));
        });
        Ok(())
    }

    /// `Σ src[i]²`, left in the accumulator scratch local.
    ///
    /// Scratch: one `i32` offset then two element-kind values
    /// (accumulator holding the result, element temporary).
    pub fn square_sum(&self, b: &mut FuncBuilder, src: &Mat, scratch: &[u32]) -> KernelResult<()> {
        check_scratch("square_sum", scratch, SQUARE_SUM_SCRATCH)?;
        self.check_elem("square_sum", &[src])?;

        let (off, acc, tmp) = (scratch[0], scratch[1], scratch[2]);
        b.push(self.kind.zero());
        b.push(WasmInstr::LocalSet(acc));
        b.range_loop(off, Bound::Const(0), Bound::Const(src.bytes()), self.elem(), |b| {
            b.push(WasmInstr::LocalGet(acc));
            src.push_addr(b, &[Term::Local(off)]);
            b.push(self.kind.load());
            b.push(WasmInstr::LocalTee(tmp));
            b.push(WasmInstr::LocalGet(tmp));
            b.push(self.kind.mul());
            b.push(self.kind.add());
            b.push(WasmInstr::LocalSet(acc));
        });
        Ok(())
    }

    /// Mean of all elements, left on the stack.
    ///
    /// Scratch: one `i32` offset then one element-kind accumulator.
    pub fn mean(&self, b: &mut FuncBuilder, src: &Mat, scratch: &[u32]) -> KernelResult<()> {
        check_scratch("mean", scratch, MEAN_SCRATCH)?;
        self.check_elem("mean", &[src])?;

        let (off, acc) = (scratch[0], scratch[1]);
        let count = (src.bytes() / self.elem()) as f64;

        b.push(self.kind.zero());
        b.push(WasmInstr::LocalSet(acc));
        b.range_loop(off, Bound::Const(0), Bound::Const(src.bytes()), self.elem(), |b| {
            b.push(WasmInstr::LocalGet(acc));
            src.push_addr(b, &[Term::Local(off)]);
            b.push(self.kind.load());
            b.push(self.kind.add());
            b.push(WasmInstr::LocalSet(acc));
        });
        b.push(WasmInstr::LocalGet(acc));
        b.push(self.kind.const_val(count));
        b.push(self.kind.div());
        Ok(())
    }

    /// `dst = lhs + rhs * scale`.
    ///
    /// Scratch: one `i32` offset.
    pub fn scaled_add(
        &self,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        scale: ScalarSrc,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("scaled_add", scratch, SCALED_ADD_SCRATCH)?;
        self.scaled_add_impl("scaled_add", b, lhs, rhs, dst, Some(scale), None, scratch[0], None)
    }

    /// `dst = lhs + sign(rhs) * scale`.
    ///
    /// Scratch: one `i32` offset then one element-kind temporary.
    pub fn sign_scaled_add(
        &self,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        scale: ScalarSrc,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("sign_scaled_add", scratch, SIGN_SCALED_ADD_SCRATCH)?;
        self.scaled_add_impl(
            "sign_scaled_add",
            b,
            lhs,
            rhs,
            dst,
            None,
            Some(scale),
            scratch[0],
            Some(scratch[1]),
        )
    }

    /// `dst = lhs + rhs * linear + sign(rhs) * signed`, the combined
    /// L2 + L1 penalty form.
    ///
    /// Scratch: one `i32` offset then one element-kind temporary.
    pub fn scaled_sign_add(
        &self,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        linear: ScalarSrc,
        signed: ScalarSrc,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("scaled_sign_add", scratch, SIGN_SCALED_ADD_SCRATCH)?;
        self.scaled_add_impl(
            "scaled_sign_add",
            b,
            lhs,
            rhs,
            dst,
            Some(linear),
            Some(signed),
            scratch[0],
            Some(scratch[1]),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn scaled_add_impl(
        &self,
        op: &'static str,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        linear: Option<ScalarSrc>,
        signed: Option<ScalarSrc>,
        off: u32,
        tmp: Option<u32>,
    ) -> KernelResult<()> {
        self.check_elem(op, &[lhs, rhs, dst])?;
        check_same_shape(op, lhs, rhs)?;
        check_same_shape(op, lhs, dst)?;
        let tmp = match (signed, tmp) {
            (Some(_), Some(t)) => Some(t),
            (None, _) => None,
            (Some(_), None) => {
                return Err(KernelError::ScratchCount {
                    op,
                    expected: SIGN_SCALED_ADD_SCRATCH,
                    got: 1,
                })
            }
        };

        b.range_loop(off, Bound::Const(0), Bound::Const(dst.bytes()), self.elem(), |b| {
            dst.push_addr(b, &[Term::Local(off)]);
            lhs.push_addr(b, &[Term::Local(off)]);
            b.push(self.kind.load());
            if let Some(scale) = linear {
                rhs.push_addr(b, &[Term::Local(off)]);
                b.push(self.kind.load());
                scale.push(b, self.kind);
                b.push(self.kind.mul());
                b.push(self.kind.add());
            }
            if let (Some(scale), Some(tmp)) = (signed, tmp) {
                // sign(x) = (x > 0) - (x < 0)
                rhs.push_addr(b, &[Term::Local(off)]);
                b.push(self.kind.load());
                b.push(WasmInstr::LocalTee(tmp));
                b.push(self.kind.zero());
                b.push(self.kind.gt());
                b.push(self.kind.convert_u32());
                b.push(WasmInstr::LocalGet(tmp));
                b.push(self.kind.zero());
                b.push(self.kind.lt());
                b.push(self.kind.convert_u32());
                b.push(self.kind.sub());
                scale.push(b, self.kind);
                b.push(self.kind.mul());
                b.push(self.kind.add());
            }
            b.push(self.kind.store());
        });
        Ok(())
    }

    /// Accumulate a confusion matrix: for each column of `pred` and
    /// `target` (both hardmaxed `[classes, batch]` indicators), add one
    /// to `conf[target_class, predicted_class]`.
    ///
    /// Scratch: `[i32; 6]`.
    pub fn confusion_update(
        &self,
        b: &mut FuncBuilder,
        pred: &Mat,
        target: &Mat,
        conf: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("confusion_update", scratch, CONFUSION_SCRATCH)?;
        self.check_elem("confusion_update", &[pred, target, conf])?;
        check_same_shape("confusion_update", pred, target)?;
        let classes = pred.rows();
        if conf.rows() != classes || conf.cols() != classes {
            return Err(KernelError::ShapeMismatch {
                op: "confusion_update",
                detail: format!(
                    "confusion {:?} for {classes} classes",
                    conf.array().shape()
                ),
            });
        }

        let e = self.elem();
        let row_bytes = pred.cols() as u32 * e;
        let total = pred.bytes();
        let conf_row = classes as u32 * e;
        let (col, off, pred_off, targ_off, col_step, row_step) = (
            scratch[0], scratch[1], scratch[2], scratch[3], scratch[4], scratch[5],
        );

        b.range_loop(col, Bound::Const(0), Bound::Const(row_bytes), e, |b| {
            b.set_local(pred_off, Bound::Const(0));
            b.set_local(targ_off, Bound::Const(0));
            b.set_local(col_step, Bound::Const(0));
            b.set_local(row_step, Bound::Const(0));
            b.range_loop(off, Bound::Local(col), Bound::Const(total), row_bytes, |b| {
                pred.push_addr(b, &[Term::Local(off)]);
                b.push(self.kind.load());
                b.push(self.kind.const_val(1.0));
                b.push(self.kind.eq());
                b.if_then(|b| {
                    b.push(WasmInstr::LocalGet(col_step));
                    b.push(WasmInstr::LocalSet(pred_off));
                });
                target.push_addr(b, &[Term::Local(off)]);
                b.push(self.kind.load());
                b.push(self.kind.const_val(1.0));
                b.push(self.kind.eq());
                b.if_then(|b| {
                    b.push(WasmInstr::LocalGet(row_step));
                    b.push(WasmInstr::LocalSet(targ_off));
                });
                b.set_local(col_step, Bound::LocalPlus(col_step, e));
                b.set_local(row_step, Bound::LocalPlus(row_step, conf_row));
            });
            conf.push_addr(b, &[Term::Local(targ_off), Term::Local(pred_off)]);
            conf.push_addr(b, &[Term::Local(targ_off), Term::Local(pred_off)]);
            b.push(self.kind.load());
            b.push(self.kind.const_val(1.0));
            b.push(self.kind.add());
            b.push(self.kind.store());
        });
        Ok(())
    }

    /// Count columns where `pred` and `target` agree exactly, adding
    /// the count into the single-cell `hits` buffer.
    ///
    /// Scratch: `[i32; 3]` (column, offset, match flag).
    pub fn correct_predictions(
        &self,
        b: &mut FuncBuilder,
        pred: &Mat,
        target: &Mat,
        hits: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        check_scratch("correct_predictions", scratch, CORRECT_SCRATCH)?;
        self.check_elem("correct_predictions", &[pred, target, hits])?;
        check_same_shape("correct_predictions", pred, target)?;

        let e = self.elem();
        let row_bytes = pred.cols() as u32 * e;
        let total = pred.bytes();
        let (col, off, matched) = (scratch[0], scratch[1], scratch[2]);

        b.range_loop(col, Bound::Const(0), Bound::Const(row_bytes), e, |b| {
            b.set_local(matched, Bound::Const(1));
            b.range_loop(off, Bound::Local(col), Bound::Const(total), row_bytes, |b| {
                pred.push_addr(b, &[Term::Local(off)]);
                b.push(self.kind.load());
                target.push_addr(b, &[Term::Local(off)]);
                b.push(self.kind.load());
                b.push(self.kind.ne());
                b.if_then(|b| {
                    b.push(WasmInstr::I32Const(0));
                    b.push(WasmInstr::LocalSet(matched));
                });
            });
            b.push(WasmInstr::LocalGet(matched));
            b.if_then(|b| {
                hits.push_addr(b, &[]);
                hits.push_addr(b, &[]);
                b.push(self.kind.load());
                b.push(self.kind.const_val(1.0));
                b.push(self.kind.add());
                b.push(self.kind.store());
            });
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnc_mem::{Arena, NdArray};
    use nnc_wasm::WasmType;

    fn mat(arena: &mut Arena, rows: usize, cols: usize) -> Mat {
        let region = arena.allocate((rows * cols * 4) as u32).unwrap();
        Mat::fixed(NdArray::new(region, vec![rows, cols], 4).unwrap())
    }

    fn scratch_i32(b: &mut FuncBuilder, n: usize) -> Vec<u32> {
        (0..n).map(|_| b.local(WasmType::I32)).collect()
    }

    fn dot_scratch(b: &mut FuncBuilder) -> Vec<u32> {
        let mut s = scratch_i32(b, 5);
        s.push(b.local(WasmType::F32));
        s
    }

    #[test]
    fn test_scalar_mul_loop_bounds() {
        let mut arena = Arena::new();
        let src = mat(&mut arena, 5, 10);
        let dst = mat(&mut arena, 5, 10);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = scratch_i32(&mut b, 1);
        ScalarKernels::new(NumKind::F32)
            .scalar_mul(&mut b, &src, ScalarSrc::Const(0.2), &dst, &s)
            .unwrap();

        // 5 * 10 * 4 bytes, stepped 4 at a time.
        assert!(b.body().contains(&WasmInstr::I32Const(200)));
        assert!(b.body().contains(&WasmInstr::F32Const(0.2)));
    }

    #[test]
    fn test_binary_rejects_shape_mismatch() {
        let mut arena = Arena::new();
        let a = mat(&mut arena, 2, 3);
        let bm = mat(&mut arena, 3, 2);
        let dst = mat(&mut arena, 2, 3);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = scratch_i32(&mut b, 1);
        let err = ScalarKernels::new(NumKind::F32)
            .binary(&mut b, BinOp::Add, &a, &bm, &dst, &s)
            .unwrap_err();
        assert!(matches!(err, KernelError::ShapeMismatch { op: "binary", .. }));
        // Nothing emitted for a rejected kernel.
        assert!(b.body().is_empty());
    }

    #[test]
    fn test_dot_rejects_wrong_scratch_count() {
        let mut arena = Arena::new();
        let a = mat(&mut arena, 2, 3);
        let bm = mat(&mut arena, 3, 2);
        let dst = mat(&mut arena, 2, 2);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = scratch_i32(&mut b, 3);
        let err = ScalarKernels::new(NumKind::F32)
            .dot(&mut b, &a, &bm, &dst, &s)
            .unwrap_err();
        assert!(matches!(err, KernelError::ScratchCount { expected: 6, got: 3, .. }));
    }

    #[test]
    fn test_dot_rejects_contraction_mismatch() {
        let mut arena = Arena::new();
        let a = mat(&mut arena, 2, 3);
        let bm = mat(&mut arena, 2, 3);
        let dst = mat(&mut arena, 2, 3);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = dot_scratch(&mut b);
        assert!(ScalarKernels::new(NumKind::F32)
            .dot(&mut b, &a, &bm, &dst, &s)
            .is_err());
    }

    #[test]
    fn test_dot_loop_nest_balances() {
        let mut arena = Arena::new();
        let a = mat(&mut arena, 4, 3);
        let bm = mat(&mut arena, 3, 5);
        let dst = mat(&mut arena, 4, 5);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = dot_scratch(&mut b);
        ScalarKernels::new(NumKind::F32)
            .dot(&mut b, &a, &bm, &dst, &s)
            .unwrap();

        let opens = b
            .body()
            .iter()
            .filter(|i| matches!(i, WasmInstr::Block(_) | WasmInstr::Loop(_)))
            .count();
        let ends = b.body().iter().filter(|i| matches!(i, WasmInstr::End)).count();
        assert_eq!(opens, 6); // three nested range loops
        assert_eq!(ends, opens);
    }

    #[test]
    fn test_hardmax_tracks_max_with_strict_greater() {
        let mut arena = Arena::new();
        let src = mat(&mut arena, 3, 2);
        let dst = mat(&mut arena, 3, 2);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let mut s = scratch_i32(&mut b, 3);
        s.push(b.local(WasmType::F32));
        s.push(b.local(WasmType::F32));
        ScalarKernels::new(NumKind::F32)
            .column_hardmax(&mut b, &src, &dst, &s)
            .unwrap();

        assert!(b.body().contains(&WasmInstr::F32Gt));
        assert!(b.body().contains(&WasmInstr::I32Eq));
        assert!(b.body().contains(&WasmInstr::If(Some(WasmType::F32))));
    }

    #[test]
    fn test_apply_calls_routine_per_source() {
        let mut arena = Arena::new();
        let target = mat(&mut arena, 2, 2);
        let pred = mat(&mut arena, 2, 2);
        let dst = mat(&mut arena, 2, 2);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = scratch_i32(&mut b, 1);
        ScalarKernels::new(NumKind::F32)
            .apply(&mut b, &[&target, &pred], 7, &dst, &s)
            .unwrap();

        assert!(b.body().contains(&WasmInstr::Call(7)));
        let loads = b
            .body()
            .iter()
            .filter(|i| matches!(i, WasmInstr::F32Load(..)))
            .count();
        assert_eq!(loads, 2);
    }

    #[test]
    fn test_mean_divides_by_element_count() {
        let mut arena = Arena::new();
        let src = mat(&mut arena, 2, 5);

        let mut b = FuncBuilder::new("f", vec![], vec![WasmType::F32]);
        let mut s = scratch_i32(&mut b, 1);
        s.push(b.local(WasmType::F32));
        ScalarKernels::new(NumKind::F32)
            .mean(&mut b, &src, &s)
            .unwrap();

        assert_eq!(b.body().last(), Some(&WasmInstr::F32Div));
        assert!(b.body().contains(&WasmInstr::F32Const(10.0)));
    }

    #[test]
    fn test_sign_scaled_add_requires_temp() {
        let mut arena = Arena::new();
        let a = mat(&mut arena, 2, 2);
        let r = mat(&mut arena, 2, 2);
        let dst = mat(&mut arena, 2, 2);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = scratch_i32(&mut b, 1);
        assert!(ScalarKernels::new(NumKind::F32)
            .sign_scaled_add(&mut b, &a, &r, &dst, ScalarSrc::Const(0.01), &s)
            .is_err());
    }

    #[test]
    fn test_relocatable_operand_uses_base_local() {
        let mut arena = Arena::new();
        let region = arena.allocate(16).unwrap();
        let src = Mat::relocatable(NdArray::new(region, vec![2, 2], 4).unwrap(), 0);
        let dst = mat(&mut arena, 2, 2);

        let mut b = FuncBuilder::new("f", vec![WasmType::I32], vec![]);
        let s = scratch_i32(&mut b, 1);
        ScalarKernels::new(NumKind::F32)
            .scalar_mul(&mut b, &src, ScalarSrc::Const(2.0), &dst, &s)
            .unwrap();

        assert!(b.body().contains(&WasmInstr::LocalGet(0)));
    }
}
