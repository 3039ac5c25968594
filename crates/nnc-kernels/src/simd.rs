//! Vectorized matrix kernel generators.
//!
//! Lowers the hot kernels to f32x4 lane operations over the prefix of
//! each buffer whose byte length is a multiple of the lane width, with
//! the scalar form covering the remainder. When the relevant dimension
//! is shorter than one lane group, the whole operation delegates to the
//! scalar generator. Only `f32` elements vectorize; other kinds always
//! delegate, as does everything when lowering is disabled.
//!
//! Dot-product variants accumulate lane-parallel partial sums and
//! reduce them once, after the vectorized loop, pairwise left to right:
//! `((l0 + l1) + l2) + l3`. The reduction order is fixed; tests compare
//! against it exactly.

use crate::scalar::{self, ScalarKernels};
use crate::{BinOp, KernelResult, Mat, NumKind, ScalarSrc, Term};
use nnc_wasm::{Bound, FuncBuilder, WasmInstr};

/// Bytes per v128 lane group.
pub const LANE_BYTES: u32 = 16;

/// Scratch locals for the vectorized dot family: five `i32`, one `f32`
/// accumulator, one `v128` accumulator.
pub const DOT_SCRATCH: usize = 7;
/// Scratch locals for vectorized element-wise binary kernels: one
/// `i32` offset (shared by the lane loop and the remainder loop).
pub const BINARY_SCRATCH: usize = 1;
/// Scratch locals for vectorized scalar multiply: one `i32` offset and
/// one `v128` splat.
pub const SCALAR_MUL_SCRATCH: usize = 2;
/// Scratch locals for vectorized broadcast: three `i32`, one `f32`
/// value, one `v128` splat.
pub const BROADCAST_SCRATCH: usize = 5;
/// Scratch locals for vectorized row sum: three `i32`, one `f32`
/// accumulator, one `v128` accumulator.
pub const ROW_SUM_SCRATCH: usize = 5;

/// Vectorizing kernel generator wrapping a scalar fallback.
#[derive(Clone, Copy, Debug)]
pub struct SimdKernels {
    scalar: ScalarKernels,
    enabled: bool,
}

impl SimdKernels {
    /// Create a generator over `scalar`, lowering to lanes when
    /// `enabled`.
    #[must_use]
    pub fn new(scalar: ScalarKernels, enabled: bool) -> Self {
        Self { scalar, enabled }
    }

    /// The scalar fallback generator.
    #[must_use]
    pub fn scalar(&self) -> &ScalarKernels {
        &self.scalar
    }

    /// Whether lane lowering is active for this element kind.
    #[must_use]
    pub fn vectorizes(&self) -> bool {
        self.enabled && self.scalar.kind() == NumKind::F32
    }

    /// Emit the pairwise lane reduction `((l0 + l1) + l2) + l3`,
    /// leaving the f32 sum on the stack.
    fn push_lane_reduce(b: &mut FuncBuilder, vacc: u32) {
        b.push(WasmInstr::LocalGet(vacc));
        b.push(WasmInstr::F32x4ExtractLane(0));
        for lane in 1..4 {
            b.push(WasmInstr::LocalGet(vacc));
            b.push(WasmInstr::F32x4ExtractLane(lane));
            b.push(WasmInstr::F32Add);
        }
    }

    fn push_vzero(b: &mut FuncBuilder, vacc: u32) {
        b.push(WasmInstr::V128Const([0; 16]));
        b.push(WasmInstr::LocalSet(vacc));
    }

    /// Scratch prefix for delegation; a too-short slice is passed
    /// through so the scalar kernel reports the count error.
    fn sub(scratch: &[u32], n: usize) -> &[u32] {
        if scratch.len() >= n {
            &scratch[..n]
        } else {
            scratch
        }
    }

    /// `dst[m,p] = lhs[m,n] · rhs[n,p]`, tiling four output columns per
    /// lane group: the lhs element is splatted and multiplied against a
    /// lane group of the rhs row, so each output cell's accumulation
    /// order matches the scalar kernel exactly.
    ///
    /// When the rhs is a single column with at least one lane group of
    /// contraction, the product is lowered instead as a lane-wise
    /// multiply-accumulate sweep with one final pairwise reduction.
    ///
    /// Scratch: `[i32; 5]`, one `f32`, one `v128` ([`DOT_SCRATCH`]).
    pub fn dot(
        &self,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        let e = self.scalar.kind().size();
        let n_bytes = lhs.cols() as u32 * e;
        if !self.vectorizes() {
            return self.scalar.dot(b, lhs, rhs, dst, Self::sub(scratch, scalar::DOT_SCRATCH));
        }
        if rhs.cols() == 1 && n_bytes >= LANE_BYTES {
            return self.dot_vector_rhs(b, lhs, rhs, dst, scratch);
        }
        let p_bytes = rhs.cols() as u32 * e;
        if p_bytes < LANE_BYTES {
            return self.scalar.dot(b, lhs, rhs, dst, Self::sub(scratch, scalar::DOT_SCRATCH));
        }

        crate::check_scratch("simd dot", scratch, DOT_SCRATCH)?;
        self.scalar.validate_dot(lhs, rhs, dst)?;

        let (m, _n, _) = (lhs.rows() as u32, lhs.cols() as u32, rhs.cols() as u32);
        let vec_cols = p_bytes - p_bytes % LANE_BYTES;
        let (dst_off, col, k, lhs_row, rhs_off) =
            (scratch[0], scratch[1], scratch[2], scratch[3], scratch[4]);
        let acc = scratch[5];
        let vacc = scratch[6];
        let kind = self.scalar.kind();

        b.set_local(lhs_row, Bound::Const(0));
        b.range_loop(dst_off, Bound::Const(0), Bound::Const(m * p_bytes), p_bytes, |b| {
            b.range_loop(col, Bound::Const(0), Bound::Const(vec_cols), LANE_BYTES, |b| {
                Self::push_vzero(b, vacc);
                b.set_local(rhs_off, Bound::Local(col));
                b.range_loop(k, Bound::Const(0), Bound::Const(n_bytes), e, |b| {
                    b.push(WasmInstr::LocalGet(vacc));
                    lhs.push_addr(b, &[Term::Local(lhs_row), Term::Local(k)]);
                    b.push(WasmInstr::F32Load(4, 0));
                    b.push(WasmInstr::F32x4Splat);
                    rhs.push_addr(b, &[Term::Local(rhs_off)]);
                    b.push(WasmInstr::V128Load(16, 0));
                    b.push(WasmInstr::F32x4Mul);
                    b.push(WasmInstr::F32x4Add);
                    b.push(WasmInstr::LocalSet(vacc));
                    b.set_local(rhs_off, Bound::LocalPlus(rhs_off, p_bytes));
                });
                dst.push_addr(b, &[Term::Local(dst_off), Term::Local(col)]);
                b.push(WasmInstr::LocalGet(vacc));
                b.push(WasmInstr::V128Store(16, 0));
            });
            // Scalar remainder columns.
            if vec_cols < p_bytes {
                b.range_loop(col, Bound::Const(vec_cols), Bound::Const(p_bytes), e, |b| {
                    b.push(kind.zero());
                    b.push(WasmInstr::LocalSet(acc));
                    b.set_local(rhs_off, Bound::Local(col));
                    b.range_loop(k, Bound::Const(0), Bound::Const(n_bytes), e, |b| {
                        b.push(WasmInstr::LocalGet(acc));
                        lhs.push_addr(b, &[Term::Local(lhs_row), Term::Local(k)]);
                        b.push(kind.load());
                        rhs.push_addr(b, &[Term::Local(rhs_off)]);
                        b.push(kind.load());
                        b.push(kind.mul());
                        b.push(kind.add());
                        b.push(WasmInstr::LocalSet(acc));
                        b.set_local(rhs_off, Bound::LocalPlus(rhs_off, p_bytes));
                    });
                    dst.push_addr(b, &[Term::Local(dst_off), Term::Local(col)]);
                    b.push(WasmInstr::LocalGet(acc));
                    b.push(kind.store());
                });
            }
            b.set_local(lhs_row, Bound::LocalPlus(lhs_row, n_bytes));
        });
        Ok(())
    }

    /// Lane-wise multiply-accumulate for a single-column rhs. One
    /// pairwise reduction per output row, then a scalar remainder
    /// sweep.
    fn dot_vector_rhs(
        &self,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        crate::check_scratch("simd dot", scratch, DOT_SCRATCH)?;
        self.scalar.validate_dot(lhs, rhs, dst)?;

        let kind = self.scalar.kind();
        let e = kind.size();
        let m = lhs.rows() as u32;
        let n_bytes = lhs.cols() as u32 * e;
        let vec_end = n_bytes - n_bytes % LANE_BYTES;
        let (dst_off, k, lhs_row) = (scratch[0], scratch[2], scratch[3]);
        let acc = scratch[5];
        let vacc = scratch[6];

        b.set_local(lhs_row, Bound::Const(0));
        b.range_loop(dst_off, Bound::Const(0), Bound::Const(m * e), e, |b| {
            Self::push_vzero(b, vacc);
            b.range_loop(k, Bound::Const(0), Bound::Const(vec_end), LANE_BYTES, |b| {
                b.push(WasmInstr::LocalGet(vacc));
                lhs.push_addr(b, &[Term::Local(lhs_row), Term::Local(k)]);
                b.push(WasmInstr::V128Load(16, 0));
                rhs.push_addr(b, &[Term::Local(k)]);
                b.push(WasmInstr::V128Load(16, 0));
                b.push(WasmInstr::F32x4Mul);
                b.push(WasmInstr::F32x4Add);
                b.push(WasmInstr::LocalSet(vacc));
            });
            Self::push_lane_reduce(b, vacc);
            b.push(WasmInstr::LocalSet(acc));
            if vec_end < n_bytes {
                b.range_loop(k, Bound::Const(vec_end), Bound::Const(n_bytes), e, |b| {
                    b.push(WasmInstr::LocalGet(acc));
                    lhs.push_addr(b, &[Term::Local(lhs_row), Term::Local(k)]);
                    b.push(kind.load());
                    rhs.push_addr(b, &[Term::Local(k)]);
                    b.push(kind.load());
                    b.push(kind.mul());
                    b.push(kind.add());
                    b.push(WasmInstr::LocalSet(acc));
                });
            }
            dst.push_addr(b, &[Term::Local(dst_off)]);
            b.push(WasmInstr::LocalGet(acc));
            b.push(kind.store());
            b.set_local(lhs_row, Bound::LocalPlus(lhs_row, n_bytes));
        });
        Ok(())
    }

    /// `dst[m,p] = lhsᵗ · rhs` with `lhs` stored `[n,m]`, tiled over
    /// output columns like [`dot`](Self::dot).
    ///
    /// Scratch: as [`dot`](Self::dot).
    pub fn dot_lt(
        &self,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        let e = self.scalar.kind().size();
        let p_bytes = rhs.cols() as u32 * e;
        if !self.vectorizes() || p_bytes < LANE_BYTES {
            return self.scalar.dot_lt(b, lhs, rhs, dst, Self::sub(scratch, scalar::DOT_SCRATCH));
        }

        crate::check_scratch("simd dot_lt", scratch, DOT_SCRATCH)?;
        self.scalar.validate_dot_lt(lhs, rhs, dst)?;

        let kind = self.scalar.kind();
        let m = lhs.cols() as u32;
        let n = lhs.rows() as u32;
        let m_bytes = m * e;
        let vec_cols = p_bytes - p_bytes % LANE_BYTES;
        let (dst_off, col, rhs_off, lhs_off, lhs_col) =
            (scratch[0], scratch[1], scratch[2], scratch[3], scratch[4]);
        let acc = scratch[5];
        let vacc = scratch[6];

        b.set_local(lhs_col, Bound::Const(0));
        b.range_loop(dst_off, Bound::Const(0), Bound::Const(m * p_bytes), p_bytes, |b| {
            b.range_loop(col, Bound::Const(0), Bound::Const(vec_cols), LANE_BYTES, |b| {
                Self::push_vzero(b, vacc);
                b.set_local(lhs_off, Bound::Local(lhs_col));
                b.range_loop(
                    rhs_off,
                    Bound::Local(col),
                    Bound::LocalPlus(col, n * p_bytes),
                    p_bytes,
                    |b| {
                        b.push(WasmInstr::LocalGet(vacc));
                        lhs.push_addr(b, &[Term::Local(lhs_off)]);
                        b.push(WasmInstr::F32Load(4, 0));
                        b.push(WasmInstr::F32x4Splat);
                        rhs.push_addr(b, &[Term::Local(rhs_off)]);
                        b.push(WasmInstr::V128Load(16, 0));
                        b.push(WasmInstr::F32x4Mul);
                        b.push(WasmInstr::F32x4Add);
                        b.push(WasmInstr::LocalSet(vacc));
                        b.set_local(lhs_off, Bound::LocalPlus(lhs_off, m_bytes));
                    },
                );
                dst.push_addr(b, &[Term::Local(dst_off), Term::Local(col)]);
                b.push(WasmInstr::LocalGet(vacc));
                b.push(WasmInstr::V128Store(16, 0));
            });
            if vec_cols < p_bytes {
                b.range_loop(col, Bound::Const(vec_cols), Bound::Const(p_bytes), e, |b| {
                    b.push(kind.zero());
                    b.push(WasmInstr::LocalSet(acc));
                    b.set_local(lhs_off, Bound::Local(lhs_col));
                    b.range_loop(
                        rhs_off,
                        Bound::Local(col),
                        Bound::LocalPlus(col, n * p_bytes),
                        p_bytes,
                        |b| {
                            b.push(WasmInstr::LocalGet(acc));
                            lhs.push_addr(b, &[Term::Local(lhs_off)]);
                            b.push(kind.load());
                            rhs.push_addr(b, &[Term::Local(rhs_off)]);
                            b.push(kind.load());
                            b.push(kind.mul());
                            b.push(kind.add());
                            b.push(WasmInstr::LocalSet(acc));
                            b.set_local(lhs_off, Bound::LocalPlus(lhs_off, m_bytes));
                        },
                    );
                    dst.push_addr(b, &[Term::Local(dst_off), Term::Local(col)]);
                    b.push(WasmInstr::LocalGet(acc));
                    b.push(kind.store());
                });
            }
            b.set_local(lhs_col, Bound::LocalPlus(lhs_col, e));
        });
        Ok(())
    }

    /// `dst[m,p] = lhs · rhsᵗ` with `rhs` stored `[p,n]`. The
    /// contraction is contiguous in both operands, so it vectorizes
    /// directly: lane-parallel partial sums, one pairwise reduction per
    /// output cell, scalar remainder.
    ///
    /// Scratch: as [`dot`](Self::dot).
    pub fn dot_rt(
        &self,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        let e = self.scalar.kind().size();
        let n_bytes = lhs.cols() as u32 * e;
        if !self.vectorizes() || n_bytes < LANE_BYTES {
            return self.scalar.dot_rt(b, lhs, rhs, dst, Self::sub(scratch, scalar::DOT_SCRATCH));
        }

        crate::check_scratch("simd dot_rt", scratch, DOT_SCRATCH)?;
        self.scalar.validate_dot_rt(lhs, rhs, dst)?;

        let kind = self.scalar.kind();
        let m = lhs.rows() as u32;
        let p_bytes = rhs.rows() as u32 * e;
        let vec_end = n_bytes - n_bytes % LANE_BYTES;
        let (dst_off, col, k, lhs_row, rhs_row) =
            (scratch[0], scratch[1], scratch[2], scratch[3], scratch[4]);
        let acc = scratch[5];
        let vacc = scratch[6];

        b.set_local(lhs_row, Bound::Const(0));
        b.range_loop(dst_off, Bound::Const(0), Bound::Const(m * p_bytes), p_bytes, |b| {
            b.set_local(rhs_row, Bound::Const(0));
            b.range_loop(col, Bound::Const(0), Bound::Const(p_bytes), e, |b| {
                Self::push_vzero(b, vacc);
                b.range_loop(k, Bound::Const(0), Bound::Const(vec_end), LANE_BYTES, |b| {
                    b.push(WasmInstr::LocalGet(vacc));
                    lhs.push_addr(b, &[Term::Local(lhs_row), Term::Local(k)]);
                    b.push(WasmInstr::V128Load(16, 0));
                    rhs.push_addr(b, &[Term::Local(rhs_row), Term::Local(k)]);
                    b.push(WasmInstr::V128Load(16, 0));
                    b.push(WasmInstr::F32x4Mul);
                    b.push(WasmInstr::F32x4Add);
                    b.push(WasmInstr::LocalSet(vacc));
                });
                Self::push_lane_reduce(b, vacc);
                b.push(WasmInstr::LocalSet(acc));
                if vec_end < n_bytes {
                    b.range_loop(k, Bound::Const(vec_end), Bound::Const(n_bytes), e, |b| {
                        b.push(WasmInstr::LocalGet(acc));
                        lhs.push_addr(b, &[Term::Local(lhs_row), Term::Local(k)]);
                        b.push(kind.load());
                        rhs.push_addr(b, &[Term::Local(rhs_row), Term::Local(k)]);
                        b.push(kind.load());
                        b.push(kind.mul());
                        b.push(kind.add());
                        b.push(WasmInstr::LocalSet(acc));
                    });
                }
                dst.push_addr(b, &[Term::Local(dst_off), Term::Local(col)]);
                b.push(WasmInstr::LocalGet(acc));
                b.push(kind.store());
                b.set_local(rhs_row, Bound::LocalPlus(rhs_row, n_bytes));
            });
            b.set_local(lhs_row, Bound::LocalPlus(lhs_row, n_bytes));
        });
        Ok(())
    }

    /// Element-wise `dst = lhs ∘ rhs` over lane groups, scalar
    /// remainder.
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
        if !self.vectorizes() || dst.bytes() < LANE_BYTES {
            return self.scalar.binary(b, op, lhs, rhs, dst, scratch);
        }
        crate::check_scratch("simd binary", scratch, BINARY_SCRATCH)?;
        self.scalar.validate_elementwise("binary", lhs, rhs, dst)?;

        let kind = self.scalar.kind();
        let e = kind.size();
        let bytes = dst.bytes();
        let vec_end = bytes - bytes % LANE_BYTES;
        let off = scratch[0];

        b.range_loop(off, Bound::Const(0), Bound::Const(vec_end), LANE_BYTES, |b| {
            dst.push_addr(b, &[Term::Local(off)]);
            lhs.push_addr(b, &[Term::Local(off)]);
            b.push(WasmInstr::V128Load(16, 0));
            rhs.push_addr(b, &[Term::Local(off)]);
            b.push(WasmInstr::V128Load(16, 0));
            b.push(op.simd_instr());
            b.push(WasmInstr::V128Store(16, 0));
        });
        if vec_end < bytes {
            b.range_loop(off, Bound::Const(vec_end), Bound::Const(bytes), e, |b| {
                dst.push_addr(b, &[Term::Local(off)]);
                lhs.push_addr(b, &[Term::Local(off)]);
                b.push(kind.load());
                rhs.push_addr(b, &[Term::Local(off)]);
                b.push(kind.load());
                b.push(op.instr(kind));
                b.push(kind.store());
            });
        }
        Ok(())
    }

    /// `dst = src * scalar` over lane groups with a splatted scalar.
    ///
    /// Scratch: one `i32` offset then one `v128` splat.
    pub fn scalar_mul(
        &self,
        b: &mut FuncBuilder,
        src: &Mat,
        scalar: ScalarSrc,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        if !self.vectorizes() || dst.bytes() < LANE_BYTES {
            return self
                .scalar
                .scalar_mul(b, src, scalar, dst, Self::sub(scratch, scalar::SCALAR_MUL_SCRATCH));
        }
        crate::check_scratch("simd scalar_mul", scratch, SCALAR_MUL_SCRATCH)?;
        self.scalar.validate_elementwise("scalar_mul", src, src, dst)?;

        let kind = self.scalar.kind();
        let e = kind.size();
        let bytes = dst.bytes();
        let vec_end = bytes - bytes % LANE_BYTES;
        let (off, vsplat) = (scratch[0], scratch[1]);

        scalar.push(b, kind);
        b.push(WasmInstr::F32x4Splat);
        b.push(WasmInstr::LocalSet(vsplat));
        b.range_loop(off, Bound::Const(0), Bound::Const(vec_end), LANE_BYTES, |b| {
            dst.push_addr(b, &[Term::Local(off)]);
            src.push_addr(b, &[Term::Local(off)]);
            b.push(WasmInstr::V128Load(16, 0));
            b.push(WasmInstr::LocalGet(vsplat));
            b.push(WasmInstr::F32x4Mul);
            b.push(WasmInstr::V128Store(16, 0));
        });
        if vec_end < bytes {
            b.range_loop(off, Bound::Const(vec_end), Bound::Const(bytes), e, |b| {
                dst.push_addr(b, &[Term::Local(off)]);
                src.push_addr(b, &[Term::Local(off)]);
                b.push(kind.load());
                scalar.push(b, kind);
                b.push(kind.mul());
                b.push(kind.store());
            });
        }
        Ok(())
    }

    /// `dst[i,j] = mat[i,j] ∘ vec[i,0]` with the vector element
    /// splatted once per row.
    ///
    /// Scratch: `[i32; 3]`, one `f32`, one `v128`.
    pub fn broadcast(
        &self,
        b: &mut FuncBuilder,
        op: BinOp,
        mat: &Mat,
        vec: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        let e = self.scalar.kind().size();
        let row_bytes = mat.cols() as u32 * e;
        if !self.vectorizes() || row_bytes < LANE_BYTES {
            return self
                .scalar
                .broadcast(b, op, mat, vec, dst, Self::sub(scratch, scalar::BROADCAST_SCRATCH));
        }
        crate::check_scratch("simd broadcast", scratch, BROADCAST_SCRATCH)?;
        self.scalar.validate_broadcast(mat, vec, dst)?;

        let kind = self.scalar.kind();
        let vec_cols = row_bytes - row_bytes % LANE_BYTES;
        let (row_off, col, vec_off) = (scratch[0], scratch[1], scratch[2]);
        let val = scratch[3];
        let vsplat = scratch[4];

        b.set_local(vec_off, Bound::Const(0));
        b.range_loop(row_off, Bound::Const(0), Bound::Const(mat.bytes()), row_bytes, |b| {
            vec.push_addr(b, &[Term::Local(vec_off)]);
            b.push(kind.load());
            b.push(WasmInstr::LocalTee(val));
            b.push(WasmInstr::F32x4Splat);
            b.push(WasmInstr::LocalSet(vsplat));
            b.range_loop(col, Bound::Const(0), Bound::Const(vec_cols), LANE_BYTES, |b| {
                dst.push_addr(b, &[Term::Local(row_off), Term::Local(col)]);
                mat.push_addr(b, &[Term::Local(row_off), Term::Local(col)]);
                b.push(WasmInstr::V128Load(16, 0));
                b.push(WasmInstr::LocalGet(vsplat));
                b.push(op.simd_instr());
                b.push(WasmInstr::V128Store(16, 0));
            });
            if vec_cols < row_bytes {
                b.range_loop(col, Bound::Const(vec_cols), Bound::Const(row_bytes), e, |b| {
                    dst.push_addr(b, &[Term::Local(row_off), Term::Local(col)]);
                    mat.push_addr(b, &[Term::Local(row_off), Term::Local(col)]);
                    b.push(kind.load());
                    b.push(WasmInstr::LocalGet(val));
                    b.push(op.instr(kind));
                    b.push(kind.store());
                });
            }
            b.set_local(vec_off, Bound::LocalPlus(vec_off, e));
        });
        Ok(())
    }

    /// Horizontal sum with lane-parallel partial sums per row, one
    /// pairwise reduction, scalar remainder.
    ///
    /// Scratch: `[i32; 3]`, one `f32` accumulator, one `v128`
    /// accumulator.
    pub fn row_sum(
        &self,
        b: &mut FuncBuilder,
        src: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        let e = self.scalar.kind().size();
        let row_bytes = src.cols() as u32 * e;
        if !self.vectorizes() || row_bytes < LANE_BYTES {
            return self.scalar.row_sum(b, src, dst, Self::sub(scratch, scalar::ROW_SUM_SCRATCH));
        }
        crate::check_scratch("simd row_sum", scratch, ROW_SUM_SCRATCH)?;
        self.scalar.validate_row_sum(src, dst)?;

        let kind = self.scalar.kind();
        let vec_row = row_bytes - row_bytes % LANE_BYTES;
        let (row, off, dst_off) = (scratch[0], scratch[1], scratch[2]);
        let acc = scratch[3];
        let vacc = scratch[4];

        b.set_local(dst_off, Bound::Const(0));
        b.range_loop(row, Bound::Const(0), Bound::Const(src.bytes()), row_bytes, |b| {
            Self::push_vzero(b, vacc);
            b.range_loop(
                off,
                Bound::Local(row),
                Bound::LocalPlus(row, vec_row),
                LANE_BYTES,
                |b| {
                    b.push(WasmInstr::LocalGet(vacc));
                    src.push_addr(b, &[Term::Local(off)]);
                    b.push(WasmInstr::V128Load(16, 0));
                    b.push(WasmInstr::F32x4Add);
                    b.push(WasmInstr::LocalSet(vacc));
                },
            );
            Self::push_lane_reduce(b, vacc);
            b.push(WasmInstr::LocalSet(acc));
            if vec_row < row_bytes {
                b.range_loop(
                    off,
                    Bound::LocalPlus(row, vec_row),
                    Bound::LocalPlus(row, row_bytes),
                    e,
                    |b| {
                        b.push(WasmInstr::LocalGet(acc));
                        src.push_addr(b, &[Term::Local(off)]);
                        b.push(kind.load());
                        b.push(kind.add());
                        b.push(WasmInstr::LocalSet(acc));
                    },
                );
            }
            dst.push_addr(b, &[Term::Local(dst_off)]);
            b.push(WasmInstr::LocalGet(acc));
            b.push(kind.store());
            b.set_local(dst_off, Bound::LocalPlus(dst_off, e));
        });
        Ok(())
    }

    /// Element-wise application; routine calls do not vectorize, so
    /// this always delegates.
    pub fn apply(
        &self,
        b: &mut FuncBuilder,
        srcs: &[&Mat],
        func: u32,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        self.scalar.apply(b, srcs, func, dst, scratch)
    }

    /// Column hardmax; the two-pass scan is control-flow-bound, so this
    /// always delegates.
    pub fn column_hardmax(
        &self,
        b: &mut FuncBuilder,
        src: &Mat,
        dst: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        self.scalar.column_hardmax(b, src, dst, scratch)
    }

    /// Column softmax; calls the exp routine per element, so this
    /// always delegates.
    pub fn column_softmax(
        &self,
        b: &mut FuncBuilder,
        src: &Mat,
        dst: &Mat,
        exp_func: u32,
        scratch: &[u32],
    ) -> KernelResult<()> {
        self.scalar.column_softmax(b, src, dst, exp_func, scratch)
    }

    /// Absolute-value sum; kept scalar so the regularization term's
    /// accumulation order never depends on the lowering flag.
    pub fn abs_sum(&self, b: &mut FuncBuilder, src: &Mat, scratch: &[u32]) -> KernelResult<()> {
        self.scalar.abs_sum(b, src, scratch)
    }

    /// Square sum; kept scalar, see [`abs_sum`](Self::abs_sum).
    pub fn square_sum(&self, b: &mut FuncBuilder, src: &Mat, scratch: &[u32]) -> KernelResult<()> {
        self.scalar.square_sum(b, src, scratch)
    }

    /// Mean of all elements, left on the stack; kept scalar, see
    /// [`abs_sum`](Self::abs_sum).
    pub fn mean(&self, b: &mut FuncBuilder, src: &Mat, scratch: &[u32]) -> KernelResult<()> {
        self.scalar.mean(b, src, scratch)
    }

    /// `dst = lhs + rhs * scale`; always delegates.
    pub fn scaled_add(
        &self,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        scale: ScalarSrc,
        scratch: &[u32],
    ) -> KernelResult<()> {
        self.scalar.scaled_add(b, lhs, rhs, dst, scale, scratch)
    }

    /// `dst = lhs + sign(rhs) * scale`; always delegates.
    pub fn sign_scaled_add(
        &self,
        b: &mut FuncBuilder,
        lhs: &Mat,
        rhs: &Mat,
        dst: &Mat,
        scale: ScalarSrc,
        scratch: &[u32],
    ) -> KernelResult<()> {
        self.scalar.sign_scaled_add(b, lhs, rhs, dst, scale, scratch)
    }

    /// Combined L2 + L1 penalty add; always delegates.
    #[allow(clippy::too_many_arguments)]
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
        self.scalar.scaled_sign_add(b, lhs, rhs, dst, linear, signed, scratch)
    }

    /// Confusion-matrix accumulation; always delegates.
    pub fn confusion_update(
        &self,
        b: &mut FuncBuilder,
        pred: &Mat,
        target: &Mat,
        conf: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        self.scalar.confusion_update(b, pred, target, conf, scratch)
    }

    /// Correct-prediction counting; always delegates.
    pub fn correct_predictions(
        &self,
        b: &mut FuncBuilder,
        pred: &Mat,
        target: &Mat,
        hits: &Mat,
        scratch: &[u32],
    ) -> KernelResult<()> {
        self.scalar.correct_predictions(b, pred, target, hits, scratch)
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

    fn simd_f32() -> SimdKernels {
        SimdKernels::new(ScalarKernels::new(NumKind::F32), true)
    }

    fn dot_scratch(b: &mut FuncBuilder) -> Vec<u32> {
        let mut s: Vec<u32> = (0..5).map(|_| b.local(WasmType::I32)).collect();
        s.push(b.local(WasmType::F32));
        s.push(b.local(WasmType::V128));
        s
    }

    #[test]
    fn test_disabled_generator_never_emits_lanes() {
        let mut arena = Arena::new();
        let a = mat(&mut arena, 4, 8);
        let bm = mat(&mut arena, 8, 8);
        let dst = mat(&mut arena, 4, 8);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = dot_scratch(&mut b);
        SimdKernels::new(ScalarKernels::new(NumKind::F32), false)
            .dot(&mut b, &a, &bm, &dst, &s[..6])
            .unwrap();
        assert!(!b.body().iter().any(|i| matches!(i, WasmInstr::V128Load(..))));
    }

    #[test]
    fn test_small_operand_delegates_entirely() {
        let mut arena = Arena::new();
        // Two f32 columns: half a lane group.
        let a = mat(&mut arena, 4, 4);
        let bm = mat(&mut arena, 4, 2);
        let dst = mat(&mut arena, 4, 2);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = dot_scratch(&mut b);
        simd_f32().dot(&mut b, &a, &bm, &dst, &s[..6]).unwrap();
        assert!(!b.body().iter().any(|i| matches!(i, WasmInstr::V128Load(..))));
    }

    #[test]
    fn test_binary_emits_lane_loop_and_remainder() {
        let mut arena = Arena::new();
        // 5 elements: one lane group plus one remainder element.
        let a = mat(&mut arena, 5, 1);
        let bm = mat(&mut arena, 5, 1);
        let dst = mat(&mut arena, 5, 1);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = vec![b.local(WasmType::I32)];
        simd_f32()
            .binary(&mut b, BinOp::Add, &a, &bm, &dst, &s)
            .unwrap();

        assert!(b.body().contains(&WasmInstr::F32x4Add));
        assert!(b.body().contains(&WasmInstr::F32Add));
        // Lane loop stops at 16, remainder loop at 20.
        assert!(b.body().contains(&WasmInstr::I32Const(16)));
        assert!(b.body().contains(&WasmInstr::I32Const(20)));
    }

    #[test]
    fn test_exact_multiple_has_no_remainder_loop() {
        let mut arena = Arena::new();
        let a = mat(&mut arena, 4, 1);
        let bm = mat(&mut arena, 4, 1);
        let dst = mat(&mut arena, 4, 1);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = vec![b.local(WasmType::I32)];
        simd_f32()
            .binary(&mut b, BinOp::Mul, &a, &bm, &dst, &s)
            .unwrap();

        assert!(b.body().contains(&WasmInstr::F32x4Mul));
        assert!(!b.body().contains(&WasmInstr::F32Mul));
    }

    #[test]
    fn test_lane_reduce_is_pairwise_left_to_right() {
        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let vacc = b.local(WasmType::V128);
        SimdKernels::push_lane_reduce(&mut b, vacc);

        assert_eq!(
            b.body(),
            &[
                WasmInstr::LocalGet(vacc),
                WasmInstr::F32x4ExtractLane(0),
                WasmInstr::LocalGet(vacc),
                WasmInstr::F32x4ExtractLane(1),
                WasmInstr::F32Add,
                WasmInstr::LocalGet(vacc),
                WasmInstr::F32x4ExtractLane(2),
                WasmInstr::F32Add,
                WasmInstr::LocalGet(vacc),
                WasmInstr::F32x4ExtractLane(3),
                WasmInstr::F32Add,
            ]
        );
    }

    #[test]
    fn test_vector_rhs_dot_uses_mac_sweep() {
        let mut arena = Arena::new();
        let a = mat(&mut arena, 2, 8);
        let v = mat(&mut arena, 8, 1);
        let dst = mat(&mut arena, 2, 1);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = dot_scratch(&mut b);
        simd_f32().dot(&mut b, &a, &v, &dst, &s).unwrap();

        // Lane loads of both operands, no splats.
        assert!(b.body().iter().any(|i| matches!(i, WasmInstr::V128Load(..))));
        assert!(!b.body().contains(&WasmInstr::F32x4Splat));
        assert!(b.body().contains(&WasmInstr::F32x4ExtractLane(3)));
    }

    #[test]
    fn test_general_dot_splats_lhs() {
        let mut arena = Arena::new();
        let a = mat(&mut arena, 2, 3);
        let bm = mat(&mut arena, 3, 8);
        let dst = mat(&mut arena, 2, 8);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = dot_scratch(&mut b);
        simd_f32().dot(&mut b, &a, &bm, &dst, &s).unwrap();

        assert!(b.body().contains(&WasmInstr::F32x4Splat));
        // Column tiling keeps per-cell accumulation scalar-ordered, so
        // no reduction is needed.
        assert!(!b.body().contains(&WasmInstr::F32x4ExtractLane(0)));
    }

    #[test]
    fn test_simd_shape_errors_surface_before_emission() {
        let mut arena = Arena::new();
        let a = mat(&mut arena, 2, 3);
        let bm = mat(&mut arena, 4, 8);
        let dst = mat(&mut arena, 2, 8);

        let mut b = FuncBuilder::new("f", vec![], vec![]);
        let s = dot_scratch(&mut b);
        assert!(simd_f32().dot(&mut b, &a, &bm, &dst, &s).is_err());
        assert!(b.body().is_empty());
    }
}
