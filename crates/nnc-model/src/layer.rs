//! Fully-connected layers.
//!
//! A [`Layer`] describes one stage of the network: node count,
//! activation, initializer and dropout keep probability. During the
//! build it acquires [`LayerBuffers`], the arena-allocated activation
//! and gradient matrices, and then emits its slice of the forward and
//! backward passes into the functions under construction.
//!
//! All activation matrices are column-major over the batch: shape
//! `[nodes, batch]`, one column per sample. Input activations are
//! addressed through a runtime base so the same code walks any batch
//! of a dataset laid out in that shape.

use crate::builtins::{ActivationKind, Builtins, LossKind};
use crate::init::WeightDistribution;
use crate::options::ModelOptions;
use crate::{Mode, ModelError, ModelResult, PerMode};
use nnc_kernels::{BinOp, Mat, ScalarSrc, SimdKernels};
use nnc_mem::{Arena, NdArray};
use nnc_wasm::{Bound, FuncBuilder, WasmInstr, WasmType};
use smallvec::SmallVec;

/// Position of a layer in the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    /// First layer; holds input activations only.
    Input,
    /// Interior layer.
    Hidden,
    /// Last layer; its activations are the network output.
    Output,
}

/// The arena-allocated matrices of one layer.
///
/// Weight and gradient buffers exist only on non-input layers, the
/// dropout mask only on hidden layers with a keep probability below
/// one.
#[derive(Debug)]
pub(crate) struct LayerBuffers {
    /// Activations, one per mode.
    pub a: PerMode<NdArray>,
    /// Pre-activations, one per mode (non-input layers).
    pub z: Option<PerMode<NdArray>>,
    /// Pre-activation gradient, training batch shape.
    pub dz: Option<NdArray>,
    /// Activation gradient, training batch shape.
    pub da: Option<NdArray>,
    /// Weights `[nodes, prev_nodes]`.
    pub w: Option<NdArray>,
    /// Weight gradient, same shape as `w`.
    pub dw: Option<NdArray>,
    /// Biases `[nodes, 1]`.
    pub bias: Option<NdArray>,
    /// Bias gradient, same shape as `bias`.
    pub dbias: Option<NdArray>,
    /// Dropout mask, training batch shape.
    pub mask: Option<NdArray>,
}

/// Scratch locals shared by every kernel a generated function calls.
///
/// One set per function: six `i32`, two element-kind, and one `v128`
/// when lane lowering is active. The slice helpers arrange them into
/// each kernel's expected layout.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Scratch {
    i: [u32; 6],
    f: [u32; 2],
    v: Option<u32>,
}

type ScratchVec = SmallVec<[u32; 8]>;

impl Scratch {
    /// Declare the scratch locals on `b`. The `v128` slot is only
    /// declared when `vectorized`, so non-SIMD modules carry no
    /// vector locals.
    pub fn declare(b: &mut FuncBuilder, vectorized: bool) -> Self {
        let mut i = [0u32; 6];
        for slot in &mut i {
            *slot = b.local(WasmType::I32);
        }
        let f = [b.local(WasmType::F32), b.local(WasmType::F32)];
        let v = vectorized.then(|| b.local(WasmType::V128));
        Self { i, f, v }
    }

    fn with_v(&self, base: &[u32]) -> ScratchVec {
        let mut s = ScratchVec::from_slice(base);
        if let Some(v) = self.v {
            s.push(v);
        }
        s
    }

    /// Layout for the dot-product family.
    pub fn dot(&self) -> ScratchVec {
        self.with_v(&[self.i[0], self.i[1], self.i[2], self.i[3], self.i[4], self.f[0]])
    }

    /// Layout for element-wise binary kernels.
    pub fn binary(&self) -> ScratchVec {
        ScratchVec::from_slice(&[self.i[0]])
    }

    /// Layout for scalar multiply.
    pub fn scalar_mul(&self) -> ScratchVec {
        let mut s = ScratchVec::from_slice(&[self.i[0]]);
        if let Some(v) = self.v {
            s.push(v);
        }
        s
    }

    /// Layout for column broadcast.
    pub fn broadcast(&self) -> ScratchVec {
        self.with_v(&[self.i[0], self.i[1], self.i[2], self.f[0]])
    }

    /// Layout for element-wise function application.
    pub fn apply(&self) -> ScratchVec {
        ScratchVec::from_slice(&[self.i[0]])
    }

    /// Layout for column hardmax.
    pub fn hardmax(&self) -> ScratchVec {
        ScratchVec::from_slice(&[self.i[0], self.i[1], self.i[2], self.f[0], self.f[1]])
    }

    /// Layout for column softmax.
    pub fn softmax(&self) -> ScratchVec {
        ScratchVec::from_slice(&[self.i[0], self.i[1], self.f[0]])
    }

    /// Layout for row sum.
    pub fn row_sum(&self) -> ScratchVec {
        self.with_v(&[self.i[0], self.i[1], self.i[2], self.f[0]])
    }

    /// Layout for the absolute-value sum reduction.
    pub fn abs_sum(&self) -> ScratchVec {
        ScratchVec::from_slice(&[self.i[0], self.f[0]])
    }

    /// Layout for the squared sum reduction.
    pub fn square_sum(&self) -> ScratchVec {
        ScratchVec::from_slice(&[self.i[0], self.f[0], self.f[1]])
    }

    /// Layout for the mean reduction.
    pub fn mean(&self) -> ScratchVec {
        ScratchVec::from_slice(&[self.i[0], self.f[0]])
    }

    /// Layout for linear scaled add.
    pub fn scaled_add(&self) -> ScratchVec {
        ScratchVec::from_slice(&[self.i[0]])
    }

    /// Layout for sign-based scaled adds.
    pub fn sign_scaled(&self) -> ScratchVec {
        ScratchVec::from_slice(&[self.i[0], self.f[0]])
    }

    /// Layout for confusion-matrix accumulation.
    pub fn confusion(&self) -> ScratchVec {
        ScratchVec::from_slice(&self.i)
    }

    /// Layout for correct-prediction counting.
    pub fn correct(&self) -> ScratchVec {
        ScratchVec::from_slice(&[self.i[0], self.i[1], self.i[2]])
    }

    /// A spare `i32` for raw loops. Shares a slot with the confusion
    /// layout, which is never live at the same time.
    pub fn free_i32(&self) -> u32 {
        self.i[5]
    }
}

/// Emission context for one generated function.
pub(crate) struct EmitCtx<'a> {
    /// Kernel generators (scalar or lane-lowering).
    pub kernels: SimdKernels,
    /// Defined built-in routines.
    pub builtins: &'a Builtins,
    /// Build options.
    pub options: &'a ModelOptions,
    /// The function's scratch locals.
    pub scratch: Scratch,
}

/// One fully-connected network stage.
#[derive(Debug)]
pub struct Layer {
    kind: LayerKind,
    nodes: usize,
    activation: Option<ActivationKind>,
    distribution: Option<WeightDistribution>,
    keep_prob: f32,
    pub(crate) index: usize,
    pub(crate) buffers: Option<LayerBuffers>,
}

impl Layer {
    /// An input layer of `nodes` features.
    #[must_use]
    pub fn input(nodes: usize) -> Self {
        Self {
            kind: LayerKind::Input,
            nodes,
            activation: None,
            distribution: None,
            keep_prob: 1.0,
            index: 0,
            buffers: None,
        }
    }

    /// A hidden layer.
    #[must_use]
    pub fn hidden(
        nodes: usize,
        activation: ActivationKind,
        distribution: WeightDistribution,
    ) -> Self {
        Self {
            kind: LayerKind::Hidden,
            nodes,
            activation: Some(activation),
            distribution: Some(distribution),
            keep_prob: 1.0,
            index: 0,
            buffers: None,
        }
    }

    /// An output layer.
    #[must_use]
    pub fn output(
        nodes: usize,
        activation: ActivationKind,
        distribution: WeightDistribution,
    ) -> Self {
        Self {
            kind: LayerKind::Output,
            nodes,
            activation: Some(activation),
            distribution: Some(distribution),
            keep_prob: 1.0,
            index: 0,
            buffers: None,
        }
    }

    /// Set the dropout keep probability.
    ///
    /// Only hidden layers may drop nodes, and the probability must be
    /// in `(0, 1]`.
    pub fn keep_prob(mut self, p: f32) -> ModelResult<Self> {
        if self.kind != LayerKind::Hidden {
            return Err(ModelError::config(format!(
                "dropout requires a hidden layer, got {:?}",
                self.kind
            )));
        }
        if !(p > 0.0 && p <= 1.0) {
            return Err(ModelError::config(format!(
                "keep probability {p} outside (0, 1]"
            )));
        }
        self.keep_prob = p;
        Ok(self)
    }

    /// Layer position.
    #[must_use]
    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Node count.
    #[must_use]
    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Activation, absent on the input layer.
    #[must_use]
    pub fn activation(&self) -> Option<ActivationKind> {
        self.activation
    }

    /// Weight initializer, absent on the input layer.
    #[must_use]
    pub fn distribution(&self) -> Option<WeightDistribution> {
        self.distribution
    }

    fn drops_nodes(&self) -> bool {
        self.kind == LayerKind::Hidden && self.keep_prob < 1.0
    }

    pub(crate) fn buffers(&self) -> ModelResult<&LayerBuffers> {
        self.buffers
            .as_ref()
            .ok_or_else(|| ModelError::internal(format!("layer {} not allocated", self.index)))
    }

    fn alloc(arena: &mut Arena, shape: Vec<usize>) -> ModelResult<NdArray> {
        alloc_array(arena, shape)
    }

    /// Allocate this layer's matrices.
    ///
    /// Buffers land in the arena in a fixed order (activations by
    /// mode, then pre-activations, gradients, weights, biases, mask)
    /// so addresses are reproducible for a given network.
    pub(crate) fn allocate(
        &mut self,
        arena: &mut Arena,
        prev_nodes: Option<usize>,
        batch: &PerMode<u32>,
    ) -> ModelResult<()> {
        let nodes = self.nodes;
        let a = PerMode::try_build(|mode| {
            Self::alloc(arena, vec![nodes, *batch.get(mode) as usize])
        })?;

        let mut buffers = LayerBuffers {
            a,
            z: None,
            dz: None,
            da: None,
            w: None,
            dw: None,
            bias: None,
            dbias: None,
            mask: None,
        };

        if self.kind != LayerKind::Input {
            let prev = prev_nodes.ok_or_else(|| {
                ModelError::internal(format!("layer {} has no predecessor", self.index))
            })?;
            let train = *batch.get(Mode::Training) as usize;

            buffers.z = Some(PerMode::try_build(|mode| {
                Self::alloc(arena, vec![nodes, *batch.get(mode) as usize])
            })?);
            buffers.dz = Some(Self::alloc(arena, vec![nodes, train])?);
            buffers.da = Some(Self::alloc(arena, vec![nodes, train])?);
            buffers.w = Some(Self::alloc(arena, vec![nodes, prev])?);
            buffers.dw = Some(Self::alloc(arena, vec![nodes, prev])?);
            buffers.bias = Some(Self::alloc(arena, vec![nodes, 1])?);
            buffers.dbias = Some(Self::alloc(arena, vec![nodes, 1])?);

            if self.drops_nodes() {
                buffers.mask = Some(Self::alloc(arena, vec![nodes, train])?);
            }
        }

        self.buffers = Some(buffers);
        Ok(())
    }

    /// Produce the initial weight and bias bytes as `(offset, data)`
    /// segments.
    ///
    /// Weight and bias streams get distinct per-layer seeds derived
    /// from the model seed and the layer index.
    pub(crate) fn init_segments(
        &self,
        prev_nodes: usize,
        next_nodes: Option<usize>,
        options: &ModelOptions,
    ) -> ModelResult<Vec<(u32, Vec<u8>)>> {
        let dist = self.distribution.ok_or_else(|| {
            ModelError::internal(format!("layer {} has no initializer", self.index))
        })?;
        if self.kind == LayerKind::Output && !dist.valid_for_output() {
            return Err(ModelError::config(format!(
                "{dist:?} reads the next layer's width and cannot initialize an output layer"
            )));
        }

        let buffers = self.buffers()?;
        let w = buffers
            .w
            .as_ref()
            .ok_or_else(|| ModelError::internal("init_segments on input layer"))?;
        let bias = buffers
            .bias
            .as_ref()
            .ok_or_else(|| ModelError::internal("init_segments on input layer"))?;

        let fan_out = next_nodes.unwrap_or(self.nodes);
        let weight_seed = options.seed.wrapping_add(self.index as u64 * 2);
        let bias_seed = weight_seed.wrapping_add(1);

        let weights = dist.generate(self.nodes * prev_nodes, prev_nodes, fan_out, weight_seed)?;
        let biases = dist.generate(self.nodes, prev_nodes, fan_out, bias_seed)?;

        let bytes = |values: Vec<f32>| values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Ok(vec![
            (w.begin(), bytes(weights)),
            (bias.begin(), bytes(biases)),
        ])
    }

    /// The previous layer's activations for `mode`: input activations
    /// are addressed through `input_base`, every other layer's at
    /// their fixed buffer.
    fn prev_activations(prev: &Layer, mode: Mode, input_base: u32) -> ModelResult<Mat> {
        let array = prev.buffers()?.a.get(mode).clone();
        Ok(if prev.kind == LayerKind::Input {
            Mat::relocatable(array, input_base)
        } else {
            Mat::fixed(array)
        })
    }

    /// Emit this layer's slice of the forward pass for `mode`.
    ///
    /// `input_base` is the local holding the batch base address.
    pub(crate) fn emit_forward(
        &self,
        b: &mut FuncBuilder,
        ctx: &EmitCtx<'_>,
        prev: Option<&Layer>,
        mode: Mode,
        input_base: u32,
    ) -> ModelResult<()> {
        if self.kind == LayerKind::Input {
            b.push(WasmInstr::Nop);
            return Ok(());
        }
        let prev = prev
            .ok_or_else(|| ModelError::internal(format!("layer {} has no predecessor", self.index)))?;
        let activation = self
            .activation
            .ok_or_else(|| ModelError::internal(format!("layer {} has no activation", self.index)))?;

        let buffers = self.buffers()?;
        let w = Mat::fixed(require(&buffers.w, "weights")?.clone());
        let bias = Mat::fixed(require(&buffers.bias, "biases")?.clone());
        let z = Mat::fixed(require_mode(&buffers.z, mode, "pre-activations")?);
        let a = Mat::fixed(buffers.a.get(mode).clone());
        let a_prev = Self::prev_activations(prev, mode, input_base)?;

        let k = &ctx.kernels;
        let s = &ctx.scratch;

        // z = w · a_prev + bias
        k.dot(b, &w, &a_prev, &z, &s.dot())?;
        k.broadcast(b, BinOp::Add, &z, &bias, &z, &s.broadcast())?;

        // a = g(z)
        if activation == ActivationKind::Softmax {
            k.column_softmax(b, &z, &a, ctx.builtins.exp32(), &s.softmax())?;
        } else {
            let routines = ctx.builtins.activation(activation)?;
            k.apply(b, &[&z], routines.primal, &a, &s.apply())?;
        }

        // Inverted dropout: mask, zero dropped activations, rescale.
        if mode == Mode::Training && self.drops_nodes() {
            let mask = require(&buffers.mask, "dropout mask")?;
            self.emit_mask_fill(b, ctx, mask)?;
            let mask = Mat::fixed(mask.clone());
            k.binary(b, BinOp::Mul, &a, &mask, &a, &s.binary())?;
            k.scalar_mul(b, &a, ScalarSrc::Const(1.0 / f64::from(self.keep_prob)), &a, &s.scalar_mul())?;
        }
        Ok(())
    }

    /// Draw a fresh Bernoulli mask: each cell is 1 with probability
    /// `keep_prob`, 0 otherwise.
    fn emit_mask_fill(
        &self,
        b: &mut FuncBuilder,
        ctx: &EmitCtx<'_>,
        mask: &NdArray,
    ) -> ModelResult<()> {
        let off = ctx.scratch.free_i32();
        let random = ctx.builtins.host().random;
        let begin = mask.begin();
        let keep = self.keep_prob;

        b.range_loop(off, Bound::Const(0), Bound::Const(mask.bytes()), 4, |b| {
            b.push(WasmInstr::I32Const(begin as i32));
            b.push(WasmInstr::LocalGet(off));
            b.push(WasmInstr::I32Add);
            b.push(WasmInstr::Call(random));
            b.push(WasmInstr::F32Const(keep));
            b.push(WasmInstr::F32Lt);
            b.if_else(
                Some(WasmType::F32),
                |b| b.push(WasmInstr::F32Const(1.0)),
                |b| b.push(WasmInstr::F32Const(0.0)),
            );
            b.push(WasmInstr::F32Store(4, 0));
        });
        Ok(())
    }

    /// Emit this layer's slice of the backward pass (training mode).
    ///
    /// Call order runs from the output layer towards the input, so a
    /// hidden layer's activation gradient is already in place when its
    /// slice runs. `lr_local` holds the learning rate.
    pub(crate) fn emit_backward(
        &self,
        b: &mut FuncBuilder,
        ctx: &EmitCtx<'_>,
        prev: &Layer,
        loss_kind: LossKind,
        input_base: u32,
        target_base: u32,
        lr_local: u32,
    ) -> ModelResult<()> {
        let activation = self
            .activation
            .ok_or_else(|| ModelError::internal(format!("layer {} has no activation", self.index)))?;
        let buffers = self.buffers()?;

        let w = Mat::fixed(require(&buffers.w, "weights")?.clone());
        let dw = Mat::fixed(require(&buffers.dw, "weight gradient")?.clone());
        let bias = Mat::fixed(require(&buffers.bias, "biases")?.clone());
        let dbias = Mat::fixed(require(&buffers.dbias, "bias gradient")?.clone());
        let z = Mat::fixed(require_mode(&buffers.z, Mode::Training, "pre-activations")?);
        let a = Mat::fixed(buffers.a.get(Mode::Training).clone());
        let dz = Mat::fixed(require(&buffers.dz, "pre-activation gradient")?.clone());
        let da = Mat::fixed(require(&buffers.da, "activation gradient")?.clone());
        let a_prev = Self::prev_activations(prev, Mode::Training, input_base)?;

        let k = &ctx.kernels;
        let s = &ctx.scratch;
        let batch = f64::from(*ctx.options.batch_size.get(Mode::Training));

        match self.kind {
            LayerKind::Output => {
                if activation == ActivationKind::Softmax && loss_kind == LossKind::CrossEntropy {
                    // The softmax and cross-entropy derivatives cancel:
                    // dz = a - y.
                    let target = Mat::relocatable(a.array().clone(), target_base);
                    k.binary(b, BinOp::Sub, &a, &target, &dz, &s.binary())?;
                } else {
                    let target = Mat::relocatable(a.array().clone(), target_base);
                    let loss = ctx.builtins.loss();
                    let routines = ctx.builtins.activation(activation)?;
                    k.apply(b, &[&target, &a], loss.loss, &da, &s.apply())?;
                    k.apply(b, &[&z], routines.derivative, &dz, &s.apply())?;
                    k.binary(b, BinOp::Mul, &dz, &da, &dz, &s.binary())?;
                }
            }
            LayerKind::Hidden => {
                // da was written by the layer above.
                let routines = ctx.builtins.activation(activation)?;
                k.apply(b, &[&z], routines.derivative, &dz, &s.apply())?;
                k.binary(b, BinOp::Mul, &dz, &da, &dz, &s.binary())?;
                if self.drops_nodes() {
                    let mask = Mat::fixed(require(&buffers.mask, "dropout mask")?.clone());
                    k.binary(b, BinOp::Mul, &dz, &mask, &dz, &s.binary())?;
                    k.scalar_mul(
                        b,
                        &dz,
                        ScalarSrc::Const(1.0 / f64::from(self.keep_prob)),
                        &dz,
                        &s.scalar_mul(),
                    )?;
                }
            }
            LayerKind::Input => {
                return Err(ModelError::internal("backward pass reached the input layer"))
            }
        }

        // dw = dz · a_prevᵀ, averaged over the batch.
        k.dot_rt(b, &dz, &a_prev, &dw, &s.dot())?;
        k.scalar_mul(b, &dw, ScalarSrc::Const(1.0 / batch), &dw, &s.scalar_mul())?;

        // Regularization penalties fold into the weight gradient.
        match (ctx.options.l1_regularizer, ctx.options.l2_regularizer) {
            (Some(l1), Some(l2)) => k.scaled_sign_add(
                b,
                &dw,
                &w,
                &dw,
                ScalarSrc::Const(f64::from(l2)),
                ScalarSrc::Const(f64::from(l1)),
                &s.sign_scaled(),
            )?,
            (Some(l1), None) => k.sign_scaled_add(
                b,
                &dw,
                &w,
                &dw,
                ScalarSrc::Const(f64::from(l1)),
                &s.sign_scaled(),
            )?,
            (None, Some(l2)) => k.scaled_add(
                b,
                &dw,
                &w,
                &dw,
                ScalarSrc::Const(f64::from(l2)),
                &s.scaled_add(),
            )?,
            (None, None) => {}
        }

        // dbias = row sums of dz, averaged over the batch.
        k.row_sum(b, &dz, &dbias, &s.row_sum())?;
        k.scalar_mul(b, &dbias, ScalarSrc::Const(1.0 / batch), &dbias, &s.scalar_mul())?;

        // Propagate the activation gradient downwards.
        if prev.kind != LayerKind::Input {
            let da_prev = Mat::fixed(require(&prev.buffers()?.da, "activation gradient")?.clone());
            k.dot_lt(b, &w, &dz, &da_prev, &s.dot())?;
        }

        // Descend: w -= lr * dw, bias -= lr * dbias.
        k.scalar_mul(b, &dw, ScalarSrc::Local(lr_local), &dw, &s.scalar_mul())?;
        k.binary(b, BinOp::Sub, &w, &dw, &w, &s.binary())?;
        k.scalar_mul(b, &dbias, ScalarSrc::Local(lr_local), &dbias, &s.scalar_mul())?;
        k.binary(b, BinOp::Sub, &bias, &dbias, &bias, &s.binary())?;
        Ok(())
    }

    /// Emit the mean per-element cost of the training batch, leaving
    /// the value on the stack.
    pub(crate) fn emit_cost(
        &self,
        b: &mut FuncBuilder,
        ctx: &EmitCtx<'_>,
        cost_buf: &NdArray,
        target_base: u32,
    ) -> ModelResult<()> {
        let buffers = self.buffers()?;
        let a = Mat::fixed(buffers.a.get(Mode::Training).clone());
        let target = Mat::relocatable(a.array().clone(), target_base);
        let cost = Mat::fixed(cost_buf.clone());
        let loss = ctx.builtins.loss();

        let s = &ctx.scratch;
        ctx.kernels
            .apply(b, &[&target, &a], loss.cost, &cost, &s.apply())?;
        ctx.kernels.mean(b, &cost, &s.mean())?;
        Ok(())
    }
}

/// Allocate an f32 matrix of `shape` in the arena.
pub(crate) fn alloc_array(arena: &mut Arena, shape: Vec<usize>) -> ModelResult<NdArray> {
    let bytes: usize = shape.iter().product::<usize>() * 4;
    let region = arena.allocate(bytes as u32)?;
    Ok(NdArray::new(region, shape, 4)?)
}

fn require<'a>(buf: &'a Option<NdArray>, what: &str) -> ModelResult<&'a NdArray> {
    buf.as_ref()
        .ok_or_else(|| ModelError::internal(format!("missing buffer: {what}")))
}

fn require_mode(
    buf: &Option<PerMode<NdArray>>,
    mode: Mode,
    what: &str,
) -> ModelResult<NdArray> {
    Ok(buf
        .as_ref()
        .ok_or_else(|| ModelError::internal(format!("missing buffer: {what}")))?
        .get(mode)
        .clone())
}

/// Kernel generators for the configured element kind and lowering.
pub(crate) fn kernels_for(options: &ModelOptions) -> SimdKernels {
    use nnc_kernels::{NumKind, ScalarKernels};
    SimdKernels::new(ScalarKernels::new(NumKind::F32), options.wasm.simd_enabled)
}
