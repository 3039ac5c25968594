//! Model orchestration and the build pipeline.
//!
//! [`Model::build`] runs a strict sequence: validate the network,
//! declare host imports, define built-in routines, allocate every
//! buffer, lay out the datasets, attach static data, and only then
//! emit the forward, backward, training, testing and prediction
//! functions plus the accessor exports. Nothing is emitted for an
//! invalid configuration.

use crate::builtins::{ActivationKind, Builtins, HostImports, LossKind};
use crate::layer::{alloc_array, kernels_for, EmitCtx, Layer, LayerKind, Scratch};
use crate::options::ModelOptions;
use crate::{Mode, ModelError, ModelResult, PerMode};
use nnc_kernels::Mat;
use nnc_mem::{Arena, NdArray, Region};
use nnc_wasm::{Bound, FuncBuilder, MemoryDesc, WasmInstr, WasmModule, WasmType};
use tracing::{debug, info};

/// A dataset as the caller supplies it: one row per sample.
#[derive(Clone, Debug, Default)]
struct Dataset {
    rows: Vec<Vec<f32>>,
    labels: Vec<Vec<f32>>,
}

impl Dataset {
    fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A dataset placed in linear memory: consecutive per-batch blocks,
/// each transposed to `[feature, sample]` so a batch is directly
/// addressable as an activation matrix.
#[derive(Debug)]
struct DatasetLayout {
    data: NdArray,
    labels: NdArray,
    num_batches: u32,
}

impl DatasetLayout {
    /// Byte stride between consecutive input batches.
    fn in_stride(&self) -> u32 {
        self.data.stride(0)
    }

    /// Byte stride between consecutive label batches.
    fn out_stride(&self) -> u32 {
        self.labels.stride(0)
    }
}

/// Per-mode metric buffers: hardmax scratch matrices plus the
/// accumulators the options ask for.
#[derive(Debug)]
struct MetricBuffers {
    pred: NdArray,
    target: NdArray,
    confusion: Option<NdArray>,
    hits: Option<NdArray>,
}

/// A declarative feed-forward network and its build state.
#[derive(Debug)]
pub struct Model {
    name: String,
    options: ModelOptions,
    layers: Vec<Layer>,
    loss: LossKind,
    training: Dataset,
    testing: Dataset,
    built: bool,
}

impl Model {
    /// Create an empty model.
    #[must_use]
    pub fn new(name: impl Into<String>, options: ModelOptions) -> Self {
        Self {
            name: name.into(),
            options,
            layers: Vec::new(),
            loss: LossKind::MeanSquaredError,
            training: Dataset::default(),
            testing: Dataset::default(),
            built: false,
        }
    }

    /// Append a layer. Layers run in insertion order: input first,
    /// output last.
    pub fn add_layer(&mut self, layer: Layer) -> &mut Self {
        self.layers.push(layer);
        self
    }

    /// Select the loss function (mean squared error by default).
    pub fn set_loss(&mut self, loss: LossKind) -> &mut Self {
        self.loss = loss;
        self
    }

    /// Attach the training set: one row per sample, one label row per
    /// sample.
    pub fn set_training_data(&mut self, rows: Vec<Vec<f32>>, labels: Vec<Vec<f32>>) -> &mut Self {
        self.training = Dataset { rows, labels };
        self
    }

    /// Attach the held-out testing set.
    pub fn set_testing_data(&mut self, rows: Vec<Vec<f32>>, labels: Vec<Vec<f32>>) -> &mut Self {
        self.testing = Dataset { rows, labels };
        self
    }

    /// The configured layers.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Compile the network into a module.
    ///
    /// Consumable once: building mutates layer state (buffer
    /// assignments), so a second call is rejected.
    pub fn build(&mut self) -> ModelResult<WasmModule> {
        self.validate()?;
        self.built = true;

        info!(model = %self.name, layers = self.layers.len(), "building network module");

        let mut module = WasmModule::new(&self.name, self.options.wasm.clone());
        let host = HostImports::declare(&mut module);

        let used: Vec<ActivationKind> = self
            .layers
            .iter()
            .filter_map(Layer::activation)
            .collect();
        let builtins = Builtins::define(
            &mut module,
            host,
            &used,
            self.loss,
            self.options.leaky_relu_slope,
        )?;
        debug!(functions = module.func_count(), "defined built-in routines");

        // Buffer allocation, in a fixed order: layers, learning rate,
        // cost, metrics, datasets.
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.index = i;
        }
        let mut arena = Arena::new();
        let batch = self.options.batch_size;
        let mut prev_nodes = None;
        for layer in &mut self.layers {
            layer.allocate(&mut arena, prev_nodes, &batch)?;
            prev_nodes = Some(layer.nodes());
        }

        let lr_cell = arena.allocate(4)?;
        let out_nodes = self.output_layer().nodes();
        let cost_buf = if self.options.log_training_error {
            Some(alloc_array(
                &mut arena,
                vec![out_nodes, batch.training as usize],
            )?)
        } else {
            None
        };
        let train_metrics = self.metric_buffers(&mut arena, Mode::Training)?;
        let test_metrics = self.metric_buffers(&mut arena, Mode::Testing)?;

        let train_set = self.place_dataset(&mut arena, &self.training, batch.training)?;
        let test_set = if self.testing.is_empty() {
            None
        } else {
            Some(self.place_dataset(&mut arena, &self.testing, batch.testing)?)
        };
        debug!(
            bytes = arena.bytes(),
            regions = arena.region_count(),
            "allocated linear memory"
        );

        // Static data: initial weights and biases, the learning rate,
        // and the transposed datasets.
        let layer_count = self.layers.len();
        for i in 1..layer_count {
            let next_nodes = self.layers.get(i + 1).map(Layer::nodes);
            let prev = self.layers[i - 1].nodes();
            for (offset, bytes) in
                self.layers[i].init_segments(prev, next_nodes, &self.options)?
            {
                module.add_data_segment(offset, bytes);
            }
        }
        module.add_data_segment(lr_cell.begin(), self.options.learning_rate.to_le_bytes().into());
        self.add_dataset_segments(&mut module, &self.training, &train_set, batch.training);
        if let Some(layout) = &test_set {
            self.add_dataset_segments(&mut module, &self.testing, layout, batch.testing);
        }

        // Code emission. The training forward pass is the exported
        // `feedforward`; prediction and testing passes stay internal.
        let fwd_train =
            self.build_forward(&mut module, &builtins, Mode::Training, Some("feedforward"))?;
        let fwd_test = if test_set.is_some() {
            Some(self.build_forward(&mut module, &builtins, Mode::Testing, None)?)
        } else {
            None
        };
        let fwd_predict = self.build_forward(&mut module, &builtins, Mode::Prediction, None)?;

        let backward = self.build_backward(&mut module, &builtins, lr_cell)?;
        let cost_fn = match &cost_buf {
            Some(buf) => Some(self.build_cost(&mut module, &builtins, buf)?),
            None => None,
        };
        let train_rec = match &train_metrics {
            Some(m) => Some(self.build_metrics(&mut module, &builtins, Mode::Training, m)?),
            None => None,
        };
        let test_rec = match &test_metrics {
            Some(m) => Some(self.build_metrics(&mut module, &builtins, Mode::Testing, m)?),
            None => None,
        };

        self.build_train(
            &mut module,
            &host,
            &train_set,
            fwd_train,
            backward,
            cost_fn,
            train_rec,
            train_metrics.as_ref(),
        )?;
        if let (Some(layout), Some(fwd)) = (&test_set, fwd_test) {
            self.build_test(&mut module, &host, layout, fwd, test_rec, test_metrics.as_ref())?;
        }
        self.build_predict(&mut module, fwd_predict)?;
        self.build_accessors(&mut module)?;

        // Memory sizing closes the pipeline.
        let needed = arena.pages().max(self.options.wasm.initial_memory_pages);
        if let Some(max) = self.options.wasm.max_memory_pages {
            if needed > max {
                return Err(ModelError::config(format!(
                    "network needs {needed} memory pages ({} bytes) but the module caps at {max}",
                    arena.bytes()
                )));
            }
        }
        module.set_memory(MemoryDesc {
            min: needed,
            max: self.options.wasm.max_memory_pages,
        });

        module.verify()?;
        info!(
            functions = module.func_count(),
            pages = needed,
            "module build complete"
        );
        Ok(module)
    }

    fn output_layer(&self) -> &Layer {
        // Validation guarantees at least two layers.
        &self.layers[self.layers.len() - 1]
    }

    fn input_layer(&self) -> &Layer {
        &self.layers[0]
    }

    fn validate(&self) -> ModelResult<()> {
        if self.built {
            return Err(ModelError::config("model was already built"));
        }
        if self.layers.len() < 2 {
            return Err(ModelError::config(
                "a network needs at least an input and an output layer",
            ));
        }
        for (i, layer) in self.layers.iter().enumerate() {
            let expected = if i == 0 {
                LayerKind::Input
            } else if i == self.layers.len() - 1 {
                LayerKind::Output
            } else {
                LayerKind::Hidden
            };
            if layer.kind() != expected {
                return Err(ModelError::config(format!(
                    "layer {i} must be {expected:?}, got {:?}",
                    layer.kind()
                )));
            }
            if layer.nodes() == 0 {
                return Err(ModelError::config(format!("layer {i} has zero nodes")));
            }
            if layer.activation() == Some(ActivationKind::Softmax) && expected != LayerKind::Output
            {
                return Err(ModelError::config(
                    "softmax activates whole columns and is only valid on the output layer",
                ));
            }
        }
        if self.output_layer().activation() == Some(ActivationKind::Softmax)
            && self.loss != LossKind::CrossEntropy
        {
            return Err(ModelError::config(
                "a softmax output requires the cross-entropy loss",
            ));
        }

        let batch = &self.options.batch_size;
        for (mode, size) in [
            (Mode::Training, batch.training),
            (Mode::Testing, batch.testing),
            (Mode::Prediction, batch.prediction),
        ] {
            if size == 0 {
                return Err(ModelError::config(format!("{mode:?} batch size is zero")));
            }
        }
        if self.options.epochs == 0 {
            return Err(ModelError::config("epoch count is zero"));
        }
        let lr = self.options.learning_rate;
        if !(lr.is_finite() && lr > 0.0) {
            return Err(ModelError::config(format!("learning rate {lr} must be positive")));
        }

        self.check_dataset("training", &self.training, batch.training)?;
        if self.testing.is_empty() {
            if !self.testing.labels.is_empty() {
                return Err(ModelError::config("testing labels supplied without data"));
            }
            if self.options.testing_accuracy || self.options.testing_confusion {
                return Err(ModelError::config(
                    "testing metrics requested without a testing set",
                ));
            }
        } else {
            self.check_dataset("testing", &self.testing, batch.testing)?;
        }
        Ok(())
    }

    fn check_dataset(&self, name: &str, set: &Dataset, batch: u32) -> ModelResult<()> {
        let features = self.input_layer().nodes();
        let classes = self.output_layer().nodes();

        if set.rows.is_empty() {
            return Err(ModelError::config(format!("{name} set is empty")));
        }
        if set.rows.len() != set.labels.len() {
            return Err(ModelError::config(format!(
                "{name} set has {} rows but {} labels",
                set.rows.len(),
                set.labels.len()
            )));
        }
        if set.rows.len() % batch as usize != 0 {
            return Err(ModelError::config(format!(
                "{name} set of {} rows does not divide into batches of {batch}",
                set.rows.len()
            )));
        }
        if let Some(row) = set.rows.iter().find(|r| r.len() != features) {
            return Err(ModelError::config(format!(
                "{name} row has {} features, input layer expects {features}",
                row.len()
            )));
        }
        if let Some(label) = set.labels.iter().find(|l| l.len() != classes) {
            return Err(ModelError::config(format!(
                "{name} label has {} values, output layer expects {classes}",
                label.len()
            )));
        }
        Ok(())
    }

    fn metric_buffers(&self, arena: &mut Arena, mode: Mode) -> ModelResult<Option<MetricBuffers>> {
        let (accuracy, confusion) = match mode {
            Mode::Training => (self.options.training_accuracy, self.options.training_confusion),
            Mode::Testing => (self.options.testing_accuracy, self.options.testing_confusion),
            Mode::Prediction => (false, false),
        };
        if !accuracy && !confusion {
            return Ok(None);
        }

        let classes = self.output_layer().nodes();
        let batch = *self.options.batch_size.get(mode) as usize;
        Ok(Some(MetricBuffers {
            pred: alloc_array(arena, vec![classes, batch])?,
            target: alloc_array(arena, vec![classes, batch])?,
            confusion: confusion
                .then(|| alloc_array(arena, vec![classes, classes]))
                .transpose()?,
            hits: accuracy.then(|| alloc_array(arena, vec![1, 1])).transpose()?,
        }))
    }

    fn place_dataset(
        &self,
        arena: &mut Arena,
        set: &Dataset,
        batch: u32,
    ) -> ModelResult<DatasetLayout> {
        let features = self.input_layer().nodes();
        let classes = self.output_layer().nodes();
        let num_batches = set.rows.len() / batch as usize;

        let data = alloc_array(arena, vec![num_batches, features, batch as usize])?;
        let labels = alloc_array(arena, vec![num_batches, classes, batch as usize])?;
        Ok(DatasetLayout {
            data,
            labels,
            num_batches: num_batches as u32,
        })
    }

    /// Transpose each batch to `[feature, sample]` and attach the
    /// bytes as data segments.
    fn add_dataset_segments(
        &self,
        module: &mut WasmModule,
        set: &Dataset,
        layout: &DatasetLayout,
        batch: u32,
    ) {
        module.add_data_segment(
            layout.data.begin(),
            transpose_batches(&set.rows, batch as usize),
        );
        module.add_data_segment(
            layout.labels.begin(),
            transpose_batches(&set.labels, batch as usize),
        );
    }

    fn emit_ctx<'a>(&'a self, builtins: &'a Builtins, b: &mut FuncBuilder) -> EmitCtx<'a> {
        let kernels = kernels_for(&self.options);
        EmitCtx {
            kernels,
            builtins,
            options: &self.options,
            scratch: Scratch::declare(b, kernels.vectorizes()),
        }
    }

    /// One whole forward pass for `mode`. Parameter 0 is the batch
    /// base address.
    fn build_forward(
        &self,
        module: &mut WasmModule,
        builtins: &Builtins,
        mode: Mode,
        export: Option<&str>,
    ) -> ModelResult<u32> {
        let name = match mode {
            Mode::Training => "forward_training",
            Mode::Testing => "forward_testing",
            Mode::Prediction => "forward_prediction",
        };
        let mut b = FuncBuilder::new(name, vec![WasmType::I32], vec![]);
        if let Some(export) = export {
            b = b.exported_as(export);
        }
        let ctx = self.emit_ctx(builtins, &mut b);

        for (i, layer) in self.layers.iter().enumerate() {
            let prev = i.checked_sub(1).map(|p| &self.layers[p]);
            layer.emit_forward(&mut b, &ctx, prev, mode, 0)?;
        }
        Ok(module.add_function(b.finish()))
    }

    /// The whole backward pass: parameters are the batch base and the
    /// label batch base. Exported as `backpropagation`; the host (and
    /// `train`) must run `feedforward` on the same batch first.
    fn build_backward(
        &self,
        module: &mut WasmModule,
        builtins: &Builtins,
        lr_cell: Region,
    ) -> ModelResult<u32> {
        let mut b = FuncBuilder::new(
            "backward_training",
            vec![WasmType::I32, WasmType::I32],
            vec![],
        )
        .exported_as("backpropagation");
        let lr = b.local(WasmType::F32);
        let ctx = self.emit_ctx(builtins, &mut b);

        b.push(WasmInstr::I32Const(lr_cell.begin() as i32));
        b.push(WasmInstr::F32Load(4, 0));
        b.push(WasmInstr::LocalSet(lr));

        for i in (1..self.layers.len()).rev() {
            self.layers[i].emit_backward(
                &mut b,
                &ctx,
                &self.layers[i - 1],
                self.loss,
                0,
                1,
                lr,
            )?;
        }
        Ok(module.add_function(b.finish()))
    }

    /// Mean cost of the current training batch against the labels at
    /// parameter 0.
    fn build_cost(
        &self,
        module: &mut WasmModule,
        builtins: &Builtins,
        cost_buf: &NdArray,
    ) -> ModelResult<u32> {
        let mut b = FuncBuilder::new("batch_cost", vec![WasmType::I32], vec![WasmType::F32]);
        let ctx = self.emit_ctx(builtins, &mut b);
        self.output_layer().emit_cost(&mut b, &ctx, cost_buf, 0)?;
        Ok(module.add_function(b.finish()))
    }

    /// Hardmax the output and the labels at parameter 0, then fold
    /// them into the enabled accumulators.
    fn build_metrics(
        &self,
        module: &mut WasmModule,
        builtins: &Builtins,
        mode: Mode,
        metrics: &MetricBuffers,
    ) -> ModelResult<u32> {
        let name = match mode {
            Mode::Training => "record_training_metrics",
            Mode::Testing => "record_testing_metrics",
            Mode::Prediction => {
                return Err(ModelError::internal("metrics have no prediction mode"))
            }
        };
        let mut b = FuncBuilder::new(name, vec![WasmType::I32], vec![]);
        let ctx = self.emit_ctx(builtins, &mut b);
        let k = &ctx.kernels;
        let s = &ctx.scratch;

        let out = Mat::fixed(self.output_layer().buffers()?.a.get(mode).clone());
        let target = Mat::relocatable(metrics.target.clone(), 0);
        let pred_hard = Mat::fixed(metrics.pred.clone());
        let targ_hard = Mat::fixed(metrics.target.clone());

        k.column_hardmax(&mut b, &out, &pred_hard, &s.hardmax())?;
        k.column_hardmax(&mut b, &target, &targ_hard, &s.hardmax())?;
        if let Some(conf) = &metrics.confusion {
            let conf = Mat::fixed(conf.clone());
            k.confusion_update(&mut b, &pred_hard, &targ_hard, &conf, &s.confusion())?;
        }
        if let Some(hits) = &metrics.hits {
            let hits = Mat::fixed(hits.clone());
            k.correct_predictions(&mut b, &pred_hard, &targ_hard, &hits, &s.correct())?;
        }
        Ok(module.add_function(b.finish()))
    }

    /// The exported training loop: epochs over all batches, invoking
    /// the forward and backward passes and the optional
    /// instrumentation.
    #[allow(clippy::too_many_arguments)]
    fn build_train(
        &self,
        module: &mut WasmModule,
        host: &HostImports,
        layout: &DatasetLayout,
        fwd: u32,
        backward: u32,
        cost_fn: Option<u32>,
        record: Option<u32>,
        metrics: Option<&MetricBuffers>,
    ) -> ModelResult<()> {
        let mut b = FuncBuilder::new("train", vec![], vec![]).exported();
        let epoch = b.local(WasmType::I32);
        let bi = b.local(WasmType::I32);
        let input_off = b.local(WasmType::I32);
        let target_off = b.local(WasmType::I32);
        let acc = cost_fn.map(|_| b.local(WasmType::F32));
        let t0 = self
            .options
            .log_training_time
            .then(|| b.local(WasmType::F64));

        if let Some(t0) = t0 {
            b.push(WasmInstr::Call(host.time));
            b.push(WasmInstr::LocalSet(t0));
        }

        let in_stride = layout.in_stride();
        let out_stride = layout.out_stride();
        let data_begin = layout.data.begin();
        let labels_begin = layout.labels.begin();
        let num_batches = layout.num_batches;
        let log_error = self.options.log_training_error;

        b.range_loop(epoch, Bound::Const(0), Bound::Const(self.options.epochs), 1, |b| {
            if let Some(acc) = acc {
                b.push(WasmInstr::F32Const(0.0));
                b.push(WasmInstr::LocalSet(acc));
            }
            b.set_local(input_off, Bound::Const(data_begin));
            b.set_local(target_off, Bound::Const(labels_begin));
            b.range_loop(bi, Bound::Const(0), Bound::Const(num_batches), 1, |b| {
                b.push(WasmInstr::LocalGet(input_off));
                b.push(WasmInstr::Call(fwd));
                b.push(WasmInstr::LocalGet(input_off));
                b.push(WasmInstr::LocalGet(target_off));
                b.push(WasmInstr::Call(backward));
                if let (Some(cost_fn), Some(acc)) = (cost_fn, acc) {
                    b.push(WasmInstr::LocalGet(acc));
                    b.push(WasmInstr::LocalGet(target_off));
                    b.push(WasmInstr::Call(cost_fn));
                    b.push(WasmInstr::F32Add);
                    b.push(WasmInstr::LocalSet(acc));
                }
                if let Some(record) = record {
                    b.push(WasmInstr::LocalGet(target_off));
                    b.push(WasmInstr::Call(record));
                }
                b.set_local(input_off, Bound::LocalPlus(input_off, in_stride));
                b.set_local(target_off, Bound::LocalPlus(target_off, out_stride));
            });
            if let Some(acc) = acc {
                if log_error {
                    b.push(WasmInstr::LocalGet(acc));
                    b.push(WasmInstr::F32Const(num_batches as f32));
                    b.push(WasmInstr::F32Div);
                    b.push(WasmInstr::LocalGet(epoch));
                    b.push(WasmInstr::Call(host.log_training_error));
                }
            }
        });

        if let Some(t0) = t0 {
            b.push(WasmInstr::Call(host.time));
            b.push(WasmInstr::LocalGet(t0));
            b.push(WasmInstr::F64Sub);
            b.push(WasmInstr::Call(host.log_training_time));
        }
        if let Some(metrics) = metrics {
            Self::emit_metric_prints(&mut b, host, metrics, self.output_layer().nodes());
        }

        module.add_function(b.finish());
        Ok(())
    }

    /// The exported testing pass over the held-out set.
    fn build_test(
        &self,
        module: &mut WasmModule,
        host: &HostImports,
        layout: &DatasetLayout,
        fwd: u32,
        record: Option<u32>,
        metrics: Option<&MetricBuffers>,
    ) -> ModelResult<()> {
        let mut b = FuncBuilder::new("test", vec![], vec![]).exported();
        let bi = b.local(WasmType::I32);
        let input_off = b.local(WasmType::I32);
        let target_off = b.local(WasmType::I32);

        let in_stride = layout.in_stride();
        let out_stride = layout.out_stride();

        b.set_local(input_off, Bound::Const(layout.data.begin()));
        b.set_local(target_off, Bound::Const(layout.labels.begin()));
        b.range_loop(bi, Bound::Const(0), Bound::Const(layout.num_batches), 1, |b| {
            b.push(WasmInstr::LocalGet(input_off));
            b.push(WasmInstr::Call(fwd));
            if let Some(record) = record {
                b.push(WasmInstr::LocalGet(target_off));
                b.push(WasmInstr::Call(record));
            }
            b.set_local(input_off, Bound::LocalPlus(input_off, in_stride));
            b.set_local(target_off, Bound::LocalPlus(target_off, out_stride));
        });

        if let Some(metrics) = metrics {
            Self::emit_metric_prints(&mut b, host, metrics, self.output_layer().nodes());
        }
        module.add_function(b.finish());
        Ok(())
    }

    fn emit_metric_prints(
        b: &mut FuncBuilder,
        host: &HostImports,
        metrics: &MetricBuffers,
        classes: usize,
    ) {
        if let Some(conf) = &metrics.confusion {
            b.push(WasmInstr::I32Const(conf.begin() as i32));
            b.push(WasmInstr::I32Const(classes as i32));
            b.push(WasmInstr::I32Const(classes as i32));
            b.push(WasmInstr::Call(host.print_table));
        }
        if let Some(hits) = &metrics.hits {
            b.push(WasmInstr::I32Const(hits.begin() as i32));
            b.push(WasmInstr::I32Const(1));
            b.push(WasmInstr::I32Const(1));
            b.push(WasmInstr::Call(host.print_table));
        }
    }

    /// The exported single-batch inference entry: runs the prediction
    /// forward pass over the host-writable input buffer.
    fn build_predict(&self, module: &mut WasmModule, fwd: u32) -> ModelResult<()> {
        let input = self.input_layer().buffers()?.a.get(Mode::Prediction).begin();
        let mut b = FuncBuilder::new("predict", vec![], vec![]).exported();
        b.push(WasmInstr::I32Const(input as i32));
        b.push(WasmInstr::Call(fwd));
        module.add_function(b.finish());
        Ok(())
    }

    /// Constant-returning accessor exports, one per table entry.
    fn build_accessors(&self, module: &mut WasmModule) -> ModelResult<()> {
        let mut table: Vec<(String, u32)> = vec![
            (
                "prediction_data_offset".to_string(),
                self.input_layer().buffers()?.a.get(Mode::Prediction).begin(),
            ),
            (
                "prediction_result_offset".to_string(),
                self.output_layer().buffers()?.a.get(Mode::Prediction).begin(),
            ),
        ];

        if self.options.export_weights {
            for layer in &self.layers[1..] {
                let buffers = layer.buffers()?;
                let w = buffers.w.as_ref().ok_or_else(|| {
                    ModelError::internal(format!("layer {} has no weights", layer.index))
                })?;
                let bias = buffers.bias.as_ref().ok_or_else(|| {
                    ModelError::internal(format!("layer {} has no biases", layer.index))
                })?;
                let i = layer.index;
                table.push((format!("layer{i}_nodes"), layer.nodes() as u32));
                table.push((format!("layer{i}_weights_offset"), w.begin()));
                table.push((format!("layer{i}_weights_byte_size"), w.bytes()));
                table.push((format!("layer{i}_biases_offset"), bias.begin()));
                table.push((format!("layer{i}_biases_byte_size"), bias.bytes()));
            }
        }

        for (name, value) in table {
            let mut b = FuncBuilder::new(name, vec![], vec![WasmType::I32]).exported();
            b.push(WasmInstr::I32Const(value as i32));
            module.add_function(b.finish());
        }
        Ok(())
    }
}

/// Flatten sample rows into consecutive `[width, batch]` blocks:
/// within a batch, all of feature 0 first, then feature 1, and so on.
fn transpose_batches(rows: &[Vec<f32>], batch: usize) -> Vec<u8> {
    let width = rows.first().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(rows.len() * width * 4);
    for block in rows.chunks(batch) {
        for feature in 0..width {
            for row in block {
                out.extend_from_slice(&row[feature].to_le_bytes());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::WeightDistribution;

    fn xor_rows() -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
        (
            vec![
                vec![0.0, 0.0],
                vec![0.0, 1.0],
                vec![1.0, 0.0],
                vec![1.0, 1.0],
            ],
            vec![
                vec![1.0, 0.0],
                vec![0.0, 1.0],
                vec![0.0, 1.0],
                vec![1.0, 0.0],
            ],
        )
    }

    fn xor_model() -> Model {
        let mut model = Model::new("xor", ModelOptions::default());
        let (rows, labels) = xor_rows();
        model
            .add_layer(Layer::input(2))
            .add_layer(Layer::hidden(
                2,
                ActivationKind::Sigmoid,
                WeightDistribution::XavierUniform,
            ))
            .add_layer(Layer::output(
                2,
                ActivationKind::Sigmoid,
                WeightDistribution::LeCunUniform,
            ))
            .set_training_data(rows, labels);
        model
    }

    #[test]
    fn test_transpose_batches_feature_major() {
        let rows = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let bytes = transpose_batches(&rows, 2);
        let values: Vec<f32> = bytes
            .chunks(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        // Feature 0 of both samples, then feature 1 of both.
        assert_eq!(values, vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_transpose_batches_respects_batch_blocks() {
        let rows = vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0], vec![7.0, 8.0]];
        let bytes = transpose_batches(&rows, 2);
        let values: Vec<f32> = bytes
            .chunks(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, vec![1.0, 3.0, 2.0, 4.0, 5.0, 7.0, 6.0, 8.0]);
    }

    #[test]
    fn test_too_few_layers_rejected() {
        let mut model = Model::new("tiny", ModelOptions::default());
        model.add_layer(Layer::input(2));
        assert!(matches!(model.build(), Err(ModelError::Config(_))));
    }

    #[test]
    fn test_layer_order_enforced() {
        let mut model = Model::new("order", ModelOptions::default());
        let (rows, labels) = xor_rows();
        model
            .add_layer(Layer::input(2))
            .add_layer(Layer::output(
                2,
                ActivationKind::Sigmoid,
                WeightDistribution::LeCunUniform,
            ))
            .add_layer(Layer::hidden(
                2,
                ActivationKind::Sigmoid,
                WeightDistribution::XavierUniform,
            ))
            .set_training_data(rows, labels);
        assert!(matches!(model.build(), Err(ModelError::Config(_))));
    }

    #[test]
    fn test_batch_divisibility_enforced() {
        let mut model = xor_model();
        model.options.batch_size = PerMode::uniform(3);
        assert!(matches!(model.build(), Err(ModelError::Config(_))));
    }

    #[test]
    fn test_input_width_enforced() {
        let mut model = xor_model();
        model.training.rows[2] = vec![1.0, 0.0, 0.0];
        assert!(matches!(model.build(), Err(ModelError::Config(_))));
    }

    #[test]
    fn test_softmax_only_on_output() {
        let mut model = Model::new("mix", ModelOptions::default());
        let (rows, labels) = xor_rows();
        model
            .add_layer(Layer::input(2))
            .add_layer(Layer::hidden(
                2,
                ActivationKind::Softmax,
                WeightDistribution::XavierUniform,
            ))
            .add_layer(Layer::output(
                2,
                ActivationKind::Sigmoid,
                WeightDistribution::LeCunUniform,
            ))
            .set_training_data(rows, labels);
        assert!(matches!(model.build(), Err(ModelError::Config(_))));
    }

    #[test]
    fn test_softmax_requires_cross_entropy() {
        let mut model = Model::new("pairing", ModelOptions::default());
        let (rows, labels) = xor_rows();
        model
            .add_layer(Layer::input(2))
            .add_layer(Layer::output(
                2,
                ActivationKind::Softmax,
                WeightDistribution::LeCunUniform,
            ))
            .set_training_data(rows, labels);
        assert!(matches!(model.build(), Err(ModelError::Config(_))));

        model.set_loss(LossKind::CrossEntropy);
        model.build().unwrap();
    }

    #[test]
    fn test_double_build_rejected() {
        let mut model = xor_model();
        model.build().unwrap();
        assert!(matches!(model.build(), Err(ModelError::Config(_))));
    }

    #[test]
    fn test_testing_metrics_require_testing_set() {
        let mut model = xor_model();
        model.options.testing_accuracy = true;
        assert!(matches!(model.build(), Err(ModelError::Config(_))));
    }
}
