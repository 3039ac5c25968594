//! Build-time configuration surface.

use crate::PerMode;
use nnc_wasm::WasmConfig;

/// Configuration for a model build.
///
/// Instrumentation functions (cost, accuracy, confusion matrix,
/// timing) are generated only when their flag is set; the exported
/// surface of the module depends on these flags alone.
#[derive(Clone, Debug)]
pub struct ModelOptions {
    /// Batch size per mode. Training and testing dataset row counts
    /// must be exact multiples of their batch size.
    pub batch_size: PerMode<u32>,
    /// Number of training epochs for the generated `train` function.
    pub epochs: u32,
    /// Learning rate, stored in a dedicated memory cell so the host
    /// can adjust it between runs.
    pub learning_rate: f32,
    /// Log the running mean cost per epoch through the host callback.
    pub log_training_error: bool,
    /// Log wall-clock training time through the host callback.
    pub log_training_time: bool,
    /// Count correct training predictions per batch.
    pub training_accuracy: bool,
    /// Count correct testing predictions per batch.
    pub testing_accuracy: bool,
    /// Accumulate a training confusion matrix.
    pub training_confusion: bool,
    /// Accumulate a testing confusion matrix.
    pub testing_confusion: bool,
    /// Export per-layer weight/bias offset and size accessors.
    pub export_weights: bool,
    /// Slope constant for leaky ReLU activations.
    pub leaky_relu_slope: f32,
    /// L1 regularization factor applied to weight gradients.
    pub l1_regularizer: Option<f32>,
    /// L2 regularization factor applied to weight gradients.
    pub l2_regularizer: Option<f32>,
    /// Seed for the weight/bias initializer streams.
    pub seed: u64,
    /// Bytecode emission settings, including SIMD lowering.
    pub wasm: WasmConfig,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            batch_size: PerMode::uniform(1),
            epochs: 1,
            learning_rate: 0.01,
            log_training_error: false,
            log_training_time: false,
            training_accuracy: false,
            testing_accuracy: false,
            training_confusion: false,
            testing_confusion: false,
            export_weights: false,
            leaky_relu_slope: 0.01,
            l1_regularizer: None,
            l2_regularizer: None,
            seed: 0,
            wasm: WasmConfig::default(),
        }
    }
}
