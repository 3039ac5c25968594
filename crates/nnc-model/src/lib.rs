//! Model orchestration: compiles a declarative description of a
//! feed-forward network into a self-contained module.
//!
//! A [`Model`] owns an ordered layer sequence, a loss function and the
//! per-mode batch sizes. [`Model::build`] drives the strict pipeline:
//! host imports, built-in routines, layer indexing, memory allocation,
//! static data, per-mode forward functions, the backward function,
//! optional cost/metric functions, the training loop, and finally the
//! export surface.
//!
//! Failures come in two tiers: configuration errors (bad shapes, batch
//! sizes, loss/activation pairings) abort the build before any bytecode
//! is emitted for the offending piece, and internal invariant
//! violations indicate a bug in composing the generators.

#![warn(missing_docs)]

pub mod builtins;
pub mod init;
pub mod layer;
pub mod model;
pub mod options;

pub use builtins::{ActivationKind, LossKind};
pub use init::WeightDistribution;
pub use layer::{Layer, LayerKind};
pub use model::Model;
pub use options::ModelOptions;

use thiserror::Error;

/// Errors raised while assembling a model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Invalid configuration supplied by the caller. Detected before
    /// bytecode is emitted for the offending operation; the build is
    /// abandoned.
    #[error("configuration error: {0}")]
    Config(String),

    /// An internal invariant was violated while composing generators.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// A kernel generator rejected its operands.
    #[error(transparent)]
    Kernel(#[from] nnc_kernels::KernelError),

    /// A memory layout operation failed.
    #[error(transparent)]
    Mem(#[from] nnc_mem::MemError),

    /// Module assembly or serialization failed.
    #[error(transparent)]
    Wasm(#[from] nnc_wasm::WasmError),
}

impl ModelError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type for model assembly.
pub type ModelResult<T> = Result<T, ModelError>;

/// Which buffer variant an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Training pass: gradients, dropout and updates are live.
    Training,
    /// Testing pass over held-out data.
    Testing,
    /// Single-batch inference on host-supplied input.
    Prediction,
}

impl Mode {
    /// All modes, in buffer-layout order.
    pub const ALL: [Mode; 3] = [Mode::Training, Mode::Testing, Mode::Prediction];
}

/// A record with one value per [`Mode`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerMode<T> {
    /// Training value.
    pub training: T,
    /// Testing value.
    pub testing: T,
    /// Prediction value.
    pub prediction: T,
}

impl<T> PerMode<T> {
    /// Select by mode.
    pub fn get(&self, mode: Mode) -> &T {
        match mode {
            Mode::Training => &self.training,
            Mode::Testing => &self.testing,
            Mode::Prediction => &self.prediction,
        }
    }

    /// Build each field from its mode.
    pub fn build(mut f: impl FnMut(Mode) -> T) -> Self {
        Self {
            training: f(Mode::Training),
            testing: f(Mode::Testing),
            prediction: f(Mode::Prediction),
        }
    }

    /// Build each field from its mode, failing fast.
    pub fn try_build<E>(mut f: impl FnMut(Mode) -> Result<T, E>) -> Result<Self, E> {
        Ok(Self {
            training: f(Mode::Training)?,
            testing: f(Mode::Testing)?,
            prediction: f(Mode::Prediction)?,
        })
    }
}

impl<T: Clone> PerMode<T> {
    /// The same value for every mode.
    pub fn uniform(value: T) -> Self {
        Self {
            training: value.clone(),
            testing: value.clone(),
            prediction: value,
        }
    }
}
