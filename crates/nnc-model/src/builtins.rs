//! Host imports and built-in math routines.
//!
//! Generated modules call out to the host for transcendentals, random
//! numbers, timing and logging, and define small f32 routines on top of
//! those for the activation and loss functions the network uses.
//! Import order is fixed so host shims can bind by index as well as by
//! name.

use crate::{ModelError, ModelResult};
use nnc_wasm::{
    FuncBuilder, WasmFuncType, WasmImport, WasmImportKind, WasmInstr, WasmModule, WasmType,
};
use rustc_hash::FxHashMap;

/// Activation function selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    /// Logistic sigmoid.
    Sigmoid,
    /// Rectified linear unit.
    Relu,
    /// Leaky rectified linear unit with a configurable slope.
    LeakyRelu,
    /// Column-wise softmax. Output layers only; has no per-element
    /// routines because it is lowered as a whole-column kernel.
    Softmax,
}

impl ActivationKind {
    /// All kinds, in routine-definition order.
    pub const ALL: [ActivationKind; 4] = [
        ActivationKind::Sigmoid,
        ActivationKind::Relu,
        ActivationKind::LeakyRelu,
        ActivationKind::Softmax,
    ];

    /// Whether the activation is applied one element at a time.
    #[must_use]
    pub fn is_elementwise(self) -> bool {
        !matches!(self, Self::Softmax)
    }
}

/// Loss function selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LossKind {
    /// Half squared error per element.
    MeanSquaredError,
    /// Binary cross-entropy per element.
    CrossEntropy,
}

/// Function indices of the fixed host imports.
#[derive(Clone, Copy, Debug)]
pub struct HostImports {
    /// `Math.exp : f64 -> f64`.
    pub exp: u32,
    /// `Math.log : f64 -> f64`.
    pub log: u32,
    /// `Math.random : () -> f32` in `[0, 1)`.
    pub random: u32,
    /// `System.time : () -> f64` milliseconds.
    pub time: u32,
    /// `System.print_table_f32 : (offset, rows, cols) -> ()`.
    pub print_table: u32,
    /// `Message.log_training_time : (ms) -> ()`.
    pub log_training_time: u32,
    /// `Message.log_training_error : (error, epoch) -> ()`.
    pub log_training_error: u32,
}

impl HostImports {
    /// Declare the host imports on a fresh module.
    ///
    /// Must run before any function is defined so the imports occupy
    /// the first slots of the function index space.
    pub fn declare(module: &mut WasmModule) -> Self {
        let func = |module: &str, name: &str, params: Vec<WasmType>, results: Vec<WasmType>| {
            WasmImport {
                module: module.to_string(),
                name: name.to_string(),
                kind: WasmImportKind::Func(WasmFuncType::new(params, results)),
            }
        };

        use WasmType::{F32, F64, I32};
        Self {
            exp: module.add_import(func("Math", "exp", vec![F64], vec![F64])),
            log: module.add_import(func("Math", "log", vec![F64], vec![F64])),
            random: module.add_import(func("Math", "random", vec![], vec![F32])),
            time: module.add_import(func("System", "time", vec![], vec![F64])),
            print_table: module.add_import(func(
                "System",
                "print_table_f32",
                vec![I32, I32, I32],
                vec![],
            )),
            log_training_time: module.add_import(func(
                "Message",
                "log_training_time",
                vec![F64],
                vec![],
            )),
            log_training_error: module.add_import(func(
                "Message",
                "log_training_error",
                vec![F32, I32],
                vec![],
            )),
        }
    }
}

/// Function indices of an activation's element routines.
#[derive(Clone, Copy, Debug)]
pub struct ActivationRoutines {
    /// `f32 -> f32` forward routine.
    pub primal: u32,
    /// `f32 -> f32` derivative, evaluated at the pre-activation.
    pub derivative: u32,
}

/// Function indices of the loss function's element routines.
#[derive(Clone, Copy, Debug)]
pub struct LossRoutines {
    /// `(target, prediction) -> f32` per-element cost.
    pub cost: u32,
    /// `(target, prediction) -> f32` cost derivative.
    pub loss: u32,
}

/// The defined built-in routines of a module under construction.
#[derive(Debug)]
pub struct Builtins {
    host: HostImports,
    exp32: u32,
    log32: u32,
    activations: FxHashMap<ActivationKind, ActivationRoutines>,
    loss: LossRoutines,
}

impl Builtins {
    /// Define the f32 wrappers, the element routines for every
    /// activation in `used`, and the loss routines.
    ///
    /// Routines are defined in a fixed order so function indices only
    /// depend on which activations the network uses.
    pub fn define(
        module: &mut WasmModule,
        host: HostImports,
        used: &[ActivationKind],
        loss_kind: LossKind,
        leaky_relu_slope: f32,
    ) -> ModelResult<Self> {
        let exp32 = Self::define_unary32(module, "exp32", host.exp);
        let log32 = Self::define_unary32(module, "log32", host.log);

        let mut activations = FxHashMap::default();
        for kind in ActivationKind::ALL {
            if !used.contains(&kind) || !kind.is_elementwise() {
                continue;
            }
            let routines = match kind {
                ActivationKind::Sigmoid => Self::define_sigmoid(module, host.exp),
                ActivationKind::Relu => Self::define_relu(module),
                ActivationKind::LeakyRelu => Self::define_leaky_relu(module, leaky_relu_slope),
                ActivationKind::Softmax => unreachable!("softmax has no element routines"),
            };
            activations.insert(kind, routines);
        }

        let loss = match loss_kind {
            LossKind::MeanSquaredError => Self::define_mse(module),
            LossKind::CrossEntropy => Self::define_cross_entropy(module, log32),
        };

        Ok(Self { host, exp32, log32, activations, loss })
    }

    /// The host import indices.
    #[must_use]
    pub fn host(&self) -> &HostImports {
        &self.host
    }

    /// `f32 -> f32` exponential.
    #[must_use]
    pub fn exp32(&self) -> u32 {
        self.exp32
    }

    /// `f32 -> f32` natural logarithm.
    #[must_use]
    pub fn log32(&self) -> u32 {
        self.log32
    }

    /// Element routines for an activation.
    ///
    /// Fails if the activation was not declared in `used` at
    /// definition time, or has no element form.
    pub fn activation(&self, kind: ActivationKind) -> ModelResult<ActivationRoutines> {
        self.activations.get(&kind).copied().ok_or_else(|| {
            ModelError::internal(format!("no element routines defined for {kind:?}"))
        })
    }

    /// The loss element routines.
    #[must_use]
    pub fn loss(&self) -> LossRoutines {
        self.loss
    }

    /// An f32 shim over a unary f64 host function: promote, call,
    /// demote.
    fn define_unary32(module: &mut WasmModule, name: &str, target: u32) -> u32 {
        let mut b = FuncBuilder::new(name, vec![WasmType::F32], vec![WasmType::F32]);
        b.push(WasmInstr::LocalGet(0));
        b.push(WasmInstr::F64PromoteF32);
        b.push(WasmInstr::Call(target));
        b.push(WasmInstr::F32DemoteF64);
        module.add_function(b.finish())
    }

    fn define_sigmoid(module: &mut WasmModule, exp: u32) -> ActivationRoutines {
        // The core runs in f64: exp overflows f32 for moderately
        // negative pre-activations.
        let mut b = FuncBuilder::new("sigmoid64", vec![WasmType::F64], vec![WasmType::F64]);
        b.push(WasmInstr::F64Const(1.0));
        b.push(WasmInstr::F64Const(1.0));
        b.push(WasmInstr::LocalGet(0));
        b.push(WasmInstr::F64Neg);
        b.push(WasmInstr::Call(exp));
        b.push(WasmInstr::F64Add);
        b.push(WasmInstr::F64Div);
        let sigmoid64 = module.add_function(b.finish());

        let primal = Self::define_unary32(module, "sigmoid", sigmoid64);

        // s * (1 - s) with s = sigmoid(x).
        let mut b = FuncBuilder::new("sigmoid_prime", vec![WasmType::F32], vec![WasmType::F32]);
        let s = b.local(WasmType::F32);
        b.push(WasmInstr::LocalGet(0));
        b.push(WasmInstr::Call(primal));
        b.push(WasmInstr::LocalTee(s));
        b.push(WasmInstr::F32Const(1.0));
        b.push(WasmInstr::LocalGet(s));
        b.push(WasmInstr::F32Sub);
        b.push(WasmInstr::F32Mul);
        let derivative = module.add_function(b.finish());

        ActivationRoutines { primal, derivative }
    }

    fn define_relu(module: &mut WasmModule) -> ActivationRoutines {
        let mut b = FuncBuilder::new("relu", vec![WasmType::F32], vec![WasmType::F32]);
        b.push(WasmInstr::LocalGet(0));
        b.push(WasmInstr::F32Const(0.0));
        b.push(WasmInstr::F32Max);
        let primal = module.add_function(b.finish());

        let mut b = FuncBuilder::new("relu_prime", vec![WasmType::F32], vec![WasmType::F32]);
        b.push(WasmInstr::LocalGet(0));
        b.push(WasmInstr::F32Const(0.0));
        b.push(WasmInstr::F32Gt);
        b.if_else(
            Some(WasmType::F32),
            |b| b.push(WasmInstr::F32Const(1.0)),
            |b| b.push(WasmInstr::F32Const(0.0)),
        );
        let derivative = module.add_function(b.finish());

        ActivationRoutines { primal, derivative }
    }

    fn define_leaky_relu(module: &mut WasmModule, slope: f32) -> ActivationRoutines {
        let mut b = FuncBuilder::new("leaky_relu", vec![WasmType::F32], vec![WasmType::F32]);
        b.push(WasmInstr::LocalGet(0));
        b.push(WasmInstr::F32Const(0.0));
        b.push(WasmInstr::F32Gt);
        b.if_else(
            Some(WasmType::F32),
            |b| b.push(WasmInstr::LocalGet(0)),
            |b| {
                b.push(WasmInstr::F32Const(slope));
                b.push(WasmInstr::LocalGet(0));
                b.push(WasmInstr::F32Mul);
            },
        );
        let primal = module.add_function(b.finish());

        let mut b = FuncBuilder::new("leaky_relu_prime", vec![WasmType::F32], vec![WasmType::F32]);
        b.push(WasmInstr::LocalGet(0));
        b.push(WasmInstr::F32Const(0.0));
        b.push(WasmInstr::F32Gt);
        b.if_else(
            Some(WasmType::F32),
            |b| b.push(WasmInstr::F32Const(1.0)),
            |b| b.push(WasmInstr::F32Const(slope)),
        );
        let derivative = module.add_function(b.finish());

        ActivationRoutines { primal, derivative }
    }

    /// Both loss routines take `(target, prediction)` in that order.
    fn define_mse(module: &mut WasmModule) -> LossRoutines {
        // 0.5 * (prediction - target)^2
        let mut b = FuncBuilder::new(
            "mse_cost",
            vec![WasmType::F32, WasmType::F32],
            vec![WasmType::F32],
        );
        let d = b.local(WasmType::F32);
        b.push(WasmInstr::LocalGet(1));
        b.push(WasmInstr::LocalGet(0));
        b.push(WasmInstr::F32Sub);
        b.push(WasmInstr::LocalTee(d));
        b.push(WasmInstr::LocalGet(d));
        b.push(WasmInstr::F32Mul);
        b.push(WasmInstr::F32Const(0.5));
        b.push(WasmInstr::F32Mul);
        let cost = module.add_function(b.finish());

        // prediction - target
        let mut b = FuncBuilder::new(
            "mse_loss",
            vec![WasmType::F32, WasmType::F32],
            vec![WasmType::F32],
        );
        b.push(WasmInstr::LocalGet(1));
        b.push(WasmInstr::LocalGet(0));
        b.push(WasmInstr::F32Sub);
        let loss = module.add_function(b.finish());

        LossRoutines { cost, loss }
    }

    fn define_cross_entropy(module: &mut WasmModule, log32: u32) -> LossRoutines {
        // -(y*log(p) + (1-y)*log(1-p))
        let mut b = FuncBuilder::new(
            "cross_entropy_cost",
            vec![WasmType::F32, WasmType::F32],
            vec![WasmType::F32],
        );
        b.push(WasmInstr::LocalGet(0));
        b.push(WasmInstr::LocalGet(1));
        b.push(WasmInstr::Call(log32));
        b.push(WasmInstr::F32Mul);
        b.push(WasmInstr::F32Const(1.0));
        b.push(WasmInstr::LocalGet(0));
        b.push(WasmInstr::F32Sub);
        b.push(WasmInstr::F32Const(1.0));
        b.push(WasmInstr::LocalGet(1));
        b.push(WasmInstr::F32Sub);
        b.push(WasmInstr::Call(log32));
        b.push(WasmInstr::F32Mul);
        b.push(WasmInstr::F32Add);
        b.push(WasmInstr::F32Neg);
        let cost = module.add_function(b.finish());

        // (p - y) / (p * (1 - p))
        let mut b = FuncBuilder::new(
            "cross_entropy_loss",
            vec![WasmType::F32, WasmType::F32],
            vec![WasmType::F32],
        );
        b.push(WasmInstr::LocalGet(1));
        b.push(WasmInstr::LocalGet(0));
        b.push(WasmInstr::F32Sub);
        b.push(WasmInstr::LocalGet(1));
        b.push(WasmInstr::F32Const(1.0));
        b.push(WasmInstr::LocalGet(1));
        b.push(WasmInstr::F32Sub);
        b.push(WasmInstr::F32Mul);
        b.push(WasmInstr::F32Div);
        let loss = module.add_function(b.finish());

        LossRoutines { cost, loss }
    }
}
