//! # WebAssembly module construction
//!
//! This crate provides the bytecode-emission layer for the network
//! compiler: a typed instruction set, function and module containers,
//! WAT text output, binary (`.wasm`) serialization, and a structured
//! function builder for counted loops.
//!
//! The instruction set is the subset the matrix-kernel generators and
//! built-in routine builders need: i32 addressing arithmetic, f32/f64
//! scalar math, the f32x4 SIMD128 group, and structured control flow.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod module;

pub use builder::{Bound, FuncBuilder};
pub use module::{
    DataSegment, MemoryDesc, WasmExport, WasmExportKind, WasmFunc, WasmFuncType, WasmGlobal,
    WasmImport, WasmImportKind, WasmModule,
};

use thiserror::Error;

/// Errors that can occur while constructing or encoding a module.
#[derive(Debug, Error)]
pub enum WasmError {
    /// The module failed structural verification.
    #[error("invalid module: {0}")]
    InvalidModule(String),

    /// A function body is malformed.
    #[error("invalid function '{name}': {reason}")]
    InvalidFunction {
        /// Function name (or a placeholder for anonymous functions).
        name: String,
        /// What is wrong with the body.
        reason: String,
    },

    /// Internal error.
    #[error("internal wasm error: {0}")]
    Internal(String),
}

/// Result type for module construction.
pub type WasmResult<T> = Result<T, WasmError>;

/// Size of one linear-memory page in bytes.
pub const PAGE_SIZE: u32 = 65536;

/// Configuration for module emission.
#[derive(Clone, Debug)]
pub struct WasmConfig {
    /// Enable SIMD128 instructions.
    pub simd_enabled: bool,
    /// Initial linear memory pages (64KB each).
    pub initial_memory_pages: u32,
    /// Maximum linear memory pages.
    pub max_memory_pages: Option<u32>,
    /// Export linear memory as `"memory"`.
    pub export_memory: bool,
    /// Keep `$name` identifiers in WAT output.
    pub debug_names: bool,
    /// Strip names and comments for minimal output.
    pub optimize_size: bool,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            simd_enabled: true,
            initial_memory_pages: 16,    // 1MB initial
            max_memory_pages: Some(256), // 16MB max
            export_memory: true,
            debug_names: true,
            optimize_size: false,
        }
    }
}

impl WasmConfig {
    /// Config for constrained edge hosts (minimal footprint).
    #[must_use]
    pub fn edge_profile() -> Self {
        Self {
            simd_enabled: true,
            initial_memory_pages: 4,    // 256KB initial
            max_memory_pages: Some(64), // 4MB max
            export_memory: true,
            debug_names: false,
            optimize_size: true,
        }
    }

    /// Config for browser hosts.
    #[must_use]
    pub fn browser_profile() -> Self {
        Self {
            simd_enabled: true,
            initial_memory_pages: 16,
            max_memory_pages: Some(1024), // 64MB max
            export_memory: true,
            debug_names: true,
            optimize_size: false,
        }
    }
}

/// WASM value types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WasmType {
    /// 32-bit integer.
    I32,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 128-bit SIMD vector.
    V128,
}

impl WasmType {
    /// WAT text name.
    #[must_use]
    pub const fn wat_name(self) -> &'static str {
        match self {
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::V128 => "v128",
        }
    }

    /// Size in bytes.
    #[must_use]
    pub const fn size_bytes(self) -> u32 {
        match self {
            Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
            Self::V128 => 16,
        }
    }

    /// Binary encoding of the value type.
    #[must_use]
    pub const fn byte(self) -> u8 {
        match self {
            Self::I32 => 0x7F,
            Self::F32 => 0x7D,
            Self::F64 => 0x7C,
            Self::V128 => 0x7B,
        }
    }
}

/// WASM instructions.
///
/// Memory operations carry `(align, offset)` immediates with alignment
/// in bytes; the binary encoder converts to `log2` form.
#[derive(Clone, Debug, PartialEq)]
pub enum WasmInstr {
    // Control
    /// Unreachable trap.
    Unreachable,
    /// No operation.
    Nop,
    /// Block start.
    Block(Option<WasmType>),
    /// Loop start.
    Loop(Option<WasmType>),
    /// If block.
    If(Option<WasmType>),
    /// Else branch.
    Else,
    /// End of block.
    End,
    /// Branch to label.
    Br(u32),
    /// Conditional branch.
    BrIf(u32),
    /// Return from function.
    Return,
    /// Call function by index.
    Call(u32),

    // Parametric
    /// Drop top of stack.
    Drop,
    /// Select based on condition.
    Select,

    // Variables
    /// Get local variable.
    LocalGet(u32),
    /// Set local variable.
    LocalSet(u32),
    /// Tee local variable.
    LocalTee(u32),
    /// Get global variable.
    GlobalGet(u32),
    /// Set global variable.
    GlobalSet(u32),

    // Memory
    /// Load i32.
    I32Load(u32, u32),
    /// Load f32.
    F32Load(u32, u32),
    /// Load f64.
    F64Load(u32, u32),
    /// Store i32.
    I32Store(u32, u32),
    /// Store f32.
    F32Store(u32, u32),
    /// Store f64.
    F64Store(u32, u32),
    /// Current memory size in pages.
    MemorySize,

    // i32
    /// i32 constant.
    I32Const(i32),
    /// i32 equals zero.
    I32Eqz,
    /// i32 equals.
    I32Eq,
    /// i32 not equals.
    I32Ne,
    /// i32 unsigned less than.
    I32LtU,
    /// i32 signed less than.
    I32LtS,
    /// i32 unsigned greater than.
    I32GtU,
    /// i32 signed greater than.
    I32GtS,
    /// i32 unsigned less or equal.
    I32LeU,
    /// i32 unsigned greater or equal.
    I32GeU,
    /// i32 signed greater or equal.
    I32GeS,
    /// i32 add.
    I32Add,
    /// i32 subtract.
    I32Sub,
    /// i32 multiply.
    I32Mul,
    /// i32 unsigned divide.
    I32DivU,
    /// i32 unsigned remainder.
    I32RemU,
    /// i32 bitwise and.
    I32And,
    /// i32 shift left.
    I32Shl,
    /// i32 unsigned shift right.
    I32ShrU,

    // f32
    /// f32 constant.
    F32Const(f32),
    /// f32 equals.
    F32Eq,
    /// f32 not equals.
    F32Ne,
    /// f32 less than.
    F32Lt,
    /// f32 greater than.
    F32Gt,
    /// f32 less or equal.
    F32Le,
    /// f32 greater or equal.
    F32Ge,
    /// f32 absolute value.
    F32Abs,
    /// f32 negate.
    F32Neg,
    /// f32 square root.
    F32Sqrt,
    /// f32 add.
    F32Add,
    /// f32 subtract.
    F32Sub,
    /// f32 multiply.
    F32Mul,
    /// f32 divide.
    F32Div,
    /// f32 minimum.
    F32Min,
    /// f32 maximum.
    F32Max,
    /// f32 copysign.
    F32Copysign,

    // f64
    /// f64 constant.
    F64Const(f64),
    /// f64 equals.
    F64Eq,
    /// f64 not equals.
    F64Ne,
    /// f64 less than.
    F64Lt,
    /// f64 greater than.
    F64Gt,
    /// f64 less or equal.
    F64Le,
    /// f64 greater or equal.
    F64Ge,
    /// f64 absolute value.
    F64Abs,
    /// f64 negate.
    F64Neg,
    /// f64 square root.
    F64Sqrt,
    /// f64 add.
    F64Add,
    /// f64 subtract.
    F64Sub,
    /// f64 multiply.
    F64Mul,
    /// f64 divide.
    F64Div,
    /// f64 minimum.
    F64Min,
    /// f64 maximum.
    F64Max,
    /// f64 copysign.
    F64Copysign,

    // Conversions
    /// Truncate f32 to signed i32.
    I32TruncF32S,
    /// Convert signed i32 to f32.
    F32ConvertI32S,
    /// Convert unsigned i32 to f32.
    F32ConvertI32U,
    /// Demote f64 to f32.
    F32DemoteF64,
    /// Convert signed i32 to f64.
    F64ConvertI32S,
    /// Convert unsigned i32 to f64.
    F64ConvertI32U,
    /// Promote f32 to f64.
    F64PromoteF32,

    // SIMD (v128 / f32x4)
    /// Load v128.
    V128Load(u32, u32),
    /// Store v128.
    V128Store(u32, u32),
    /// v128 constant (16 bytes, little-endian lanes).
    V128Const([u8; 16]),
    /// i8x16 shuffle.
    I8x16Shuffle([u8; 16]),
    /// f32x4 splat.
    F32x4Splat,
    /// f32x4 extract lane.
    F32x4ExtractLane(u8),
    /// f32x4 replace lane.
    F32x4ReplaceLane(u8),
    /// f32x4 add.
    F32x4Add,
    /// f32x4 subtract.
    F32x4Sub,
    /// f32x4 multiply.
    F32x4Mul,
    /// f32x4 divide.
    F32x4Div,

    /// Comment (WAT output only, never encoded).
    Comment(String),
}

impl WasmInstr {
    /// WAT text rendering of this instruction.
    #[must_use]
    pub fn to_wat(&self) -> String {
        match self {
            Self::Unreachable => "unreachable".to_string(),
            Self::Nop => "nop".to_string(),
            Self::Block(ty) => match ty {
                Some(t) => format!("block (result {})", t.wat_name()),
                None => "block".to_string(),
            },
            Self::Loop(ty) => match ty {
                Some(t) => format!("loop (result {})", t.wat_name()),
                None => "loop".to_string(),
            },
            Self::If(ty) => match ty {
                Some(t) => format!("if (result {})", t.wat_name()),
                None => "if".to_string(),
            },
            Self::Else => "else".to_string(),
            Self::End => "end".to_string(),
            Self::Br(l) => format!("br {l}"),
            Self::BrIf(l) => format!("br_if {l}"),
            Self::Return => "return".to_string(),
            Self::Call(idx) => format!("call {idx}"),

            Self::Drop => "drop".to_string(),
            Self::Select => "select".to_string(),

            Self::LocalGet(idx) => format!("local.get {idx}"),
            Self::LocalSet(idx) => format!("local.set {idx}"),
            Self::LocalTee(idx) => format!("local.tee {idx}"),
            Self::GlobalGet(idx) => format!("global.get {idx}"),
            Self::GlobalSet(idx) => format!("global.set {idx}"),

            Self::I32Load(align, offset) => format!("i32.load offset={offset} align={align}"),
            Self::F32Load(align, offset) => format!("f32.load offset={offset} align={align}"),
            Self::F64Load(align, offset) => format!("f64.load offset={offset} align={align}"),
            Self::I32Store(align, offset) => format!("i32.store offset={offset} align={align}"),
            Self::F32Store(align, offset) => format!("f32.store offset={offset} align={align}"),
            Self::F64Store(align, offset) => format!("f64.store offset={offset} align={align}"),
            Self::MemorySize => "memory.size".to_string(),

            Self::I32Const(v) => format!("i32.const {v}"),
            Self::I32Eqz => "i32.eqz".to_string(),
            Self::I32Eq => "i32.eq".to_string(),
            Self::I32Ne => "i32.ne".to_string(),
            Self::I32LtU => "i32.lt_u".to_string(),
            Self::I32LtS => "i32.lt_s".to_string(),
            Self::I32GtU => "i32.gt_u".to_string(),
            Self::I32GtS => "i32.gt_s".to_string(),
            Self::I32LeU => "i32.le_u".to_string(),
            Self::I32GeU => "i32.ge_u".to_string(),
            Self::I32GeS => "i32.ge_s".to_string(),
            Self::I32Add => "i32.add".to_string(),
            Self::I32Sub => "i32.sub".to_string(),
            Self::I32Mul => "i32.mul".to_string(),
            Self::I32DivU => "i32.div_u".to_string(),
            Self::I32RemU => "i32.rem_u".to_string(),
            Self::I32And => "i32.and".to_string(),
            Self::I32Shl => "i32.shl".to_string(),
            Self::I32ShrU => "i32.shr_u".to_string(),

            Self::F32Const(v) => format!("f32.const {v}"),
            Self::F32Eq => "f32.eq".to_string(),
            Self::F32Ne => "f32.ne".to_string(),
            Self::F32Lt => "f32.lt".to_string(),
            Self::F32Gt => "f32.gt".to_string(),
            Self::F32Le => "f32.le".to_string(),
            Self::F32Ge => "f32.ge".to_string(),
            Self::F32Abs => "f32.abs".to_string(),
            Self::F32Neg => "f32.neg".to_string(),
            Self::F32Sqrt => "f32.sqrt".to_string(),
            Self::F32Add => "f32.add".to_string(),
            Self::F32Sub => "f32.sub".to_string(),
            Self::F32Mul => "f32.mul".to_string(),
            Self::F32Div => "f32.div".to_string(),
            Self::F32Min => "f32.min".to_string(),
            Self::F32Max => "f32.max".to_string(),
            Self::F32Copysign => "f32.copysign".to_string(),

            Self::F64Const(v) => format!("f64.const {v}"),
            Self::F64Eq => "f64.eq".to_string(),
            Self::F64Ne => "f64.ne".to_string(),
            Self::F64Lt => "f64.lt".to_string(),
            Self::F64Gt => "f64.gt".to_string(),
            Self::F64Le => "f64.le".to_string(),
            Self::F64Ge => "f64.ge".to_string(),
            Self::F64Abs => "f64.abs".to_string(),
            Self::F64Neg => "f64.neg".to_string(),
            Self::F64Sqrt => "f64.sqrt".to_string(),
            Self::F64Add => "f64.add".to_string(),
            Self::F64Sub => "f64.sub".to_string(),
            Self::F64Mul => "f64.mul".to_string(),
            Self::F64Div => "f64.div".to_string(),
            Self::F64Min => "f64.min".to_string(),
            Self::F64Max => "f64.max".to_string(),
            Self::F64Copysign => "f64.copysign".to_string(),

            Self::I32TruncF32S => "i32.trunc_f32_s".to_string(),
            Self::F32ConvertI32S => "f32.convert_i32_s".to_string(),
            Self::F32ConvertI32U => "f32.convert_i32_u".to_string(),
            Self::F32DemoteF64 => "f32.demote_f64".to_string(),
            Self::F64ConvertI32S => "f64.convert_i32_s".to_string(),
            Self::F64ConvertI32U => "f64.convert_i32_u".to_string(),
            Self::F64PromoteF32 => "f64.promote_f32".to_string(),

            Self::V128Load(align, offset) => format!("v128.load offset={offset} align={align}"),
            Self::V128Store(align, offset) => format!("v128.store offset={offset} align={align}"),
            Self::V128Const(bytes) => {
                format!(
                    "v128.const i8x16 {}",
                    bytes
                        .iter()
                        .map(|b| b.to_string())
                        .collect::<Vec<_>>()
                        .join(" ")
                )
            }
            Self::I8x16Shuffle(lanes) => {
                format!(
                    "i8x16.shuffle {}",
                    lanes
                        .iter()
                        .map(|l| l.to_string())
                        .collect::<Vec<_>>()
                        .join(" ")
                )
            }
            Self::F32x4Splat => "f32x4.splat".to_string(),
            Self::F32x4ExtractLane(lane) => format!("f32x4.extract_lane {lane}"),
            Self::F32x4ReplaceLane(lane) => format!("f32x4.replace_lane {lane}"),
            Self::F32x4Add => "f32x4.add".to_string(),
            Self::F32x4Sub => "f32x4.sub".to_string(),
            Self::F32x4Mul => "f32x4.mul".to_string(),
            Self::F32x4Div => "f32x4.div".to_string(),

            Self::Comment(text) => format!(";; {text}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wasm_config_default() {
        let config = WasmConfig::default();
        assert!(config.simd_enabled);
        assert_eq!(config.initial_memory_pages, 16);
        assert!(config.export_memory);
    }

    #[test]
    fn test_wasm_config_edge_profile() {
        let config = WasmConfig::edge_profile();
        assert!(config.optimize_size);
        assert!(!config.debug_names);
        assert_eq!(config.initial_memory_pages, 4);
    }

    #[test]
    fn test_wasm_type_wat_name() {
        assert_eq!(WasmType::I32.wat_name(), "i32");
        assert_eq!(WasmType::F32.wat_name(), "f32");
        assert_eq!(WasmType::F64.wat_name(), "f64");
        assert_eq!(WasmType::V128.wat_name(), "v128");
    }

    #[test]
    fn test_wasm_type_sizes() {
        assert_eq!(WasmType::F32.size_bytes(), 4);
        assert_eq!(WasmType::F64.size_bytes(), 8);
        assert_eq!(WasmType::V128.size_bytes(), 16);
    }

    #[test]
    fn test_wasm_instr_to_wat() {
        assert_eq!(WasmInstr::I32Const(42).to_wat(), "i32.const 42");
        assert_eq!(WasmInstr::F32Add.to_wat(), "f32.add");
        assert_eq!(WasmInstr::LocalGet(0).to_wat(), "local.get 0");
        assert_eq!(WasmInstr::F32x4Add.to_wat(), "f32x4.add");
        assert_eq!(
            WasmInstr::F32Load(4, 8).to_wat(),
            "f32.load offset=8 align=4"
        );
    }
}
