//! Structured function building.
//!
//! [`FuncBuilder`] owns a function under construction: its signature,
//! locals and body. Kernel generators drive it through [`push`] and the
//! counted-loop helper [`range_loop`], which emits the standard
//! `block(loop(exit-check; body; step; br))` skeleton so that nested
//! loops compose without manual label arithmetic.
//!
//! [`push`]: FuncBuilder::push
//! [`range_loop`]: FuncBuilder::range_loop

use crate::module::{WasmFunc, WasmFuncType};
use crate::{WasmInstr, WasmType};

/// A loop bound: a constant byte offset, or a local plus a constant.
///
/// Bounds are evaluated each iteration, so a `Local` bound tracks the
/// local's current value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bound {
    /// Constant value.
    Const(u32),
    /// Value of a local.
    Local(u32),
    /// Value of a local plus a constant.
    LocalPlus(u32, u32),
}

impl Bound {
    /// Emit instructions leaving the bound's value on the stack.
    fn emit(self, out: &mut Vec<WasmInstr>) {
        match self {
            Bound::Const(v) => out.push(WasmInstr::I32Const(v as i32)),
            Bound::Local(l) => out.push(WasmInstr::LocalGet(l)),
            Bound::LocalPlus(l, v) => {
                out.push(WasmInstr::LocalGet(l));
                if v != 0 {
                    out.push(WasmInstr::I32Const(v as i32));
                    out.push(WasmInstr::I32Add);
                }
            }
        }
    }
}

/// A function under construction.
#[derive(Debug)]
pub struct FuncBuilder {
    name: String,
    ty: WasmFuncType,
    locals: Vec<WasmType>,
    body: Vec<WasmInstr>,
    exported: bool,
    export_name: Option<String>,
}

impl FuncBuilder {
    /// Start a new function.
    #[must_use]
    pub fn new(name: impl Into<String>, params: Vec<WasmType>, results: Vec<WasmType>) -> Self {
        Self {
            name: name.into(),
            ty: WasmFuncType::new(params, results),
            locals: Vec::new(),
            body: Vec::new(),
            exported: false,
            export_name: None,
        }
    }

    /// Mark the function exported under its own name.
    #[must_use]
    pub fn exported(mut self) -> Self {
        self.exported = true;
        self
    }

    /// Mark the function exported under a different name.
    #[must_use]
    pub fn exported_as(mut self, name: impl Into<String>) -> Self {
        self.exported = true;
        self.export_name = Some(name.into());
        self
    }

    /// Allocate a local, returning its index in the local index space
    /// (parameters occupy the first indices).
    pub fn local(&mut self, ty: WasmType) -> u32 {
        let idx = self.ty.params.len() as u32 + self.locals.len() as u32;
        self.locals.push(ty);
        idx
    }

    /// Number of parameters.
    #[must_use]
    pub fn param_count(&self) -> u32 {
        self.ty.params.len() as u32
    }

    /// Append an instruction.
    pub fn push(&mut self, instr: WasmInstr) {
        self.body.push(instr);
    }

    /// Append multiple instructions.
    pub fn extend(&mut self, instrs: impl IntoIterator<Item = WasmInstr>) {
        self.body.extend(instrs);
    }

    /// Instructions emitted so far.
    #[must_use]
    pub fn body(&self) -> &[WasmInstr] {
        &self.body
    }

    /// Emit `local.set idx` of a bound's value.
    pub fn set_local(&mut self, idx: u32, value: Bound) {
        value.emit(&mut self.body);
        self.push(WasmInstr::LocalSet(idx));
    }

    /// Emit a counted loop over `idx` from `start` (inclusive) to `end`
    /// (exclusive) advancing by `step` bytes.
    ///
    /// The loop variable holds the current offset; `body` may read it
    /// with `local.get` but must not write it. `end` is re-evaluated
    /// each iteration with the exit condition `idx >= end` (unsigned).
    pub fn range_loop(
        &mut self,
        idx: u32,
        start: Bound,
        end: Bound,
        step: u32,
        body: impl FnOnce(&mut Self),
    ) {
        self.set_local(idx, start);
        self.push(WasmInstr::Block(None));
        self.push(WasmInstr::Loop(None));

        // Exit check: br out of the block when idx >= end.
        self.push(WasmInstr::LocalGet(idx));
        end.emit(&mut self.body);
        self.push(WasmInstr::I32GeU);
        self.push(WasmInstr::BrIf(1));

        body(self);

        // Step and continue.
        self.push(WasmInstr::LocalGet(idx));
        self.push(WasmInstr::I32Const(step as i32));
        self.push(WasmInstr::I32Add);
        self.push(WasmInstr::LocalSet(idx));
        self.push(WasmInstr::Br(0));

        self.push(WasmInstr::End);
        self.push(WasmInstr::End);
    }

    /// Emit an `if` whose condition is already on the stack.
    pub fn if_then(&mut self, then: impl FnOnce(&mut Self)) {
        self.push(WasmInstr::If(None));
        then(self);
        self.push(WasmInstr::End);
    }

    /// Emit an `if`/`else` whose condition is already on the stack.
    ///
    /// With `result` set, both arms must leave one value of that type.
    pub fn if_else(
        &mut self,
        result: Option<WasmType>,
        then: impl FnOnce(&mut Self),
        otherwise: impl FnOnce(&mut Self),
    ) {
        self.push(WasmInstr::If(result));
        then(self);
        self.push(WasmInstr::Else);
        otherwise(self);
        self.push(WasmInstr::End);
    }

    /// Terminate the body and produce the finished function.
    #[must_use]
    pub fn finish(mut self) -> WasmFunc {
        self.body.push(WasmInstr::End);
        WasmFunc {
            name: Some(self.name),
            ty: self.ty,
            locals: self.locals,
            body: self.body,
            exported: self.exported,
            export_name: self.export_name,
        }
    }
}
