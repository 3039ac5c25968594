//! A structured-bytecode executor for whole generated modules: linear
//! memory seeded from the data segments, defined-function calls with
//! their own frames, and host imports supplied as a closure. Covers
//! the scalar instruction subset the model emits, which is enough to
//! run the exported entry points end to end.

use nnc_wasm::{
    WasmExportKind, WasmFunc, WasmFuncType, WasmImportKind, WasmInstr, WasmModule, WasmType,
    PAGE_SIZE,
};

/// A runtime value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Val {
    I32(i32),
    F32(f32),
    F64(f64),
}

impl Val {
    pub fn as_i32(self) -> i32 {
        match self {
            Val::I32(v) => v,
            other => panic!("expected i32, got {other:?}"),
        }
    }

    pub fn as_f32(self) -> f32 {
        match self {
            Val::F32(v) => v,
            other => panic!("expected f32, got {other:?}"),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Val::F64(v) => v,
            other => panic!("expected f64, got {other:?}"),
        }
    }

    fn zero(ty: WasmType) -> Self {
        match ty {
            WasmType::I32 => Val::I32(0),
            WasmType::F32 => Val::F32(0.0),
            WasmType::F64 => Val::F64(0.0),
            WasmType::V128 => panic!("executor runs scalar modules only"),
        }
    }
}

enum Flow {
    Normal,
    Branch(u32),
    Return,
}

/// Host import handler: pops arguments from and pushes results onto
/// the given stack, keyed by function index.
pub type Host<'a> = dyn FnMut(u32, &mut Vec<Val>) + 'a;

struct Frame {
    locals: Vec<Val>,
    stack: Vec<Val>,
}

impl Frame {
    fn pop(&mut self) -> Val {
        self.stack.pop().unwrap_or_else(|| panic!("stack underflow"))
    }

    fn push(&mut self, v: Val) {
        self.stack.push(v);
    }

    fn binop_f32(&mut self, f: impl Fn(f32, f32) -> f32) {
        let b = self.pop().as_f32();
        let a = self.pop().as_f32();
        self.push(Val::F32(f(a, b)));
    }

    fn binop_f64(&mut self, f: impl Fn(f64, f64) -> f64) {
        let b = self.pop().as_f64();
        let a = self.pop().as_f64();
        self.push(Val::F64(f(a, b)));
    }

    fn cmp_f32(&mut self, f: impl Fn(f32, f32) -> bool) {
        let b = self.pop().as_f32();
        let a = self.pop().as_f32();
        self.push(Val::I32(f(a, b) as i32));
    }

    fn binop_i32(&mut self, f: impl Fn(i32, i32) -> i32) {
        let b = self.pop().as_i32();
        let a = self.pop().as_i32();
        self.push(Val::I32(f(a, b)));
    }

    fn cmp_u32(&mut self, f: impl Fn(u32, u32) -> bool) {
        let b = self.pop().as_i32() as u32;
        let a = self.pop().as_i32() as u32;
        self.push(Val::I32(f(a, b) as i32));
    }
}

/// An instantiated module: its functions, its memory, its exports.
pub struct Instance {
    funcs: Vec<WasmFunc>,
    import_types: Vec<WasmFuncType>,
    exports: Vec<(String, u32)>,
    pub mem: Vec<u8>,
}

impl Instance {
    /// Instantiate: size memory from the descriptor and apply the data
    /// segments.
    pub fn new(module: &WasmModule) -> Self {
        let mut mem = vec![0u8; module.memory().min as usize * PAGE_SIZE as usize];
        for seg in module.data_segments() {
            let at = seg.offset as usize;
            mem[at..at + seg.bytes.len()].copy_from_slice(&seg.bytes);
        }

        let import_types = module
            .imports()
            .iter()
            .filter_map(|i| match &i.kind {
                WasmImportKind::Func(ty) => Some(ty.clone()),
                _ => None,
            })
            .collect();
        let exports = module
            .exports()
            .iter()
            .filter_map(|e| match e.kind {
                WasmExportKind::Func(idx) => Some((e.name.clone(), idx)),
                _ => None,
            })
            .collect();

        Self {
            funcs: module.functions().to_vec(),
            import_types,
            exports,
            mem,
        }
    }

    /// Call an exported function by name.
    pub fn call(&mut self, name: &str, args: &[Val], host: &mut Host) -> Vec<Val> {
        let idx = self
            .exports
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, idx)| *idx)
            .unwrap_or_else(|| panic!("no function export named {name}"));
        self.invoke(idx, args.to_vec(), host)
    }

    pub fn read_f32s(&self, addr: u32, count: usize) -> Vec<f32> {
        (0..count).map(|i| self.load_f32(addr + i as u32 * 4)).collect()
    }

    pub fn write_f32s(&mut self, addr: u32, vals: &[f32]) {
        for (i, v) in vals.iter().enumerate() {
            let at = addr as usize + i * 4;
            self.mem[at..at + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    fn load_f32(&self, addr: u32) -> f32 {
        let at = addr as usize;
        f32::from_le_bytes([self.mem[at], self.mem[at + 1], self.mem[at + 2], self.mem[at + 3]])
    }

    fn store_f32(&mut self, addr: u32, v: f32) {
        let at = addr as usize;
        self.mem[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn param_count(&self, idx: u32) -> usize {
        let imported = self.import_types.len() as u32;
        if idx < imported {
            self.import_types[idx as usize].params.len()
        } else {
            self.funcs[(idx - imported) as usize].ty.params.len()
        }
    }

    fn invoke(&mut self, idx: u32, args: Vec<Val>, host: &mut Host) -> Vec<Val> {
        let imported = self.import_types.len() as u32;
        if idx < imported {
            let mut stack = args;
            host(idx, &mut stack);
            return stack;
        }

        let func = self.funcs[(idx - imported) as usize].clone();
        let mut locals = args;
        locals.extend(func.locals.iter().map(|ty| Val::zero(*ty)));
        let mut frame = Frame {
            locals,
            stack: Vec::new(),
        };
        self.exec(&func.body, &mut frame, host);
        let results = func.ty.results.len();
        frame.stack.split_off(frame.stack.len() - results)
    }

    fn matching_end(code: &[WasmInstr], open: usize) -> usize {
        let mut depth = 1usize;
        for (i, instr) in code.iter().enumerate().skip(open + 1) {
            match instr {
                WasmInstr::Block(_) | WasmInstr::Loop(_) | WasmInstr::If(_) => depth += 1,
                WasmInstr::End => {
                    depth -= 1;
                    if depth == 0 {
                        return i;
                    }
                }
                _ => {}
            }
        }
        panic!("unbalanced block at {open}");
    }

    fn find_else(code: &[WasmInstr], open: usize, end: usize) -> Option<usize> {
        let mut depth = 1usize;
        for (i, instr) in code.iter().enumerate().take(end).skip(open + 1) {
            match instr {
                WasmInstr::Block(_) | WasmInstr::Loop(_) | WasmInstr::If(_) => depth += 1,
                WasmInstr::End => depth -= 1,
                WasmInstr::Else if depth == 1 => return Some(i),
                _ => {}
            }
        }
        None
    }

    fn enter(&mut self, body: &[WasmInstr], frame: &mut Frame, host: &mut Host) -> Flow {
        match self.exec_flow(body, frame, host) {
            Flow::Branch(0) => Flow::Normal,
            Flow::Branch(d) => Flow::Branch(d - 1),
            other => other,
        }
    }

    fn exec(&mut self, code: &[WasmInstr], frame: &mut Frame, host: &mut Host) {
        match self.exec_flow(code, frame, host) {
            Flow::Normal | Flow::Branch(_) | Flow::Return => {}
        }
    }

    fn exec_flow(&mut self, code: &[WasmInstr], frame: &mut Frame, host: &mut Host) -> Flow {
        use WasmInstr as I;
        let mut pc = 0usize;
        while pc < code.len() {
            match &code[pc] {
                I::Block(_) => {
                    let end = Self::matching_end(code, pc);
                    match self.enter(&code[pc + 1..end], frame, host) {
                        Flow::Normal => {}
                        other => return other,
                    }
                    pc = end;
                }
                I::Loop(_) => {
                    let end = Self::matching_end(code, pc);
                    loop {
                        match self.exec_flow(&code[pc + 1..end], frame, host) {
                            Flow::Branch(0) => continue,
                            Flow::Branch(d) => return Flow::Branch(d - 1),
                            Flow::Return => return Flow::Return,
                            Flow::Normal => break,
                        }
                    }
                    pc = end;
                }
                I::If(_) => {
                    let end = Self::matching_end(code, pc);
                    let else_at = Self::find_else(code, pc, end);
                    let cond = frame.pop().as_i32();
                    let flow = if cond != 0 {
                        let stop = else_at.unwrap_or(end);
                        self.enter(&code[pc + 1..stop], frame, host)
                    } else if let Some(e) = else_at {
                        self.enter(&code[e + 1..end], frame, host)
                    } else {
                        Flow::Normal
                    };
                    match flow {
                        Flow::Normal => {}
                        other => return other,
                    }
                    pc = end;
                }
                I::Br(d) => return Flow::Branch(*d),
                I::BrIf(d) => {
                    if frame.pop().as_i32() != 0 {
                        return Flow::Branch(*d);
                    }
                }
                I::Return => return Flow::Return,
                I::End | I::Nop | I::Comment(_) => {}
                I::Drop => {
                    frame.pop();
                }
                I::Call(idx) => {
                    let n = self.param_count(*idx);
                    let args = frame.stack.split_off(frame.stack.len() - n);
                    let results = self.invoke(*idx, args, host);
                    frame.stack.extend(results);
                }

                I::LocalGet(l) => frame.push(frame.locals[*l as usize]),
                I::LocalSet(l) => {
                    let v = frame.pop();
                    frame.locals[*l as usize] = v;
                }
                I::LocalTee(l) => {
                    let v = *frame
                        .stack
                        .last()
                        .unwrap_or_else(|| panic!("stack underflow"));
                    frame.locals[*l as usize] = v;
                }

                I::I32Const(v) => frame.push(Val::I32(*v)),
                I::I32Add => frame.binop_i32(i32::wrapping_add),
                I::I32Sub => frame.binop_i32(i32::wrapping_sub),
                I::I32Mul => frame.binop_i32(i32::wrapping_mul),
                I::I32Eq => frame.binop_i32(|a, b| (a == b) as i32),
                I::I32GeU => frame.cmp_u32(|a, b| a >= b),
                I::I32LtU => frame.cmp_u32(|a, b| a < b),

                I::F32Const(v) => frame.push(Val::F32(*v)),
                I::F32Load(_, off) => {
                    let addr = frame.pop().as_i32() as u32 + off;
                    let v = self.load_f32(addr);
                    frame.push(Val::F32(v));
                }
                I::F32Store(_, off) => {
                    let v = frame.pop().as_f32();
                    let addr = frame.pop().as_i32() as u32 + off;
                    self.store_f32(addr, v);
                }
                I::F32Add => frame.binop_f32(|a, b| a + b),
                I::F32Sub => frame.binop_f32(|a, b| a - b),
                I::F32Mul => frame.binop_f32(|a, b| a * b),
                I::F32Div => frame.binop_f32(|a, b| a / b),
                I::F32Neg => {
                    let v = frame.pop().as_f32();
                    frame.push(Val::F32(-v));
                }
                I::F32Abs => {
                    let v = frame.pop().as_f32();
                    frame.push(Val::F32(v.abs()));
                }
                I::F32Max => frame.binop_f32(f32::max),
                I::F32Eq => frame.cmp_f32(|a, b| a == b),
                I::F32Ne => frame.cmp_f32(|a, b| a != b),
                I::F32Lt => frame.cmp_f32(|a, b| a < b),
                I::F32Gt => frame.cmp_f32(|a, b| a > b),
                I::F32ConvertI32U => {
                    let v = frame.pop().as_i32() as u32;
                    frame.push(Val::F32(v as f32));
                }

                I::F64Const(v) => frame.push(Val::F64(*v)),
                I::F64Add => frame.binop_f64(|a, b| a + b),
                I::F64Sub => frame.binop_f64(|a, b| a - b),
                I::F64Mul => frame.binop_f64(|a, b| a * b),
                I::F64Div => frame.binop_f64(|a, b| a / b),
                I::F64Neg => {
                    let v = frame.pop().as_f64();
                    frame.push(Val::F64(-v));
                }
                I::F64PromoteF32 => {
                    let v = frame.pop().as_f32();
                    frame.push(Val::F64(f64::from(v)));
                }
                I::F32DemoteF64 => {
                    let v = frame.pop().as_f64();
                    frame.push(Val::F32(v as f32));
                }

                other => panic!("instruction not handled: {other:?}"),
            }
            pc += 1;
        }
        Flow::Normal
    }
}
