//! A small structured-bytecode interpreter for exercising generated
//! kernel bodies against reference computations, without a full
//! runtime. Covers exactly the instruction subset the kernel
//! generators emit.

use nnc_wasm::WasmInstr;

/// A runtime value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Val {
    I32(i32),
    F32(f32),
    V128([f32; 4]),
}

impl Val {
    fn as_i32(self) -> i32 {
        match self {
            Val::I32(v) => v,
            other => panic!("expected i32, got {other:?}"),
        }
    }

    fn as_f32(self) -> f32 {
        match self {
            Val::F32(v) => v,
            other => panic!("expected f32, got {other:?}"),
        }
    }

    fn as_v128(self) -> [f32; 4] {
        match self {
            Val::V128(v) => v,
            other => panic!("expected v128, got {other:?}"),
        }
    }
}

enum Flow {
    Normal,
    Branch(u32),
}

/// Host call handler: pops arguments from and pushes results onto the
/// value stack.
pub type Calls<'a> = dyn FnMut(u32, &mut Vec<Val>) + 'a;

/// Linear memory, locals and a value stack.
pub struct Machine {
    pub mem: Vec<u8>,
    pub locals: Vec<Val>,
    stack: Vec<Val>,
}

impl Machine {
    pub fn new(mem_bytes: usize, locals: Vec<Val>) -> Self {
        Self {
            mem: vec![0; mem_bytes],
            locals,
            stack: Vec::new(),
        }
    }

    /// A machine whose locals are all zeroed i32/f32/v128 as given by
    /// `(i32_count, f32_count, v128_count)` in index order.
    pub fn with_layout(mem_bytes: usize, i32s: usize, f32s: usize, v128s: usize) -> Self {
        let mut locals = vec![Val::I32(0); i32s];
        locals.extend(std::iter::repeat(Val::F32(0.0)).take(f32s));
        locals.extend(std::iter::repeat(Val::V128([0.0; 4])).take(v128s));
        Self::new(mem_bytes, locals)
    }

    pub fn write_f32s(&mut self, addr: u32, vals: &[f32]) {
        for (i, v) in vals.iter().enumerate() {
            let at = addr as usize + i * 4;
            self.mem[at..at + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn read_f32s(&self, addr: u32, count: usize) -> Vec<f32> {
        (0..count).map(|i| self.load_f32(addr + i as u32 * 4)).collect()
    }

    pub fn pop_f32(&mut self) -> f32 {
        self.pop().as_f32()
    }

    fn load_f32(&self, addr: u32) -> f32 {
        let at = addr as usize;
        f32::from_le_bytes([self.mem[at], self.mem[at + 1], self.mem[at + 2], self.mem[at + 3]])
    }

    fn store_f32(&mut self, addr: u32, v: f32) {
        let at = addr as usize;
        self.mem[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

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

    fn cmp_f32(&mut self, f: impl Fn(f32, f32) -> bool) {
        let b = self.pop().as_f32();
        let a = self.pop().as_f32();
        self.push(Val::I32(f(a, b) as i32));
    }

    fn lanes(&mut self, f: impl Fn(f32, f32) -> f32) {
        let b = self.pop().as_v128();
        let a = self.pop().as_v128();
        self.push(Val::V128([f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2]), f(a[3], b[3])]));
    }

    /// Execute `code` to completion.
    pub fn run(&mut self, code: &[WasmInstr], calls: &mut Calls) {
        match self.exec(code, calls) {
            Flow::Normal | Flow::Branch(_) => {}
        }
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

    fn enter(&mut self, body: &[WasmInstr], calls: &mut Calls) -> Flow {
        match self.exec(body, calls) {
            Flow::Branch(0) => Flow::Normal,
            Flow::Branch(d) => Flow::Branch(d - 1),
            Flow::Normal => Flow::Normal,
        }
    }

    fn exec(&mut self, code: &[WasmInstr], calls: &mut Calls) -> Flow {
        use WasmInstr as I;
        let mut pc = 0usize;
        while pc < code.len() {
            match &code[pc] {
                I::Block(_) => {
                    let end = Self::matching_end(code, pc);
                    if let Flow::Branch(d) = self.enter(&code[pc + 1..end], calls) {
                        return Flow::Branch(d);
                    }
                    pc = end;
                }
                I::Loop(_) => {
                    let end = Self::matching_end(code, pc);
                    loop {
                        match self.exec(&code[pc + 1..end], calls) {
                            Flow::Branch(0) => continue,
                            Flow::Branch(d) => return Flow::Branch(d - 1),
                            Flow::Normal => break,
                        }
                    }
                    pc = end;
                }
                I::If(_) => {
                    let end = Self::matching_end(code, pc);
                    let else_at = Self::find_else(code, pc, end);
                    let cond = self.pop().as_i32();
                    let flow = if cond != 0 {
                        let stop = else_at.unwrap_or(end);
                        self.enter(&code[pc + 1..stop], calls)
                    } else if let Some(e) = else_at {
                        self.enter(&code[e + 1..end], calls)
                    } else {
                        Flow::Normal
                    };
                    if let Flow::Branch(d) = flow {
                        return Flow::Branch(d);
                    }
                    pc = end;
                }
                I::Br(d) => return Flow::Branch(*d),
                I::BrIf(d) => {
                    if self.pop().as_i32() != 0 {
                        return Flow::Branch(*d);
                    }
                }
                I::End | I::Nop | I::Comment(_) => {}
                I::Drop => {
                    self.pop();
                }
                I::Call(idx) => calls(*idx, &mut self.stack),

                I::LocalGet(l) => self.push(self.locals[*l as usize]),
                I::LocalSet(l) => {
                    let v = self.pop();
                    self.locals[*l as usize] = v;
                }
                I::LocalTee(l) => {
                    let v = *self.stack.last().unwrap_or_else(|| panic!("stack underflow"));
                    self.locals[*l as usize] = v;
                }

                I::I32Const(v) => self.push(Val::I32(*v)),
                I::I32Add => {
                    let b = self.pop().as_i32();
                    let a = self.pop().as_i32();
                    self.push(Val::I32(a.wrapping_add(b)));
                }
                I::I32Sub => {
                    let b = self.pop().as_i32();
                    let a = self.pop().as_i32();
                    self.push(Val::I32(a.wrapping_sub(b)));
                }
                I::I32Mul => {
                    let b = self.pop().as_i32();
                    let a = self.pop().as_i32();
                    self.push(Val::I32(a.wrapping_mul(b)));
                }
                I::I32Eq => {
                    let b = self.pop().as_i32();
                    let a = self.pop().as_i32();
                    self.push(Val::I32((a == b) as i32));
                }
                I::I32GeU => {
                    let b = self.pop().as_i32() as u32;
                    let a = self.pop().as_i32() as u32;
                    self.push(Val::I32((a >= b) as i32));
                }
                I::I32LtU => {
                    let b = self.pop().as_i32() as u32;
                    let a = self.pop().as_i32() as u32;
                    self.push(Val::I32((a < b) as i32));
                }

                I::F32Const(v) => self.push(Val::F32(*v)),
                I::F32Load(_, off) => {
                    let addr = self.pop().as_i32() as u32 + off;
                    let v = self.load_f32(addr);
                    self.push(Val::F32(v));
                }
                I::F32Store(_, off) => {
                    let v = self.pop().as_f32();
                    let addr = self.pop().as_i32() as u32 + off;
                    self.store_f32(addr, v);
                }
                I::F32Add => self.binop_f32(|a, b| a + b),
                I::F32Sub => self.binop_f32(|a, b| a - b),
                I::F32Mul => self.binop_f32(|a, b| a * b),
                I::F32Div => self.binop_f32(|a, b| a / b),
                I::F32Abs => {
                    let v = self.pop().as_f32();
                    self.push(Val::F32(v.abs()));
                }
                I::F32Eq => self.cmp_f32(|a, b| a == b),
                I::F32Ne => self.cmp_f32(|a, b| a != b),
                I::F32Lt => self.cmp_f32(|a, b| a < b),
                I::F32Gt => self.cmp_f32(|a, b| a > b),
                I::F32Le => self.cmp_f32(|a, b| a <= b),
                I::F32Ge => self.cmp_f32(|a, b| a >= b),
                I::F32ConvertI32U => {
                    let v = self.pop().as_i32() as u32;
                    self.push(Val::F32(v as f32));
                }

                I::V128Const(bytes) => {
                    let mut lanes = [0.0f32; 4];
                    for (i, lane) in lanes.iter_mut().enumerate() {
                        let at = i * 4;
                        *lane = f32::from_le_bytes([
                            bytes[at],
                            bytes[at + 1],
                            bytes[at + 2],
                            bytes[at + 3],
                        ]);
                    }
                    self.push(Val::V128(lanes));
                }
                I::V128Load(_, off) => {
                    let addr = self.pop().as_i32() as u32 + off;
                    let lanes = [
                        self.load_f32(addr),
                        self.load_f32(addr + 4),
                        self.load_f32(addr + 8),
                        self.load_f32(addr + 12),
                    ];
                    self.push(Val::V128(lanes));
                }
                I::V128Store(_, off) => {
                    let lanes = self.pop().as_v128();
                    let addr = self.pop().as_i32() as u32 + off;
                    for (i, lane) in lanes.iter().enumerate() {
                        self.store_f32(addr + i as u32 * 4, *lane);
                    }
                }
                I::F32x4Splat => {
                    let v = self.pop().as_f32();
                    self.push(Val::V128([v; 4]));
                }
                I::F32x4ExtractLane(lane) => {
                    let v = self.pop().as_v128();
                    self.push(Val::F32(v[*lane as usize]));
                }
                I::F32x4Add => self.lanes(|a, b| a + b),
                I::F32x4Sub => self.lanes(|a, b| a - b),
                I::F32x4Mul => self.lanes(|a, b| a * b),

                other => panic!("instruction not handled: {other:?}"),
            }
            pc += 1;
        }
        Flow::Normal
    }
}

/// No host calls expected.
pub fn no_calls() -> Box<dyn FnMut(u32, &mut Vec<Val>)> {
    Box::new(|idx, _| panic!("unexpected call to routine {idx}"))
}
