//! Module containers and serialization.
//!
//! A [`WasmModule`] accumulates imports, functions, globals, a memory
//! descriptor and data segments, and can render itself as WAT text or
//! encode itself into the binary format.
//!
//! Function index space: imported functions come first, in declaration
//! order, followed by defined functions. [`WasmModule::add_function`]
//! returns the index of the function it just added, which is what
//! `call` instructions reference.

use crate::{WasmConfig, WasmError, WasmInstr, WasmResult, WasmType};

/// A function type signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WasmFuncType {
    /// Parameter types.
    pub params: Vec<WasmType>,
    /// Result types.
    pub results: Vec<WasmType>,
}

impl WasmFuncType {
    /// Create a new function type.
    #[must_use]
    pub fn new(params: Vec<WasmType>, results: Vec<WasmType>) -> Self {
        Self { params, results }
    }

    /// Format as WAT.
    #[must_use]
    pub fn to_wat(&self) -> String {
        let params = if self.params.is_empty() {
            String::new()
        } else {
            format!(
                "(param {})",
                self.params
                    .iter()
                    .map(|t| t.wat_name())
                    .collect::<Vec<_>>()
                    .join(" ")
            )
        };

        let results = if self.results.is_empty() {
            String::new()
        } else {
            format!(
                "(result {})",
                self.results
                    .iter()
                    .map(|t| t.wat_name())
                    .collect::<Vec<_>>()
                    .join(" ")
            )
        };

        format!("(func {params} {results})").trim().to_string()
    }
}

/// An import declaration.
#[derive(Clone, Debug)]
pub struct WasmImport {
    /// Module name (e.g. `"Math"`).
    pub module: String,
    /// Field name (e.g. `"exp"`).
    pub name: String,
    /// Import kind and type.
    pub kind: WasmImportKind,
}

/// Kind of import.
#[derive(Clone, Debug)]
pub enum WasmImportKind {
    /// Function import.
    Func(WasmFuncType),
    /// Memory import (min pages, max pages).
    Memory(u32, Option<u32>),
    /// Global import (type, mutable).
    Global(WasmType, bool),
}

impl WasmImport {
    /// Format as WAT.
    #[must_use]
    pub fn to_wat(&self) -> String {
        let kind_str = match &self.kind {
            WasmImportKind::Func(ty) => format!("(func {})", ty.to_wat()),
            WasmImportKind::Memory(min, max) => match max {
                Some(m) => format!("(memory {min} {m})"),
                None => format!("(memory {min})"),
            },
            WasmImportKind::Global(ty, mutable) => {
                if *mutable {
                    format!("(global (mut {}))", ty.wat_name())
                } else {
                    format!("(global {})", ty.wat_name())
                }
            }
        };

        format!(
            "(import \"{}\" \"{}\" {})",
            self.module, self.name, kind_str
        )
    }
}

/// An export declaration.
#[derive(Clone, Debug)]
pub struct WasmExport {
    /// Export name.
    pub name: String,
    /// Export kind.
    pub kind: WasmExportKind,
}

/// Kind of export.
#[derive(Clone, Debug)]
pub enum WasmExportKind {
    /// Function export (index).
    Func(u32),
    /// Memory export (index).
    Memory(u32),
    /// Global export (index).
    Global(u32),
}

impl WasmExport {
    /// Format as WAT.
    #[must_use]
    pub fn to_wat(&self) -> String {
        let kind_str = match &self.kind {
            WasmExportKind::Func(idx) => format!("(func {idx})"),
            WasmExportKind::Memory(idx) => format!("(memory {idx})"),
            WasmExportKind::Global(idx) => format!("(global {idx})"),
        };

        format!("(export \"{}\" {})", self.name, kind_str)
    }
}

/// A function definition.
#[derive(Clone, Debug)]
pub struct WasmFunc {
    /// Function name (debug only).
    pub name: Option<String>,
    /// Function type.
    pub ty: WasmFuncType,
    /// Local variable types (after parameters).
    pub locals: Vec<WasmType>,
    /// Function body, terminated by `End`.
    pub body: Vec<WasmInstr>,
    /// Whether this function is exported.
    pub exported: bool,
    /// Export name (defaults to the function name).
    pub export_name: Option<String>,
}

impl WasmFunc {
    /// Create a new function with an empty body.
    #[must_use]
    pub fn new(ty: WasmFuncType) -> Self {
        Self {
            name: None,
            ty,
            locals: Vec::new(),
            body: Vec::new(),
            exported: false,
            export_name: None,
        }
    }

    /// Set the debug name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a local variable, returning its index.
    pub fn add_local(&mut self, ty: WasmType) -> u32 {
        let idx = self.ty.params.len() as u32 + self.locals.len() as u32;
        self.locals.push(ty);
        idx
    }

    /// Append an instruction.
    pub fn emit(&mut self, instr: WasmInstr) {
        self.body.push(instr);
    }

    /// Append multiple instructions.
    pub fn emit_all(&mut self, instrs: impl IntoIterator<Item = WasmInstr>) {
        self.body.extend(instrs);
    }

    /// Format as WAT.
    #[must_use]
    pub fn to_wat(&self, idx: u32) -> String {
        let mut result = String::new();

        result.push_str("  (func");
        if let Some(name) = &self.name {
            result.push_str(&format!(" ${name}"));
        } else {
            result.push_str(&format!(" $f{idx}"));
        }

        for (i, ty) in self.ty.params.iter().enumerate() {
            result.push_str(&format!(" (param $p{i} {})", ty.wat_name()));
        }
        for ty in &self.ty.results {
            result.push_str(&format!(" (result {})", ty.wat_name()));
        }
        result.push('\n');

        for (i, ty) in self.locals.iter().enumerate() {
            result.push_str(&format!("    (local $l{i} {})\n", ty.wat_name()));
        }
        for instr in &self.body {
            result.push_str(&format!("    {}\n", instr.to_wat()));
        }

        result.push_str("  )");
        result
    }
}

/// Linear memory descriptor.
#[derive(Clone, Debug)]
pub struct MemoryDesc {
    /// Minimum pages (64KB each).
    pub min: u32,
    /// Maximum pages (optional).
    pub max: Option<u32>,
}

impl Default for MemoryDesc {
    fn default() -> Self {
        Self {
            min: 16,
            max: Some(256),
        }
    }
}

impl MemoryDesc {
    /// Format as WAT.
    #[must_use]
    pub fn to_wat(&self) -> String {
        match self.max {
            Some(max) => format!("(memory {} {})", self.min, max),
            None => format!("(memory {})", self.min),
        }
    }
}

/// A global variable.
#[derive(Clone, Debug)]
pub struct WasmGlobal {
    /// Global name (debug only).
    pub name: Option<String>,
    /// Value type.
    pub ty: WasmType,
    /// Whether mutable.
    pub mutable: bool,
    /// Initializer (a single const instruction).
    pub init: WasmInstr,
}

/// An active data segment placed at a fixed offset in memory 0.
#[derive(Clone, Debug)]
pub struct DataSegment {
    /// Byte offset in linear memory.
    pub offset: u32,
    /// Segment contents.
    pub bytes: Vec<u8>,
}

/// A module under construction.
pub struct WasmModule {
    name: String,
    config: WasmConfig,
    imports: Vec<WasmImport>,
    functions: Vec<WasmFunc>,
    memory: MemoryDesc,
    globals: Vec<WasmGlobal>,
    exports: Vec<WasmExport>,
    data_segments: Vec<DataSegment>,
}

impl WasmModule {
    /// Create a new module.
    #[must_use]
    pub fn new(name: impl Into<String>, config: WasmConfig) -> Self {
        let memory = MemoryDesc {
            min: config.initial_memory_pages,
            max: config.max_memory_pages,
        };

        let mut module = Self {
            name: name.into(),
            config,
            imports: Vec::new(),
            functions: Vec::new(),
            memory,
            globals: Vec::new(),
            exports: Vec::new(),
            data_segments: Vec::new(),
        };

        if module.config.export_memory {
            module.exports.push(WasmExport {
                name: "memory".to_string(),
                kind: WasmExportKind::Memory(0),
            });
        }

        module
    }

    /// Module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Emission configuration.
    #[must_use]
    pub fn config(&self) -> &WasmConfig {
        &self.config
    }

    /// Number of imported functions (these occupy the first indices).
    #[must_use]
    pub fn imported_func_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, WasmImportKind::Func(_)))
            .count() as u32
    }

    /// Number of defined functions.
    #[must_use]
    pub fn func_count(&self) -> usize {
        self.functions.len()
    }

    /// Add an import. For function imports, returns the function index.
    pub fn add_import(&mut self, import: WasmImport) -> u32 {
        let idx = match import.kind {
            WasmImportKind::Func(_) => self.imported_func_count(),
            _ => 0,
        };
        self.imports.push(import);
        idx
    }

    /// Add a function, returning its index in the function index space.
    ///
    /// If the function is marked exported, an export entry is added
    /// under its export name (falling back to its debug name).
    pub fn add_function(&mut self, func: WasmFunc) -> u32 {
        let idx = self.imported_func_count() + self.functions.len() as u32;

        if func.exported {
            let export_name = func
                .export_name
                .clone()
                .or_else(|| func.name.clone())
                .unwrap_or_else(|| format!("f{idx}"));
            self.exports.push(WasmExport {
                name: export_name,
                kind: WasmExportKind::Func(idx),
            });
        }

        self.functions.push(func);
        idx
    }

    /// Add a global variable, returning its index.
    pub fn add_global(&mut self, global: WasmGlobal) -> u32 {
        let idx = self.globals.len() as u32;
        self.globals.push(global);
        idx
    }

    /// Add an active data segment.
    pub fn add_data_segment(&mut self, offset: u32, bytes: Vec<u8>) {
        self.data_segments.push(DataSegment { offset, bytes });
    }

    /// Data segments added so far.
    #[must_use]
    pub fn data_segments(&self) -> &[DataSegment] {
        &self.data_segments
    }

    /// Replace the memory descriptor.
    pub fn set_memory(&mut self, memory: MemoryDesc) {
        self.memory = memory;
    }

    /// Memory descriptor.
    #[must_use]
    pub fn memory(&self) -> &MemoryDesc {
        &self.memory
    }

    /// Exports declared so far.
    #[must_use]
    pub fn exports(&self) -> &[WasmExport] {
        &self.exports
    }

    /// Imports declared so far.
    #[must_use]
    pub fn imports(&self) -> &[WasmImport] {
        &self.imports
    }

    /// Defined functions, in index order after the imports.
    #[must_use]
    pub fn functions(&self) -> &[WasmFunc] {
        &self.functions
    }

    /// Structural verification.
    ///
    /// Checks that every function body is terminated and that memory
    /// bounds are consistent.
    pub fn verify(&self) -> WasmResult<()> {
        for func in &self.functions {
            let name = func.name.clone().unwrap_or_else(|| "anonymous".to_string());
            match func.body.last() {
                Some(WasmInstr::End | WasmInstr::Return) => {}
                Some(_) => {
                    return Err(WasmError::InvalidFunction {
                        name,
                        reason: "body does not end with end or return".to_string(),
                    });
                }
                None => {
                    return Err(WasmError::InvalidFunction {
                        name,
                        reason: "body is empty".to_string(),
                    });
                }
            }

            // Depth includes the implicit function frame; the final End
            // closes it.
            let mut depth: i64 = 1;
            for instr in &func.body {
                match instr {
                    WasmInstr::Block(_) | WasmInstr::Loop(_) | WasmInstr::If(_) => depth += 1,
                    WasmInstr::End => depth -= 1,
                    WasmInstr::Br(l) | WasmInstr::BrIf(l) => {
                        if i64::from(*l) >= depth {
                            return Err(WasmError::InvalidFunction {
                                name,
                                reason: format!("branch depth {l} exceeds nesting"),
                            });
                        }
                    }
                    _ => {}
                }
            }
            let terminated_by_return =
                depth == 1 && matches!(func.body.last(), Some(WasmInstr::Return));
            if depth != 0 && !terminated_by_return {
                return Err(WasmError::InvalidFunction {
                    name,
                    reason: "unbalanced block nesting".to_string(),
                });
            }
        }

        if let Some(max) = self.memory.max {
            if self.memory.min > max {
                return Err(WasmError::InvalidModule(format!(
                    "memory min {} exceeds max {}",
                    self.memory.min, max
                )));
            }
        }

        Ok(())
    }

    /// Render the module as WAT text.
    #[must_use]
    pub fn to_wat(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!("(module ${}\n", self.name));

        for import in &self.imports {
            output.push_str(&format!("  {}\n", import.to_wat()));
        }

        output.push_str(&format!("  {}\n", self.memory.to_wat()));

        for (i, global) in self.globals.iter().enumerate() {
            let name = global
                .name
                .as_ref()
                .map_or_else(|| format!("$g{i}"), |n| format!("${n}"));
            let (open, close) = if global.mutable { ("(mut ", ")") } else { ("", "") };
            output.push_str(&format!(
                "  (global {} {}{}{} ({}))\n",
                name,
                open,
                global.ty.wat_name(),
                close,
                global.init.to_wat()
            ));
        }

        for (i, func) in self.functions.iter().enumerate() {
            output.push_str(&func.to_wat(i as u32));
            output.push('\n');
        }

        for export in &self.exports {
            output.push_str(&format!("  {}\n", export.to_wat()));
        }

        for segment in &self.data_segments {
            output.push_str(&format!("  (data (i32.const {}) \"", segment.offset));
            for byte in &segment.bytes {
                if *byte >= 32 && *byte < 127 && *byte != b'"' && *byte != b'\\' {
                    output.push(*byte as char);
                } else {
                    output.push_str(&format!("\\{byte:02x}"));
                }
            }
            output.push_str("\")\n");
        }

        output.push_str(")\n");
        output
    }

    /// Encode the module into the binary format.
    pub fn to_wasm(&self) -> WasmResult<Vec<u8>> {
        let mut encoder = BinaryEncoder::new();
        encoder.encode_module(self)?;
        Ok(encoder.finish())
    }
}

/// Binary encoder for the module format.
struct BinaryEncoder {
    output: Vec<u8>,
}

impl BinaryEncoder {
    fn new() -> Self {
        Self { output: Vec::new() }
    }

    fn finish(self) -> Vec<u8> {
        self.output
    }

    fn encode_module(&mut self, module: &WasmModule) -> WasmResult<()> {
        self.output.extend_from_slice(b"\x00asm");
        self.output.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);

        let type_table = Self::collect_type_table(module);

        self.encode_type_section(&type_table);
        self.encode_import_section(module, &type_table);
        self.encode_function_section(module, &type_table);
        self.encode_memory_section(module);
        self.encode_global_section(module)?;
        self.encode_export_section(module);
        self.encode_code_section(module)?;
        self.encode_data_section(module);

        Ok(())
    }

    /// All unique function types: imports first, then defined functions.
    fn collect_type_table(module: &WasmModule) -> Vec<WasmFuncType> {
        let mut types: Vec<WasmFuncType> = Vec::new();
        for import in &module.imports {
            if let WasmImportKind::Func(ty) = &import.kind {
                if !types.contains(ty) {
                    types.push(ty.clone());
                }
            }
        }
        for func in &module.functions {
            if !types.contains(&func.ty) {
                types.push(func.ty.clone());
            }
        }
        types
    }

    fn find_type_index(type_table: &[WasmFuncType], ty: &WasmFuncType) -> u32 {
        type_table.iter().position(|t| t == ty).unwrap_or(0) as u32
    }

    fn encode_uleb128(&mut self, mut value: u32) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.output.push(byte);
                break;
            }
            self.output.push(byte | 0x80);
        }
    }

    fn encode_sleb128(&mut self, mut value: i32) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                self.output.push(byte);
                break;
            }
            self.output.push(byte | 0x80);
        }
    }

    fn encode_string(&mut self, s: &str) {
        self.encode_uleb128(s.len() as u32);
        self.output.extend_from_slice(s.as_bytes());
    }

    /// Alignment immediate is log2 of the byte alignment.
    fn encode_memarg(&mut self, byte_align: u32, offset: u32) {
        let log2_align = if byte_align == 0 {
            0
        } else {
            byte_align.trailing_zeros()
        };
        self.encode_uleb128(log2_align);
        self.encode_uleb128(offset);
    }

    fn encode_section(&mut self, section_id: u8, content: Vec<u8>) {
        self.output.push(section_id);
        self.encode_uleb128(content.len() as u32);
        self.output.extend(content);
    }

    fn encode_type_section(&mut self, type_table: &[WasmFuncType]) {
        if type_table.is_empty() {
            return;
        }

        let mut encoder = BinaryEncoder::new();
        encoder.encode_uleb128(type_table.len() as u32);
        for ty in type_table {
            encoder.output.push(0x60); // func type
            encoder.encode_uleb128(ty.params.len() as u32);
            for param in &ty.params {
                encoder.output.push(param.byte());
            }
            encoder.encode_uleb128(ty.results.len() as u32);
            for result in &ty.results {
                encoder.output.push(result.byte());
            }
        }

        self.encode_section(0x01, encoder.output);
    }

    fn encode_import_section(&mut self, module: &WasmModule, type_table: &[WasmFuncType]) {
        if module.imports.is_empty() {
            return;
        }

        let mut encoder = BinaryEncoder::new();
        encoder.encode_uleb128(module.imports.len() as u32);
        for import in &module.imports {
            encoder.encode_string(&import.module);
            encoder.encode_string(&import.name);

            match &import.kind {
                WasmImportKind::Func(ty) => {
                    encoder.output.push(0x00);
                    encoder.encode_uleb128(Self::find_type_index(type_table, ty));
                }
                WasmImportKind::Memory(min, max) => {
                    encoder.output.push(0x02);
                    if let Some(m) = max {
                        encoder.output.push(0x01);
                        encoder.encode_uleb128(*min);
                        encoder.encode_uleb128(*m);
                    } else {
                        encoder.output.push(0x00);
                        encoder.encode_uleb128(*min);
                    }
                }
                WasmImportKind::Global(ty, mutable) => {
                    encoder.output.push(0x03);
                    encoder.output.push(ty.byte());
                    encoder.output.push(u8::from(*mutable));
                }
            }
        }

        self.encode_section(0x02, encoder.output);
    }

    fn encode_function_section(&mut self, module: &WasmModule, type_table: &[WasmFuncType]) {
        if module.functions.is_empty() {
            return;
        }

        let mut encoder = BinaryEncoder::new();
        encoder.encode_uleb128(module.functions.len() as u32);
        for func in &module.functions {
            encoder.encode_uleb128(Self::find_type_index(type_table, &func.ty));
        }

        self.encode_section(0x03, encoder.output);
    }

    fn encode_memory_section(&mut self, module: &WasmModule) {
        let mut encoder = BinaryEncoder::new();
        encoder.encode_uleb128(1);
        if let Some(max) = module.memory.max {
            encoder.output.push(0x01);
            encoder.encode_uleb128(module.memory.min);
            encoder.encode_uleb128(max);
        } else {
            encoder.output.push(0x00);
            encoder.encode_uleb128(module.memory.min);
        }

        self.encode_section(0x05, encoder.output);
    }

    fn encode_global_section(&mut self, module: &WasmModule) -> WasmResult<()> {
        if module.globals.is_empty() {
            return Ok(());
        }

        let mut encoder = BinaryEncoder::new();
        encoder.encode_uleb128(module.globals.len() as u32);
        for global in &module.globals {
            encoder.output.push(global.ty.byte());
            encoder.output.push(u8::from(global.mutable));
            encoder.encode_instr(&global.init)?;
            encoder.output.push(0x0B); // end
        }

        self.encode_section(0x06, encoder.output);
        Ok(())
    }

    fn encode_export_section(&mut self, module: &WasmModule) {
        if module.exports.is_empty() {
            return;
        }

        let mut encoder = BinaryEncoder::new();
        encoder.encode_uleb128(module.exports.len() as u32);
        for export in &module.exports {
            encoder.encode_string(&export.name);
            match &export.kind {
                WasmExportKind::Func(idx) => {
                    encoder.output.push(0x00);
                    encoder.encode_uleb128(*idx);
                }
                WasmExportKind::Memory(idx) => {
                    encoder.output.push(0x02);
                    encoder.encode_uleb128(*idx);
                }
                WasmExportKind::Global(idx) => {
                    encoder.output.push(0x03);
                    encoder.encode_uleb128(*idx);
                }
            }
        }

        self.encode_section(0x07, encoder.output);
    }

    fn encode_code_section(&mut self, module: &WasmModule) -> WasmResult<()> {
        if module.functions.is_empty() {
            return Ok(());
        }

        let mut encoder = BinaryEncoder::new();
        encoder.encode_uleb128(module.functions.len() as u32);
        for func in &module.functions {
            let mut func_encoder = BinaryEncoder::new();

            func_encoder.encode_uleb128(func.locals.len() as u32);
            for local in &func.locals {
                func_encoder.encode_uleb128(1); // run length
                func_encoder.output.push(local.byte());
            }
            for instr in &func.body {
                func_encoder.encode_instr(instr)?;
            }

            let func_body = func_encoder.output;
            encoder.encode_uleb128(func_body.len() as u32);
            encoder.output.extend(func_body);
        }

        self.encode_section(0x0A, encoder.output);
        Ok(())
    }

    fn encode_data_section(&mut self, module: &WasmModule) {
        if module.data_segments.is_empty() {
            return;
        }

        let mut encoder = BinaryEncoder::new();
        encoder.encode_uleb128(module.data_segments.len() as u32);
        for segment in &module.data_segments {
            encoder.output.push(0x00); // active segment, memory 0
            encoder.output.push(0x41); // i32.const
            encoder.encode_sleb128(segment.offset as i32);
            encoder.output.push(0x0B); // end
            encoder.encode_uleb128(segment.bytes.len() as u32);
            encoder.output.extend_from_slice(&segment.bytes);
        }

        self.encode_section(0x0B, encoder.output);
    }

    fn encode_block_type(&mut self, ty: Option<WasmType>) {
        match ty {
            None => self.output.push(0x40),
            Some(t) => self.output.push(t.byte()),
        }
    }

    fn simd(&mut self, sub_opcode: u32) {
        self.output.push(0xFD);
        self.encode_uleb128(sub_opcode);
    }

    fn encode_instr(&mut self, instr: &WasmInstr) -> WasmResult<()> {
        match instr {
            WasmInstr::Unreachable => self.output.push(0x00),
            WasmInstr::Nop => self.output.push(0x01),
            WasmInstr::Block(ty) => {
                self.output.push(0x02);
                self.encode_block_type(*ty);
            }
            WasmInstr::Loop(ty) => {
                self.output.push(0x03);
                self.encode_block_type(*ty);
            }
            WasmInstr::If(ty) => {
                self.output.push(0x04);
                self.encode_block_type(*ty);
            }
            WasmInstr::Else => self.output.push(0x05),
            WasmInstr::End => self.output.push(0x0B),
            WasmInstr::Br(l) => {
                self.output.push(0x0C);
                self.encode_uleb128(*l);
            }
            WasmInstr::BrIf(l) => {
                self.output.push(0x0D);
                self.encode_uleb128(*l);
            }
            WasmInstr::Return => self.output.push(0x0F),
            WasmInstr::Call(idx) => {
                self.output.push(0x10);
                self.encode_uleb128(*idx);
            }

            WasmInstr::Drop => self.output.push(0x1A),
            WasmInstr::Select => self.output.push(0x1B),

            WasmInstr::LocalGet(idx) => {
                self.output.push(0x20);
                self.encode_uleb128(*idx);
            }
            WasmInstr::LocalSet(idx) => {
                self.output.push(0x21);
                self.encode_uleb128(*idx);
            }
            WasmInstr::LocalTee(idx) => {
                self.output.push(0x22);
                self.encode_uleb128(*idx);
            }
            WasmInstr::GlobalGet(idx) => {
                self.output.push(0x23);
                self.encode_uleb128(*idx);
            }
            WasmInstr::GlobalSet(idx) => {
                self.output.push(0x24);
                self.encode_uleb128(*idx);
            }

            WasmInstr::I32Load(align, offset) => {
                self.output.push(0x28);
                self.encode_memarg(*align, *offset);
            }
            WasmInstr::F32Load(align, offset) => {
                self.output.push(0x2A);
                self.encode_memarg(*align, *offset);
            }
            WasmInstr::F64Load(align, offset) => {
                self.output.push(0x2B);
                self.encode_memarg(*align, *offset);
            }
            WasmInstr::I32Store(align, offset) => {
                self.output.push(0x36);
                self.encode_memarg(*align, *offset);
            }
            WasmInstr::F32Store(align, offset) => {
                self.output.push(0x38);
                self.encode_memarg(*align, *offset);
            }
            WasmInstr::F64Store(align, offset) => {
                self.output.push(0x39);
                self.encode_memarg(*align, *offset);
            }
            WasmInstr::MemorySize => {
                self.output.push(0x3F);
                self.output.push(0x00);
            }

            WasmInstr::I32Const(v) => {
                self.output.push(0x41);
                self.encode_sleb128(*v);
            }
            WasmInstr::I32Eqz => self.output.push(0x45),
            WasmInstr::I32Eq => self.output.push(0x46),
            WasmInstr::I32Ne => self.output.push(0x47),
            WasmInstr::I32LtS => self.output.push(0x48),
            WasmInstr::I32LtU => self.output.push(0x49),
            WasmInstr::I32GtS => self.output.push(0x4A),
            WasmInstr::I32GtU => self.output.push(0x4B),
            WasmInstr::I32LeU => self.output.push(0x4D),
            WasmInstr::I32GeS => self.output.push(0x4E),
            WasmInstr::I32GeU => self.output.push(0x4F),
            WasmInstr::I32Add => self.output.push(0x6A),
            WasmInstr::I32Sub => self.output.push(0x6B),
            WasmInstr::I32Mul => self.output.push(0x6C),
            WasmInstr::I32DivU => self.output.push(0x6E),
            WasmInstr::I32RemU => self.output.push(0x70),
            WasmInstr::I32And => self.output.push(0x71),
            WasmInstr::I32Shl => self.output.push(0x74),
            WasmInstr::I32ShrU => self.output.push(0x76),

            WasmInstr::F32Const(v) => {
                self.output.push(0x43);
                self.output.extend_from_slice(&v.to_le_bytes());
            }
            WasmInstr::F32Eq => self.output.push(0x5B),
            WasmInstr::F32Ne => self.output.push(0x5C),
            WasmInstr::F32Lt => self.output.push(0x5D),
            WasmInstr::F32Gt => self.output.push(0x5E),
            WasmInstr::F32Le => self.output.push(0x5F),
            WasmInstr::F32Ge => self.output.push(0x60),
            WasmInstr::F32Abs => self.output.push(0x8B),
            WasmInstr::F32Neg => self.output.push(0x8C),
            WasmInstr::F32Sqrt => self.output.push(0x91),
            WasmInstr::F32Add => self.output.push(0x92),
            WasmInstr::F32Sub => self.output.push(0x93),
            WasmInstr::F32Mul => self.output.push(0x94),
            WasmInstr::F32Div => self.output.push(0x95),
            WasmInstr::F32Min => self.output.push(0x96),
            WasmInstr::F32Max => self.output.push(0x97),
            WasmInstr::F32Copysign => self.output.push(0x98),

            WasmInstr::F64Const(v) => {
                self.output.push(0x44);
                self.output.extend_from_slice(&v.to_le_bytes());
            }
            WasmInstr::F64Eq => self.output.push(0x61),
            WasmInstr::F64Ne => self.output.push(0x62),
            WasmInstr::F64Lt => self.output.push(0x63),
            WasmInstr::F64Gt => self.output.push(0x64),
            WasmInstr::F64Le => self.output.push(0x65),
            WasmInstr::F64Ge => self.output.push(0x66),
            WasmInstr::F64Abs => self.output.push(0x99),
            WasmInstr::F64Neg => self.output.push(0x9A),
            WasmInstr::F64Sqrt => self.output.push(0x9F),
            WasmInstr::F64Add => self.output.push(0xA0),
            WasmInstr::F64Sub => self.output.push(0xA1),
            WasmInstr::F64Mul => self.output.push(0xA2),
            WasmInstr::F64Div => self.output.push(0xA3),
            WasmInstr::F64Min => self.output.push(0xA4),
            WasmInstr::F64Max => self.output.push(0xA5),
            WasmInstr::F64Copysign => self.output.push(0xA6),

            WasmInstr::I32TruncF32S => self.output.push(0xA8),
            WasmInstr::F32ConvertI32S => self.output.push(0xB2),
            WasmInstr::F32ConvertI32U => self.output.push(0xB3),
            WasmInstr::F32DemoteF64 => self.output.push(0xB6),
            WasmInstr::F64ConvertI32S => self.output.push(0xB7),
            WasmInstr::F64ConvertI32U => self.output.push(0xB8),
            WasmInstr::F64PromoteF32 => self.output.push(0xBB),

            WasmInstr::V128Load(align, offset) => {
                self.output.push(0xFD);
                self.encode_uleb128(0x00);
                self.encode_memarg(*align, *offset);
            }
            WasmInstr::V128Store(align, offset) => {
                self.output.push(0xFD);
                self.encode_uleb128(0x0B);
                self.encode_memarg(*align, *offset);
            }
            WasmInstr::V128Const(bytes) => {
                self.simd(0x0C);
                self.output.extend_from_slice(bytes);
            }
            WasmInstr::I8x16Shuffle(lanes) => {
                self.simd(0x0D);
                self.output.extend_from_slice(lanes);
            }
            WasmInstr::F32x4Splat => self.simd(0x13),
            WasmInstr::F32x4ExtractLane(lane) => {
                self.simd(0x1F);
                self.output.push(*lane);
            }
            WasmInstr::F32x4ReplaceLane(lane) => {
                self.simd(0x20);
                self.output.push(*lane);
            }
            WasmInstr::F32x4Add => self.simd(0xE4),
            WasmInstr::F32x4Sub => self.simd(0xE5),
            WasmInstr::F32x4Mul => self.simd(0xE6),
            WasmInstr::F32x4Div => self.simd(0xE7),

            // Comments are not encoded.
            WasmInstr::Comment(_) => {}
        }
        Ok(())
    }
}
