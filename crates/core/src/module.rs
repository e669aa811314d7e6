//! Compiled module bundles
//!
//! A [`CompiledModule`] is the in-memory structure an external bytecode
//! producer hands to the runtime. It owns the assembled code buffer plus a
//! symbol table and a function table of [`CompiledFunction`] metadata blocks
//! (exception tables, source maps, per-function string and constant tables,
//! inline cache slots, and byte offsets into the module buffer).
//!
//! The buffer is opaque to the runtime: the interpreter treats it as a
//! read-only region of instruction words. [`ModuleBuilder`] and
//! [`FunctionBuilder`] form the assembler surface used to produce bundles;
//! the builder tracks the operand stack depth of the emitted code and
//! records the static stack-size bound in the function's IR info.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::bytecode::{
    self, INSTRUCTION_LENGTH, Instruction, InstructionFormat, Opcode, stack_effect,
};
use crate::symbols::{Symbol, hash_symbol};

/// Per-function IR metadata produced by the compiler.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionInfo {
    pub stacksize: u8,
    pub local_variables: u8,
    pub heap_variables: u8,
    pub argc: u8,
    pub minargc: u8,
    pub spread_argument: bool,
    pub arrow_function: bool,
    pub is_constructor: bool,
    pub private_function: bool,
    pub has_frame_context: bool,
}

/// Maps an instruction range `[begin, end)` to an exception handler.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionTableEntry {
    pub begin_offset: u32,
    pub end_offset: u32,
    pub handler_offset: u32,
}

/// Maps an instruction offset to a source position.
#[derive(Debug, Clone, Copy)]
pub struct SourceMapEntry {
    pub instruction_offset: u32,
    pub row: u16,
    pub column: u16,
    pub end_row: u16,
    pub end_column: u16,
}

/// A symbolised string referenced by bytecode.
#[derive(Debug, Clone)]
pub struct StringTableEntry {
    pub hash: Symbol,
    pub value: String,
}

impl StringTableEntry {
    pub fn new(value: impl Into<String>) -> StringTableEntry {
        let value = value.into();
        StringTableEntry { hash: hash_symbol(&value), value }
    }
}

/// One advisory inline cache slot.
///
/// The slot encoding is owned by the runtime; zero means empty.
#[derive(Debug, Default)]
pub struct InlineCacheEntry(pub AtomicU64);

impl InlineCacheEntry {
    pub fn new() -> InlineCacheEntry {
        InlineCacheEntry(AtomicU64::new(0))
    }
}

/// Shared function info: everything the runtime needs to execute one
/// compiled function. Owned by the enclosing module and referenced raw
/// from heap-allocated `Function` objects.
#[derive(Debug)]
pub struct CompiledFunction {
    pub name: String,
    pub name_symbol: Symbol,
    pub ir_info: FunctionInfo,

    pub exception_table: Vec<ExceptionTableEntry>,
    pub sourcemap_table: Vec<SourceMapEntry>,
    pub string_table: Vec<StringTableEntry>,
    pub constant_table: Vec<u64>,
    pub inline_cache_table: Vec<InlineCacheEntry>,

    /// Offset of the function's first opcode in the module buffer.
    pub bytecode_offset: u32,
    /// Offset one past the function's last opcode.
    pub end_offset: u32,

    /// Address of the owning module's code buffer. Patched by the runtime
    /// when the module is registered; zero until then.
    pub buffer_base: AtomicUsize,
    /// Address of the owning [`CompiledModule`]. Patched at registration.
    pub owner_module: AtomicUsize,
}

impl CompiledFunction {
    /// Base address of the owning module's code buffer.
    pub fn buffer_base(&self) -> usize {
        self.buffer_base.load(Ordering::Acquire)
    }

    /// Decode the instruction word at a byte offset of the owning module's
    /// buffer. Only valid after registration.
    #[inline]
    pub fn instruction_at(&self, offset: u32) -> Instruction {
        let base = self.buffer_base();
        debug_assert!(base != 0, "function executed before module registration");
        let word = unsafe { (base as *const u8).add(offset as usize).cast::<u32>().read_unaligned() };
        Instruction(u32::from_le(word))
    }

    /// The owning module. Only valid after registration.
    pub fn owner_module(&self) -> &CompiledModule {
        let address = self.owner_module.load(Ordering::Acquire);
        debug_assert!(address != 0, "function executed before module registration");
        unsafe { &*(address as *const CompiledModule) }
    }
    /// Find the handler covering `offset`, if any.
    pub fn find_exception_handler(&self, offset: u32) -> Option<u32> {
        self.exception_table
            .iter()
            .find(|entry| offset >= entry.begin_offset && offset < entry.end_offset)
            .map(|entry| entry.handler_offset)
    }

    /// Source position of the instruction at `offset`.
    pub fn lookup_source_position(&self, offset: u32) -> Option<&SourceMapEntry> {
        self.sourcemap_table.iter().find(|entry| entry.instruction_offset == offset)
    }

    pub fn string_table_entry(&self, index: u16) -> &StringTableEntry {
        &self.string_table[index as usize]
    }

    /// Whether `offset` lies within this function's bytecode.
    pub fn contains_offset(&self, offset: u32) -> bool {
        offset >= self.bytecode_offset && offset < self.end_offset
    }
}

/// A module bundle: assembled code buffer plus index structures.
#[derive(Debug, Default)]
pub struct CompiledModule {
    pub filename: String,
    pub symbol_table: Vec<String>,
    pub function_table: Vec<Box<CompiledFunction>>,

    /// Collective buffer holding the bytecode of every function.
    /// `CompiledFunction` records offsets into this buffer.
    pub buffer: Vec<u8>,
}

impl CompiledModule {
    /// Decode the instruction word at a byte offset.
    #[inline]
    pub fn instruction_at(&self, offset: u32) -> Instruction {
        let offset = offset as usize;
        debug_assert!(offset + INSTRUCTION_LENGTH <= self.buffer.len());
        debug_assert!(offset % INSTRUCTION_LENGTH == 0);
        let bytes: [u8; 4] = self.buffer[offset..offset + 4].try_into().unwrap();
        Instruction::from_bytes(bytes)
    }

    /// Render a human-readable disassembly of every function.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for function in &self.function_table {
            let _ = writeln!(
                out,
                "function {} (argc={}, locals={}, stacksize={})",
                function.name,
                function.ir_info.argc,
                function.ir_info.local_variables,
                function.ir_info.stacksize
            );

            let mut offset = function.bytecode_offset;
            while offset < function.end_offset {
                let word = self.instruction_at(offset);
                let mnemonic =
                    word.opcode().map(|op| op.mnemonic()).unwrap_or("<invalid>");
                let _ = match word.opcode().map(|op| op.format()) {
                    Some(InstructionFormat::IXXX) => writeln!(out, "  {offset:08x}  {mnemonic}"),
                    Some(InstructionFormat::IAXX) => {
                        writeln!(out, "  {offset:08x}  {mnemonic} {}", word.arg())
                    }
                    Some(InstructionFormat::IABX) => {
                        writeln!(out, "  {offset:08x}  {mnemonic} {}, {}", word.arg(), word.arg2())
                    }
                    Some(InstructionFormat::IABC) => writeln!(
                        out,
                        "  {offset:08x}  {mnemonic} {}, {}, {}",
                        word.arg(),
                        word.arg2(),
                        word.arg3()
                    ),
                    Some(InstructionFormat::IABB) => writeln!(
                        out,
                        "  {offset:08x}  {mnemonic} {}, {}",
                        word.arg(),
                        word.arg_bb_i16()
                    ),
                    Some(InstructionFormat::IAAX) => {
                        writeln!(out, "  {offset:08x}  {mnemonic} {}", word.arg_i16())
                    }
                    Some(InstructionFormat::IAAA) => {
                        writeln!(out, "  {offset:08x}  {mnemonic} {:#x}", word.arg_u24())
                    }
                    None => writeln!(out, "  {offset:08x}  <invalid {:#010x}>", word.0),
                };
                offset += INSTRUCTION_LENGTH as u32;
            }
        }
        out
    }
}

/// Branch target handed out by [`FunctionBuilder::label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Assembles the bytecode of a single function.
///
/// Tracks the operand stack depth of the emitted code; the maximum depth
/// becomes the function's static stack-size bound unless overridden.
pub struct FunctionBuilder {
    name: String,
    ir_info: FunctionInfo,

    code: Vec<Instruction>,
    string_table: Vec<StringTableEntry>,
    constant_table: Vec<u64>,
    sourcemap: Vec<(usize, u16, u16, u16, u16)>,

    labels: Vec<Option<usize>>,
    label_depths: Vec<Option<u32>>,
    patches: Vec<(usize, Label)>,
    exception_regions: Vec<(Label, Label, Label)>,

    ic_slots: usize,
    depth: u32,
    max_depth: u32,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> FunctionBuilder {
        FunctionBuilder {
            name: name.into(),
            ir_info: FunctionInfo::default(),
            code: Vec::new(),
            string_table: Vec::new(),
            constant_table: Vec::new(),
            sourcemap: Vec::new(),
            labels: Vec::new(),
            label_depths: Vec::new(),
            patches: Vec::new(),
            exception_regions: Vec::new(),
            ic_slots: 0,
            depth: 0,
            max_depth: 0,
        }
    }

    pub fn local_variables(&mut self, count: u8) -> &mut Self {
        self.ir_info.local_variables = count;
        self
    }

    pub fn heap_variables(&mut self, count: u8) -> &mut Self {
        self.ir_info.heap_variables = count;
        self.ir_info.has_frame_context = count > 0;
        self
    }

    pub fn argc(&mut self, argc: u8, minargc: u8) -> &mut Self {
        self.ir_info.argc = argc;
        self.ir_info.minargc = minargc;
        self
    }

    pub fn arrow_function(&mut self) -> &mut Self {
        self.ir_info.arrow_function = true;
        self
    }

    pub fn spread_argument(&mut self) -> &mut Self {
        self.ir_info.spread_argument = true;
        self
    }

    pub fn constructor(&mut self) -> &mut Self {
        self.ir_info.is_constructor = true;
        self
    }

    pub fn private_function(&mut self) -> &mut Self {
        self.ir_info.private_function = true;
        self
    }

    /// Intern a string into the per-function string table.
    pub fn string(&mut self, value: &str) -> u16 {
        if let Some(index) = self.string_table.iter().position(|entry| entry.value == value) {
            return index as u16;
        }
        self.string_table.push(StringTableEntry::new(value));
        (self.string_table.len() - 1) as u16
    }

    /// Intern a raw value word into the constant table.
    pub fn constant(&mut self, word: u64) -> u16 {
        if let Some(index) = self.constant_table.iter().position(|&entry| entry == word) {
            return index as u16;
        }
        self.constant_table.push(word);
        (self.constant_table.len() - 1) as u16
    }

    /// Create an unbound branch target.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        self.label_depths.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current position.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
        match self.label_depths[label.0] {
            Some(depth) => self.depth = self.depth.max(depth),
            None => self.label_depths[label.0] = Some(self.depth),
        }
    }

    /// Bind a label as an exception handler entry point.
    ///
    /// Handler entry clears the operand stack and pushes the caught
    /// exception, so the depth at a handler is always exactly one.
    pub fn bind_handler(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
        self.label_depths[label.0] = Some(1);
        self.depth = 1;
        self.max_depth = self.max_depth.max(1);
    }

    /// Register an exception handler for the instruction range
    /// `[begin, end)`.
    pub fn exception_handler(&mut self, begin: Label, end: Label, handler: Label) {
        self.exception_regions.push((begin, end, handler));
    }

    /// Attach a source position to the next emitted instruction.
    pub fn source_position(&mut self, row: u16, column: u16, end_row: u16, end_column: u16) {
        self.sourcemap.push((self.code.len(), row, column, end_row, end_column));
    }

    fn push_word(&mut self, word: Instruction) {
        let (pops, pushes) = stack_effect(word);
        debug_assert!(
            self.depth >= pops,
            "operand stack underflow while assembling {}: {:?}",
            self.name,
            word.opcode()
        );
        self.depth = self.depth - pops + pushes;
        self.max_depth = self.max_depth.max(self.depth);
        self.code.push(word);
    }

    pub fn emit(&mut self, opcode: Opcode) -> &mut Self {
        self.push_word(bytecode::encode(opcode));
        self
    }

    pub fn emit_a(&mut self, opcode: Opcode, a: u8) -> &mut Self {
        self.push_word(bytecode::encode_a(opcode, a));
        self
    }

    pub fn emit_ab(&mut self, opcode: Opcode, a: u8, b: u8) -> &mut Self {
        self.push_word(bytecode::encode_ab(opcode, a, b));
        self
    }

    pub fn emit_aa(&mut self, opcode: Opcode, a: u16) -> &mut Self {
        self.push_word(bytecode::encode_aa(opcode, a));
        self
    }

    pub fn emit_aaa(&mut self, opcode: Opcode, a: u32) -> &mut Self {
        self.push_word(bytecode::encode_aaa(opcode, a));
        self
    }

    /// Emit a `loadsmi` materialising a raw value word whose encoding fits
    /// in 24 bits.
    pub fn loadsmi(&mut self, raw: u64) -> &mut Self {
        assert!(raw <= 0x00ff_ffff, "loadsmi immediate out of range");
        self.emit_aaa(Opcode::Loadsmi, raw as u32)
    }

    /// Emit a symbol member load with a fresh inline cache slot.
    pub fn loadattrsym(&mut self, name: &str) -> &mut Self {
        let string_index = self.string(name);
        let ic_index = self.alloc_ic_slot();
        self.push_word(bytecode::encode_abb(Opcode::Loadattrsym, ic_index, string_index));
        self
    }

    /// Emit a symbol member store with a fresh inline cache slot.
    pub fn setattrsym(&mut self, name: &str) -> &mut Self {
        let string_index = self.string(name);
        let ic_index = self.alloc_ic_slot();
        self.push_word(bytecode::encode_abb(Opcode::Setattrsym, ic_index, string_index));
        self
    }

    fn alloc_ic_slot(&mut self) -> u8 {
        let index = self.ic_slots;
        assert!(index <= u8::MAX as usize, "too many inline cache sites");
        self.ic_slots += 1;
        index as u8
    }

    fn emit_branch(&mut self, opcode: Opcode, target: Label, target_depth: u32) {
        self.patches.push((self.code.len(), target));
        match self.label_depths[target.0] {
            Some(depth) => debug_assert_eq!(depth, target_depth, "inconsistent branch depth"),
            None => self.label_depths[target.0] = Some(target_depth),
        }
        // placeholder offset, patched during assembly
        let word = match opcode {
            Opcode::Jmp | Opcode::Jmpf | Opcode::Jmpt => bytecode::encode_aa(opcode, 0),
            _ => unreachable!("not a branch opcode"),
        };
        self.push_word(word);
    }

    pub fn jmp(&mut self, target: Label) -> &mut Self {
        self.emit_branch(Opcode::Jmp, target, self.depth);
        self
    }

    pub fn jmpf(&mut self, target: Label) -> &mut Self {
        self.emit_branch(Opcode::Jmpf, target, self.depth.saturating_sub(1));
        self
    }

    pub fn jmpt(&mut self, target: Label) -> &mut Self {
        self.emit_branch(Opcode::Jmpt, target, self.depth.saturating_sub(1));
        self
    }

    pub fn testintjmp(&mut self, check: u8, target: Label) -> &mut Self {
        self.patches.push((self.code.len(), target));
        let target_depth = self.depth.saturating_sub(1);
        match self.label_depths[target.0] {
            Some(depth) => debug_assert_eq!(depth, target_depth, "inconsistent branch depth"),
            None => self.label_depths[target.0] = Some(target_depth),
        }
        self.push_word(bytecode::encode_abb(Opcode::Testintjmp, check, 0));
        self
    }

    fn finish(mut self, buffer: &mut Vec<u8>) -> Box<CompiledFunction> {
        let bytecode_offset = buffer.len() as u32;
        // patch branch offsets now that every label is bound
        for (instruction_index, label) in std::mem::take(&mut self.patches) {
            let target_index =
                self.labels[label.0].expect("branch target was never bound");
            let byte_offset =
                (target_index as i64 - instruction_index as i64) * INSTRUCTION_LENGTH as i64;
            let offset = i16::try_from(byte_offset).expect("branch offset out of range") as u16;

            let word = self.code[instruction_index];
            let opcode = word.opcode().unwrap();
            self.code[instruction_index] = match opcode {
                Opcode::Jmp | Opcode::Jmpf | Opcode::Jmpt => bytecode::encode_aa(opcode, offset),
                Opcode::Testintjmp => bytecode::encode_abb(opcode, word.arg(), offset),
                _ => unreachable!("not a branch opcode"),
            };
        }

        let instruction_offset = |index: usize| -> u32 {
            bytecode_offset + (index * INSTRUCTION_LENGTH) as u32
        };

        let exception_table = self
            .exception_regions
            .iter()
            .map(|&(begin, end, handler)| ExceptionTableEntry {
                begin_offset: instruction_offset(self.labels[begin.0].unwrap()),
                end_offset: instruction_offset(self.labels[end.0].unwrap()),
                handler_offset: instruction_offset(self.labels[handler.0].unwrap()),
            })
            .collect();

        let sourcemap_table = self
            .sourcemap
            .iter()
            .map(|&(index, row, column, end_row, end_column)| SourceMapEntry {
                instruction_offset: instruction_offset(index),
                row,
                column,
                end_row,
                end_column,
            })
            .collect();

        let mut ir_info = self.ir_info;
        if ir_info.stacksize == 0 {
            ir_info.stacksize = u8::try_from(self.max_depth).expect("operand stack too deep");
        }

        for word in &self.code {
            buffer.extend_from_slice(&word.to_bytes());
        }

        let name_symbol = hash_symbol(&self.name);
        Box::new(CompiledFunction {
            name: self.name,
            name_symbol,
            ir_info,
            exception_table,
            sourcemap_table,
            string_table: self.string_table,
            constant_table: self.constant_table,
            inline_cache_table: (0..self.ic_slots).map(|_| InlineCacheEntry::new()).collect(),
            bytecode_offset,
            end_offset: bytecode_offset + (self.code.len() * INSTRUCTION_LENGTH) as u32,
            buffer_base: AtomicUsize::new(0),
            owner_module: AtomicUsize::new(0),
        })
    }
}

/// Assembles a [`CompiledModule`] out of finished functions.
pub struct ModuleBuilder {
    filename: String,
    symbol_table: Vec<String>,
    functions: Vec<FunctionBuilder>,
}

impl ModuleBuilder {
    pub fn new(filename: impl Into<String>) -> ModuleBuilder {
        ModuleBuilder { filename: filename.into(), symbol_table: Vec::new(), functions: Vec::new() }
    }

    /// Declare a symbol used anywhere in the module.
    pub fn symbol(&mut self, name: &str) -> Symbol {
        if !self.symbol_table.iter().any(|entry| entry == name) {
            self.symbol_table.push(name.to_owned());
        }
        hash_symbol(name)
    }

    /// Append a finished function, returning its function-table index.
    ///
    /// Index 0 is the module's root function by convention.
    pub fn add_function(&mut self, function: FunctionBuilder) -> u16 {
        self.symbol(&function.name.clone());
        self.functions.push(function);
        (self.functions.len() - 1) as u16
    }

    pub fn build(self) -> CompiledModule {
        let mut buffer: Vec<u8> = Vec::new();
        let mut function_table = Vec::with_capacity(self.functions.len());

        for function in self.functions {
            function_table.push(function.finish(&mut buffer));
        }

        CompiledModule {
            filename: self.filename,
            symbol_table: self.symbol_table,
            function_table,
            buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;

    fn simple_module() -> CompiledModule {
        let mut module = ModuleBuilder::new("test.ch");
        let mut main = FunctionBuilder::new("main");
        main.loadsmi(0x42);
        main.emit(Opcode::Setreturn);
        main.emit(Opcode::Ret);
        module.add_function(main);
        module.build()
    }

    #[test]
    fn test_builder_lays_out_code() {
        let module = simple_module();
        assert_eq!(module.function_table.len(), 1);
        let main = &module.function_table[0];
        assert_eq!(main.bytecode_offset, 0);
        assert_eq!(main.end_offset, 12);
        assert_eq!(module.buffer.len(), 12);

        let first = module.instruction_at(0);
        assert_eq!(first.opcode(), Some(Opcode::Loadsmi));
        assert_eq!(first.arg_u24(), 0x42);
    }

    #[test]
    fn test_stack_bound_tracks_max_depth() {
        let mut module = ModuleBuilder::new("test.ch");
        let mut function = FunctionBuilder::new("depth");
        function.loadsmi(2);
        function.loadsmi(2);
        function.loadsmi(2);
        function.emit(Opcode::Add);
        function.emit(Opcode::Add);
        function.emit(Opcode::Setreturn);
        function.emit(Opcode::Ret);
        module.add_function(function);
        let module = module.build();
        assert_eq!(module.function_table[0].ir_info.stacksize, 3);
    }

    #[test]
    fn test_branch_patching() {
        let mut module = ModuleBuilder::new("test.ch");
        let mut function = FunctionBuilder::new("branchy");
        let target = function.label();
        function.loadsmi(0x16); // true
        function.jmpt(target);
        function.loadsmi(0x02);
        function.bind(target);
        function.emit(Opcode::Ret);
        module.add_function(function);
        let module = module.build();

        // the jmpt at offset 4 must skip one instruction (offset +8)
        let word = module.instruction_at(4);
        assert_eq!(word.opcode(), Some(Opcode::Jmpt));
        assert_eq!(word.arg_i16(), 8);
    }

    #[test]
    fn test_exception_table_offsets() {
        let mut module = ModuleBuilder::new("test.ch");
        let mut function = FunctionBuilder::new("guarded");
        let begin = function.label();
        let end = function.label();
        let handler = function.label();
        function.bind(begin);
        function.loadsmi(0x02);
        function.emit_a(Opcode::Pop, 1);
        function.bind(end);
        let done = function.label();
        function.jmp(done);
        function.bind_handler(handler);
        function.emit(Opcode::Setreturn);
        function.bind(done);
        function.emit(Opcode::Ret);
        function.exception_handler(begin, end, handler);
        module.add_function(function);
        let module = module.build();

        let table = &module.function_table[0].exception_table;
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].begin_offset, 0);
        assert_eq!(table[0].end_offset, 8);
        assert!(module.function_table[0].find_exception_handler(4).is_some());
        assert!(module.function_table[0].find_exception_handler(8).is_none());
    }

    #[test]
    fn test_string_and_constant_interning() {
        let mut function = FunctionBuilder::new("interning");
        let a = function.string("hello");
        let b = function.string("hello");
        let c = function.string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let x = function.constant(42);
        let y = function.constant(42);
        assert_eq!(x, y);
    }
}
