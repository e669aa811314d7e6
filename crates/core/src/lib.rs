//! Charly Core: shared foundation for the Charly virtual machine
//!
//! This crate is consumed by both the runtime and any external bytecode
//! producer. It defines:
//! - Symbol: CRC32-hashed identifiers used throughout the VM
//! - Instruction: the 4-byte little-endian bytecode encoding
//! - CompiledModule: the in-memory module bundle handed to the runtime
//! - ModuleBuilder / FunctionBuilder: the assembler surface producers use

pub mod bytecode;
pub mod module;
pub mod symbols;

pub use bytecode::{INSTRUCTION_LENGTH, Instruction, InstructionFormat, Opcode};
pub use module::{
    CompiledFunction, CompiledModule, ExceptionTableEntry, FunctionBuilder, FunctionInfo,
    InlineCacheEntry, Label, ModuleBuilder, SourceMapEntry, StringTableEntry,
};
pub use symbols::{Symbol, hash_bytes, hash_symbol};
