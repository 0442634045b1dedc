//! Instruction set, program segments and binary chunk format for the Beryl VM.
//!
//! Everything the compiler emits and the VM executes lives in the five
//! segments defined here. The opcode numbering published by [`opcode`] is
//! frozen: a chunk saved by one build only loads into a runtime with the
//! same instruction table.

pub mod chunk;
pub mod opcode;
pub mod segment;
pub mod symtab;

pub use chunk::{Chunk, ChunkError, CHUNK_MAGIC_LEN};
pub use opcode::{Opcode, Operand, INSTRUCTION_TABLE};
pub use segment::{
    CStrPool, DataHandle, FuncInfo, MethodInfo, Segments, TypeFamily, TypeInfo, NO_METHOD,
};
pub use symtab::{SymbolEntry, SymbolTable};

/// Number of general registers in the VM register file.
pub const NUM_REGISTERS: usize = 32;

/// Register holding a function's return value.
pub const REG_RESULT: u32 = 0;
/// Register holding the current `this` object.
pub const REG_THIS: u32 = 1;
/// Register holding the global object of the root context.
pub const REG_GLOBALS: u32 = 2;
/// First register available to the allocator.
pub const REG_FIRST_FREE: u32 = 3;

/// Well-known type ids. These are created in this order when a runtime
/// boots, so the compiler and VM can refer to them by constant.
pub mod type_ids {
    /// The undefined type; also the type of the null handle.
    pub const UNDEFINED: u32 = 0;
    /// 64-bit integer.
    pub const INT: u32 = 1;
    /// 64-bit float.
    pub const FLOAT: u32 = 2;
    /// Immutable string.
    pub const STRING: u32 = 3;
    /// The typeless `var` pseudo-type (compile time only).
    pub const VAR: u32 = 4;
    /// The synthesized class holding all global variables.
    pub const GLOBAL: u32 = 5;
    /// Cofunction task instances.
    pub const TASK: u32 = 6;
    /// The built-in `exception` interface.
    pub const EXCEPTION: u32 = 7;
    /// First id handed out to user-declared types.
    pub const FIRST_USER: u32 = 8;
}
