//! Runtime error taxonomies.
//!
//! Two families, both non-zero integer codes: [`VmError`] covers the
//! exceptions a running program can raise (delivered through the
//! exception vectors or as a runtime-exception object), [`LibError`]
//! covers the embedding API.

use thiserror::Error;

/// Runtime exceptions raised by executing code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("illegal instruction")]
    IllegalInstruction,
    #[error("stack overflow")]
    StackOverflow,
    #[error("null reference")]
    NullReference,
    #[error("unsupported type")]
    UnsupportedType,
    #[error("type mismatch")]
    TypeMismatch,
    #[error("call to non-function")]
    CallToNonFunction,
    #[error("invalid operand")]
    InvalidOperand,
    #[error("divide by zero")]
    DivideByZero,
    #[error("software exception")]
    SoftwareException,
    #[error("trace exception")]
    Trace,
    #[error("break exception")]
    Break,
    #[error("unhandled exception")]
    Unhandled,
    #[error("allocation failed")]
    AllocationFailed,
    #[error("invalid code address")]
    InvalidCodeAddress,
    #[error("return to native")]
    ReturnToNative,
    #[error("object copy failed")]
    ObjectCopyFailed,
    #[error("abort")]
    Abort,
    #[error("native exception")]
    NativeException,
}

impl VmError {
    /// Stable exception code, prefixed 1xx.
    pub fn code(self) -> u32 {
        use VmError::*;
        match self {
            IllegalInstruction => 101,
            StackOverflow => 102,
            NullReference => 103,
            UnsupportedType => 104,
            TypeMismatch => 105,
            CallToNonFunction => 106,
            InvalidOperand => 107,
            DivideByZero => 108,
            SoftwareException => 109,
            Trace => 110,
            Break => 111,
            Unhandled => 112,
            AllocationFailed => 113,
            InvalidCodeAddress => 114,
            ReturnToNative => 115,
            ObjectCopyFailed => 116,
            Abort => 117,
            NativeException => 118,
        }
    }
}

/// Embedding API errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LibError {
    #[error("generic error")]
    Generic,
    #[error("illegal argument")]
    IllegalArgument,
    #[error("out of code")]
    OutOfCode,
    #[error("illegal type name")]
    IllegalTypeName,
    #[error("registering the native type failed")]
    RegisterTypeFailed,
    #[error("undefined type")]
    UndefinedType,
    #[error("unsupported native call")]
    UnsupportedNativeCall,
    #[error("invalid exception vector")]
    InvalidVector,
    #[error("invalid handle index")]
    InvalidHandleIndex,
    #[error("invalid handle type")]
    InvalidHandleType,
    #[error("invalid member index")]
    InvalidMember,
    #[error("invalid function index")]
    InvalidFunction,
    #[error("invalid register")]
    InvalidRegister,
    #[error("call to non-function")]
    CallToNonFunction,
    #[error("runtime is initialized and locked")]
    RuntimeLocked,
    #[error("saving chunk failed")]
    SaveChunkFailed,
    #[error("loading chunk failed: {0}")]
    LoadChunkFailed(String),
    #[error("chunk has no symbol table")]
    NoSymbolTable,
    #[error("symbol table already exists")]
    SymbolTableExists,
    #[error("symbol not found")]
    SymbolNotFound,
    #[error("incompatible native type")]
    IncompatibleNativeType,
    #[error("detected memory leaks")]
    DetectedMemoryLeaks,
    #[error("trace is not supported in this build")]
    TraceNotSupported,
    #[error("runtime is blocked")]
    RuntimeBlocked,
    #[error("code not initialized")]
    CodeNotInitialized,
    #[error("initialization failed")]
    InitializeFailed,
    #[error("no compiler available")]
    NoCompiler,
    #[error("file open error")]
    FileOpen,
    #[error("unexpected end of file")]
    FileEnd,
    #[error("file error")]
    FileGeneric,
    #[error("mark-handle error")]
    MarkHandleError,
    #[error("compilation failed")]
    CompileFailed,
}

impl LibError {
    /// Stable error code, prefixed 2xx.
    pub fn code(&self) -> u32 {
        use LibError::*;
        match self {
            Generic => 201,
            IllegalArgument => 202,
            OutOfCode => 203,
            IllegalTypeName => 204,
            RegisterTypeFailed => 205,
            UndefinedType => 206,
            UnsupportedNativeCall => 207,
            InvalidVector => 208,
            InvalidHandleIndex => 209,
            InvalidHandleType => 210,
            InvalidMember => 211,
            InvalidFunction => 212,
            InvalidRegister => 213,
            CallToNonFunction => 214,
            RuntimeLocked => 215,
            SaveChunkFailed => 216,
            LoadChunkFailed(_) => 217,
            NoSymbolTable => 218,
            SymbolTableExists => 219,
            SymbolNotFound => 220,
            IncompatibleNativeType => 221,
            DetectedMemoryLeaks => 222,
            TraceNotSupported => 223,
            RuntimeBlocked => 224,
            CodeNotInitialized => 225,
            InitializeFailed => 226,
            NoCompiler => 227,
            FileOpen => 228,
            FileEnd => 229,
            FileGeneric => 230,
            MarkHandleError => 231,
            CompileFailed => 232,
        }
    }
}

/// The four exception vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector {
    /// Machine-raised exceptions: illegal instruction, null reference,
    /// divide by zero and friends.
    Machine,
    /// User `throw`.
    Software,
    /// Per-instruction trace callback.
    Trace,
    /// Explicit `__brk`.
    Break,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable_and_nonzero() {
        assert_eq!(VmError::IllegalInstruction.code(), 101);
        assert_eq!(VmError::StackOverflow.code(), 102);
        assert_eq!(VmError::SoftwareException.code(), 109);
        assert_eq!(LibError::RuntimeLocked.code(), 215);
        assert_eq!(LibError::RuntimeBlocked.code(), 224);
    }
}
