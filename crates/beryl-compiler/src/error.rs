//! Compile-time error and warning taxonomy.
//!
//! Errors accumulate on the compiler with their source location; the
//! embedding host drains them one rendered string at a time. On a hard
//! error the current statement is abandoned and parsing resumes at the
//! next statement boundary, so one run reports as much as possible.

use thiserror::Error;

/// Every diagnostic the compiler can produce. Codes are non-zero and
/// stable; warnings start at 900.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileErrorKind {
    // ===== Hard errors =====
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("missing ';' at end of statement")]
    MissingSemicolon,
    #[error("syntax error in statement")]
    SyntaxError,
    #[error("identifier already defined: '{0}'")]
    IdentifierAlreadyDefined(String),
    #[error("undefined identifier: '{0}'")]
    UndefinedIdentifier(String),
    #[error("undefined type: '{0}'")]
    UndefinedType(String),
    #[error("unable to resolve import '{0}'")]
    ImportNotDefined(String),
    #[error("function already defined: '{0}'")]
    FunctionAlreadyDefined(String),
    #[error("function redefined, typeless 'var' conflict: '{0}'")]
    VarArgumentConflict(String),
    #[error("function redefined, inconsistent use of 'const' modifier: '{0}'")]
    ConstModifierConflict(String),
    #[error("function redefined, inconsistent use of 'weak' modifier: '{0}'")]
    WeakModifierConflict(String),
    #[error("function undefined or no overload accepts the specified arguments: '{0}'")]
    NoMatchingOverload(String),
    #[error("class member function needs to be declared in a class")]
    FunctionAtClassScope,
    #[error("constructors are methods, use 'method' keyword")]
    CtorNeedsMethodKeyword,
    #[error("convertors are methods, use 'method' keyword")]
    ConvertorNeedsMethodKeyword,
    #[error("function signature not suitable for 'accessor'")]
    BadAccessorSignature,
    #[error("no suitable accessor defined for '{0}'")]
    NoSuitableAccessor(String),
    #[error("modifier 'explicit' can only be used with constructor and convertor methods")]
    BadExplicitModifier,
    #[error("cannot use 'return' in cofunction, use 'yield'")]
    ReturnInCofunction,
    #[error("cannot use 'yield' outside of cofunctions")]
    YieldOutsideCofunction,
    #[error("function does not return a value in all cases")]
    NoReturnValue,
    #[error("function must return a value")]
    MustReturnValue,
    #[error("function cannot return a value")]
    CannotReturnValue,
    #[error("incompatible types in expression")]
    TypeMismatch,
    #[error("expression is not a valid l-value")]
    NotAnLValue,
    #[error("l-value is a constant")]
    LValueIsConst,
    #[error("break or continue outside of a loop or switch")]
    BreakWithoutLoop,
    #[error("case requires a constant expression")]
    CaseNotConstant,
    #[error("default must appear last in switch statement")]
    DefaultNotLast,
    #[error("need an object left of '.'")]
    NeedObject,
    #[error("cannot call method without an object")]
    MethodWithoutObject,
    #[error("member '{0}' is private")]
    PrivateMember(String),
    #[error("type '{0}' is not a class")]
    NotAClass(String),
    #[error("type '{0}' is not an interface")]
    NotAnInterface(String),
    #[error("class '{0}' does not have a body")]
    ClassWithoutBody(String),
    #[error("function declared but not defined: '{0}'")]
    NoFunctionBody(String),
    #[error("inherited method not implemented: '{0}'")]
    InterfaceNotComplete(String),
    #[error("no free register for 'register' variable '{0}'")]
    NoFreeRegister(String),
    #[error("modifier 'weak' requires a reference type")]
    WeakNeedsReference,
    #[error("constant requires explicit initialization")]
    ConstNeedsInit,
    #[error("native type declaration failed to compile: '{0}'")]
    NativeDeclarationFailed(String),
    #[error("reserved keyword '{0}' cannot be used here")]
    ReservedKeyword(String),
    #[error("invalid option value: '{0}'")]
    BadOptionValue(String),
    #[error("option can only be changed before the runtime is initialized: '{0}'")]
    OptionLocked(String),
    #[error("{0}")]
    Lexer(String),
    #[error("nesting too deep, parser limit exceeded")]
    ParserLimitExceeded,

    // ===== Warnings (codes 900+) =====
    #[error("keyword '__selftest' is reserved and has no effect")]
    SelfTestIgnored,
    #[error("taking a weak reference from a weak reference")]
    WeakFromWeak,
    #[error("assigning a temporary value to a weak reference")]
    WeakFromTemporary,
    #[error("returning a weak reference to a local variable")]
    ReturnWeakLocal,
    #[error("unreachable code")]
    UnreachableCode,
}

impl CompileErrorKind {
    /// Stable numeric code. Warnings are 900 and up.
    pub fn code(&self) -> u32 {
        use CompileErrorKind::*;
        match self {
            UnexpectedEof => 100,
            UnexpectedToken(_) => 101,
            MissingSemicolon => 102,
            SyntaxError => 103,
            IdentifierAlreadyDefined(_) => 104,
            UndefinedIdentifier(_) => 105,
            UndefinedType(_) => 106,
            ImportNotDefined(_) => 107,
            FunctionAlreadyDefined(_) => 108,
            VarArgumentConflict(_) => 109,
            ConstModifierConflict(_) => 110,
            WeakModifierConflict(_) => 111,
            NoMatchingOverload(_) => 112,
            FunctionAtClassScope => 113,
            CtorNeedsMethodKeyword => 114,
            ConvertorNeedsMethodKeyword => 115,
            BadAccessorSignature => 116,
            NoSuitableAccessor(_) => 117,
            BadExplicitModifier => 118,
            ReturnInCofunction => 119,
            YieldOutsideCofunction => 120,
            NoReturnValue => 121,
            MustReturnValue => 122,
            CannotReturnValue => 123,
            TypeMismatch => 124,
            NotAnLValue => 125,
            LValueIsConst => 126,
            BreakWithoutLoop => 127,
            CaseNotConstant => 128,
            DefaultNotLast => 129,
            NeedObject => 130,
            MethodWithoutObject => 131,
            PrivateMember(_) => 132,
            NotAClass(_) => 133,
            NotAnInterface(_) => 134,
            ClassWithoutBody(_) => 135,
            NoFunctionBody(_) => 136,
            InterfaceNotComplete(_) => 137,
            NoFreeRegister(_) => 138,
            WeakNeedsReference => 139,
            ConstNeedsInit => 140,
            NativeDeclarationFailed(_) => 141,
            ReservedKeyword(_) => 142,
            BadOptionValue(_) => 143,
            OptionLocked(_) => 144,
            Lexer(_) => 145,
            ParserLimitExceeded => 146,
            SelfTestIgnored => 900,
            WeakFromWeak => 901,
            WeakFromTemporary => 902,
            ReturnWeakLocal => 903,
            UnreachableCode => 904,
        }
    }

    /// True for warning-severity diagnostics.
    pub fn is_warning(&self) -> bool {
        self.code() >= 900
    }

    /// Warning severity level, 1 (important) to 4 (pedantic). Gated by
    /// the `warning-level` option.
    pub fn warning_level(&self) -> u32 {
        use CompileErrorKind::*;
        match self {
            WeakFromTemporary | ReturnWeakLocal => 1,
            WeakFromWeak => 2,
            SelfTestIgnored => 3,
            UnreachableCode => 3,
            _ => 0,
        }
    }
}

/// Diagnostic rendering style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorFormat {
    /// `file(line,col): error Ennn: message`
    #[default]
    Default,
    /// MSVC-style: `file(line): error Ennn: message (col N)`
    Ms,
}

/// One accumulated diagnostic with its location.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileMessage {
    /// What happened.
    pub kind: CompileErrorKind,
    /// Compilation unit name.
    pub file: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

impl CompileMessage {
    /// Render with the configured format.
    pub fn render(&self, format: ErrorFormat) -> String {
        let severity = if self.kind.is_warning() {
            "warning"
        } else {
            "error"
        };
        match format {
            ErrorFormat::Default => format!(
                "{}({},{}): {} E{:03}: {}",
                self.file,
                self.line,
                self.column,
                severity,
                self.kind.code(),
                self.kind
            ),
            ErrorFormat::Ms => format!(
                "{}({}): {} E{:03}: {} (col {})",
                self.file,
                self.line,
                severity,
                self.kind.code(),
                self.kind,
                self.column
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_nonzero_and_warnings_high() {
        assert!(CompileErrorKind::UnexpectedEof.code() > 0);
        assert!(!CompileErrorKind::UnexpectedEof.is_warning());
        assert!(CompileErrorKind::WeakFromWeak.is_warning());
        assert!(CompileErrorKind::SelfTestIgnored.is_warning());
    }

    #[test]
    fn test_render_formats() {
        let msg = CompileMessage {
            kind: CompileErrorKind::MissingSemicolon,
            file: "main.bc".into(),
            line: 3,
            column: 14,
        };
        assert_eq!(
            msg.render(ErrorFormat::Default),
            "main.bc(3,14): error E102: missing ';' at end of statement"
        );
        assert_eq!(
            msg.render(ErrorFormat::Ms),
            "main.bc(3): error E102: missing ';' at end of statement (col 14)"
        );
    }
}
