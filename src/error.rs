use thiserror::Error;

/// The failure classes the dispatch loop and the host interface can
/// produce. Each variant formats the exact user-visible message body; the
/// surrounding [`RuntimeError`] adds the script-address or native-code
/// prefix.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    #[error("attempt to call non-function value")]
    NotCallable,

    #[error("error in function `{name}' (code: {code})")]
    NativeError { name: String, code: i32 },

    #[error("arithmetic on non-numbers")]
    ArithmeticType,

    #[error("division by zero")]
    DivisionByZero,

    #[error("modulo division on non-integers")]
    ModuloType,

    #[error("modulo division by zero")]
    ModuloByZero,

    #[error("negation of non-number")]
    NegationType,

    #[error("incrementing or decrementing non-number")]
    IncDecType,

    #[error("bitwise operation on non-integers")]
    BitwiseType,

    #[error("bitwise NOT on non-integer")]
    BitNotType,

    #[error("logical negation of non-Boolean value")]
    LogNotType,

    #[error(
        "register does not contain Boolean value in conditional jump \
         (are you trying to use non-Booleans with logical operators \
         or in the condition of an `if`, `while` or `for` statement?)"
    )]
    CondJumpType,

    #[error("ordered comparison of uncomparable values of type {lhs} and {rhs}")]
    Uncomparable {
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("sizeof applied to a {0} value")]
    SizeofType(&'static str),

    #[error("concatenation of non-string values")]
    ConcatType,

    #[error("indexing string with non-integer value")]
    StringIndexType,

    #[error("character at normalized index {idx} is out of bounds for string of length {len}")]
    StringIndexBounds { idx: i64, len: i64 },

    #[error("first operand of [] operator must be an array or a string")]
    IndexableType,

    #[error("assignment to member of non-array value")]
    ArraySetType,

    #[error("array index cannot be NaN")]
    NanKey,

    #[error("non-integer argument to `#' operator")]
    VarargIndexType,

    #[error("negative argument to `#' operator")]
    VarargIndexNegative,

    #[error("argument `{0}' of `#' operator is out-of bounds")]
    VarargBounds(i64),

    #[error("global `{0}' does not exist or it is nil")]
    UnresolvedSymbol(String),

    #[error("re-definition of global `{0}'")]
    GlobalRedefinition(String),

    #[error("illegal instruction {0:#04x}")]
    IllegalInstruction(u8),

    #[error("instruction pointer out of range: {0:#010x}")]
    PcOutOfRange(usize),

    #[error("malformed bytecode: {0}")]
    MalformedBytecode(String),

    #[error("program of function `{0}' is no longer alive")]
    DeadProgram(String),

    /// A custom message supplied by a native function through
    /// `Vm::set_error_message`.
    #[error("{0}")]
    Host(String),
}

/// A runtime error: the failure kind plus where it was raised. Script-side
/// errors carry the word offset of the faulting instruction within the
/// running program's bytecode.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("runtime error at address {addr:#010x}: {kind}")]
    Script { addr: usize, kind: ErrorKind },

    #[error("runtime error in native code: {kind}")]
    Native { kind: ErrorKind },
}

impl RuntimeError {
    pub fn kind(&self) -> &ErrorKind {
        match self {
            RuntimeError::Script { kind, .. } => kind,
            RuntimeError::Native { kind } => kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_error_prefix_carries_address() {
        let err = RuntimeError::Script {
            addr: 0x2a,
            kind: ErrorKind::ArithmeticType,
        };
        assert_eq!(
            err.to_string(),
            "runtime error at address 0x0000002a: arithmetic on non-numbers"
        );
    }

    #[test]
    fn native_error_prefix() {
        let err = RuntimeError::Native {
            kind: ErrorKind::NativeError {
                name: "frobnicate".into(),
                code: -3,
            },
        };
        assert_eq!(
            err.to_string(),
            "runtime error in native code: error in function `frobnicate' (code: -3)"
        );
    }

    #[test]
    fn message_bodies() {
        assert_eq!(
            ErrorKind::GlobalRedefinition("g".into()).to_string(),
            "re-definition of global `g'"
        );
        assert_eq!(
            ErrorKind::StringIndexBounds { idx: 5, len: 2 }.to_string(),
            "character at normalized index 5 is out of bounds for string of length 2"
        );
        assert_eq!(
            ErrorKind::UnresolvedSymbol("print".into()).to_string(),
            "global `print' does not exist or it is nil"
        );
        assert_eq!(
            ErrorKind::IllegalInstruction(0xfe).to_string(),
            "illegal instruction 0xfe"
        );
    }
}
