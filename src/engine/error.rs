use super::{ClientId, Name};

/// Errors raised while decoding a request payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("unknown command kind {0}")]
    UnknownKind(u8),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u64),
    #[error("invalid boolean byte {0:#04x} in {1}")]
    InvalidBool(u8, &'static str),
    #[error("{opcode} takes {expected} operands, got {got}")]
    Arity {
        opcode: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("operand declared {declared} bytes but its node used {used}")]
    OperandLength { declared: usize, used: usize },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("expression tree deeper than {0} levels")]
    TooDeep(usize),
    #[error("declared size of {0} overflows")]
    SizeOverflow(&'static str),
}

/// A per-command failure. None of these stop the engine: each one is turned
/// into an error reply for the client that issued the command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("malformed request: {0}")]
    ProtocolDecode(#[from] DecodeError),
    #[error("unknown array {0}")]
    UnknownName(Name),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("client {0} is not connected")]
    UnknownClient(ClientId),
}

impl EngineError {
    /// Status byte used for this error in the reply envelope.
    pub fn code(&self) -> u8 {
        match self {
            EngineError::ProtocolDecode(_) => 1,
            EngineError::UnknownName(_) => 2,
            EngineError::TypeMismatch(_) => 3,
            EngineError::UnsupportedOperation(_) => 4,
            EngineError::ResourceExhausted(_) => 5,
            EngineError::UnknownClient(_) => 6,
        }
    }

    pub(crate) fn mismatch(msg: impl Into<String>) -> Self {
        Self::TypeMismatch(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
