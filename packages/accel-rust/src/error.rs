//! Error taxonomy shared by submission, administrative, and completion paths.

use offload_core::{HexError, UnknownOpcode};

/// Errors returned synchronously by framework calls, and the non-success
/// statuses delivered through task completions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccelError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("source length {src} does not match destination length {dst}")]
    LengthMismatch { src: u64, dst: u64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("out of memory: {0}")]
    NoMemory(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("buffers differ at offset {offset}")]
    Miscompare { offset: u64 },
    #[error("module {module} failed with status {code}")]
    Backend { module: String, code: i32 },
}

impl AccelError {
    /// Negative errno equivalent, for collaborators that forward numeric codes.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            AccelError::InvalidArgument(_) | AccelError::InvalidState(_) => -22, // EINVAL
            AccelError::LengthMismatch { .. } => -34,                            // ERANGE
            AccelError::NotFound(_) => -2,                                       // ENOENT
            AccelError::AlreadyExists(_) => -17,                                 // EEXIST
            AccelError::NotSupported(_) => -95,                                  // ENOTSUP
            AccelError::NoMemory(_) => -12,                                      // ENOMEM
            AccelError::Miscompare { .. } => -84,                                // EILSEQ
            AccelError::Backend { code, .. } => *code,
        }
    }
}

impl From<HexError> for AccelError {
    fn from(e: HexError) -> Self {
        AccelError::InvalidArgument(e.to_string())
    }
}

impl From<UnknownOpcode> for AccelError {
    fn from(e: UnknownOpcode) -> Self {
        AccelError::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(AccelError::InvalidArgument("x".into()).errno(), -22);
        assert_eq!(AccelError::InvalidState("x".into()).errno(), -22);
        assert_eq!(AccelError::LengthMismatch { src: 1, dst: 2 }.errno(), -34);
        assert_eq!(AccelError::NotFound("x".into()).errno(), -2);
        assert_eq!(AccelError::AlreadyExists("x".into()).errno(), -17);
        assert_eq!(AccelError::NotSupported("x".into()).errno(), -95);
        assert_eq!(AccelError::NoMemory("x".into()).errno(), -12);
        assert_eq!(
            AccelError::Backend {
                module: "hw".into(),
                code: -5
            }
            .errno(),
            -5
        );
    }

    #[test]
    fn hex_errors_become_invalid_argument() {
        let err: AccelError = HexError::OddLength(3).into();
        assert!(matches!(err, AccelError::InvalidArgument(msg) if msg.contains("odd length")));
    }

    #[test]
    fn unknown_opcode_becomes_invalid_argument() {
        let err: AccelError = UnknownOpcode::Index(42).into();
        assert_eq!(
            err,
            AccelError::InvalidArgument("opcode index 42 out of range".to_string())
        );
    }
}
