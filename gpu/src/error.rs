//! Error taxonomy shared by every stage of the kernel pipeline.
//!
//! GPU-path failures (`CompilationFailed`, `ExecutionFailed`) are candidates
//! for CPU fallback; everything else is surfaced to the caller as-is.

use crate::interpreter::InterpreterError;

pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    /// Malformed kernel body, dimension list, or call arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Shader synthesis or program link error.
    #[error("compilation failed: {0}")]
    CompilationFailed(String),

    /// Dispatch, upload, or readback error (including context loss).
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Strict registries refuse to change a function's type signature.
    #[error("function '{name}' redefined with an incompatible signature: {detail}")]
    FunctionRedefinitionConflict { name: String, detail: String },

    /// The interpreted body itself failed. There is no further fallback tier.
    #[error("interpreter error: {0}")]
    Interpreter(#[from] InterpreterError),

    #[error("config error: {0}")]
    Config(String),
}

impl KernelError {
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        KernelError::InvalidArgument(msg.into())
    }

    pub fn compilation<S: Into<String>>(msg: S) -> Self {
        KernelError::CompilationFailed(msg.into())
    }

    pub fn execution<S: Into<String>>(msg: S) -> Self {
        KernelError::ExecutionFailed(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        KernelError::Config(msg.into())
    }

    /// Whether the dispatcher may answer this error by rebuilding the kernel
    /// on the CPU executor (unless the GPU was explicitly forced).
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            KernelError::CompilationFailed(_) | KernelError::ExecutionFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_eligibility() {
        assert!(KernelError::compilation("x").is_fallback_eligible());
        assert!(KernelError::execution("x").is_fallback_eligible());
        assert!(!KernelError::invalid("x").is_fallback_eligible());
        assert!(!KernelError::config("x").is_fallback_eligible());
        let interp = KernelError::from(InterpreterError::StackOverflow);
        assert!(!interp.is_fallback_eligible());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = KernelError::FunctionRedefinitionConflict {
            name: "scale".into(),
            detail: "1 parameter(s) vs 2".into(),
        };
        let text = err.to_string();
        assert!(text.contains("scale"));
        assert!(text.contains("1 parameter(s) vs 2"));
    }
}
