//! Typed error taxonomy for the engine.

use thiserror::Error;

/// Every fault the engine can raise. A fault is terminal for the run: no
/// opcode attempts partial recovery, the driver halts and reports the PC of
/// the failing instruction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZError {
    #[error("unsupported Z-machine version {0} (supported: 3, 4, 5, 7, 8)")]
    UnsupportedVersion(u8),

    #[error("unsupported opcode {opcode:#04x} ({form:?}) at {pc:#06x}")]
    UnsupportedOpcode {
        opcode: u8,
        form: &'static str,
        pc: u32,
    },

    #[error("bad memory access: {0}")]
    BadMemoryAccess(String),

    #[error("stack underflow: {0}")]
    StackUnderflow(String),

    #[error("stack overflow: {0}")]
    StackOverflow(String),

    #[error("bad property: {0}")]
    BadProperty(String),

    #[error("dictionary entry too short: {0}")]
    DictionaryEntryTooShort(String),

    #[error("save failed: {0}")]
    SaveFailed(String),

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("interrupt cycle: {0}")]
    InterruptCycle(String),

    #[error("text decode error: {0}")]
    TextDecode(String),

    #[error("instruction decode error: {0}")]
    InstructionDecode(String),

    /// Catch-all for internal helpers that report failures as plain strings
    /// (memory/stack/object-table primitives); wrapped into the taxonomy at
    /// the engine/driver boundary rather than threaded through every call site.
    #[error("{0}")]
    Internal(String),
}

impl From<String> for ZError {
    fn from(s: String) -> Self {
        ZError::Internal(s)
    }
}

impl From<&str> for ZError {
    fn from(s: &str) -> Self {
        ZError::Internal(s.to_string())
    }
}

impl ZError {
    /// Human-readable single line identifying the fault, used by the driver
    /// when reporting a fatal error at a given PC.
    pub fn fault_line(&self, pc: u32) -> String {
        format!("[fault at {pc:#06x}] {self}")
    }
}

pub type ZResult<T> = Result<T, ZError>;
