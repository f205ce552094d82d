//! Everything that can go wrong while unwinding.

/// Coarse classification of an [`UnwindError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The unwind metadata is malformed.
    Decode,
    /// Target memory could not be read.
    MemoryAccess,
    /// No descriptor covers an instruction pointer. The leaf path handles
    /// this, so no public operation ever returns it.
    LookupMiss,
    /// The frame could not be stepped by any backend.
    StepFailure,
    /// A personality routine could not be called, asked to continue the
    /// search, or returned a disposition we do not know.
    HandlerDisposition,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnwindError {
    #[error("malformed unwind descriptor at {address:#x}: {reason}")]
    Decode { address: u64, reason: &'static str },
    #[error("chained unwind descriptors at {address:#x} nest deeper than {limit}")]
    ChainTooDeep { address: u64, limit: usize },
    #[error("malformed scope table at {address:#x}: {reason}")]
    MalformedScopeTable { address: u64, reason: &'static str },
    #[error("stack pointer is null")]
    InvalidStackPointer,
    #[error("cannot read {len} bytes at {address:#x}")]
    UnreadableMemory { address: u64, len: usize },
    #[error("cannot step frame at {address:#x}: {reason}")]
    StepFailure { address: u64, reason: &'static str },
    #[error("no callable exception handler for {address:#x}")]
    HandlerInvocationFailed { address: u64 },
    #[error("exception handler at {address:#x} returned disposition {disposition}")]
    HandlerDisposition { address: u64, disposition: i32 },
}

impl UnwindError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode { .. } | Self::ChainTooDeep { .. } | Self::MalformedScopeTable { .. } => {
                ErrorKind::Decode
            }
            Self::InvalidStackPointer | Self::UnreadableMemory { .. } => ErrorKind::MemoryAccess,
            Self::StepFailure { .. } => ErrorKind::StepFailure,
            Self::HandlerInvocationFailed { .. } | Self::HandlerDisposition { .. } => {
                ErrorKind::HandlerDisposition
            }
        }
    }

    /// Stable numeric code, as stored in [`LastError`](crate::LastError).
    /// Zero is reserved for "no error".
    pub fn code(&self) -> u32 {
        match self {
            Self::Decode { .. } => 1,
            Self::ChainTooDeep { .. } => 2,
            Self::MalformedScopeTable { .. } => 3,
            Self::InvalidStackPointer => 4,
            Self::UnreadableMemory { .. } => 5,
            Self::StepFailure { .. } => 6,
            Self::HandlerInvocationFailed { .. } => 7,
            Self::HandlerDisposition { .. } => 8,
        }
    }

    /// The address the failure is about, if there is one.
    pub fn address(&self) -> Option<u64> {
        match *self {
            Self::Decode { address, .. }
            | Self::ChainTooDeep { address, .. }
            | Self::MalformedScopeTable { address, .. }
            | Self::UnreadableMemory { address, .. }
            | Self::StepFailure { address, .. }
            | Self::HandlerInvocationFailed { address }
            | Self::HandlerDisposition { address, .. } => Some(address),
            Self::InvalidStackPointer => None,
        }
    }
}

pub type Result<T, E = UnwindError> = core::result::Result<T, E>;
