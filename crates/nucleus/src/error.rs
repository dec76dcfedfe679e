use nkpipe::PipelineError;
use thiserror::Error;

/// Errors returned by nucleus operations.
///
/// Programmer errors (deregistering a busy clock, an ISR returning neither
/// `HANDLED` nor `NONE`) are assertions instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("timed out")]
    TimedOut,
    #[error("out of memory")]
    OutOfMemory,
    #[error("resource busy")]
    Busy,
    #[error("interrupted by a pending signal, restart the call")]
    RestartSyscall,
    #[error("interrupted")]
    Interrupted,
    #[error("operation not supported")]
    NotSupported,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("thread canceled")]
    Canceled,
    #[error("no such object")]
    NotFound,
    #[error("operation would block")]
    WouldBlock,
}

impl CoreError {
    /// Host errno value reported through the syscall return register.
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 22,
            Self::TimedOut => 110,
            Self::OutOfMemory => 12,
            Self::Busy => 16,
            Self::RestartSyscall => 512,
            Self::Interrupted => 4,
            Self::NotSupported => 95,
            Self::NotPermitted => 1,
            Self::Canceled => 125,
            Self::NotFound => 3,
            Self::WouldBlock => 11,
        }
    }
}

impl From<PipelineError> for CoreError {
    fn from(value: PipelineError) -> Self {
        match value {
            PipelineError::NotSupported(_) => Self::NotSupported,
            PipelineError::Busy => Self::Busy,
            PipelineError::InvalidIrq(_) => Self::InvalidArgument("irq"),
            PipelineError::InvalidCpu(_) => Self::InvalidArgument("cpu"),
            PipelineError::Interrupted => Self::RestartSyscall,
            PipelineError::NoResource => Self::OutOfMemory,
        }
    }
}

pub type Result<T, E = CoreError> = core::result::Result<T, E>;
