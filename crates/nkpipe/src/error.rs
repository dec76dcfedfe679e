use thiserror::Error;

/// Errors reported by a pipeline backend.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    #[error("capability not supported by the {0} pipeline")]
    NotSupported(&'static str),
    #[error("pipeline resource busy")]
    Busy,
    #[error("invalid irq {0}")]
    InvalidIrq(u32),
    #[error("invalid cpu {0}")]
    InvalidCpu(usize),
    #[error("stage migration interrupted")]
    Interrupted,
    #[error("pipeline resources exhausted")]
    NoResource,
}
