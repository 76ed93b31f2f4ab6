use thiserror::Error;

pub type Result<T> = std::result::Result<T, GpuError>;

/// Unified error type for the submission, completion and recovery paths.
///
/// Hardware faults seen by the interrupt handler never surface here; they are
/// logged and kept as [`crate::FaultRecord`]s for the next `recover()` call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// No event slot became free within the acquire timeout. Retryable.
    #[error("no event slot available (requested {requested}, free {free})")]
    ResourceExhausted { requested: usize, free: usize },

    /// The power domain refused to resume. Retryable.
    #[error("power domain unavailable: {0}")]
    PowerUnavailable(String),

    /// The reset loop hit its deadline without the core reporting idle.
    #[error("GPU reset failed: idle=0x{idle:08x} clock=0x{clock:08x}")]
    ResetFailed { idle: u32, clock: u32 },

    /// The fence was resolved by recovery rather than by the hardware.
    #[error("fence force-completed by GPU recovery")]
    ForcedCompletion,

    /// A previous recovery failed; the device must be recovered before use.
    #[error("GPU device lost")]
    DeviceLost,

    #[error("timed out")]
    TimedOut,

    #[error("GPU busy")]
    Busy,

    #[error("address space bind failed: {0}")]
    AddressSpace(String),

    #[error("clock error: {0}")]
    Clock(String),

    #[error("invalid event slot {0}")]
    InvalidSlot(usize),

    #[error("event slot {0} is not in use")]
    SlotNotInUse(usize),

    #[error("invalid command buffer: {0}")]
    InvalidCommandBuffer(&'static str),

    #[error("failed to start worker thread: {0}")]
    WorkerSpawn(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl GpuError {
    /// Whether the caller may simply retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::PowerUnavailable(_) | Self::TimedOut | Self::Busy
        )
    }
}
