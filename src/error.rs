use thiserror::Error;

#[derive(Error, Debug)]
pub enum UserptrError {
    #[error("Out of GPU Memory")]
    OutOfMemory,

    #[error("Interrupted while waiting for the address space lock")]
    Interrupted,

    #[error("Timed out waiting for a GPU fence")]
    WaitTimeout,

    #[error("Address space is shutting down")]
    AddressSpaceGone,

    #[error("Invalid buffer handle: {0}")]
    InvalidHandle(u64),

    #[error("0x{start:x}-0x{end:x} does not relate to an existing buffer")]
    NoBufferForRange { start: u64, end: u64 },

    #[error("0x{start:x}-0x{end:x} spans more than a single buffer")]
    RangeSpansMultiple { start: u64, end: u64 },
}

// A convenient alias
pub type UserptrResult<T> = Result<T, UserptrError>;
