use thiserror::Error;

#[derive(Error, Debug)]
pub enum SavesetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SIMH framing mismatch at offset 0x{offset:X}: leading length {leading}, trailing length {trailing}")]
    FramingMismatch {
        offset: u64,
        leading: u32,
        trailing: u32,
    },

    #[error("truncated record at offset 0x{offset:X}: expected {expected} bytes, got {got}")]
    TruncatedRecord {
        offset: u64,
        expected: usize,
        got: usize,
    },

    #[error("buffer pool exhausted with {busy} buffers busy")]
    PoolExhausted { busy: usize },
}

pub type Result<T> = std::result::Result<T, SavesetError>;
