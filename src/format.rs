use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("bad MZ signature in chunk {index} at file offset {offset:#x}")]
    MalformedOverlay { index: usize, offset: usize },
    #[error("segmented (new) executable is not supported")]
    UnsupportedFormat,
    #[error("truncated image: need {needed} bytes at offset {offset:#x}, only {available} available")]
    TruncatedImage {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("chunk {index} has a header larger than its load module")]
    InconsistentChunk { index: usize },
}

pub mod mz;
