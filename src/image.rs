use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::format::mz::ExeHeader;
use crate::format::FormatError;

/// Hard ceiling on input size. Anything larger is not a plausible overlayed DOS program.
pub const MAX_INPUT_SIZE: usize = 2048 * 1024;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("input too large: {size} bytes (limit {limit})")]
    InputTooLarge { size: u64, limit: usize },
    #[error("cannot read {}", path.display())]
    UnreadableInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("input is empty")]
    EmptyInput,
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Whole executable held in one owned buffer, with its root header decoded.
#[derive(Debug, Clone)]
pub struct ExeImage {
    pub bytes: Vec<u8>,
    pub header: ExeHeader,
}

impl ExeImage {
    /// Reads `path` completely and validates the root header.
    ///
    /// # Errors
    /// Returns `LoadError` when the file cannot be read, exceeds `MAX_INPUT_SIZE`,
    /// or does not start with a plain MZ header.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let unreadable = |source| LoadError::UnreadableInput {
            path: path.to_path_buf(),
            source,
        };
        let size = std::fs::metadata(path).map_err(unreadable)?.len();
        if size > MAX_INPUT_SIZE as u64 {
            return Err(LoadError::InputTooLarge {
                size,
                limit: MAX_INPUT_SIZE,
            });
        }
        let bytes = std::fs::read(path).map_err(unreadable)?;
        log::debug!("loaded {} ({} bytes)", path.display(), bytes.len());
        Self::from_bytes(bytes)
    }

    /// Validates an in-memory image the same way `load` does.
    ///
    /// # Errors
    /// See [`ExeImage::load`].
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, LoadError> {
        if bytes.is_empty() {
            return Err(LoadError::EmptyInput);
        }
        if bytes.len() > MAX_INPUT_SIZE {
            return Err(LoadError::InputTooLarge {
                size: bytes.len() as u64,
                limit: MAX_INPUT_SIZE,
            });
        }
        let header = ExeHeader::parse(&bytes)?;
        header.validate(0, 0)?;
        Ok(Self { bytes, header })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
