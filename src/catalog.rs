use crate::format::mz::{ExeHeader, RelocationEntry};
use crate::format::FormatError;

/// One chunk of an overlayed executable: the root (index 0) or an overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayChunk {
    pub index: usize,
    pub file_offset: usize,
    pub image_offset: usize,
    pub image_size: usize,
    pub reloc_offset: usize,
    pub chunk_size: usize,
    pub header: ExeHeader,
}

impl OverlayChunk {
    fn describe(index: usize, file_offset: usize, header: ExeHeader) -> Result<Self, FormatError> {
        let image_size = header
            .load_module_size()
            .ok_or(FormatError::InconsistentChunk { index })?;
        Ok(Self {
            index,
            file_offset,
            image_offset: file_offset + header.header_size(),
            image_size,
            reloc_offset: file_offset + usize::from(header.reloc_tab_offset),
            chunk_size: header.chunk_size(),
            header,
        })
    }

    /// Load-module bytes of this chunk.
    ///
    /// # Errors
    /// Returns `FormatError::TruncatedImage` when the image runs past the end of `source`.
    pub fn image<'a>(&self, source: &'a [u8]) -> Result<&'a [u8], FormatError> {
        let end = self.image_offset + self.image_size;
        source
            .get(self.image_offset..end)
            .ok_or(FormatError::TruncatedImage {
                offset: self.image_offset,
                needed: self.image_size,
                available: source.len().saturating_sub(self.image_offset),
            })
    }

    /// Relocation entries as stored in the source file.
    ///
    /// # Errors
    /// Returns `FormatError::TruncatedImage` when the table runs past the end of `source`.
    pub fn relocations(&self, source: &[u8]) -> Result<Vec<RelocationEntry>, FormatError> {
        RelocationEntry::parse_table(source, self.reloc_offset, usize::from(self.header.num_reloc))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    BadSignature,
    /// A chunk with `num_pages == 0` cannot advance the walk.
    EmptyChunk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStep {
    Chunk {
        index: usize,
        offset: usize,
        header: ExeHeader,
    },
    EndOfChain {
        index: usize,
        offset: usize,
        reason: EndReason,
    },
}

/// Walks the chunk chain from file offset 0. Consumers decide whether an
/// end-of-chain step is benign (counting) or an error (listing).
pub struct ChunkWalker<'a> {
    input: &'a [u8],
    offset: usize,
    index: usize,
    done: bool,
}

impl<'a> ChunkWalker<'a> {
    #[must_use]
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            offset: 0,
            index: 0,
            done: false,
        }
    }
}

impl Iterator for ChunkWalker<'_> {
    type Item = Result<ChunkStep, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.input.len() {
            return None;
        }
        let (index, offset) = (self.index, self.offset);
        let header = match ExeHeader::parse_at(self.input, offset) {
            Ok(h) => h,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };
        let reason = if !header.has_signature() {
            Some(EndReason::BadSignature)
        } else if header.num_pages == 0 {
            Some(EndReason::EmptyChunk)
        } else {
            None
        };
        if let Some(reason) = reason {
            self.done = true;
            return Some(Ok(ChunkStep::EndOfChain {
                index,
                offset,
                reason,
            }));
        }
        self.index += 1;
        self.offset += header.chunk_size();
        Some(Ok(ChunkStep::Chunk {
            index,
            offset,
            header,
        }))
    }
}

/// Counts overlays, excluding the root. A bad chunk silently ends the count,
/// so malformed input may yield 0.
///
/// # Errors
/// Returns `FormatError::TruncatedImage` when a header crosses the end of `input`.
pub fn count_overlays(input: &[u8]) -> Result<usize, FormatError> {
    let mut chunks = 0usize;
    for step in ChunkWalker::new(input) {
        match step? {
            ChunkStep::Chunk { .. } => chunks += 1,
            ChunkStep::EndOfChain { .. } => break,
        }
    }
    Ok(chunks.saturating_sub(1))
}

/// Enumerates every chunk up to end of file. Unlike [`count_overlays`], any
/// chunk that is not a valid MZ chunk aborts the whole pass.
///
/// # Errors
/// `MalformedOverlay` on a bad signature, `InconsistentChunk` on an empty or
/// oversized header, `TruncatedImage` when a header crosses the end of `input`.
pub fn list_chunks(input: &[u8]) -> Result<Vec<OverlayChunk>, FormatError> {
    let mut chunks = Vec::new();
    for step in ChunkWalker::new(input) {
        match step? {
            ChunkStep::Chunk {
                index,
                offset,
                header,
            } => chunks.push(OverlayChunk::describe(index, offset, header)?),
            ChunkStep::EndOfChain {
                index,
                offset,
                reason: EndReason::BadSignature,
            } => return Err(FormatError::MalformedOverlay { index, offset }),
            ChunkStep::EndOfChain {
                index,
                reason: EndReason::EmptyChunk,
                ..
            } => return Err(FormatError::InconsistentChunk { index }),
        }
    }
    Ok(chunks)
}

/// Builds descriptors for the root and `num_overlays` overlays, so that the
/// vector index is the overlay number.
///
/// # Errors
/// Returns `FormatError` when a chunk is missing, inconsistent, or its image
/// or relocation table lies outside `input`.
pub fn parse_overlays(input: &[u8], num_overlays: usize) -> Result<Vec<OverlayChunk>, FormatError> {
    let mut descriptors = Vec::with_capacity(num_overlays + 1);
    for step in ChunkWalker::new(input).take(num_overlays + 1) {
        let (index, offset, header) = match step? {
            ChunkStep::Chunk {
                index,
                offset,
                header,
            } => (index, offset, header),
            ChunkStep::EndOfChain {
                index,
                reason: EndReason::EmptyChunk,
                ..
            } => return Err(FormatError::InconsistentChunk { index }),
            ChunkStep::EndOfChain { .. } => break,
        };
        let desc = OverlayChunk::describe(index, offset, header)?;
        desc.image(input)?;
        RelocationEntry::parse_table(input, desc.reloc_offset, usize::from(header.num_reloc))?;
        descriptors.push(desc);
    }
    if descriptors.len() != num_overlays + 1 {
        let index = descriptors.len();
        let offset = descriptors
            .last()
            .map_or(0, |d| d.file_offset + d.chunk_size);
        return Err(FormatError::MalformedOverlay { index, offset });
    }
    Ok(descriptors)
}
