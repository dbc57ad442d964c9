use std::collections::TryReserveError;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::catalog::{count_overlays, parse_overlays, OverlayChunk};
use crate::format::mz::{
    paragraphs_for, ExeHeader, RelocationEntry, HEADER_SIZE, PAGE_SIZE, PARAGRAPH_SIZE,
    RELOC_ENTRY_SIZE,
};
use crate::format::FormatError;

mod callsite;
mod lut;
pub mod opcode;
mod reloc;

pub use callsite::{patch_call_sites, CallSite};
pub use lut::patch_segment_lut;
pub use reloc::retarget;

/// Highest paragraph addressable from the image base.
const ADDRESS_SPACE_PARAGRAPHS: u32 = 0xffff;

#[derive(Debug, Error)]
pub enum FlattenError {
    #[error("not enough address space above the stack: need {required} paragraphs, {available} available")]
    AddressSpaceExhausted { required: u32, available: u32 },
    #[error("cannot allocate output buffers")]
    AllocationFailure(#[from] TryReserveError),
    #[error("failed to write {}", path.display())]
    OutputWriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("lookup table does not fit in the root image (offset {offset:#x}, image size {len:#x})")]
    LookupTableOutOfRange { offset: usize, len: usize },
    #[error("{count} relocations do not fit in one MZ header")]
    TooManyRelocations { count: usize },
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Operator-supplied facts about the overlay manager. Positions are file offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlattenParams {
    pub segment_lut_pos: usize,
    pub owner_lut_pos: usize,
    pub lut_entries: usize,
    /// Segment (relative to image base) where every overlay was mapped at runtime.
    pub overlay_base: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlattenOptions {
    /// Zero-fill the output up to the next 512-byte page.
    pub pad_to_page: bool,
}

/// Segment LUT (u16 per slot) and overlay-number LUT (u8 per slot), as
/// offsets into the load image rather than the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupTables {
    pub segment_offset: usize,
    pub owner_offset: usize,
    pub entries: usize,
}

impl LookupTables {
    /// Translates file offsets into image offsets of the root module.
    ///
    /// # Errors
    /// Returns `FlattenError::LookupTableOutOfRange` when a position lies inside the header.
    pub fn from_file_positions(params: &FlattenParams, root: &ExeHeader) -> Result<Self, FlattenError> {
        let header_size = root.header_size();
        let to_image = |pos: usize| {
            pos.checked_sub(header_size)
                .ok_or(FlattenError::LookupTableOutOfRange {
                    offset: pos,
                    len: header_size,
                })
        };
        Ok(Self {
            segment_offset: to_image(params.segment_lut_pos)?,
            owner_offset: to_image(params.owner_lut_pos)?,
            entries: params.lut_entries,
        })
    }

    pub(crate) fn check_bounds(&self, len: usize) -> Result<(), FlattenError> {
        let seg_end = self.segment_offset.saturating_add(self.entries.saturating_mul(2));
        let owner_end = self.owner_offset.saturating_add(self.entries);
        if seg_end > len || owner_end > len {
            return Err(self.out_of_range(len));
        }
        Ok(())
    }

    pub(crate) fn out_of_range(&self, len: usize) -> FlattenError {
        let offset = if self.segment_offset.saturating_add(self.entries.saturating_mul(2)) > len {
            self.segment_offset
        } else {
            self.owner_offset
        };
        FlattenError::LookupTableOutOfRange { offset, len }
    }
}

/// Where one overlay landed in the flattened image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub overlay: usize,
    pub paragraph: u16,
    pub image_size: usize,
    pub relocations: usize,
    pub lut_slots: usize,
}

/// A flattened executable, ready to be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flattened {
    pub header: ExeHeader,
    pub relocations: Vec<RelocationEntry>,
    pub image: Vec<u8>,
    pub placements: Vec<Placement>,
    pub call_sites: Vec<CallSite>,
}

impl Flattened {
    /// Encodes header, relocation table, header padding and image.
    ///
    /// # Errors
    /// Returns `FlattenError::AllocationFailure` when the output buffer cannot be reserved.
    pub fn to_bytes(&self, options: FlattenOptions) -> Result<Vec<u8>, FlattenError> {
        let header_bytes = self.header.header_size();
        let mut total = header_bytes + self.image.len();
        if options.pad_to_page {
            total = total.max(self.header.chunk_size());
        }
        let mut out = Vec::new();
        out.try_reserve_exact(total)?;
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&RelocationEntry::encode_table(&self.relocations));
        out.resize(header_bytes, 0);
        out.extend_from_slice(&self.image);
        if options.pad_to_page {
            out.resize(total, 0);
        }
        Ok(out)
    }
}

/// Working state of one flattening run.
struct NewImage {
    relocations: Vec<RelocationEntry>,
    image: Vec<u8>,
    /// Next free paragraph in `image`.
    cursor: u32,
}

/// Places every overlay of `source` after the root's stack, rewriting
/// relocations, segment LUT slots and overlay-manager traps to match.
///
/// Segment arithmetic is 16-bit and assumed not to wrap.
///
/// # Errors
/// `AddressSpaceExhausted` when the overlays do not fit below segment 0xFFFF,
/// `LookupTableOutOfRange` for LUT positions outside the root image,
/// `Format` for a malformed chunk chain, `AllocationFailure` when buffers
/// cannot be reserved.
pub fn flatten(source: &[u8], params: &FlattenParams) -> Result<Flattened, FlattenError> {
    log::info!(
        "seglut @ {:X}, ovllut @ {:X}, entries={:X} ovlbase {:X}:0000",
        params.segment_lut_pos,
        params.owner_lut_pos,
        params.lut_entries,
        params.overlay_base
    );

    let num_overlays = count_overlays(source)?;
    let chunks = parse_overlays(source, num_overlays)?;
    let root = &chunks[0];
    if num_overlays == 0 {
        log::warn!("no overlays found; re-emitting the root module only");
    }

    // Without overlays there is nothing to keep clear of the stack.
    let root_paragraphs = paragraphs_for(root.image_size);
    let start = if num_overlays == 0 {
        root_paragraphs
    } else {
        root.header.stack_top_paragraph().max(root_paragraphs)
    };
    let required = chunks[1..]
        .iter()
        .map(|c| paragraphs_for(c.image_size) + 1)
        .sum::<u32>();
    let available = ADDRESS_SPACE_PARAGRAPHS.saturating_sub(start);
    if required >= available {
        return Err(FlattenError::AddressSpaceExhausted {
            required,
            available,
        });
    }

    let tables = LookupTables::from_file_positions(params, &root.header)?;
    let mut out = allocate(&chunks, start)?;

    out.image[..root.image_size].copy_from_slice(root.image(source)?);
    out.relocations.extend(root.relocations(source)?);
    tables.check_bounds(root.image_size)?;

    let mut placements = Vec::with_capacity(num_overlays);
    for chunk in &chunks[1..] {
        placements.push(place_overlay(&mut out, source, chunk, &tables, params.overlay_base)?);
    }

    let call_sites = patch_call_sites(&mut out.image, &tables);
    log::info!("rewrote {} overlay call site(s)", call_sites.len());

    let header = synthesize_header(&root.header, out.relocations.len(), out.cursor)?;
    Ok(Flattened {
        header,
        relocations: out.relocations,
        image: out.image,
        placements,
        call_sites,
    })
}

fn allocate(chunks: &[OverlayChunk], start: u32) -> Result<NewImage, FlattenError> {
    let image_paragraphs = start
        + chunks[1..]
            .iter()
            .map(|c| paragraphs_for(c.image_size))
            .sum::<u32>();
    let reloc_count = chunks
        .iter()
        .map(|c| usize::from(c.header.num_reloc))
        .sum::<usize>();

    let mut relocations = Vec::new();
    relocations.try_reserve_exact(reloc_count)?;
    let mut image = Vec::new();
    let image_len = image_paragraphs as usize * PARAGRAPH_SIZE;
    image.try_reserve_exact(image_len)?;
    image.resize(image_len, 0);
    Ok(NewImage {
        relocations,
        image,
        cursor: start,
    })
}

fn place_overlay(
    out: &mut NewImage,
    source: &[u8],
    chunk: &OverlayChunk,
    tables: &LookupTables,
    overlay_base: u16,
) -> Result<Placement, FlattenError> {
    let paragraph = u16::try_from(out.cursor).map_err(|_| FlattenError::AddressSpaceExhausted {
        required: out.cursor,
        available: ADDRESS_SPACE_PARAGRAPHS,
    })?;
    let at = out.cursor as usize * PARAGRAPH_SIZE;
    out.image[at..at + chunk.image_size].copy_from_slice(chunk.image(source)?);

    let relocs = chunk.relocations(source)?;
    reloc::retarget_into(&mut out.relocations, &relocs, paragraph, overlay_base);

    let delta = i32::from(paragraph) - i32::from(overlay_base);
    let lut_slots = patch_segment_lut(&mut out.image, tables, chunk.index, delta)?;

    log::info!("mapping OVL_{:X} @ {:X}0 within image", chunk.index, paragraph);
    log::debug!(
        "OVL_{:X}: {} bytes, {} relocation(s), {} LUT slot(s) shifted by {delta:+}",
        chunk.index,
        chunk.image_size,
        relocs.len(),
        lut_slots
    );

    out.cursor += paragraphs_for(chunk.image_size);
    Ok(Placement {
        overlay: chunk.index,
        paragraph,
        image_size: chunk.image_size,
        relocations: relocs.len(),
        lut_slots,
    })
}

/// Derives the output header from the root header: relocation table right
/// after the header, sizes recomputed from the new table and image.
///
/// # Errors
/// Returns `FlattenError::TooManyRelocations` when the table exceeds 65535 entries.
pub fn synthesize_header(
    root: &ExeHeader,
    reloc_count: usize,
    image_paragraphs: u32,
) -> Result<ExeHeader, FlattenError> {
    let num_reloc = u16::try_from(reloc_count)
        .map_err(|_| FlattenError::TooManyRelocations { count: reloc_count })?;
    let header_paragraphs = paragraphs_for(HEADER_SIZE + reloc_count * RELOC_ENTRY_SIZE);
    let total = (header_paragraphs + image_paragraphs) as usize * PARAGRAPH_SIZE;

    let mut header = *root;
    header.reloc_tab_offset = HEADER_SIZE as u16;
    header.num_reloc = num_reloc;
    header.num_para_header = header_paragraphs as u16;
    header.last_page_size = (total % PAGE_SIZE) as u16;
    header.num_pages = u16::try_from(total.div_ceil(PAGE_SIZE)).map_err(|_| {
        FlattenError::AddressSpaceExhausted {
            required: image_paragraphs,
            available: ADDRESS_SPACE_PARAGRAPHS,
        }
    })?;
    Ok(header)
}

/// Writes `payload` to `path`. A partially written file is removed.
///
/// # Errors
/// Returns `FlattenError::OutputWriteFailure` when the file cannot be created or written.
pub fn write_output(path: &Path, payload: &[u8]) -> Result<(), FlattenError> {
    let fail = |source| FlattenError::OutputWriteFailure {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::create(path).map_err(fail)?;
    if let Err(err) = file.write_all(payload).and_then(|()| file.flush()) {
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(fail(err));
    }
    Ok(())
}

/// Flattens `source` and writes the result to `output`. Nothing is written
/// unless flattening succeeds.
///
/// # Errors
/// See [`flatten`] and [`write_output`].
pub fn flatten_to_file(
    source: &[u8],
    params: &FlattenParams,
    options: FlattenOptions,
    output: &Path,
) -> Result<Flattened, FlattenError> {
    let flat = flatten(source, params)?;
    let payload = flat.to_bytes(options)?;
    write_output(output, &payload)?;
    log::info!("wrote {} ({} bytes)", output.display(), payload.len());
    Ok(flat)
}

#[cfg(test)]
mod tests;
