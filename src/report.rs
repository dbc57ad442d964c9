use std::fmt::Write as _;

use crate::catalog::OverlayChunk;
use crate::format::mz::{read_u16_le, ExeHeader};
use crate::writer::opcode::{TRAP_LEN, TRAP_PATTERN};

/// Overlay-manager trap found in the raw file, reported without rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapSite {
    pub file_offset: usize,
    pub overlay_id: u8,
    pub call_offset: u16,
}

/// Tab-separated dump of a single header.
#[must_use]
pub fn header_table(hdr: &ExeHeader) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "bytes lastpage\tFile pages (512B)\t# relocs\tOffset to load image (parags)\t\
         Minimum alloc (parags)\tMaximum alloc (parags)\tInitial SS:SP\tInitial CS:IP\tOverlay #\t"
    );
    let _ = writeln!(
        out,
        "{:04X}\t{:04X}\t{:04X}\t{:04X}\t{:04X}\t{:04X}\t{:04X}:{:04X}\t{:04X}:{:04X}\t{:04X}",
        hdr.last_page_size,
        hdr.num_pages,
        hdr.num_reloc,
        hdr.num_para_header,
        hdr.min_alloc,
        hdr.max_alloc,
        hdr.init_ss,
        hdr.init_sp,
        hdr.init_cs,
        hdr.init_ip,
        hdr.overlay_num
    );
    out
}

/// One row per chunk: position, image size and the interesting header fields.
#[must_use]
pub fn overlay_table(chunks: &[OverlayChunk]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "OVL #\tstart(file ofs)\timg siz\t# relocs\tOffset to load image (parags)\t\
         Minimum alloc (parags)\tMaximum alloc (parags)\tInitial SS:SP\tInitial CS:IP\t"
    );
    for c in chunks {
        let h = &c.header;
        let _ = writeln!(
            out,
            "{:04X}\t{:08X}\t{:08X}\t{:04X}\t{:04X}\t{:04X}\t{:04X}\t{:04X}:{:04X}\t{:04X}:{:04X}",
            c.index,
            c.file_offset,
            c.image_size,
            h.num_reloc,
            h.num_para_header,
            h.min_alloc,
            h.max_alloc,
            h.init_ss,
            h.init_sp,
            h.init_cs,
            h.init_ip
        );
    }
    out
}

/// Finds every `CD 3F` pair followed by room for its 3 operand bytes.
/// Plain byte matching: expect spurious hits inside data.
#[must_use]
pub fn scan_call_sites(bytes: &[u8]) -> Vec<TrapSite> {
    bytes
        .windows(TRAP_LEN)
        .enumerate()
        .filter(|(_, w)| w.starts_with(&TRAP_PATTERN))
        .filter_map(|(file_offset, w)| {
            Some(TrapSite {
                file_offset,
                overlay_id: w[2],
                call_offset: read_u16_le(w, 3)?,
            })
        })
        .collect()
}

#[must_use]
pub fn call_site_table(sites: &[TrapSite]) -> String {
    let mut out = String::from("file_ofs\tovl_idx\toffs\n");
    for s in sites {
        let _ = writeln!(out, "{:04X}\t{:02X}\t{:04X}", s.file_offset, s.overlay_id, s.call_offset);
    }
    out
}
