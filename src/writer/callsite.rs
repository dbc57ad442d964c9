use crate::format::mz::{read_u16_le, write_u16_le};

use super::opcode::{OP_CALL_FAR, TRAP_LEN, TRAP_PATTERN};
use super::LookupTables;

/// One `INT 3Fh` trap rewritten into a direct far call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub offset: usize,
    pub overlay_id: u8,
    pub target_offset: u16,
    pub segment: u16,
}

/// Rewrites every overlay-manager trap in `image` into `CALL FAR seg:off`,
/// taking `seg` from the (already patched) segment LUT.
///
/// This is a raw byte match with no notion of instruction boundaries: a
/// `CD 3F` pair inside data is rewritten too. The LUTs must be patched for
/// every overlay before this runs.
pub fn patch_call_sites(image: &mut [u8], tables: &LookupTables) -> Vec<CallSite> {
    let mut sites = Vec::new();
    let mut cur = 0usize;
    while cur + TRAP_LEN < image.len() {
        if image[cur..cur + TRAP_PATTERN.len()] != TRAP_PATTERN {
            cur += 1;
            continue;
        }
        let overlay_id = image[cur + 2];
        let Some(target_offset) = read_u16_le(image, cur + 3) else {
            break;
        };
        let slot = tables.segment_offset + 2 * usize::from(overlay_id);
        let Some(segment) = read_u16_le(image, slot) else {
            log::warn!(
                "trap at {cur:#06x} names overlay id {overlay_id:#04x} whose LUT slot {slot:#x} is outside the image; left as is"
            );
            cur += 1;
            continue;
        };

        image[cur] = OP_CALL_FAR;
        write_u16_le(image, cur + 1, target_offset);
        write_u16_le(image, cur + 3, segment);
        sites.push(CallSite {
            offset: cur,
            overlay_id,
            target_offset,
            segment,
        });
        cur += TRAP_LEN;
    }
    sites
}
