use crate::format::mz::RelocationEntry;

/// Rebases one overlay's relocation entries from `original_base` to
/// `displacement` (both in paragraphs). Offsets are kept, only the segment moves.
///
/// The shift is done in 16-bit arithmetic; callers guarantee it does not wrap.
#[must_use]
pub fn retarget(entries: &[RelocationEntry], displacement: u16, original_base: u16) -> Vec<RelocationEntry> {
    let mut out = Vec::with_capacity(entries.len());
    retarget_into(&mut out, entries, displacement, original_base);
    out
}

pub(super) fn retarget_into(
    out: &mut Vec<RelocationEntry>,
    entries: &[RelocationEntry],
    displacement: u16,
    original_base: u16,
) {
    out.extend(entries.iter().map(|e| RelocationEntry {
        offset: e.offset,
        segment: e.segment.wrapping_sub(original_base).wrapping_add(displacement),
    }));
}
