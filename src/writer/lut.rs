use crate::format::mz::{read_u16_le, write_u16_le};

use super::{FlattenError, LookupTables};

/// Adds `delta` paragraphs to every segment-LUT slot owned by `overlay`.
/// Returns how many slots changed. Applying it twice shifts twice.
///
/// # Errors
/// Returns `FlattenError::LookupTableOutOfRange` when either table does not fit in `image`.
pub fn patch_segment_lut(
    image: &mut [u8],
    tables: &LookupTables,
    overlay: usize,
    delta: i32,
) -> Result<usize, FlattenError> {
    tables.check_bounds(image.len())?;
    // Owner bytes are u8; higher overlay numbers cannot own a slot.
    let Ok(owner) = u8::try_from(overlay) else {
        return Ok(0);
    };

    let mut patched = 0;
    for slot in 0..tables.entries {
        if image[tables.owner_offset + slot] != owner {
            continue;
        }
        let at = tables.segment_offset + 2 * slot;
        let Some(seg) = read_u16_le(image, at) else {
            return Err(tables.out_of_range(image.len()));
        };
        write_u16_le(image, at, shift_segment(seg, delta));
        patched += 1;
    }
    Ok(patched)
}

/// Segment arithmetic is 16-bit; a shift that wraps is outside the supported input.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn shift_segment(seg: u16, delta: i32) -> u16 {
    (i32::from(seg) + delta) as u16
}
