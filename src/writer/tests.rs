use pretty_assertions::assert_eq;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::format::mz::{ExeHeader, RelocationEntry};
use crate::writer::{
    flatten, flatten_to_file, synthesize_header, write_output, FlattenError, FlattenOptions,
    FlattenParams, LookupTables, Placement,
};

const SEG_LUT_IMG: usize = 0x100;
const OWNER_LUT_IMG: usize = 0x110;
const ROOT_TRAP: usize = 0x200;
const OVL2_TRAP: usize = 0x10;

/// Builds one MZ chunk whose load module is exactly `image`.
fn chunk(para_header: u16, relocs: &[(u16, u16)], image: &[u8], ss: u16, sp: u16) -> Vec<u8> {
    let total = usize::from(para_header) * 16 + image.len();
    let hdr = ExeHeader {
        sig_lo: b'M',
        sig_hi: b'Z',
        last_page_size: (total % 512) as u16,
        num_pages: total.div_ceil(512) as u16,
        num_reloc: relocs.len() as u16,
        num_para_header: para_header,
        min_alloc: 0x10,
        max_alloc: 0xffff,
        init_ss: ss,
        init_sp: sp,
        init_ip: 0x0010,
        init_cs: 0x0000,
        reloc_tab_offset: 0x1c,
        ..ExeHeader::default()
    };
    let mut out = vec![0u8; usize::from(hdr.num_pages) * 512];
    out[..28].copy_from_slice(&hdr.to_bytes());
    let table = relocs
        .iter()
        .map(|&(offset, segment)| RelocationEntry { offset, segment })
        .collect::<Vec<_>>();
    let encoded = RelocationEntry::encode_table(&table);
    out[0x1c..0x1c + encoded.len()].copy_from_slice(&encoded);
    let at = usize::from(para_header) * 16;
    out[at..at + image.len()].copy_from_slice(image);
    out
}

fn root_image() -> Vec<u8> {
    let mut img = vec![0u8; 992];
    // segment LUT: three slots all mapped through the overlay window
    img[SEG_LUT_IMG..SEG_LUT_IMG + 6].copy_from_slice(&[0x00, 0x20, 0x00, 0x20, 0x04, 0x20]);
    // owner LUT
    img[OWNER_LUT_IMG..OWNER_LUT_IMG + 3].copy_from_slice(&[1, 2, 1]);
    // INT 3Fh, id 2, offset 0x1234
    img[ROOT_TRAP..ROOT_TRAP + 5].copy_from_slice(&[0xcd, 0x3f, 0x02, 0x34, 0x12]);
    img
}

fn overlayed_exe() -> Vec<u8> {
    let mut file = chunk(2, &[(0x0002, 0x0000)], &root_image(), 0x3c, 0x20);
    file.extend(chunk(3, &[(0x0004, 0x2000), (0x0010, 0x2001)], &[0x11; 48], 0, 0));
    let mut ovl2 = vec![0x22; 480];
    ovl2[OVL2_TRAP..OVL2_TRAP + 5].copy_from_slice(&[0xcd, 0x3f, 0x00, 0x78, 0x56]);
    file.extend(chunk(2, &[], &ovl2, 0, 0));
    file
}

fn params() -> FlattenParams {
    FlattenParams {
        segment_lut_pos: 0x20 + SEG_LUT_IMG,
        owner_lut_pos: 0x20 + OWNER_LUT_IMG,
        lut_entries: 3,
        overlay_base: 0x2000,
    }
}

fn temp_path(tag: &str) -> std::path::PathBuf {
    let uniq = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    std::env::temp_dir().join(format!("mzflat-writer-{tag}-{uniq}.exe"))
}

#[test]
fn places_overlays_above_the_stack() {
    let flat = flatten(&overlayed_exe(), &params()).expect("flatten");
    assert_eq!(
        flat.placements,
        vec![
            Placement {
                overlay: 1,
                paragraph: 0x3e,
                image_size: 48,
                relocations: 2,
                lut_slots: 2
            },
            Placement {
                overlay: 2,
                paragraph: 0x41,
                image_size: 480,
                relocations: 0,
                lut_slots: 1
            },
        ]
    );
    assert_eq!(flat.image.len(), 0x5f * 16);
    assert_eq!(&flat.image[0x3e0..0x410], &[0x11; 48][..]);
    assert_eq!(flat.image[0x410 + 0x20], 0x22);
    // root bytes ahead of the LUT are carried over untouched
    assert_eq!(&flat.image[..0x100], &root_image()[..0x100]);
}

#[test]
fn retargets_overlay_relocations_and_keeps_root_ones() {
    let flat = flatten(&overlayed_exe(), &params()).expect("flatten");
    assert_eq!(
        flat.relocations,
        vec![
            RelocationEntry {
                offset: 0x0002,
                segment: 0x0000
            },
            RelocationEntry {
                offset: 0x0004,
                segment: 0x003e
            },
            RelocationEntry {
                offset: 0x0010,
                segment: 0x003f
            },
        ]
    );
}

#[test]
fn patches_lut_then_rewrites_traps_with_final_segments() {
    let flat = flatten(&overlayed_exe(), &params()).expect("flatten");
    assert_eq!(
        &flat.image[SEG_LUT_IMG..SEG_LUT_IMG + 6],
        &[0x3e, 0x00, 0x41, 0x00, 0x42, 0x00]
    );
    assert_eq!(&flat.image[OWNER_LUT_IMG..OWNER_LUT_IMG + 3], &[1, 2, 1]);
    assert_eq!(
        &flat.image[ROOT_TRAP..ROOT_TRAP + 5],
        &[0x9a, 0x34, 0x12, 0x42, 0x00]
    );
    let ovl2_trap = 0x41 * 16 + OVL2_TRAP;
    assert_eq!(
        &flat.image[ovl2_trap..ovl2_trap + 5],
        &[0x9a, 0x78, 0x56, 0x3e, 0x00]
    );
    assert_eq!(flat.call_sites.len(), 2);
    assert_eq!(flat.call_sites[1].offset, ovl2_trap);
}

#[test]
fn synthesizes_header_from_root() {
    let source = overlayed_exe();
    let flat = flatten(&source, &params()).expect("flatten");
    let root = ExeHeader::parse(&source).expect("root");

    assert_eq!(flat.header.reloc_tab_offset, 0x1c);
    assert_eq!(flat.header.num_reloc, 3);
    assert_eq!(flat.header.num_para_header, 3);
    assert_eq!(flat.header.last_page_size, 32);
    assert_eq!(flat.header.num_pages, 4);
    assert_eq!(flat.header.init_ss, root.init_ss);
    assert_eq!(flat.header.init_sp, root.init_sp);
    assert_eq!(flat.header.init_ip, root.init_ip);
    assert_eq!(flat.header.min_alloc, root.min_alloc);
}

#[test]
fn encodes_output_with_optional_page_padding() {
    let flat = flatten(&overlayed_exe(), &params()).expect("flatten");

    let bytes = flat.to_bytes(FlattenOptions::default()).expect("encode");
    assert_eq!(bytes.len(), 48 + 0x5f * 16);
    assert_eq!(ExeHeader::parse(&bytes).expect("header"), flat.header);
    let relocs = RelocationEntry::parse_table(&bytes, 0x1c, 3).expect("relocs");
    assert_eq!(relocs, flat.relocations);
    assert_eq!(&bytes[0x1c + 12..48], &[0u8; 4]);
    assert_eq!(&bytes[48..], &flat.image[..]);

    let padded = flat
        .to_bytes(FlattenOptions { pad_to_page: true })
        .expect("encode");
    assert_eq!(padded.len(), 4 * 512);
    assert_eq!(&padded[..bytes.len()], &bytes[..]);
    assert!(padded[bytes.len()..].iter().all(|&b| b == 0));
}

#[test]
fn root_only_image_keeps_its_page_counts() {
    let source = chunk(2, &[(0x0002, 0x0000)], &root_image(), 0x3c, 0x20);
    let root = ExeHeader::parse(&source).expect("root");
    let flat = flatten(&source, &params()).expect("flatten");

    assert!(flat.placements.is_empty());
    assert_eq!(flat.header.num_pages, root.num_pages);
    assert_eq!(flat.header.last_page_size, root.last_page_size);
    let bytes = flat.to_bytes(FlattenOptions::default()).expect("encode");
    assert_eq!(bytes.len(), source.len());
}

#[test]
fn root_only_image_with_stack_in_bss_keeps_its_page_counts() {
    let source = chunk(2, &[], &vec![0x90; 608], 0x0000, 0xf000);
    let root = ExeHeader::parse(&source).expect("root");
    let flat = flatten(&source, &params()).expect("flatten");

    assert_eq!(flat.header.num_pages, root.num_pages);
    assert_eq!(flat.header.last_page_size, root.last_page_size);
    assert_eq!(flat.image.len(), 608);
    let bytes = flat.to_bytes(FlattenOptions::default()).expect("encode");
    assert_eq!(bytes.len(), 32 + 608);
}

#[test]
fn overlays_never_overwrite_a_root_image_larger_than_its_stack_top() {
    let mut source = chunk(2, &[(0x0002, 0x0000)], &root_image(), 0, 0);
    source.extend(chunk(2, &[], &[0x33; 16], 0, 0));
    let flat = flatten(&source, &params()).expect("flatten");
    assert_eq!(flat.placements[0].paragraph, 62);
    let mut expected = root_image();
    expected[SEG_LUT_IMG..SEG_LUT_IMG + 2].copy_from_slice(&[0x3e, 0x00]);
    expected[SEG_LUT_IMG + 4..SEG_LUT_IMG + 6].copy_from_slice(&[0x42, 0x00]);
    expected[ROOT_TRAP..ROOT_TRAP + 5].copy_from_slice(&[0x9a, 0x34, 0x12, 0x42, 0x00]);
    assert_eq!(&flat.image[..992], &expected[..]);
    assert_eq!(&flat.image[62 * 16..62 * 16 + 16], &[0x33; 16]);
}

#[test]
fn exhausted_address_space_leaves_no_output() {
    let mut source = chunk(2, &[], &root_image(), 0xfff0, 0x0000);
    source.extend(chunk(2, &[], &[0x44; 480], 0, 0));
    let out = temp_path("exhausted");

    let err = flatten_to_file(&source, &params(), FlattenOptions::default(), &out)
        .expect_err("must not fit");
    assert!(matches!(
        err,
        FlattenError::AddressSpaceExhausted {
            required: 31,
            available: 15
        }
    ));
    assert!(!out.exists());
}

#[test]
fn flatten_to_file_writes_encoded_image() {
    let source = overlayed_exe();
    let out = temp_path("ok");
    let flat = flatten_to_file(&source, &params(), FlattenOptions::default(), &out).expect("flatten");
    let written = std::fs::read(&out).expect("read back");
    assert_eq!(written, flat.to_bytes(FlattenOptions::default()).expect("encode"));
    let _ = std::fs::remove_file(out);
}

#[test]
fn write_failure_reports_path() {
    let out = temp_path("missing-dir").join("out.exe");
    let err = write_output(&out, &[1, 2, 3]).expect_err("no such directory");
    assert!(matches!(err, FlattenError::OutputWriteFailure { .. }));
    assert!(!out.exists());
}

#[test]
fn lut_inside_header_is_rejected() {
    let mut p = params();
    p.segment_lut_pos = 0x10;
    let err = flatten(&overlayed_exe(), &p).expect_err("lut in header");
    assert!(matches!(err, FlattenError::LookupTableOutOfRange { offset: 0x10, .. }));

    // inside the file, but past the root image
    let mut p = params();
    p.owner_lut_pos = 0x20 + 990;
    let err = flatten(&overlayed_exe(), &p).expect_err("lut past root image");
    assert!(matches!(
        err,
        FlattenError::LookupTableOutOfRange {
            offset: 990,
            len: 992
        }
    ));

    let root = ExeHeader::parse(&overlayed_exe()).expect("root");
    assert_eq!(
        LookupTables::from_file_positions(&params(), &root).expect("tables"),
        LookupTables {
            segment_offset: SEG_LUT_IMG,
            owner_offset: OWNER_LUT_IMG,
            entries: 3
        }
    );
}

#[test]
fn rejects_relocation_count_beyond_header_range() {
    let root = ExeHeader::default();
    let err = synthesize_header(&root, 0x1_0000, 1).expect_err("too many");
    assert!(matches!(err, FlattenError::TooManyRelocations { count: 0x1_0000 }));
}
