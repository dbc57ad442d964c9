use std::path::{Path, PathBuf};

use anyhow::{bail, Context};

use crate::catalog::list_chunks;
use crate::cli::{Args, Command};
use crate::image::ExeImage;
use crate::report::{call_site_table, header_table, overlay_table, scan_call_sites};
use crate::writer::{flatten_to_file, FlattenOptions, FlattenParams};

pub fn run(args: Args) -> anyhow::Result<()> {
    let exe = ExeImage::load(&args.input).context("trouble loading executable")?;

    match args.command {
        Command::Header => {
            print!("{}", header_table(&exe.header));
        }
        Command::List => {
            let chunks = list_chunks(&exe.bytes)?;
            print!("{}", overlay_table(&chunks));
        }
        Command::Dump { prefix } => {
            let prefix = prefix.unwrap_or_else(|| args.input.clone());
            let written = dump_chunks(&exe.bytes, &prefix)?;
            log::info!("dumped {} chunk(s)", written.len());
        }
        Command::Calls => {
            print!("{}", call_site_table(&scan_call_sites(&exe.bytes)));
        }
        Command::Unfold {
            seglut_pos,
            ovllut_pos,
            lut_entries,
            ovl_base,
            output,
            pad_page,
        } => {
            let params = unfold_params(&exe, seglut_pos, ovllut_pos, lut_entries, ovl_base)?;
            flatten_to_file(&exe.bytes, &params, FlattenOptions { pad_to_page: pad_page }, &output)
                .with_context(|| format!("cannot unfold {}", args.input.display()))?;
        }
    }
    Ok(())
}

fn unfold_params(
    exe: &ExeImage,
    seglut_pos: u32,
    ovllut_pos: u32,
    lut_entries: u16,
    ovl_base: u16,
) -> anyhow::Result<FlattenParams> {
    let segment_lut_pos = seglut_pos as usize;
    let owner_lut_pos = ovllut_pos as usize;
    if segment_lut_pos > exe.len() {
        bail!("bad args: SEGLUT_POS {seglut_pos:X} is past end of file");
    }
    if owner_lut_pos > exe.len() {
        bail!("bad args: OVLLUT_POS {ovllut_pos:X} is past end of file");
    }
    if ovl_base == 0xffff {
        bail!("bad args: OVL_BASE must be below FFFF");
    }
    Ok(FlattenParams {
        segment_lut_pos,
        owner_lut_pos,
        lut_entries: usize::from(lut_entries),
        overlay_base: ovl_base,
    })
}

/// Writes every chunk verbatim to `<prefix>_XXXX`. The chain is validated
/// before anything is written.
pub fn dump_chunks(bytes: &[u8], prefix: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let chunks = list_chunks(bytes)?;
    let mut written = Vec::with_capacity(chunks.len());
    for c in &chunks {
        let data = bytes
            .get(c.file_offset..c.file_offset + c.chunk_size)
            .with_context(|| format!("chunk {} runs past end of file", c.index))?;
        let mut name = prefix.as_os_str().to_os_string();
        name.push(format!("_{:04X}", c.index));
        let path = PathBuf::from(name);
        std::fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
        log::debug!("wrote {} ({} bytes)", path.display(), data.len());
        written.push(path);
    }
    Ok(written)
}
