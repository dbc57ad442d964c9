use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Numbers on the command line are hexadecimal, with or without a `0x` prefix.
fn parse_hex_u32(input: &str) -> Result<u32, String> {
    let s = input.trim();
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex value '{input}': {e}"))
}

fn parse_hex_u16(input: &str) -> Result<u16, String> {
    let v = parse_hex_u32(input)?;
    u16::try_from(v).map_err(|_| format!("hex value '{input}' exceeds 0xFFFF"))
}

#[derive(Debug, Parser)]
#[command(name = "mzflat", version, about = "Inspect and flatten overlayed DOS executables")]
pub struct Args {
    #[arg(value_name = "EXEFILE")]
    pub input: PathBuf,

    #[arg(long = "verbose", short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the root header
    #[command(alias = "h")]
    Header,

    /// List overlays and their headers
    #[command(alias = "l")]
    List,

    /// Dump every chunk to <PREFIX>_XXXX
    #[command(alias = "d")]
    Dump {
        /// Defaults to the input file name
        #[arg(long = "prefix")]
        prefix: Option<PathBuf>,
    },

    /// List all INT 3Fh call sites without changing anything
    #[command(alias = "c")]
    Calls,

    /// Unfold overlays into one monolithic executable
    #[command(alias = "u")]
    Unfold {
        /// File offset of the overlay segment LUT
        #[arg(value_name = "SEGLUT_POS", value_parser = parse_hex_u32)]
        seglut_pos: u32,

        /// File offset of the overlay number LUT
        #[arg(value_name = "OVLLUT_POS", value_parser = parse_hex_u32)]
        ovllut_pos: u32,

        /// Number of entries in each LUT
        #[arg(value_name = "LUT_ENTRIES", value_parser = parse_hex_u16)]
        lut_entries: u16,

        /// Segment the overlays were loaded at, relative to image base
        #[arg(value_name = "OVL_BASE", value_parser = parse_hex_u16)]
        ovl_base: u16,

        #[arg(short = 'o', long = "output", default_value = "test.ex_")]
        output: PathBuf,

        /// Zero-fill the output to a whole number of 512-byte pages
        #[arg(long = "pad-page")]
        pad_page: bool,
    },
}
