use crate::format::FormatError;

pub const HEADER_SIZE: usize = 28;
pub const RELOC_ENTRY_SIZE: usize = 4;
pub const PARAGRAPH_SIZE: usize = 16;
pub const PAGE_SIZE: usize = 512;

/// `reloc_tab_offset` value that marks a segmented "new" executable.
const NEW_EXE_RELOC_OFFSET: u16 = 0x40;

/// Fixed 28-byte MZ header. Field order matches the on-disk layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExeHeader {
    pub sig_lo: u8,
    pub sig_hi: u8,
    pub last_page_size: u16,
    pub num_pages: u16,
    pub num_reloc: u16,
    pub num_para_header: u16,
    pub min_alloc: u16,
    pub max_alloc: u16,
    pub init_ss: u16,
    pub init_sp: u16,
    pub checksum: u16,
    pub init_ip: u16,
    pub init_cs: u16,
    pub reloc_tab_offset: u16,
    pub overlay_num: u16,
}

impl ExeHeader {
    /// Decodes the header at the start of `input` without validating it.
    ///
    /// # Errors
    /// Returns `FormatError::TruncatedImage` when fewer than 28 bytes are available.
    pub fn parse(input: &[u8]) -> Result<Self, FormatError> {
        Self::parse_at(input, 0)
    }

    /// Decodes the header located at `offset` inside `input`.
    ///
    /// # Errors
    /// Returns `FormatError::TruncatedImage` when the header crosses the end of `input`.
    pub fn parse_at(input: &[u8], offset: usize) -> Result<Self, FormatError> {
        let mut reader = Reader::at(input, offset);
        Ok(Self {
            sig_lo: reader.read_u8()?,
            sig_hi: reader.read_u8()?,
            last_page_size: reader.read_u16_le()?,
            num_pages: reader.read_u16_le()?,
            num_reloc: reader.read_u16_le()?,
            num_para_header: reader.read_u16_le()?,
            min_alloc: reader.read_u16_le()?,
            max_alloc: reader.read_u16_le()?,
            init_ss: reader.read_u16_le()?,
            init_sp: reader.read_u16_le()?,
            checksum: reader.read_u16_le()?,
            init_ip: reader.read_u16_le()?,
            init_cs: reader.read_u16_le()?,
            reloc_tab_offset: reader.read_u16_le()?,
            overlay_num: reader.read_u16_le()?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.sig_lo;
        out[1] = self.sig_hi;
        let words = [
            self.last_page_size,
            self.num_pages,
            self.num_reloc,
            self.num_para_header,
            self.min_alloc,
            self.max_alloc,
            self.init_ss,
            self.init_sp,
            self.checksum,
            self.init_ip,
            self.init_cs,
            self.reloc_tab_offset,
            self.overlay_num,
        ];
        for (i, w) in words.iter().enumerate() {
            let at = 2 + i * 2;
            out[at..at + 2].copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    #[must_use]
    pub fn has_signature(&self) -> bool {
        self.sig_lo == b'M' && self.sig_hi == b'Z'
    }

    /// Checks that this header describes a plain MZ chunk.
    ///
    /// # Errors
    /// `MalformedOverlay` on a bad signature, `UnsupportedFormat` for new-style executables.
    pub fn validate(&self, index: usize, offset: usize) -> Result<(), FormatError> {
        if !self.has_signature() {
            return Err(FormatError::MalformedOverlay { index, offset });
        }
        if self.reloc_tab_offset == NEW_EXE_RELOC_OFFSET {
            return Err(FormatError::UnsupportedFormat);
        }
        Ok(())
    }

    /// Size of the whole chunk in the file (`num_pages` pages).
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        usize::from(self.num_pages) * PAGE_SIZE
    }

    /// Size of header plus relocation table.
    #[must_use]
    pub fn header_size(&self) -> usize {
        usize::from(self.num_para_header) * PARAGRAPH_SIZE
    }

    /// Load-module size: chunk size minus header minus the unused tail of the last page.
    /// `None` when the header claims more bytes than the chunk holds.
    #[must_use]
    pub fn load_module_size(&self) -> Option<usize> {
        let unused_tail = if self.last_page_size == 0 {
            0
        } else {
            PAGE_SIZE.checked_sub(usize::from(self.last_page_size))?
        };
        self.chunk_size()
            .checked_sub(self.header_size())?
            .checked_sub(unused_tail)
    }

    /// First paragraph above the initial stack, relative to the image base.
    #[must_use]
    pub fn stack_top_paragraph(&self) -> u32 {
        u32::from(self.init_ss) + paragraphs_for(usize::from(self.init_sp))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    pub offset: u16,
    pub segment: u16,
}

impl RelocationEntry {
    /// Decodes `count` consecutive entries starting at `offset`.
    ///
    /// # Errors
    /// Returns `FormatError::TruncatedImage` when the table crosses the end of `input`.
    pub fn parse_table(input: &[u8], offset: usize, count: usize) -> Result<Vec<Self>, FormatError> {
        let mut reader = Reader::at(input, offset);
        reader.ensure(count * RELOC_ENTRY_SIZE)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = reader.read_u16_le()?;
            let segment = reader.read_u16_le()?;
            entries.push(Self { offset, segment });
        }
        Ok(entries)
    }

    #[must_use]
    pub fn encode_table(entries: &[Self]) -> Vec<u8> {
        let mut out = Vec::with_capacity(entries.len() * RELOC_ENTRY_SIZE);
        for e in entries {
            out.extend_from_slice(&e.offset.to_le_bytes());
            out.extend_from_slice(&e.segment.to_le_bytes());
        }
        out
    }
}

/// Number of 16-byte paragraphs needed to hold `bytes`.
#[must_use]
pub fn paragraphs_for(bytes: usize) -> u32 {
    u32::try_from(bytes.div_ceil(PARAGRAPH_SIZE)).unwrap_or(u32::MAX)
}

#[must_use]
pub fn read_u16_le(bytes: &[u8], at: usize) -> Option<u16> {
    let b = bytes.get(at..at.checked_add(2)?)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

/// Stores `value` at `at`; returns `false` without writing when out of bounds.
pub fn write_u16_le(bytes: &mut [u8], at: usize, value: u16) -> bool {
    let Some(end) = at.checked_add(2) else {
        return false;
    };
    match bytes.get_mut(at..end) {
        Some(dst) => {
            dst.copy_from_slice(&value.to_le_bytes());
            true
        }
        None => false,
    }
}

struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn at(input: &'a [u8], pos: usize) -> Self {
        Self { input, pos }
    }

    fn ensure(&self, size: usize) -> Result<(), FormatError> {
        let available = self.input.len().saturating_sub(self.pos);
        if size > available {
            return Err(FormatError::TruncatedImage {
                offset: self.pos,
                needed: size,
                available,
            });
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16_le(&mut self) -> Result<u16, FormatError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_bytes(&mut self, size: usize) -> Result<&'a [u8], FormatError> {
        self.ensure(size)?;
        let begin = self.pos;
        self.pos += size;
        Ok(&self.input[begin..self.pos])
    }
}
