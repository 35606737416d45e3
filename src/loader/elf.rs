//! Static ELF64 executable loader.
//!
//! The image is untrusted: every header field is validated before it is used,
//! and all address arithmetic goes through [`crate::arith`].
//!
//! ## ELF64 header (64 bytes)
//!
//! ```text
//! 0x00: e_ident[16]   magic, class, data, version, ...
//! 0x10: e_type        u16
//! 0x12: e_machine     u16
//! 0x14: e_version     u32
//! 0x18: e_entry       u64
//! 0x20: e_phoff       u64
//! 0x28: e_shoff       u64
//! 0x30: e_flags       u32
//! 0x34: e_ehsize      u16
//! 0x36: e_phentsize   u16
//! 0x38: e_phnum       u16
//! ```

use crate::arith;
use crate::error::LoadError;
use crate::memory::GuestMemory;

pub const ELF_MAGIC: [u8; 4] = *b"\x7fELF";
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u32 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_AARCH64: u16 = 183;

pub const PT_LOAD: u32 = 1;
pub const PT_NOTE: u32 = 4;

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

fn u16_at(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn u32_at(data: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[off..off + 4]);
    u32::from_le_bytes(b)
}

fn u64_at(data: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Validated ELF64 file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    pub entry: u64,
    pub phoff: u64,
    pub phnum: u16,
}

impl ElfHeader {
    /// Parse and validate the file header of `elf`.
    ///
    /// Checks identity first (magic, class, byte order, version), then the
    /// internal sizes, then that the file is an aarch64 static executable.
    pub fn parse(elf: &[u8]) -> Result<Self, LoadError> {
        if elf.len() < EHDR_SIZE {
            return Err(LoadError::TooSmall(elf.len()));
        }
        if elf[..4] != ELF_MAGIC {
            return Err(LoadError::BadMagic);
        }
        if elf[EI_CLASS] != ELFCLASS64 {
            return Err(LoadError::BadClass(elf[EI_CLASS]));
        }
        if elf[EI_DATA] != ELFDATA2LSB {
            return Err(LoadError::BadEndianness(elf[EI_DATA]));
        }
        let version = u32_at(elf, 0x14);
        if version != EV_CURRENT {
            return Err(LoadError::BadVersion(version));
        }

        let ehsize = u16_at(elf, 0x34);
        if ehsize as usize != EHDR_SIZE {
            return Err(LoadError::BadHeaderSize(ehsize));
        }
        let phnum = u16_at(elf, 0x38);
        if phnum < 1 {
            return Err(LoadError::NoProgramHeaders);
        }
        let phentsize = u16_at(elf, 0x36);
        if phentsize as usize != PHDR_SIZE {
            return Err(LoadError::BadProgramHeaderSize(phentsize));
        }

        let e_type = u16_at(elf, 0x10);
        if e_type != ET_EXEC {
            return Err(LoadError::NotExecutable(e_type));
        }
        let machine = u16_at(elf, 0x12);
        if machine != EM_AARCH64 {
            return Err(LoadError::BadMachine(machine));
        }

        Ok(Self {
            entry: u64_at(elf, 0x18),
            phoff: u64_at(elf, 0x20),
            phnum,
        })
    }

    /// Parse the program header table, which must lie entirely inside `elf`.
    pub fn program_headers(&self, elf: &[u8]) -> Result<Vec<ProgramHeader>, LoadError> {
        let table_len = self.phnum as u64 * PHDR_SIZE as u64;
        let table_end = arith::checked_add(self.phoff, table_len)
            .ok_or(LoadError::ProgramHeadersOutOfBounds)?;
        if table_end > elf.len() as u64 {
            return Err(LoadError::ProgramHeadersOutOfBounds);
        }

        Ok((0..self.phnum as usize)
            .map(|i| ProgramHeader::parse(elf, self.phoff as usize + i * PHDR_SIZE))
            .collect())
    }
}

/// One entry of the program header table.
///
/// ```text
/// 0x00: p_type    u32
/// 0x04: p_flags   u32
/// 0x08: p_offset  u64
/// 0x10: p_vaddr   u64
/// 0x18: p_paddr   u64
/// 0x20: p_filesz  u64
/// 0x28: p_memsz   u64
/// 0x30: p_align   u64
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl ProgramHeader {
    fn parse(elf: &[u8], off: usize) -> Self {
        Self {
            p_type: u32_at(elf, off),
            flags: u32_at(elf, off + 0x04),
            offset: u64_at(elf, off + 0x08),
            vaddr: u64_at(elf, off + 0x10),
            filesz: u64_at(elf, off + 0x20),
            memsz: u64_at(elf, off + 0x28),
            align: u64_at(elf, off + 0x30),
        }
    }

    /// File bytes of the segment, if they lie inside `elf`.
    pub fn file_range(&self, elf: &[u8]) -> Option<std::ops::Range<usize>> {
        let end = arith::checked_add(self.offset, self.filesz)?;
        if end > elf.len() as u64 {
            return None;
        }
        Some(self.offset as usize..end as usize)
    }
}

/// Where a loaded executable starts and how far it reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadResult {
    /// Validated program entry point.
    pub entry: u64,
    /// Highest guest address occupied by the program, aligned up.
    pub end: u64,
}

/// Load the `PT_LOAD` segments of `elf` into guest memory.
///
/// Segments must sit at or above `min_load` and end at or below `mem_size`
/// (further capped by the size of `mem`). Empty segments are skipped. On a
/// failure in a later segment, earlier segments stay written.
pub fn load(
    elf: &[u8],
    mem: &mut GuestMemory,
    mem_size: u64,
    min_load: u64,
) -> Result<LoadResult, LoadError> {
    let limit = mem_size.min(mem.size() as u64);
    let header = ElfHeader::parse(elf)?;

    if header.entry < min_load || header.entry >= limit {
        return Err(LoadError::EntryOutOfRange(header.entry));
    }

    let phdrs = header.program_headers(elf)?;
    let mut end = 0u64;
    let mut last_vaddr = 0u64;

    for (index, ph) in phdrs.iter().enumerate() {
        if ph.p_type != PT_LOAD || ph.filesz == 0 {
            continue;
        }

        if ph.vaddr < min_load {
            return Err(LoadError::SegmentBelowMinimum { index, vaddr: ph.vaddr });
        }
        if ph.vaddr < last_vaddr {
            return Err(LoadError::UnsortedSegments { index });
        }
        last_vaddr = ph.vaddr;

        let start = arith::align_down(ph.vaddr, ph.align)
            .ok_or(LoadError::BadAlignment { index, align: ph.align })?;
        if start < min_load {
            return Err(LoadError::SegmentBelowMinimum { index, vaddr: start });
        }
        if start < end {
            return Err(LoadError::OverlappingSegments { index });
        }

        if ph.vaddr >= limit {
            return Err(LoadError::SegmentOutOfRange { index });
        }
        let file_end =
            arith::checked_add(ph.vaddr, ph.filesz).ok_or(LoadError::AddressOverflow { index })?;
        if file_end > limit {
            return Err(LoadError::SegmentOutOfRange { index });
        }

        if ph.memsz < ph.filesz {
            return Err(LoadError::MemSizeBelowFileSize { index });
        }
        let seg_end = arith::checked_add(ph.vaddr, ph.memsz)
            .and_then(|e| arith::align_up(e, ph.align))
            .ok_or(LoadError::AddressOverflow { index })?;
        if seg_end > limit {
            return Err(LoadError::SegmentOutOfRange { index });
        }

        let data = ph
            .file_range(elf)
            .map(|range| &elf[range])
            .ok_or(LoadError::SegmentDataOutOfBounds { index })?;

        end = end.max(seg_end);

        mem.write(ph.vaddr, data)
            .and_then(|()| mem.fill(file_end, (ph.memsz - ph.filesz) as usize, 0))
            .map_err(|_| LoadError::SegmentOutOfRange { index })?;

        log::debug!(
            "segment {}: vaddr=0x{:x} filesz=0x{:x} memsz=0x{:x} align=0x{:x}",
            index,
            ph.vaddr,
            ph.filesz,
            ph.memsz,
            ph.align
        );
    }

    Ok(LoadResult {
        entry: header.entry,
        end,
    })
}
