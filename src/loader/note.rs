//! Solo5 vendor notes embedded in the guest executable.
//!
//! Notes live in `PT_NOTE` segments. Each entry is laid out as:
//!
//! ```text
//! 0x00: n_namesz  u32   (6 for "Solo5\0")
//! 0x04: n_descsz  u32   (padding before the descriptor + descriptor)
//! 0x08: n_type    u32
//! 0x0c: n_name    "Solo5\0" padded to 8 bytes
//! 0x14: padding up to the descriptor alignment, then the descriptor
//! ```
//!
//! Entries follow one another at 4-byte granularity.

use crate::arith;
use crate::error::NoteError;

use super::elf::{ElfHeader, PT_NOTE};

pub const SOLO5_NOTE_NAME: &[u8] = b"Solo5\0";

/// ABI descriptor note type ("ABI1").
pub const ABI1_NOTE_TYPE: u32 = 0x3149_4241;
pub const ABI1_NOTE_ALIGN: u64 = 4;
pub const ABI1_NOTE_MAX_SIZE: u64 = 8;

/// Device manifest note type ("MFT1").
pub const MFT1_NOTE_TYPE: u32 = 0x3154_464d;
pub const MFT1_NOTE_ALIGN: u64 = 8;

const NHDR_SIZE: u64 = 12;
/// Note header plus the padded "Solo5" name.
const SOLO5_NHDR_SIZE: u64 = NHDR_SIZE + 8;

fn u32_at(data: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[off..off + 4]);
    u32::from_le_bytes(b)
}

fn align4(value: u64) -> Option<u64> {
    arith::align_up(value, 4)
}

/// Extract the descriptor of the Solo5 note of type `note_type`.
///
/// The descriptor must start at `align` within the file and may not exceed
/// `max_size` bytes. The first matching note is returned.
pub fn load_note(
    elf: &[u8],
    note_type: u32,
    align: u64,
    max_size: u64,
) -> Result<Vec<u8>, NoteError> {
    if !arith::is_valid_alignment(align) {
        return Err(NoteError::Malformed("descriptor alignment is not a power of two"));
    }

    let header = ElfHeader::parse(elf)?;
    let phdrs = header.program_headers(elf)?;

    for ph in phdrs.iter().filter(|ph| ph.p_type == PT_NOTE) {
        let range = ph
            .file_range(elf)
            .ok_or(NoteError::Malformed("note segment outside the image"))?;
        let seg_end = range.end as u64;
        let mut offset = range.start as u64;

        while offset < seg_end {
            let hdr_end = arith::checked_add(offset, NHDR_SIZE).ok_or(NoteError::Overflow)?;
            if hdr_end > seg_end {
                return Err(NoteError::Malformed("note header truncated"));
            }
            let namesz = u32_at(elf, offset as usize) as u64;
            let descsz = u32_at(elf, offset as usize + 4) as u64;
            let n_type = u32_at(elf, offset as usize + 8);

            let is_solo5 = namesz == SOLO5_NOTE_NAME.len() as u64
                && offset + SOLO5_NHDR_SIZE <= seg_end
                && &elf[hdr_end as usize..hdr_end as usize + SOLO5_NOTE_NAME.len()]
                    == SOLO5_NOTE_NAME;

            if is_solo5 && n_type == note_type {
                return descriptor(elf, offset, descsz, seg_end, align, max_size);
            }

            let next = align4(namesz)
                .zip(align4(descsz))
                .and_then(|(n, d)| arith::checked_add(n, d))
                .and_then(|len| arith::checked_add(hdr_end, len))
                .ok_or(NoteError::Overflow)?;
            offset = next;
        }
    }

    Err(NoteError::NotFound(note_type))
}

fn descriptor(
    elf: &[u8],
    offset: u64,
    descsz: u64,
    seg_end: u64,
    align: u64,
    max_size: u64,
) -> Result<Vec<u8>, NoteError> {
    let name_end = offset + SOLO5_NHDR_SIZE;
    let start = arith::align_up(name_end, align).ok_or(NoteError::Overflow)?;
    let padding = start - name_end;
    if descsz < padding {
        return Err(NoteError::Malformed("descriptor shorter than its alignment padding"));
    }

    let size = descsz - padding;
    if size > max_size {
        return Err(NoteError::TooLarge { size, max: max_size });
    }
    let end = arith::checked_add(start, size).ok_or(NoteError::Overflow)?;
    if end > seg_end {
        return Err(NoteError::Malformed("descriptor extends past the note segment"));
    }

    Ok(elf[start as usize..end as usize].to_vec())
}
