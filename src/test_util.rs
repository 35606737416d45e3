//! Synthetic guest executables for unit tests.

use crate::boot::manifest::{MFT_ENTRY_SIZE, MFT_NAME_SIZE, MFT_RESERVED_FIRST, MFT_VERSION};
use crate::loader::elf::{
    EHDR_SIZE, ELFCLASS64, ELFDATA2LSB, ELF_MAGIC, EM_AARCH64, ET_EXEC, EV_CURRENT, PHDR_SIZE,
    PT_LOAD, PT_NOTE,
};
use crate::loader::note::{ABI1_NOTE_ALIGN, ABI1_NOTE_TYPE, MFT1_NOTE_ALIGN, MFT1_NOTE_TYPE};

struct Segment {
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
    align: u64,
}

struct Note {
    name: Vec<u8>,
    n_type: u32,
    desc: Vec<u8>,
    /// Descriptor alignment, `None` for foreign notes.
    align: Option<u64>,
}

/// Builds a little-endian aarch64 `ET_EXEC` image.
///
/// File layout: ELF header, program headers (load segments first, then one
/// `PT_NOTE` if any notes were added), note data, segment data. Segment data
/// always ends the file.
pub(crate) struct ElfBuilder {
    entry: u64,
    segments: Vec<Segment>,
    notes: Vec<Note>,
}

fn pad_to(buf: &mut Vec<u8>, align: usize) {
    while buf.len() % align != 0 {
        buf.push(0);
    }
}

impl ElfBuilder {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            segments: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn segment(mut self, vaddr: u64, data: &[u8], memsz: u64, align: u64) -> Self {
        self.segments.push(Segment {
            vaddr,
            data: data.to_vec(),
            memsz,
            align,
        });
        self
    }

    /// Solo5 note with the descriptor aligned to `align` within the file.
    pub fn note(mut self, n_type: u32, desc: &[u8], align: u64) -> Self {
        self.notes.push(Note {
            name: b"Solo5\0".to_vec(),
            n_type,
            desc: desc.to_vec(),
            align: Some(align),
        });
        self
    }

    /// Note owned by someone else.
    pub fn raw_note(mut self, name: &[u8], n_type: u32, desc: &[u8]) -> Self {
        self.notes.push(Note {
            name: name.to_vec(),
            n_type,
            desc: desc.to_vec(),
            align: None,
        });
        self
    }

    pub fn abi_note(self, target: u32, version: u32) -> Self {
        let mut desc = target.to_le_bytes().to_vec();
        desc.extend_from_slice(&version.to_le_bytes());
        self.note(ABI1_NOTE_TYPE, &desc, ABI1_NOTE_ALIGN)
    }

    /// Well-formed manifest with the reserved first entry prepended.
    pub fn manifest(self, devices: &[(&str, u32)]) -> Self {
        let mut entries = vec![("", MFT_RESERVED_FIRST)];
        entries.extend_from_slice(devices);
        let desc = mft_descriptor(&entries);
        self.note(MFT1_NOTE_TYPE, &desc, MFT1_NOTE_ALIGN)
    }

    /// Notes a guest needs to pass setup.
    pub fn solo5(self, devices: &[(&str, u32)]) -> Self {
        self.abi_note(1, 2).manifest(devices)
    }

    fn note_bytes(&self, base: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for note in &self.notes {
            let name_len = note.name.len();
            let mut body = note.name.clone();
            pad_to(&mut body, 4);
            let mut padding = 0;
            if let Some(align) = note.align {
                let name_end = base + out.len() + 12 + body.len();
                let start = (name_end + align as usize - 1) & !(align as usize - 1);
                padding = start - name_end;
            }
            let descsz = padding + note.desc.len();

            out.extend_from_slice(&(name_len as u32).to_le_bytes());
            out.extend_from_slice(&(descsz as u32).to_le_bytes());
            out.extend_from_slice(&note.n_type.to_le_bytes());
            out.extend_from_slice(&body);
            out.extend(std::iter::repeat(0).take(padding));
            out.extend_from_slice(&note.desc);
            pad_to(&mut out, 4);
        }
        out
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len() + usize::from(!self.notes.is_empty());
        let mut image = vec![0u8; EHDR_SIZE + phnum * PHDR_SIZE];

        image[..4].copy_from_slice(&ELF_MAGIC);
        image[4] = ELFCLASS64;
        image[5] = ELFDATA2LSB;
        image[6] = 1;
        image[0x10..0x12].copy_from_slice(&ET_EXEC.to_le_bytes());
        image[0x12..0x14].copy_from_slice(&EM_AARCH64.to_le_bytes());
        image[0x14..0x18].copy_from_slice(&EV_CURRENT.to_le_bytes());
        image[0x18..0x20].copy_from_slice(&self.entry.to_le_bytes());
        image[0x20..0x28].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        image[0x34..0x36].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        image[0x36..0x38].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        image[0x38..0x3a].copy_from_slice(&(phnum as u16).to_le_bytes());

        let mut phdrs = Vec::new();

        if !self.notes.is_empty() {
            pad_to(&mut image, 8);
            let offset = image.len();
            let notes = self.note_bytes(offset);
            image.extend_from_slice(&notes);
            phdrs.push((PT_NOTE, offset as u64, 0, notes.len() as u64, notes.len() as u64, 8));
        }

        let mut load = Vec::new();
        for seg in &self.segments {
            pad_to(&mut image, 16);
            let offset = image.len();
            image.extend_from_slice(&seg.data);
            load.push((
                PT_LOAD,
                offset as u64,
                seg.vaddr,
                seg.data.len() as u64,
                seg.memsz,
                seg.align,
            ));
        }
        // Load segments come first in the table
        load.extend(phdrs);

        for (i, (p_type, offset, vaddr, filesz, memsz, align)) in load.into_iter().enumerate() {
            let ph = EHDR_SIZE + i * PHDR_SIZE;
            image[ph..ph + 4].copy_from_slice(&p_type.to_le_bytes());
            image[ph + 4..ph + 8].copy_from_slice(&4u32.to_le_bytes());
            image[ph + 0x08..ph + 0x10].copy_from_slice(&offset.to_le_bytes());
            image[ph + 0x10..ph + 0x18].copy_from_slice(&vaddr.to_le_bytes());
            image[ph + 0x18..ph + 0x20].copy_from_slice(&vaddr.to_le_bytes());
            image[ph + 0x20..ph + 0x28].copy_from_slice(&filesz.to_le_bytes());
            image[ph + 0x28..ph + 0x30].copy_from_slice(&memsz.to_le_bytes());
            image[ph + 0x30..ph + 0x38].copy_from_slice(&align.to_le_bytes());
        }

        image
    }

    /// File offset of the note segment's data in a built image.
    pub fn note_offset(image: &[u8]) -> usize {
        let phnum = u16::from_le_bytes([image[0x38], image[0x39]]) as usize;
        (0..phnum)
            .map(|i| EHDR_SIZE + i * PHDR_SIZE)
            .find(|&ph| image[ph..ph + 4] == PT_NOTE.to_le_bytes())
            .map(|ph| {
                let mut off = [0u8; 8];
                off.copy_from_slice(&image[ph + 8..ph + 16]);
                u64::from_le_bytes(off) as usize
            })
            .expect("image has no note segment")
    }
}

/// Raw manifest descriptor with exactly the given entries.
pub(crate) fn mft_descriptor(entries: &[(&str, u32)]) -> Vec<u8> {
    let mut desc = Vec::new();
    desc.extend_from_slice(&MFT_VERSION.to_le_bytes());
    desc.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (name, kind) in entries {
        let mut entry = vec![0u8; MFT_ENTRY_SIZE];
        let len = name.len().min(MFT_NAME_SIZE);
        entry[..len].copy_from_slice(&name.as_bytes()[..len]);
        entry[MFT_NAME_SIZE..MFT_NAME_SIZE + 4].copy_from_slice(&kind.to_le_bytes());
        desc.extend_from_slice(&entry);
    }
    desc
}
