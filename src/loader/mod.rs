//! Guest executable loading.
//!
//! This module handles loading static aarch64 ELF executables and the Solo5
//! notes they carry.

pub mod elf;
pub mod note;

pub use elf::{load, ElfHeader, LoadResult, ProgramHeader};
pub use note::{
    load_note, ABI1_NOTE_ALIGN, ABI1_NOTE_MAX_SIZE, ABI1_NOTE_TYPE, MFT1_NOTE_ALIGN,
    MFT1_NOTE_TYPE,
};
