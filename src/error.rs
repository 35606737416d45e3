//! Error types for hvtvmm.

use thiserror::Error;

use crate::arch::layout;

/// Result type alias using hvtvmm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bringing up or supervising a guest.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error(
        "invalid memory size 0x{0:x}: need a non-zero multiple of 0x{block:x} up to 0x{max:x}",
        block = layout::GUEST_BLOCK_SIZE,
        max = layout::MMIO_BASE
    )]
    InvalidMemorySize(u64),

    #[error("invalid vCPU id: {0} (a guest runs on vCPU 0 only)")]
    InvalidVcpuId(usize),

    #[error("guest memory region too small: have 0x{have:x} bytes, need 0x{need:x}")]
    MemoryTooSmall { have: u64, need: u64 },

    #[error("stack of 0x{stack:x} bytes does not fit above kernel end 0x{kernel_end:x}")]
    StackTooLarge { stack: u64, kernel_end: u64 },

    // Malformed guest input
    #[error("failed to load guest image: {0}")]
    Load(#[from] LoadError),

    #[error("failed to read ELF note: {0}")]
    Note(#[from] NoteError),

    #[error("boot protocol error: {0}")]
    Boot(#[from] BootError),

    // Runtime errors
    #[error("vCPU not in expected state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("vCPU already running")]
    AlreadyRunning,

    #[error("vCPU not running")]
    NotRunning,

    #[error("vCPU error: {0}")]
    VcpuError(String),

    // Memory errors
    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    #[error("invalid guest address: 0x{0:x}")]
    InvalidGuestAddress(u64),

    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Reasons an ELF executable is refused by the loader.
///
/// Every variant names the first check that failed; nothing after it ran.
/// Segment-scoped variants carry the program header index.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("image too small for an ELF64 header ({0} bytes)")]
    TooSmall(usize),

    #[error("bad ELF magic")]
    BadMagic,

    #[error("not a 64-bit ELF (class {0})")]
    BadClass(u8),

    #[error("wrong byte order (data encoding {0})")]
    BadEndianness(u8),

    #[error("unsupported ELF version {0}")]
    BadVersion(u32),

    #[error("unexpected ELF header size {0}")]
    BadHeaderSize(u16),

    #[error("no program headers")]
    NoProgramHeaders,

    #[error("unexpected program header entry size {0}")]
    BadProgramHeaderSize(u16),

    #[error("not a static executable (type {0})")]
    NotExecutable(u16),

    #[error("wrong target machine {0}")]
    BadMachine(u16),

    #[error("entry point 0x{0:x} outside loadable range")]
    EntryOutOfRange(u64),

    #[error("program header table outside the image")]
    ProgramHeadersOutOfBounds,

    #[error("segment {index} at 0x{vaddr:x} below minimum load address")]
    SegmentBelowMinimum { index: usize, vaddr: u64 },

    #[error("segment {index} not sorted by virtual address")]
    UnsortedSegments { index: usize },

    #[error("segment {index} has invalid alignment 0x{align:x}")]
    BadAlignment { index: usize, align: u64 },

    #[error("segment {index} overlaps a previous segment")]
    OverlappingSegments { index: usize },

    #[error("segment {index} address arithmetic overflows")]
    AddressOverflow { index: usize },

    #[error("segment {index} extends beyond guest memory")]
    SegmentOutOfRange { index: usize },

    #[error("segment {index} memory size is smaller than its file size")]
    MemSizeBelowFileSize { index: usize },

    #[error("segment {index} file data lies outside the image")]
    SegmentDataOutOfBounds { index: usize },
}

/// Reasons a vendor note cannot be extracted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NoteError {
    #[error("invalid ELF image: {0}")]
    InvalidElf(#[from] LoadError),

    #[error("note 0x{0:08x} not found")]
    NotFound(u32),

    #[error("malformed note: {0}")]
    Malformed(&'static str),

    #[error("note descriptor of {size} bytes exceeds maximum {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("note offset arithmetic overflows")]
    Overflow,
}

/// Violations of the HVT boot protocol detected before the guest runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootError {
    #[error("command line of {len} bytes exceeds protocol maximum {max} (including terminator)")]
    CmdlineTooLong { len: usize, max: usize },

    #[error("boot arguments end at 0x{end:x}, past the program text boundary 0x{limit:x}")]
    ArgumentsOverlapText { end: u64, limit: u64 },

    #[error("ABI mismatch: target {target}, version {version}")]
    AbiMismatch { target: u32, version: u32 },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
}
