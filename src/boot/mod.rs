//! HVT boot protocol.
//!
//! Before the first resume the monitor publishes a [`BootInfo`] record at
//! `BOOT_INFO`, followed by the NUL-terminated command line and the
//! NUL-terminated manifest:
//!
//! ```text
//! 0x10000  BootInfo (40 bytes)
//! 0x10028  cmdline\0
//!          (pad to 8) manifest\0
//!          ...
//! 0x100000 program text; nothing above may reach here
//! ```
//!
//! The guest receives the address of the record in x0.

pub mod manifest;

pub use manifest::{DeviceKind, Manifest, ManifestEntry};

use crate::arch::layout;
use crate::arith;
use crate::error::{BootError, Error, Result};
use crate::loader::{self, LoadResult};
use crate::memory::GuestMemory;

/// Maximum command line length, including the terminating NUL.
pub const CMDLINE_SIZE: usize = 8192;

pub const HVT_ABI_TARGET: u32 = 1;
pub const HVT_ABI_VERSION: u32 = 2;

/// Boot information record, frozen guest ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootInfo {
    /// Guest memory size in bytes.
    pub mem_size: u64,
    /// Highest address occupied by the loaded executable.
    pub kernel_end: u64,
    /// Counter frequency in Hz.
    pub cpu_cycle_freq: u64,
    /// Guest address of the command line.
    pub cmdline: u64,
    /// Guest address of the manifest.
    pub mft: u64,
}

const _: () = assert!(std::mem::size_of::<BootInfo>() == 40);

impl BootInfo {
    pub const SIZE: u64 = std::mem::size_of::<BootInfo>() as u64;

    /// Read the record back from guest memory.
    pub fn read(mem: &GuestMemory) -> Result<Self> {
        mem.read_obj(layout::BOOT_INFO)
    }

    /// The NUL-terminated command line this record points to, without the NUL.
    pub fn cmdline<'a>(&self, mem: &'a GuestMemory) -> Result<&'a [u8]> {
        c_str(mem, self.cmdline, CMDLINE_SIZE)
    }
}

fn c_str(mem: &GuestMemory, addr: u64, max: usize) -> Result<&[u8]> {
    let avail = (mem.size() as u64).saturating_sub(addr).min(max as u64) as usize;
    let bytes = mem.slice(addr, avail)?;
    let len = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::InvalidGuestAddress(addr))?;
    Ok(&bytes[..len])
}

/// ABI descriptor note contents.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiInfo {
    pub abi_target: u32,
    pub abi_version: u32,
}

impl AbiInfo {
    /// Decode and check an ABI1 descriptor.
    pub fn parse(desc: &[u8]) -> std::result::Result<Self, BootError> {
        let field = |off: usize| {
            desc.get(off..off + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0)
        };
        let abi = Self {
            abi_target: field(0),
            abi_version: field(4),
        };
        if abi.abi_target != HVT_ABI_TARGET || abi.abi_version != HVT_ABI_VERSION {
            return Err(BootError::AbiMismatch {
                target: abi.abi_target,
                version: abi.abi_version,
            });
        }
        Ok(abi)
    }
}

/// Extract and check the ABI note of `elf`.
pub fn read_abi(elf: &[u8]) -> Result<AbiInfo> {
    let desc = loader::load_note(
        elf,
        loader::ABI1_NOTE_TYPE,
        loader::ABI1_NOTE_ALIGN,
        loader::ABI1_NOTE_MAX_SIZE,
    )?;
    Ok(AbiInfo::parse(&desc)?)
}

/// Extract and validate the manifest note of `elf`.
pub fn read_manifest(elf: &[u8]) -> Result<Manifest> {
    let desc = loader::load_note(
        elf,
        loader::MFT1_NOTE_TYPE,
        loader::MFT1_NOTE_ALIGN,
        manifest::MFT1_NOTE_MAX_SIZE,
    )?;
    Ok(Manifest::parse(desc)?)
}

/// Check that the command line fits the protocol limit.
pub fn check_cmdline(cmdline: &[u8]) -> Result<()> {
    if cmdline.len() + 1 > CMDLINE_SIZE {
        return Err(BootError::CmdlineTooLong {
            len: cmdline.len(),
            max: CMDLINE_SIZE,
        }
        .into());
    }
    Ok(())
}

/// Write the boot record, command line and manifest into guest memory.
///
/// Every size check happens before the first write, so a rejected layout
/// leaves memory untouched.
pub fn publish(
    mem: &mut GuestMemory,
    load: &LoadResult,
    mem_size: u64,
    cpu_cycle_freq: u64,
    cmdline: &[u8],
    manifest: &[u8],
) -> Result<BootInfo> {
    check_cmdline(cmdline)?;

    let overflow = || Error::from(BootError::ArgumentsOverlapText {
        end: u64::MAX,
        limit: layout::GUEST_MIN_BASE,
    });

    let cmdline_addr = layout::BOOT_INFO + BootInfo::SIZE;
    let cmdline_end =
        arith::checked_add(cmdline_addr, cmdline.len() as u64 + 1).ok_or_else(overflow)?;
    let mft_addr =
        arith::align_up(cmdline_end, loader::MFT1_NOTE_ALIGN).ok_or_else(overflow)?;
    let end =
        arith::checked_add(mft_addr, manifest.len() as u64 + 1).ok_or_else(overflow)?;
    if end > layout::GUEST_MIN_BASE {
        return Err(BootError::ArgumentsOverlapText {
            end,
            limit: layout::GUEST_MIN_BASE,
        }
        .into());
    }

    let info = BootInfo {
        mem_size,
        kernel_end: load.end,
        cpu_cycle_freq,
        cmdline: cmdline_addr,
        mft: mft_addr,
    };

    mem.write(cmdline_addr, cmdline)?;
    mem.write(cmdline_addr + cmdline.len() as u64, &[0])?;
    mem.fill(cmdline_end, (mft_addr - cmdline_end) as usize, 0)?;
    mem.write(mft_addr, manifest)?;
    mem.write(mft_addr + manifest.len() as u64, &[0])?;
    mem.write_obj(layout::BOOT_INFO, info)?;

    crate::debug_setup!(
        "boot info: mem=0x{:x} end=0x{:x} freq={} cmdline=0x{:x} mft=0x{:x} args_end=0x{:x}",
        info.mem_size,
        info.kernel_end,
        info.cpu_cycle_freq,
        info.cmdline,
        info.mft,
        end
    );

    Ok(info)
}
