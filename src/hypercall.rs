//! HVT hypercall protocol.
//!
//! A guest issues hypercall `n` by storing the guest address of its argument
//! structure to `HYPERCALL_MMIO_BASE + n * 8`. The store faults, and the trap
//! path turns it into a [`crate::fault::HypercallRequest`]. Argument
//! structures are read and written in place in guest memory.

use crate::error::Result;
use crate::memory::GuestMemory;

pub const HYPERCALL_MMIO_BASE: u64 = crate::arch::layout::MMIO_BASE;
/// Distance between consecutive hypercall addresses.
pub const HYPERCALL_SLOT_SIZE: u64 = 8;
pub const HYPERCALL_SLOT_SHIFT: u64 = 3;

/// Largest halt cookie the guest may pass.
pub const HALT_COOKIE_MAX: usize = 512;

/// Hypercall numbers. 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Hypercall {
    Walltime = 1,
    Puts = 2,
    Poll = 3,
    BlockWrite = 4,
    BlockRead = 5,
    NetWrite = 6,
    NetRead = 7,
    Halt = 8,
}

impl Hypercall {
    pub const FIRST: u64 = Hypercall::Walltime as u64;
    pub const LAST: u64 = Hypercall::Halt as u64;

    pub fn from_number(nr: u64) -> Option<Self> {
        Some(match nr {
            1 => Hypercall::Walltime,
            2 => Hypercall::Puts,
            3 => Hypercall::Poll,
            4 => Hypercall::BlockWrite,
            5 => Hypercall::BlockRead,
            6 => Hypercall::NetWrite,
            7 => Hypercall::NetRead,
            8 => Hypercall::Halt,
            _ => return None,
        })
    }

    pub fn number(self) -> u64 {
        self as u64
    }

    pub fn name(self) -> &'static str {
        match self {
            Hypercall::Walltime => "walltime",
            Hypercall::Puts => "puts",
            Hypercall::Poll => "poll",
            Hypercall::BlockWrite => "block_write",
            Hypercall::BlockRead => "block_read",
            Hypercall::NetWrite => "net_write",
            Hypercall::NetRead => "net_read",
            Hypercall::Halt => "halt",
        }
    }
}

impl std::fmt::Display for Hypercall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.number())
    }
}

/// Guest address the guest stores to for hypercall `nr`.
pub fn hypercall_address(nr: u64) -> u64 {
    HYPERCALL_MMIO_BASE + (nr << HYPERCALL_SLOT_SHIFT)
}

/// Raw hypercall number for a faulting address, `None` below the window.
pub fn hypercall_number(addr: u64) -> Option<u64> {
    addr.checked_sub(HYPERCALL_MMIO_BASE)
        .map(|offset| offset >> HYPERCALL_SLOT_SHIFT)
}

/// Argument structures with a frozen layout in guest memory.
pub trait GuestArgs: Copy {
    fn read(mem: &GuestMemory, addr: u64) -> Result<Self> {
        mem.read_obj(addr)
    }

    fn write(&self, mem: &mut GuestMemory, addr: u64) -> Result<()> {
        mem.write_obj(addr, *self)
    }
}

/// `Walltime`: nanoseconds since the epoch (out).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalltimeArgs {
    pub nsecs: u64,
}

/// `Puts`: console write.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutsArgs {
    pub data: u64,
    pub len: u64,
}

impl PutsArgs {
    /// Bytes the guest asked to print.
    pub fn data<'a>(&self, mem: &'a GuestMemory) -> Result<&'a [u8]> {
        mem.slice(self.data, self.len as usize)
    }
}

/// `BlockWrite`: write `len` bytes at `offset` of device `handle`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockWriteArgs {
    pub handle: u64,
    pub offset: u64,
    pub data: u64,
    pub len: u64,
    /// Out.
    pub ret: i32,
    pub _pad: u32,
}

/// `BlockRead`: `len` is in/out.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockReadArgs {
    pub handle: u64,
    pub offset: u64,
    pub data: u64,
    pub len: u64,
    pub ret: i32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetWriteArgs {
    pub handle: u64,
    pub data: u64,
    pub len: u64,
    pub ret: i32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetReadArgs {
    pub handle: u64,
    pub data: u64,
    pub len: u64,
    pub ret: i32,
    pub _pad: u32,
}

/// `Poll`: wait up to `timeout_nsecs` for any device to become ready.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollArgs {
    pub timeout_nsecs: u64,
    pub ready_set: u64,
    pub ret: i32,
    pub _pad: u32,
}

/// `Halt`: terminate the guest.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HaltArgs {
    /// Guest address of an optional cookie, 0 if none.
    pub cookie: u64,
    pub exit_status: i32,
    pub _pad: u32,
}

impl HaltArgs {
    /// The cookie bytes, capped at [`HALT_COOKIE_MAX`] and guest memory.
    pub fn cookie<'a>(&self, mem: &'a GuestMemory) -> Result<Option<&'a [u8]>> {
        if self.cookie == 0 {
            return Ok(None);
        }
        let avail = (mem.size() as u64).saturating_sub(self.cookie);
        let len = avail.min(HALT_COOKIE_MAX as u64) as usize;
        mem.slice(self.cookie, len).map(Some)
    }
}

impl GuestArgs for WalltimeArgs {}
impl GuestArgs for PutsArgs {}
impl GuestArgs for BlockWriteArgs {}
impl GuestArgs for BlockReadArgs {}
impl GuestArgs for NetWriteArgs {}
impl GuestArgs for NetReadArgs {}
impl GuestArgs for PollArgs {}
impl GuestArgs for HaltArgs {}

const _: () = {
    assert!(std::mem::size_of::<WalltimeArgs>() == 8);
    assert!(std::mem::size_of::<PutsArgs>() == 16);
    assert!(std::mem::size_of::<BlockWriteArgs>() == 40);
    assert!(std::mem::size_of::<BlockReadArgs>() == 40);
    assert!(std::mem::size_of::<NetWriteArgs>() == 32);
    assert!(std::mem::size_of::<NetReadArgs>() == 32);
    assert!(std::mem::size_of::<PollArgs>() == 24);
    assert!(std::mem::size_of::<HaltArgs>() == 16);
};
