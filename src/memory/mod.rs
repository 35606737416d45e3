//! Guest memory and the translation tables that live inside it.
//!
//! All guest-visible addresses are offsets into a single [`GuestMemory`]
//! region; the guest sees its RAM identity-mapped starting at 0.

mod guest;
pub mod paging;

pub use guest::GuestMemory;
pub use paging::{build_address_space, lookup, Mapping, TableLevel};

use crate::arch::layout;
use crate::error::{Error, Result};

/// Check the memory-size preconditions shared by setup and the
/// address-space builder.
///
/// `mem_size` must be a non-zero multiple of the guest block size and must
/// not reach into the device window.
pub fn validate_mem_size(mem_size: u64) -> Result<()> {
    if mem_size == 0
        || mem_size % layout::GUEST_BLOCK_SIZE != 0
        || mem_size > layout::MMIO_BASE
    {
        return Err(Error::InvalidMemorySize(mem_size));
    }
    Ok(())
}
