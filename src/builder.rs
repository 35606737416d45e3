//! Guest builder for configuring and creating guests.

use crate::arch::layout;
use crate::backend::VcpuBackend;
use crate::error::{Error, Result};
use crate::guest::Guest;
use crate::memory::{self, GuestMemory};

/// Default guest RAM: 32 MiB.
pub const DEFAULT_MEMORY_SIZE: u64 = 32 * 1024 * 1024;

/// Builder for creating a [`Guest`].
///
/// # Example
///
/// ```rust,no_run
/// use hvtvmm::{GuestBuilder, SoftVcpu};
///
/// let guest = GuestBuilder::new()
///     .memory_size(64 * 1024 * 1024)
///     .build(SoftVcpu::new())?;
/// # Ok::<(), hvtvmm::Error>(())
/// ```
#[derive(Debug, Default, Clone)]
pub struct GuestBuilder {
    memory_size: Option<u64>,
    min_load: Option<u64>,
}

impl GuestBuilder {
    /// Create a new guest builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the amount of guest RAM in bytes.
    ///
    /// Must be a multiple of 2 MiB and at most 4 GiB. Default: 32 MiB
    pub fn memory_size(mut self, bytes: u64) -> Self {
        self.memory_size = Some(bytes);
        self
    }

    /// Set the lowest guest address a loadable segment may start at.
    ///
    /// Default: [`layout::GUEST_MIN_BASE`]
    pub fn min_load_address(mut self, addr: u64) -> Self {
        self.min_load = Some(addr);
        self
    }

    /// Build the guest around `vcpu`.
    ///
    /// This validates the configuration and allocates guest memory. The
    /// returned guest is `Uninitialized` until [`Guest::setup`] runs.
    pub fn build<B: VcpuBackend>(self, vcpu: B) -> Result<Guest<B>> {
        let mem_size = self.memory_size.unwrap_or(DEFAULT_MEMORY_SIZE);
        memory::validate_mem_size(mem_size)?;

        let min_load = self.min_load.unwrap_or(layout::GUEST_MIN_BASE);
        if min_load < layout::GUEST_MIN_BASE || min_load >= mem_size {
            return Err(Error::InvalidGuestAddress(min_load));
        }

        let size = usize::try_from(mem_size).map_err(|_| Error::InvalidMemorySize(mem_size))?;
        let memory = GuestMemory::new(size)?;
        log::debug!(
            "allocated 0x{:x} bytes of guest memory at 0x{:x} for {} backend",
            memory.size(),
            memory.host_address(),
            vcpu.name()
        );

        Ok(Guest::new(vcpu, memory, mem_size, min_load))
    }
}
