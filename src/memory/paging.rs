//! Guest stage-1 translation tables.
//!
//! The four tables sit at fixed offsets inside guest memory and are treated
//! as flat arrays of 64-bit descriptors:
//!
//! - PTE (level 3): 4 KiB pages over the first 2 MiB block. The zero page and
//!   the tables themselves stay unmapped, the boot-info area is read-only,
//!   everything from `GUEST_MIN_BASE` up is executable.
//! - PMD (level 2): entry 0 links the PTE table, the rest map 2 MiB blocks
//!   up to `mem_size`.
//! - PUD (level 1): one table link per GiB of RAM, plus 1 GiB device blocks
//!   for the MMIO window.
//! - PGD (level 0): entry 0 links the PUD table.
//!
//! RAM is identity-mapped (VA = PA).

use crate::arch::{layout, pgt};
use crate::error::Result;

use super::{validate_mem_size, GuestMemory};

/// Translation table level, root first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLevel {
    Pgd,
    Pud,
    Pmd,
    Pte,
}

impl TableLevel {
    fn base(self) -> u64 {
        match self {
            TableLevel::Pgd => layout::PGD_BASE,
            TableLevel::Pud => layout::PUD_BASE,
            TableLevel::Pmd => layout::PMD_BASE,
            TableLevel::Pte => layout::PTE_BASE,
        }
    }

    fn size(self) -> u64 {
        match self {
            TableLevel::Pgd => layout::PGD_SIZE,
            TableLevel::Pud => layout::PUD_SIZE,
            TableLevel::Pmd => layout::PMD_SIZE,
            TableLevel::Pte => layout::PTE_SIZE,
        }
    }

    /// Number of descriptors the reserved region holds.
    pub fn entries(self) -> usize {
        (self.size() / 8) as usize
    }
}

/// Read descriptor `index` of a table.
pub fn read_entry(mem: &GuestMemory, level: TableLevel, index: usize) -> Result<u64> {
    mem.read_u64(level.base() + (index as u64) * 8)
}

fn write_entry(mem: &mut GuestMemory, level: TableLevel, index: usize, desc: u64) -> Result<()> {
    mem.write_u64(level.base() + (index as u64) * 8, desc)
}

/// Build the guest translation tables for `mem_size` bytes of RAM.
///
/// Fails without touching memory if `mem_size` is not a non-zero multiple of
/// the guest block size below the device window, or if `mem` cannot hold it.
pub fn build_address_space(mem: &mut GuestMemory, mem_size: u64) -> Result<()> {
    validate_mem_size(mem_size)?;
    if (mem.size() as u64) < mem_size {
        return Err(crate::Error::MemoryTooSmall {
            have: mem.size() as u64,
            need: mem_size,
        });
    }

    for level in [TableLevel::Pgd, TableLevel::Pud, TableLevel::Pmd, TableLevel::Pte] {
        mem.fill(level.base(), level.size() as usize, 0)?;
    }

    // First block at page granularity
    let mut paddr = 0;
    let mut pte = 0;
    while paddr < layout::GUEST_BLOCK_SIZE {
        if paddr >= layout::PGT_MAP_START {
            let prot = if paddr < layout::GUEST_MIN_BASE {
                pgt::PROT_PAGE_NORMAL_RO
            } else {
                pgt::PROT_PAGE_NORMAL_EXEC
            };
            write_entry(mem, TableLevel::Pte, pte, paddr | prot)?;
        }
        paddr += pgt::PAGE_SIZE;
        pte += 1;
    }

    write_entry(mem, TableLevel::Pmd, 0, layout::PTE_BASE | pgt::DESC_TYPE_TABLE)?;

    // Remaining RAM in 2 MiB blocks; the PMD pages are contiguous
    let mut pmd = 1;
    while paddr < mem_size {
        write_entry(mem, TableLevel::Pmd, pmd, paddr | pgt::PROT_SECT_NORMAL_EXEC)?;
        paddr += pgt::PMD_SIZE;
        pmd += 1;
    }

    let mut pud = 0;
    let mut gib = 0;
    while gib < mem_size {
        let pmd_page = layout::PMD_BASE + (pud as u64) * pgt::PAGE_SIZE;
        write_entry(mem, TableLevel::Pud, pud, pmd_page | pgt::DESC_TYPE_TABLE)?;
        gib += pgt::PUD_SIZE;
        pud += 1;
    }

    // Device window, independent of RAM size
    let mut dev = layout::MMIO_BASE;
    while dev < layout::MMIO_BASE + layout::MMIO_SIZE {
        let index = (dev >> pgt::PUD_SHIFT) as usize;
        write_entry(mem, TableLevel::Pud, index, dev | pgt::PROT_SECT_DEVICE_NGNRE)?;
        dev += pgt::PUD_SIZE;
    }

    write_entry(mem, TableLevel::Pgd, 0, layout::PUD_BASE | pgt::DESC_TYPE_TABLE)?;

    log::debug!(
        "address space built: {} pages, {} blocks, {} PUD links, mem_size=0x{:x}",
        pte,
        pmd - 1,
        pud,
        mem_size
    );
    Ok(())
}

/// Final translation of a guest virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Level that held the block or page descriptor.
    pub level: TableLevel,
    /// The block or page descriptor itself.
    pub descriptor: u64,
    /// Translated physical address.
    pub paddr: u64,
}

impl Mapping {
    pub fn is_read_only(&self) -> bool {
        self.descriptor & pgt::SECT_RDONLY != 0
    }

    /// Executable at EL1.
    pub fn is_executable(&self) -> bool {
        self.descriptor & pgt::SECT_PXN == 0
    }

    pub fn is_device(&self) -> bool {
        self.descriptor & pgt::ATTR_INDEX_MASK == pgt::attr_index(pgt::MT_DEVICE_NGNRE)
    }
}

/// Walk the tables built by [`build_address_space`] for `vaddr`.
///
/// Returns `Ok(None)` when the address is not mapped. Table links are only
/// followed to the fixed table offsets this module writes.
pub fn lookup(mem: &GuestMemory, vaddr: u64) -> Result<Option<Mapping>> {
    if vaddr >> (pgt::PUD_SHIFT + 9) >= pgt::ENTRIES_PER_TABLE as u64 {
        return Ok(None);
    }
    let pgd = read_entry(mem, TableLevel::Pgd, (vaddr >> (pgt::PUD_SHIFT + 9)) as usize)?;
    if pgd & pgt::SECT_VALID == 0 {
        return Ok(None);
    }

    let pud_index = ((vaddr >> pgt::PUD_SHIFT) & 0x1ff) as usize;
    let pud = read_entry(mem, TableLevel::Pud, pud_index)?;
    if pud & pgt::SECT_VALID == 0 {
        return Ok(None);
    }
    if pud & 0b11 == pgt::DESC_TYPE_SECT {
        let base = pud & pgt::ADDR_MASK & !(pgt::PUD_SIZE - 1);
        return Ok(Some(Mapping {
            level: TableLevel::Pud,
            descriptor: pud,
            paddr: base | (vaddr & (pgt::PUD_SIZE - 1)),
        }));
    }

    // PMD pages are laid out contiguously, one per PUD link
    let pmd_page = (pud & pgt::ADDR_MASK).wrapping_sub(layout::PMD_BASE) / pgt::PAGE_SIZE;
    let pmd_slot = ((vaddr >> pgt::PMD_SHIFT) & 0x1ff) as usize;
    let pmd_index = pmd_page as usize * pgt::ENTRIES_PER_TABLE + pmd_slot;
    if pmd_index >= TableLevel::Pmd.entries() {
        return Ok(None);
    }
    let pmd = read_entry(mem, TableLevel::Pmd, pmd_index)?;
    if pmd & pgt::SECT_VALID == 0 {
        return Ok(None);
    }
    if pmd & 0b11 == pgt::DESC_TYPE_SECT {
        let base = pmd & pgt::ADDR_MASK & !(pgt::PMD_SIZE - 1);
        return Ok(Some(Mapping {
            level: TableLevel::Pmd,
            descriptor: pmd,
            paddr: base | (vaddr & (pgt::PMD_SIZE - 1)),
        }));
    }

    let pte_index = ((vaddr >> pgt::PAGE_SHIFT) & 0x1ff) as usize;
    let pte = read_entry(mem, TableLevel::Pte, pte_index)?;
    if pte & pgt::SECT_VALID == 0 {
        return Ok(None);
    }
    Ok(Some(Mapping {
        level: TableLevel::Pte,
        descriptor: pte,
        paddr: (pte & pgt::ADDR_MASK) | (vaddr & (pgt::PAGE_SIZE - 1)),
    }))
}
