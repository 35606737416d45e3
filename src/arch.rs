//! aarch64 architectural constants for the HVT guest.
//!
//! Purely data: memory layout, translation table descriptor bits,
//! control-register init values and exception syndrome fields. The values
//! are part of the guest ABI and must stay bit-exact.
//!
//! ## Guest physical memory layout
//!
//! ```text
//! 0x0000_0000  ┌───────────────────────────┐
//!              │  Zero page (unmapped)      │
//! 0x0000_1000  ├───────────────────────────┤
//!              │  PGD (root, level 0)       │
//! 0x0000_2000  ├───────────────────────────┤
//!              │  PUD (upper, level 1)      │
//! 0x0000_3000  ├───────────────────────────┤
//!              │  PMD x4 (middle, level 2)  │
//! 0x0000_7000  ├───────────────────────────┤
//!              │  PTE (leaf, level 3)       │
//! 0x0001_0000  ├───────────────────────────┤  ← mapped read-only from here
//!              │  Boot info, cmdline, MFT   │
//! 0x0010_0000  ├───────────────────────────┤  ← GUEST_MIN_BASE
//!              │  Program text and data     │
//!              │  ...                       │
//!              │  Stack (grows down)        │
//!   mem_size   └───────────────────────────┘
//! 0x1_0000_0000 ┌──────────────────────────┐
//!              │  MMIO / hypercall window   │  1 GiB, device memory
//! 0x1_4000_0000 └──────────────────────────┘
//! ```

/// Guest memory layout.
pub mod layout {
    /// Root translation table (PGD).
    pub const PGD_BASE: u64 = 0x1000;
    pub const PGD_SIZE: u64 = 0x1000;

    /// Upper translation table (PUD).
    pub const PUD_BASE: u64 = 0x2000;
    pub const PUD_SIZE: u64 = 0x1000;

    /// Middle translation tables (PMD), one page per GiB of RAM.
    pub const PMD_BASE: u64 = 0x3000;
    pub const PMD_SIZE: u64 = 0x4000;

    /// Leaf translation table (PTE) covering the first guest block.
    pub const PTE_BASE: u64 = 0x7000;
    pub const PTE_SIZE: u64 = 0x1000;

    /// Boot info record address, also the first guest-visible page.
    pub const BOOT_INFO: u64 = 0x10000;

    /// Pages below this address are never mapped into the guest.
    pub const PGT_MAP_START: u64 = BOOT_INFO;

    /// Lowest address program text may occupy.
    pub const GUEST_MIN_BASE: u64 = 0x100000;

    /// Guest RAM granularity (one PMD block).
    pub const GUEST_BLOCK_SIZE: u64 = 0x200000;

    /// Device space begins right above the 4 GiB RAM ceiling.
    pub const MMIO_BASE: u64 = 0x1_0000_0000;
    pub const MMIO_SIZE: u64 = 0x4000_0000;
}

/// Translation table descriptor bits (VMSAv8-64, 4 KiB granule).
pub mod pgt {
    pub const PAGE_SHIFT: u64 = 12;
    pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

    /// Number of 64-bit descriptors in one table page.
    pub const ENTRIES_PER_TABLE: usize = 512;

    pub const PUD_SHIFT: u64 = 30;
    pub const PUD_SIZE: u64 = 1 << PUD_SHIFT;
    pub const PMD_SHIFT: u64 = 21;
    pub const PMD_SIZE: u64 = 1 << PMD_SHIFT;

    pub const DESC_TYPE_TABLE: u64 = 3;
    pub const DESC_TYPE_SECT: u64 = 1;
    pub const DESC_TYPE_PAGE: u64 = 3;

    pub const SECT_VALID: u64 = 1 << 0;
    /// AP[1]
    pub const SECT_USER: u64 = 1 << 6;
    /// AP[2]
    pub const SECT_RDONLY: u64 = 1 << 7;
    pub const SECT_S: u64 = 3 << 8;
    pub const SECT_AF: u64 = 1 << 10;
    pub const SECT_NG: u64 = 1 << 11;
    pub const SECT_PXN: u64 = 1 << 53;
    pub const SECT_UXN: u64 = 1 << 54;

    /// Output address bits [47:12] of a descriptor.
    pub const ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

    // Memory attribute indices into MAIR_EL1
    pub const MT_DEVICE_NGNRNE: u64 = 0;
    pub const MT_DEVICE_NGNRE: u64 = 1;
    pub const MT_DEVICE_GRE: u64 = 2;
    pub const MT_NORMAL_NC: u64 = 3;
    pub const MT_NORMAL: u64 = 4;
    pub const MT_NORMAL_WT: u64 = 5;

    pub const fn attr_index(mt: u64) -> u64 {
        mt << 2
    }

    pub const ATTR_INDEX_MASK: u64 = 7 << 2;

    pub const PROT_SECT_DEFAULT: u64 = DESC_TYPE_SECT | SECT_AF | SECT_S;
    pub const PROT_SECT_NORMAL_EXEC: u64 = PROT_SECT_DEFAULT | SECT_UXN | attr_index(MT_NORMAL);
    pub const PROT_SECT_DEVICE_NGNRE: u64 =
        PROT_SECT_DEFAULT | SECT_PXN | SECT_UXN | attr_index(MT_DEVICE_NGNRE);

    pub const PROT_PAGE_DEFAULT: u64 = DESC_TYPE_PAGE | SECT_AF | SECT_S;
    pub const PROT_PAGE_NORMAL_RO: u64 =
        PROT_PAGE_DEFAULT | attr_index(MT_NORMAL) | SECT_PXN | SECT_UXN | SECT_RDONLY;
    pub const PROT_PAGE_NORMAL_EXEC: u64 = PROT_PAGE_DEFAULT | attr_index(MT_NORMAL) | SECT_UXN;
}

/// Initial values for the EL1 control registers.
pub mod init {
    // SPSR bits
    pub const PSR_F_BIT: u64 = 0x40;
    pub const PSR_I_BIT: u64 = 0x80;
    pub const PSR_A_BIT: u64 = 0x100;
    pub const PSR_D_BIT: u64 = 0x200;
    pub const PSR_MODE_EL1H: u64 = 0x5;

    /// Virtualised SPSR_EL1: EL1h with D, A, I and F masked.
    pub const PSTATE_INIT: u64 = PSR_D_BIT | PSR_A_BIT | PSR_I_BIT | PSR_F_BIT | PSR_MODE_EL1H;

    /// Saved user-context SPSR for the vCPU thread (EL1h, nothing masked).
    pub const TCB_SPSR_INIT: u64 = PSR_MODE_EL1H;

    // CPACR_EL1.FPEN: no FP/SIMD trapping
    pub const FPEN_NOTRAP: u64 = 0x3;
    pub const FPEN_SHIFT: u64 = 20;
    pub const FPEN_MASK: u64 = 0x3 << FPEN_SHIFT;
    pub const CPACR_INIT: u64 = FPEN_NOTRAP << FPEN_SHIFT;

    const fn mair(attr: u64, mt: u64) -> u64 {
        attr << (mt * 8)
    }

    pub const MAIR_EL1_INIT: u64 = mair(0x00, super::pgt::MT_DEVICE_NGNRNE)
        | mair(0x04, super::pgt::MT_DEVICE_NGNRE)
        | mair(0x0c, super::pgt::MT_DEVICE_GRE)
        | mair(0x44, super::pgt::MT_NORMAL_NC)
        | mair(0xff, super::pgt::MT_NORMAL)
        | mair(0xbb, super::pgt::MT_NORMAL_WT);

    pub const VA_BITS: u64 = 40;

    const TCR_T0SZ: u64 = 64 - VA_BITS;
    const TCR_T1SZ: u64 = (64 - VA_BITS) << 16;
    const TCR_IRGN_WBWA: u64 = (1 << 8) | (1 << 24);
    const TCR_ORGN_WBWA: u64 = (1 << 10) | (1 << 26);
    const TCR_SHARED: u64 = (3 << 12) | (3 << 28);
    const TCR_TG0_4K: u64 = 0 << 14;
    const TCR_TG1_4K: u64 = 2 << 30;
    const TCR_ASID16: u64 = 1 << 36;
    const TCR_TBI0: u64 = 1 << 37;
    const TCR_IPS_1TB: u64 = 2 << 32;

    pub const TCR_EL1_INIT: u64 = TCR_T0SZ
        | TCR_T1SZ
        | TCR_IRGN_WBWA
        | TCR_ORGN_WBWA
        | TCR_SHARED
        | TCR_TG0_4K
        | TCR_TG1_4K
        | TCR_ASID16
        | TCR_TBI0
        | TCR_IPS_1TB;

    pub const SCTLR_M: u64 = 1 << 0;
    pub const SCTLR_C: u64 = 1 << 2;
    pub const SCTLR_I: u64 = 1 << 12;

    /// MMU plus data and instruction caches.
    pub const SCTLR_EL1_INIT: u64 = SCTLR_M | SCTLR_C | SCTLR_I;

    /// Initial stack sits this far below the top of RAM.
    pub const STACK_TOP_OFFSET: u64 = 16;
}

/// Data abort instruction syndrome (ESR_ELx.ISS) fields.
pub mod esr {
    /// Write not Read.
    pub const WNR_SHIFT: u64 = 6;
    /// Syndrome Register Transfer: source/destination register number.
    pub const SRT_SHIFT: u64 = 16;
    pub const SRT_MASK: u64 = 0x1f;
    /// Instruction Syndrome Valid.
    pub const ISV_SHIFT: u64 = 24;
    /// Instruction Length: set for a 32-bit instruction.
    pub const IL_SHIFT: u64 = 25;

    /// Width of every A64 instruction.
    pub const INSTRUCTION_SIZE: u64 = 4;
}
