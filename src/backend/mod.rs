//! vCPU backend abstraction.
//!
//! The monitor never runs guest code itself. It reads and writes the saved
//! register state of a single parked vCPU and asks a privileged primitive to
//! resume or stop it. This module defines that seam as a trait so the guest
//! core can be driven by a microkernel transport, a hypervisor API or the
//! in-process [`SoftVcpu`].

mod soft;

pub use soft::SoftVcpu;

use crate::error::Result;

/// Saved user context of the vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    pub pc: u64,
    pub sp: u64,
    pub spsr: u64,
    /// General purpose registers x0..x30.
    pub x: [u64; 31],
    pub tpidr_el0: u64,
    pub tpidr_ro_el0: u64,
}

impl Registers {
    /// Value of general purpose register `index` as an instruction sees it.
    ///
    /// Index 31 is the zero register in a load/store transfer field and
    /// always reads as 0. Indices above 31 also read as 0.
    pub fn gpr(&self, index: usize) -> u64 {
        self.x.get(index).copied().unwrap_or(0)
    }

    pub fn set_gpr(&mut self, index: usize, value: u64) {
        if let Some(reg) = self.x.get_mut(index) {
            *reg = value;
        }
    }
}

/// Virtualised system registers of the vCPU.
///
/// The first group is programmed at setup; `reset` zeroes all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysReg {
    Cpacr,
    Mair,
    Tcr,
    Ttbr0,
    Ttbr1,
    Sctlr,
    SpsrEl1,
    SpEl1,
    ElrEl1,
    Vbar,
    Esr,
    Far,
    Amair,
    Cidr,
    Actlr,
    Afsr0,
    Afsr1,
    Isr,
    TpidrEl1,
    Vmpidr,
    CntvCtl,
    CntvCval,
    Cntvoff,
    Cntkctl,
}

impl SysReg {
    pub const ALL: [SysReg; 24] = [
        SysReg::Cpacr,
        SysReg::Mair,
        SysReg::Tcr,
        SysReg::Ttbr0,
        SysReg::Ttbr1,
        SysReg::Sctlr,
        SysReg::SpsrEl1,
        SysReg::SpEl1,
        SysReg::ElrEl1,
        SysReg::Vbar,
        SysReg::Esr,
        SysReg::Far,
        SysReg::Amair,
        SysReg::Cidr,
        SysReg::Actlr,
        SysReg::Afsr0,
        SysReg::Afsr1,
        SysReg::Isr,
        SysReg::TpidrEl1,
        SysReg::Vmpidr,
        SysReg::CntvCtl,
        SysReg::CntvCval,
        SysReg::Cntvoff,
        SysReg::Cntkctl,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SysReg::Cpacr => "CPACR_EL1",
            SysReg::Mair => "MAIR_EL1",
            SysReg::Tcr => "TCR_EL1",
            SysReg::Ttbr0 => "TTBR0_EL1",
            SysReg::Ttbr1 => "TTBR1_EL1",
            SysReg::Sctlr => "SCTLR_EL1",
            SysReg::SpsrEl1 => "SPSR_EL1",
            SysReg::SpEl1 => "SP_EL1",
            SysReg::ElrEl1 => "ELR_EL1",
            SysReg::Vbar => "VBAR_EL1",
            SysReg::Esr => "ESR_EL1",
            SysReg::Far => "FAR_EL1",
            SysReg::Amair => "AMAIR_EL1",
            SysReg::Cidr => "CONTEXTIDR_EL1",
            SysReg::Actlr => "ACTLR_EL1",
            SysReg::Afsr0 => "AFSR0_EL1",
            SysReg::Afsr1 => "AFSR1_EL1",
            SysReg::Isr => "ISR_EL1",
            SysReg::TpidrEl1 => "TPIDR_EL1",
            SysReg::Vmpidr => "VMPIDR_EL2",
            SysReg::CntvCtl => "CNTV_CTL_EL0",
            SysReg::CntvCval => "CNTV_CVAL_EL0",
            SysReg::Cntvoff => "CNTVOFF_EL2",
            SysReg::Cntkctl => "CNTKCTL_EL1",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for SysReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Privileged access to the guest's single vCPU.
///
/// Every operation may fail when the underlying transport refuses it; the
/// guest core treats such failures as fatal for the vCPU.
pub trait VcpuBackend: Send {
    /// Read the saved user context.
    fn read_registers(&self) -> Result<Registers>;

    /// Replace the saved user context.
    fn write_registers(&mut self, regs: &Registers) -> Result<()>;

    fn read_sys_reg(&self, reg: SysReg) -> Result<u64>;

    fn write_sys_reg(&mut self, reg: SysReg, value: u64) -> Result<()>;

    /// Let the vCPU run from its saved context.
    fn resume(&mut self) -> Result<()>;

    /// Park the vCPU. Stopping a parked vCPU is not an error.
    fn stop(&mut self) -> Result<()>;

    /// Zero every architectural register.
    fn reset(&mut self) -> Result<()>;

    /// Frequency of the generic timer counter in Hz.
    fn counter_frequency(&self) -> u64;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}
