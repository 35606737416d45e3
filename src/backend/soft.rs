//! In-process vCPU backend.
//!
//! Holds the register file in host memory and only tracks whether the vCPU
//! would be running. Useful for dry-run bring-up and for exercising the trap
//! path without a hypervisor.

use super::{Registers, SysReg, VcpuBackend};
use crate::error::{Error, Result};

/// Default counter frequency reported by the generic timer (62.5 MHz).
pub const DEFAULT_COUNTER_FREQUENCY: u64 = 62_500_000;

/// Register-file backed vCPU.
#[derive(Debug, Clone)]
pub struct SoftVcpu {
    regs: Registers,
    sys_regs: [u64; SysReg::ALL.len()],
    running: bool,
    frequency: u64,
    resumes: u64,
}

impl SoftVcpu {
    pub fn new() -> Self {
        Self::with_frequency(DEFAULT_COUNTER_FREQUENCY)
    }

    pub fn with_frequency(frequency: u64) -> Self {
        Self {
            regs: Registers::default(),
            sys_regs: [0; SysReg::ALL.len()],
            running: false,
            frequency,
            resumes: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of successful `resume` calls so far.
    pub fn resume_count(&self) -> u64 {
        self.resumes
    }
}

impl Default for SoftVcpu {
    fn default() -> Self {
        Self::new()
    }
}

impl VcpuBackend for SoftVcpu {
    fn read_registers(&self) -> Result<Registers> {
        Ok(self.regs)
    }

    fn write_registers(&mut self, regs: &Registers) -> Result<()> {
        self.regs = *regs;
        Ok(())
    }

    fn read_sys_reg(&self, reg: SysReg) -> Result<u64> {
        Ok(self.sys_regs[reg.index()])
    }

    fn write_sys_reg(&mut self, reg: SysReg, value: u64) -> Result<()> {
        self.sys_regs[reg.index()] = value;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::AlreadyRunning);
        }
        self.running = true;
        self.resumes += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.regs = Registers::default();
        self.sys_regs = [0; SysReg::ALL.len()];
        Ok(())
    }

    fn counter_frequency(&self) -> u64 {
        self.frequency
    }

    fn name(&self) -> &'static str {
        "soft"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_round_trip() {
        let mut vcpu = SoftVcpu::new();
        let mut regs = Registers::default();
        regs.pc = 0x100000;
        regs.x[0] = 0x10000;
        vcpu.write_registers(&regs).unwrap();
        assert_eq!(vcpu.read_registers().unwrap(), regs);

        vcpu.write_sys_reg(SysReg::Sctlr, 0x1005).unwrap();
        assert_eq!(vcpu.read_sys_reg(SysReg::Sctlr).unwrap(), 0x1005);
        assert_eq!(vcpu.read_sys_reg(SysReg::Tcr).unwrap(), 0);
    }

    #[test]
    fn test_resume_stop() {
        let mut vcpu = SoftVcpu::new();
        assert!(!vcpu.is_running());
        vcpu.resume().unwrap();
        assert!(vcpu.is_running());
        assert!(matches!(vcpu.resume(), Err(Error::AlreadyRunning)));
        vcpu.stop().unwrap();
        vcpu.stop().unwrap();
        assert!(!vcpu.is_running());
        assert_eq!(vcpu.resume_count(), 1);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let mut vcpu = SoftVcpu::with_frequency(24_000_000);
        for reg in SysReg::ALL {
            vcpu.write_sys_reg(reg, u64::MAX).unwrap();
        }
        assert_eq!(vcpu.read_sys_reg(SysReg::CntvCval).unwrap(), u64::MAX);
        let mut regs = Registers::default();
        regs.sp = 0x1ffff0;
        vcpu.write_registers(&regs).unwrap();

        vcpu.reset().unwrap();
        assert_eq!(vcpu.read_registers().unwrap(), Registers::default());
        for reg in SysReg::ALL {
            assert_eq!(vcpu.read_sys_reg(reg).unwrap(), 0);
        }
        assert_eq!(vcpu.counter_frequency(), 24_000_000);
    }
}
