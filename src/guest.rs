//! Guest lifecycle.
//!
//! A [`Guest`] owns the memory, the single vCPU and its logical state:
//!
//! ```text
//!  Uninitialized --setup--> Stopped --resume--> Running
//!                           ^  ^                 |  |
//!                           |  +--stop/fault-----+  |
//!                           |                       | halt hypercall
//!                           +------clear------- Halted
//! ```
//!
//! Every operation takes the vCPU id and refuses anything but 0.

use std::sync::atomic::{fence, Ordering};

use crate::arch::{init, layout};
use crate::backend::{Registers, SysReg, VcpuBackend};
use crate::boot::{self, BootInfo, Manifest};
use crate::error::{Error, Result};
use crate::fault::{self, Outcome, TrapEvent};
use crate::hypercall::Hypercall;
use crate::loader;
use crate::memory::{self, GuestMemory};

/// Logical state of the guest's vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// Nothing loaded yet.
    Uninitialized,
    /// Parked; ready to resume.
    Stopped,
    Running,
    /// The guest asked to terminate.
    Halted,
}

impl std::fmt::Display for VcpuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VcpuState::Uninitialized => write!(f, "uninitialized"),
            VcpuState::Stopped => write!(f, "stopped"),
            VcpuState::Running => write!(f, "running"),
            VcpuState::Halted => write!(f, "halted"),
        }
    }
}

/// A single-vCPU HVT guest.
///
/// Use [`GuestBuilder`](crate::GuestBuilder) to create one.
///
/// # Example
///
/// ```rust,no_run
/// use hvtvmm::{GuestBuilder, SoftVcpu};
///
/// # fn image() -> Vec<u8> { Vec::new() }
/// let mut guest = GuestBuilder::new()
///     .memory_size(32 * 1024 * 1024)
///     .build(SoftVcpu::new())?;
/// guest.setup(0, &image(), b"--verbose", 0)?;
/// guest.resume(0)?;
/// # Ok::<(), hvtvmm::Error>(())
/// ```
pub struct Guest<B: VcpuBackend> {
    vcpu: B,
    memory: GuestMemory,
    mem_size: u64,
    min_load: u64,
    state: VcpuState,
    boot_info: Option<BootInfo>,
    manifest: Option<Manifest>,
}

impl<B: VcpuBackend> Guest<B> {
    pub(crate) fn new(
        vcpu: B,
        memory: GuestMemory,
        mem_size: u64,
        min_load: u64,
    ) -> Self {
        Self {
            vcpu,
            memory,
            mem_size,
            min_load,
            state: VcpuState::Uninitialized,
            boot_info: None,
            manifest: None,
        }
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    /// Guest RAM size in bytes.
    pub fn mem_size(&self) -> u64 {
        self.mem_size
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// Guest memory, for hypercall handlers working on a parked vCPU.
    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.memory
    }

    pub fn vcpu(&self) -> &B {
        &self.vcpu
    }

    pub fn vcpu_mut(&mut self) -> &mut B {
        &mut self.vcpu
    }

    /// Boot record published by the last successful setup.
    pub fn boot_info(&self) -> Option<&BootInfo> {
        self.boot_info.as_ref()
    }

    /// Manifest of the loaded executable.
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    fn check_vcpu(vcpu_id: usize) -> Result<()> {
        if vcpu_id != 0 {
            return Err(Error::InvalidVcpuId(vcpu_id));
        }
        Ok(())
    }

    /// Load `elf` and prepare the vCPU to enter it.
    ///
    /// `cmdline` is passed to the guest without its terminator. A non-zero
    /// `max_stack` reserves that many bytes between the end of the loaded
    /// image and the initial stack pointer.
    ///
    /// Runs note validation, the ELF load, boot argument publication, the
    /// address-space build and register programming, in that order. Ends in
    /// `Stopped`; the guest runs after [`Guest::resume`].
    pub fn setup(
        &mut self,
        vcpu_id: usize,
        elf: &[u8],
        cmdline: &[u8],
        max_stack: u64,
    ) -> Result<BootInfo> {
        Self::check_vcpu(vcpu_id)?;
        match self.state {
            VcpuState::Uninitialized | VcpuState::Stopped => {}
            _ => {
                return Err(Error::InvalidState {
                    expected: "uninitialized or stopped".to_string(),
                    actual: self.state.to_string(),
                })
            }
        }

        // Anything published by an earlier setup is stale from here on
        self.boot_info = None;
        self.manifest = None;

        memory::validate_mem_size(self.mem_size)?;
        if (self.memory.size() as u64) < self.mem_size {
            return Err(Error::MemoryTooSmall {
                have: self.memory.size() as u64,
                need: self.mem_size,
            });
        }
        boot::check_cmdline(cmdline)?;

        let abi = boot::read_abi(elf)?;
        let manifest = boot::read_manifest(elf)?;
        crate::debug_setup!(
            "ABI target {} version {}, {} manifest entries",
            abi.abi_target,
            abi.abi_version,
            manifest.entries().len()
        );

        let load = loader::load(elf, &mut self.memory, self.mem_size, self.min_load)?;
        log::info!("loaded guest: entry=0x{:x} end=0x{:x}", load.entry, load.end);

        let stack_top = self.mem_size - init::STACK_TOP_OFFSET;
        if max_stack != 0 {
            let fits = load
                .end
                .checked_add(max_stack)
                .is_some_and(|limit| limit <= stack_top);
            if !fits {
                return Err(Error::StackTooLarge {
                    stack: max_stack,
                    kernel_end: load.end,
                });
            }
        }

        let info = boot::publish(
            &mut self.memory,
            &load,
            self.mem_size,
            self.vcpu.counter_frequency(),
            cmdline,
            manifest.as_bytes(),
        )?;

        memory::build_address_space(&mut self.memory, self.mem_size)?;
        self.setup_system_registers(stack_top)?;
        self.setup_user_context(load.entry)?;

        self.boot_info = Some(info);
        self.manifest = Some(manifest);
        self.state = VcpuState::Stopped;
        log::info!(
            "guest ready: mem_size=0x{:x} devices={}",
            self.mem_size,
            self.manifest.as_ref().map_or(0, |m| m.devices().len())
        );
        Ok(info)
    }

    fn setup_system_registers(&mut self, stack_top: u64) -> Result<()> {
        let cpacr = self.vcpu.read_sys_reg(SysReg::Cpacr)?;
        let cpacr = (cpacr & !init::FPEN_MASK) | init::CPACR_INIT;

        let values = [
            (SysReg::Cpacr, cpacr),
            (SysReg::Mair, init::MAIR_EL1_INIT),
            (SysReg::Tcr, init::TCR_EL1_INIT),
            (SysReg::Ttbr0, layout::PGD_BASE),
            (SysReg::Sctlr, init::SCTLR_EL1_INIT),
            (SysReg::SpsrEl1, init::PSTATE_INIT),
            (SysReg::SpEl1, stack_top),
        ];
        for (reg, value) in values {
            self.vcpu.write_sys_reg(reg, value)?;
            crate::debug_setup!("{} = 0x{:x}", reg, value);
        }
        Ok(())
    }

    fn setup_user_context(&mut self, entry: u64) -> Result<()> {
        let mut regs = Registers {
            pc: entry,
            spsr: init::TCB_SPSR_INIT,
            ..Registers::default()
        };
        regs.set_gpr(0, layout::BOOT_INFO);
        self.vcpu.write_registers(&regs)?;
        crate::debug_setup!("pc = 0x{:x}, x0 = 0x{:x}", entry, layout::BOOT_INFO);
        Ok(())
    }

    /// Let the guest run.
    ///
    /// Host writes into guest memory made while the vCPU was parked are
    /// published with a release fence first.
    pub fn resume(&mut self, vcpu_id: usize) -> Result<()> {
        Self::check_vcpu(vcpu_id)?;
        match self.state {
            VcpuState::Stopped => {
                fence(Ordering::Release);
                self.vcpu.resume()?;
                self.state = VcpuState::Running;
                log::debug!("guest resumed");
                Ok(())
            }
            VcpuState::Running => Err(Error::AlreadyRunning),
            _ => Err(Error::InvalidState {
                expected: "stopped".to_string(),
                actual: self.state.to_string(),
            }),
        }
    }

    /// Park the vCPU. A running guest becomes `Stopped`; other states are kept.
    pub fn stop(&mut self, vcpu_id: usize) -> Result<()> {
        Self::check_vcpu(vcpu_id)?;
        self.vcpu.stop()?;
        if self.state == VcpuState::Running {
            self.state = VcpuState::Stopped;
        }
        log::debug!("guest stopped ({})", self.state);
        Ok(())
    }

    /// Stop the guest, zero its memory and reset every register.
    ///
    /// Always ends in `Stopped`, ready for another [`Guest::setup`].
    pub fn clear(&mut self, vcpu_id: usize) -> Result<()> {
        Self::check_vcpu(vcpu_id)?;
        self.vcpu.stop()?;
        self.memory.clear();
        self.vcpu.reset()?;
        self.boot_info = None;
        self.manifest = None;
        self.state = VcpuState::Stopped;
        log::info!("guest cleared");
        Ok(())
    }

    /// Decode a trap taken by the running guest.
    ///
    /// Hypercalls leave the vCPU `Stopped` until the handler resumes it,
    /// except `Halt`, which leaves it `Halted`. Fatal traps leave it `Stopped`.
    pub fn dispatch(&mut self, vcpu_id: usize, event: &TrapEvent) -> Result<Outcome> {
        Self::check_vcpu(vcpu_id)?;
        if self.state != VcpuState::Running {
            return Err(Error::NotRunning);
        }

        let outcome = match fault::dispatch(&mut self.vcpu, event, &self.memory) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("trap decode failed: {}", e);
                // Best effort; the register error is what gets reported
                let _ = self.vcpu.stop();
                self.state = VcpuState::Stopped;
                return Err(e);
            }
        };

        match &outcome {
            Outcome::Hypercall(req) if req.id == Hypercall::Halt => {
                self.state = VcpuState::Halted;
            }
            Outcome::Hypercall(_) => self.state = VcpuState::Stopped,
            Outcome::Fatal(reason) => {
                log::warn!("guest stopped after fatal {} trap: {}", event.label(), reason);
                self.state = VcpuState::Stopped;
            }
            Outcome::Handled => {}
        }
        Ok(outcome)
    }
}

impl<B: VcpuBackend> std::fmt::Debug for Guest<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guest")
            .field("backend", &self.vcpu.name())
            .field("state", &self.state)
            .field("mem_size", &format_args!("0x{:x}", self.mem_size))
            .field("boot_info", &self.boot_info)
            .finish()
    }
}
