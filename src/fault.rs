//! Trap decoding.
//!
//! The vCPU is already parked when a trap reaches the monitor. A stage-2
//! data abort on a store into the hypercall window is the only way a guest
//! talks to the monitor: the instruction syndrome names the register holding
//! the argument pointer, the faulting address names the hypercall. Every
//! other trap, timer events included, is fatal for the guest.

use crate::arch::esr;
use crate::backend::{Registers, SysReg, VcpuBackend};
use crate::error::Result;
use crate::hypercall::{self, GuestArgs, Hypercall};
use crate::memory::GuestMemory;

/// A trap delivered for the guest's vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapEvent {
    /// Stage-2 memory fault.
    VmFault {
        addr: u64,
        fsr: u64,
        ip: u64,
        prefetch: bool,
    },
    /// Illegal instruction or arithmetic trap raised by the guest.
    UserException { ip: u64, number: u64, code: u64 },
    UnknownSyscall { ip: u64, syscall: u64 },
    VgicMaintenance { idx: u64 },
    VcpuFault { hsr: u64 },
    /// Virtual PPI (timer) event.
    VppiEvent { irq: u64 },
    /// Trap label the monitor does not know.
    Unknown { label: u64 },
}

impl TrapEvent {
    pub fn label(&self) -> &'static str {
        match self {
            TrapEvent::VmFault { .. } => "virtual memory",
            TrapEvent::UserException { .. } => "user exception",
            TrapEvent::UnknownSyscall { .. } => "unknown syscall",
            TrapEvent::VgicMaintenance { .. } => "VGIC maintenance",
            TrapEvent::VcpuFault { .. } => "vCPU",
            TrapEvent::VppiEvent { .. } => "VPPI event",
            TrapEvent::Unknown { .. } => "unknown fault",
        }
    }
}

/// Decoded data abort instruction syndrome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Syndrome {
    /// Instruction syndrome valid.
    pub isv: bool,
    /// 32-bit instruction.
    pub il: bool,
    pub write: bool,
    /// Transfer register index, 31 is the zero register.
    pub srt: usize,
}

impl Syndrome {
    pub fn decode(fsr: u64) -> Self {
        Self {
            isv: (fsr >> esr::ISV_SHIFT) & 1 != 0,
            il: (fsr >> esr::IL_SHIFT) & 1 != 0,
            write: (fsr >> esr::WNR_SHIFT) & 1 != 0,
            srt: ((fsr >> esr::SRT_SHIFT) & esr::SRT_MASK) as usize,
        }
    }

    /// Fully decoded 32-bit store.
    pub fn is_decoded_store(&self) -> bool {
        self.isv && self.il && self.write
    }
}

impl std::fmt::Display for Syndrome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "isv={} il={} write={} srt={}",
            self.isv as u8, self.il as u8, self.write as u8, self.srt
        )
    }
}

/// A hypercall waiting for its handler.
///
/// Produced once per trap; the vCPU stays parked until the request has been
/// handled and the guest is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypercallRequest {
    pub id: Hypercall,
    /// Guest address of the argument structure.
    pub operand: u64,
    /// Registers as they were at the trap, before the PC was advanced.
    pub regs: Registers,
}

impl HypercallRequest {
    /// Host address of the argument structure.
    pub fn operand_ptr(&self, mem: &GuestMemory) -> Result<*const u8> {
        mem.host_ptr(self.operand)
    }

    pub fn args<T: GuestArgs>(&self, mem: &GuestMemory) -> Result<T> {
        T::read(mem, self.operand)
    }

    pub fn write_args<T: GuestArgs>(&self, mem: &mut GuestMemory, args: &T) -> Result<()> {
        args.write(mem, self.operand)
    }
}

/// Why a trap ended the guest.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    #[error(
        "memory fault at 0x{addr:x}: ip=0x{ip:x} fsr=0x{fsr:x} {syndrome} value=0x{value:x}"
    )]
    MemoryFault {
        addr: u64,
        fsr: u64,
        ip: u64,
        prefetch: bool,
        syndrome: Syndrome,
        /// Contents of the transfer register.
        value: u64,
        /// Hypercall number the address would map to.
        hypercall: Option<u64>,
    },

    #[error("user exception at ip=0x{ip:x}: number=0x{number:x} code=0x{code:x}")]
    UserException { ip: u64, number: u64, code: u64 },

    #[error("unexpected {label} fault: 0x{detail:x}")]
    Unexpected { label: &'static str, detail: u64 },
}

/// Result of decoding one trap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Hypercall(HypercallRequest),
    /// The trap needed no action; the vCPU keeps running.
    Handled,
    Fatal(FatalReason),
}

/// Decode `event` for the parked vCPU.
///
/// A recognised hypercall stops the vCPU, advances its PC past the trapping
/// store and writes the registers back before the request is returned, so
/// the store is never re-executed. Fatal traps stop the vCPU and leave its
/// state intact for inspection.
pub fn dispatch<B: VcpuBackend + ?Sized>(
    vcpu: &mut B,
    event: &TrapEvent,
    mem: &GuestMemory,
) -> Result<Outcome> {
    match *event {
        TrapEvent::VmFault {
            addr,
            fsr,
            ip,
            prefetch,
        } => vm_fault(vcpu, mem, addr, fsr, ip, prefetch),
        TrapEvent::UserException { ip, number, code } => {
            fatal(vcpu, FatalReason::UserException { ip, number, code })
        }
        TrapEvent::UnknownSyscall { syscall: detail, .. }
        | TrapEvent::VgicMaintenance { idx: detail }
        | TrapEvent::VcpuFault { hsr: detail }
        | TrapEvent::VppiEvent { irq: detail }
        | TrapEvent::Unknown { label: detail } => fatal(
            vcpu,
            FatalReason::Unexpected {
                label: event.label(),
                detail,
            },
        ),
    }
}

fn vm_fault<B: VcpuBackend + ?Sized>(
    vcpu: &mut B,
    mem: &GuestMemory,
    addr: u64,
    fsr: u64,
    ip: u64,
    prefetch: bool,
) -> Result<Outcome> {
    let regs = vcpu.read_registers()?;
    let syndrome = Syndrome::decode(fsr);
    let value = regs.gpr(syndrome.srt);
    let nr = hypercall::hypercall_number(addr);
    let call = nr.and_then(Hypercall::from_number);

    if let (true, Some(id)) = (syndrome.is_decoded_store(), call) {
        vcpu.stop()?;

        let mut advanced = regs;
        advanced.pc = regs.pc.wrapping_add(esr::INSTRUCTION_SIZE);
        vcpu.write_registers(&advanced)?;

        crate::debug_fault!("hypercall {} operand=0x{:x} pc=0x{:x}", id, value, regs.pc);
        return Ok(Outcome::Hypercall(HypercallRequest {
            id,
            operand: value,
            regs,
        }));
    }

    if let Ok(insn) = mem.slice(ip, 4) {
        crate::debug_fault!("instruction at 0x{:x}: {:02x?}", ip, insn);
    }
    fatal(
        vcpu,
        FatalReason::MemoryFault {
            addr,
            fsr,
            ip,
            prefetch,
            syndrome,
            value,
            hypercall: nr,
        },
    )
}

fn fatal<B: VcpuBackend + ?Sized>(vcpu: &mut B, reason: FatalReason) -> Result<Outcome> {
    log::error!("{}", reason);
    vcpu.stop()?;
    dump_registers(vcpu);
    Ok(Outcome::Fatal(reason))
}

/// Log the saved user context and system registers.
pub fn dump_registers<B: VcpuBackend + ?Sized>(vcpu: &B) {
    match vcpu.read_registers() {
        Ok(regs) => {
            crate::debug_fault!(
                "pc=0x{:016x} sp=0x{:016x} spsr=0x{:016x}",
                regs.pc,
                regs.sp,
                regs.spsr
            );
            for (i, pair) in regs.x.chunks(2).enumerate() {
                match pair {
                    [a, b] => crate::debug_fault!(
                        "x{:<2}=0x{:016x} x{:<2}=0x{:016x}",
                        i * 2,
                        a,
                        i * 2 + 1,
                        b
                    ),
                    [a] => crate::debug_fault!("x{:<2}=0x{:016x}", i * 2, a),
                    _ => {}
                }
            }
            crate::debug_fault!(
                "tpidr_el0=0x{:016x} tpidrro_el0=0x{:016x}",
                regs.tpidr_el0,
                regs.tpidr_ro_el0
            );
        }
        Err(e) => log::warn!("cannot read vCPU registers: {}", e),
    }

    for reg in SysReg::ALL {
        match vcpu.read_sys_reg(reg) {
            Ok(value) => crate::debug_fault!("{:<10}=0x{:016x}", reg.name(), value),
            Err(e) => log::warn!("cannot read {}: {}", reg, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftVcpu;
    use crate::hypercall::{hypercall_address, PutsArgs};

    fn fsr(isv: bool, il: bool, write: bool, srt: u64) -> u64 {
        ((isv as u64) << esr::ISV_SHIFT)
            | ((il as u64) << esr::IL_SHIFT)
            | ((write as u64) << esr::WNR_SHIFT)
            | (srt << esr::SRT_SHIFT)
    }

    fn parked_vcpu(pc: u64) -> SoftVcpu {
        let mut vcpu = SoftVcpu::new();
        let mut regs = Registers::default();
        regs.pc = pc;
        for i in 0..31 {
            regs.x[i] = 0x1000 + (i as u64) * 0x10;
        }
        vcpu.write_registers(&regs).unwrap();
        vcpu.resume().unwrap();
        vcpu
    }

    fn store(nr: u64, srt: u64) -> TrapEvent {
        TrapEvent::VmFault {
            addr: hypercall_address(nr),
            fsr: fsr(true, true, true, srt),
            ip: 0x100000,
            prefetch: false,
        }
    }

    #[test]
    fn test_syndrome_decode() {
        let s = Syndrome::decode(fsr(true, true, true, 17));
        assert_eq!(
            s,
            Syndrome {
                isv: true,
                il: true,
                write: true,
                srt: 17
            }
        );
        assert!(s.is_decoded_store());
        assert!(!Syndrome::decode(fsr(true, false, true, 0)).is_decoded_store());
        assert_eq!(Syndrome::decode(u64::MAX).srt, 31);
    }

    #[test]
    fn test_every_hypercall_decodes() {
        let mem = GuestMemory::new(0x1000).unwrap();
        for nr in Hypercall::FIRST..=Hypercall::LAST {
            for srt in [0u64, 5, 30] {
                let mut vcpu = parked_vcpu(0x100400);
                let outcome = dispatch(&mut vcpu, &store(nr, srt), &mem).unwrap();

                let Outcome::Hypercall(req) = outcome else {
                    panic!("hypercall {nr} via x{srt} not decoded");
                };
                assert_eq!(req.id.number(), nr);
                assert_eq!(req.operand, 0x1000 + srt * 0x10);
                assert_eq!(req.regs.pc, 0x100400);
                assert_eq!(vcpu.read_registers().unwrap().pc, 0x100404);
                assert!(!vcpu.is_running());
            }
        }
    }

    #[test]
    fn test_zero_register_operand() {
        let mem = GuestMemory::new(0x1000).unwrap();
        let mut vcpu = parked_vcpu(0x100000);
        match dispatch(&mut vcpu, &store(Hypercall::Halt.number(), 31), &mem).unwrap() {
            Outcome::Hypercall(req) => {
                assert_eq!(req.id, Hypercall::Halt);
                assert_eq!(req.operand, 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_syndrome_is_fatal() {
        let mem = GuestMemory::new(0x1000).unwrap();
        let cases = [
            fsr(false, true, true, 1),
            fsr(true, false, true, 1),
            fsr(true, true, false, 1),
        ];
        for fsr in cases {
            let mut vcpu = parked_vcpu(0x100000);
            let event = TrapEvent::VmFault {
                addr: hypercall_address(2),
                fsr,
                ip: 0x100000,
                prefetch: false,
            };
            let outcome = dispatch(&mut vcpu, &event, &mem).unwrap();
            assert!(matches!(outcome, Outcome::Fatal(FatalReason::MemoryFault { .. })));
            // PC untouched
            assert_eq!(vcpu.read_registers().unwrap().pc, 0x100000);
            assert!(!vcpu.is_running());
        }
    }

    #[test]
    fn test_out_of_range_numbers_are_fatal() {
        let mem = GuestMemory::new(0x1000).unwrap();
        for nr in [0u64, Hypercall::LAST + 1, 0x1000] {
            let mut vcpu = parked_vcpu(0x100000);
            match dispatch(&mut vcpu, &store(nr, 1), &mem).unwrap() {
                Outcome::Fatal(FatalReason::MemoryFault { hypercall, value, .. }) => {
                    assert_eq!(hypercall, Some(nr));
                    assert_eq!(value, 0x1010);
                }
                other => panic!("hypercall {nr}: unexpected outcome {other:?}"),
            }
        }

        // Below the window entirely
        let mut vcpu = parked_vcpu(0x100000);
        let event = TrapEvent::VmFault {
            addr: 0x4000,
            fsr: fsr(true, true, true, 1),
            ip: 0x100000,
            prefetch: true,
        };
        assert!(matches!(
            dispatch(&mut vcpu, &event, &mem).unwrap(),
            Outcome::Fatal(FatalReason::MemoryFault { hypercall: None, prefetch: true, .. })
        ));
    }

    #[test]
    fn test_other_traps() {
        let mem = GuestMemory::new(0x1000).unwrap();

        let mut vcpu = parked_vcpu(0x100000);
        let event = TrapEvent::UserException {
            ip: 0x100008,
            number: 0,
            code: 0x2000000,
        };
        assert_eq!(
            dispatch(&mut vcpu, &event, &mem).unwrap(),
            Outcome::Fatal(FatalReason::UserException {
                ip: 0x100008,
                number: 0,
                code: 0x2000000
            })
        );
        assert!(!vcpu.is_running());

        for event in [
            TrapEvent::UnknownSyscall { ip: 0, syscall: 3 },
            TrapEvent::VgicMaintenance { idx: 1 },
            TrapEvent::VcpuFault { hsr: 0x8600_0000 },
            TrapEvent::Unknown { label: 42 },
        ] {
            let mut vcpu = parked_vcpu(0x100000);
            let outcome = dispatch(&mut vcpu, &event, &mem).unwrap();
            assert!(matches!(outcome, Outcome::Fatal(FatalReason::Unexpected { .. })));
            assert!(!vcpu.is_running());
        }
    }

    #[test]
    fn test_timer_event_is_fatal() {
        let mem = GuestMemory::new(0x2000).unwrap();
        let mut vcpu = parked_vcpu(0x100000);
        let outcome = dispatch(&mut vcpu, &TrapEvent::VppiEvent { irq: 27 }, &mem).unwrap();
        assert_eq!(
            outcome,
            Outcome::Fatal(FatalReason::Unexpected {
                label: "VPPI event",
                detail: 27
            })
        );
        assert!(!vcpu.is_running());
        assert_eq!(vcpu.read_registers().unwrap().pc, 0x100000);
    }

    #[test]
    fn test_request_reads_arguments() {
        let mut mem = GuestMemory::new(0x2000).unwrap();
        mem.write(0x1800, b"hi").unwrap();
        PutsArgs { data: 0x1800, len: 2 }.write(&mut mem, 0x1010).unwrap();

        let mut vcpu = parked_vcpu(0x100000);
        let Outcome::Hypercall(req) =
            dispatch(&mut vcpu, &store(Hypercall::Puts.number(), 1), &mem).unwrap()
        else {
            panic!("puts not decoded");
        };
        assert_eq!(req.operand_ptr(&mem).unwrap() as u64, mem.host_address() + 0x1010);
        let args: PutsArgs = req.args(&mem).unwrap();
        assert_eq!(args.data(&mem).unwrap(), b"hi");
    }
}
