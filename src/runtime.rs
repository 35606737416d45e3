//! Async guest supervision.
//!
//! The runtime owns a set-up [`Guest`] and feeds it traps from a channel.
//! Hypercalls go to a [`HypercallHandler`], which works on guest memory while
//! the vCPU is parked and decides whether the guest continues.
//!
//! # Example
//!
//! ```rust,no_run
//! use hvtvmm::runtime::{Completion, GuestRuntime, HypercallHandler};
//! use hvtvmm::{GuestMemory, HypercallRequest, Result};
//!
//! struct Console;
//!
//! impl HypercallHandler for Console {
//!     async fn handle(
//!         &mut self,
//!         _req: &HypercallRequest,
//!         _mem: &mut GuestMemory,
//!     ) -> Result<Completion> {
//!         Ok(Completion::Resume)
//!     }
//! }
//!
//! # async fn run(guest: hvtvmm::Guest<hvtvmm::SoftVcpu>) -> Result<()> {
//! let (handle, traps) = GuestRuntime::new(guest, Console).spawn();
//! // The hypervisor glue forwards each trap through `traps`.
//! drop(traps);
//! let exit = handle.wait().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::VcpuBackend;
use crate::error::{Error, Result};
use crate::fault::{FatalReason, HypercallRequest, Outcome, TrapEvent};
use crate::guest::Guest;
use crate::hypercall::{HaltArgs, Hypercall};
use crate::memory::GuestMemory;

/// Traps buffered between the hypervisor glue and the runtime.
pub const TRAP_QUEUE_DEPTH: usize = 64;

/// What to do with the guest once a hypercall has been served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Resume,
    Stop,
}

/// Services hypercalls for a guest.
///
/// The vCPU is parked for as long as the returned future runs, so the
/// handler has exclusive access to guest memory.
pub trait HypercallHandler: Send {
    fn handle(
        &mut self,
        req: &HypercallRequest,
        mem: &mut GuestMemory,
    ) -> impl Future<Output = Result<Completion>> + Send;
}

/// Commands to control the runtime.
#[derive(Debug)]
pub enum RuntimeCommand {
    /// Park the guest and leave the run loop.
    Stop,
}

/// Why the run loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    /// The guest issued the halt hypercall.
    Halted { exit_status: i32 },
    Fatal(FatalReason),
    /// Stopped on request, by command or by the handler.
    Stopped,
    /// The trap source went away.
    Disconnected,
}

/// Handle to control a spawned runtime.
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    task: JoinHandle<Result<RunExit>>,
}

impl RuntimeHandle {
    /// Ask the run loop to park the guest and exit.
    ///
    /// Fails with [`Error::NotRunning`] once the loop has already returned.
    pub async fn stop(&self) -> Result<()> {
        self.cmd_tx
            .send(RuntimeCommand::Stop)
            .await
            .map_err(|_| Error::NotRunning)
    }

    /// Wait for the run loop to finish.
    pub async fn wait(self) -> Result<RunExit> {
        self.task
            .await
            .map_err(|e| Error::Runtime(format!("runtime task failed: {e}")))?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Guest runtime driving one guest.
pub struct GuestRuntime<B: VcpuBackend, H: HypercallHandler> {
    guest: Guest<B>,
    handler: H,
}

impl<B: VcpuBackend, H: HypercallHandler> GuestRuntime<B, H> {
    /// Wrap a guest that has been set up.
    pub fn new(guest: Guest<B>, handler: H) -> Self {
        Self { guest, handler }
    }

    pub fn guest(&self) -> &Guest<B> {
        &self.guest
    }

    pub fn into_inner(self) -> (Guest<B>, H) {
        (self.guest, self.handler)
    }

    /// Resume the guest and serve traps until it exits.
    ///
    /// A closed command channel is ignored; a closed trap channel parks the
    /// guest and ends the loop. A stop command is honoured while a
    /// hypercall handler is still pending; the handler future is dropped.
    pub async fn run(
        &mut self,
        traps: &mut mpsc::Receiver<TrapEvent>,
        commands: &mut mpsc::Receiver<RuntimeCommand>,
    ) -> Result<RunExit> {
        self.guest.resume(0)?;
        log::info!("guest running");

        let mut commands = Commands {
            rx: commands,
            open: true,
        };
        loop {
            tokio::select! {
                biased;

                stop = commands.stop_requested(), if commands.open => {
                    if stop {
                        log::info!("stop requested");
                        self.guest.stop(0)?;
                        return Ok(RunExit::Stopped);
                    }
                }

                event = traps.recv() => {
                    let Some(event) = event else {
                        log::warn!("trap channel closed, stopping guest");
                        self.guest.stop(0)?;
                        return Ok(RunExit::Disconnected);
                    };
                    if let Some(exit) = self.on_trap(&event, &mut commands).await? {
                        log::info!("guest exited: {:?}", exit);
                        return Ok(exit);
                    }
                }
            }
        }
    }

    async fn on_trap(
        &mut self,
        event: &TrapEvent,
        commands: &mut Commands<'_>,
    ) -> Result<Option<RunExit>> {
        let req = match self.guest.dispatch(0, event)? {
            Outcome::Handled => return Ok(None),
            Outcome::Fatal(reason) => return Ok(Some(RunExit::Fatal(reason))),
            Outcome::Hypercall(req) => req,
        };

        // The vCPU is parked by dispatch, so dropping the handler leaves it stopped
        let completion = {
            let handled = self.handler.handle(&req, self.guest.memory_mut());
            tokio::pin!(handled);
            loop {
                tokio::select! {
                    biased;

                    stop = commands.stop_requested(), if commands.open => {
                        if stop {
                            log::info!("stop requested while {} was pending", req.id);
                            return Ok(Some(RunExit::Stopped));
                        }
                    }

                    result = &mut handled => break result?,
                }
            }
        };

        if req.id == Hypercall::Halt {
            let args: HaltArgs = req.args(self.guest.memory())?;
            return Ok(Some(RunExit::Halted {
                exit_status: args.exit_status,
            }));
        }
        match completion {
            Completion::Resume => {
                self.guest.resume(0)?;
                Ok(None)
            }
            Completion::Stop => Ok(Some(RunExit::Stopped)),
        }
    }
}

/// Command side of the run loop.
struct Commands<'a> {
    rx: &'a mut mpsc::Receiver<RuntimeCommand>,
    open: bool,
}

impl Commands<'_> {
    /// Wait for the next command. `false` once the channel has closed.
    async fn stop_requested(&mut self) -> bool {
        match self.rx.recv().await {
            Some(RuntimeCommand::Stop) => true,
            None => {
                self.open = false;
                false
            }
        }
    }
}

impl<B, H> GuestRuntime<B, H>
where
    B: VcpuBackend + 'static,
    H: HypercallHandler + 'static,
{
    /// Run on a tokio task.
    ///
    /// Returns a handle to control the runtime and the sender the
    /// hypervisor glue delivers traps through.
    pub fn spawn(self) -> (RuntimeHandle, mpsc::Sender<TrapEvent>) {
        let (trap_tx, mut trap_rx) = mpsc::channel(TRAP_QUEUE_DEPTH);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);

        let task = tokio::spawn(async move {
            let mut runtime = self;
            runtime.run(&mut trap_rx, &mut cmd_rx).await
        });

        (RuntimeHandle { cmd_tx, task }, trap_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftVcpu;
    use crate::builder::GuestBuilder;
    use crate::guest::VcpuState;
    use crate::hypercall::{hypercall_address, GuestArgs, PutsArgs};
    use crate::test_util::ElfBuilder;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;

    const PUTS_ARGS: u64 = 0x1f000;
    const HALT_ARGS: u64 = 0x1f100;
    const TEXT: u64 = 0x1f200;

    #[derive(Default)]
    struct Console {
        out: Arc<Mutex<Vec<u8>>>,
        calls: Vec<Hypercall>,
        stop_after_puts: bool,
    }

    impl HypercallHandler for Console {
        async fn handle(
            &mut self,
            req: &HypercallRequest,
            mem: &mut GuestMemory,
        ) -> Result<Completion> {
            self.calls.push(req.id);
            if req.id == Hypercall::Puts {
                let args: PutsArgs = req.args(mem)?;
                self.out.lock().unwrap().extend_from_slice(args.data(mem)?);
                if self.stop_after_puts {
                    return Ok(Completion::Stop);
                }
            }
            Ok(Completion::Resume)
        }
    }

    /// Never completes once entered.
    struct Stuck {
        entered: Arc<Notify>,
    }

    impl HypercallHandler for Stuck {
        async fn handle(
            &mut self,
            _req: &HypercallRequest,
            _mem: &mut GuestMemory,
        ) -> Result<Completion> {
            self.entered.notify_one();
            std::future::pending::<()>().await;
            Ok(Completion::Resume)
        }
    }

    fn guest() -> Guest<SoftVcpu> {
        let elf = ElfBuilder::new(0x100000)
            .segment(0x100000, &[0; 0x100], 0x100, 0x1000)
            .solo5(&[])
            .build();
        let mut guest = GuestBuilder::new()
            .memory_size(0x200000)
            .build(SoftVcpu::new())
            .unwrap();
        guest.setup(0, &elf, b"", 0).unwrap();

        let mem = guest.memory_mut();
        mem.write(TEXT, b"hello\n").unwrap();
        PutsArgs { data: TEXT, len: 6 }.write(mem, PUTS_ARGS).unwrap();
        HaltArgs { cookie: 0, exit_status: 42, _pad: 0 }
            .write(mem, HALT_ARGS)
            .unwrap();

        let mut regs = guest.vcpu().read_registers().unwrap();
        regs.x[3] = PUTS_ARGS;
        regs.x[4] = HALT_ARGS;
        guest.vcpu_mut().write_registers(&regs).unwrap();
        guest
    }

    fn store(call: Hypercall, srt: u64) -> TrapEvent {
        TrapEvent::VmFault {
            addr: hypercall_address(call.number()),
            fsr: (1 << 24) | (1 << 25) | (1 << 6) | (srt << 16),
            ip: 0x100000,
            prefetch: false,
        }
    }

    #[tokio::test]
    async fn test_puts_then_halt() {
        let console = Console::default();
        let out = console.out.clone();
        let (handle, traps) = GuestRuntime::new(guest(), console).spawn();

        traps.send(store(Hypercall::Puts, 3)).await.unwrap();
        traps.send(store(Hypercall::Halt, 4)).await.unwrap();

        let exit = handle.wait().await.unwrap();
        assert_eq!(exit, RunExit::Halted { exit_status: 42 });
        assert_eq!(out.lock().unwrap().as_slice(), b"hello\n");
    }

    #[tokio::test]
    async fn test_run_in_place() {
        let mut runtime = GuestRuntime::new(guest(), Console::default());
        let (trap_tx, mut trap_rx) = mpsc::channel(8);
        let (_cmd_tx, mut cmd_rx) = mpsc::channel(1);

        trap_tx.send(store(Hypercall::Puts, 3)).await.unwrap();
        trap_tx.send(store(Hypercall::Walltime, 3)).await.unwrap();
        trap_tx.send(store(Hypercall::Halt, 4)).await.unwrap();

        let exit = runtime.run(&mut trap_rx, &mut cmd_rx).await.unwrap();
        assert_eq!(exit, RunExit::Halted { exit_status: 42 });

        let (guest, console) = runtime.into_inner();
        assert_eq!(guest.state(), VcpuState::Halted);
        assert_eq!(
            console.calls,
            [Hypercall::Puts, Hypercall::Walltime, Hypercall::Halt]
        );
        // Three stores, each skipped
        assert_eq!(guest.vcpu().read_registers().unwrap().pc, 0x100000 + 12);
    }

    #[tokio::test]
    async fn test_stop_command() {
        let (handle, _traps) = GuestRuntime::new(guest(), Console::default()).spawn();
        handle.stop().await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), RunExit::Stopped);
    }

    #[tokio::test]
    async fn test_handler_stops_guest() {
        let console = Console {
            stop_after_puts: true,
            ..Console::default()
        };
        let mut runtime = GuestRuntime::new(guest(), console);
        let (trap_tx, mut trap_rx) = mpsc::channel(8);
        let (_cmd_tx, mut cmd_rx) = mpsc::channel(1);
        trap_tx.send(store(Hypercall::Puts, 3)).await.unwrap();

        let exit = runtime.run(&mut trap_rx, &mut cmd_rx).await.unwrap();
        assert_eq!(exit, RunExit::Stopped);
        assert_eq!(runtime.guest().state(), VcpuState::Stopped);
    }

    #[tokio::test]
    async fn test_fatal_trap() {
        let (handle, traps) = GuestRuntime::new(guest(), Console::default()).spawn();
        traps
            .send(TrapEvent::VmFault {
                addr: 0x20_0000_0000,
                fsr: 1 << 24,
                ip: 0x100010,
                prefetch: false,
            })
            .await
            .unwrap();

        match handle.wait().await.unwrap() {
            RunExit::Fatal(FatalReason::MemoryFault { addr, hypercall, .. }) => {
                assert_eq!(addr, 0x20_0000_0000);
                assert!(hypercall.is_some());
            }
            other => panic!("unexpected exit {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_trap_source_dropped() {
        let (handle, traps) = GuestRuntime::new(guest(), Console::default()).spawn();
        drop(traps);
        assert_eq!(handle.wait().await.unwrap(), RunExit::Disconnected);
    }

    #[tokio::test]
    async fn test_run_requires_setup() {
        let guest = GuestBuilder::new()
            .memory_size(0x200000)
            .build(SoftVcpu::new())
            .unwrap();
        let (handle, _traps) = GuestRuntime::new(guest, Console::default()).spawn();
        assert!(matches!(handle.wait().await, Err(Error::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_stop_while_handler_pending() {
        let entered = Arc::new(Notify::new());
        let handler = Stuck {
            entered: entered.clone(),
        };
        let (handle, traps) = GuestRuntime::new(guest(), handler).spawn();

        traps.send(store(Hypercall::Walltime, 3)).await.unwrap();
        entered.notified().await;
        handle.stop().await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("run loop ignored stop")
            .unwrap();
        assert_eq!(exit, RunExit::Stopped);
    }

    #[tokio::test]
    async fn test_pending_handler_dropped_in_place() {
        let entered = Arc::new(Notify::new());
        let mut runtime = GuestRuntime::new(
            guest(),
            Stuck {
                entered: entered.clone(),
            },
        );
        let (trap_tx, mut trap_rx) = mpsc::channel(8);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        trap_tx.send(store(Hypercall::Poll, 3)).await.unwrap();

        let stopper = tokio::spawn(async move {
            entered.notified().await;
            cmd_tx.send(RuntimeCommand::Stop).await.unwrap();
        });
        let exit = runtime.run(&mut trap_rx, &mut cmd_rx).await.unwrap();
        stopper.await.unwrap();

        assert_eq!(exit, RunExit::Stopped);
        assert_eq!(runtime.guest().state(), VcpuState::Stopped);
        assert!(!runtime.guest().vcpu().is_running());
    }

    #[tokio::test]
    async fn test_stop_after_exit() {
        let (handle, traps) = GuestRuntime::new(guest(), Console::default()).spawn();
        drop(traps);
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(handle.stop().await, Err(Error::NotRunning)));
        assert_eq!(handle.wait().await.unwrap(), RunExit::Disconnected);
    }

    #[tokio::test]
    async fn test_timer_event_ends_run() {
        let (handle, traps) = GuestRuntime::new(guest(), Console::default()).spawn();
        traps.send(TrapEvent::VppiEvent { irq: 27 }).await.unwrap();
        assert!(matches!(
            handle.wait().await.unwrap(),
            RunExit::Fatal(FatalReason::Unexpected { detail: 27, .. })
        ));
    }
}
