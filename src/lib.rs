//! # hvtvmm
//!
//! Guest-facing core of a single-vCPU unikernel monitor speaking the Solo5
//! HVT protocol on aarch64.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hvtvmm::{GuestBuilder, Result, SoftVcpu};
//!
//! fn main() -> Result<()> {
//!     let image = std::fs::read("hello.hvt").map_err(|e| hvtvmm::Error::Runtime(e.to_string()))?;
//!
//!     let mut guest = GuestBuilder::new()
//!         .memory_size(32 * 1024 * 1024)
//!         .build(SoftVcpu::new())?;
//!     let info = guest.setup(0, &image, b"--hello", 0)?;
//!     println!("kernel ends at 0x{:x}", info.kernel_end);
//!
//!     guest.resume(0)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Layers
//!
//! - [`loader`]: ELF64 validation and loading, Solo5 note extraction
//! - [`memory`]: guest RAM and the translation tables built inside it
//! - [`boot`]: boot info record, command line and device manifest
//! - [`fault`]: trap decoding into hypercall requests
//! - [`runtime`]: tokio run loop handing hypercalls to a handler
//!
//! The privileged vCPU primitive sits behind [`VcpuBackend`].

pub mod arch;
pub mod arith;
pub mod backend;
pub mod boot;
mod builder;
pub mod debug;
mod error;
pub mod fault;
mod guest;
pub mod hypercall;
pub mod loader;
pub mod memory;
pub mod runtime;

#[cfg(test)]
mod test_util;

#[doc(hidden)]
pub use log as __log;

// Re-exports
pub use backend::{Registers, SoftVcpu, SysReg, VcpuBackend};
pub use boot::{BootInfo, Manifest, ManifestEntry};
pub use builder::GuestBuilder;
pub use error::{BootError, Error, LoadError, NoteError, Result};
pub use fault::{FatalReason, HypercallRequest, Outcome, TrapEvent};
pub use guest::{Guest, VcpuState};
pub use hypercall::Hypercall;
pub use loader::LoadResult;
pub use memory::GuestMemory;
pub use runtime::{Completion, GuestRuntime, HypercallHandler, RunExit, RuntimeHandle};
