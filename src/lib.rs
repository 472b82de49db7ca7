//! Static x86-64 code virtualization.
//!
//! talonvirt ingests a region of native machine code, lifts it into a typed
//! stack-machine IR with explicit flag and memory effects, optimizes it,
//! and lowers it back to x86-64 that executes inside a bespoke virtual
//! machine embedded in the output. Guest registers are physically scattered
//! as disjoint bit ranges across several host registers under a per-VM
//! randomized schedule.
//!
//! The crate boundary is deliberately thin: bytes and addresses in, a
//! [`CompiledSection`] (bytes, exported symbols, relocations) out. Writing
//! the section into an image and executing it are the caller's business.
//!
//! ```no_run
//! use talonvirt::{MachineSettings, Virtualizer};
//!
//! # fn main() -> talonvirt::VirtResult<()> {
//! let code = [0x48, 0x01, 0xd8]; // add rax, rbx
//! let section = Virtualizer::new(MachineSettings::default().with_seed(7))
//!     .virtualize(&code, 0, 0x14000_1000)?;
//! assert!(!section.bytes.is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! The pipeline is single-threaded and synchronous; all randomness flows
//! from the one seed in [`MachineSettings`], so a fixed seed produces
//! byte-identical output.

#![warn(missing_docs)]

pub mod asm;
pub mod codec;
pub mod control;
pub mod disasm;
pub mod error;
pub mod ir;
pub mod lift;
pub mod machine;
pub mod opt;
pub mod regalloc;

mod context;

pub use asm::{CompiledSection, Reloc};
pub use context::Virtualizer;
pub use error::{VirtError, VirtResult};
pub use machine::MachineSettings;
