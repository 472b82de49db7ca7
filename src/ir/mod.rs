//! The intermediate representation.
//!
//! Native instructions are lifted into sequences of stack-machine
//! [`Command`]s grouped into [`IrBlock`]s. Every command records its VM
//! stack effect; every block carries exactly one exit descriptor. Blocks
//! live in an [`IrArena`] and reference each other by [`IrBlockRef`].

mod block;
mod command;
pub mod condcodes;
pub mod flags;

pub use block::{Exit, ExitTarget, IrArena, IrBlock, IrBlockRef, PreoptBlock, VM_UNASSIGNED};
pub use command::{BinaryOp, Command, CtxSlot, HandlerKey, HandlerKind, StackEffect};
