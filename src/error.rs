//! Error taxonomy for the virtualization pipeline.
//!
//! Each phase returns a [`VirtResult`]; a failure aborts the pipeline for the
//! current unit of compilation and no partial output is emitted. The only
//! phase that retries internally is the register allocator.

use crate::codec::Gpr;
use crate::ir::IrBlockRef;
use thiserror::Error;

/// A convenient alias for a `Result` that uses [`VirtError`].
pub type VirtResult<T> = Result<T, VirtError>;

/// Everything that can go wrong while virtualizing one region of code.
#[derive(Debug, Error)]
pub enum VirtError {
    /// The raw decoder rejected a byte sequence.
    #[error("decoder rejected byte sequence at rva {0:#x}")]
    Decode(u64),

    /// An instruction decoded fine but has no lifter.
    #[error("unsupported instruction {mnemonic} at rva {rva:#x}")]
    UnsupportedInstruction {
        /// Printable mnemonic of the offending instruction.
        mnemonic: String,
        /// Address of the offending instruction.
        rva: u64,
    },

    /// Control flow left the disassembled range where an internal successor
    /// was required.
    #[error("control flow leaves [{start:#x}, {end:#x}) via rva {rva:#x}")]
    OutOfRange {
        /// The escaping target address.
        rva: u64,
        /// Inclusive start of the disassembled range.
        start: u64,
        /// Exclusive end of the disassembled range.
        end: u64,
    },

    /// Predecessors of a block disagree about the VM stack depth at its
    /// entry, or a VM exit was reached with a non-empty stack. Indicates a
    /// lifter bug, not bad input.
    #[error("VM stack depth disagrees at entry of {0}")]
    StackImbalance(IrBlockRef),

    /// The allocator could not place every scatter fragment of a guest
    /// register within its retry bound.
    #[error("could not place scatter ranges for guest register {0}")]
    AllocationFailure(Gpr),

    /// A label was still unbound when the emit pass needed its address.
    #[error("label `{0}` reached emission unresolved")]
    UnresolvedLabel(String),

    /// The raw encoder rejected an instruction.
    #[error("encoder rejected {mnemonic}: {reason}")]
    EncodingFailure {
        /// Printable mnemonic of the rejected instruction.
        mnemonic: String,
        /// Reason string reported by the encoder.
        reason: String,
    },
}
