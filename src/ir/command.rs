//! The VM command set.
//!
//! Commands are tagged variants dispatched by kind, never through virtual
//! calls. Every variant describes its effect on the VM stack via
//! [`Command::stack_effect`], which is what the optimizer's depth check and
//! the machine lowering both consume.
//!
//! The VM stack is a stack of 8-byte slots; a slot holds a value
//! zero-extended to 64 bits and the widths recorded here are the logical
//! operand widths flowing through it.

use smallvec::SmallVec;

use crate::codec::{Gpr, OpWidth};
use crate::ir::condcodes::VmCond;
use crate::ir::flags::FlagSet;

/// Two's-complement binary operations the VM performs on its stack.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BinaryOp {
    /// Wrapping add.
    Add,
    /// Wrapping subtract.
    Sub,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
}

/// A raw 8-byte slot in the per-VM context area.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CtxSlot {
    /// Committed guest rflags.
    Rflags,
    /// Raw machine flags captured by the last flag-producing operation,
    /// before the defined-mask merge.
    ScratchFlags,
    /// Numbered scratch spill slot.
    Spill(u8),
}

impl CtxSlot {
    /// Number of spill slots reserved in every context area.
    pub const SPILL_SLOTS: u8 = 8;

    /// Byte offset of this slot within the context area.
    pub fn byte_offset(self) -> u32 {
        match self {
            CtxSlot::Rflags => 0,
            CtxSlot::ScratchFlags => 8,
            CtxSlot::Spill(n) => {
                debug_assert!(n < Self::SPILL_SLOTS);
                16 + 8 * u32::from(n)
            }
        }
    }

    /// Total byte size of a context area.
    pub fn area_size() -> u32 {
        16 + 8 * u32::from(Self::SPILL_SLOTS)
    }
}

/// Identity of a shared VM handler: command kind, operand width, and inline
/// operand count. Two call sites with equal keys share one handler body.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct HandlerKey {
    /// Kind of operation the handler implements.
    pub kind: HandlerKind,
    /// Width the handler operates at.
    pub width: OpWidth,
    /// Number of inline operands delivered in the VIP role register.
    pub operands: u8,
}

/// The handler-table kind axis.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum HandlerKind {
    /// Push the inline operand onto the VM stack.
    Push,
    /// Pop the top of the VM stack into the inline operand register.
    Pop,
    /// Replace the address on top of the stack with the loaded value.
    MemRead,
    /// Pop address and value, store the value.
    MemWrite,
    /// Pop two operands, push the result; optionally capture machine flags.
    Binary {
        /// The operation performed.
        op: BinaryOp,
        /// Whether raw machine flags are captured to the scratch slot.
        captures_flags: bool,
    },
    /// Multiply the top of the stack by a static scale factor.
    ScaleIndex(u8),
    /// Sign-extend the top of the stack from the given width.
    SignExtend(OpWidth),
    /// Zero-extend the top of the stack from the given width.
    ZeroExtend(OpWidth),
    /// Merge captured scratch flags into guest rflags under the inline mask.
    FlagsUpdate,
    /// Push a raw context slot; the inline operand is the byte offset.
    ContextLoad,
    /// Pop into a raw context slot; the inline operand is the byte offset.
    ContextStore,
    /// Pop a flags value and transfer to one of two prepared targets.
    BranchCond(VmCond),
    /// Spill native guest state into the scatter plan.
    VmEnter,
    /// Restore native guest state and leave for the inline target.
    VmExit,
    /// Restore native guest state and return through the guest stack.
    VmExitRet,
}

impl HandlerKey {
    /// The VM stack effect of invoking this handler.
    pub fn stack_effect(self) -> StackEffect {
        let w = self.width;
        match self.kind {
            HandlerKind::Push | HandlerKind::ContextLoad => StackEffect::pushes(&[w]),
            HandlerKind::Pop | HandlerKind::ContextStore => StackEffect::pops(&[w]),
            HandlerKind::MemRead
            | HandlerKind::ScaleIndex(_)
            | HandlerKind::SignExtend(_)
            | HandlerKind::ZeroExtend(_) => StackEffect::new(&[w], &[w]),
            HandlerKind::MemWrite => StackEffect::pops(&[OpWidth::Qword, w]),
            HandlerKind::Binary { .. } => StackEffect::new(&[w, w], &[w]),
            HandlerKind::BranchCond(_) => StackEffect::pops(&[OpWidth::Qword]),
            HandlerKind::FlagsUpdate
            | HandlerKind::VmEnter
            | HandlerKind::VmExit
            | HandlerKind::VmExitRet => StackEffect::none(),
        }
    }
}

/// Slot traffic of one command: widths popped (top of stack first) and
/// widths pushed.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct StackEffect {
    /// Logical widths popped, top of stack first.
    pub pops: SmallVec<[OpWidth; 2]>,
    /// Logical widths pushed.
    pub pushes: SmallVec<[OpWidth; 1]>,
}

impl StackEffect {
    fn new(pops: &[OpWidth], pushes: &[OpWidth]) -> Self {
        Self {
            pops: SmallVec::from_slice(pops),
            pushes: SmallVec::from_slice(pushes),
        }
    }

    fn pops(pops: &[OpWidth]) -> Self {
        Self::new(pops, &[])
    }

    fn pushes(pushes: &[OpWidth]) -> Self {
        Self::new(&[], pushes)
    }

    fn none() -> Self {
        Self::default()
    }

    /// Net slot delta, pushes minus pops.
    pub fn net(&self) -> i32 {
        self.pushes.len() as i32 - self.pops.len() as i32
    }
}

/// One VM command.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Command {
    /// Enter the VM: spill native guest state into the scatter plan. Always
    /// the first command of a block that can be entered from native code.
    VmEnter,
    /// Leave the VM for the target named by the block's exit descriptor.
    /// Always the last command when present.
    VmExit,
    /// Push an immediate, masked to `width` and zero-extended into its slot.
    PushImm {
        /// The value pushed.
        value: u64,
        /// Logical width of the value.
        width: OpWidth,
    },
    /// Push the low `width` bits of a guest register.
    PushReg {
        /// Source guest register.
        reg: Gpr,
        /// Number of low bits pushed.
        width: OpWidth,
    },
    /// Pop into a guest register. A 32-bit pop zero-extends to the full
    /// register; 16- and 8-bit pops leave the untouched bits alone.
    PopReg {
        /// Destination guest register.
        reg: Gpr,
        /// Number of low bits written.
        width: OpWidth,
    },
    /// Pop and discard the top slot.
    PopDiscard {
        /// Logical width of the discarded value.
        width: OpWidth,
    },
    /// Pop an address, push the `width`-bit value read from it.
    MemRead {
        /// Access width.
        width: OpWidth,
    },
    /// Pop an address then a value, store the value's low `width` bits.
    MemWrite {
        /// Access width.
        width: OpWidth,
    },
    /// Pop two operands (top is the right-hand side), push the result.
    Binary {
        /// The operation.
        op: BinaryOp,
        /// Operand width.
        width: OpWidth,
        /// Whether the machine flags produced are captured for a following
        /// [`Command::FlagsUpdate`].
        updates_flags: bool,
    },
    /// Scale the address on top of the stack by a static factor.
    ScaleIndex {
        /// Scale factor, `2 | 4 | 8`.
        scale: u8,
    },
    /// Sign-extend the top of the stack.
    SignExtend {
        /// Source width.
        from: OpWidth,
        /// Destination width.
        to: OpWidth,
    },
    /// Zero-extend the top of the stack.
    ZeroExtend {
        /// Source width.
        from: OpWidth,
        /// Destination width.
        to: OpWidth,
    },
    /// Commit captured flags into guest rflags.
    FlagsUpdate {
        /// Flags the producing instruction defines; only these bits are
        /// merged.
        defined: FlagSet,
        /// Flags the producing instruction leaves architecturally undefined.
        /// The VM leaves their previous values in place.
        undefined: FlagSet,
    },
    /// Push a raw context slot onto the VM stack.
    ContextLoad {
        /// The slot read.
        slot: CtxSlot,
    },
    /// Pop the VM stack into a raw context slot.
    ContextStore {
        /// The slot written.
        slot: CtxSlot,
    },
    /// Invoke a handler by key. Used by lowerings that chain into an
    /// already-generated handler.
    HandlerCall {
        /// The handler invoked.
        key: HandlerKey,
    },
}

impl Command {
    /// The VM stack effect of this command.
    pub fn stack_effect(&self) -> StackEffect {
        use OpWidth::Qword;
        match *self {
            Command::VmEnter | Command::VmExit | Command::FlagsUpdate { .. } => StackEffect::none(),
            Command::PushImm { width, .. } | Command::PushReg { width, .. } => {
                StackEffect::pushes(&[width])
            }
            Command::PopReg { width, .. } | Command::PopDiscard { width } => {
                StackEffect::pops(&[width])
            }
            Command::MemRead { width } => StackEffect::new(&[Qword], &[width]),
            Command::MemWrite { width } => StackEffect::pops(&[Qword, width]),
            Command::Binary { width, .. } => StackEffect::new(&[width, width], &[width]),
            Command::ScaleIndex { .. } => StackEffect::new(&[Qword], &[Qword]),
            Command::SignExtend { from, to } | Command::ZeroExtend { from, to } => {
                StackEffect::new(&[from], &[to])
            }
            Command::ContextLoad { .. } => StackEffect::pushes(&[Qword]),
            Command::ContextStore { .. } => StackEffect::pops(&[Qword]),
            Command::HandlerCall { key } => key.stack_effect(),
        }
    }

    /// The handler this command dispatches to, with its inline operand
    /// count. Register pushes and pops share the plain stack handlers; the
    /// range-aware register moves are emitted inline at the call site.
    pub fn handler_key(&self) -> Option<HandlerKey> {
        use OpWidth::Qword;
        let key = match *self {
            Command::VmEnter => HandlerKey {
                kind: HandlerKind::VmEnter,
                width: Qword,
                operands: 0,
            },
            Command::VmExit => HandlerKey {
                kind: HandlerKind::VmExit,
                width: Qword,
                operands: 1,
            },
            Command::PushImm { .. } | Command::PushReg { .. } => HandlerKey {
                kind: HandlerKind::Push,
                width: Qword,
                operands: 1,
            },
            Command::PopReg { .. } | Command::PopDiscard { .. } => HandlerKey {
                kind: HandlerKind::Pop,
                width: Qword,
                operands: 0,
            },
            Command::MemRead { width } => HandlerKey {
                kind: HandlerKind::MemRead,
                width,
                operands: 0,
            },
            Command::MemWrite { width } => HandlerKey {
                kind: HandlerKind::MemWrite,
                width,
                operands: 0,
            },
            Command::Binary {
                op,
                width,
                updates_flags,
            } => HandlerKey {
                kind: HandlerKind::Binary {
                    op,
                    captures_flags: updates_flags,
                },
                width,
                operands: 0,
            },
            Command::ScaleIndex { scale } => HandlerKey {
                kind: HandlerKind::ScaleIndex(scale),
                width: Qword,
                operands: 0,
            },
            Command::SignExtend { from, to } => HandlerKey {
                kind: HandlerKind::SignExtend(from),
                width: to,
                operands: 0,
            },
            Command::ZeroExtend { from, to } => HandlerKey {
                kind: HandlerKind::ZeroExtend(from),
                width: to,
                operands: 0,
            },
            Command::FlagsUpdate { .. } => HandlerKey {
                kind: HandlerKind::FlagsUpdate,
                width: Qword,
                operands: 1,
            },
            Command::ContextLoad { .. } => HandlerKey {
                kind: HandlerKind::ContextLoad,
                width: Qword,
                operands: 1,
            },
            Command::ContextStore { .. } => HandlerKey {
                kind: HandlerKind::ContextStore,
                width: Qword,
                operands: 1,
            },
            Command::HandlerCall { key } => key,
        };
        Some(key)
    }

    /// Guest flags this command reads.
    pub fn flags_read(&self) -> FlagSet {
        match self {
            // A raw rflags load observes every status flag.
            Command::ContextLoad {
                slot: CtxSlot::Rflags,
            } => FlagSet::STATUS,
            // Leaving the VM makes the committed flags guest-visible.
            Command::VmExit => FlagSet::STATUS,
            _ => FlagSet::EMPTY,
        }
    }

    /// Guest flags this command overwrites (defined or clobbered).
    pub fn flags_written(&self) -> FlagSet {
        match self {
            Command::FlagsUpdate { defined, undefined } => defined.union(*undefined),
            Command::ContextStore {
                slot: CtxSlot::Rflags,
            } => FlagSet::STATUS,
            _ => FlagSet::EMPTY,
        }
    }
}
