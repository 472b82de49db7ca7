//! IR basic blocks and the arena that owns them.
//!
//! Blocks reference each other by [`IrBlockRef`], a compact `u32` index into
//! the owning [`IrArena`]. Back-edges and loops are therefore plain lookups,
//! never ownership cycles.

use core::fmt;

use crate::ir::condcodes::VmCond;
use crate::ir::Command;
use smallvec::SmallVec;

/// An opaque reference to an IR basic block in an [`IrArena`].
///
/// While the order is stable, it is arbitrary and does not necessarily
/// resemble the layout order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrBlockRef(u32);

impl IrBlockRef {
    /// Raw index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for IrBlockRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ibb{}", self.0)
    }
}

impl fmt::Debug for IrBlockRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Where an exit edge goes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ExitTarget {
    /// Another IR block.
    Block(IrBlockRef),
    /// An address outside the virtualized region; control leaves the VM.
    External(u64),
}

/// The single exit descriptor of an IR block.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Exit {
    /// Unconditional transfer, covering both fall-through and direct
    /// branches.
    Branch {
        /// The successor.
        target: ExitTarget,
    },
    /// Two-way conditional transfer. The condition value is expected on top
    /// of the VM stack, pushed by the block's final commands.
    CondPair {
        /// Predicate deciding the taken edge.
        cond: VmCond,
        /// Successor when the predicate holds.
        taken: ExitTarget,
        /// Successor otherwise.
        fallthrough: ExitTarget,
    },
    /// Return through the guest stack; control leaves the VM.
    Ret,
}

impl Exit {
    /// Every target of this exit, taken edge first.
    pub fn targets(&self) -> SmallVec<[ExitTarget; 2]> {
        match *self {
            Exit::Branch { target } => SmallVec::from_slice(&[target]),
            Exit::CondPair {
                taken, fallthrough, ..
            } => SmallVec::from_slice(&[taken, fallthrough]),
            Exit::Ret => SmallVec::new(),
        }
    }

    /// Number of VM stack slots the exit consumes.
    pub fn pops(&self) -> usize {
        match self {
            Exit::CondPair { .. } => 1,
            _ => 0,
        }
    }

    /// Whether control leaves the VM through this exit on every edge.
    pub fn leaves_vm(&self) -> bool {
        match self {
            Exit::Ret => true,
            Exit::Branch { target } => matches!(target, ExitTarget::External(_)),
            Exit::CondPair {
                taken, fallthrough, ..
            } => {
                matches!(taken, ExitTarget::External(_))
                    && matches!(fallthrough, ExitTarget::External(_))
            }
        }
    }
}

/// One IR basic block: an ordered command list plus a single exit.
#[derive(Clone, Debug)]
pub struct IrBlock {
    /// The command sequence.
    pub commands: Vec<Command>,
    /// The exit descriptor.
    pub exit: Exit,
    /// Start RVA of the originating native basic block.
    pub origin: u64,
    /// Which VM this block executes under. Assigned before optimization;
    /// blocks carry [`VM_UNASSIGNED`] until then.
    pub discriminator: u32,
    /// When set, the terminal jump may be elided because the successor is
    /// laid out immediately after this block. Derived during lowering from
    /// the layout, never by the lifter.
    pub inline_next: bool,
}

/// Discriminator value of a block not yet assigned to a VM.
pub const VM_UNASSIGNED: u32 = u32::MAX;

impl IrBlock {
    /// A fresh block with the given origin and exit.
    pub fn new(origin: u64, exit: Exit) -> Self {
        Self {
            commands: Vec::new(),
            exit,
            origin,
            discriminator: VM_UNASSIGNED,
            inline_next: false,
        }
    }

    /// Whether the block begins with a VM entry.
    pub fn has_vm_enter(&self) -> bool {
        matches!(self.commands.first(), Some(Command::VmEnter))
    }
}

/// Arena owning every IR block of one translation. Outlives all references.
#[derive(Default, Debug)]
pub struct IrArena {
    blocks: Vec<IrBlock>,
}

impl IrArena {
    /// An empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block, returning its reference.
    pub fn alloc(&mut self, block: IrBlock) -> IrBlockRef {
        let r = IrBlockRef(u32::try_from(self.blocks.len()).expect("arena overflow"));
        self.blocks.push(block);
        r
    }

    /// Borrow a block.
    pub fn get(&self, r: IrBlockRef) -> &IrBlock {
        &self.blocks[r.index()]
    }

    /// Mutably borrow a block.
    pub fn get_mut(&mut self, r: IrBlockRef) -> &mut IrBlock {
        &mut self.blocks[r.index()]
    }

    /// Number of blocks ever allocated.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// All block references in allocation order.
    pub fn refs(&self) -> impl Iterator<Item = IrBlockRef> {
        (0..self.blocks.len() as u32).map(IrBlockRef)
    }
}

impl core::ops::Index<IrBlockRef> for IrArena {
    type Output = IrBlock;
    fn index(&self, r: IrBlockRef) -> &IrBlock {
        self.get(r)
    }
}

impl core::ops::IndexMut<IrBlockRef> for IrArena {
    fn index_mut(&mut self, r: IrBlockRef) -> &mut IrBlock {
        self.get_mut(r)
    }
}

/// A lifted-but-unoptimized block: the IR block plus its originating native
/// block, as handed from the lifter to the optimizer.
#[derive(Copy, Clone, Debug)]
pub struct PreoptBlock {
    /// The IR block.
    pub block: IrBlockRef,
    /// Start RVA of the native block it was lifted from.
    pub origin: u64,
}
