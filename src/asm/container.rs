//! Relocatable spans of abstract instructions.
//!
//! A [`CodeContainer`] is an ordered sequence of [`Item`]s: concrete
//! instructions whose encoding is address-independent, branches and address
//! materializations whose operands are labels, raw data, and label bind
//! points. Containers are added to a
//! [`SectionManager`](crate::asm::SectionManager), which owns them through
//! layout and emission.

use iced_x86::Instruction;

use crate::asm::label::LabelId;
use crate::codec::Gpr;
use crate::ir::condcodes::VmCond;

/// An opaque reference to a container within one section.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ContainerId(pub(crate) u32);

/// One abstract instruction or directive.
#[derive(Clone, Debug)]
pub enum Item {
    /// A fully formed instruction whose encoding does not depend on its
    /// address. Never rip-relative.
    Fixed(Instruction),
    /// Unconditional jump to a label. Relaxed to rel8 when the distance
    /// allows.
    JumpTo(LabelId),
    /// Near call to a label, rel32.
    CallTo(LabelId),
    /// Conditional jump to a label. Relaxed to rel8 when the distance
    /// allows.
    JccTo(VmCond, LabelId),
    /// `mov reg, imm64` of a label's resolved address; records an absolute
    /// relocation.
    MovLabelVa {
        /// Destination register.
        reg: Gpr,
        /// The label whose address is materialized.
        label: LabelId,
    },
    /// `mov reg, imm64` of the image base; records an absolute relocation
    /// with target zero for the patcher.
    MovImageBase {
        /// Destination register.
        reg: Gpr,
    },
    /// Bind a label to the current offset.
    Bind(LabelId),
    /// Raw bytes, emitted verbatim.
    Data(Vec<u8>),
    /// Zero-filled area of the given size.
    Reserve(u32),
}

/// An ordered, relocatable span of abstract instructions.
#[derive(Default)]
pub struct CodeContainer {
    items: Vec<Item>,
    name: Option<String>,
}

impl CodeContainer {
    /// An empty, unnamed container.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty container with a diagnostic name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            name: Some(name.into()),
        }
    }

    /// Diagnostic name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Append one item.
    pub fn push(&mut self, item: Item) {
        self.items.push(item);
    }

    /// Append a concrete instruction.
    pub fn push_inst(&mut self, inst: Instruction) {
        self.items.push(Item::Fixed(inst));
    }

    /// Bind a label at the current end of the container.
    pub fn bind(&mut self, label: LabelId) {
        self.items.push(Item::Bind(label));
    }

    /// Bind a label to the very start of the container, ahead of everything
    /// already appended.
    pub fn bind_start(&mut self, label: LabelId) {
        self.items.insert(0, Item::Bind(label));
    }

    /// The items in order.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Remove and return the final item, if any.
    pub fn pop(&mut self) -> Option<Item> {
        self.items.pop()
    }

    /// Whether the container has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
