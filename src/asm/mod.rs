//! Binary section assembly.
//!
//! The `asm` module turns abstract code containers into final bytes:
//! [`LabelPool`] owns the shared symbolic addresses, [`CodeContainer`] holds
//! relocatable instruction spans, and [`SectionManager`] performs the
//! two-pass layout-then-emit compilation with branch relaxation and
//! absolute-reference relocations.

mod container;
mod label;
mod section;

pub use container::{CodeContainer, ContainerId, Item};
pub use label::{LabelId, LabelPool, LabelState};
pub use section::{CodeOffset, CompiledSection, Reloc, SectionManager};
