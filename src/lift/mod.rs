//! Lifting native blocks into VM IR.
//!
//! The translator walks every recovered basic block, dispatches each
//! instruction to its mnemonic handler, and wires block terminators into IR
//! exits. Every lifted block begins life with a [`Command::VmEnter`]
//! prologue; the optimizer later strips the redundant ones.

mod handlers;

pub use handlers::lift_inst;

use log::debug;
use rustc_hash::FxHashMap;

use crate::codec::Inst;
use crate::disasm::{SegmentDisasm, Terminator};
use crate::error::{VirtError, VirtResult};
use crate::ir::{Command, CtxSlot, Exit, ExitTarget, IrArena, IrBlock, IrBlockRef, PreoptBlock};

/// Lifts a disassembled segment into an IR arena.
pub struct Translator<'a> {
    dasm: &'a SegmentDisasm,
    arena: IrArena,
    by_rva: FxHashMap<u64, IrBlockRef>,
}

impl<'a> Translator<'a> {
    /// A translator over `dasm`, which must already have generated blocks.
    pub fn new(dasm: &'a SegmentDisasm) -> Self {
        Self {
            dasm,
            arena: IrArena::new(),
            by_rva: FxHashMap::default(),
        }
    }

    /// Lift every block. Returns the arena and the preopt blocks in
    /// start-address order.
    pub fn translate(mut self) -> VirtResult<(IrArena, Vec<PreoptBlock>)> {
        // Allocate refs up front so exits can point at blocks that have not
        // been lifted yet.
        for block in self.dasm.blocks() {
            let r = self.arena.alloc(IrBlock::new(
                block.start,
                Exit::Branch {
                    target: ExitTarget::External(block.end),
                },
            ));
            self.by_rva.insert(block.start, r);
        }

        let mut preopt = Vec::new();
        for native in self.dasm.blocks() {
            let r = self.by_rva[&native.start];
            let lifted = self.lift_native_block(native)?;
            debug!(
                "lifted block {:#x} into {} with {} commands",
                native.start,
                r,
                lifted.commands.len()
            );
            let slot = self.arena.get_mut(r);
            slot.commands = lifted.commands;
            slot.exit = lifted.exit;
            preopt.push(PreoptBlock {
                block: r,
                origin: native.start,
            });
        }

        Ok((self.arena, preopt))
    }

    fn lift_native_block(&self, native: &crate::disasm::BasicBlock) -> VirtResult<IrBlock> {
        let mut out = IrBlock::new(native.start, Exit::Ret);
        out.commands.push(Command::VmEnter);

        let body: &[Inst] = match native.terminator {
            // The transfer instruction is consumed by the exit descriptor.
            Terminator::DirectBranch { .. }
            | Terminator::ConditionalPair { .. }
            | Terminator::Return => &native.insts[..native.insts.len() - 1],
            Terminator::FallThrough { .. } => &native.insts,
            Terminator::Indirect => {
                let last = native.insts.last().expect("terminated block is nonempty");
                return Err(handlers::unsupported(last));
            }
        };
        for inst in body {
            handlers::lift_inst(&mut out.commands, inst)?;
        }

        out.exit = match native.terminator {
            Terminator::FallThrough { next } => Exit::Branch {
                target: self.exit_target(next),
            },
            Terminator::DirectBranch { target } => Exit::Branch {
                target: self.exit_target(target),
            },
            Terminator::ConditionalPair {
                cond,
                taken,
                fallthrough,
            } => {
                // The condition value travels through the VM stack like any
                // other operand.
                out.commands.push(Command::ContextLoad {
                    slot: CtxSlot::Rflags,
                });
                Exit::CondPair {
                    cond,
                    taken: self.exit_target(taken),
                    fallthrough: self.exit_target(fallthrough),
                }
            }
            Terminator::Return => Exit::Ret,
            Terminator::Indirect => unreachable!("rejected above"),
        };

        // Conditional exits leave through per-edge thunks; only the
        // single-successor leaves carry an explicit VmExit command.
        if matches!(
            out.exit,
            Exit::Ret
                | Exit::Branch {
                    target: ExitTarget::External(_)
                }
        ) {
            out.commands.push(Command::VmExit);
        }
        Ok(out)
    }

    fn exit_target(&self, rva: u64) -> ExitTarget {
        match self.by_rva.get(&rva) {
            Some(&r) => ExitTarget::Block(r),
            None => ExitTarget::External(rva),
        }
    }
}

/// Lift a whole segment: convenience wrapper tying the disassembler to the
/// translator, used by the pipeline driver and tests.
pub fn translate_segment(dasm: &SegmentDisasm) -> VirtResult<(IrArena, Vec<PreoptBlock>)> {
    Translator::new(dasm).translate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::SegmentDisasm;
    use crate::ir::Command;

    fn lift(bytes: &[u8]) -> (IrArena, Vec<PreoptBlock>) {
        let mut dasm = SegmentDisasm::new(bytes, 0).unwrap();
        dasm.generate_blocks().unwrap();
        translate_segment(&dasm).unwrap()
    }

    #[test]
    fn every_block_gets_a_vm_enter_prologue() {
        let (arena, preopt) = lift(&[0x48, 0x01, 0xd8]); // add rax, rbx
        assert_eq!(preopt.len(), 1);
        assert!(arena[preopt[0].block].has_vm_enter());
    }

    #[test]
    fn fallthrough_off_the_end_exits_the_vm() {
        let (arena, preopt) = lift(&[0x48, 0x01, 0xd8]);
        let block = &arena[preopt[0].block];
        assert_eq!(
            block.exit,
            Exit::Branch {
                target: ExitTarget::External(3)
            }
        );
        assert_eq!(block.commands.last(), Some(&Command::VmExit));
    }

    #[test]
    fn conditional_block_loads_flags_last() {
        // cmp rax, rbx / jne 0
        let (arena, preopt) = lift(&[0x48, 0x39, 0xd8, 0x75, 0xfb]);
        let block = &arena[preopt[0].block];
        assert_eq!(
            block.commands.last(),
            Some(&Command::ContextLoad {
                slot: CtxSlot::Rflags
            })
        );
        match block.exit {
            Exit::CondPair { taken, .. } => assert_eq!(taken, ExitTarget::Block(preopt[0].block)),
            ref other => panic!("expected cond pair, got {other:?}"),
        }
    }

    #[test]
    fn indirect_transfer_is_unsupported() {
        // jmp rax
        let mut dasm = SegmentDisasm::new(&[0xff, 0xe0], 0).unwrap();
        dasm.generate_blocks().unwrap();
        let err = translate_segment(&dasm).unwrap_err();
        assert!(matches!(err, VirtError::UnsupportedInstruction { rva: 0, .. }));
    }
}
