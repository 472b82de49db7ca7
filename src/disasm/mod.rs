//! Control-flow recovery over a linear instruction stream.
//!
//! The disassembler decodes the whole segment once, then drives a worklist
//! from the root address: each popped address is walked linearly until a
//! control transfer, producing a tentative basic block whose successors are
//! pushed back onto the worklist. A target discovered strictly inside an
//! existing block splits it at that address; the upper half inherits the
//! terminator and the lower half receives a synthetic fall-through, so block
//! boundaries are fixed points of the branch-target closure.
//!
//! Blocks never overlap: for every produced block and every address strictly
//! between its start and end, [`SegmentDisasm::get_block`] returns `None`.

use std::collections::BTreeMap;

use log::trace;
use rustc_hash::FxHashMap;

use crate::codec::{self, Inst, InstFlow};
use crate::error::{VirtError, VirtResult};
use crate::ir::condcodes::VmCond;

/// Whether a transfer target stays within the disassembled segment.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum JumpLocation {
    /// Target is inside `[rva_begin, rva_end)`.
    InsideSegment,
    /// Target leaves the segment; the edge is external.
    OutsideSegment,
}

/// Terminator descriptor of a basic block.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Terminator {
    /// Execution continues at `next` without a branch.
    FallThrough {
        /// Successor address.
        next: u64,
    },
    /// Unconditional direct branch.
    DirectBranch {
        /// Branch target.
        target: u64,
    },
    /// Conditional branch with its fall-through, a two-successor pair.
    ConditionalPair {
        /// Branch predicate.
        cond: VmCond,
        /// Target when taken.
        taken: u64,
        /// Successor when not taken.
        fallthrough: u64,
    },
    /// Transfer through a register or memory, or an instruction (call,
    /// trap) whose successor the sweep does not follow.
    Indirect,
    /// Near return.
    Return,
}

/// A recovered basic block. Only the final instruction transfers control.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    /// Address of the first instruction.
    pub start: u64,
    /// Exclusive end address.
    pub end: u64,
    /// The instructions, in address order.
    pub insts: Vec<Inst>,
    /// How the block ends.
    pub terminator: Terminator,
}

impl BasicBlock {
    /// Whether `rva` lies strictly inside the block.
    fn contains_inside(&self, rva: u64) -> bool {
        rva > self.start && rva < self.end
    }
}

/// Disassembler for one contiguous segment of code.
pub struct SegmentDisasm {
    insts: Vec<Inst>,
    inst_at: FxHashMap<u64, usize>,
    rva_begin: u64,
    rva_end: u64,
    blocks: Vec<BasicBlock>,
    starts: BTreeMap<u64, usize>,
}

impl SegmentDisasm {
    /// Decode `bytes` linearly at `rva_begin` and prepare for block
    /// recovery.
    pub fn new(bytes: &[u8], rva_begin: u64) -> VirtResult<Self> {
        let insts = codec::decode_buffer(bytes, rva_begin)?;
        let inst_at = insts.iter().enumerate().map(|(i, d)| (d.rva, i)).collect();
        Ok(Self {
            insts,
            inst_at,
            rva_begin,
            rva_end: rva_begin + bytes.len() as u64,
            blocks: Vec::new(),
            starts: BTreeMap::new(),
        })
    }

    /// Inclusive start of the segment.
    pub fn rva_begin(&self) -> u64 {
        self.rva_begin
    }

    /// Exclusive end of the segment.
    pub fn rva_end(&self) -> u64 {
        self.rva_end
    }

    /// Run the worklist sweep. Returns the start address of the root block,
    /// the block containing the first decoded instruction.
    pub fn generate_blocks(&mut self) -> VirtResult<u64> {
        if self.insts.is_empty() {
            return Err(VirtError::OutOfRange {
                rva: self.rva_begin,
                start: self.rva_begin,
                end: self.rva_end,
            });
        }

        let mut worklist = vec![self.rva_begin];
        while let Some(rva) = worklist.pop() {
            if self.starts.contains_key(&rva) {
                continue;
            }
            if let Some(idx) = self.block_containing_inside(rva) {
                self.split_block(idx, rva)?;
                continue;
            }
            let block = self.sweep_from(rva)?;
            trace!(
                "block {:#x}..{:#x} {:?}",
                block.start,
                block.end,
                block.terminator
            );
            for succ in terminator_successors(&block.terminator) {
                if self.get_jump_location(succ) == JumpLocation::InsideSegment {
                    worklist.push(succ);
                }
            }
            self.starts.insert(block.start, self.blocks.len());
            self.blocks.push(block);
        }

        Ok(self.rva_begin)
    }

    /// Decode linearly from `rva` until a control transfer or a known block
    /// boundary.
    fn sweep_from(&self, rva: u64) -> VirtResult<BasicBlock> {
        let mut at = *self
            .inst_at
            .get(&rva)
            .ok_or(VirtError::Decode(rva))?;
        let mut insts = Vec::new();

        loop {
            let inst = self.insts[at].clone();
            let next = inst.end_rva();
            let flow = inst.flow;
            insts.push(inst);

            if flow != InstFlow::Sequential {
                let terminator = self.classify(insts.last().expect("nonempty block"), next);
                return Ok(BasicBlock {
                    start: rva,
                    end: next,
                    insts,
                    terminator,
                });
            }

            if next == self.rva_end || self.starts.contains_key(&next) {
                return Ok(BasicBlock {
                    start: rva,
                    end: next,
                    insts,
                    terminator: Terminator::FallThrough { next },
                });
            }

            at += 1;
        }
    }

    fn classify(&self, inst: &Inst, next: u64) -> Terminator {
        match inst.flow {
            InstFlow::Jump => match inst.branch_target {
                Some(target) => Terminator::DirectBranch { target },
                None => Terminator::Indirect,
            },
            InstFlow::CondJump => match (inst.branch_target, inst.cond) {
                (Some(taken), Some(cond)) => Terminator::ConditionalPair {
                    cond,
                    taken,
                    fallthrough: next,
                },
                // loop/jrcxz: conditional but not flag-driven
                _ => Terminator::Indirect,
            },
            InstFlow::Return => Terminator::Return,
            _ => Terminator::Indirect,
        }
    }

    /// Split the block at index `idx` at internal address `rva`.
    ///
    /// The lower half keeps the start and gets a synthetic fall-through; the
    /// upper half starts at `rva` and inherits the terminator.
    fn split_block(&mut self, idx: usize, rva: u64) -> VirtResult<()> {
        let split_at = self.blocks[idx]
            .insts
            .iter()
            .position(|d| d.rva == rva)
            .ok_or(VirtError::Decode(rva))?;

        let block = &mut self.blocks[idx];
        trace!("split {:#x}..{:#x} at {:#x}", block.start, block.end, rva);
        let upper_insts = block.insts.split_off(split_at);
        let upper = BasicBlock {
            start: rva,
            end: block.end,
            insts: upper_insts,
            terminator: block.terminator,
        };
        block.end = rva;
        block.terminator = Terminator::FallThrough { next: rva };

        self.starts.insert(rva, self.blocks.len());
        self.blocks.push(upper);
        Ok(())
    }

    fn block_containing_inside(&self, rva: u64) -> Option<usize> {
        let (_, &idx) = self.starts.range(..=rva).next_back()?;
        self.blocks[idx].contains_inside(rva).then_some(idx)
    }

    /// The block starting exactly at `rva`, if any.
    pub fn get_block(&self, rva: u64) -> Option<&BasicBlock> {
        self.starts.get(&rva).map(|&idx| &self.blocks[idx])
    }

    /// All blocks in start-address order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.starts.values().map(|&idx| &self.blocks[idx])
    }

    /// The transfer target of a block's terminator and where it lands.
    ///
    /// For a conditional pair, `last` selects the final fall-through edge
    /// instead of the taken edge. Returns `None` for indirect transfers and
    /// returns.
    pub fn get_jump(&self, block: &BasicBlock, last: bool) -> Option<(u64, JumpLocation)> {
        let target = match block.terminator {
            Terminator::FallThrough { next } => next,
            Terminator::DirectBranch { target } => target,
            Terminator::ConditionalPair {
                taken, fallthrough, ..
            } => {
                if last {
                    fallthrough
                } else {
                    taken
                }
            }
            Terminator::Indirect | Terminator::Return => return None,
        };
        Some((target, self.get_jump_location(target)))
    }

    /// Classify an address against the segment bounds.
    pub fn get_jump_location(&self, rva: u64) -> JumpLocation {
        if rva >= self.rva_begin && rva < self.rva_end {
            JumpLocation::InsideSegment
        } else {
            JumpLocation::OutsideSegment
        }
    }
}

fn terminator_successors(terminator: &Terminator) -> impl Iterator<Item = u64> {
    let pair = match *terminator {
        Terminator::FallThrough { next } => (Some(next), None),
        Terminator::DirectBranch { target } => (Some(target), None),
        Terminator::ConditionalPair {
            taken, fallthrough, ..
        } => (Some(taken), Some(fallthrough)),
        Terminator::Indirect | Terminator::Return => (None, None),
    };
    pair.0.into_iter().chain(pair.1)
}
