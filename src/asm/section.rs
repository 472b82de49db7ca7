//! Section layout and binary emission.
//!
//! The section manager owns an ordered list of code containers and compiles
//! them in two passes. The layout pass assigns every container a provisional
//! offset assuming worst-case instruction widths, binds labels, then
//! iterates to a fixed point: branches whose displacement fits a short form
//! shrink, offsets converge monotonically downward, and the loop terminates
//! because sizes are bounded below by the minimal encodings. The emit pass
//! encodes final bytes with every label resolved to an absolute address and
//! records a relocation for each absolute reference.

use iced_x86::{Code, Encoder, Instruction};
use log::{debug, trace};

use crate::asm::container::{CodeContainer, ContainerId, Item};
use crate::asm::label::{LabelId, LabelPool};
use crate::codec::{Gpr, OpWidth};
use crate::control::Shuffler;
use crate::error::{VirtError, VirtResult};
use crate::ir::condcodes::VmCond;

/// Offset in bytes from the beginning of the section.
pub type CodeOffset = u32;

const JMP_SHORT: u32 = 2;
const JMP_LONG: u32 = 5;
const JCC_SHORT: u32 = 2;
const JCC_LONG: u32 = 6;
const CALL_LONG: u32 = 5;
const MOVABS: u32 = 10;

/// An absolute reference the patcher must adjust when the image base moves.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Reloc {
    /// Byte offset of the field within the section.
    pub site_offset: CodeOffset,
    /// The absolute address originally written at the site.
    pub target: u64,
    /// Field width in bytes.
    pub width: u8,
}

/// The compiled output of one section.
#[derive(Debug)]
pub struct CompiledSection {
    /// Final bytes.
    pub bytes: Vec<u8>,
    /// Exported `(name, address)` pairs, the entry point at minimum.
    pub symbols: Vec<(String, u64)>,
    /// Absolute-reference relocations.
    pub relocs: Vec<Reloc>,
}

/// Ordered collection of code containers plus the two-pass compiler.
#[derive(Default)]
pub struct SectionManager {
    containers: Vec<CodeContainer>,
}

impl SectionManager {
    /// An empty section.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one container.
    pub fn add_container(&mut self, container: CodeContainer) -> ContainerId {
        let id = ContainerId(u32::try_from(self.containers.len()).expect("container overflow"));
        self.containers.push(container);
        id
    }

    /// Append several containers, preserving their order.
    pub fn add_containers(&mut self, containers: Vec<CodeContainer>) {
        for container in containers {
            self.add_container(container);
        }
    }

    /// Number of containers added.
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    /// Whether the section has no containers.
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Shuffle container order. Only valid when no container relies on its
    /// layout successor, i.e. fall-through elision was disabled.
    pub fn shuffle_containers(&mut self, rng: &mut Shuffler) {
        rng.shuffle(&mut self.containers);
    }

    /// Compile to final bytes, with the section loaded at `base_va`.
    pub fn compile_section(
        &mut self,
        pool: &mut LabelPool,
        base_va: u64,
    ) -> VirtResult<CompiledSection> {
        let mut sizes = self.initial_sizes()?;

        // Layout: bind labels, shrink branches, repeat until stable.
        let mut iterations = 0u32;
        loop {
            self.bind_labels(pool, &sizes);
            if !self.shrink_branches(pool, &mut sizes) {
                break;
            }
            iterations += 1;
        }
        debug!(
            "layout converged after {iterations} shrink iterations, {} bytes",
            sizes.iter().flatten().sum::<u32>()
        );

        for id in pool.ids() {
            if let Some(offset) = pool.bound_offset(id) {
                pool.resolve(id, base_va + u64::from(offset));
            }
        }

        self.emit(pool, base_va, &sizes)
    }

    fn initial_sizes(&self) -> VirtResult<Vec<Vec<u32>>> {
        self.containers
            .iter()
            .map(|container| {
                container
                    .items()
                    .iter()
                    .map(|item| {
                        Ok(match item {
                            Item::Fixed(inst) => encode_at(inst, 0x1000)?.len() as u32,
                            Item::JumpTo(_) => JMP_LONG,
                            Item::JccTo(..) => JCC_LONG,
                            Item::CallTo(_) => CALL_LONG,
                            Item::MovLabelVa { .. } | Item::MovImageBase { .. } => MOVABS,
                            Item::Bind(_) => 0,
                            Item::Data(bytes) => bytes.len() as u32,
                            Item::Reserve(size) => *size,
                        })
                    })
                    .collect()
            })
            .collect()
    }

    fn bind_labels(&self, pool: &mut LabelPool, sizes: &[Vec<u32>]) {
        let mut offset: CodeOffset = 0;
        for (ci, container) in self.containers.iter().enumerate() {
            for (ii, item) in container.items().iter().enumerate() {
                if let Item::Bind(label) = item {
                    pool.bind(*label, ContainerId(ci as u32), offset);
                }
                offset += sizes[ci][ii];
            }
        }
    }

    /// One shrink sweep; true when any branch narrowed. Sizes only ever
    /// decrease, so pairwise distances never grow and a taken shrink stays
    /// valid.
    fn shrink_branches(&self, pool: &LabelPool, sizes: &mut [Vec<u32>]) -> bool {
        let mut changed = false;
        let mut offset: CodeOffset = 0;
        for (ci, container) in self.containers.iter().enumerate() {
            for (ii, item) in container.items().iter().enumerate() {
                let size = sizes[ci][ii];
                let short = match item {
                    Item::JumpTo(label) => Some((JMP_SHORT, *label)),
                    Item::JccTo(_, label) => Some((JCC_SHORT, *label)),
                    _ => None,
                };
                if let Some((short, label)) = short {
                    if size > short {
                        if let Some(target) = pool.bound_offset(label) {
                            let end = i64::from(offset) + i64::from(short);
                            let disp = i64::from(target) - end;
                            if (-128..=127).contains(&disp) {
                                trace!("shrinking branch at {offset:#x} to rel8");
                                sizes[ci][ii] = short;
                                changed = true;
                            }
                        }
                    }
                }
                offset += sizes[ci][ii];
            }
        }
        changed
    }

    fn emit(
        &self,
        pool: &LabelPool,
        base_va: u64,
        sizes: &[Vec<u32>],
    ) -> VirtResult<CompiledSection> {
        let mut bytes = Vec::new();
        let mut relocs = Vec::new();

        for (ci, container) in self.containers.iter().enumerate() {
            for (ii, item) in container.items().iter().enumerate() {
                let offset = bytes.len() as u32;
                let va = base_va + u64::from(offset);
                let size = sizes[ci][ii];
                match item {
                    Item::Fixed(inst) => bytes.extend(encode_at(inst, va)?),
                    Item::JumpTo(label) => {
                        let target = target_va(pool, *label)?;
                        let code = if size == JMP_SHORT {
                            Code::Jmp_rel8_64
                        } else {
                            Code::Jmp_rel32_64
                        };
                        let inst = Instruction::with_branch(code, target)
                            .map_err(|e| branch_error(e))?;
                        bytes.extend(encode_at(&inst, va)?);
                    }
                    Item::JccTo(cond, label) => {
                        let target = target_va(pool, *label)?;
                        let inst =
                            Instruction::with_branch(jcc_code(*cond, size == JCC_SHORT), target)
                                .map_err(|e| branch_error(e))?;
                        bytes.extend(encode_at(&inst, va)?);
                    }
                    Item::CallTo(label) => {
                        let target = target_va(pool, *label)?;
                        let inst = Instruction::with_branch(Code::Call_rel32_64, target)
                            .map_err(|e| branch_error(e))?;
                        bytes.extend(encode_at(&inst, va)?);
                    }
                    Item::MovLabelVa { reg, label } => {
                        let target = target_va(pool, *label)?;
                        emit_movabs(&mut bytes, &mut relocs, *reg, target, va)?;
                    }
                    Item::MovImageBase { reg } => {
                        emit_movabs(&mut bytes, &mut relocs, *reg, 0, va)?;
                    }
                    Item::Bind(label) => {
                        debug_assert_eq!(pool.resolved_va(*label), Some(va));
                    }
                    Item::Data(data) => bytes.extend_from_slice(data),
                    Item::Reserve(len) => bytes.resize(bytes.len() + *len as usize, 0),
                }
                debug_assert_eq!(
                    bytes.len() as u32 - offset,
                    size,
                    "layout size mismatch in container {ci} item {ii}"
                );
            }
        }

        let symbols = pool
            .exported()
            .iter()
            .map(|&id| {
                let va = pool
                    .resolved_va(id)
                    .ok_or_else(|| VirtError::UnresolvedLabel(pool.name(id).to_string()))?;
                Ok((pool.name(id).to_string(), va))
            })
            .collect::<VirtResult<Vec<_>>>()?;

        Ok(CompiledSection {
            bytes,
            symbols,
            relocs,
        })
    }
}

fn target_va(pool: &LabelPool, label: LabelId) -> VirtResult<u64> {
    pool.resolved_va(label)
        .ok_or_else(|| VirtError::UnresolvedLabel(pool.name(label).to_string()))
}

fn emit_movabs(
    bytes: &mut Vec<u8>,
    relocs: &mut Vec<Reloc>,
    reg: Gpr,
    target: u64,
    va: u64,
) -> VirtResult<()> {
    let inst = Instruction::with2(Code::Mov_r64_imm64, reg.to_raw(OpWidth::Qword), target)
        .map_err(|e| branch_error(e))?;
    let encoded = encode_at(&inst, va)?;
    debug_assert_eq!(encoded.len() as u32, MOVABS);
    // rex + opcode precede the 8-byte immediate
    relocs.push(Reloc {
        site_offset: (bytes.len() + 2) as u32,
        target,
        width: 8,
    });
    bytes.extend(encoded);
    Ok(())
}

fn encode_at(inst: &Instruction, va: u64) -> VirtResult<Vec<u8>> {
    let mut encoder = Encoder::new(64);
    encoder
        .encode(inst, va)
        .map_err(|e| VirtError::EncodingFailure {
            mnemonic: format!("{:?}", inst.mnemonic()).to_lowercase(),
            reason: e.to_string(),
        })?;
    Ok(encoder.take_buffer())
}

fn branch_error(e: iced_x86::IcedError) -> VirtError {
    VirtError::EncodingFailure {
        mnemonic: "jmp".to_string(),
        reason: e.to_string(),
    }
}

fn jcc_code(cond: VmCond, short: bool) -> Code {
    use VmCond::*;
    if short {
        match cond {
            O => Code::Jo_rel8_64,
            No => Code::Jno_rel8_64,
            B => Code::Jb_rel8_64,
            Ae => Code::Jae_rel8_64,
            E => Code::Je_rel8_64,
            Ne => Code::Jne_rel8_64,
            Be => Code::Jbe_rel8_64,
            A => Code::Ja_rel8_64,
            S => Code::Js_rel8_64,
            Ns => Code::Jns_rel8_64,
            P => Code::Jp_rel8_64,
            Np => Code::Jnp_rel8_64,
            L => Code::Jl_rel8_64,
            Ge => Code::Jge_rel8_64,
            Le => Code::Jle_rel8_64,
            G => Code::Jg_rel8_64,
        }
    } else {
        match cond {
            O => Code::Jo_rel32_64,
            No => Code::Jno_rel32_64,
            B => Code::Jb_rel32_64,
            Ae => Code::Jae_rel32_64,
            E => Code::Je_rel32_64,
            Ne => Code::Jne_rel32_64,
            Be => Code::Jbe_rel32_64,
            A => Code::Ja_rel32_64,
            S => Code::Js_rel32_64,
            Ns => Code::Jns_rel32_64,
            P => Code::Jp_rel32_64,
            Np => Code::Jnp_rel32_64,
            L => Code::Jl_rel32_64,
            Ge => Code::Jge_rel32_64,
            Le => Code::Jle_rel32_64,
            G => Code::Jg_rel32_64,
        }
    }
}
