//! Facade over the raw x86-64 decoder and encoder.
//!
//! Everything upstream of section emission talks in the types of this module:
//! a decoded [`Inst`] with our operand and register model, never the vendor
//! decoder's records. The vendor's view of instruction widths and lengths is
//! authoritative; the pipeline does not second-guess it.
//!
//! Encoding lives at the other end of the pipeline, in [`crate::asm`]; this
//! module only re-exports the pieces of the raw instruction model that the
//! machine lowering needs to build concrete instructions.

mod reg;

pub use reg::{Gpr, HostReg, Xmm};

use iced_x86::{ConditionCode, Decoder, DecoderOptions, FlowControl, Register};
use smallvec::SmallVec;

use crate::error::{VirtError, VirtResult};
use crate::ir::condcodes::VmCond;

/// Re-exported mnemonic enum; the lifter dispatches on it directly.
pub use iced_x86::Mnemonic;

/// Operand width, in the four sizes the VM operates at.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum OpWidth {
    /// 8 bits.
    Byte,
    /// 16 bits.
    Word,
    /// 32 bits.
    Dword,
    /// 64 bits.
    Qword,
}

impl OpWidth {
    /// Width in bits.
    pub fn bits(self) -> u16 {
        match self {
            OpWidth::Byte => 8,
            OpWidth::Word => 16,
            OpWidth::Dword => 32,
            OpWidth::Qword => 64,
        }
    }

    /// Width in bytes.
    pub fn bytes(self) -> u8 {
        (self.bits() / 8) as u8
    }

    /// Width from a byte count, if it is one of the four supported sizes.
    pub fn from_bytes(bytes: usize) -> Option<OpWidth> {
        match bytes {
            1 => Some(OpWidth::Byte),
            2 => Some(OpWidth::Word),
            4 => Some(OpWidth::Dword),
            8 => Some(OpWidth::Qword),
            _ => None,
        }
    }

    /// Mask covering exactly this many low bits.
    pub fn mask(self) -> u64 {
        match self {
            OpWidth::Qword => u64::MAX,
            w => (1u64 << w.bits()) - 1,
        }
    }
}

/// A decoded memory operand.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MemOperand {
    /// Base register, if any.
    pub base: Option<Gpr>,
    /// Index register, if any.
    pub index: Option<Gpr>,
    /// Scale applied to the index, `1 | 2 | 4 | 8`.
    pub scale: u8,
    /// Displacement, already sign-extended.
    pub disp: i64,
    /// Access width. Meaningless for `lea`, which never dereferences.
    pub width: OpWidth,
    /// Whether the operand is rip-relative. Such operands are decodable but
    /// outside the supported subset.
    pub rip_relative: bool,
}

/// A decoded operand.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Operand {
    /// A general purpose register at some width.
    Reg(Gpr, OpWidth),
    /// A memory reference.
    Mem(MemOperand),
    /// An immediate, sign- or zero-extended exactly as the decoder reports.
    Imm(u64),
    /// A resolved near-branch target address.
    Rel(u64),
}

/// Coarse control-flow class of one instruction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InstFlow {
    /// Falls through to the next instruction.
    Sequential,
    /// Direct unconditional branch.
    Jump,
    /// Direct conditional branch.
    CondJump,
    /// Near return.
    Return,
    /// Direct call.
    Call,
    /// Branch or call through a register or memory.
    Indirect,
    /// Traps, software interrupts, and anything else that ends a block
    /// without a resolvable successor.
    Interrupt,
}

/// One decoded instruction. Immutable once produced.
#[derive(Clone, Debug)]
pub struct Inst {
    /// Address of the first byte.
    pub rva: u64,
    /// Encoded length in bytes.
    pub len: u8,
    /// Vendor mnemonic.
    pub mnemonic: Mnemonic,
    /// Operands in encoding order.
    pub operands: SmallVec<[Operand; 4]>,
    /// Effective operand width of the instruction.
    pub width: OpWidth,
    /// Control-flow class.
    pub flow: InstFlow,
    /// Condition of a `jcc`, if any.
    pub cond: Option<VmCond>,
    /// Resolved target of a direct branch, if any.
    pub branch_target: Option<u64>,
}

impl Inst {
    /// Exclusive end address.
    pub fn end_rva(&self) -> u64 {
        self.rva + u64::from(self.len)
    }
}

/// Decode an entire buffer linearly starting at `rva`.
///
/// Fails with [`VirtError::Decode`] at the first byte sequence the raw
/// decoder rejects.
pub fn decode_buffer(bytes: &[u8], rva: u64) -> VirtResult<Vec<Inst>> {
    let mut decoder = Decoder::with_ip(64, bytes, rva, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        let raw = decoder.decode();
        if raw.is_invalid() {
            return Err(VirtError::Decode(raw.ip()));
        }
        out.push(convert(&raw));
    }
    Ok(out)
}

fn convert(raw: &iced_x86::Instruction) -> Inst {
    let mut operands: SmallVec<[Operand; 4]> = SmallVec::new();
    let mut width = OpWidth::Qword;
    let mut width_known = false;

    for i in 0..raw.op_count() {
        use iced_x86::OpKind;
        let op = match raw.op_kind(i) {
            OpKind::Register => match Gpr::from_raw(raw.op_register(i)) {
                Some((gpr, w)) => {
                    if !width_known {
                        width = w;
                        width_known = true;
                    }
                    Operand::Reg(gpr, w)
                }
                // Unmappable register (segment, xmm, high byte). Keep a
                // placeholder so the lifter can reject with the right rva.
                None => Operand::Imm(0),
            },
            OpKind::Memory => {
                let mem = convert_mem(raw);
                if !width_known {
                    width = mem.width;
                    width_known = true;
                }
                Operand::Mem(mem)
            }
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Operand::Rel(raw.near_branch_target())
            }
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Operand::Imm(raw.immediate(i)),
            // far branches, implicit string operands and friends; the
            // lifter rejects their mnemonics, so a placeholder suffices
            _ => Operand::Imm(0),
        };
        operands.push(op);
    }

    let flow = match raw.flow_control() {
        FlowControl::Next => InstFlow::Sequential,
        FlowControl::UnconditionalBranch => InstFlow::Jump,
        FlowControl::ConditionalBranch => InstFlow::CondJump,
        FlowControl::Return => InstFlow::Return,
        FlowControl::Call => InstFlow::Call,
        FlowControl::IndirectBranch | FlowControl::IndirectCall => InstFlow::Indirect,
        _ => InstFlow::Interrupt,
    };

    // far forms have no near target and stay unresolved
    let branch_target = operands.iter().find_map(|op| match op {
        Operand::Rel(target) => Some(*target),
        _ => None,
    });

    Inst {
        rva: raw.ip(),
        len: raw.len() as u8,
        mnemonic: raw.mnemonic(),
        operands,
        width,
        flow,
        cond: cond_from_raw(raw.condition_code()),
        branch_target,
    }
}

fn convert_mem(raw: &iced_x86::Instruction) -> MemOperand {
    let rip_relative = raw.memory_base() == Register::RIP;
    let base = if rip_relative {
        None
    } else {
        Gpr::from_raw(raw.memory_base()).map(|(g, _)| g)
    };
    let index = Gpr::from_raw(raw.memory_index()).map(|(g, _)| g);
    let width = OpWidth::from_bytes(raw.memory_size().size()).unwrap_or(OpWidth::Qword);
    MemOperand {
        base,
        index,
        scale: raw.memory_index_scale() as u8,
        disp: raw.memory_displacement64() as i64,
        width,
        rip_relative,
    }
}

fn cond_from_raw(cc: ConditionCode) -> Option<VmCond> {
    Some(match cc {
        ConditionCode::None => return None,
        ConditionCode::o => VmCond::O,
        ConditionCode::no => VmCond::No,
        ConditionCode::b => VmCond::B,
        ConditionCode::ae => VmCond::Ae,
        ConditionCode::e => VmCond::E,
        ConditionCode::ne => VmCond::Ne,
        ConditionCode::be => VmCond::Be,
        ConditionCode::a => VmCond::A,
        ConditionCode::s => VmCond::S,
        ConditionCode::ns => VmCond::Ns,
        ConditionCode::p => VmCond::P,
        ConditionCode::np => VmCond::Np,
        ConditionCode::l => VmCond::L,
        ConditionCode::ge => VmCond::Ge,
        ConditionCode::le => VmCond::Le,
        ConditionCode::g => VmCond::G,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_add_reg_reg() {
        // add rax, rbx
        let insts = decode_buffer(&[0x48, 0x01, 0xd8], 0x1000).unwrap();
        assert_eq!(insts.len(), 1);
        let inst = &insts[0];
        assert_eq!(inst.mnemonic, Mnemonic::Add);
        assert_eq!(inst.width, OpWidth::Qword);
        assert_eq!(inst.operands[0], Operand::Reg(Gpr::Rax, OpWidth::Qword));
        assert_eq!(inst.operands[1], Operand::Reg(Gpr::Rbx, OpWidth::Qword));
        assert_eq!(inst.flow, InstFlow::Sequential);
    }

    #[test]
    fn decodes_sib_memory_operand() {
        // lea rcx, [rax + rbx*2 + 4]
        let insts = decode_buffer(&[0x48, 0x8d, 0x4c, 0x58, 0x04], 0).unwrap();
        let inst = &insts[0];
        assert_eq!(inst.mnemonic, Mnemonic::Lea);
        match inst.operands[1] {
            Operand::Mem(m) => {
                assert_eq!(m.base, Some(Gpr::Rax));
                assert_eq!(m.index, Some(Gpr::Rbx));
                assert_eq!(m.scale, 2);
                assert_eq!(m.disp, 4);
                assert!(!m.rip_relative);
            }
            ref other => panic!("expected memory operand, got {other:?}"),
        }
    }

    #[test]
    fn resolves_branch_targets() {
        // jne +5 at rva 0x2000, target 0x2007
        let insts = decode_buffer(&[0x75, 0x05], 0x2000).unwrap();
        let inst = &insts[0];
        assert_eq!(inst.flow, InstFlow::CondJump);
        assert_eq!(inst.branch_target, Some(0x2007));
        assert_eq!(inst.cond, Some(VmCond::Ne));
    }

    #[test]
    fn rejects_garbage() {
        // 0x06 is invalid in 64-bit mode
        let err = decode_buffer(&[0x06], 0x3000).unwrap_err();
        assert!(matches!(err, VirtError::Decode(0x3000)));
    }
}
