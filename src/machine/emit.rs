//! Typed constructors for the concrete instructions handler bodies are
//! built from.
//!
//! Every constructor returns a fully formed, address-independent
//! instruction; rip-relative operands never appear here. Failures from the
//! underlying instruction model surface as encoding failures with the
//! mnemonic attached.

use iced_x86::{Code, Instruction, MemoryOperand, Register};

use crate::codec::{Gpr, OpWidth, Xmm};
use crate::error::{VirtError, VirtResult};
use crate::ir::BinaryOp;

fn build_err(mnemonic: &str, e: iced_x86::IcedError) -> VirtError {
    VirtError::EncodingFailure {
        mnemonic: mnemonic.to_string(),
        reason: e.to_string(),
    }
}

/// `[base]`
pub fn mem_base(base: Gpr) -> MemoryOperand {
    mem(base.to_raw(OpWidth::Qword), Register::None, 1, 0)
}

/// `[base + disp]`
pub fn mem_base_disp(base: Gpr, disp: i64) -> MemoryOperand {
    mem(base.to_raw(OpWidth::Qword), Register::None, 1, disp)
}

/// `[base + index]`
pub fn mem_base_index(base: Gpr, index: Gpr) -> MemoryOperand {
    mem(
        base.to_raw(OpWidth::Qword),
        index.to_raw(OpWidth::Qword),
        1,
        0,
    )
}

fn mem(base: Register, index: Register, scale: u32, disp: i64) -> MemoryOperand {
    let disp_size = if disp == 0 { 0 } else { 1 };
    MemoryOperand::new(base, index, scale, disp, disp_size, false, Register::None)
}

/// `mov reg, imm64`
pub fn mov_ri64(dst: Gpr, imm: u64) -> VirtResult<Instruction> {
    Instruction::with2(Code::Mov_r64_imm64, dst.to_raw(OpWidth::Qword), imm)
        .map_err(|e| build_err("mov", e))
}

/// `mov dst, src` at `width`.
pub fn mov_rr(dst: Gpr, src: Gpr, width: OpWidth) -> VirtResult<Instruction> {
    let code = match width {
        OpWidth::Byte => Code::Mov_r8_rm8,
        OpWidth::Word => Code::Mov_r16_rm16,
        OpWidth::Dword => Code::Mov_r32_rm32,
        OpWidth::Qword => Code::Mov_r64_rm64,
    };
    Instruction::with2(code, dst.to_raw(width), src.to_raw(width)).map_err(|e| build_err("mov", e))
}

/// `mov dst, [mem]` at `width`, zero-extending narrow loads into the full
/// register.
pub fn load(dst: Gpr, src: MemoryOperand, width: OpWidth) -> VirtResult<Instruction> {
    let inst = match width {
        OpWidth::Byte => Instruction::with2(Code::Movzx_r64_rm8, dst.to_raw(OpWidth::Qword), src),
        OpWidth::Word => Instruction::with2(Code::Movzx_r64_rm16, dst.to_raw(OpWidth::Qword), src),
        OpWidth::Dword => Instruction::with2(Code::Mov_r32_rm32, dst.to_raw(OpWidth::Dword), src),
        OpWidth::Qword => Instruction::with2(Code::Mov_r64_rm64, dst.to_raw(OpWidth::Qword), src),
    };
    inst.map_err(|e| build_err("mov", e))
}

/// `mov [mem], src` at `width`.
pub fn store(dst: MemoryOperand, src: Gpr, width: OpWidth) -> VirtResult<Instruction> {
    let code = match width {
        OpWidth::Byte => Code::Mov_rm8_r8,
        OpWidth::Word => Code::Mov_rm16_r16,
        OpWidth::Dword => Code::Mov_rm32_r32,
        OpWidth::Qword => Code::Mov_rm64_r64,
    };
    Instruction::with2(code, dst, src.to_raw(width)).map_err(|e| build_err("mov", e))
}

/// `op dst, src` at `width`.
pub fn alu_rr(op: BinaryOp, dst: Gpr, src: Gpr, width: OpWidth) -> VirtResult<Instruction> {
    use BinaryOp::*;
    let code = match (op, width) {
        (Add, OpWidth::Byte) => Code::Add_r8_rm8,
        (Add, OpWidth::Word) => Code::Add_r16_rm16,
        (Add, OpWidth::Dword) => Code::Add_r32_rm32,
        (Add, OpWidth::Qword) => Code::Add_r64_rm64,
        (Sub, OpWidth::Byte) => Code::Sub_r8_rm8,
        (Sub, OpWidth::Word) => Code::Sub_r16_rm16,
        (Sub, OpWidth::Dword) => Code::Sub_r32_rm32,
        (Sub, OpWidth::Qword) => Code::Sub_r64_rm64,
        (And, OpWidth::Byte) => Code::And_r8_rm8,
        (And, OpWidth::Word) => Code::And_r16_rm16,
        (And, OpWidth::Dword) => Code::And_r32_rm32,
        (And, OpWidth::Qword) => Code::And_r64_rm64,
        (Or, OpWidth::Byte) => Code::Or_r8_rm8,
        (Or, OpWidth::Word) => Code::Or_r16_rm16,
        (Or, OpWidth::Dword) => Code::Or_r32_rm32,
        (Or, OpWidth::Qword) => Code::Or_r64_rm64,
        (Xor, OpWidth::Byte) => Code::Xor_r8_rm8,
        (Xor, OpWidth::Word) => Code::Xor_r16_rm16,
        (Xor, OpWidth::Dword) => Code::Xor_r32_rm32,
        (Xor, OpWidth::Qword) => Code::Xor_r64_rm64,
    };
    Instruction::with2(code, dst.to_raw(width), src.to_raw(width)).map_err(|e| build_err("alu", e))
}

/// `add reg, imm`
pub fn add_ri(dst: Gpr, imm: i32) -> VirtResult<Instruction> {
    let code = if (-128..=127).contains(&imm) {
        Code::Add_rm64_imm8
    } else {
        Code::Add_rm64_imm32
    };
    Instruction::with2(code, dst.to_raw(OpWidth::Qword), imm).map_err(|e| build_err("add", e))
}

/// `sub reg, imm`
pub fn sub_ri(dst: Gpr, imm: i32) -> VirtResult<Instruction> {
    let code = if (-128..=127).contains(&imm) {
        Code::Sub_rm64_imm8
    } else {
        Code::Sub_rm64_imm32
    };
    Instruction::with2(code, dst.to_raw(OpWidth::Qword), imm).map_err(|e| build_err("sub", e))
}

/// `not reg`
pub fn not_r64(dst: Gpr) -> VirtResult<Instruction> {
    Instruction::with1(Code::Not_rm64, dst.to_raw(OpWidth::Qword)).map_err(|e| build_err("not", e))
}

/// `shl reg, count`
pub fn shl_ri(dst: Gpr, count: u32) -> VirtResult<Instruction> {
    debug_assert!(count > 0 && count < 64);
    Instruction::with2(Code::Shl_rm64_imm8, dst.to_raw(OpWidth::Qword), count as i32)
        .map_err(|e| build_err("shl", e))
}

/// `shr reg, count`
pub fn shr_ri(dst: Gpr, count: u32) -> VirtResult<Instruction> {
    debug_assert!(count > 0 && count < 64);
    Instruction::with2(Code::Shr_rm64_imm8, dst.to_raw(OpWidth::Qword), count as i32)
        .map_err(|e| build_err("shr", e))
}

/// `ror reg, count`
pub fn ror_ri(dst: Gpr, count: u32) -> VirtResult<Instruction> {
    debug_assert!(count > 0 && count < 64);
    Instruction::with2(Code::Ror_rm64_imm8, dst.to_raw(OpWidth::Qword), count as i32)
        .map_err(|e| build_err("ror", e))
}

/// `rol reg, count`
pub fn rol_ri(dst: Gpr, count: u32) -> VirtResult<Instruction> {
    debug_assert!(count > 0 && count < 64);
    Instruction::with2(Code::Rol_rm64_imm8, dst.to_raw(OpWidth::Qword), count as i32)
        .map_err(|e| build_err("rol", e))
}

/// `test reg, imm32`
pub fn test_ri(dst: Gpr, imm: i32) -> VirtResult<Instruction> {
    Instruction::with2(Code::Test_rm64_imm32, dst.to_raw(OpWidth::Qword), imm)
        .map_err(|e| build_err("test", e))
}

/// `push reg`
pub fn push_r64(reg: Gpr) -> VirtResult<Instruction> {
    Instruction::with1(Code::Push_r64, reg.to_raw(OpWidth::Qword)).map_err(|e| build_err("push", e))
}

/// `push qword [mem]`
pub fn push_m64(mem: MemoryOperand) -> VirtResult<Instruction> {
    Instruction::with1(Code::Push_rm64, mem).map_err(|e| build_err("push", e))
}

/// `pop reg`
pub fn pop_r64(reg: Gpr) -> VirtResult<Instruction> {
    Instruction::with1(Code::Pop_r64, reg.to_raw(OpWidth::Qword)).map_err(|e| build_err("pop", e))
}

/// `pushfq`
pub fn pushfq() -> Instruction {
    Instruction::with(Code::Pushfq)
}

/// `popfq`
pub fn popfq() -> Instruction {
    Instruction::with(Code::Popfq)
}

/// `ret`
pub fn ret() -> Instruction {
    Instruction::with(Code::Retnq)
}

/// `jmp reg`
pub fn jmp_r64(reg: Gpr) -> VirtResult<Instruction> {
    Instruction::with1(Code::Jmp_rm64, reg.to_raw(OpWidth::Qword)).map_err(|e| build_err("jmp", e))
}

/// Sign-extend `reg` from `from` bits to the full register.
pub fn sext_r64(reg: Gpr, from: OpWidth) -> VirtResult<Instruction> {
    let inst = match from {
        OpWidth::Byte => Instruction::with2(
            Code::Movsx_r64_rm8,
            reg.to_raw(OpWidth::Qword),
            reg.to_raw(OpWidth::Byte),
        ),
        OpWidth::Word => Instruction::with2(
            Code::Movsx_r64_rm16,
            reg.to_raw(OpWidth::Qword),
            reg.to_raw(OpWidth::Word),
        ),
        OpWidth::Dword => Instruction::with2(
            Code::Movsxd_r64_rm32,
            reg.to_raw(OpWidth::Qword),
            reg.to_raw(OpWidth::Dword),
        ),
        OpWidth::Qword => return mov_rr(reg, reg, OpWidth::Qword),
    };
    inst.map_err(|e| build_err("movsx", e))
}

/// Zero-extend `reg` from `from` bits to the full register.
pub fn zext_r64(reg: Gpr, from: OpWidth) -> VirtResult<Instruction> {
    let inst = match from {
        OpWidth::Byte => Instruction::with2(
            Code::Movzx_r64_rm8,
            reg.to_raw(OpWidth::Qword),
            reg.to_raw(OpWidth::Byte),
        ),
        OpWidth::Word => Instruction::with2(
            Code::Movzx_r64_rm16,
            reg.to_raw(OpWidth::Qword),
            reg.to_raw(OpWidth::Word),
        ),
        // a 32-bit move clears the upper half
        OpWidth::Dword => {
            return mov_rr(reg, reg, OpWidth::Dword);
        }
        OpWidth::Qword => return mov_rr(reg, reg, OpWidth::Qword),
    };
    inst.map_err(|e| build_err("movzx", e))
}

/// `pextrq dst, src, lane`
pub fn pextrq(dst: Gpr, src: Xmm, lane: u32) -> VirtResult<Instruction> {
    Instruction::with3(
        Code::Pextrq_rm64_xmm_imm8,
        dst.to_raw(OpWidth::Qword),
        src.to_raw(),
        lane as i32,
    )
    .map_err(|e| build_err("pextrq", e))
}

/// `pinsrq dst, src, lane`
pub fn pinsrq(dst: Xmm, src: Gpr, lane: u32) -> VirtResult<Instruction> {
    Instruction::with3(
        Code::Pinsrq_xmm_rm64_imm8,
        dst.to_raw(),
        src.to_raw(OpWidth::Qword),
        lane as i32,
    )
    .map_err(|e| build_err("pinsrq", e))
}
