//! Per-mnemonic lifters.
//!
//! Handlers are uniform: source operands are lowered to pushes (memory
//! operands push an address computation and a load), the operation runs
//! against the VM stack, and the result is either discarded or written back
//! through the symmetric pop/store path. Flag-producing instructions emit a
//! [`Command::FlagsUpdate`] carrying the defined/undefined split of the
//! Intel SDM for that mnemonic.
//!
//! `mul` and `imul` are deliberately absent, as are `rip`- and
//! `rsp`-relative forms; they surface as unsupported-instruction errors with
//! the offending address.

use crate::codec::{Gpr, Inst, MemOperand, Mnemonic, OpWidth, Operand};
use crate::error::{VirtError, VirtResult};
use crate::ir::flags::FlagSet;
use crate::ir::{BinaryOp, Command, CtxSlot};

/// Lift one non-terminator instruction into `out`.
pub fn lift_inst(out: &mut Vec<Command>, inst: &Inst) -> VirtResult<()> {
    match inst.mnemonic {
        Mnemonic::Add => lift_binary(out, inst, BinaryOp::Add, true, arith_flags()),
        Mnemonic::Sub => lift_binary(out, inst, BinaryOp::Sub, true, arith_flags()),
        Mnemonic::Cmp => lift_binary(out, inst, BinaryOp::Sub, false, arith_flags()),
        Mnemonic::And => lift_binary(out, inst, BinaryOp::And, true, logic_flags()),
        Mnemonic::Or => lift_binary(out, inst, BinaryOp::Or, true, logic_flags()),
        Mnemonic::Xor => lift_binary(out, inst, BinaryOp::Xor, true, logic_flags()),
        Mnemonic::Test => lift_binary(out, inst, BinaryOp::And, false, logic_flags()),
        Mnemonic::Inc => lift_step(out, inst, BinaryOp::Add),
        Mnemonic::Dec => lift_step(out, inst, BinaryOp::Sub),
        Mnemonic::Mov => lift_mov(out, inst),
        Mnemonic::Movsx | Mnemonic::Movsxd => lift_extend(out, inst, true),
        Mnemonic::Movzx => lift_extend(out, inst, false),
        Mnemonic::Lea => lift_lea(out, inst),
        Mnemonic::Nop => Ok(()),
        _ => Err(unsupported(inst)),
    }
}

/// The unsupported-instruction error for `inst`.
pub(crate) fn unsupported(inst: &Inst) -> VirtError {
    VirtError::UnsupportedInstruction {
        mnemonic: format!("{:?}", inst.mnemonic).to_lowercase(),
        rva: inst.rva,
    }
}

/// `add`/`sub`/`cmp` flag behavior: all six status flags defined.
fn arith_flags() -> (FlagSet, FlagSet) {
    (FlagSet::STATUS, FlagSet::EMPTY)
}

/// `and`/`or`/`xor`/`test` flag behavior: AF is architecturally undefined.
fn logic_flags() -> (FlagSet, FlagSet) {
    (FlagSet::STATUS.difference(FlagSet::AF), FlagSet::AF)
}

/// `inc`/`dec` flag behavior: CF is untouched.
fn step_flags() -> (FlagSet, FlagSet) {
    (FlagSet::STATUS.difference(FlagSet::CF), FlagSet::EMPTY)
}

fn lift_binary(
    out: &mut Vec<Command>,
    inst: &Inst,
    op: BinaryOp,
    writeback: bool,
    (defined, undefined): (FlagSet, FlagSet),
) -> VirtResult<()> {
    let (dst, src) = two_operands(inst)?;
    let width = inst.width;

    if writeback {
        if let Operand::Mem(mem) = dst {
            // Read-modify-write: compute the address once, park it in a
            // spill slot, and reload it for the store.
            check_mem(inst, &mem)?;
            push_address(out, &mem);
            out.push(Command::ContextStore {
                slot: CtxSlot::Spill(0),
            });
            out.push(Command::ContextLoad {
                slot: CtxSlot::Spill(0),
            });
            out.push(Command::MemRead { width });
            push_source(out, inst, &src, width)?;
            out.push(Command::Binary {
                op,
                width,
                updates_flags: true,
            });
            out.push(Command::FlagsUpdate { defined, undefined });
            out.push(Command::ContextLoad {
                slot: CtxSlot::Spill(0),
            });
            out.push(Command::MemWrite { width });
            return Ok(());
        }
    }

    push_source(out, inst, &dst, width)?;
    push_source(out, inst, &src, width)?;
    out.push(Command::Binary {
        op,
        width,
        updates_flags: true,
    });
    out.push(Command::FlagsUpdate { defined, undefined });
    if writeback {
        pop_into_register(out, inst, &dst, width)?;
    } else {
        out.push(Command::PopDiscard { width });
    }
    Ok(())
}

fn lift_step(out: &mut Vec<Command>, inst: &Inst, op: BinaryOp) -> VirtResult<()> {
    let dst = one_operand(inst)?;
    let width = inst.width;
    let (defined, undefined) = step_flags();

    if let Operand::Mem(mem) = dst {
        check_mem(inst, &mem)?;
        push_address(out, &mem);
        out.push(Command::ContextStore {
            slot: CtxSlot::Spill(0),
        });
        out.push(Command::ContextLoad {
            slot: CtxSlot::Spill(0),
        });
        out.push(Command::MemRead { width });
        out.push(Command::PushImm { value: 1, width });
        out.push(Command::Binary {
            op,
            width,
            updates_flags: true,
        });
        out.push(Command::FlagsUpdate { defined, undefined });
        out.push(Command::ContextLoad {
            slot: CtxSlot::Spill(0),
        });
        out.push(Command::MemWrite { width });
        return Ok(());
    }

    push_source(out, inst, &dst, width)?;
    out.push(Command::PushImm { value: 1, width });
    out.push(Command::Binary {
        op,
        width,
        updates_flags: true,
    });
    out.push(Command::FlagsUpdate { defined, undefined });
    pop_into_register(out, inst, &dst, width)
}

fn lift_mov(out: &mut Vec<Command>, inst: &Inst) -> VirtResult<()> {
    let (dst, src) = two_operands(inst)?;
    let width = inst.width;

    match dst {
        Operand::Reg(..) => {
            push_source(out, inst, &src, width)?;
            pop_into_register(out, inst, &dst, width)
        }
        Operand::Mem(mem) => {
            check_mem(inst, &mem)?;
            push_source(out, inst, &src, width)?;
            push_address(out, &mem);
            out.push(Command::MemWrite { width });
            Ok(())
        }
        _ => Err(unsupported(inst)),
    }
}

fn lift_extend(out: &mut Vec<Command>, inst: &Inst, signed: bool) -> VirtResult<()> {
    let (dst, src) = two_operands(inst)?;
    let to = match dst {
        Operand::Reg(reg, w) => {
            check_reg(inst, reg)?;
            w
        }
        _ => return Err(unsupported(inst)),
    };
    let from = match src {
        Operand::Reg(_, w) => w,
        Operand::Mem(m) => m.width,
        _ => return Err(unsupported(inst)),
    };

    push_source(out, inst, &src, from)?;
    out.push(if signed {
        Command::SignExtend { from, to }
    } else {
        Command::ZeroExtend { from, to }
    });
    pop_into_register(out, inst, &dst, to)
}

fn lift_lea(out: &mut Vec<Command>, inst: &Inst) -> VirtResult<()> {
    let (dst, src) = two_operands(inst)?;
    let mem = match src {
        Operand::Mem(m) => m,
        _ => return Err(unsupported(inst)),
    };
    check_mem(inst, &mem)?;
    push_address(out, &mem);
    // Narrow destinations truncate the computed address; the register pop
    // already has the right zero- or preserve-upper semantics per width.
    pop_into_register(out, inst, &dst, inst.width)
}

/// Push the value of one source operand at `width`.
fn push_source(
    out: &mut Vec<Command>,
    inst: &Inst,
    op: &Operand,
    width: OpWidth,
) -> VirtResult<()> {
    match *op {
        Operand::Reg(reg, w) => {
            check_reg(inst, reg)?;
            out.push(Command::PushReg { reg, width: w });
            Ok(())
        }
        Operand::Imm(value) => {
            out.push(Command::PushImm {
                value: value & width.mask(),
                width,
            });
            Ok(())
        }
        Operand::Mem(mem) => {
            check_mem(inst, &mem)?;
            push_address(out, &mem);
            out.push(Command::MemRead { width });
            Ok(())
        }
        Operand::Rel(_) => Err(unsupported(inst)),
    }
}

/// Push the effective address of a memory operand as a 64-bit value.
fn push_address(out: &mut Vec<Command>, mem: &MemOperand) {
    out.push(Command::PushImm {
        value: mem.disp as u64,
        width: OpWidth::Qword,
    });
    if let Some(base) = mem.base {
        out.push(Command::PushReg {
            reg: base,
            width: OpWidth::Qword,
        });
        out.push(Command::Binary {
            op: BinaryOp::Add,
            width: OpWidth::Qword,
            updates_flags: false,
        });
    }
    if let Some(index) = mem.index {
        out.push(Command::PushReg {
            reg: index,
            width: OpWidth::Qword,
        });
        if mem.scale > 1 {
            out.push(Command::ScaleIndex { scale: mem.scale });
        }
        out.push(Command::Binary {
            op: BinaryOp::Add,
            width: OpWidth::Qword,
            updates_flags: false,
        });
    }
}

fn pop_into_register(
    out: &mut Vec<Command>,
    inst: &Inst,
    op: &Operand,
    width: OpWidth,
) -> VirtResult<()> {
    match *op {
        Operand::Reg(reg, _) => {
            check_reg(inst, reg)?;
            out.push(Command::PopReg { reg, width });
            Ok(())
        }
        _ => Err(unsupported(inst)),
    }
}

fn one_operand(inst: &Inst) -> VirtResult<Operand> {
    match inst.operands.as_slice() {
        &[op] => Ok(op),
        _ => Err(unsupported(inst)),
    }
}

fn two_operands(inst: &Inst) -> VirtResult<(Operand, Operand)> {
    match inst.operands.as_slice() {
        &[dst, src] => Ok((dst, src)),
        _ => Err(unsupported(inst)),
    }
}

fn check_reg(inst: &Inst, reg: Gpr) -> VirtResult<()> {
    // The stack pointer diverges inside the VM by design; instructions that
    // name it are outside the supported subset.
    if reg == Gpr::Rsp {
        return Err(unsupported(inst));
    }
    Ok(())
}

fn check_mem(inst: &Inst, mem: &MemOperand) -> VirtResult<()> {
    if mem.rip_relative {
        return Err(unsupported(inst));
    }
    for reg in [mem.base, mem.index].into_iter().flatten() {
        check_reg(inst, reg)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_buffer;

    fn lift_one(bytes: &[u8]) -> Vec<Command> {
        let insts = decode_buffer(bytes, 0).unwrap();
        let mut out = Vec::new();
        lift_inst(&mut out, &insts[0]).unwrap();
        out
    }

    #[test]
    fn add_reg_reg_shape() {
        let cmds = lift_one(&[0x48, 0x01, 0xd8]); // add rax, rbx
        assert_eq!(
            cmds,
            vec![
                Command::PushReg {
                    reg: Gpr::Rax,
                    width: OpWidth::Qword
                },
                Command::PushReg {
                    reg: Gpr::Rbx,
                    width: OpWidth::Qword
                },
                Command::Binary {
                    op: BinaryOp::Add,
                    width: OpWidth::Qword,
                    updates_flags: true
                },
                Command::FlagsUpdate {
                    defined: FlagSet::STATUS,
                    undefined: FlagSet::EMPTY
                },
                Command::PopReg {
                    reg: Gpr::Rax,
                    width: OpWidth::Qword
                },
            ]
        );
    }

    #[test]
    fn cmp_discards_its_result() {
        let cmds = lift_one(&[0x48, 0x39, 0xd8]); // cmp rax, rbx
        assert_eq!(
            cmds.last(),
            Some(&Command::PopDiscard {
                width: OpWidth::Qword
            })
        );
    }

    #[test]
    fn inc_leaves_carry_alone() {
        let cmds = lift_one(&[0x48, 0xff, 0xc0]); // inc rax
        let update = cmds
            .iter()
            .find_map(|c| match c {
                Command::FlagsUpdate { defined, .. } => Some(*defined),
                _ => None,
            })
            .expect("inc must update flags");
        assert!(!update.contains(FlagSet::CF));
        assert!(update.contains(FlagSet::OF));
    }

    #[test]
    fn every_lift_is_stack_neutral() {
        for bytes in [
            &[0x48, 0x01, 0xd8][..],          // add rax, rbx
            &[0x48, 0x29, 0xd8][..],          // sub rax, rbx
            &[0x48, 0x39, 0xd8][..],          // cmp rax, rbx
            &[0x48, 0xff, 0xc0][..],          // inc rax
            &[0x48, 0x8d, 0x4c, 0x58, 0x04][..], // lea rcx, [rax+rbx*2+4]
            &[0x48, 0x0f, 0xb6, 0xcb][..],    // movzx rcx, bl
            &[0x48, 0x21, 0xd8][..],          // and rax, rbx
        ] {
            let cmds = lift_one(bytes);
            let net: i32 = cmds.iter().map(|c| c.stack_effect().net()).sum();
            assert_eq!(net, 0, "unbalanced lift for {bytes:x?}");
        }
    }

    #[test]
    fn rsp_operands_are_rejected() {
        let insts = decode_buffer(&[0x48, 0x01, 0xc4], 0).unwrap(); // add rsp, rax
        let mut out = Vec::new();
        assert!(matches!(
            lift_inst(&mut out, &insts[0]),
            Err(VirtError::UnsupportedInstruction { .. })
        ));
    }

    #[test]
    fn mul_is_known_unsupported() {
        let insts = decode_buffer(&[0x48, 0xf7, 0xe3], 0).unwrap(); // mul rbx
        let mut out = Vec::new();
        assert!(matches!(
            lift_inst(&mut out, &insts[0]),
            Err(VirtError::UnsupportedInstruction { .. })
        ));
    }

    #[test]
    fn memory_rmw_spills_the_address_once() {
        let cmds = lift_one(&[0x48, 0x01, 0x18]); // add [rax], rbx
        let stores = cmds
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Command::ContextStore {
                        slot: CtxSlot::Spill(0)
                    }
                )
            })
            .count();
        let loads = cmds
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Command::ContextLoad {
                        slot: CtxSlot::Spill(0)
                    }
                )
            })
            .count();
        assert_eq!(stores, 1);
        assert_eq!(loads, 2);
        assert_eq!(cmds.last(), Some(&Command::MemWrite {
            width: OpWidth::Qword
        }));
    }
}
