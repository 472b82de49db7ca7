//! Shared VM handler bodies.
//!
//! One handler exists per `(kind, width, operand count)` key within a VM.
//! Handlers read their stack operands at fixed `vsp`-relative slots, work in
//! the two scratch temporaries, write results back, adjust `vsp`, and
//! return to the block stream. Inline operands arrive in the VIP role
//! register. Entry and exit handlers move whole guest contexts through the
//! native stack; everything the VM touches outside the reserved set is
//! restored on exit, the XMM destination pool excepted.

use log::debug;

use crate::asm::{CodeContainer, Item, LabelId, LabelPool};
use crate::codec::{Gpr, OpWidth};
use crate::error::VirtResult;
use crate::ir::condcodes::VmCond;
use crate::ir::{BinaryOp, CtxSlot, HandlerKey, HandlerKind};
use crate::machine::{emit, moves, VmFrame};
use crate::regalloc::RegLayout;

/// Native-stack displacement between the guest's rsp and its value at the
/// moment the entry handler pushes it: the call's return address plus the
/// four registers pushed earlier.
const RSP_BIAS: i32 = 8 + 4 * 8;

/// Build the body of one handler, binding `label` at its start.
pub fn build_handler(
    key: HandlerKey,
    layout: &RegLayout,
    frame: &VmFrame,
    label: LabelId,
    pool: &mut LabelPool,
) -> VirtResult<CodeContainer> {
    let mut c = CodeContainer::named(format!("handler_{:?}_{}", key.kind, key.width.bits()));
    c.bind(label);

    let vsp = layout.vsp();
    let vip = layout.vip();
    let vregs = layout.vregs();
    let t0 = layout.temp(0);
    let t1 = layout.temp(1);
    let width = key.width;

    match key.kind {
        HandlerKind::Push => {
            c.push_inst(emit::sub_ri(vsp, 8)?);
            c.push_inst(emit::store(emit::mem_base(vsp), vip, OpWidth::Qword)?);
            c.push_inst(emit::ret());
        }
        HandlerKind::Pop => {
            c.push_inst(emit::load(vip, emit::mem_base(vsp), OpWidth::Qword)?);
            c.push_inst(emit::add_ri(vsp, 8)?);
            c.push_inst(emit::ret());
        }
        HandlerKind::MemRead => {
            c.push_inst(emit::load(t0, emit::mem_base(vsp), OpWidth::Qword)?);
            c.push_inst(emit::load(t1, emit::mem_base(t0), width)?);
            c.push_inst(emit::store(emit::mem_base(vsp), t1, OpWidth::Qword)?);
            c.push_inst(emit::ret());
        }
        HandlerKind::MemWrite => {
            c.push_inst(emit::load(t0, emit::mem_base(vsp), OpWidth::Qword)?);
            c.push_inst(emit::load(t1, emit::mem_base_disp(vsp, 8), OpWidth::Qword)?);
            c.push_inst(emit::add_ri(vsp, 16)?);
            c.push_inst(emit::store(emit::mem_base(t0), t1, width)?);
            c.push_inst(emit::ret());
        }
        HandlerKind::Binary { op, captures_flags } => {
            c.push_inst(emit::load(t0, emit::mem_base(vsp), OpWidth::Qword)?);
            c.push_inst(emit::load(t1, emit::mem_base_disp(vsp, 8), OpWidth::Qword)?);
            c.push_inst(emit::alu_rr(op, t1, t0, width)?);
            if captures_flags {
                c.push_inst(emit::pushfq());
                c.push_inst(emit::pop_r64(t0)?);
                c.push_inst(emit::store(
                    emit::mem_base_disp(vregs, i64::from(CtxSlot::ScratchFlags.byte_offset())),
                    t0,
                    OpWidth::Qword,
                )?);
            }
            c.push_inst(emit::store(emit::mem_base_disp(vsp, 8), t1, OpWidth::Qword)?);
            c.push_inst(emit::add_ri(vsp, 8)?);
            c.push_inst(emit::ret());
        }
        HandlerKind::ScaleIndex(scale) => {
            let count = match scale {
                2 => 1,
                4 => 2,
                8 => 3,
                _ => unreachable!("scale {scale} needs no handler"),
            };
            c.push_inst(emit::load(t0, emit::mem_base(vsp), OpWidth::Qword)?);
            c.push_inst(emit::shl_ri(t0, count)?);
            c.push_inst(emit::store(emit::mem_base(vsp), t0, OpWidth::Qword)?);
            c.push_inst(emit::ret());
        }
        HandlerKind::SignExtend(from) => {
            c.push_inst(emit::load(t0, emit::mem_base(vsp), OpWidth::Qword)?);
            c.push_inst(emit::sext_r64(t0, from)?);
            if width != OpWidth::Qword {
                c.push_inst(emit::zext_r64(t0, width)?);
            }
            c.push_inst(emit::store(emit::mem_base(vsp), t0, OpWidth::Qword)?);
            c.push_inst(emit::ret());
        }
        HandlerKind::ZeroExtend(from) => {
            c.push_inst(emit::load(t0, emit::mem_base(vsp), OpWidth::Qword)?);
            c.push_inst(emit::zext_r64(t0, from)?);
            c.push_inst(emit::store(emit::mem_base(vsp), t0, OpWidth::Qword)?);
            c.push_inst(emit::ret());
        }
        HandlerKind::FlagsUpdate => {
            let scratch = i64::from(CtxSlot::ScratchFlags.byte_offset());
            let rflags = i64::from(CtxSlot::Rflags.byte_offset());
            c.push_inst(emit::load(t0, emit::mem_base_disp(vregs, scratch), OpWidth::Qword)?);
            c.push_inst(emit::alu_rr(BinaryOp::And, t0, vip, OpWidth::Qword)?);
            c.push_inst(emit::not_r64(vip)?);
            c.push_inst(emit::load(t1, emit::mem_base_disp(vregs, rflags), OpWidth::Qword)?);
            c.push_inst(emit::alu_rr(BinaryOp::And, t1, vip, OpWidth::Qword)?);
            c.push_inst(emit::alu_rr(BinaryOp::Or, t1, t0, OpWidth::Qword)?);
            c.push_inst(emit::store(emit::mem_base_disp(vregs, rflags), t1, OpWidth::Qword)?);
            c.push_inst(emit::ret());
        }
        HandlerKind::ContextLoad => {
            c.push_inst(emit::load(t0, emit::mem_base_index(vregs, vip), OpWidth::Qword)?);
            c.push_inst(emit::sub_ri(vsp, 8)?);
            c.push_inst(emit::store(emit::mem_base(vsp), t0, OpWidth::Qword)?);
            c.push_inst(emit::ret());
        }
        HandlerKind::ContextStore => {
            c.push_inst(emit::load(t0, emit::mem_base(vsp), OpWidth::Qword)?);
            c.push_inst(emit::add_ri(vsp, 8)?);
            c.push_inst(emit::store(emit::mem_base_index(vregs, vip), t0, OpWidth::Qword)?);
            c.push_inst(emit::ret());
        }
        HandlerKind::BranchCond(cond) => {
            build_branch_cond(&mut c, cond, layout, pool)?;
        }
        HandlerKind::VmEnter => {
            build_vm_enter(&mut c, layout, frame)?;
        }
        HandlerKind::VmExit => {
            build_vm_exit(&mut c, layout, frame)?;
        }
        HandlerKind::VmExitRet => {
            build_vm_exit_ret(&mut c, layout, frame)?;
        }
    }

    debug!(
        "built handler {:?}/{} with {} items",
        key.kind,
        key.width.bits(),
        c.items().len()
    );
    Ok(c)
}

/// Pop the flags value, evaluate `cond`, and leave through `vcsret` (taken)
/// or `vcs` (not taken).
fn build_branch_cond(
    c: &mut CodeContainer,
    cond: VmCond,
    layout: &RegLayout,
    pool: &mut LabelPool,
) -> VirtResult<()> {
    let vsp = layout.vsp();
    let t0 = layout.temp(0);
    let t1 = layout.temp(1);

    c.push_inst(emit::load(t0, emit::mem_base(vsp), OpWidth::Qword)?);
    c.push_inst(emit::add_ri(vsp, 8)?);

    const CF: i32 = 1 << 0;
    const PF: i32 = 1 << 2;
    const ZF: i32 = 1 << 6;
    const SF: i32 = 1 << 7;
    const OF: i32 = 1 << 11;

    // sf_xor_of leaves SF^OF at bit 7 of t1
    let sf_xor_of = |c: &mut CodeContainer| -> VirtResult<()> {
        c.push_inst(emit::mov_rr(t1, t0, OpWidth::Qword)?);
        c.push_inst(emit::shr_ri(t1, 4)?);
        c.push_inst(emit::alu_rr(BinaryOp::Xor, t1, t0, OpWidth::Qword)?);
        Ok(())
    };

    match cond {
        VmCond::G => {
            // not greater when SF != OF or ZF set; fall through to taken
            let not_taken = pool.create("bc_not_taken");
            sf_xor_of(c)?;
            c.push_inst(emit::test_ri(t1, SF)?);
            c.push(Item::JccTo(VmCond::Ne, not_taken));
            c.push_inst(emit::test_ri(t0, ZF)?);
            c.push(Item::JccTo(VmCond::Ne, not_taken));
            c.push_inst(emit::jmp_r64(layout.vcsret())?);
            c.bind(not_taken);
            c.push_inst(emit::jmp_r64(layout.vcs())?);
            return Ok(());
        }
        VmCond::Le => {
            let taken = pool.create("bc_taken");
            sf_xor_of(c)?;
            c.push_inst(emit::test_ri(t1, SF)?);
            c.push(Item::JccTo(VmCond::Ne, taken));
            c.push_inst(emit::test_ri(t0, ZF)?);
            c.push(Item::JccTo(VmCond::Ne, taken));
            c.push_inst(emit::jmp_r64(layout.vcs())?);
            c.bind(taken);
            c.push_inst(emit::jmp_r64(layout.vcsret())?);
            return Ok(());
        }
        VmCond::L | VmCond::Ge => {
            let taken = pool.create("bc_taken");
            sf_xor_of(c)?;
            c.push_inst(emit::test_ri(t1, SF)?);
            let jcc = if cond == VmCond::L { VmCond::Ne } else { VmCond::E };
            c.push(Item::JccTo(jcc, taken));
            c.push_inst(emit::jmp_r64(layout.vcs())?);
            c.bind(taken);
            c.push_inst(emit::jmp_r64(layout.vcsret())?);
            return Ok(());
        }
        _ => {}
    }

    let (mask, when_set) = match cond {
        VmCond::O => (OF, true),
        VmCond::No => (OF, false),
        VmCond::B => (CF, true),
        VmCond::Ae => (CF, false),
        VmCond::E => (ZF, true),
        VmCond::Ne => (ZF, false),
        VmCond::Be => (CF | ZF, true),
        VmCond::A => (CF | ZF, false),
        VmCond::S => (SF, true),
        VmCond::Ns => (SF, false),
        VmCond::P => (PF, true),
        VmCond::Np => (PF, false),
        _ => unreachable!("handled above"),
    };

    let taken = pool.create("bc_taken");
    c.push_inst(emit::test_ri(t0, mask)?);
    let jcc = if when_set { VmCond::Ne } else { VmCond::E };
    c.push(Item::JccTo(jcc, taken));
    c.push_inst(emit::jmp_r64(layout.vcs())?);
    c.bind(taken);
    c.push_inst(emit::jmp_r64(layout.vcsret())?);
    Ok(())
}

/// Spill the native guest state through the native stack into the scatter
/// plan, then return to the block stream.
fn build_vm_enter(c: &mut CodeContainer, layout: &RegLayout, frame: &VmFrame) -> VirtResult<()> {
    let vip = layout.vip();
    let t0 = layout.temp(0);
    let t1 = layout.temp(1);

    // save everything before the first clobber
    for gpr in Gpr::ALL {
        c.push_inst(emit::push_r64(gpr)?);
    }
    c.push_inst(emit::pushfq());

    c.push(Item::MovLabelVa {
        reg: layout.vregs(),
        label: frame.ctx,
    });
    c.push(Item::MovLabelVa {
        reg: layout.vsp(),
        label: frame.stack_top,
    });
    c.push(Item::MovImageBase {
        reg: layout.vbase(),
    });

    c.push_inst(emit::pop_r64(t0)?);
    c.push_inst(emit::store(
        emit::mem_base_disp(layout.vregs(), i64::from(CtxSlot::Rflags.byte_offset())),
        t0,
        OpWidth::Qword,
    )?);

    for gpr in Gpr::ALL.into_iter().rev() {
        c.push_inst(emit::pop_r64(vip)?);
        if gpr == Gpr::Rsp {
            // undo the call and the pushes that preceded this slot
            c.push_inst(emit::add_ri(vip, RSP_BIAS)?);
        }
        moves::emit_scatter(c, layout, gpr, OpWidth::Qword, vip, t0, t1)?;
    }

    c.push_inst(emit::ret());
    Ok(())
}

/// Gather every guest register back out of the scatter plan and leave the
/// VM for the target address held in VIP.
fn build_vm_exit(c: &mut CodeContainer, layout: &RegLayout, frame: &VmFrame) -> VirtResult<()> {
    let vip = layout.vip();
    let t0 = layout.temp(0);

    // final return target, deepest on the native stack
    c.push_inst(emit::push_r64(vip)?);
    c.bind(frame.exit_restore);

    for gpr in Gpr::ALL {
        moves::emit_gather(c, layout, gpr, OpWidth::Qword, vip, t0)?;
        c.push_inst(emit::push_r64(vip)?);
    }
    c.push_inst(emit::load(
        t0,
        emit::mem_base_disp(layout.vregs(), i64::from(CtxSlot::Rflags.byte_offset())),
        OpWidth::Qword,
    )?);
    c.push_inst(emit::push_r64(t0)?);

    c.push_inst(emit::popfq());
    for gpr in Gpr::ALL.into_iter().rev() {
        if gpr == Gpr::Rsp {
            // the native stack pointer is already balanced; discard the
            // gathered value into a register restored later
            c.push_inst(emit::pop_r64(Gpr::Rax)?);
        } else {
            c.push_inst(emit::pop_r64(gpr)?);
        }
    }
    c.push_inst(emit::ret());
    Ok(())
}

/// Return through the guest stack: read the return address at the guest
/// rsp, bump it, and join the shared restore path.
fn build_vm_exit_ret(c: &mut CodeContainer, layout: &RegLayout, frame: &VmFrame) -> VirtResult<()> {
    let vip = layout.vip();
    let t0 = layout.temp(0);
    let t1 = layout.temp(1);

    moves::emit_gather(c, layout, Gpr::Rsp, OpWidth::Qword, vip, t0)?;
    c.push_inst(emit::push_m64(emit::mem_base(vip))?);
    c.push_inst(emit::add_ri(vip, 8)?);
    moves::emit_scatter(c, layout, Gpr::Rsp, OpWidth::Qword, vip, t0, t1)?;

    c.push(Item::JumpTo(frame.exit_restore));
    Ok(())
}
