#![allow(dead_code)]
//! Test support: an IR interpreter over a modeled guest.
//!
//! The interpreter executes lifted command lists against an architectural
//! model of the guest (registers, rflags, byte-addressed memory) that is
//! written independently of the lifter, so a disagreement points at a real
//! semantic bug rather than a shared assumption.

use std::collections::HashMap;

use talonvirt::codec::{Gpr, OpWidth};
use talonvirt::disasm::SegmentDisasm;
use talonvirt::ir::condcodes::VmCond;
use talonvirt::ir::{BinaryOp, Command, CtxSlot, Exit, ExitTarget, IrArena, IrBlockRef, PreoptBlock};
use talonvirt::lift;

pub const CF: u64 = 1 << 0;
pub const PF: u64 = 1 << 2;
pub const AF: u64 = 1 << 4;
pub const ZF: u64 = 1 << 6;
pub const SF: u64 = 1 << 7;
pub const OF: u64 = 1 << 11;

/// Architectural guest state.
#[derive(Clone, Default)]
pub struct GuestState {
    pub regs: [u64; 16],
    pub rflags: u64,
    pub mem: HashMap<u64, u8>,
}

impl GuestState {
    pub fn get(&self, reg: Gpr) -> u64 {
        self.regs[reg.index()]
    }

    pub fn set(&mut self, reg: Gpr, value: u64) -> &mut Self {
        self.regs[reg.index()] = value;
        self
    }

    pub fn flag(&self, mask: u64) -> bool {
        self.rflags & mask != 0
    }

    pub fn write_mem(&mut self, addr: u64, value: u64, width: OpWidth) {
        for (i, byte) in value.to_le_bytes()[..width.bytes() as usize].iter().enumerate() {
            self.mem.insert(addr + i as u64, *byte);
        }
    }

    pub fn read_mem(&self, addr: u64, width: OpWidth) -> u64 {
        let mut bytes = [0u8; 8];
        for (i, slot) in bytes[..width.bytes() as usize].iter_mut().enumerate() {
            *slot = *self.mem.get(&(addr + i as u64)).unwrap_or(&0);
        }
        u64::from_le_bytes(bytes)
    }
}

#[derive(Default)]
struct VmModel {
    stack: Vec<u64>,
    scratch_flags: u64,
    spill: [u64; 8],
}

/// Disassemble and lift a buffer at rva 0.
pub fn lift_bytes(bytes: &[u8]) -> (IrArena, Vec<PreoptBlock>, u64) {
    let mut dasm = SegmentDisasm::new(bytes, 0).expect("decode");
    let root = dasm.generate_blocks().expect("block recovery");
    let (arena, preopt) = lift::translate_segment(&dasm).expect("lift");
    (arena, preopt, root)
}

/// Find the lifted block originating at `rva`.
pub fn block_at(preopt: &[PreoptBlock], rva: u64) -> IrBlockRef {
    preopt
        .iter()
        .find(|p| p.origin == rva)
        .expect("no block at rva")
        .block
}

/// Execute the block graph from `entry` until control leaves the region.
/// Returns the external target address.
pub fn run(arena: &IrArena, entry: IrBlockRef, state: &mut GuestState) -> u64 {
    let mut vm = VmModel::default();
    let mut current = entry;
    let mut steps = 0u32;
    loop {
        steps += 1;
        assert!(steps < 10_000, "interpreter runaway");

        for command in &arena[current].commands {
            step(command, state, &mut vm);
        }
        match arena[current].exit {
            Exit::Branch { target } => match target {
                ExitTarget::Block(next) => current = next,
                ExitTarget::External(rva) => return rva,
            },
            Exit::CondPair {
                cond,
                taken,
                fallthrough,
            } => {
                let flags = vm.stack.pop().expect("condition operand");
                let target = if eval_cond(cond, flags) { taken } else { fallthrough };
                match target {
                    ExitTarget::Block(next) => current = next,
                    ExitTarget::External(rva) => return rva,
                }
            }
            Exit::Ret => {
                let rsp = state.get(Gpr::Rsp);
                let target = state.read_mem(rsp, OpWidth::Qword);
                state.set(Gpr::Rsp, rsp.wrapping_add(8));
                return target;
            }
        }
    }
}

fn step(command: &Command, state: &mut GuestState, vm: &mut VmModel) {
    match *command {
        Command::VmEnter | Command::VmExit => {}
        Command::PushImm { value, width } => vm.stack.push(value & width.mask()),
        Command::PushReg { reg, width } => vm.stack.push(state.get(reg) & width.mask()),
        Command::PopReg { reg, width } => {
            let value = vm.stack.pop().expect("pop into register");
            let merged = match width {
                OpWidth::Qword => value,
                // 32-bit writes zero-extend, narrower writes merge
                OpWidth::Dword => value & width.mask(),
                w => (state.get(reg) & !w.mask()) | (value & w.mask()),
            };
            state.set(reg, merged);
        }
        Command::PopDiscard { .. } => {
            vm.stack.pop().expect("pop discard");
        }
        Command::MemRead { width } => {
            let addr = vm.stack.pop().expect("address");
            vm.stack.push(state.read_mem(addr, width));
        }
        Command::MemWrite { width } => {
            let addr = vm.stack.pop().expect("address");
            let value = vm.stack.pop().expect("value");
            state.write_mem(addr, value, width);
        }
        Command::Binary {
            op,
            width,
            updates_flags,
        } => {
            let rhs = vm.stack.pop().expect("rhs");
            let lhs = vm.stack.pop().expect("lhs");
            let (result, flags) = alu(op, lhs, rhs, width);
            vm.stack.push(result);
            if updates_flags {
                vm.scratch_flags = flags;
            }
        }
        Command::ScaleIndex { scale } => {
            let value = vm.stack.pop().expect("index");
            vm.stack.push(value.wrapping_mul(u64::from(scale)));
        }
        Command::SignExtend { from, to } => {
            let value = vm.stack.pop().expect("extend");
            let bits = from.bits();
            let shifted = ((value & from.mask()) as i64) << (64 - bits) >> (64 - bits);
            vm.stack.push((shifted as u64) & to.mask());
        }
        Command::ZeroExtend { from, to } => {
            let value = vm.stack.pop().expect("extend");
            vm.stack.push(value & from.mask() & to.mask());
        }
        Command::FlagsUpdate { defined, .. } => {
            let mask = defined.bits();
            state.rflags = (state.rflags & !mask) | (vm.scratch_flags & mask);
        }
        Command::ContextLoad { slot } => {
            let value = match slot {
                CtxSlot::Rflags => state.rflags,
                CtxSlot::ScratchFlags => vm.scratch_flags,
                CtxSlot::Spill(n) => vm.spill[n as usize],
            };
            vm.stack.push(value);
        }
        Command::ContextStore { slot } => {
            let value = vm.stack.pop().expect("context store");
            match slot {
                CtxSlot::Rflags => state.rflags = value,
                CtxSlot::ScratchFlags => vm.scratch_flags = value,
                CtxSlot::Spill(n) => vm.spill[n as usize] = value,
            }
        }
        Command::HandlerCall { .. } => {
            panic!("handler calls are a lowering artifact, not lifter output")
        }
    }
}

/// Independent model of the arithmetic flags.
pub fn alu(op: BinaryOp, lhs: u64, rhs: u64, width: OpWidth) -> (u64, u64) {
    let bits = u32::from(width.bits());
    let mask = width.mask();
    let sign = 1u64 << (bits - 1);
    let a = lhs & mask;
    let b = rhs & mask;

    let (result, cf, of, af) = match op {
        BinaryOp::Add => {
            let wide = u128::from(a) + u128::from(b);
            let r = (wide as u64) & mask;
            let cf = wide >> bits != 0;
            let of = (a ^ r) & (b ^ r) & sign != 0;
            let af = (a ^ b ^ r) & 0x10 != 0;
            (r, cf, of, af)
        }
        BinaryOp::Sub => {
            let r = a.wrapping_sub(b) & mask;
            let cf = a < b;
            let of = (a ^ b) & (a ^ r) & sign != 0;
            let af = (a ^ b ^ r) & 0x10 != 0;
            (r, cf, of, af)
        }
        BinaryOp::And => (a & b, false, false, false),
        BinaryOp::Or => (a | b, false, false, false),
        BinaryOp::Xor => (a ^ b, false, false, false),
    };

    let mut flags = 0u64;
    if cf {
        flags |= CF;
    }
    if (result & 0xff).count_ones() % 2 == 0 {
        flags |= PF;
    }
    if af {
        flags |= AF;
    }
    if result == 0 {
        flags |= ZF;
    }
    if result & sign != 0 {
        flags |= SF;
    }
    if of {
        flags |= OF;
    }
    (result, flags)
}

pub fn eval_cond(cond: VmCond, flags: u64) -> bool {
    let cf = flags & CF != 0;
    let pf = flags & PF != 0;
    let zf = flags & ZF != 0;
    let sf = flags & SF != 0;
    let of = flags & OF != 0;
    match cond {
        VmCond::O => of,
        VmCond::No => !of,
        VmCond::B => cf,
        VmCond::Ae => !cf,
        VmCond::E => zf,
        VmCond::Ne => !zf,
        VmCond::Be => cf || zf,
        VmCond::A => !(cf || zf),
        VmCond::S => sf,
        VmCond::Ns => !sf,
        VmCond::P => pf,
        VmCond::Np => !pf,
        VmCond::L => sf != of,
        VmCond::Ge => sf == of,
        VmCond::Le => zf || (sf != of),
        VmCond::G => !zf && sf == of,
    }
}
