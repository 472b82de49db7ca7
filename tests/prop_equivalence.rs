//! Randomized lift equivalence.
//!
//! Generates random instruction sequences from the supported subset,
//! encodes them, lifts the bytes, and checks that interpreting the IR
//! matches a direct per-instruction architectural model. rsp and rip are
//! excluded from the comparison, matching the VM's documented divergence.

mod common;

use common::{alu, block_at, lift_bytes, run, GuestState};
use iced_x86::{Code, Encoder, Instruction};
use proptest::prelude::*;
use talonvirt::codec::{Gpr, OpWidth};
use talonvirt::ir::BinaryOp;

const STATUS: u64 = 0x8d5;
const ARITH: u64 = 0x8d5;
// logic ops leave AF architecturally undefined; both sides keep the old bit
const LOGIC: u64 = 0x8c5;
// inc/dec leave CF untouched
const STEP: u64 = 0x8d4;

#[derive(Copy, Clone, Debug)]
enum OpKind {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
    Inc,
    Dec,
    MovImm,
}

#[derive(Copy, Clone, Debug)]
struct TestInst {
    op: OpKind,
    dst: Gpr,
    src: Gpr,
    imm: u64,
}

fn safe_gprs() -> Vec<Gpr> {
    Gpr::ALL.into_iter().filter(|&g| g != Gpr::Rsp).collect()
}

fn inst_strategy() -> impl Strategy<Value = TestInst> {
    let op = prop::sample::select(vec![
        OpKind::Add,
        OpKind::Sub,
        OpKind::And,
        OpKind::Or,
        OpKind::Xor,
        OpKind::Cmp,
        OpKind::Inc,
        OpKind::Dec,
        OpKind::MovImm,
    ]);
    (
        op,
        prop::sample::select(safe_gprs()),
        prop::sample::select(safe_gprs()),
        any::<u64>(),
    )
        .prop_map(|(op, dst, src, imm)| TestInst { op, dst, src, imm })
}

fn encode(insts: &[TestInst]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for inst in insts {
        let dst = inst.dst.to_raw(OpWidth::Qword);
        let src = inst.src.to_raw(OpWidth::Qword);
        let raw = match inst.op {
            OpKind::Add => Instruction::with2(Code::Add_r64_rm64, dst, src),
            OpKind::Sub => Instruction::with2(Code::Sub_r64_rm64, dst, src),
            OpKind::And => Instruction::with2(Code::And_r64_rm64, dst, src),
            OpKind::Or => Instruction::with2(Code::Or_r64_rm64, dst, src),
            OpKind::Xor => Instruction::with2(Code::Xor_r64_rm64, dst, src),
            OpKind::Cmp => Instruction::with2(Code::Cmp_r64_rm64, dst, src),
            OpKind::Inc => Instruction::with1(Code::Inc_rm64, dst),
            OpKind::Dec => Instruction::with1(Code::Dec_rm64, dst),
            OpKind::MovImm => Instruction::with2(Code::Mov_r64_imm64, dst, inst.imm),
        }
        .expect("constructible instruction");
        let mut encoder = Encoder::new(64);
        encoder
            .encode(&raw, bytes.len() as u64)
            .expect("encodable instruction");
        bytes.extend(encoder.take_buffer());
    }
    bytes
}

/// Direct architectural execution, no IR involved.
fn model(insts: &[TestInst], state: &mut GuestState) {
    for inst in insts {
        let dst = state.get(inst.dst);
        let src = state.get(inst.src);
        let merge = |state: &mut GuestState, flags: u64, mask: u64| {
            state.rflags = (state.rflags & !mask) | (flags & mask);
        };
        match inst.op {
            OpKind::Add => {
                let (r, f) = alu(BinaryOp::Add, dst, src, OpWidth::Qword);
                state.set(inst.dst, r);
                merge(state, f, ARITH);
            }
            OpKind::Sub => {
                let (r, f) = alu(BinaryOp::Sub, dst, src, OpWidth::Qword);
                state.set(inst.dst, r);
                merge(state, f, ARITH);
            }
            OpKind::And => {
                let (r, f) = alu(BinaryOp::And, dst, src, OpWidth::Qword);
                state.set(inst.dst, r);
                merge(state, f, LOGIC);
            }
            OpKind::Or => {
                let (r, f) = alu(BinaryOp::Or, dst, src, OpWidth::Qword);
                state.set(inst.dst, r);
                merge(state, f, LOGIC);
            }
            OpKind::Xor => {
                let (r, f) = alu(BinaryOp::Xor, dst, src, OpWidth::Qword);
                state.set(inst.dst, r);
                merge(state, f, LOGIC);
            }
            OpKind::Cmp => {
                let (_, f) = alu(BinaryOp::Sub, dst, src, OpWidth::Qword);
                merge(state, f, ARITH);
            }
            OpKind::Inc => {
                let (r, f) = alu(BinaryOp::Add, dst, 1, OpWidth::Qword);
                state.set(inst.dst, r);
                merge(state, f, STEP);
            }
            OpKind::Dec => {
                let (r, f) = alu(BinaryOp::Sub, dst, 1, OpWidth::Qword);
                state.set(inst.dst, r);
                merge(state, f, STEP);
            }
            OpKind::MovImm => {
                state.set(inst.dst, inst.imm);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]
    #[test]
    fn lifted_ir_matches_the_architectural_model(
        insts in prop::collection::vec(inst_strategy(), 1..12),
        regs: [u64; 16],
        seed_flags: u64,
    ) {
        let bytes = encode(&insts);

        let mut expected = GuestState::default();
        expected.regs = regs;
        expected.rflags = seed_flags & STATUS;
        let mut actual = expected.clone();

        model(&insts, &mut expected);

        let (arena, preopt, root) = lift_bytes(&bytes);
        let exit = run(&arena, block_at(&preopt, root), &mut actual);
        prop_assert_eq!(exit, bytes.len() as u64);

        for gpr in safe_gprs() {
            prop_assert_eq!(
                actual.get(gpr),
                expected.get(gpr),
                "register {} diverged",
                gpr
            );
        }
        prop_assert_eq!(actual.rflags & STATUS, expected.rflags & STATUS);
    }
}
