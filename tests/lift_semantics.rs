//! Lift-then-interpret semantics checks.
//!
//! Each scenario lifts a snippet, executes the IR against the architectural
//! model, and checks guest-visible register and flag effects.

mod common;

use common::{block_at, lift_bytes, run, GuestState, CF, OF, SF, ZF};
use talonvirt::codec::Gpr;
use talonvirt::ir::IrBlockRef;
use talonvirt::opt;

fn run_snippet(bytes: &[u8], state: &mut GuestState) -> u64 {
    let (arena, preopt, root) = lift_bytes(bytes);
    run(&arena, block_at(&preopt, root), state)
}

/// Same snippets, but through the optimizer first.
fn run_snippet_optimized(bytes: &[u8], state: &mut GuestState) -> u64 {
    let (mut arena, preopt, root) = lift_bytes(bytes);
    let assignments: Vec<(IrBlockRef, u32)> = preopt
        .iter()
        .enumerate()
        .map(|(i, p)| (p.block, i as u32))
        .collect();
    let entry = block_at(&preopt, root);
    let result = opt::optimize(&mut arena, &assignments, entry).expect("optimize");
    run(&arena, result.tracker[&entry], state)
}

#[test]
fn add_reg_reg() {
    let mut state = GuestState::default();
    state.set(Gpr::Rax, 0x1).set(Gpr::Rbx, 0x2);
    let exit = run_snippet(&[0x48, 0x01, 0xd8], &mut state); // add rax, rbx
    assert_eq!(exit, 3);
    assert_eq!(state.get(Gpr::Rax), 0x3);
    assert!(!state.flag(ZF));
    assert!(!state.flag(CF));
    assert!(!state.flag(OF));
    assert!(!state.flag(SF));
}

#[test]
fn inc_with_overflow_preserves_carry() {
    let mut state = GuestState::default();
    state.set(Gpr::Rax, 0x7fff_ffff_ffff_ffff);
    state.rflags = CF;
    run_snippet(&[0x48, 0xff, 0xc0], &mut state); // inc rax
    assert_eq!(state.get(Gpr::Rax), 0x8000_0000_0000_0000);
    assert!(state.flag(OF));
    assert!(state.flag(SF));
    assert!(!state.flag(ZF));
    // inc never touches CF
    assert!(state.flag(CF));
}

#[test]
fn mov_immediate_leaves_flags_alone() {
    let mut state = GuestState::default();
    state.rflags = CF | ZF;
    // mov rcx, 0xDEADBEEFCAFEBABE
    run_snippet(
        &[0x48, 0xb9, 0xbe, 0xba, 0xfe, 0xca, 0xef, 0xbe, 0xad, 0xde],
        &mut state,
    );
    assert_eq!(state.get(Gpr::Rcx), 0xdead_beef_cafe_babe);
    assert_eq!(state.rflags, CF | ZF);
}

#[test]
fn cmp_equal_sets_zero() {
    let mut state = GuestState::default();
    state.set(Gpr::Rax, 5).set(Gpr::Rbx, 5);
    run_snippet(&[0x48, 0x39, 0xd8], &mut state); // cmp rax, rbx
    assert!(state.flag(ZF));
    assert!(!state.flag(CF));
    assert!(!state.flag(SF));
    assert_eq!(state.get(Gpr::Rax), 5);
}

#[test]
fn sub_with_borrow() {
    let mut state = GuestState::default();
    state.set(Gpr::Rax, 0).set(Gpr::Rbx, 1);
    run_snippet(&[0x48, 0x29, 0xd8], &mut state); // sub rax, rbx
    assert_eq!(state.get(Gpr::Rax), u64::MAX);
    assert!(state.flag(CF));
    assert!(state.flag(SF));
}

#[test]
fn lea_address_math() {
    let mut state = GuestState::default();
    state.set(Gpr::Rax, 0x100).set(Gpr::Rbx, 0x10);
    state.rflags = OF;
    // lea rcx, [rax + rbx*2 + 4]
    run_snippet(&[0x48, 0x8d, 0x4c, 0x58, 0x04], &mut state);
    assert_eq!(state.get(Gpr::Rcx), 0x124);
    assert_eq!(state.rflags, OF);
}

#[test]
fn conditional_loop_runs_to_completion() {
    // add eax, 1 / cmp eax, 3 / jne loop
    let code = [
        0x83, 0xc0, 0x01, // add eax, 1
        0x83, 0xf8, 0x03, // cmp eax, 3
        0x75, 0xf8, // jne -8
    ];
    let mut state = GuestState::default();
    let exit = run_snippet(&code, &mut state);
    assert_eq!(exit, 8);
    assert_eq!(state.get(Gpr::Rax), 3);
    assert!(state.flag(ZF));
}

#[test]
fn memory_read_modify_write() {
    let mut state = GuestState::default();
    state.set(Gpr::Rax, 0x5000).set(Gpr::Rbx, 0x20);
    state.write_mem(0x5000, 0x10, talonvirt::codec::OpWidth::Qword);
    run_snippet(&[0x48, 0x01, 0x18], &mut state); // add [rax], rbx
    assert_eq!(
        state.read_mem(0x5000, talonvirt::codec::OpWidth::Qword),
        0x30
    );
}

#[test]
fn movsx_sign_extends() {
    let mut state = GuestState::default();
    state.set(Gpr::Rbx, 0x80);
    run_snippet(&[0x48, 0x0f, 0xbe, 0xc3], &mut state); // movsx rax, bl
    assert_eq!(state.get(Gpr::Rax), 0xffff_ffff_ffff_ff80);
}

#[test]
fn word_write_preserves_upper_bits() {
    let mut state = GuestState::default();
    state
        .set(Gpr::Rax, 0xaaaa_bbbb_cccc_0001)
        .set(Gpr::Rbx, 0x2);
    run_snippet(&[0x66, 0x01, 0xd8], &mut state); // add ax, bx
    assert_eq!(state.get(Gpr::Rax), 0xaaaa_bbbb_cccc_0003);
}

#[test]
fn dword_write_zero_extends() {
    let mut state = GuestState::default();
    state
        .set(Gpr::Rax, 0xaaaa_bbbb_0000_0001)
        .set(Gpr::Rbx, 0x2);
    run_snippet(&[0x01, 0xd8], &mut state); // add eax, ebx
    assert_eq!(state.get(Gpr::Rax), 0x3);
}

#[test]
fn optimized_ir_preserves_semantics() {
    let code = [
        0x48, 0x01, 0xd8, // add rax, rbx
        0x48, 0x39, 0xd8, // cmp rax, rbx
        0x75, 0x03, // jne +3
        0x48, 0xff, 0xc0, // inc rax
        0x48, 0xff, 0xc3, // inc rbx
    ];
    for (rax, rbx) in [(1u64, 2u64), (0, 0), (5, 5), (u64::MAX, 1)] {
        let mut plain = GuestState::default();
        plain.set(Gpr::Rax, rax).set(Gpr::Rbx, rbx);
        let mut optimized = plain.clone();

        let exit_a = run_snippet(&code, &mut plain);
        let exit_b = run_snippet_optimized(&code, &mut optimized);
        assert_eq!(exit_a, exit_b);
        assert_eq!(plain.regs, optimized.regs);
        assert_eq!(plain.rflags & 0x8d5, optimized.rflags & 0x8d5);
    }
}
