//! Whole-pipeline tests: bytes in, compiled section out.

use talonvirt::{MachineSettings, VirtError, Virtualizer};

const ADD_RAX_RBX: [u8; 3] = [0x48, 0x01, 0xd8];

fn virtualizer(seed: u64) -> Virtualizer {
    let _ = env_logger::builder().is_test(true).try_init();
    Virtualizer::new(MachineSettings::default().with_seed(seed))
}

#[test]
fn produces_a_section_with_an_entry_symbol() {
    let section = virtualizer(1)
        .virtualize(&ADD_RAX_RBX, 0, 0x1000)
        .unwrap();
    assert!(!section.bytes.is_empty());

    let (name, va) = &section.symbols[0];
    assert_eq!(name, "entry");
    assert!(*va >= 0x1000);
    assert!(*va < 0x1000 + section.bytes.len() as u64);
}

#[test]
fn fixed_seed_is_byte_identical() {
    let a = virtualizer(0xfeed)
        .virtualize(&ADD_RAX_RBX, 0, 0x1000)
        .unwrap();
    let b = virtualizer(0xfeed)
        .virtualize(&ADD_RAX_RBX, 0, 0x1000)
        .unwrap();
    assert_eq!(a.bytes, b.bytes);
    assert_eq!(a.symbols, b.symbols);
    assert_eq!(a.relocs, b.relocs);
}

#[test]
fn different_seeds_give_different_schedules() {
    let a = virtualizer(1).virtualize(&ADD_RAX_RBX, 0, 0x1000).unwrap();
    let b = virtualizer(2).virtualize(&ADD_RAX_RBX, 0, 0x1000).unwrap();
    assert_ne!(a.bytes, b.bytes);
}

#[test]
fn absolute_references_are_relocated() {
    let section = virtualizer(3)
        .virtualize(&ADD_RAX_RBX, 0, 0x40_0000)
        .unwrap();
    // the VM frame pointers and image base at minimum
    assert!(!section.relocs.is_empty());
    for reloc in &section.relocs {
        assert_eq!(reloc.width, 8);
        assert!((reloc.site_offset as usize + 8) <= section.bytes.len());
        let field = u64::from_le_bytes(
            section.bytes[reloc.site_offset as usize..reloc.site_offset as usize + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(field, reloc.target);
    }
}

#[test]
fn empty_input_compiles_to_an_empty_section() {
    let section = virtualizer(4).virtualize(&[], 0, 0x1000).unwrap();
    assert!(section.bytes.is_empty());
    assert!(section.symbols.is_empty());
    assert!(section.relocs.is_empty());
}

#[test]
fn conditional_control_flow_compiles() {
    // cmp rax, rbx / jne +3 / inc rax / inc rbx
    let code = [
        0x48, 0x39, 0xd8, 0x75, 0x03, 0x48, 0xff, 0xc0, 0x48, 0xff, 0xc3,
    ];
    let section = virtualizer(5).virtualize(&code, 0, 0x1000).unwrap();
    assert!(!section.bytes.is_empty());
}

#[test]
fn self_loop_compiles() {
    // inc rax / jmp self
    let code = [0x48, 0xff, 0xc0, 0xeb, 0xfb];
    let section = virtualizer(6).virtualize(&code, 0, 0x1000).unwrap();
    assert!(!section.bytes.is_empty());
}

#[test]
fn shuffled_containers_still_compile() {
    let settings = MachineSettings::default()
        .with_seed(7)
        .with_shuffled_containers(true);
    let section = Virtualizer::new(settings)
        .virtualize(&ADD_RAX_RBX, 0, 0x1000)
        .unwrap();
    assert!(!section.bytes.is_empty());
    assert_eq!(section.symbols[0].0, "entry");
}

#[test]
fn unsupported_instruction_aborts_with_rva() {
    // nop / mul rbx
    let code = [0x90, 0x48, 0xf7, 0xe3];
    let err = virtualizer(8).virtualize(&code, 0, 0x1000).unwrap_err();
    match err {
        VirtError::UnsupportedInstruction { rva, .. } => assert_eq!(rva, 1),
        other => panic!("expected unsupported instruction, got {other}"),
    }
}

#[test]
fn undecodable_input_aborts() {
    let err = virtualizer(9).virtualize(&[0x06], 0x500, 0x1000).unwrap_err();
    assert!(matches!(err, VirtError::Decode(0x500)));
}

#[test]
fn ret_terminated_input_compiles() {
    // add rax, rbx / ret
    let code = [0x48, 0x01, 0xd8, 0xc3];
    let section = virtualizer(10).virtualize(&code, 0, 0x1000).unwrap();
    assert!(!section.bytes.is_empty());
}

#[test]
fn entry_points_at_executable_code() {
    let section = virtualizer(11)
        .virtualize(&ADD_RAX_RBX, 0, 0x1000)
        .unwrap();
    let (_, va) = &section.symbols[0];
    let offset = (*va - 0x1000) as usize;
    // the entry block begins by calling the VM entry handler; rel32 call
    // and movabs prologues both start with a non-zero byte
    assert_ne!(section.bytes[offset], 0);
}
