mod asm;

use asm::*;

const EPC: u8 = 14;

/// Returns past the faulting instruction
fn skip_handler() -> Vec<u32> {
    vec![mfc0(K0, EPC), addiu(K0, K0, 4), mtc0(K0, EPC), eret(), nop()]
}

#[test]
fn syscall_round_trip() {
    let main = program([vec![addiu(T0, ZERO, 1), syscall(), addiu(T0, ZERO, 2)], halt().to_vec()]);
    let mut core = Machine::new()
        .code(0x180, &skip_handler())
        .code(0x1000, &main)
        .boot(0x8000_1000);
    core.run(100).unwrap();

    let state = core.state();
    assert_eq!(state.regs.read64(T0), 2);
    assert_eq!(state.cop0.cause.exc_code(), 8);
    assert!(!state.cop0.cause.bd());
    assert_eq!(state.cop0.epc, 0x8000_1008);
    assert_eq!(state.regs.read64(K0), 0xffff_ffff_8000_1008);
    assert!(!state.cop0.status.exl());
    assert_eq!(state.pc, 0x8000_100c);
}

#[test]
fn overflow_leaves_destination_alone() {
    let main = program([
        vec![lui(T0, 0x7fff), ori(T0, T0, 0xffff), addiu(T1, ZERO, 9), add(T1, T0, T0), addiu(T2, ZERO, 1)],
        halt().to_vec(),
    ]);
    let mut core = Machine::new()
        .code(0x180, &halt())
        .code(0x1000, &main)
        .boot(0x8000_1000);
    core.run(100).unwrap();

    let state = core.state();
    assert_eq!(state.regs.read64(T1), 9);
    assert_eq!(state.regs.read64(T2), 0);
    assert_eq!(state.cop0.cause.exc_code(), 12);
    assert_eq!(state.cop0.epc, 0x8000_100c);
    assert_eq!(state.pc, 0x8000_0180);
    assert!(state.cop0.status.exl());
}

#[test]
fn fault_in_delay_slot_points_at_branch() {
    let main = vec![lui(T0, 0x8000), beq(ZERO, ZERO, 4), lw(T1, 1, T0), nop()];
    let mut core = Machine::new()
        .code(0x180, &halt())
        .code(0x1000, &main)
        .boot(0x8000_1000);
    core.run(100).unwrap();

    let state = core.state();
    assert_eq!(state.cop0.cause.exc_code(), 4);
    assert!(state.cop0.cause.bd());
    assert_eq!(state.cop0.epc, 0x8000_1004);
    assert_eq!(state.cop0.bad_vaddr, 0x8000_0001);
    assert_eq!(state.pc, 0x8000_0180);
}

#[test]
fn unmapped_fetch_takes_refill_vector() {
    let main = vec![lui(T0, 0x0040), jr(T0), nop()];
    let mut core = Machine::new()
        .code(0x0, &halt())
        .code(0x1000, &main)
        .boot(0x8000_1000);
    core.run(100).unwrap();

    let state = core.state();
    assert_eq!(state.cop0.cause.exc_code(), 2);
    assert_eq!(state.cop0.bad_vaddr, 0x0040_0000);
    assert_eq!(state.cop0.epc, 0x0040_0000);
    assert_eq!(state.cop0.entry_hi.vpn2(), 0x0040_0000 >> 13);
    assert_eq!(state.pc, 0x8000_0000);
    assert_eq!(core.stats().fetch_exceptions, 1);
}

#[test]
fn faulting_quad_load_keeps_pending_value() {
    // t0 is only held in a host register when the LQ through unmapped t1 faults
    let main = program([vec![addiu(T0, ZERO, 0x55), lq(T0, 0, T1)], halt().to_vec()]);
    let mut core = Machine::new()
        .code(0x0, &halt())
        .code(0x1000, &main)
        .boot(0x8000_1000);
    core.run(100).unwrap();

    let state = core.state();
    assert_eq!(state.cop0.cause.exc_code(), 2);
    assert_eq!(state.cop0.epc, 0x8000_1004);
    assert_eq!(state.pc, 0x8000_0000);
    assert_eq!(state.regs.read64(T0), 0x55);
}

#[test]
fn reserved_instruction() {
    let main = vec![addiu(T0, ZERO, 1), 0x4c00_0000, addiu(T0, ZERO, 2)];
    let mut core = Machine::new()
        .code(0x180, &halt())
        .code(0x1000, &main)
        .boot(0x8000_1000);
    core.run(100).unwrap();

    let state = core.state();
    assert_eq!(state.cop0.cause.exc_code(), 10);
    assert_eq!(state.cop0.epc, 0x8000_1004);
    assert_eq!(state.regs.read64(T0), 1);
}

#[test]
fn leaf_collaborator_gets_the_word() {
    use r5900::coprocessor0::Exception;
    use r5900::memory::LeafOps;
    use r5900::regfile::RegFile;

    /// Treats every leaf opcode as "t5 = word"
    struct Recorder;
    impl LeafOps for Recorder {
        fn execute(&mut self, word: u32, regs: &mut RegFile) -> Result<(), Exception> {
            regs.write64(T5, word as u64);
            Ok(())
        }
    }

    // An MMI opcode between two ordinary instructions
    let main = program([vec![addiu(T0, ZERO, 3), 0x7000_0008, addu(T1, T0, T5)], halt().to_vec()]);
    let mut core = Machine::new().code(0x1000, &main).boot(0x8000_1000);
    core.set_leaf_ops(Box::new(Recorder));
    core.run(100).unwrap();

    assert_eq!(core.state().regs.read64(T5), 0x7000_0008);
    assert_eq!(core.state().regs.read64(T1), 0x7000_000b);
}
