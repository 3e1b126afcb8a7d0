//! Whole-machine tests: programs running through CPU, MMU, bus and
//! devices together.

use std::sync::atomic::AtomicBool;

use cpu_pdp11::{Access, Pdp11Bus, Space};
use emu_pdp1170::{
    ChannelConsole, DiskBackend, MachineConfig, OutputBuffer, Pdp1170, RamBackend, RunOutcome,
};
use format_bic::{BicFile, LoadRecord};

fn machine() -> (Pdp1170, std::sync::mpsc::SyncSender<u8>, OutputBuffer) {
    let buffer = OutputBuffer::new();
    let (console, tx) = ChannelConsole::new(Box::new(buffer.clone()));
    let machine =
        Pdp1170::new(&MachineConfig::default(), Box::new(console)).expect("assemble");
    (machine, tx, buffer)
}

/// Step until HALT, with a generous bound so a broken program cannot
/// hang the test suite.
fn run_to_halt(machine: &mut Pdp1170) {
    for _ in 0..100_000 {
        machine.step();
        if machine.cpu.is_halted() {
            return;
        }
    }
    panic!("program never halted, pc {:o}", machine.cpu.regs.pc);
}

fn load_words(machine: &mut Pdp1170, addr: u32, words: &[u16]) {
    for (i, &word) in words.iter().enumerate() {
        machine.bus.memory.write_word(addr + (i as u32) * 2, word);
    }
}

#[test]
fn mov_immediate_program() {
    let (mut machine, _tx, _out) = machine();
    load_words(&mut machine, 0o1000, &[0o012700, 0o123456, 0o000000]);
    machine.cpu.regs.pc = 0o1000;
    machine.cpu.regs.set(6, 0o1000);
    run_to_halt(&mut machine);

    assert_eq!(machine.cpu.regs.get(0), 0o123456);
    assert!(machine.cpu.regs.n());
    assert!(!machine.cpu.regs.z());
    assert!(!machine.cpu.regs.v());
}

#[test]
fn mmu_maps_kernel_page_through_io_registers() {
    let (mut machine, _tx, _out) = machine();
    machine.bus.memory.write_word(0o400100, 0o31415);

    let (bus, regs) = (&mut machine.bus, &mut machine.cpu.regs);
    // Kernel I PAR[0] = 0o4000 clicks, PDR[0] full length read/write
    bus.write(regs, 0o172340, 0o4000, Access::word(Space::D))
        .expect("PAR");
    bus.write(regs, 0o172300, 0o77406, Access::word(Space::D))
        .expect("PDR");
    bus.write(regs, 0o177572, 1, Access::word(Space::D))
        .expect("MMR0 enable");

    let value = bus
        .read(regs, 0o100, Access::word(Space::I))
        .expect("mapped read");
    assert_eq!(value, 0o31415);
}

#[test]
fn odd_address_word_read_traps_with_codes_preserved() {
    let (mut machine, _tx, _out) = machine();
    load_words(&mut machine, 0o4, &[0o4000, 0o340]); // trap vector 004
    load_words(&mut machine, 0o1000, &[0o013700, 0o001001]); // MOV @#1001, R0
    machine.cpu.regs.pc = 0o1000;
    machine.cpu.regs.set(6, 0o1000);
    machine.cpu.regs.set_c(true);
    machine.cpu.regs.set_z(true);

    machine.step();

    assert_eq!(machine.cpu.regs.pc, 0o4000);
    // PSW pushed on the kernel stack, condition codes unchanged
    let pushed_psw = machine.bus.memory.read_word(0o776);
    assert_eq!(pushed_psw & 0o17, 0o5);
}

#[test]
fn tty_input_interrupt_delivers_character() {
    let (mut machine, tx, _out) = machine();
    load_words(&mut machine, 0o60, &[0o2000, 0o340]); // reader vector
    // MOV #100, @#177560 (enable reader interrupts); WAIT
    load_words(
        &mut machine,
        0o1000,
        &[0o012737, 0o000100, 0o177560, 0o000001],
    );
    // handler: MOVB @#177562, R0; HALT
    load_words(&mut machine, 0o2000, &[0o113700, 0o177562, 0o000000]);
    machine.cpu.regs.pc = 0o1000;
    machine.cpu.regs.set(6, 0o1000);
    machine.cpu.regs.set_spl(0);

    tx.send(b'A').expect("send");
    run_to_halt(&mut machine);

    assert_eq!(machine.cpu.regs.get(0), u16::from(b'A'));
}

#[test]
fn tty_output_reaches_console() {
    let (mut machine, _tx, out) = machine();
    // MOVB #110, @#177566 ("H"); MOVB #151, @#177566 ("i"); HALT
    load_words(
        &mut machine,
        0o1000,
        &[
            0o112737, 0o000110, 0o177566, //
            0o112737, 0o000151, 0o177566, //
            0o000000,
        ],
    );
    machine.cpu.regs.pc = 0o1000;
    machine.cpu.regs.set(6, 0o1000);
    run_to_halt(&mut machine);

    assert_eq!(out.contents(), b"Hi");
}

#[test]
fn interrupt_dispatched_within_one_step() {
    let (mut machine, _tx, _out) = machine();
    load_words(&mut machine, 0o220, &[0o3000, 0o240]); // RK05 vector
    load_words(&mut machine, 0o1000, &[0o000240]); // NOP
    machine.cpu.regs.pc = 0o1000;
    machine.cpu.regs.set(6, 0o1000);
    machine.cpu.regs.set_spl(0);

    machine.cpu.interrupts().queue(5, 0o220);
    machine.step();

    assert_eq!(machine.cpu.regs.pc, 0o3000);
    assert_eq!(machine.cpu.regs.psw() & 0o340, 0o240);
}

#[test]
fn absolute_loader_round_trip_into_memory() {
    let (mut machine, _tx, _out) = machine();
    let payload: Vec<u8> = (0u8..64).map(|i| i.wrapping_mul(7)).collect();
    let tape = BicFile {
        records: vec![LoadRecord {
            addr: 0o6000,
            data: payload.clone(),
        }],
        start: Some(0o6000),
    };

    let encoded = tape.encode();
    let parsed = BicFile::parse(&encoded).expect("parse");
    machine.load_tape(&parsed);

    assert_eq!(machine.cpu.regs.pc, 0o6000);
    for (i, &byte) in payload.iter().enumerate() {
        assert_eq!(machine.bus.memory.read_byte(0o6000 + i as u32), byte);
    }
}

#[test]
fn rk05_bootstrap_loads_and_runs_sector_zero() {
    let (mut machine, _tx, _out) = machine();

    // Sector 0 holds a tiny program: MOV #123, R0; HALT
    let mut image = vec![0u8; 64 * 512];
    let program: [u16; 3] = [0o012700, 0o000123, 0o000000];
    for (i, &word) in program.iter().enumerate() {
        image[i * 2] = word as u8;
        image[i * 2 + 1] = (word >> 8) as u8;
    }
    let mut backend = RamBackend::with_data(image);
    assert!(backend.begin(false));
    machine.attach_rk05_drive(Box::new(backend));

    machine.cpu.regs.pc =
        emu_pdp1170::boot::install_rk05_bootstrap(&mut machine.bus.memory);
    machine.cpu.regs.set(6, 0o2000);
    run_to_halt(&mut machine);

    assert_eq!(machine.cpu.regs.get(0), 0o123);
    assert_eq!(machine.cpu.regs.pc, 0o6); // HALT fetched from address 4
}

#[test]
fn rk05_write_read_round_trip_through_the_bus() {
    let (mut machine, _tx, _out) = machine();
    let mut backend = RamBackend::new(1 << 20);
    assert!(backend.begin(false));
    machine.attach_rk05_drive(Box::new(backend));

    for i in 0..256u32 {
        machine.bus.memory.write_word(0o10000 + i * 2, (i ^ 0o125) as u16);
    }

    let (bus, regs) = (&mut machine.bus, &mut machine.cpu.regs);
    let word = Access::word(Space::D);
    // write function: DA sector 2, WC -256, BA 10000, GO
    bus.write(regs, 0o177412, 2, word).expect("DA");
    bus.write(regs, 0o177406, (!256u16).wrapping_add(1), word)
        .expect("WC");
    bus.write(regs, 0o177410, 0o10000, word).expect("BA");
    bus.write(regs, 0o177404, (1 << 1) | 1, word).expect("CS go");

    // read it back to 0o30000
    bus.write(regs, 0o177412, 2, word).expect("DA");
    bus.write(regs, 0o177406, (!256u16).wrapping_add(1), word)
        .expect("WC");
    bus.write(regs, 0o177410, 0o30000, word).expect("BA");
    bus.write(regs, 0o177404, (2 << 1) | 1, word).expect("CS go");

    for i in 0..256u32 {
        assert_eq!(
            machine.bus.memory.read_word(0o30000 + i * 2),
            (i ^ 0o125) as u16
        );
    }
}

#[test]
fn halt_stops_run_loop() {
    let (mut machine, _tx, _out) = machine();
    load_words(&mut machine, 0o1000, &[0o000000]);
    machine.cpu.regs.pc = 0o1000;
    let outcome = machine.run(&AtomicBool::new(false), &AtomicBool::new(false));
    assert_eq!(outcome, RunOutcome::Halted);
}
