//! The assembled machine: CPU, bus, devices, run loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpu_pdp11::{InterruptQueue, Pdp11};
use format_bic::BicFile;
use thiserror::Error;
use tracing::info;

use crate::boot;
use crate::bus::SystemBus;
use crate::config::MachineConfig;
use crate::console::Console;
use crate::disk::{DiskBackend, FileBackend};
use crate::memory::Memory;
use crate::rk05::Rk05;
use crate::rl02::Rl02;
use crate::tty::Tty;

/// How often the run loop polls the console for input.
const TTY_POLL_INTERVAL: u64 = 1024;

/// Machine assembly failures.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("cannot open disk image {0}")]
    DiskImage(PathBuf),
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The program executed a kernel-mode HALT.
    Halted,
    /// The terminate flag was raised.
    Terminated,
    /// The pause flag was raised (debugger attach point).
    Paused,
}

/// A complete PDP-11/70.
pub struct Pdp1170 {
    pub cpu: Pdp11,
    pub bus: SystemBus,
}

impl Pdp1170 {
    /// Assemble a machine from a configuration and a console front-end.
    ///
    /// Disk images open according to the snapshot flag; attaching any
    /// RK05 image installs the bootstrap and points the PC at it.
    pub fn new(config: &MachineConfig, console: Box<dyn Console>) -> Result<Self, MachineError> {
        let interrupts = InterruptQueue::new();
        let disk_read = console.disk_read_activity();
        let disk_write = console.disk_write_activity();

        let tty = Tty::new(console, interrupts.clone());
        let mut bus = SystemBus::new(Memory::new(config.memory_pages), tty);

        if !config.rk05_images.is_empty() {
            let mut rk05 = Rk05::new(interrupts.clone(), disk_read.clone(), disk_write.clone());
            for path in &config.rk05_images {
                let mut backend = FileBackend::new(path);
                if !backend.begin(config.snapshots) {
                    return Err(MachineError::DiskImage(path.clone()));
                }
                rk05.attach_drive(Box::new(backend));
            }
            bus.attach_rk05(rk05);
        }

        if !config.rl02_images.is_empty() {
            let mut rl02 = Rl02::new(interrupts.clone(), disk_read, disk_write);
            for path in &config.rl02_images {
                let mut backend = FileBackend::new(path);
                if !backend.begin(config.snapshots) {
                    return Err(MachineError::DiskImage(path.clone()));
                }
                rl02.attach_drive(Box::new(backend));
            }
            bus.attach_rl02(rl02);
        }

        let mut cpu = Pdp11::new(interrupts);
        if bus.rk05.is_some() {
            cpu.regs.pc = boot::install_rk05_bootstrap(&mut bus.memory);
        }
        if let Some(start) = config.start_address {
            cpu.regs.pc = start;
        }

        info!("machine assembled, start pc {:o}", cpu.regs.pc);
        Ok(Self { cpu, bus })
    }

    /// Attach an extra RK05 drive on a custom backend.
    pub fn attach_rk05_drive(&mut self, backend: Box<dyn DiskBackend>) {
        let interrupts = self.cpu.interrupts();
        let rk05 = self.bus.rk05.get_or_insert_with(|| {
            Rk05::new(
                interrupts,
                Arc::new(AtomicBool::new(false)),
                Arc::new(AtomicBool::new(false)),
            )
        });
        rk05.attach_drive(backend);
    }

    /// Execute one instruction (or interrupt dispatch) and keep the
    /// console input flowing.
    pub fn step(&mut self) {
        self.cpu.step(&mut self.bus);
        if self.cpu.is_waiting() || self.cpu.instruction_count() % TTY_POLL_INTERVAL == 0 {
            self.bus.tty.poll_input();
        }
    }

    /// Run until HALT or until a control flag is raised. Both flags are
    /// observed at instruction boundaries only; no instruction is ever
    /// interrupted halfway.
    pub fn run(&mut self, terminate: &AtomicBool, pause: &AtomicBool) -> RunOutcome {
        loop {
            if terminate.load(Ordering::Relaxed) {
                return RunOutcome::Terminated;
            }
            if pause.swap(false, Ordering::Relaxed) {
                return RunOutcome::Paused;
            }
            self.step();
            if self.cpu.is_halted() {
                return RunOutcome::Halted;
            }
        }
    }

    /// Load an absolute loader tape; the PC follows the tape's start
    /// address when it carries one.
    pub fn load_tape(&mut self, tape: &BicFile) {
        if let Some(start) = boot::load_tape(&mut self.bus.memory, tape) {
            self.cpu.regs.pc = start;
        }
    }

    /// Load raw bytes at an address without touching the PC.
    pub fn load_image(&mut self, addr: u16, data: &[u8]) {
        boot::load_image(&mut self.bus.memory, addr, data);
    }

    /// Console reset: CPU state, devices, MMU.
    pub fn reset(&mut self) {
        self.cpu.reset();
        cpu_pdp11::Pdp11Bus::reset(&mut self.bus, &mut self.cpu.regs);
        self.bus.memory.reset();
        self.bus.mmu.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::{ChannelConsole, OutputBuffer};

    fn machine() -> Pdp1170 {
        let (console, _tx) = ChannelConsole::new(Box::new(OutputBuffer::new()));
        let config = MachineConfig::default();
        Pdp1170::new(&config, Box::new(console)).expect("assemble")
    }

    #[test]
    fn runs_until_halt() {
        let mut machine = machine();
        machine.load_image(0o1000, &[0o240 & 0xff, (0o240_u16 >> 8) as u8 /* NOP */, 0, 0]);
        machine.cpu.regs.pc = 0o1000;
        machine.cpu.regs.set(6, 0o1000);

        let outcome = machine.run(&AtomicBool::new(false), &AtomicBool::new(false));
        assert_eq!(outcome, RunOutcome::Halted);
    }

    #[test]
    fn terminate_flag_stops_the_loop() {
        let mut machine = machine();
        // BR . spins forever
        machine.load_image(0o1000, &[0o377, 0o001]);
        machine.cpu.regs.pc = 0o1000;

        let terminate = AtomicBool::new(true);
        let outcome = machine.run(&terminate, &AtomicBool::new(false));
        assert_eq!(outcome, RunOutcome::Terminated);
    }

    #[test]
    fn pause_flag_returns_and_clears() {
        let mut machine = machine();
        machine.load_image(0o1000, &[0o377, 0o001]);
        machine.cpu.regs.pc = 0o1000;

        let pause = AtomicBool::new(true);
        let outcome = machine.run(&AtomicBool::new(false), &pause);
        assert_eq!(outcome, RunOutcome::Paused);
        assert!(!pause.load(Ordering::Relaxed));
    }

    #[test]
    fn tape_start_address_sets_pc() {
        let mut machine = machine();
        let tape = BicFile {
            records: vec![format_bic::LoadRecord {
                addr: 0o2000,
                data: vec![0, 0],
            }],
            start: Some(0o2000),
        };
        machine.load_tape(&tape);
        assert_eq!(machine.cpu.regs.pc, 0o2000);
    }
}
