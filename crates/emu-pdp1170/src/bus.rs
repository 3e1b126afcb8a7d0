//! The UNIBUS: one front door for every CPU access.
//!
//! Addresses at and above 0o160000 select the I/O page: CPU registers
//! and PSW aliases, the MMU register windows, machine registers (PIR,
//! CPU error, console switches, clocks, system size) and the device
//! windows. Everything below translates through the MMU and lands in
//! physical memory. Unknown I/O addresses time out with trap 004; odd
//! word accesses trap likewise. Peek accesses produce no side effects
//! at all.

use cpu_pdp11::{
    Access, Mode, Pdp11Bus, Registers, Space, Trap, TrapCause, Width, cpu_error,
};
use tracing::{debug, trace};

use crate::memory::Memory;
use crate::mmu::Mmu;
use crate::rk05::{RK05_BASE, RK05_END, Rk05};
use crate::rl02::{RL02_BASE, RL02_END, Rl02};
use crate::tty::{TTY_BASE, TTY_END, Tty};

/// Start of the I/O page in the 16-bit virtual address space.
pub const IO_BASE: u16 = 0o160000;

// CPU register aliases (one register per address)
const ADDR_KERNEL_R: u16 = 0o177700;
const ADDR_KERNEL_SP: u16 = 0o177706;
const ADDR_PC: u16 = 0o177707;
const ADDR_USER_R: u16 = 0o177710;
const ADDR_SV_SP: u16 = 0o177716;
const ADDR_USER_SP: u16 = 0o177717;

// MMU register windows: 8 I-space then 8 D-space words per mode
const ADDR_PDR_SV_START: u16 = 0o172200;
const ADDR_PAR_SV_START: u16 = 0o172240;
const ADDR_PDR_K_START: u16 = 0o172300;
const ADDR_PAR_K_START: u16 = 0o172340;
const ADDR_PAR_K_END: u16 = 0o172400;
const ADDR_PDR_U_START: u16 = 0o177600;
const ADDR_PAR_U_START: u16 = 0o177640;
const ADDR_PAR_U_END: u16 = 0o177700;

const ADDR_MMR0: u16 = 0o177572;
const ADDR_MMR1: u16 = 0o177574;
const ADDR_MMR2: u16 = 0o177576;
const ADDR_MMR3: u16 = 0o172516;

const ADDR_LP11_CSR: u16 = 0o177514;
const ADDR_LFC: u16 = 0o177546;
const ADDR_CONSW: u16 = 0o177570;
const ADDR_KW11P: u16 = 0o172540;
const ADDR_SYSSIZE: u16 = 0o177760;
const ADDR_SYSTEM_ID: u16 = 0o177764;
const ADDR_CPU_ERR: u16 = 0o177766;
const ADDR_MICROPROG_BREAK: u16 = 0o177770;
const ADDR_PIR: u16 = 0o177772;
const ADDR_STACKLIM: u16 = 0o177774;
const ADDR_PSW: u16 = 0o177776;
const ADDR_MAINT: u16 = 0o177750;

/// The machine side of the [`Pdp11Bus`] seam.
pub struct SystemBus {
    pub memory: Memory,
    pub mmu: Mmu,
    pub tty: Tty,
    pub rk05: Option<Rk05>,
    pub rl02: Option<Rl02>,
    cpu_error: u16,
    pir: u16,
    lf_csr: u16,
    console_switches: u16,
    console_leds: u16,
    microprog_break: u16,
}

impl SystemBus {
    #[must_use]
    pub fn new(memory: Memory, tty: Tty) -> Self {
        Self {
            memory,
            mmu: Mmu::new(),
            tty,
            rk05: None,
            rl02: None,
            cpu_error: 0,
            pir: 0,
            lf_csr: 0,
            console_switches: 0,
            console_leds: 0,
            microprog_break: 0,
        }
    }

    pub fn attach_rk05(&mut self, rk05: Rk05) {
        self.rk05 = Some(rk05);
    }

    pub fn attach_rl02(&mut self, rl02: Rl02) {
        self.rl02 = Some(rl02);
    }

    /// Console switch register, as set from the front panel.
    pub fn set_console_switches(&mut self, value: u16) {
        self.console_switches = value;
    }

    /// Last value a program wrote to the LED display register.
    #[must_use]
    pub const fn console_leds(&self) -> u16 {
        self.console_leds
    }

    #[must_use]
    pub const fn cpu_error_register(&self) -> u16 {
        self.cpu_error
    }

    /// Line-frequency clock tick: sets the monitor bit in the LFC CSR.
    pub fn lfc_tick(&mut self) {
        self.lf_csr |= 0o200;
    }

    fn odd_trap(&mut self, va: u16, mode: Mode, is_data: bool, is_write: bool) -> Trap {
        self.mmu.note_odd_address(va);
        if is_write {
            self.mmu.note_aborted_write(mode, is_data, va);
        }
        self.cpu_error |= cpu_error::ODD_ADDRESS;
        debug!("odd address {va:o}");
        Trap::new(TrapCause::OddAddress)
    }

    fn timeout(&mut self, va: u16) -> Trap {
        self.cpu_error |= cpu_error::UNIBUS_TIMEOUT;
        debug!("bus timeout at {va:o}");
        Trap::new(TrapCause::BusTimeout)
    }

    /// CPU register alias values; byte access returns the low byte.
    fn register_alias(regs: &Registers, a: u16, width: Width) -> Option<u16> {
        let value = match a {
            ADDR_KERNEL_R..=0o177705 => regs.gp_bank(0, (a - ADDR_KERNEL_R) as u8),
            ADDR_USER_R..=0o177715 => regs.gp_bank(1, (a - ADDR_USER_R) as u8),
            ADDR_KERNEL_SP => regs.sp(Mode::Kernel),
            ADDR_PC => regs.pc,
            ADDR_SV_SP => regs.sp(Mode::Supervisor),
            ADDR_USER_SP => regs.sp(Mode::User),
            _ => return None,
        };
        Some(match width {
            Width::Word => value,
            Width::Byte => value & 0xff,
        })
    }

    fn io_read(&mut self, regs: &mut Registers, a: u16, access: Access) -> Result<u16, Trap> {
        let width = access.width;
        let peek = access.peek;

        if let Some(value) = Self::register_alias(regs, a, width) {
            return Ok(value);
        }

        if !peek && width == Width::Word && a & 1 != 0 {
            let mode = access.mode.resolve(regs);
            return Err(self.odd_trap(a, mode, access.space == Space::D, false));
        }

        // Device windows: real reads have side effects, peeks stay out
        if (TTY_BASE..TTY_END).contains(&a) {
            if peek {
                return Ok(0o177777);
            }
            return Ok(match width {
                Width::Word => self.tty.read_word(a),
                Width::Byte => u16::from(self.tty.read_byte(a)),
            });
        }
        if (RK05_BASE..RK05_END).contains(&a) && self.rk05.is_some() {
            if peek {
                return Ok(0o177777);
            }
            let rk05 = self.rk05.as_mut().ok_or_else(|| Trap::new(TrapCause::BusTimeout))?;
            return Ok(match width {
                Width::Word => rk05.read_word(a),
                Width::Byte => u16::from(rk05.read_byte(a)),
            });
        }
        if (RL02_BASE..RL02_END).contains(&a) && self.rl02.is_some() {
            if peek {
                return Ok(0o177777);
            }
            let rl02 = self.rl02.as_mut().ok_or_else(|| Trap::new(TrapCause::BusTimeout))?;
            return Ok(match width {
                Width::Word => rl02.read_word(a),
                Width::Byte => u16::from(rl02.read_byte(a)),
            });
        }

        // MMU descriptor windows
        if (ADDR_PDR_SV_START..ADDR_PAR_SV_START).contains(&a) {
            return Ok(self.mmu.read_pdr(a, Mode::Supervisor, width));
        }
        if (ADDR_PAR_SV_START..ADDR_PDR_K_START).contains(&a) {
            return Ok(self.mmu.read_par(a, Mode::Supervisor, width));
        }
        if (ADDR_PDR_K_START..ADDR_PAR_K_START).contains(&a) {
            return Ok(self.mmu.read_pdr(a, Mode::Kernel, width));
        }
        if (ADDR_PAR_K_START..ADDR_PAR_K_END).contains(&a) {
            return Ok(self.mmu.read_par(a, Mode::Kernel, width));
        }
        if (ADDR_PDR_U_START..ADDR_PAR_U_START).contains(&a) {
            return Ok(self.mmu.read_pdr(a, Mode::User, width));
        }
        if (ADDR_PAR_U_START..ADDR_PAR_U_END).contains(&a) {
            return Ok(self.mmu.read_par(a, Mode::User, width));
        }

        let value = match a & !1 {
            ADDR_MMR0 => self.mmu.mmr0(),
            ADDR_MMR1 => self.mmu.mmr1(),
            ADDR_MMR2 => self.mmu.mmr2(),
            ADDR_MMR3 => self.mmu.mmr3(),
            ADDR_PSW => regs.psw(),
            ADDR_STACKLIM => regs.stack_limit(),
            ADDR_CPU_ERR => self.cpu_error & 0xff,
            ADDR_MICROPROG_BREAK => self.microprog_break,
            ADDR_PIR => self.pir,
            ADDR_LFC => self.lf_csr,
            ADDR_CONSW => self.console_switches,
            ADDR_KW11P => 128,
            ADDR_SYSTEM_ID => 0o11064,
            ADDR_MAINT => 1, // power OK
            ADDR_LP11_CSR => 0x80,
            ADDR_SYSSIZE => (self.memory.size() / 64 - 1) as u16,
            0o177762 => ((self.memory.size() / 64 - 1) >> 16) as u16,
            0o177740..=0o177752 => 0, // cache control, unimplemented
            0o170200..=0o170376 => 0, // UNIBUS map, unimplemented
            _ => {
                if peek {
                    return Ok(0o177777);
                }
                return Err(self.timeout(a));
            }
        };
        if !peek {
            trace!("I/O read {a:o} -> {value:o}");
        }
        Ok(byte_half(value, a, width))
    }

    fn io_write(
        &mut self,
        regs: &mut Registers,
        a: u16,
        value: u16,
        access: Access,
    ) -> Result<(), Trap> {
        let width = access.width;
        trace!("I/O write {a:o} <- {value:o}");

        // Device windows first
        if (TTY_BASE..TTY_END).contains(&a) {
            match width {
                Width::Word => self.tty.write_word(a, value),
                Width::Byte => self.tty.write_byte(a, value as u8),
            }
            return Ok(());
        }
        if (RK05_BASE..RK05_END).contains(&a) && self.rk05.is_some() {
            if let Some(mut rk05) = self.rk05.take() {
                match width {
                    Width::Word => rk05.write_word(a, value, &mut self.memory),
                    Width::Byte => rk05.write_byte(a, value as u8, &mut self.memory),
                }
                self.rk05 = Some(rk05);
            }
            return Ok(());
        }
        if (RL02_BASE..RL02_END).contains(&a) && self.rl02.is_some() {
            if let Some(mut rl02) = self.rl02.take() {
                match width {
                    Width::Word => rl02.write_word(a, value, &mut self.memory),
                    Width::Byte => rl02.write_byte(a, value as u8, &mut self.memory),
                }
                self.rl02 = Some(rl02);
            }
            return Ok(());
        }

        // MMU descriptor windows
        if (ADDR_PDR_SV_START..ADDR_PAR_SV_START).contains(&a) {
            self.mmu.write_pdr(a, Mode::Supervisor, value, width);
            return Ok(());
        }
        if (ADDR_PAR_SV_START..ADDR_PDR_K_START).contains(&a) {
            self.mmu.write_par(a, Mode::Supervisor, value, width);
            return Ok(());
        }
        if (ADDR_PDR_K_START..ADDR_PAR_K_START).contains(&a) {
            self.mmu.write_pdr(a, Mode::Kernel, value, width);
            return Ok(());
        }
        if (ADDR_PAR_K_START..ADDR_PAR_K_END).contains(&a) {
            self.mmu.write_par(a, Mode::Kernel, value, width);
            return Ok(());
        }
        if (ADDR_PDR_U_START..ADDR_PAR_U_START).contains(&a) {
            self.mmu.write_pdr(a, Mode::User, value, width);
            return Ok(());
        }
        if (ADDR_PAR_U_START..ADDR_PAR_U_END).contains(&a) {
            self.mmu.write_par(a, Mode::User, value, width);
            return Ok(());
        }

        match a {
            // CPU register aliases are word-writable
            ADDR_KERNEL_R..=0o177705 => {
                regs.set_gp_bank(0, (a - ADDR_KERNEL_R) as u8, value);
                return Ok(());
            }
            ADDR_USER_R..=0o177715 => {
                regs.set_gp_bank(1, (a - ADDR_USER_R) as u8, value);
                return Ok(());
            }
            ADDR_KERNEL_SP => {
                regs.set_sp(Mode::Kernel, value);
                return Ok(());
            }
            ADDR_PC => {
                regs.pc = value;
                return Ok(());
            }
            ADDR_SV_SP => {
                regs.set_sp(Mode::Supervisor, value);
                return Ok(());
            }
            ADDR_USER_SP => {
                regs.set_sp(Mode::User, value);
                return Ok(());
            }
            _ => {}
        }

        match a & !1 {
            ADDR_PSW => {
                // The T bit cannot be set through the alias
                let merged = merge_half(regs.psw(), a, value, width) & !0o20;
                regs.set_psw(merged);
            }
            ADDR_STACKLIM => {
                let merged = merge_half(regs.stack_limit(), a, value, width);
                regs.set_stack_limit(merged);
            }
            ADDR_MMR0 => {
                let merged = merge_half(self.mmu.mmr0(), a, value, width);
                self.mmu.set_mmr0(merged);
            }
            ADDR_MMR3 => self.mmu.set_mmr3(value),
            ADDR_MMR1 | ADDR_MMR2 => {} // read-only
            ADDR_CPU_ERR => self.cpu_error = 0,
            ADDR_MICROPROG_BREAK => {
                self.microprog_break = merge_half(self.microprog_break, a, value, width);
            }
            ADDR_PIR => {
                // Priority fill: replicate the request level into bits
                // 1-3 and 5-7 for each populated request bit
                let mut v = value & 0o177000;
                let mut bits = v >> 9;
                while bits != 0 {
                    v += 0o42;
                    bits >>= 1;
                }
                self.pir = v;
            }
            ADDR_LFC => self.lf_csr = value,
            ADDR_CONSW => self.console_leds = value,
            ADDR_SYSSIZE | 0o177762 | ADDR_SYSTEM_ID | ADDR_MAINT => {} // read-only
            ADDR_KW11P | ADDR_LP11_CSR => {}
            0o177740..=0o177752 => {} // cache control, swallowed
            0o170200..=0o170376 => {} // UNIBUS map, swallowed
            _ => {
                if width == Width::Word && a & 1 != 0 {
                    let mode = access.mode.resolve(regs);
                    return Err(self.odd_trap(a, mode, access.space == Space::D, true));
                }
                return Err(self.timeout(a));
            }
        }
        Ok(())
    }
}

impl Pdp11Bus for SystemBus {
    fn read(&mut self, regs: &mut Registers, va: u16, access: Access) -> Result<u16, Trap> {
        if va >= IO_BASE {
            return self.io_read(regs, va, access);
        }

        let mode = access.mode.resolve(regs);
        let is_data = access.space == Space::D;

        if !access.peek && access.width == Width::Word && va & 1 != 0 {
            return Err(self.odd_trap(va, mode, is_data, false));
        }

        let phys = self
            .mmu
            .translate(mode, va, false, is_data, !access.peek, self.memory.size())?;

        if phys + u32::from(access.width.bytes()) > self.memory.size() {
            if access.peek {
                return Ok(0o177777);
            }
            self.cpu_error |= cpu_error::NONEXISTENT_MEMORY;
            debug!("read beyond memory: {va:o} -> {phys:o}");
            return Err(Trap::new(TrapCause::NonResident));
        }

        let value = match access.width {
            Width::Word => self.memory.read_word(phys),
            Width::Byte => u16::from(self.memory.read_byte(phys)),
        };
        if !access.peek {
            trace!("read {va:o}/{phys:o} -> {value:o}");
        }
        Ok(value)
    }

    fn write(
        &mut self,
        regs: &mut Registers,
        va: u16,
        value: u16,
        access: Access,
    ) -> Result<(), Trap> {
        let mode = access.mode.resolve(regs);
        let is_data = access.space == Space::D;

        // Any mapped write marks its page written-to, I/O page included
        if self.mmu.enabled() && va & 1 == 0 && va != ADDR_MMR0 {
            self.mmu.note_write(mode, is_data, va);
        }

        if va >= IO_BASE {
            return self.io_write(regs, va, value, access);
        }

        if access.width == Width::Word && va & 1 != 0 {
            return Err(self.odd_trap(va, mode, is_data, true));
        }

        let phys = self
            .mmu
            .translate(mode, va, true, is_data, true, self.memory.size())?;

        if phys + u32::from(access.width.bytes()) > self.memory.size() {
            self.cpu_error |= cpu_error::NONEXISTENT_MEMORY;
            debug!("write beyond memory: {va:o} -> {phys:o}");
            return Err(Trap::new(TrapCause::NonResident));
        }

        trace!("write {va:o}/{phys:o} <- {value:o}");
        match access.width {
            Width::Word => self.memory.write_word(phys, value),
            Width::Byte => self.memory.write_byte(phys, value as u8),
        }
        Ok(())
    }

    fn reset(&mut self, _regs: &mut Registers) {
        debug!("bus reset pulse");
        self.tty.reset();
        if let Some(rk05) = &mut self.rk05 {
            rk05.reset();
        }
        if let Some(rl02) = &mut self.rl02 {
            rl02.reset();
        }
        self.mmu.set_mmr0(0);
        self.mmu.set_mmr3(0);
        self.pir = 0;
    }

    fn instruction_fetch(&mut self, pc: u16) {
        self.mmu.instruction_fetch(pc);
    }

    fn record_delta(&mut self, delta: i8, reg: u8) {
        self.mmu.record_delta(delta, reg);
    }

    fn set_cpu_error(&mut self, flag: u16) {
        self.cpu_error |= flag;
    }
}

/// Pick the addressed half for byte reads of word registers.
fn byte_half(value: u16, a: u16, width: Width) -> u16 {
    match width {
        Width::Word => value,
        Width::Byte => {
            if a & 1 != 0 {
                value >> 8
            } else {
                value & 0xff
            }
        }
    }
}

/// Merge byte writes into the addressed half of a word register.
fn merge_half(old: u16, a: u16, value: u16, width: Width) -> u16 {
    match width {
        Width::Word => value,
        Width::Byte => {
            if a & 1 != 0 {
                (old & 0x00ff) | (value << 8)
            } else {
                (old & 0xff00) | (value & 0xff)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::{ChannelConsole, OutputBuffer};
    use crate::mmu::MMR0_ENABLE;
    use cpu_pdp11::InterruptQueue;

    fn bus() -> (SystemBus, Registers) {
        let (console, _tx) = ChannelConsole::new(Box::new(OutputBuffer::new()));
        let tty = Tty::new(Box::new(console), InterruptQueue::new());
        (SystemBus::new(Memory::new(30), tty), Registers::new())
    }

    #[test]
    fn memory_word_round_trip() {
        let (mut bus, mut regs) = bus();
        bus.write(&mut regs, 0o1000, 0o54321, Access::word(Space::D))
            .expect("write");
        let value = bus
            .read(&mut regs, 0o1000, Access::word(Space::D))
            .expect("read");
        assert_eq!(value, 0o54321);
    }

    #[test]
    fn odd_word_access_traps_004() {
        let (mut bus, mut regs) = bus();
        let err = bus
            .read(&mut regs, 0o1001, Access::word(Space::D))
            .expect_err("odd read");
        assert_eq!(err.cause, TrapCause::OddAddress);
        assert_eq!(err.vector, 0o4);
        assert_ne!(bus.cpu_error_register() & cpu_error::ODD_ADDRESS, 0);
    }

    #[test]
    fn odd_byte_access_is_fine() {
        let (mut bus, mut regs) = bus();
        bus.write(&mut regs, 0o1001, 0o123, Access::byte(Space::D))
            .expect("byte write");
        let value = bus
            .read(&mut regs, 0o1001, Access::byte(Space::D))
            .expect("byte read");
        assert_eq!(value, 0o123);
    }

    #[test]
    fn psw_alias_reads_and_writes() {
        let (mut bus, mut regs) = bus();
        regs.set_psw(0o340);
        assert_eq!(
            bus.read(&mut regs, 0o177776, Access::word(Space::D))
                .expect("psw read"),
            0o340
        );

        bus.write(&mut regs, 0o177776, 0o17 | 0o20, Access::word(Space::D))
            .expect("psw write");
        // condition codes took, the T bit did not
        assert_eq!(regs.psw(), 0o17);
    }

    #[test]
    fn register_aliases() {
        let (mut bus, mut regs) = bus();
        regs.set_gp_bank(0, 3, 0o1234);
        regs.set_sp(Mode::Kernel, 0o700);
        assert_eq!(
            bus.read(&mut regs, 0o177703, Access::word(Space::D))
                .expect("R3"),
            0o1234
        );
        assert_eq!(
            bus.read(&mut regs, 0o177706, Access::word(Space::D))
                .expect("kernel SP"),
            0o700
        );

        bus.write(&mut regs, 0o177712, 0o4321, Access::word(Space::D))
            .expect("user R2");
        assert_eq!(regs.gp_bank(1, 2), 0o4321);
    }

    #[test]
    fn unknown_io_address_times_out() {
        let (mut bus, mut regs) = bus();
        let err = bus
            .read(&mut regs, 0o160100, Access::word(Space::D))
            .expect_err("unmapped I/O");
        assert_eq!(err.cause, TrapCause::BusTimeout);
        assert_eq!(err.vector, 0o4);
        assert_ne!(bus.cpu_error_register() & cpu_error::UNIBUS_TIMEOUT, 0);
    }

    #[test]
    fn peek_suppresses_timeout_and_device_effects() {
        let (mut bus, mut regs) = bus();
        let value = bus
            .read(&mut regs, 0o160100, Access::word(Space::D).peeking())
            .expect("peek");
        assert_eq!(value, 0o177777);
        assert_eq!(bus.cpu_error_register(), 0);
    }

    #[test]
    fn par_pdr_window_round_trip() {
        let (mut bus, mut regs) = bus();
        // Kernel I PAR 0 / PDR 0
        bus.write(&mut regs, 0o172340, 0o4000, Access::word(Space::D))
            .expect("par");
        bus.write(&mut regs, 0o172300, 0o77406, Access::word(Space::D))
            .expect("pdr");
        assert_eq!(
            bus.read(&mut regs, 0o172340, Access::word(Space::D))
                .expect("par"),
            0o4000
        );
        assert_eq!(
            bus.read(&mut regs, 0o172300, Access::word(Space::D))
                .expect("pdr"),
            0o77406
        );

        // Kernel D window sits 0o20 higher
        bus.write(&mut regs, 0o172360, 0o5000, Access::word(Space::D))
            .expect("d par");
        assert_eq!(
            bus.read(&mut regs, 0o172360, Access::word(Space::D))
                .expect("d par"),
            0o5000
        );
        assert_eq!(bus.mmu.page_mut(Mode::Kernel, true, 0).par, 0o5000);
    }

    #[test]
    fn translated_read_through_kernel_page() {
        let (mut bus, mut regs) = bus();
        bus.memory.write_word(0o40200, 0o2525);
        // Map kernel I page 0 at base 0o401 clicks
        bus.write(&mut regs, 0o172340, 0o401, Access::word(Space::D))
            .expect("par");
        bus.write(&mut regs, 0o172300, 0o77406, Access::word(Space::D))
            .expect("pdr");
        bus.write(&mut regs, 0o177572, MMR0_ENABLE, Access::word(Space::D))
            .expect("mmr0");

        let value = bus
            .read(&mut regs, 0o100, Access::word(Space::I))
            .expect("mapped read");
        assert_eq!(value, 0o2525);
    }

    #[test]
    fn mmu_abort_surfaces_as_trap() {
        let (mut bus, mut regs) = bus();
        bus.write(&mut regs, 0o177572, MMR0_ENABLE, Access::word(Space::D))
            .expect("mmr0");
        // page 1 left non-resident
        let err = bus
            .read(&mut regs, 0o20000, Access::word(Space::I))
            .expect_err("non-resident page");
        assert_eq!(err.vector, 0o4);
        assert_ne!(bus.mmu.mmr0() & 0o100000, 0);
    }

    #[test]
    fn system_size_reports_clicks() {
        let (mut bus, mut regs) = bus();
        let lo = bus
            .read(&mut regs, 0o177760, Access::word(Space::D))
            .expect("lo");
        assert_eq!(u32::from(lo), 30 * 8192 / 64 - 1);
    }

    #[test]
    fn pir_write_fills_priority_bits() {
        let (mut bus, mut regs) = bus();
        bus.write(&mut regs, 0o177772, 1 << 9, Access::word(Space::D))
            .expect("pir");
        let pir = bus
            .read(&mut regs, 0o177772, Access::word(Space::D))
            .expect("pir");
        assert_eq!(pir, (1 << 9) | 0o42);
    }

    #[test]
    fn cpu_error_write_clears() {
        let (mut bus, mut regs) = bus();
        bus.set_cpu_error(cpu_error::ODD_ADDRESS);
        bus.write(&mut regs, 0o177766, 0, Access::word(Space::D))
            .expect("clear");
        assert_eq!(bus.cpu_error_register(), 0);
    }

    #[test]
    fn tty_window_dispatches() {
        let (mut bus, mut regs) = bus();
        let value = bus
            .read(&mut regs, 0o177564, Access::word(Space::D))
            .expect("TPS");
        assert_ne!(value & 0o200, 0); // puncher ready after power-up
    }

    #[test]
    fn missing_device_window_times_out() {
        let (mut bus, mut regs) = bus();
        let err = bus
            .read(&mut regs, 0o177400, Access::word(Space::D))
            .expect_err("no RK05 attached");
        assert_eq!(err.cause, TrapCause::BusTimeout);
    }

    #[test]
    fn read_beyond_memory_traps() {
        let (mut bus, mut regs) = bus();
        // 30 pages = 0o740000 bytes; virtual 0o100000 is below IO_BASE
        // but maps beyond a 1-page memory
        let (console, _tx) = ChannelConsole::new(Box::new(OutputBuffer::new()));
        let tty = Tty::new(Box::new(console), InterruptQueue::new());
        let mut small = SystemBus::new(Memory::new(1), tty);
        let err = small
            .read(&mut regs, 0o100000, Access::word(Space::D))
            .expect_err("beyond memory");
        assert_eq!(err.cause, TrapCause::NonResident);
        let _ = bus;
    }

    #[test]
    fn maintenance_and_id_registers() {
        let (mut bus, mut regs) = bus();
        assert_eq!(
            bus.read(&mut regs, 0o177750, Access::word(Space::D))
                .expect("maint"),
            1
        );
        assert_eq!(
            bus.read(&mut regs, 0o177764, Access::word(Space::D))
                .expect("id"),
            0o11064
        );
    }

    #[test]
    fn unibus_map_stub_reads_zero() {
        let (mut bus, mut regs) = bus();
        assert_eq!(
            bus.read(&mut regs, 0o170200, Access::word(Space::D))
                .expect("map"),
            0
        );
        bus.write(&mut regs, 0o170200, 0o7777, Access::word(Space::D))
            .expect("swallowed");
    }
}
