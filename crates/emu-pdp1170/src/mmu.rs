//! Memory management unit: dual I/D spaces, PAR/PDR pairs, MMR0..MMR3.
//!
//! Eight pages per (mode, space). Translation adds the PAR base (in
//! 64-byte clicks) to the 13-bit page offset and masks the result to 18
//! or 22 bits per MMR3 bit 4. Access and length checks abort the bus
//! cycle: the cause is latched into MMR0 (freezing bits 1-7 until
//! software clears it) and a trap travels back to the CPU as an error.

use cpu_pdp11::{Mode, Trap, TrapCause, Width};
use tracing::{debug, trace};

/// MMR0 bit 0: translation enabled.
pub const MMR0_ENABLE: u16 = 1;
/// MMR0 bit 8: trap-on-write maintenance mode.
pub const MMR0_TRAP_ENABLE: u16 = 1 << 8;
/// MMR0 bit 13: read-only abort.
pub const MMR0_ABORT_RDONLY: u16 = 1 << 13;
/// MMR0 bit 14: page length abort.
pub const MMR0_ABORT_LENGTH: u16 = 1 << 14;
/// MMR0 bit 15: non-resident abort.
pub const MMR0_ABORT_NONRES: u16 = 1 << 15;
/// All abort-cause flags (bits 12-15). Any of them freezes bits 1-7.
const MMR0_ABORT_MASK: u16 = 0o170000;
/// The frozen field: page and mode at the time of the abort.
const MMR0_FROZEN_FIELD: u16 = 0o376;

/// MMR3 bit 4: 22-bit physical addressing (18-bit when clear).
pub const MMR3_22BIT: u16 = 1 << 4;

/// D-space enable bit in MMR3, indexed by run mode.
const MMR3_D_ENABLE: [u16; 4] = [4, 2, 0, 1];

/// One page descriptor: address register and descriptor register.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageEntry {
    pub par: u16,
    pub pdr: u16,
}

/// PDR bit 6: page written to.
const PDR_W: u16 = 1 << 6;
/// PDR bit 7: access attempted that aborted.
const PDR_A: u16 = 1 << 7;

/// The KT11-style memory management unit of the 11/70.
pub struct Mmu {
    /// Page table, indexed `[mode][space][page]` with space 0 = I, 1 = D.
    pages: [[[PageEntry; 8]; 2]; 4],
    mmr0: u16,
    mmr1: u16,
    mmr2: u16,
    mmr3: u16,
}

impl Mmu {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pages: [[[PageEntry::default(); 8]; 2]; 4],
            mmr0: 0,
            mmr1: 0,
            mmr2: 0,
            mmr3: 0,
        }
    }

    /// Power-up / console reset: zero the page table and all MMRs.
    pub fn reset(&mut self) {
        self.pages = [[[PageEntry::default(); 8]; 2]; 4];
        self.mmr0 = 0;
        self.mmr1 = 0;
        self.mmr2 = 0;
        self.mmr3 = 0;
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.mmr0 & MMR0_ENABLE != 0
    }

    /// Abort flags latched: MMR0 bits 1-7, MMR1 and MMR2 are frozen.
    #[must_use]
    pub const fn frozen(&self) -> bool {
        self.mmr0 & MMR0_ABORT_MASK != 0
    }

    /// Is D space in effect for data references in this mode?
    #[must_use]
    pub fn d_space_enabled(&self, mode: Mode) -> bool {
        self.mmr3 & MMR3_D_ENABLE[mode.index()] != 0
    }

    // === Registers ===

    #[must_use]
    pub const fn mmr0(&self) -> u16 {
        self.mmr0
    }

    #[must_use]
    pub const fn mmr1(&self) -> u16 {
        self.mmr1
    }

    #[must_use]
    pub const fn mmr2(&self) -> u16 {
        self.mmr2
    }

    #[must_use]
    pub const fn mmr3(&self) -> u16 {
        self.mmr3
    }

    /// Write MMR0. Bits 10-11 always read zero; while an abort is
    /// latched bits 1-7 are read-only, and the abort flags clear only
    /// when bit 0 is written as zero in the same cycle.
    pub fn set_mmr0(&mut self, value: u16) {
        let mut v = value & !(3 << 10);
        if self.frozen() {
            v = (v & !MMR0_FROZEN_FIELD) | (self.mmr0 & MMR0_FROZEN_FIELD);
            if v & MMR0_ENABLE != 0 {
                v = (v & !MMR0_ABORT_MASK) | (self.mmr0 & MMR0_ABORT_MASK);
            }
        } else if v & MMR0_ENABLE != 0 {
            v &= !MMR0_ABORT_MASK;
        }
        self.mmr0 = v;
    }

    pub fn set_mmr3(&mut self, value: u16) {
        self.mmr3 = value & 0o67;
    }

    /// Instruction fetch bookkeeping: MMR1 clears, MMR2 latches the PC.
    /// Both freeze while an abort is pending.
    pub fn instruction_fetch(&mut self, pc: u16) {
        if !self.frozen() {
            self.mmr1 = 0;
            self.mmr2 = pc;
        }
    }

    /// Record an auto-increment/decrement: (signed 5-bit delta, register),
    /// two entries packed per word, newest in the low byte... the high
    /// byte holds the older entry after the shift.
    pub fn record_delta(&mut self, delta: i8, reg: u8) {
        if !self.frozen() {
            self.mmr1 <<= 8;
            self.mmr1 |= u16::from((delta & 0o37) as u8) << 3;
            self.mmr1 |= u16::from(reg & 7);
        }
    }

    // === PAR/PDR register window ===
    //
    // The I/O page exposes each mode's descriptors as 16 words: 8 I-space
    // entries then 8 D-space entries. Bit 4 of the address selects the
    // space, bits 1-3 the page.

    #[must_use]
    pub fn read_pdr(&self, a: u16, mode: Mode, width: Width) -> u16 {
        let entry = self.window_entry(a, mode);
        byte_select(entry.pdr, a, width)
    }

    #[must_use]
    pub fn read_par(&self, a: u16, mode: Mode, width: Width) -> u16 {
        let entry = self.window_entry(a, mode);
        byte_select(entry.par, a, width)
    }

    pub fn write_pdr(&mut self, a: u16, mode: Mode, value: u16, width: Width) {
        let entry = self.window_entry_mut(a, mode);
        entry.pdr = byte_merge(entry.pdr, a, value, width);
        // Bits 4, 5 and 15 are unused; A and W clear on any PDR write
        entry.pdr &= !(0o100000 | PDR_A | PDR_W | 0o60);
        trace!("PDR write mode {mode:?} addr {a:o} -> {:o}", entry.pdr);
    }

    pub fn write_par(&mut self, a: u16, mode: Mode, value: u16, width: Width) {
        let entry = self.window_entry_mut(a, mode);
        entry.par = byte_merge(entry.par, a, value, width);
        // Retargeting a page clears its A/W history
        entry.pdr &= !(PDR_A | PDR_W);
        trace!("PAR write mode {mode:?} addr {a:o} -> {:o}", entry.par);
    }

    fn window_entry(&self, a: u16, mode: Mode) -> PageEntry {
        let page = usize::from((a >> 1) & 7);
        let is_d = usize::from(a & 0o20 != 0);
        self.pages[mode.index()][is_d][page]
    }

    fn window_entry_mut(&mut self, a: u16, mode: Mode) -> &mut PageEntry {
        let page = usize::from((a >> 1) & 7);
        let is_d = usize::from(a & 0o20 != 0);
        &mut self.pages[mode.index()][is_d][page]
    }

    /// Direct page table access for the machine (bootstrap, tests).
    pub fn page_mut(&mut self, mode: Mode, d_space: bool, page: usize) -> &mut PageEntry {
        &mut self.pages[mode.index()][usize::from(d_space)][page]
    }

    /// Record the page field of an odd-address trap in MMR0 bits 1-3.
    pub fn note_odd_address(&mut self, va: u16) {
        if !self.frozen() {
            self.mmr0 = (self.mmr0 & !0o16) | ((va >> 13) << 1);
        }
    }

    /// Set the written-to bit on the page covering `va` (successful write
    /// cycles; the bus calls this even for I/O page addresses).
    pub fn note_write(&mut self, mode: Mode, is_data: bool, va: u16) {
        let d = is_data && self.d_space_enabled(mode);
        let apf = usize::from(va >> 13);
        self.pages[mode.index()][usize::from(d)][apf].pdr |= PDR_W;
    }

    /// A write that aborted (odd address and friends) still marks the
    /// page's accessed bit.
    pub fn note_aborted_write(&mut self, mode: Mode, is_data: bool, va: u16) {
        let d = is_data && self.d_space_enabled(mode);
        let apf = usize::from(va >> 13);
        self.pages[mode.index()][usize::from(d)][apf].pdr |= PDR_A;
    }

    // === Translation ===

    /// Translate a virtual address.
    ///
    /// With translation disabled (and no trap-on-write maintenance bit
    /// for writes) the address passes through unchanged. Otherwise the
    /// PAR base is applied and, when `check` is set, the access-control
    /// and page-length rules can abort with an MMU trap, latching the
    /// cause into MMR0. `check` is false for peeks, which must be free
    /// of side effects.
    pub fn translate(
        &mut self,
        mode: Mode,
        va: u16,
        is_write: bool,
        is_data: bool,
        check: bool,
        mem_limit: u32,
    ) -> Result<u32, Trap> {
        let translating =
            self.enabled() || (is_write && self.mmr0 & MMR0_TRAP_ENABLE != 0);
        if !translating {
            return Ok(u32::from(va));
        }

        let apf = usize::from(va >> 13);
        let d = is_data && self.d_space_enabled(mode);
        let entry = self.pages[mode.index()][usize::from(d)][apf];
        let offset = u32::from(va & 0o17777);

        let mut phys = u32::from(entry.par) * 64 + offset;
        // MMR3 bit 4 selects 22-bit physical addressing, else 18-bit
        phys &= if self.mmr3 & MMR3_22BIT != 0 {
            0x3f_ffff
        } else {
            0x3_ffff
        };

        if check {
            // Access control field, PDR bits 0-2
            let ac = entry.pdr & 7;
            let denied = if is_write {
                ac != 6
            } else {
                matches!(ac, 0 | 1 | 3 | 4 | 7)
            };
            if denied {
                if is_write {
                    self.mark_page_accessed(mode, d, apf);
                }
                return if ac == 0 || ac == 4 {
                    self.abort(mode, apf, MMR0_ABORT_NONRES, TrapCause::NonResident, va)
                } else {
                    self.abort(mode, apf, MMR0_ABORT_RDONLY, TrapCause::AccessViolation, va)
                };
            }

            if phys >= mem_limit {
                if is_write {
                    self.mark_page_accessed(mode, d, apf);
                }
                return self.abort(mode, apf, MMR0_ABORT_NONRES, TrapCause::NonResident, va);
            }

            // Page length check against the 7-bit block number
            let pdr_len = (entry.pdr >> 8) & 0o177;
            let block = (va >> 6) & 0o177;
            let downward = entry.pdr & 0o10 != 0;
            if (!downward && block > pdr_len) || (downward && block < pdr_len) {
                if is_write {
                    self.mark_page_accessed(mode, d, apf);
                }
                return self.abort(mode, apf, MMR0_ABORT_LENGTH, TrapCause::LengthViolation, va);
            }

            if is_write {
                self.pages[mode.index()][usize::from(d)][apf].pdr |= PDR_W;
            }
        }

        trace!(
            "va {va:o} -> phys {phys:o} (mode {mode:?}, {} space, apf {apf})",
            if d { "D" } else { "I" }
        );
        Ok(phys)
    }

    /// Latch an abort cause into MMR0 (unless already latched) and build
    /// the trap for the CPU.
    fn abort(
        &mut self,
        mode: Mode,
        apf: usize,
        flag: u16,
        cause: TrapCause,
        va: u16,
    ) -> Result<u32, Trap> {
        if !self.frozen() {
            self.mmr0 &= !(MMR0_ABORT_MASK | (3 << 5) | (7 << 1));
            self.mmr0 |= flag | (mode.bits() << 5) | ((apf as u16) << 1);
        }
        debug!("MMU abort: {cause} at va {va:o}, MMR0 {:o}", self.mmr0);
        Err(Trap::new(cause))
    }

    /// An aborted write still marks the page as touched.
    fn mark_page_accessed(&mut self, mode: Mode, d: bool, apf: usize) {
        self.pages[mode.index()][usize::from(d)][apf].pdr |= PDR_A;
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte reads of a register pick the half selected by the address.
fn byte_select(value: u16, a: u16, width: Width) -> u16 {
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

/// Byte writes merge into the addressed half.
fn byte_merge(old: u16, a: u16, value: u16, width: Width) -> u16 {
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

    const MEM: u32 = 30 * 8192;

    fn mapped_mmu() -> Mmu {
        let mut mmu = Mmu::new();
        // Kernel I page 0: base 0o4000 clicks, full length, read/write
        let entry = mmu.page_mut(Mode::Kernel, false, 0);
        entry.par = 0o4000;
        entry.pdr = 0o77406;
        mmu.set_mmr0(MMR0_ENABLE);
        mmu
    }

    #[test]
    fn disabled_passes_through() {
        let mut mmu = Mmu::new();
        let phys = mmu
            .translate(Mode::Kernel, 0o123456, false, false, true, MEM)
            .expect("pass-through");
        assert_eq!(phys, 0o123456);
    }

    #[test]
    fn par_base_plus_offset() {
        let mut mmu = mapped_mmu();
        let phys = mmu
            .translate(Mode::Kernel, 0o100, false, false, true, MEM)
            .expect("mapped read");
        assert_eq!(phys, 0o400000 + 0o100);
    }

    #[test]
    fn eighteen_bit_masking_by_default() {
        let mut mmu = Mmu::new();
        let entry = mmu.page_mut(Mode::Kernel, false, 0);
        entry.par = 0o60000; // base beyond 18 bits
        entry.pdr = 0o77406;
        mmu.set_mmr0(MMR0_ENABLE);

        let phys = mmu
            .translate(Mode::Kernel, 0, false, false, false, u32::MAX)
            .expect("translate");
        assert_eq!(phys, (0o60000 * 64) & 0x3_ffff);

        mmu.set_mmr3(MMR3_22BIT);
        let phys = mmu
            .translate(Mode::Kernel, 0, false, false, false, u32::MAX)
            .expect("translate");
        assert_eq!(phys, 0o60000 * 64);
    }

    #[test]
    fn write_sets_w_bit() {
        let mut mmu = mapped_mmu();
        mmu.translate(Mode::Kernel, 0o100, true, false, true, MEM)
            .expect("mapped write");
        assert_ne!(mmu.page_mut(Mode::Kernel, false, 0).pdr & PDR_W, 0);
    }

    #[test]
    fn read_only_page_aborts_writes() {
        let mut mmu = mapped_mmu();
        mmu.page_mut(Mode::Kernel, false, 0).pdr = 0o77402; // ac=2: read-only
        let err = mmu
            .translate(Mode::Kernel, 0o100, true, false, true, MEM)
            .expect_err("write must abort");
        assert_eq!(err.cause, TrapCause::AccessViolation);
        assert_ne!(mmu.mmr0() & MMR0_ABORT_RDONLY, 0);
        // reads still fine
        mmu.set_mmr0(0);
        mmu.set_mmr0(MMR0_ENABLE);
        assert!(
            mmu.translate(Mode::Kernel, 0o100, false, false, true, MEM)
                .is_ok()
        );
    }

    #[test]
    fn non_resident_page_aborts() {
        let mut mmu = mapped_mmu();
        mmu.page_mut(Mode::Kernel, false, 0).pdr = 0o77400; // ac=0
        let err = mmu
            .translate(Mode::Kernel, 0o100, false, false, true, MEM)
            .expect_err("non-resident");
        assert_eq!(err.cause, TrapCause::NonResident);
        assert_eq!(err.vector, 0o4);
        assert_ne!(mmu.mmr0() & MMR0_ABORT_NONRES, 0);
    }

    #[test]
    fn upward_length_violation() {
        let mut mmu = mapped_mmu();
        mmu.page_mut(Mode::Kernel, false, 0).pdr = 0o6; // block 0 only, upward
        assert!(
            mmu.translate(Mode::Kernel, 0o77, false, false, true, MEM)
                .is_ok()
        );
        let err = mmu
            .translate(Mode::Kernel, 0o100, false, false, true, MEM)
            .expect_err("beyond block 0");
        assert_eq!(err.cause, TrapCause::LengthViolation);
        assert_ne!(mmu.mmr0() & MMR0_ABORT_LENGTH, 0);
    }

    #[test]
    fn downward_stack_page() {
        let mut mmu = mapped_mmu();
        // Direction down, length boundary at block 0o100
        mmu.page_mut(Mode::Kernel, false, 0).pdr = 0o40016;
        assert!(
            mmu.translate(Mode::Kernel, 0o10000, false, false, true, MEM)
                .is_ok()
        );
        assert!(
            mmu.translate(Mode::Kernel, 0o100, false, false, true, MEM)
                .is_err()
        );
    }

    #[test]
    fn abort_freezes_mmr0_fields() {
        let mut mmu = mapped_mmu();
        mmu.page_mut(Mode::User, false, 3).pdr = 0; // non-resident
        mmu.instruction_fetch(0o1000);
        assert_eq!(mmu.mmr2(), 0o1000);

        let _ = mmu.translate(Mode::User, 0o60100, false, false, true, MEM);
        let frozen = mmu.mmr0();
        assert_ne!(frozen & MMR0_ABORT_NONRES, 0);
        assert_eq!((frozen >> 1) & 7, 3); // apf
        assert_eq!((frozen >> 5) & 3, 3); // user mode

        // a second abort must not overwrite the latched fields
        let _ = mmu.translate(Mode::Kernel, 0o100, true, false, true, 0);
        assert_eq!(mmu.mmr0(), frozen);

        // MMR1/MMR2 freeze as well
        mmu.instruction_fetch(0o2000);
        assert_eq!(mmu.mmr2(), 0o1000);
        mmu.record_delta(2, 3);
        assert_eq!(mmu.mmr1(), 0);
    }

    #[test]
    fn mmr0_write_protection() {
        let mut mmu = mapped_mmu();
        mmu.page_mut(Mode::Kernel, false, 1).pdr = 0;
        let _ = mmu.translate(Mode::Kernel, 0o20000, false, false, true, MEM);
        assert!(mmu.frozen());

        // Writing with bit 0 still set leaves the abort flags latched
        mmu.set_mmr0(MMR0_ENABLE);
        assert!(mmu.frozen());

        // Clearing bit 0 together with the flags unlocks
        mmu.set_mmr0(0);
        assert!(!mmu.frozen());
    }

    #[test]
    fn mmr0_bits_10_11_read_zero() {
        let mut mmu = Mmu::new();
        mmu.set_mmr0(0o7777);
        assert_eq!(mmu.mmr0() & (3 << 10), 0);
    }

    #[test]
    fn mmr1_packs_two_entries() {
        let mut mmu = Mmu::new();
        mmu.record_delta(2, 0);
        mmu.record_delta(-2, 6);
        // older entry shifted into the high byte
        assert_eq!(mmu.mmr1() & 0xff00, (0o20 | 0) << 8);
        assert_eq!(mmu.mmr1() & 0x00ff, (0o36 << 3) | 6);
    }

    #[test]
    fn d_space_selected_only_when_enabled() {
        let mut mmu = Mmu::new();
        mmu.page_mut(Mode::Kernel, false, 0).par = 0o1000;
        mmu.page_mut(Mode::Kernel, false, 0).pdr = 0o77406;
        mmu.page_mut(Mode::Kernel, true, 0).par = 0o2000;
        mmu.page_mut(Mode::Kernel, true, 0).pdr = 0o77406;
        mmu.set_mmr0(MMR0_ENABLE);

        let phys = mmu
            .translate(Mode::Kernel, 0, false, true, true, MEM)
            .expect("I space while D disabled");
        assert_eq!(phys, 0o1000 * 64);

        mmu.set_mmr3(0o4); // kernel D enable
        let phys = mmu
            .translate(Mode::Kernel, 0, false, true, true, MEM)
            .expect("D space");
        assert_eq!(phys, 0o2000 * 64);
    }

    #[test]
    fn pdr_write_clears_a_and_w() {
        let mut mmu = mapped_mmu();
        mmu.translate(Mode::Kernel, 0, true, false, true, MEM)
            .expect("write");
        assert_ne!(mmu.page_mut(Mode::Kernel, false, 0).pdr & PDR_W, 0);

        mmu.write_pdr(0o172300 & 0o37, Mode::Kernel, 0o77406, Width::Word);
        assert_eq!(mmu.page_mut(Mode::Kernel, false, 0).pdr & (PDR_A | PDR_W), 0);
    }

    #[test]
    fn par_byte_write_merges() {
        let mut mmu = Mmu::new();
        mmu.write_par(0, Mode::User, 0o1234, Width::Word);
        mmu.write_par(1, Mode::User, 0o7, Width::Byte);
        assert_eq!(mmu.read_par(0, Mode::User, Width::Word), 0o1234 & 0xff | 0o7 << 8);
        assert_eq!(mmu.read_par(1, Mode::User, Width::Byte), 0o7);
    }
}
