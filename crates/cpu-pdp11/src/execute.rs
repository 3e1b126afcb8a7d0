//! Instruction decode and execution.
//!
//! Decode follows the classic PDP-11 opcode taxonomy: double-operand
//! groups 01-06/11-16, the EIS/SOB group 07, and the dense zero group
//! holding single-operand ops, branches, condition-code ops and the
//! miscellaneous instructions. Each handler sets condition codes per the
//! processor handbook and reports faults as `Trap` errors, which the
//! step loop converts into vector dispatch.

use crate::alu::{is_neg, mask, sign_extend_byte, sign_mask};
use crate::bus::{Access, Pdp11Bus, Space, Trap, TrapCause, Width, cpu_error};
use crate::cpu::Pdp11;
use crate::ea::Operand;
use crate::registers::Mode;

impl Pdp11 {
    /// Execute one fetched instruction.
    pub(crate) fn execute<B: Pdp11Bus>(&mut self, bus: &mut B, instr: u16) -> Result<(), Trap> {
        match (instr >> 12) & 7 {
            0 => self.execute_zero_group(bus, instr),
            7 => {
                if instr & 0o100000 == 0 {
                    self.execute_eis(bus, instr)
                } else {
                    // 17xxxx: FP11 floating point, stubbed as reserved
                    Err(Trap::new(TrapCause::ReservedInstruction))
                }
            }
            _ => self.execute_double_operand(bus, instr),
        }
    }

    // === Double operand: MOV CMP BIT BIC BIS ADD SUB ===

    fn execute_double_operand<B: Pdp11Bus>(
        &mut self,
        bus: &mut B,
        instr: u16,
    ) -> Result<(), Trap> {
        let byte_flavor = instr & 0o100000 != 0;
        let op = (instr >> 12) & 7;
        let src_mode = ((instr >> 9) & 7) as u8;
        let src_reg = ((instr >> 6) & 7) as u8;
        let dst_mode = ((instr >> 3) & 7) as u8;
        let dst_reg = (instr & 7) as u8;

        // ADD/SUB are word-only; bit 15 selects between them instead
        let width = if byte_flavor && op != 6 {
            Width::Byte
        } else {
            Width::Word
        };

        match op {
            1 => {
                // MOV / MOVB
                let src = self.read_src(bus, src_mode, src_reg, width)?;
                let dst = self.decode_operand(bus, dst_mode, dst_reg, width)?;
                if width == Width::Byte && matches!(dst, Operand::Reg(_)) {
                    // MOVB to a register sign-extends
                    self.write_operand(bus, dst, Width::Word, sign_extend_byte(src))?;
                } else {
                    self.write_operand(bus, dst, width, src)?;
                }
                self.set_nz_clear_v(src, width);
            }
            2 => {
                // CMP / CMPB: src - dst, operands unchanged
                let src = self.read_src(bus, src_mode, src_reg, width)?;
                let dst = self.read_src(bus, dst_mode, dst_reg, width)?;
                let result = src.wrapping_sub(dst) & mask(width);
                self.set_nz(result, width);
                self.regs
                    .set_v((src ^ dst) & (src ^ result) & sign_mask(width) != 0);
                self.regs.set_c(src < dst);
            }
            3 => {
                // BIT / BITB
                let src = self.read_src(bus, src_mode, src_reg, width)?;
                let dst = self.read_src(bus, dst_mode, dst_reg, width)?;
                self.set_nz_clear_v(src & dst, width);
            }
            4 => {
                // BIC / BICB
                let src = self.read_src(bus, src_mode, src_reg, width)?;
                let dst = self.decode_operand(bus, dst_mode, dst_reg, width)?;
                let result = self.read_operand(bus, dst, width)? & !src & mask(width);
                self.write_operand(bus, dst, width, result)?;
                self.set_nz_clear_v(result, width);
            }
            5 => {
                // BIS / BISB
                let src = self.read_src(bus, src_mode, src_reg, width)?;
                let dst = self.decode_operand(bus, dst_mode, dst_reg, width)?;
                let result = self.read_operand(bus, dst, width)? | src;
                self.write_operand(bus, dst, width, result)?;
                self.set_nz_clear_v(result, width);
            }
            _ => {
                // ADD / SUB
                let src = self.read_src(bus, src_mode, src_reg, Width::Word)?;
                let dst = self.decode_operand(bus, dst_mode, dst_reg, Width::Word)?;
                let old = self.read_operand(bus, dst, Width::Word)?;
                if byte_flavor {
                    // SUB: dst - src
                    let result = old.wrapping_sub(src);
                    self.write_operand(bus, dst, Width::Word, result)?;
                    self.set_nz(result, Width::Word);
                    self.regs.set_v((src ^ old) & (old ^ result) & 0x8000 != 0);
                    self.regs.set_c(old < src);
                } else {
                    let sum = u32::from(old) + u32::from(src);
                    let result = sum as u16;
                    self.write_operand(bus, dst, Width::Word, result)?;
                    self.set_nz(result, Width::Word);
                    self.regs.set_v(!(src ^ old) & (old ^ result) & 0x8000 != 0);
                    self.regs.set_c(sum > 0xffff);
                }
            }
        }
        Ok(())
    }

    // === Group 07: MUL DIV ASH ASHC XOR SOB ===

    fn execute_eis<B: Pdp11Bus>(&mut self, bus: &mut B, instr: u16) -> Result<(), Trap> {
        let sub_op = (instr >> 9) & 7;
        let reg = ((instr >> 6) & 7) as u8;
        let mode = ((instr >> 3) & 7) as u8;
        let rn = (instr & 7) as u8;

        match sub_op {
            0 => {
                // MUL: 32-bit product into (R, R|1)
                let src = self.read_src(bus, mode, rn, Width::Word)?;
                let product =
                    i32::from(self.regs.get(reg) as i16) * i32::from(src as i16);
                self.regs.set(reg, (product >> 16) as u16);
                self.regs.set(reg | 1, product as u16);
                self.regs.set_n(product < 0);
                self.regs.set_z(product == 0);
                self.regs.set_v(false);
                self.regs.set_c(!(-32768..=32767).contains(&product));
            }
            1 => {
                // DIV: (R:R|1) / src -> quotient R, remainder R|1
                let src = self.read_src(bus, mode, rn, Width::Word)?;
                if src == 0 {
                    self.regs.set_n(false);
                    self.regs.set_z(false);
                    self.regs.set_v(true);
                    self.regs.set_c(true);
                    return Ok(());
                }
                let dividend = ((u32::from(self.regs.get(reg)) << 16)
                    | u32::from(self.regs.get(reg | 1))) as i32;
                let divisor = i32::from(src as i16);
                let quotient = dividend.checked_div(divisor);
                match quotient {
                    Some(q) if (-32768..=32767).contains(&q) => {
                        let remainder = dividend.wrapping_rem(divisor);
                        self.regs.set(reg, q as u16);
                        self.regs.set(reg | 1, remainder as u16);
                        self.regs.set_n(q < 0);
                        self.regs.set_z(q == 0);
                        self.regs.set_v(false);
                        self.regs.set_c(false);
                    }
                    _ => {
                        // Quotient does not fit: registers untouched
                        self.regs.set_v(true);
                        self.regs.set_c(false);
                    }
                }
            }
            2 => {
                // ASH: shift R by signed 6-bit count
                let src = self.read_src(bus, mode, rn, Width::Word)?;
                let count = shift_count(src);
                let mut value = self.regs.get(reg);
                let mut carry = self.regs.c();
                let mut overflow = false;
                if count > 0 {
                    for _ in 0..count {
                        carry = value & 0x8000 != 0;
                        let shifted = value << 1;
                        overflow |= (shifted ^ value) & 0x8000 != 0;
                        value = shifted;
                    }
                } else {
                    for _ in 0..-count {
                        carry = value & 1 != 0;
                        value = (value >> 1) | (value & 0x8000);
                    }
                }
                self.regs.set(reg, value);
                self.set_nz(value, Width::Word);
                self.regs.set_v(overflow);
                if count != 0 {
                    self.regs.set_c(carry);
                }
            }
            3 => {
                // ASHC: 32-bit shift of (R:R|1)
                let src = self.read_src(bus, mode, rn, Width::Word)?;
                let count = shift_count(src);
                let mut value = (u32::from(self.regs.get(reg)) << 16)
                    | u32::from(self.regs.get(reg | 1));
                let mut carry = self.regs.c();
                let mut overflow = false;
                if count > 0 {
                    for _ in 0..count {
                        carry = value & 0x8000_0000 != 0;
                        let shifted = value << 1;
                        overflow |= (shifted ^ value) & 0x8000_0000 != 0;
                        value = shifted;
                    }
                } else {
                    for _ in 0..-count {
                        carry = value & 1 != 0;
                        value = (value >> 1) | (value & 0x8000_0000);
                    }
                }
                self.regs.set(reg, (value >> 16) as u16);
                self.regs.set(reg | 1, value as u16);
                self.regs.set_n(value & 0x8000_0000 != 0);
                self.regs.set_z(value == 0);
                self.regs.set_v(overflow);
                if count != 0 {
                    self.regs.set_c(carry);
                }
            }
            4 => {
                // XOR: dst ^= R
                let src = self.regs.get(reg);
                let dst = self.decode_operand(bus, mode, rn, Width::Word)?;
                let result = self.read_operand(bus, dst, Width::Word)? ^ src;
                self.write_operand(bus, dst, Width::Word, result)?;
                self.set_nz_clear_v(result, Width::Word);
            }
            7 => {
                // SOB: decrement and branch back
                let value = self.regs.get(reg).wrapping_sub(1);
                self.regs.set(reg, value);
                if value != 0 {
                    let offset = instr & 0o77;
                    self.regs.pc = self.regs.pc.wrapping_sub(offset * 2);
                }
            }
            _ => {
                // 075: FIS stubs, 076: CIS — not present on this machine
                return Err(Trap::new(TrapCause::ReservedInstruction));
            }
        }
        Ok(())
    }

    // === Zero group ===

    fn execute_zero_group<B: Pdp11Bus>(&mut self, bus: &mut B, instr: u16) -> Result<(), Trap> {
        if instr & 0o100000 == 0 {
            match instr {
                0o000000 => self.op_halt(bus),
                0o000001 => {
                    self.waiting = true;
                    Ok(())
                }
                0o000002 => self.op_rti(bus, false),
                0o000003 => self.enter_trap(bus, 0o14), // BPT
                0o000004 => self.enter_trap(bus, 0o20), // IOT
                0o000005 => {
                    // RESET: bus-wide reset pulse, kernel only
                    if self.regs.current_mode() == Mode::Kernel {
                        self.interrupts.clear();
                        bus.reset(&mut self.regs);
                    }
                    Ok(())
                }
                0o000006 => self.op_rti(bus, true), // RTT
                0o000007 => {
                    // MFPT (emulated): processor type in R0
                    self.regs.set(0, 1);
                    Ok(())
                }
                0o000100..=0o000177 => self.op_jmp(bus, instr),
                0o000200..=0o000207 => self.op_rts(bus, instr),
                0o000230..=0o000237 => {
                    // SPL: kernel sets priority, elsewhere a no-op
                    if self.regs.current_mode() == Mode::Kernel {
                        self.regs.set_spl(instr & 7);
                    }
                    Ok(())
                }
                0o000240..=0o000277 => {
                    // Condition code operators: CLC..SEN, CCC, SCC, NOP
                    let bits = instr & 0o17;
                    let psw = self.regs.psw();
                    if instr & 0o20 != 0 {
                        self.regs.set_psw(psw | bits);
                    } else {
                        self.regs.set_psw(psw & !bits);
                    }
                    Ok(())
                }
                0o000300..=0o000377 => self.op_swab(bus, instr),
                0o000400..=0o003777 => {
                    self.branch_word_set(instr);
                    Ok(())
                }
                0o004000..=0o004777 => self.op_jsr(bus, instr),
                0o005000..=0o006777 => self.execute_single_operand(bus, instr),
                _ => Err(Trap::new(TrapCause::ReservedInstruction)),
            }
        } else {
            match instr {
                0o100000..=0o103777 => {
                    self.branch_byte_set(instr);
                    Ok(())
                }
                0o104000..=0o104377 => self.enter_trap(bus, 0o30), // EMT
                0o104400..=0o104777 => self.enter_trap(bus, 0o34), // TRAP
                0o105000..=0o106777 => self.execute_single_operand(bus, instr),
                _ => Err(Trap::new(TrapCause::ReservedInstruction)),
            }
        }
    }

    fn op_halt<B: Pdp11Bus>(&mut self, bus: &mut B) -> Result<(), Trap> {
        if self.regs.current_mode() == Mode::Kernel {
            self.halted = true;
            Ok(())
        } else {
            bus.set_cpu_error(cpu_error::ILLEGAL_HALT);
            Err(Trap::new(TrapCause::IllegalInstruction))
        }
    }

    fn op_rti<B: Pdp11Bus>(&mut self, bus: &mut B, is_rtt: bool) -> Result<(), Trap> {
        let pc = self.pop(bus)?;
        let psw = self.pop(bus)?;
        self.regs.pc = pc;
        if self.regs.current_mode() == Mode::Kernel {
            self.regs.set_psw(psw);
        } else {
            self.regs.set_psw_protected(psw);
        }
        if is_rtt {
            // RTT defers any trace trap until after the next instruction
            self.suppress_trace = true;
        }
        Ok(())
    }

    fn op_jmp<B: Pdp11Bus>(&mut self, bus: &mut B, instr: u16) -> Result<(), Trap> {
        let mode = ((instr >> 3) & 7) as u8;
        let reg = (instr & 7) as u8;
        match self.decode_operand(bus, mode, reg, Width::Word)? {
            Operand::Reg(_) => Err(Trap::new(TrapCause::IllegalInstruction)),
            Operand::Mem { addr, .. } => {
                self.regs.pc = addr;
                Ok(())
            }
        }
    }

    fn op_jsr<B: Pdp11Bus>(&mut self, bus: &mut B, instr: u16) -> Result<(), Trap> {
        let link = ((instr >> 6) & 7) as u8;
        let mode = ((instr >> 3) & 7) as u8;
        let reg = (instr & 7) as u8;
        match self.decode_operand(bus, mode, reg, Width::Word)? {
            Operand::Reg(_) => Err(Trap::new(TrapCause::IllegalInstruction)),
            Operand::Mem { addr, .. } => {
                self.push(bus, self.regs.get(link))?;
                let return_pc = self.regs.pc;
                self.regs.set(link, return_pc);
                self.regs.pc = addr;
                Ok(())
            }
        }
    }

    fn op_rts<B: Pdp11Bus>(&mut self, bus: &mut B, instr: u16) -> Result<(), Trap> {
        let reg = (instr & 7) as u8;
        self.regs.pc = self.regs.get(reg);
        let value = self.pop(bus)?;
        self.regs.set(reg, value);
        Ok(())
    }

    fn op_swab<B: Pdp11Bus>(&mut self, bus: &mut B, instr: u16) -> Result<(), Trap> {
        let mode = ((instr >> 3) & 7) as u8;
        let reg = (instr & 7) as u8;
        let operand = self.decode_operand(bus, mode, reg, Width::Word)?;
        let old = self.read_operand(bus, operand, Width::Word)?;
        let result = old.rotate_left(8);
        self.write_operand(bus, operand, Width::Word, result)?;
        // Flags look at the new low byte only
        self.set_nz(result, Width::Byte);
        self.regs.set_v(false);
        self.regs.set_c(false);
        Ok(())
    }

    // === Single operand group ===

    fn execute_single_operand<B: Pdp11Bus>(
        &mut self,
        bus: &mut B,
        instr: u16,
    ) -> Result<(), Trap> {
        let byte_group = instr & 0o100000 != 0;
        let op = (instr >> 6) & 0o77;
        let mode = ((instr >> 3) & 7) as u8;
        let reg = (instr & 7) as u8;
        let width = if byte_group { Width::Byte } else { Width::Word };
        let m = mask(width);
        let sign = sign_mask(width);

        match op {
            0o50 => {
                // CLR
                let operand = self.decode_operand(bus, mode, reg, width)?;
                self.write_operand(bus, operand, width, 0)?;
                self.regs.set_n(false);
                self.regs.set_z(true);
                self.regs.set_v(false);
                self.regs.set_c(false);
            }
            0o51 => {
                // COM
                let operand = self.decode_operand(bus, mode, reg, width)?;
                let result = !self.read_operand(bus, operand, width)? & m;
                self.write_operand(bus, operand, width, result)?;
                self.set_nz_clear_v(result, width);
                self.regs.set_c(true);
            }
            0o52 => {
                // INC
                let operand = self.decode_operand(bus, mode, reg, width)?;
                let old = self.read_operand(bus, operand, width)?;
                let result = old.wrapping_add(1) & m;
                self.write_operand(bus, operand, width, result)?;
                self.set_nz(result, width);
                self.regs.set_v(old == sign - 1);
            }
            0o53 => {
                // DEC
                let operand = self.decode_operand(bus, mode, reg, width)?;
                let old = self.read_operand(bus, operand, width)?;
                let result = old.wrapping_sub(1) & m;
                self.write_operand(bus, operand, width, result)?;
                self.set_nz(result, width);
                self.regs.set_v(old == sign);
            }
            0o54 => {
                // NEG
                let operand = self.decode_operand(bus, mode, reg, width)?;
                let old = self.read_operand(bus, operand, width)?;
                let result = old.wrapping_neg() & m;
                self.write_operand(bus, operand, width, result)?;
                self.set_nz(result, width);
                self.regs.set_v(result == sign);
                self.regs.set_c(result != 0);
            }
            0o55 => {
                // ADC
                let carry = u16::from(self.regs.c());
                let operand = self.decode_operand(bus, mode, reg, width)?;
                let old = self.read_operand(bus, operand, width)?;
                let result = old.wrapping_add(carry) & m;
                self.write_operand(bus, operand, width, result)?;
                self.set_nz(result, width);
                self.regs.set_v(old == sign - 1 && carry == 1);
                self.regs.set_c(old == m && carry == 1);
            }
            0o56 => {
                // SBC
                let carry = u16::from(self.regs.c());
                let operand = self.decode_operand(bus, mode, reg, width)?;
                let old = self.read_operand(bus, operand, width)?;
                let result = old.wrapping_sub(carry) & m;
                self.write_operand(bus, operand, width, result)?;
                self.set_nz(result, width);
                self.regs.set_v(old == sign);
                self.regs.set_c(old == 0 && carry == 1);
            }
            0o57 => {
                // TST
                let value = self.read_src(bus, mode, reg, width)?;
                self.set_nz_clear_v(value, width);
                self.regs.set_c(false);
            }
            0o60 => {
                // ROR: rotate right through carry
                let operand = self.decode_operand(bus, mode, reg, width)?;
                let old = self.read_operand(bus, operand, width)?;
                let result = ((old >> 1) | if self.regs.c() { sign } else { 0 }) & m;
                self.write_operand(bus, operand, width, result)?;
                self.rotate_flags(result, old & 1 != 0, width);
            }
            0o61 => {
                // ROL
                let operand = self.decode_operand(bus, mode, reg, width)?;
                let old = self.read_operand(bus, operand, width)?;
                let result = ((old << 1) | u16::from(self.regs.c())) & m;
                self.write_operand(bus, operand, width, result)?;
                self.rotate_flags(result, is_neg(old, width), width);
            }
            0o62 => {
                // ASR: arithmetic shift right
                let operand = self.decode_operand(bus, mode, reg, width)?;
                let old = self.read_operand(bus, operand, width)?;
                let result = ((old >> 1) | (old & sign)) & m;
                self.write_operand(bus, operand, width, result)?;
                self.rotate_flags(result, old & 1 != 0, width);
            }
            0o63 => {
                // ASL
                let operand = self.decode_operand(bus, mode, reg, width)?;
                let old = self.read_operand(bus, operand, width)?;
                let result = (old << 1) & m;
                self.write_operand(bus, operand, width, result)?;
                self.rotate_flags(result, is_neg(old, width), width);
            }
            0o64 if !byte_group => self.op_mark(bus, instr)?,
            0o65 => self.op_mfp(bus, instr, byte_group)?,
            0o66 => self.op_mtp(bus, instr, byte_group)?,
            0o67 if !byte_group => {
                // SXT
                let operand = self.decode_operand(bus, mode, reg, Width::Word)?;
                let result = if self.regs.n() { 0xffff } else { 0 };
                self.write_operand(bus, operand, Width::Word, result)?;
                self.regs.set_z(!self.regs.n());
                self.regs.set_v(false);
            }
            // 1064xx MTPS / 1067xx MFPS exist on smaller models only
            _ => return Err(Trap::new(TrapCause::ReservedInstruction)),
        }
        Ok(())
    }

    /// Common shift/rotate flag rule: N and Z from the result, C from the
    /// bit shifted out, V = N xor C.
    fn rotate_flags(&mut self, result: u16, carry: bool, width: Width) {
        self.set_nz(result, width);
        self.regs.set_c(carry);
        self.regs.set_v(self.regs.n() != self.regs.c());
    }

    fn op_mark<B: Pdp11Bus>(&mut self, bus: &mut B, instr: u16) -> Result<(), Trap> {
        let nn = instr & 0o77;
        self.regs.set(6, self.regs.pc.wrapping_add(nn * 2));
        self.regs.pc = self.regs.get(5);
        let value = self.pop(bus)?;
        self.regs.set(5, value);
        Ok(())
    }

    /// MFPI / MFPD: push a value from the previous mode's space.
    fn op_mfp<B: Pdp11Bus>(
        &mut self,
        bus: &mut B,
        instr: u16,
        from_d_space: bool,
    ) -> Result<(), Trap> {
        let mode = ((instr >> 3) & 7) as u8;
        let reg = (instr & 7) as u8;
        let space = if from_d_space { Space::D } else { Space::I };
        let operand = self.decode_operand(bus, mode, reg, Width::Word)?;
        let value = match operand {
            // Register reference: R6 resolves against the previous mode
            Operand::Reg(6) => self.regs.sp(self.regs.previous_mode()),
            Operand::Reg(r) => self.regs.get(r),
            Operand::Mem { addr, .. } => {
                bus.read(&mut self.regs, addr, Access::word(space).previous())?
            }
        };
        self.set_nz_clear_v(value, Width::Word);
        self.push(bus, value)
    }

    /// MTPI / MTPD: pop a value into the previous mode's space.
    fn op_mtp<B: Pdp11Bus>(
        &mut self,
        bus: &mut B,
        instr: u16,
        to_d_space: bool,
    ) -> Result<(), Trap> {
        let mode = ((instr >> 3) & 7) as u8;
        let reg = (instr & 7) as u8;
        let space = if to_d_space { Space::D } else { Space::I };
        let value = self.pop(bus)?;
        self.set_nz_clear_v(value, Width::Word);
        match self.decode_operand(bus, mode, reg, Width::Word)? {
            Operand::Reg(6) => {
                let previous = self.regs.previous_mode();
                self.regs.set_sp(previous, value);
                Ok(())
            }
            Operand::Reg(r) => {
                self.regs.set(r, value);
                Ok(())
            }
            Operand::Mem { addr, .. } => {
                bus.write(&mut self.regs, addr, value, Access::word(space).previous())
            }
        }
    }

    // === Branches ===

    /// Apply a branch: PC-relative, sign-extended 8-bit word displacement.
    fn branch(&mut self, instr: u16, taken: bool) {
        if taken {
            let offset = i16::from(instr as u8 as i8) * 2;
            self.regs.pc = self.regs.pc.wrapping_add(offset as u16);
        }
    }

    fn branch_word_set(&mut self, instr: u16) {
        let (n, z, v) = (self.regs.n(), self.regs.z(), self.regs.v());
        let taken = match (instr >> 8) & 7 {
            1 => true,         // BR
            2 => !z,           // BNE
            3 => z,            // BEQ
            4 => n == v,       // BGE
            5 => n != v,       // BLT
            6 => !z && n == v, // BGT
            _ => z || n != v,  // BLE
        };
        self.branch(instr, taken);
    }

    fn branch_byte_set(&mut self, instr: u16) {
        let (n, z, v, c) = (self.regs.n(), self.regs.z(), self.regs.v(), self.regs.c());
        let taken = match (instr >> 8) & 7 {
            0 => !n,       // BPL
            1 => n,        // BMI
            2 => !c && !z, // BHI
            3 => c || z,   // BLOS
            4 => !v,       // BVC
            5 => v,        // BVS
            6 => !c,       // BCC
            _ => c,        // BCS
        };
        self.branch(instr, taken);
    }
}

/// Decode the signed 6-bit shift count of ASH/ASHC.
const fn shift_count(src: u16) -> i16 {
    let count = (src & 0o77) as i16;
    if count >= 0o40 { count - 0o100 } else { count }
}
