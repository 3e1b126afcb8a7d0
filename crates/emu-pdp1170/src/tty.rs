//! DL11-style console terminal interface.
//!
//! Four registers: reader status/buffer (TKS/TKB) and puncher
//! status/buffer (TPS/TPB). Input arrives from the console
//! collaborator's reader thread; a byte latches TKS DONE and, with
//! interrupts enabled, raises vector 060 at level 4. Output prints
//! through the collaborator and raises vector 064.

use std::time::Duration;

use cpu_pdp11::InterruptQueue;
use tracing::trace;

use crate::console::Console;

pub const TTY_TKS: u16 = 0o177560;
pub const TTY_TKB: u16 = 0o177562;
pub const TTY_TPS: u16 = 0o177564;
pub const TTY_TPB: u16 = 0o177566;
pub const TTY_BASE: u16 = TTY_TKS;
pub const TTY_END: u16 = TTY_TPB + 2;

/// Status bit 7: done (reader) / ready (puncher).
const STATUS_DONE: u16 = 1 << 7;
/// Status bit 6: interrupt enable.
const STATUS_IE: u16 = 1 << 6;

/// Reader interrupt: level 4, vector 060.
const RX_VECTOR: u16 = 0o60;
/// Puncher interrupt: level 4, vector 064.
const TX_VECTOR: u16 = 0o64;
const TTY_LEVEL: u8 = 4;

/// The console TTY device.
pub struct Tty {
    registers: [u16; 4],
    console: Box<dyn Console>,
    irq: InterruptQueue,
}

impl Tty {
    #[must_use]
    pub fn new(console: Box<dyn Console>, irq: InterruptQueue) -> Self {
        let mut tty = Self {
            registers: [0; 4],
            console,
            irq,
        };
        tty.reset();
        tty
    }

    /// Bus reset: clear everything; the puncher comes up ready.
    pub fn reset(&mut self) {
        self.registers = [0, 0, STATUS_DONE, 0];
    }

    /// Poll the console for input. Called from the run loop; a new byte
    /// is only consumed once the program has read the previous one.
    pub fn poll_input(&mut self) {
        if self.registers[0] & STATUS_DONE != 0 {
            return;
        }
        if let Some(byte) = self.console.wait_for_char(Duration::ZERO) {
            trace!("TTY input byte {byte:#o}");
            self.registers[1] = u16::from(byte);
            self.registers[0] |= STATUS_DONE;
            if self.registers[0] & STATUS_IE != 0 {
                self.irq.queue(TTY_LEVEL, RX_VECTOR);
            }
        }
    }

    fn index(addr: u16) -> usize {
        usize::from((addr - TTY_BASE) >> 1) & 3
    }

    pub fn read_word(&mut self, addr: u16) -> u16 {
        match addr & !1 {
            TTY_TKB => {
                // Reading the buffer clears DONE
                let value = self.registers[1] & 0xff;
                self.registers[0] &= !STATUS_DONE;
                value
            }
            other => self.registers[Self::index(other)],
        }
    }

    pub fn read_byte(&mut self, addr: u16) -> u8 {
        let word = self.read_word(addr & !1);
        if addr & 1 != 0 {
            (word >> 8) as u8
        } else {
            word as u8
        }
    }

    pub fn write_word(&mut self, addr: u16, value: u16) {
        match addr & !1 {
            TTY_TKS => {
                let was_enabled = self.registers[0] & STATUS_IE != 0;
                self.registers[0] =
                    (self.registers[0] & !STATUS_IE) | (value & STATUS_IE);
                // Enabling interrupts with DONE already up fires one
                if !was_enabled
                    && self.registers[0] & (STATUS_IE | STATUS_DONE)
                        == STATUS_IE | STATUS_DONE
                {
                    self.irq.queue(TTY_LEVEL, RX_VECTOR);
                }
            }
            TTY_TPS => {
                let was_enabled = self.registers[2] & STATUS_IE != 0;
                self.registers[2] =
                    (self.registers[2] & !STATUS_IE) | (value & STATUS_IE);
                if !was_enabled
                    && self.registers[2] & (STATUS_IE | STATUS_DONE)
                        == STATUS_IE | STATUS_DONE
                {
                    self.irq.queue(TTY_LEVEL, TX_VECTOR);
                }
            }
            TTY_TPB => {
                self.registers[3] = value & 0xff;
                self.console.put_char(value as u8);
                // The transmit shift register empties immediately here:
                // READY drops and comes straight back
                self.registers[2] |= STATUS_DONE;
                if self.registers[2] & STATUS_IE != 0 {
                    self.irq.queue(TTY_LEVEL, TX_VECTOR);
                }
            }
            _ => {} // TKB is read-only
        }
    }

    pub fn write_byte(&mut self, addr: u16, value: u8) {
        // Registers are word-wide; byte writes read-modify-write
        let old = self.registers[Self::index(addr)];
        let merged = if addr & 1 != 0 {
            (old & 0x00ff) | (u16::from(value) << 8)
        } else {
            (old & 0xff00) | u16::from(value)
        };
        self.write_word(addr & !1, merged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::{ChannelConsole, OutputBuffer};

    fn tty() -> (Tty, std::sync::mpsc::SyncSender<u8>, OutputBuffer, InterruptQueue) {
        let buffer = OutputBuffer::new();
        let (console, tx) = ChannelConsole::new(Box::new(buffer.clone()));
        let irq = InterruptQueue::new();
        (Tty::new(Box::new(console), irq.clone()), tx, buffer, irq)
    }

    #[test]
    fn input_latches_done_and_interrupts() {
        let (mut tty, tx, _out, irq) = tty();
        tty.write_word(TTY_TKS, STATUS_IE);
        tx.send(b'A').expect("send");
        tty.poll_input();

        assert_ne!(tty.read_word(TTY_TKS) & STATUS_DONE, 0);
        assert_eq!(irq.take_pending(0), Some((4, 0o60)));

        // reading the buffer returns the byte and clears DONE
        assert_eq!(tty.read_word(TTY_TKB), u16::from(b'A'));
        assert_eq!(tty.read_word(TTY_TKS) & STATUS_DONE, 0);
    }

    #[test]
    fn second_byte_waits_for_reader() {
        let (mut tty, tx, _out, _irq) = tty();
        tx.send(b'x').expect("send");
        tx.send(b'y').expect("send");
        tty.poll_input();
        tty.poll_input(); // 'y' must stay queued
        assert_eq!(tty.read_word(TTY_TKB), u16::from(b'x'));
        tty.poll_input();
        assert_eq!(tty.read_word(TTY_TKB), u16::from(b'y'));
    }

    #[test]
    fn no_interrupt_without_ie() {
        let (mut tty, tx, _out, irq) = tty();
        tx.send(b'A').expect("send");
        tty.poll_input();
        assert_eq!(irq.take_pending(0), None);
    }

    #[test]
    fn enabling_ie_with_done_pending_fires() {
        let (mut tty, tx, _out, irq) = tty();
        tx.send(b'A').expect("send");
        tty.poll_input();
        assert_eq!(irq.take_pending(0), None);
        tty.write_word(TTY_TKS, STATUS_IE);
        assert_eq!(irq.take_pending(0), Some((4, 0o60)));
    }

    #[test]
    fn output_prints_and_interrupts() {
        let (mut tty, _tx, out, irq) = tty();
        tty.write_word(TTY_TPS, STATUS_IE);
        assert_eq!(irq.take_pending(0), Some((4, 0o64))); // ready was up

        tty.write_word(TTY_TPB, u16::from(b'Z'));
        assert_eq!(out.contents(), b"Z");
        assert_eq!(irq.take_pending(0), Some((4, 0o64)));
        assert_ne!(tty.read_word(TTY_TPS) & STATUS_DONE, 0);
    }

    #[test]
    fn byte_write_to_low_half_of_tpb_prints() {
        let (mut tty, _tx, out, _irq) = tty();
        tty.write_byte(TTY_TPB, b'Q');
        assert_eq!(out.contents(), b"Q");
    }

    #[test]
    fn reset_restores_idle_state() {
        let (mut tty, tx, _out, _irq) = tty();
        tx.send(b'A').expect("send");
        tty.poll_input();
        tty.reset();
        assert_eq!(tty.read_word(TTY_TKS), 0);
        assert_ne!(tty.read_word(TTY_TPS) & STATUS_DONE, 0);
    }
}
