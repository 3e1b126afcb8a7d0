//! PDP-11/70 CPU core.
//!
//! An instruction-stepped interpreter for the full PDP-11 instruction
//! set: all eight addressing modes with byte/word duality, the EIS
//! group, traps, trace, stack limits, and prioritized interrupt
//! dispatch at instruction boundaries.
//!
//! The CPU owns the register file and the interrupt queue; everything
//! else — memory, MMU, devices — lives behind the [`Pdp11Bus`] trait.
//! Faults cross that seam as [`Trap`] values, never as unwinding.

mod alu;
pub mod bus;
mod cpu;
mod ea;
mod execute;
pub mod interrupt;
pub mod registers;

pub use bus::{Access, Pdp11Bus, RunMode, Space, Trap, TrapCause, Width, cpu_error};
pub use cpu::Pdp11;
pub use interrupt::InterruptQueue;
pub use registers::{Mode, Registers};
