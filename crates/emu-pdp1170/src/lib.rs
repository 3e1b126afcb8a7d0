//! PDP-11/70 machine emulator ("kek").
//!
//! The CPU core lives in the `cpu-pdp11` crate; this crate supplies the
//! machine around it: physical memory, the MMU with dual I/D spaces,
//! the UNIBUS I/O page, the DL11 console interface, RK05 and RL02 disk
//! subsystems with pluggable backends, configuration, and the
//! bootstrap.

pub mod boot;
mod bus;
mod config;
pub mod console;
pub mod disk;
mod memory;
pub mod mmu;
mod pdp1170;
mod rk05;
mod rl02;
mod tty;

pub use bus::{IO_BASE, SystemBus};
pub use config::MachineConfig;
pub use console::{ChannelConsole, Console, OutputBuffer};
pub use disk::{DiskBackend, DiskError, FileBackend, RamBackend};
pub use memory::{DEFAULT_PAGES, Memory, PAGE_SIZE};
pub use mmu::Mmu;
pub use pdp1170::{MachineError, Pdp1170, RunOutcome};
pub use rk05::Rk05;
pub use rl02::Rl02;
pub use tty::Tty;
