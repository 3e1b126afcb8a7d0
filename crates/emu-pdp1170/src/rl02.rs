//! RL11 controller with RL02 cartridge drives.
//!
//! Four registers: control/status, bus address, disk address and
//! multipurpose. A function starts when the CS register is written with
//! controller-ready clear; data moves in 256-byte sectors, 40 sectors
//! per track, two heads. Completion raises vector 160 at level 5. Byte
//! writes to any register read-modify-write the full word.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpu_pdp11::InterruptQueue;
use tracing::{debug, warn};

use crate::disk::DiskBackend;
use crate::memory::Memory;

pub const RL02_CS: u16 = 0o174400;
pub const RL02_BA: u16 = 0o174402;
pub const RL02_DA: u16 = 0o174404;
pub const RL02_MP: u16 = 0o174406;
pub const RL02_BASE: u16 = RL02_CS;
pub const RL02_END: u16 = RL02_MP + 2;

const SECTOR_SIZE: u32 = 256;
const SECTORS_PER_TRACK: u16 = 40;

const CS_DRIVE_READY: u16 = 1 << 0;
const CS_IE: u16 = 1 << 6;
const CS_CRDY: u16 = 1 << 7;
const CS_ERROR: u16 = 1 << 15;

const RL02_LEVEL: u8 = 5;
const RL02_VECTOR: u16 = 0o160;

/// Get-status answer: lock-on, brush home, heads out, RL02 type.
const STATUS_WORD: u16 = 0o235;

/// The RL11 controller and its attached drives.
pub struct Rl02 {
    registers: [u16; 4],
    drives: Vec<Box<dyn DiskBackend>>,
    irq: InterruptQueue,
    read_activity: Arc<AtomicBool>,
    write_activity: Arc<AtomicBool>,
}

impl Rl02 {
    #[must_use]
    pub fn new(
        irq: InterruptQueue,
        read_activity: Arc<AtomicBool>,
        write_activity: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registers: [CS_CRDY | CS_DRIVE_READY, 0, 0, 0],
            drives: Vec::new(),
            irq,
            read_activity,
            write_activity,
        }
    }

    /// Attach a drive (already started by the machine).
    pub fn attach_drive(&mut self, backend: Box<dyn DiskBackend>) {
        self.drives.push(backend);
    }

    #[must_use]
    pub fn drive_count(&self) -> usize {
        self.drives.len()
    }

    pub fn reset(&mut self) {
        self.registers = [CS_CRDY | CS_DRIVE_READY, 0, 0, 0];
    }

    fn index(addr: u16) -> usize {
        usize::from((addr - RL02_BASE) >> 1) & 3
    }

    pub fn read_word(&mut self, addr: u16) -> u16 {
        self.registers[Self::index(addr)]
    }

    pub fn read_byte(&mut self, addr: u16) -> u8 {
        let word = self.read_word(addr & !1);
        if addr & 1 != 0 {
            (word >> 8) as u8
        } else {
            word as u8
        }
    }

    pub fn write_word(&mut self, addr: u16, value: u16, mem: &mut Memory) {
        let reg = Self::index(addr);
        self.registers[reg] = value;
        // Writing CS with controller-ready clear launches the function
        if addr & !1 == RL02_CS && value & CS_CRDY == 0 {
            self.execute(mem);
        }
    }

    /// Byte writes perform a word read-modify-write on the register.
    pub fn write_byte(&mut self, addr: u16, value: u8, mem: &mut Memory) {
        let old = self.registers[Self::index(addr)];
        let merged = if addr & 1 != 0 {
            (old & 0x00ff) | (u16::from(value) << 8)
        } else {
            (old & 0xff00) | u16::from(value)
        };
        self.write_word(addr & !1, merged, mem);
    }

    /// 18-bit DMA address: BA plus CS bits 4-5 on top.
    fn bus_address(&self) -> u32 {
        u32::from(self.registers[1]) | (u32::from((self.registers[0] >> 4) & 3) << 16)
    }

    fn advance_bus_address(&mut self, delta: u32) {
        let next = self.bus_address().wrapping_add(delta);
        self.registers[1] = next as u16;
        self.registers[0] =
            (self.registers[0] & !(3 << 4)) | ((((next >> 16) & 3) as u16) << 4);
    }

    fn execute(&mut self, mem: &mut Memory) {
        let cs = self.registers[0];
        let func = (cs >> 1) & 7;
        let drive = usize::from((cs >> 8) & 3);

        match func {
            0 => debug!("RL02 no-op"),
            2 => {
                debug!("RL02 get status, drive {drive}");
                self.registers[3] = STATUS_WORD;
            }
            3 => debug!("RL02 seek, drive {drive}"),
            5 | 6 => self.transfer(mem, drive, func == 5),
            _ => warn!("RL02 function {func} unhandled"),
        }

        self.registers[0] |= CS_CRDY | CS_DRIVE_READY;
        if cs & CS_IE != 0 {
            self.irq.queue(RL02_LEVEL, RL02_VECTOR);
        }
    }

    fn transfer(&mut self, mem: &mut Memory, drive: usize, writing: bool) {
        if drive >= self.drives.len() {
            warn!("RL02 transfer on missing drive {drive}");
            self.registers[0] |= CS_ERROR;
            return;
        }

        let da = self.registers[2];
        let mut sector = da & 0o77;
        let mut head = (da >> 6) & 1;
        let mut cylinder = (da >> 7) & 0o777;

        let word_count = self.registers[3] as i16;
        let mut remaining = u32::from(word_count.unsigned_abs()) * 2;
        let mut offset = u64::from(
            (u32::from(cylinder) * 2 + u32::from(head)) * u32::from(SECTORS_PER_TRACK)
                + u32::from(sector),
        ) * u64::from(SECTOR_SIZE);
        let mut mem_ptr = self.bus_address();

        let activity = if writing {
            self.write_activity.clone()
        } else {
            self.read_activity.clone()
        };
        activity.store(true, Ordering::Relaxed);
        debug!(
            "RL02 drive {drive} {} {remaining} bytes, disk {offset:o}, mem {mem_ptr:o}",
            if writing { "write" } else { "read" },
        );

        let mut buffer = [0u8; SECTOR_SIZE as usize];
        while remaining > 0 {
            let chunk = remaining.min(SECTOR_SIZE);
            let backend = &mut self.drives[drive];

            let result = if writing {
                buffer.fill(0);
                for slot in buffer.iter_mut().take(chunk as usize) {
                    *slot = if mem_ptr < mem.size() {
                        mem.read_byte(mem_ptr)
                    } else {
                        0
                    };
                    mem_ptr += 1;
                }
                backend.write(offset, &buffer, SECTOR_SIZE)
            } else {
                backend.read(offset, &mut buffer, SECTOR_SIZE).map(|()| {
                    for &byte in buffer.iter().take(chunk as usize) {
                        if mem_ptr < mem.size() {
                            mem.write_byte(mem_ptr, byte);
                        }
                        mem_ptr += 1;
                    }
                })
            };

            if let Err(err) = result {
                warn!("RL02 drive {drive} transfer failed: {err}");
                self.registers[0] |= CS_ERROR;
                break;
            }

            offset += u64::from(chunk);
            remaining -= chunk;
            self.advance_bus_address(chunk);

            sector += 1;
            if sector >= SECTORS_PER_TRACK {
                sector = 0;
                head += 1;
                if head >= 2 {
                    head = 0;
                    cylinder += 1;
                }
            }
        }

        self.registers[2] = sector | (head << 6) | (cylinder << 7);
        self.registers[3] = 0;
        activity.store(false, Ordering::Relaxed);
    }
}
