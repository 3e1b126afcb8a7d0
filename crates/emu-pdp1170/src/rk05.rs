//! RK11 controller with RK05 drives.
//!
//! Seven registers: drive status, error, control/status, word count
//! (two's complement), bus address, disk address and data buffer. The
//! function field launches on the GO bit; transfers DMA straight into
//! physical memory in 512-byte sectors, advancing sector → surface →
//! cylinder. Completion raises vector 220 at level 5 with the drive
//! number latched into DS bits 13-15.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpu_pdp11::InterruptQueue;
use tracing::{debug, warn};

use crate::disk::DiskBackend;
use crate::memory::Memory;

pub const RK05_DS: u16 = 0o177400;
pub const RK05_ERROR: u16 = 0o177402;
pub const RK05_CS: u16 = 0o177404;
pub const RK05_WC: u16 = 0o177406;
pub const RK05_BA: u16 = 0o177410;
pub const RK05_DA: u16 = 0o177412;
pub const RK05_DATABUF: u16 = 0o177414;
pub const RK05_BASE: u16 = RK05_DS;
pub const RK05_END: u16 = RK05_DATABUF + 2;

const SECTOR_SIZE: u32 = 512;
const SECTORS_PER_TRACK: u16 = 12;

// Control/status register bits
const CS_GO: u16 = 1 << 0;
const CS_IE: u16 = 1 << 6;
const CS_CRDY: u16 = 1 << 7;
const CS_INHIBIT_BA: u16 = 1 << 11;
const CS_SEARCH_COMPLETE: u16 = 1 << 13;
const CS_HARD_ERROR: u16 = 1 << 14;
const CS_ERROR: u16 = 1 << 15;

/// Drive ready, DS bit 6.
const DS_DRIVE_READY: u16 = 1 << 6;

const RK05_LEVEL: u8 = 5;
const RK05_VECTOR: u16 = 0o220;

/// The RK11 controller and its attached drives.
pub struct Rk05 {
    registers: [u16; 7],
    drives: Vec<Box<dyn DiskBackend>>,
    irq: InterruptQueue,
    read_activity: Arc<AtomicBool>,
    write_activity: Arc<AtomicBool>,
}

impl Rk05 {
    #[must_use]
    pub fn new(
        irq: InterruptQueue,
        read_activity: Arc<AtomicBool>,
        write_activity: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registers: [0; 7],
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

    /// Controller reset: clear the register file.
    pub fn reset(&mut self) {
        self.registers = [0; 7];
    }

    fn index(addr: u16) -> usize {
        usize::from((addr - RK05_BASE) >> 1) % 7
    }

    pub fn read_word(&mut self, addr: u16) -> u16 {
        match addr & !1 {
            RK05_DS => {
                // Synthesize the healthy-drive status bits
                self.registers[0] |= 1 << 11 // drive on-line
                    | 1 << 8 // sector counter OK
                    | 1 << 7 // drive ready
                    | 1 << 6 // seek ready
                    | 1 << 4; // heads in position
                self.registers[0]
            }
            RK05_ERROR => 0,
            RK05_CS => {
                self.registers[2] &= !(CS_ERROR | CS_HARD_ERROR);
                self.registers[2] |= CS_CRDY;
                let value = self.registers[2];
                self.registers[2] &= !CS_GO;
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

    pub fn write_word(&mut self, addr: u16, value: u16, mem: &mut Memory) {
        let reg = Self::index(addr);
        self.registers[reg] = value;
        if addr & !1 == RK05_CS && value & CS_GO != 0 {
            self.execute_go(mem);
        }
    }

    /// Byte writes read-modify-write the full register.
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
        u32::from(self.registers[4]) | (u32::from((self.registers[2] >> 4) & 3) << 16)
    }

    fn advance_bus_address(&mut self, delta: u32) {
        let next = self.bus_address().wrapping_add(delta);
        self.registers[4] = next as u16;
        self.registers[2] =
            (self.registers[2] & !(3 << 4)) | ((((next >> 16) & 3) as u16) << 4);
    }

    fn execute_go(&mut self, mem: &mut Memory) {
        let cs = self.registers[2];
        let func = (cs >> 1) & 7;
        let da = self.registers[5];

        let mut sector = da & 15;
        let mut surface = (da >> 4) & 1;
        let mut cylinder = (da >> 5) & 255;
        let device = usize::from(da >> 13);
        let track = u32::from((da >> 4) & 511);

        let word_count = self.registers[3] as i16;
        let byte_count = u32::from(word_count.unsigned_abs()) * 2;
        let disk_offset =
            u64::from(track * u32::from(SECTORS_PER_TRACK) + u32::from(sector))
                * u64::from(SECTOR_SIZE);

        self.registers[2] &= !CS_SEARCH_COMPLETE;

        match func {
            0 => debug!("RK05 controller reset"),
            1 | 2 => {
                let writing = func == 1;
                if device >= self.drives.len() {
                    warn!("RK05 {} on missing drive {device}", if writing { "write" } else { "read" });
                    self.registers[2] |= CS_ERROR | CS_HARD_ERROR;
                } else {
                    let activity = if writing {
                        self.write_activity.clone()
                    } else {
                        self.read_activity.clone()
                    };
                    activity.store(true, Ordering::Relaxed);
                    debug!(
                        "RK05 drive {device} {} {byte_count} bytes, disk {disk_offset:o}, mem {:o}",
                        if writing { "write" } else { "read" },
                        self.bus_address(),
                    );

                    let inhibit = cs & CS_INHIBIT_BA != 0;
                    let mut remaining = byte_count;
                    let mut offset = disk_offset;
                    let mut mem_ptr = self.bus_address();
                    let mut buffer = [0u8; SECTOR_SIZE as usize];

                    while remaining > 0 {
                        let chunk = remaining.min(SECTOR_SIZE);
                        let drive = &mut self.drives[device];

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
                            drive.write(offset, &buffer, SECTOR_SIZE)
                        } else {
                            drive.read(offset, &mut buffer, SECTOR_SIZE).map(|()| {
                                for &byte in buffer.iter().take(chunk as usize) {
                                    if mem_ptr < mem.size() {
                                        mem.write_byte(mem_ptr, byte);
                                    }
                                    mem_ptr += 1;
                                }
                            })
                        };

                        if let Err(err) = result {
                            warn!("RK05 drive {device} transfer failed: {err}");
                            self.registers[2] |= CS_ERROR;
                            break;
                        }

                        offset += u64::from(chunk);
                        remaining -= chunk;
                        if !inhibit {
                            self.advance_bus_address(chunk);
                        }

                        sector += 1;
                        if sector >= SECTORS_PER_TRACK {
                            sector = 0;
                            surface += 1;
                            if surface >= 2 {
                                surface = 0;
                                cylinder += 1;
                            }
                        }
                    }

                    self.registers[5] =
                        sector | (surface << 4) | (cylinder << 5) | (da & 0o160000);
                    activity.store(false, Ordering::Relaxed);
                }
            }
            4 => {
                debug!("RK05 seek to {disk_offset:o}");
                self.registers[2] |= CS_SEARCH_COMPLETE;
            }
            7 => debug!("RK05 write lock"),
            _ => warn!("RK05 function {func} unhandled"),
        }

        self.registers[3] = 0;
        self.registers[0] |= DS_DRIVE_READY;
        self.registers[2] |= CS_CRDY;

        if cs & CS_IE != 0 {
            self.registers[0] =
                (self.registers[0] & !(7 << 13)) | ((device as u16) << 13);
            self.irq.queue(RK05_LEVEL, RK05_VECTOR);
        }
    }
}
