//! Disk backends for the RK05 and RL02 controllers.
//!
//! A backend is a flat byte store addressed by sector-aligned offsets.
//! With snapshots enabled, writes never touch the underlying store:
//! they are staged in an in-memory overlay keyed by sector index, and
//! reads consult the overlay first. Backend failures surface as device
//! error bits, never as emulator crashes.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Backend I/O failure, reported to the controller as an error bit.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("backend I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("unaligned transfer: offset {offset}, sector size {sector_size}")]
    Unaligned { offset: u64, sector_size: u32 },
    #[error("backend not started")]
    NotStarted,
}

/// A block-device backend.
///
/// Offsets are multiples of `sector_size`; transfer buffers are whole
/// sectors. `begin` opens the underlying store and selects snapshot
/// mode; it must succeed before any transfer.
pub trait DiskBackend: Send {
    /// Open the store. Returns false when the backend is unusable.
    fn begin(&mut self, snapshots: bool) -> bool;

    /// Read whole sectors starting at `offset`.
    fn read(&mut self, offset: u64, out: &mut [u8], sector_size: u32) -> Result<(), DiskError>;

    /// Write whole sectors starting at `offset`.
    fn write(&mut self, offset: u64, data: &[u8], sector_size: u32) -> Result<(), DiskError>;
}

/// Snapshot overlay: sector index → staged contents.
#[derive(Default)]
struct SectorOverlay {
    enabled: bool,
    sectors: BTreeMap<u64, Vec<u8>>,
}

impl SectorOverlay {
    /// Stage sectors in the overlay. Returns false when disabled.
    fn store(&mut self, offset: u64, data: &[u8], sector_size: u32) -> bool {
        if !self.enabled {
            return false;
        }
        let size = sector_size as usize;
        for (i, chunk) in data.chunks(size).enumerate() {
            let index = offset / u64::from(sector_size) + i as u64;
            let mut sector = vec![0; size];
            sector[..chunk.len()].copy_from_slice(chunk);
            self.sectors.insert(index, sector);
        }
        true
    }

    /// Staged contents of the sector at `offset`, if any.
    fn fetch(&self, offset: u64, sector_size: u32) -> Option<&[u8]> {
        if !self.enabled {
            return None;
        }
        self.sectors
            .get(&(offset / u64::from(sector_size)))
            .map(Vec::as_slice)
    }
}

fn check_aligned(offset: u64, sector_size: u32) -> Result<(), DiskError> {
    if sector_size == 0 || offset % u64::from(sector_size) != 0 {
        return Err(DiskError::Unaligned {
            offset,
            sector_size,
        });
    }
    Ok(())
}

// === Local file backend ===

/// A disk image in a local file.
pub struct FileBackend {
    path: PathBuf,
    file: Option<File>,
    overlay: SectorOverlay,
}

impl FileBackend {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            overlay: SectorOverlay::default(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DiskBackend for FileBackend {
    fn begin(&mut self, snapshots: bool) -> bool {
        // With snapshots the image is never written, open it read-only
        let result = OpenOptions::new()
            .read(true)
            .write(!snapshots)
            .open(&self.path);
        match result {
            Ok(file) => {
                self.file = Some(file);
                self.overlay.enabled = snapshots;
                debug!("disk image {:?} opened (snapshots: {snapshots})", self.path);
                true
            }
            Err(err) => {
                warn!("cannot open disk image {:?}: {err}", self.path);
                false
            }
        }
    }

    fn read(&mut self, offset: u64, out: &mut [u8], sector_size: u32) -> Result<(), DiskError> {
        check_aligned(offset, sector_size)?;
        let file = self.file.as_mut().ok_or(DiskError::NotStarted)?;
        let size = sector_size as usize;

        for (i, sector) in out.chunks_mut(size).enumerate() {
            let sector_offset = offset + (i * size) as u64;
            if let Some(staged) = self.overlay.fetch(sector_offset, sector_size) {
                sector.copy_from_slice(&staged[..sector.len()]);
                continue;
            }
            file.seek(SeekFrom::Start(sector_offset))?;
            // Reads past the end of a short image return zeroes
            let mut filled = 0;
            while filled < sector.len() {
                let n = file.read(&mut sector[filled..])?;
                if n == 0 {
                    sector[filled..].fill(0);
                    break;
                }
                filled += n;
            }
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8], sector_size: u32) -> Result<(), DiskError> {
        check_aligned(offset, sector_size)?;
        if self.overlay.store(offset, data, sector_size) {
            return Ok(());
        }
        let file = self.file.as_mut().ok_or(DiskError::NotStarted)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }
}

// === In-memory backend ===

/// A disk image held in memory: demo images and tests.
pub struct RamBackend {
    data: Vec<u8>,
    overlay: SectorOverlay,
    started: bool,
}

impl RamBackend {
    /// An empty image of the given size.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            overlay: SectorOverlay::default(),
            started: false,
        }
    }

    /// Wrap existing image bytes.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data,
            overlay: SectorOverlay::default(),
            started: false,
        }
    }

    /// The underlying bytes (staged overlay writes not included).
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl DiskBackend for RamBackend {
    fn begin(&mut self, snapshots: bool) -> bool {
        self.overlay.enabled = snapshots;
        self.started = true;
        true
    }

    fn read(&mut self, offset: u64, out: &mut [u8], sector_size: u32) -> Result<(), DiskError> {
        check_aligned(offset, sector_size)?;
        if !self.started {
            return Err(DiskError::NotStarted);
        }
        let size = sector_size as usize;
        for (i, sector) in out.chunks_mut(size).enumerate() {
            let sector_offset = offset + (i * size) as u64;
            if let Some(staged) = self.overlay.fetch(sector_offset, sector_size) {
                sector.copy_from_slice(&staged[..sector.len()]);
                continue;
            }
            let start = sector_offset as usize;
            for (j, byte) in sector.iter_mut().enumerate() {
                *byte = self.data.get(start + j).copied().unwrap_or(0);
            }
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8], sector_size: u32) -> Result<(), DiskError> {
        check_aligned(offset, sector_size)?;
        if !self.started {
            return Err(DiskError::NotStarted);
        }
        if self.overlay.store(offset, data, sector_size) {
            return Ok(());
        }
        let start = offset as usize;
        if start + data.len() > self.data.len() {
            self.data.resize(start + data.len(), 0);
        }
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}
