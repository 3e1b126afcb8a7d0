//! Machine configuration, persisted as JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::memory::DEFAULT_PAGES;

/// Everything needed to assemble a machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Physical memory size in 8 KiB pages.
    pub memory_pages: u32,
    /// RK05 disk images, drive 0 first.
    pub rk05_images: Vec<PathBuf>,
    /// RL02 disk images, drive 0 first.
    pub rl02_images: Vec<PathBuf>,
    /// Stage disk writes in memory instead of touching the images.
    pub snapshots: bool,
    /// Initial PC; defaults to the bootstrap when a disk is present.
    pub start_address: Option<u16>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_pages: DEFAULT_PAGES,
            rk05_images: Vec::new(),
            rl02_images: Vec::new(),
            snapshots: false,
            start_address: None,
        }
    }
}

impl MachineConfig {
    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| format!("cannot read {}: {err}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|err| format!("cannot parse {}: {err}", path.display()))
    }

    /// Write the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), String> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self)
            .map_err(|err| format!("cannot serialize config: {err}"))?;
        std::fs::write(path, raw)
            .map_err(|err| format!("cannot write {}: {err}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = MachineConfig::default();
        assert_eq!(config.memory_pages, 30);
        assert!(config.rk05_images.is_empty());
        assert!(!config.snapshots);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("machine.json");

        let config = MachineConfig {
            memory_pages: 12,
            rk05_images: vec![PathBuf::from("unix.rk")],
            rl02_images: Vec::new(),
            snapshots: true,
            start_address: Some(0o1000),
        };
        config.save(&path).expect("save");

        let back = MachineConfig::load(&path).expect("load");
        assert_eq!(back.memory_pages, 12);
        assert_eq!(back.rk05_images, vec![PathBuf::from("unix.rk")]);
        assert!(back.snapshots);
        assert_eq!(back.start_address, Some(0o1000));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: MachineConfig =
            serde_json::from_str(r#"{"memory_pages": 16}"#).expect("parse");
        assert_eq!(config.memory_pages, 16);
        assert!(config.rk05_images.is_empty());
        assert_eq!(config.start_address, None);
    }
}
