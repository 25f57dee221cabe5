// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::path::PathBuf;

use crate::device::Timing;

/// PAL/NTSC selects the scheduler's cycles-per-line and lines-per-frame, not
/// a different chip set; everything else in the fabric is model-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemModel {
    Pal,
    Ntsc,
}

impl SystemModel {
    pub fn timing(self) -> Timing {
        match self {
            SystemModel::Pal => Timing::PAL,
            SystemModel::Ntsc => Timing::NTSC,
        }
    }
}

impl std::str::FromStr for SystemModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pal" => Ok(SystemModel::Pal),
            "ntsc" => Ok(SystemModel::Ntsc),
            other => Err(format!("unknown system model '{}', expected pal or ntsc", other)),
        }
    }
}

/// Where the three fixed ROM images live on disk.
#[derive(Debug, Clone)]
pub struct RomPaths {
    pub basic: PathBuf,
    pub kernal: PathBuf,
    pub chargen: PathBuf,
}

impl Default for RomPaths {
    fn default() -> Self {
        RomPaths {
            basic: PathBuf::from("res/basic.rom"),
            kernal: PathBuf::from("res/kernal.rom"),
            chargen: PathBuf::from("res/chargen.rom"),
        }
    }
}

/// Parsed-once machine configuration (spec DATA MODEL's "Machine config"
/// row). `Machine::build` consumes this plus a `DiskImage` to produce a
/// runnable instance.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub model: SystemModel,
    pub roms: RomPaths,
    pub cartridge: Option<PathBuf>,
    pub prg: Option<PathBuf>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            model: SystemModel::Pal,
            roms: RomPaths::default(),
            cartridge: None,
            prg: None,
        }
    }
}
