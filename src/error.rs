// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::path::PathBuf;

use thiserror::Error;

/// Host-visible failure taxonomy (spec ERROR HANDLING DESIGN). Guest-visible
/// faults (serial device absent, disk channel errors) never reach this type;
/// they are written into the emulated address space instead.
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("ROM file not found: {path}")]
    RomNotFound { path: PathBuf },

    #[error("ROM file {path} has size {actual}, expected {expected}")]
    RomSizeMismatch {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("cartridge image too large: {actual} bytes, maximum is {max}")]
    CartridgeTooLarge { actual: usize, max: usize },

    #[error("PRG image too small to contain a load address")]
    PrgTooSmall,

    #[error("stack pointer left its 8-bit range")]
    StackOverflow,

    #[error("encountered JAM opcode 0x{opcode:02x} at 0x{pc:04x}")]
    Jam { opcode: u8, pc: u16 },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EmulatorError {
    /// The process exit code mapping named in the spec's external interfaces
    /// section. Only `main` consumes this; library embedders get `Result`.
    pub fn exit_code(&self) -> i32 {
        match self {
            EmulatorError::RomNotFound { .. }
            | EmulatorError::RomSizeMismatch { .. }
            | EmulatorError::Io { .. }
            | EmulatorError::Jam { .. }
            | EmulatorError::CartridgeTooLarge { .. }
            | EmulatorError::PrgTooSmall => 1,
            EmulatorError::StackOverflow => 2,
        }
    }
}
