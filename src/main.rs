// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::path::PathBuf;
use std::process;

use log::{info, warn};
use structopt::StructOpt;

use c64core::config::{MachineConfig, SystemModel};
use c64core::error::EmulatorError;
use c64core::machine::Machine;
use c64core::serial::DiskImage;

static NAME: &str = "c64core";

/// A minimal filesystem-backed disk: `read_file` looks for `name` (case
/// folded to lowercase, as PETSCII filenames arrive) under `root`. Real disk
/// image formats (D64, ...) are an external collaborator per the peripheral
/// bus's non-goals; this is only enough to LOAD a PRG by name off disk.
struct FsDiskImage {
    root: PathBuf,
}

impl DiskImage for FsDiskImage {
    fn read_file(&mut self, name: &str) -> Option<Vec<u8>> {
        std::fs::read(self.root.join(name.to_lowercase())).ok()
    }

    fn directory_entries(&self) -> Vec<String> {
        std::fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(StructOpt, Debug)]
#[structopt(name = "c64core")]
struct Opt {
    /// attach and autostart a PRG image
    #[structopt(parse(from_os_str))]
    image: Option<PathBuf>,

    /// set NTSC or PAL timing
    #[structopt(long, default_value = "pal")]
    model: SystemModel,

    /// filename of the basic ROM
    #[structopt(long, parse(from_os_str))]
    basic: Option<PathBuf>,
    /// filename of the kernal ROM
    #[structopt(long, parse(from_os_str))]
    kernal: Option<PathBuf>,
    /// filename of the character generator ROM
    #[structopt(long, parse(from_os_str))]
    chargen: Option<PathBuf>,

    /// attach a 32K cartridge image
    #[structopt(long, parse(from_os_str))]
    cartridge: Option<PathBuf>,
    /// autostart a PRG image (equivalent to the positional argument)
    #[structopt(long, parse(from_os_str))]
    prg: Option<PathBuf>,

    /// directory to resolve LOAD"name",8 filenames against
    #[structopt(long, parse(from_os_str), default_value = ".")]
    disk_dir: PathBuf,

    /// raise log verbosity (-v, -vv, -vvv); RUST_LOG overrides this for
    /// module-scoped tracing (cpu::ins, cpu::int, vic::reg, cia::reg, ...)
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
}

/// Sets a default `RUST_LOG` filter from `-v` count when the host hasn't
/// already picked one, then hands off to `env_logger`'s own parsing so a
/// real `RUST_LOG` (including per-target overrides) always wins.
fn init_logging(verbose: u8) {
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }
    env_logger::init();
}

fn build_config(opt: &Opt) -> MachineConfig {
    let mut config = MachineConfig { model: opt.model, ..MachineConfig::default() };
    if let Some(basic) = &opt.basic {
        config.roms.basic = basic.clone();
    }
    if let Some(kernal) = &opt.kernal {
        config.roms.kernal = kernal.clone();
    }
    if let Some(chargen) = &opt.chargen {
        config.roms.chargen = chargen.clone();
    }
    config.cartridge = opt.cartridge.clone();
    config.prg = opt.prg.clone().or_else(|| opt.image.clone());
    config
}

fn run(opt: &Opt) -> Result<(), EmulatorError> {
    let config = build_config(opt);
    let disk = FsDiskImage { root: opt.disk_dir.clone() };
    let mut machine = Machine::build(&config, disk)?;
    loop {
        if let Err(err) = machine.run_frame() {
            if let EmulatorError::Jam { pc, .. } = err {
                warn!(target: "main", "CPU JAM detected at {:#06x}", pc);
            }
            return Err(err);
        }
    }
}

fn main() {
    let opt = Opt::from_args();
    init_logging(opt.verbose);
    info!(target: "main", "starting {}", NAME);
    match run(&opt) {
        Ok(()) => process::exit(0),
        Err(err) => {
            eprintln!("Error: {}", err);
            process::exit(err.exit_code());
        }
    }
}
