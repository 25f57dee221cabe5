// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

// Spec: §5 Concurrency & Resource Model's owning aggregate, and §9 Design
// Notes's machine-wiring description. Grounded on the teacher's `C64`/
// `C64Factory` (zinc64-system/src/c64.rs, c64_factory.rs): one struct that
// owns every chip plus the two shared interrupt lines, builds them in
// dependency order (scheduler and lines first, chips next, fabric last so
// it can hold `Shared<dyn Addressable>` clones of the chips), and exposes
// reset/run_frame/step to a host instead of a `clock()`-per-cycle loop.

use std::path::Path;
use std::rc::Rc;

use crate::config::MachineConfig;
use crate::cpu::{self, Cpu};
use crate::device::{Cia, CiaMode, Joysticks, KeyCode, Keyboard, RenderLine, Vic};
use crate::error::EmulatorError;
use crate::mem::Fabric;
use crate::scheduler::Scheduler;
use crate::serial::{DiskImage, Serial, SerialBus};
use crate::util::{new_shared, IrqLine, Rom, Shared};

/// `IrqLine` source bit CIA1 and the VIC raster compare arbitrate over; CIA1
/// claims bit 0 internally (`Mode::Cia1`), so the VIC takes the next one.
const VIC_IRQ_SOURCE: usize = 1;

fn read_rom(path: &Path, expected_len: usize) -> Result<Vec<u8>, EmulatorError> {
    let bytes = std::fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            EmulatorError::RomNotFound { path: path.to_path_buf() }
        } else {
            EmulatorError::Io { path: path.to_path_buf(), source }
        }
    })?;
    if bytes.len() != expected_len {
        return Err(EmulatorError::RomSizeMismatch {
            path: path.to_path_buf(),
            expected: expected_len,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Loads the three fixed ROM images and applies the kernal patch (§4.3):
/// opcode $02 (JAM) is poked at each of the four kernal entry points the CPU
/// short-circuits, at their ROM-relative offsets (address - $E000).
fn load_roms(config: &MachineConfig) -> Result<(Rom, Rom, Rom), EmulatorError> {
    let basic = read_rom(&config.roms.basic, 0x2000)?;
    let mut kernal = read_rom(&config.roms.kernal, 0x2000)?;
    let chargen = read_rom(&config.roms.chargen, 0x1000)?;
    for &addr in cpu::KERNAL_PATCH_ADDRESSES.iter() {
        kernal[(addr - 0xe000) as usize] = 0x02;
    }
    Ok((Rom::new(basic, 0xa000), Rom::new(kernal, 0xe000), Rom::new(chargen, 0xd000)))
}

/// The owning aggregate: every chip, the scheduler, and the two shared
/// interrupt lines, wired together and driven one CPU instruction at a time.
/// `!Send`/`!Sync` falls out naturally from the `Rc<RefCell<_>>` wiring
/// (§5's ambient addition): a host that wants a background input thread
/// posts through a channel drained on the main thread instead of crossing
/// this struct directly.
pub struct Machine {
    cpu: Cpu,
    fabric: Shared<Fabric>,
    vic: Shared<Vic>,
    cia1: Shared<Cia>,
    cia2: Shared<Cia>,
    scheduler: Shared<Scheduler>,
    serial: Shared<dyn SerialBus>,
    keyboard: Keyboard,
    joysticks: Joysticks,
}

impl Machine {
    /// Builds a runnable machine from `config` and a disk-image collaborator
    /// for the serial bus. Fails if a ROM is missing, the wrong size, or (via
    /// `load_prg`/`load_cartridge` below) malformed.
    pub fn build<D: DiskImage + 'static>(config: &MachineConfig, disk: D) -> Result<Machine, EmulatorError> {
        let (basic, kernal, chargen) = load_roms(config)?;

        let scheduler = new_shared(Scheduler::new());
        let irq_line = new_shared(IrqLine::new("irq"));
        let nmi_line = new_shared(IrqLine::new("nmi"));

        let vic = Vic::new_shared(scheduler.clone(), irq_line.clone(), VIC_IRQ_SOURCE, config.model.timing());
        let cia1 = Cia::new_shared(CiaMode::Cia1, scheduler.clone(), irq_line.clone());
        let cia2 = Cia::new_shared(CiaMode::Cia2, scheduler.clone(), nmi_line.clone());

        let fabric = new_shared(Fabric::new(
            basic,
            kernal,
            chargen,
            vic.clone(),
            cia1.clone(),
            cia2.clone(),
        ));
        vic.borrow_mut().attach_fabric(Rc::downgrade(&fabric));

        let rows = new_shared([0xffu8; 8]);
        let joy1 = new_shared(0xffu8);
        let joy2 = new_shared(0xffu8);
        cia1.borrow_mut().attach_keyboard(rows.clone(), joy1.clone(), joy2.clone());
        let keyboard = Keyboard::new(rows);
        let joysticks = Joysticks::new(joy1, joy2);

        let serial: Shared<dyn SerialBus> = new_shared(Serial::new(disk));

        let mut cpu = Cpu::new(fabric.clone(), scheduler.clone(), irq_line, nmi_line);
        cpu.attach_serial(serial.clone());

        let mut machine = Machine {
            cpu,
            fabric,
            vic,
            cia1,
            cia2,
            scheduler,
            serial,
            keyboard,
            joysticks,
        };

        if let Some(path) = &config.cartridge {
            let bytes = std::fs::read(path).map_err(|source| EmulatorError::Io { path: path.clone(), source })?;
            machine.load_cartridge(&bytes)?;
        }
        if let Some(path) = &config.prg {
            let bytes = std::fs::read(path).map_err(|source| EmulatorError::Io { path: path.clone(), source })?;
            let load_address = machine.load_prg(&bytes)?;
            machine.cpu.set_pc(load_address);
        }

        Ok(machine)
    }

    /// Resets every chip and re-reads the CPU's reset vector. Does not
    /// reload ROMs, the cartridge, or the autostart PRG.
    pub fn reset(&mut self) {
        self.fabric.borrow_mut().reset();
        self.vic.borrow_mut().reset();
        self.cia1.borrow_mut().reset();
        self.cia2.borrow_mut().reset();
        self.cpu.reset();
    }

    /// Executes exactly one CPU instruction (or kernal patch, or JAM).
    pub fn step(&mut self) -> Result<(), EmulatorError> {
        self.cpu.step()
    }

    /// Runs until the VIC's frame counter advances, i.e. one full raster
    /// scan. Mirrors the teacher's `run_frame`: a host calling this in a
    /// loop gets one call site per presented frame regardless of how many
    /// CPU instructions that took.
    pub fn run_frame(&mut self) -> Result<(), EmulatorError> {
        let start = self.vic.borrow().frame_count();
        while self.vic.borrow().frame_count() == start {
            self.step()?;
        }
        Ok(())
    }

    pub fn frame_buffer(&self) -> std::cell::Ref<'_, [RenderLine]> {
        std::cell::Ref::map(self.vic.borrow(), |vic| vic.frame_buffer())
    }

    pub fn frame_count(&self) -> u64 {
        self.vic.borrow().frame_count()
    }

    pub fn press_key(&mut self, code: KeyCode) {
        self.keyboard.press(code);
    }

    pub fn release_key(&mut self, code: KeyCode) {
        self.keyboard.release(code);
    }

    pub fn type_char(&mut self, c: char) {
        self.keyboard.type_char(c);
    }

    pub fn joystick_down(&mut self, port: u8, mask: u8) {
        self.joysticks.select(port);
        self.joysticks.down(mask);
    }

    pub fn joystick_up(&mut self, port: u8, mask: u8) {
        self.joysticks.select(port);
        self.joysticks.up(mask);
    }

    /// Services the host restore-key button: an unconditional NMI, not a
    /// level held by a chip.
    pub fn trigger_nmi(&mut self) {
        self.cpu.trigger_nmi();
    }

    pub fn load_cartridge(&mut self, bytes: &[u8]) -> Result<(), EmulatorError> {
        self.fabric.borrow_mut().load_cartridge(bytes)
    }

    /// Loads a raw PRG image (2-byte little-endian load address, then data)
    /// and returns the address it was placed at.
    pub fn load_prg(&mut self, bytes: &[u8]) -> Result<u16, EmulatorError> {
        self.fabric.borrow_mut().load_prg(bytes)
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn serial(&self) -> &Shared<dyn SerialBus> {
        &self.serial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RomPaths, SystemModel};

    struct NoDisk;

    impl DiskImage for NoDisk {
        fn read_file(&mut self, _name: &str) -> Option<Vec<u8>> {
            None
        }
    }

    /// Writes a synthetic ROM triple under a unique temp directory: kernal
    /// resets into a tight NOP loop at $E000, basic/chargen are zero-filled.
    /// Good enough to exercise `Machine::build` end to end without a real
    /// C64 ROM dump.
    fn write_test_roms(suffix: &str) -> RomPaths {
        let dir = std::env::temp_dir().join(format!("c64core_test_{}", suffix));
        std::fs::create_dir_all(&dir).unwrap();

        let mut kernal = vec![0u8; 0x2000];
        kernal[0] = 0xea; // NOP at $E000
        kernal[0x1ffc] = 0x00; // reset vector low -> $E000
        kernal[0x1ffd] = 0xe0; // reset vector high
        let basic = vec![0u8; 0x2000];
        let chargen = vec![0u8; 0x1000];

        let paths = RomPaths {
            basic: dir.join("basic.rom"),
            kernal: dir.join("kernal.rom"),
            chargen: dir.join("chargen.rom"),
        };
        std::fs::write(&paths.basic, &basic).unwrap();
        std::fs::write(&paths.kernal, &kernal).unwrap();
        std::fs::write(&paths.chargen, &chargen).unwrap();
        paths
    }

    #[test]
    fn build_reads_the_reset_vector_and_steps_without_jamming() {
        let roms = write_test_roms("build_reads_reset_vector");
        let config = MachineConfig { model: SystemModel::Pal, roms, cartridge: None, prg: None };
        let mut machine = Machine::build(&config, NoDisk).unwrap();

        assert_eq!(0xe000, machine.cpu().pc());
        for _ in 0..10 {
            machine.step().unwrap();
        }
        assert_eq!(0xe00a, machine.cpu().pc());
    }

    #[test]
    fn kernal_patch_addresses_are_poked_with_jam() {
        let roms = write_test_roms("kernal_patch_addresses");
        let config = MachineConfig { model: SystemModel::Pal, roms, cartridge: None, prg: None };
        let machine = Machine::build(&config, NoDisk).unwrap();

        for &addr in cpu::KERNAL_PATCH_ADDRESSES.iter() {
            assert_eq!(0x02, machine.fabric.borrow().read(addr));
        }
    }

    #[test]
    fn missing_rom_file_is_reported() {
        let config = MachineConfig {
            model: SystemModel::Pal,
            roms: RomPaths {
                basic: std::path::PathBuf::from("/nonexistent/basic.rom"),
                kernal: std::path::PathBuf::from("/nonexistent/kernal.rom"),
                chargen: std::path::PathBuf::from("/nonexistent/chargen.rom"),
            },
            cartridge: None,
            prg: None,
        };
        let err = Machine::build(&config, NoDisk).unwrap_err();
        assert!(matches!(err, EmulatorError::RomNotFound { .. }));
    }

    #[test]
    fn wrong_size_rom_is_reported() {
        let dir = std::env::temp_dir().join("c64core_test_wrong_size_rom");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("basic.rom");
        std::fs::write(&path, vec![0u8; 10]).unwrap();

        let mut roms = write_test_roms("wrong_size_rom");
        roms.basic = path;
        let config = MachineConfig { model: SystemModel::Pal, roms, cartridge: None, prg: None };
        let err = Machine::build(&config, NoDisk).unwrap_err();
        assert!(matches!(err, EmulatorError::RomSizeMismatch { .. }));
    }
}
