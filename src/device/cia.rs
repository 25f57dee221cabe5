// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

// Spec: §4.4/§4.4a CIA1/CIA2 units, grounded on zinc64-core/src/io/cia.rs's
// register map (PRA/PRB/DDRA/DDRB/TALO-TBHI/ICR/CRA/CRB) and bit layout, but
// restructured around the scheduler's deadline callbacks instead of the
// teacher's `Chip::clock()` called once per CPU cycle (see the scheduler
// entry in DESIGN.md for why: this crate charges cycles in bulk per
// instruction, so a timer's underflow is scheduled once, not polled on every
// tick). TOD (time-of-day) and the serial shift register are not modeled:
// the spec's data model names only the two down-counters, the IRQ mask, and
// the keyboard/joystick port, so TOD support would be invented scope.

use std::cell::{Cell, RefCell};
use std::rc::Weak;

use log::trace;

use crate::mem::Addressable;
use crate::scheduler::{Callback, Scheduler, Source};
use crate::util::{new_shared, IoPort, IrqLine, Shared};

pub mod reg {
    pub const PRA: u16 = 0x00;
    pub const PRB: u16 = 0x01;
    pub const DDRA: u16 = 0x02;
    pub const DDRB: u16 = 0x03;
    pub const TALO: u16 = 0x04;
    pub const TAHI: u16 = 0x05;
    pub const TBLO: u16 = 0x06;
    pub const TBHI: u16 = 0x07;
    pub const ICR: u16 = 0x0d;
    pub const CRA: u16 = 0x0e;
    pub const CRB: u16 = 0x0f;
}

const TIMER_A_IRQ: u8 = 0x01;
const TIMER_B_IRQ: u8 = 0x02;

/// CIA1 scans the keyboard/joystick matrix and drives the CPU's IRQ line;
/// CIA2's port A carries the serial ATN/CLOCK/DATA handshake plus (bits 0-1,
/// handled by `Fabric`, not here) the VIC bank select, and its timers drive
/// the CPU's NMI line instead of IRQ.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Cia1,
    Cia2,
}

/// A single 16-bit down-counter. `count` is the authoritative value whenever
/// the timer isn't actively registered with the scheduler; while running,
/// the live value is derived from `alarm - scheduler.clock()`.
struct Timer {
    latch: u16,
    count: u16,
    running: bool,
    one_shot: bool,
    alarm: i64,
}

impl Timer {
    fn new() -> Self {
        Timer {
            latch: 0xffff,
            count: 0xffff,
            running: false,
            one_shot: false,
            alarm: 0,
        }
    }
}

pub struct Cia {
    mode: Mode,
    port_a: IoPort,
    port_b: IoPort,
    timer_a: Timer,
    timer_b: Timer,
    irq_mask: u8,
    irq_data: Cell<u8>,

    scheduler: Shared<Scheduler>,
    irq_line: Shared<IrqLine>,
    irq_source: usize,
    source_a: Source,
    source_b: Source,

    keyboard_rows: Option<Shared<[u8; 8]>>,
    joy1: Option<Shared<u8>>,
    joy2: Option<Shared<u8>>,

    /// A weak handle back to this chip's own `Shared` wrapper, so a timer
    /// callback registered with the scheduler can call back into
    /// `on_timer_fire` without making the chip own a strong reference to
    /// itself (which would never be dropped).
    self_ref: Weak<RefCell<Cia>>,
}

impl Cia {
    /// Builds a CIA already wrapped in `Shared` so its own timer callbacks
    /// can close over a handle back to it (mirrors how the teacher's chips
    /// are constructed behind an `Rc<RefCell<_>>` for the same reason: a
    /// callback needs to reach mutable chip state that isn't the scheduler
    /// itself).
    pub fn new_shared(mode: Mode, scheduler: Shared<Scheduler>, irq_line: Shared<IrqLine>) -> Shared<Cia> {
        let (irq_source, source_a, source_b) = match mode {
            Mode::Cia1 => (0usize, Source::Timer1A, Source::Timer1B),
            Mode::Cia2 => (1usize, Source::Timer2A, Source::Timer2B),
        };
        let cia = new_shared(Cia {
            mode,
            port_a: IoPort::new(0x00, 0xff),
            port_b: IoPort::new(0x00, 0xff),
            timer_a: Timer::new(),
            timer_b: Timer::new(),
            irq_mask: 0,
            irq_data: Cell::new(0),
            scheduler,
            irq_line,
            irq_source,
            source_a,
            source_b,
            keyboard_rows: None,
            joy1: None,
            joy2: None,
            self_ref: Weak::new(),
        });
        cia.borrow_mut().self_ref = std::rc::Rc::downgrade(&cia);
        cia.borrow_mut().reset();
        cia
    }

    /// Wires CIA1's keyboard matrix and both joystick state bytes. CIA2 has
    /// no keyboard/joystick role and leaves these unset.
    pub fn attach_keyboard(&mut self, rows: Shared<[u8; 8]>, joy1: Shared<u8>, joy2: Shared<u8>) {
        self.keyboard_rows = Some(rows);
        self.joy1 = Some(joy1);
        self.joy2 = Some(joy2);
    }

    pub fn reset(&mut self) {
        self.port_a.reset();
        self.port_b.reset();
        self.timer_a = Timer::new();
        self.timer_b = Timer::new();
        self.irq_mask = 0;
        self.irq_data.set(0);
        self.scheduler.borrow_mut().cancel(self.source_a);
        self.scheduler.borrow_mut().cancel(self.source_b);
        self.irq_line.borrow_mut().set_low(self.irq_source, false);
    }

    /// ANDs together the keyboard rows whose column bit is 0 in
    /// `column_mask`, per §4.4. No keyboard attached (CIA2) always reads
    /// all-ones.
    fn scan_rows(&self, column_mask: u8) -> u8 {
        match &self.keyboard_rows {
            Some(rows) => {
                let rows = rows.borrow();
                let mut result = 0xffu8;
                for col in 0..8 {
                    if column_mask & (1 << col) == 0 {
                        result &= rows[col];
                    }
                }
                result
            }
            None => 0xff,
        }
    }

    fn joy1_state(&self) -> u8 {
        self.joy1.as_ref().map_or(0xff, |j| *j.borrow())
    }

    fn joy2_state(&self) -> u8 {
        self.joy2.as_ref().map_or(0xff, |j| *j.borrow())
    }

    fn read_port_a(&self) -> u8 {
        match self.mode {
            // columns = `data | ~DDRA`, which is exactly what IoPort::get_value
            // already computes since unused input bits float to 0xff.
            Mode::Cia1 => self.port_a.get_value() & self.joy2_state(),
            Mode::Cia2 => self.port_a.get_value(),
        }
    }

    fn read_port_b(&self) -> u8 {
        match self.mode {
            Mode::Cia1 => {
                let columns = self.port_a.get_value();
                let rows = self.scan_rows(columns) & self.joy1_state();
                self.port_b.get_value_with_input(rows)
            }
            Mode::Cia2 => self.port_b.get_value(),
        }
    }

    fn timer_value(&self, is_a: bool) -> u16 {
        let timer = if is_a { &self.timer_a } else { &self.timer_b };
        if timer.running {
            (timer.alarm - self.scheduler.borrow().clock()).max(0) as u16
        } else {
            timer.count
        }
    }

    fn write_latch_lo(&mut self, is_a: bool, value: u8) {
        let timer = if is_a { &mut self.timer_a } else { &mut self.timer_b };
        timer.latch = (timer.latch & 0xff00) | u16::from(value);
    }

    fn write_latch_hi(&mut self, is_a: bool, value: u8) {
        let timer = if is_a { &mut self.timer_a } else { &mut self.timer_b };
        timer.latch = (timer.latch & 0x00ff) | (u16::from(value) << 8);
        if !timer.running {
            timer.count = timer.latch;
        }
    }

    fn write_control(&mut self, is_a: bool, value: u8) {
        let start = value & 0x01 != 0;
        let one_shot = value & 0x08 != 0;
        let force_load = value & 0x10 != 0;

        {
            let timer = if is_a { &mut self.timer_a } else { &mut self.timer_b };
            timer.one_shot = one_shot;
            if force_load {
                timer.count = timer.latch;
            }
        }

        let was_running = if is_a { self.timer_a.running } else { self.timer_b.running };
        if start && (!was_running || force_load) {
            self.start_timer(is_a);
        } else if !start && was_running {
            self.stop_timer(is_a);
        }
    }

    fn start_timer(&mut self, is_a: bool) {
        let now = self.scheduler.borrow().clock();
        let count = if is_a { self.timer_a.count } else { self.timer_b.count };
        let alarm = now + i64::from(count.max(1));
        let timer = if is_a { &mut self.timer_a } else { &mut self.timer_b };
        timer.alarm = alarm;
        timer.running = true;
        self.register_alarm(is_a, alarm);
    }

    fn stop_timer(&mut self, is_a: bool) {
        let value = self.timer_value(is_a);
        let source = if is_a { self.source_a } else { self.source_b };
        let timer = if is_a { &mut self.timer_a } else { &mut self.timer_b };
        timer.count = value;
        timer.running = false;
        self.scheduler.borrow_mut().cancel(source);
    }

    /// Builds the boxed closure a timer deadline fires: upgrades `self_ref`
    /// and calls back into `on_timer_fire`. Shared by `register_alarm` (the
    /// normal, non-reentrant path, reached from a register write) and
    /// `on_timer_fire` itself when a continuous timer re-arms from inside a
    /// callback already running under `Scheduler::drain`.
    fn build_callback(self_ref: Weak<RefCell<Cia>>, is_a: bool) -> Callback {
        Box::new(move |scheduler: &mut Scheduler| {
            if let Some(cia) = self_ref.upgrade() {
                cia.borrow_mut().on_timer_fire(scheduler, is_a);
            }
        })
    }

    /// Registers the scheduler callback that fires the timer's underflow.
    /// Only called from `start_timer`/`write_control`, which run outside of
    /// `Scheduler::drain`, so borrowing `self.scheduler` here is safe; a
    /// re-arm triggered from inside a firing callback instead goes through
    /// `on_timer_fire`'s `scheduler` parameter, since that call is already
    /// nested inside a live `borrow_mut` on the same `RefCell`.
    fn register_alarm(&mut self, is_a: bool, alarm: i64) {
        let callback = Self::build_callback(self.self_ref.clone(), is_a);
        let source = if is_a { self.source_a } else { self.source_b };
        self.scheduler.borrow_mut().register(source, Some(callback), alarm);
    }

    /// Fires from inside `Scheduler::drain`, so `scheduler` is the live
    /// `&mut Scheduler` the drain loop is holding — re-arming a continuous
    /// timer must register through it directly rather than via
    /// `self.scheduler.borrow_mut()`, which would double-borrow the same
    /// `RefCell` and panic.
    fn on_timer_fire(&mut self, scheduler: &mut Scheduler, is_a: bool) {
        let (latch, one_shot, prev_alarm) = {
            let timer = if is_a { &self.timer_a } else { &self.timer_b };
            (timer.latch, timer.one_shot, timer.alarm)
        };
        if one_shot {
            let timer = if is_a { &mut self.timer_a } else { &mut self.timer_b };
            timer.count = latch;
            timer.running = false;
        } else {
            let next_alarm = prev_alarm + i64::from(latch.max(1));
            {
                let timer = if is_a { &mut self.timer_a } else { &mut self.timer_b };
                timer.alarm = next_alarm;
            }
            let source = if is_a { self.source_a } else { self.source_b };
            let callback = Self::build_callback(self.self_ref.clone(), is_a);
            scheduler.register(source, Some(callback), next_alarm);
        }
        self.signal_irq(if is_a { TIMER_A_IRQ } else { TIMER_B_IRQ });
    }

    fn signal_irq(&self, bit: u8) {
        let data = self.irq_data.get() | bit;
        self.irq_data.set(data);
        if self.irq_mask & bit != 0 {
            self.irq_data.set(data | 0x80);
            self.irq_line.borrow_mut().set_low(self.irq_source, true);
            trace!(target: "cia::reg", "irq raised, bit {:#04x}", bit);
        }
    }

    fn read_icr(&self) -> u8 {
        let value = self.irq_data.get();
        self.irq_data.set(0);
        self.irq_line.borrow_mut().set_low(self.irq_source, false);
        value
    }

    fn write_icr(&mut self, value: u8) {
        let bits = value & 0x7f;
        if value & 0x80 != 0 {
            self.irq_mask |= bits;
        } else {
            self.irq_mask &= !bits;
        }
    }

    fn control_byte(&self, is_a: bool) -> u8 {
        let timer = if is_a { &self.timer_a } else { &self.timer_b };
        let mut value = 0u8;
        if timer.running {
            value |= 0x01;
        }
        if timer.one_shot {
            value |= 0x08;
        }
        value
    }
}

impl Addressable for Cia {
    fn read(&self, address: u16) -> u8 {
        let value = match address & 0x0f {
            reg::PRA => self.read_port_a(),
            reg::PRB => self.read_port_b(),
            reg::DDRA => self.port_a.get_direction(),
            reg::DDRB => self.port_b.get_direction(),
            reg::TALO => (self.timer_value(true) & 0xff) as u8,
            reg::TAHI => (self.timer_value(true) >> 8) as u8,
            reg::TBLO => (self.timer_value(false) & 0xff) as u8,
            reg::TBHI => (self.timer_value(false) >> 8) as u8,
            reg::ICR => self.read_icr(),
            reg::CRA => self.control_byte(true),
            reg::CRB => self.control_byte(false),
            _ => 0,
        };
        trace!(target: "cia::reg", "read ${:02x} = {:02x}", address & 0x0f, value);
        value
    }

    fn write(&mut self, address: u16, value: u8) {
        trace!(target: "cia::reg", "write ${:02x} = {:02x}", address & 0x0f, value);
        match address & 0x0f {
            reg::PRA => self.port_a.set_value(value),
            reg::PRB => self.port_b.set_value(value),
            reg::DDRA => self.port_a.set_direction(value),
            reg::DDRB => self.port_b.set_direction(value),
            reg::TALO => self.write_latch_lo(true, value),
            reg::TAHI => self.write_latch_hi(true, value),
            reg::TBLO => self.write_latch_lo(false, value),
            reg::TBHI => self.write_latch_hi(false, value),
            reg::ICR => self.write_icr(value),
            reg::CRA => self.write_control(true, value),
            reg::CRB => self.write_control(false, value),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::new_shared;

    fn setup(mode: Mode) -> (Shared<Cia>, Shared<Scheduler>, Shared<IrqLine>) {
        let scheduler = new_shared(Scheduler::new());
        let irq_line = new_shared(IrqLine::new("test"));
        let cia = Cia::new_shared(mode, scheduler.clone(), irq_line.clone());
        (cia, scheduler, irq_line)
    }

    #[test]
    fn port_a_write_is_read_back_through_direction() {
        let (cia, ..) = setup(Mode::Cia2);
        cia.borrow_mut().write(0xdd02, 0xff);
        cia.borrow_mut().write(0xdd00, 0x3c);
        assert_eq!(0x3c, cia.borrow().read(0xdd00));
    }

    #[test]
    fn keyboard_matrix_is_scanned_through_port_a_columns() {
        let (cia, ..) = setup(Mode::Cia1);
        let rows = new_shared([0xff; 8]);
        let joy1 = new_shared(0xffu8);
        let joy2 = new_shared(0xffu8);
        rows.borrow_mut()[1] = 0xfb; // row 1, column 2 pressed (KeyCode::A)
        cia.borrow_mut().attach_keyboard(rows, joy1, joy2);
        cia.borrow_mut().write(0xdc02, 0xff); // DDRA all outputs
        cia.borrow_mut().write(0xdc00, !(1 << 1)); // drive column 1 low
        assert_eq!(0xfb, cia.borrow().read(0xdc01));
    }

    #[test]
    fn starting_timer_a_registers_a_scheduler_deadline() {
        let (cia, scheduler, _irq) = setup(Mode::Cia1);
        cia.borrow_mut().write(0xdc04, 0x10); // TALO
        cia.borrow_mut().write(0xdc05, 0x00); // TAHI -> latch = 0x0010
        cia.borrow_mut().write(0xdc0e, 0x01); // CRA: start, continuous
        assert!(scheduler.borrow().is_active(Source::Timer1A));
        assert_eq!(0x10, scheduler.borrow().time_left());
    }

    #[test]
    fn timer_underflow_reloads_and_raises_irq_when_unmasked() {
        let (cia, scheduler, irq_line) = setup(Mode::Cia1);
        cia.borrow_mut().write(0xdc04, 0x05);
        cia.borrow_mut().write(0xdc05, 0x00);
        cia.borrow_mut().write(0xdc0d, 0x81); // unmask timer A
        cia.borrow_mut().write(0xdc0e, 0x01); // start, continuous
        scheduler.borrow_mut().advance(5);
        scheduler.borrow_mut().drain();
        assert!(irq_line.borrow().is_low());
        let icr = cia.borrow().read(0xdc0d);
        assert_eq!(0x81, icr);
        // Reading ICR acks the line and clears the pending data.
        assert!(!irq_line.borrow().is_low());
        assert_eq!(0x00, cia.borrow().read(0xdc0d));
        // Continuous mode re-arms for another 5 cycles.
        assert!(scheduler.borrow().is_active(Source::Timer1A));
    }

    #[test]
    fn one_shot_timer_does_not_rearm_after_firing() {
        let (cia, scheduler, _irq) = setup(Mode::Cia2);
        cia.borrow_mut().write(0xdd06, 0x03); // TBLO
        cia.borrow_mut().write(0xdd07, 0x00);
        cia.borrow_mut().write(0xdd0f, 0x09); // CRB: start, one-shot
        scheduler.borrow_mut().advance(3);
        scheduler.borrow_mut().drain();
        assert!(!scheduler.borrow().is_active(Source::Timer2B));
        assert_eq!(0, cia.borrow().read(0xdd0f) & 0x01);
    }

    #[test]
    fn stopping_a_running_timer_snapshots_the_remaining_count() {
        let (cia, scheduler, _irq) = setup(Mode::Cia1);
        cia.borrow_mut().write(0xdc04, 0x64); // latch = 100
        cia.borrow_mut().write(0xdc05, 0x00);
        cia.borrow_mut().write(0xdc0e, 0x01);
        scheduler.borrow_mut().advance(40);
        cia.borrow_mut().write(0xdc0e, 0x00); // stop
        assert!(!scheduler.borrow().is_active(Source::Timer1A));
        let lo = cia.borrow().read(0xdc04);
        let hi = cia.borrow().read(0xdc05);
        assert_eq!(60, u16::from(lo) | (u16::from(hi) << 8));
    }

    #[test]
    fn cia2_timer_drives_a_separate_irq_source_than_cia1() {
        let scheduler = new_shared(Scheduler::new());
        let irq_line = new_shared(IrqLine::new("nmi"));
        let cia1 = Cia::new_shared(Mode::Cia1, scheduler.clone(), irq_line.clone());
        let cia2 = Cia::new_shared(Mode::Cia2, scheduler.clone(), irq_line.clone());
        cia2.borrow_mut().write(0xdd04, 0x01);
        cia2.borrow_mut().write(0xdd05, 0x00);
        cia2.borrow_mut().write(0xdd0d, 0x81);
        cia2.borrow_mut().write(0xdd0e, 0x01);
        scheduler.borrow_mut().advance(1);
        scheduler.borrow_mut().drain();
        assert!(irq_line.borrow().is_low());
        assert_eq!(0x00, cia1.borrow().read(0xdc0d), "CIA1's ICR is unaffected by CIA2's timer");
    }
}
