// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

// Spec: §4.5 VIC-II. The 47-register file ($D000-$D02E) and its bit-packing
// conventions are grounded on the teacher's old monolithic
// `src/video/vic.rs` (`Reg`, `Mode`, `Sprite`), including its explicit
// `// DEFERRED collision` note on $D01E/$D01F, which confirms the teacher
// never wired sprite collision at all. Per Open Question #2 (DESIGN.md),
// this module closes that gap rather than carrying the deferral forward.
// The per-raster rendering pipeline (bad lines, the twelve display modes,
// sprite fetch, collision) has no teacher analogue and is built directly
// against §4.5's seven-step algorithm, reusing the `Weak<RefCell<_>>`
// self-reference scheduler-callback pattern established in `device::cia`.

use std::cell::{Cell, RefCell};
use std::rc::Weak;

use log::trace;

use crate::mem::{Addressable, Fabric};
use crate::scheduler::{Callback, Scheduler, Source};
use crate::util::{new_shared, IrqLine, Shared};

pub mod reg {
    pub const MX8: u16 = 0x10;
    pub const CR1: u16 = 0x11;
    pub const RASTER: u16 = 0x12;
    pub const LPX: u16 = 0x13;
    pub const LPY: u16 = 0x14;
    pub const ME: u16 = 0x15;
    pub const CR2: u16 = 0x16;
    pub const MYE: u16 = 0x17;
    pub const MEMPTR: u16 = 0x18;
    pub const IRR: u16 = 0x19;
    pub const IMR: u16 = 0x1a;
    pub const MDP: u16 = 0x1b;
    pub const MMC: u16 = 0x1c;
    pub const MXE: u16 = 0x1d;
    pub const MM: u16 = 0x1e;
    pub const MD: u16 = 0x1f;
    pub const EC: u16 = 0x20;
    pub const B0C: u16 = 0x21;
    pub const B3C: u16 = 0x24;
    pub const MM0: u16 = 0x25;
    pub const MM1: u16 = 0x26;
    pub const M0C: u16 = 0x27;
    pub const M7C: u16 = 0x2e;
}

/// Cycles-per-line/lines-per-frame pair the scheduler's raster cadence runs
/// on. §8's bad-line cycle-total scenario (312x63 + 25x40) is PAL timing.
#[derive(Clone, Copy)]
pub struct Timing {
    pub cycles_per_line: i64,
    pub lines_per_frame: u16,
}

impl Timing {
    pub const PAL: Timing = Timing {
        cycles_per_line: 63,
        lines_per_frame: 312,
    };
    pub const NTSC: Timing = Timing {
        cycles_per_line: 65,
        lines_per_frame: 263,
    };
}

/// One fetched 8-pixel column: a raw bit pattern plus up to four candidate
/// colors. Hi-res modes only ever populate `colors[0]` (bit clear) and
/// `colors[1]` (bit set); multicolor modes use all four, two bits per pixel.
#[derive(Clone, Copy, Default)]
pub struct Block {
    pub bits: u8,
    pub colors: [u8; 4],
    pub multicolor: bool,
}

/// A sprite's 24-bit row pattern plus the rendering attributes the
/// presenter needs to turn it into pixels.
#[derive(Clone, Copy)]
pub struct SpriteWord {
    pub bits: u32,
    pub color: u8,
    pub priority: bool,
    pub multicolor: bool,
    pub expand_x: bool,
}

/// One scanline's worth of fetched output, published by the redraw
/// callback. `sprites[i]` is `None` when sprite `i` isn't enabled or isn't
/// within its 21-line window on this raster.
#[derive(Clone)]
pub struct RenderLine {
    pub raster: u16,
    pub blank: bool,
    pub blocks: [Block; 40],
    pub sprites: [Option<(u16, SpriteWord)>; 8],
    pub border_color: u8,
    pub background_color: [u8; 4],
    pub csel: bool,
    pub scroll_x: u8,
}

impl RenderLine {
    fn blank_at(raster: u16) -> RenderLine {
        RenderLine {
            raster,
            blank: true,
            blocks: [Block::default(); 40],
            sprites: [None, None, None, None, None, None, None, None],
            border_color: 0,
            background_color: [0; 4],
            csel: true,
            scroll_x: 0,
        }
    }
}

enum FetchMode {
    Idle,
    Character,
    ExtColor,
    Bitmap,
    Invalid,
}

fn fetch_mode(idle: bool, ecm: bool, bmm: bool) -> FetchMode {
    if idle {
        return FetchMode::Idle;
    }
    match (ecm, bmm) {
        (false, false) => FetchMode::Character,
        (true, false) => FetchMode::ExtColor,
        (false, true) => FetchMode::Bitmap,
        (true, true) => FetchMode::Invalid,
    }
}

fn pack_bits(flags: &[bool; 8]) -> u8 {
    let mut value = 0u8;
    for (i, &set) in flags.iter().enumerate() {
        if set {
            value |= 1 << i;
        }
    }
    value
}

fn unpack_bits(flags: &mut [bool; 8], value: u8) {
    for (i, slot) in flags.iter_mut().enumerate() {
        *slot = value & (1 << i) != 0;
    }
}

/// Absolute horizontal pixel columns a fetched sprite row occupies, used
/// only to test two sprites' footprints for overlap. Multicolor sprites
/// spend two bits per "double-wide" pixel; x-expansion doubles every
/// column again.
fn opaque_columns(x: u16, word: &SpriteWord) -> Vec<u16> {
    let mut columns = Vec::new();
    let width: u16 = if word.expand_x { 2 } else { 1 };
    if word.multicolor {
        for pair in 0..12u16 {
            let shift = 22 - pair * 2;
            if (word.bits >> shift) & 0b11 != 0 {
                let base = x + pair * 2 * width;
                for w in 0..2 * width {
                    columns.push(base + w);
                }
            }
        }
    } else {
        for bit in 0..24u16 {
            let shift = 23 - bit;
            if (word.bits >> shift) & 1 != 0 {
                let base = x + bit * width;
                for w in 0..width {
                    columns.push(base + w);
                }
            }
        }
    }
    columns
}

pub struct Vic {
    sprite_x: [u16; 8],
    sprite_y: [u8; 8],
    sprite_enabled: [bool; 8],
    sprite_expand_x: [bool; 8],
    sprite_expand_y: [bool; 8],
    sprite_multicolor: [bool; 8],
    sprite_priority: [bool; 8],
    sprite_color: [u8; 8],
    mob_multicolor: [u8; 2],

    raster_compare: u16,
    ecm: bool,
    bmm: bool,
    den: bool,
    rsel: bool,
    mcm: bool,
    csel: bool,
    scroll_x: u8,
    scroll_y: u8,
    mem_ptr: u8,

    irq_status: u8,
    irq_enable: u8,

    border_color: u8,
    background_color: [u8; 4],
    light_pen_x: u8,
    light_pen_y: u8,

    collision_sprite_sprite: Cell<u8>,
    collision_sprite_data: Cell<u8>,

    raster: u16,
    vc_base: i32,
    rc: u8,
    idle: bool,
    display_enabled: bool,
    c_buffer: [u8; 40],
    color_buffer: [u8; 40],
    pending_line: Option<RenderLine>,
    frame_buffer: Vec<RenderLine>,
    frame_count: u64,

    timing: Timing,
    scheduler: Shared<Scheduler>,
    irq_line: Shared<IrqLine>,
    irq_source: usize,
    fabric: Weak<RefCell<Fabric>>,
    self_ref: Weak<RefCell<Vic>>,
}

impl Vic {
    pub fn new_shared(
        scheduler: Shared<Scheduler>,
        irq_line: Shared<IrqLine>,
        irq_source: usize,
        timing: Timing,
    ) -> Shared<Vic> {
        let frame_buffer = (0..timing.lines_per_frame)
            .map(RenderLine::blank_at)
            .collect();
        let vic = new_shared(Vic {
            sprite_x: [0; 8],
            sprite_y: [0; 8],
            sprite_enabled: [false; 8],
            sprite_expand_x: [false; 8],
            sprite_expand_y: [false; 8],
            sprite_multicolor: [false; 8],
            sprite_priority: [false; 8],
            sprite_color: [0; 8],
            mob_multicolor: [0; 2],
            raster_compare: 0,
            ecm: false,
            bmm: false,
            den: false,
            rsel: false,
            mcm: false,
            csel: true,
            scroll_x: 0,
            scroll_y: 0,
            mem_ptr: 0,
            irq_status: 0,
            irq_enable: 0,
            border_color: 0,
            background_color: [0; 4],
            light_pen_x: 0,
            light_pen_y: 0,
            collision_sprite_sprite: Cell::new(0),
            collision_sprite_data: Cell::new(0),
            raster: 0,
            vc_base: 0,
            rc: 7,
            idle: true,
            display_enabled: false,
            c_buffer: [0; 40],
            color_buffer: [0; 40],
            pending_line: None,
            frame_buffer,
            frame_count: 0,
            timing,
            scheduler,
            irq_line,
            irq_source,
            fabric: Weak::new(),
            self_ref: Weak::new(),
        });
        vic.borrow_mut().self_ref = std::rc::Rc::downgrade(&vic);
        vic.borrow_mut().reset();
        vic
    }

    /// Wires the memory fabric this chip fetches video data through. Held
    /// weakly: the fabric owns a `Shared<dyn Addressable>` clone of this
    /// same chip for I/O dispatch, so a strong reference back would never
    /// be freed.
    pub fn attach_fabric(&mut self, fabric: Weak<RefCell<Fabric>>) {
        self.fabric = fabric;
    }

    pub fn reset(&mut self) {
        self.sprite_x = [0; 8];
        self.sprite_y = [0; 8];
        self.sprite_enabled = [false; 8];
        self.sprite_expand_x = [false; 8];
        self.sprite_expand_y = [false; 8];
        self.sprite_multicolor = [false; 8];
        self.sprite_priority = [false; 8];
        self.sprite_color = [0; 8];
        self.mob_multicolor = [0; 2];
        self.raster_compare = 0;
        self.ecm = false;
        self.bmm = false;
        self.den = false;
        self.rsel = false;
        self.mcm = false;
        self.csel = true;
        self.scroll_x = 0;
        self.scroll_y = 0;
        self.mem_ptr = 0;
        self.irq_status = 0;
        self.irq_enable = 0;
        self.border_color = 0;
        self.background_color = [0; 4];
        self.collision_sprite_sprite.set(0);
        self.collision_sprite_data.set(0);
        self.raster = 0;
        self.vc_base = 0;
        self.rc = 7;
        self.idle = true;
        self.display_enabled = false;
        self.pending_line = None;
        self.frame_count = 0;
        self.irq_line.borrow_mut().set_low(self.irq_source, false);

        let callback = Self::build_raster_callback(self.self_ref.clone());
        let deadline = self.scheduler.borrow().clock() + self.timing.cycles_per_line;
        self.scheduler.borrow_mut().register(Source::Raster, Some(callback), deadline);
        self.scheduler.borrow_mut().cancel(Source::Redraw);
        self.scheduler.borrow_mut().cancel(Source::Frame);
    }

    pub fn frame_buffer(&self) -> &[RenderLine] {
        &self.frame_buffer
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn build_raster_callback(self_ref: Weak<RefCell<Vic>>) -> Callback {
        Box::new(move |scheduler: &mut Scheduler| {
            if let Some(vic) = self_ref.upgrade() {
                vic.borrow_mut().on_raster(scheduler);
            }
        })
    }

    fn build_redraw_callback(self_ref: Weak<RefCell<Vic>>) -> Callback {
        Box::new(move |scheduler: &mut Scheduler| {
            if let Some(vic) = self_ref.upgrade() {
                vic.borrow_mut().on_redraw(scheduler);
            }
        })
    }

    fn build_frame_callback(self_ref: Weak<RefCell<Vic>>) -> Callback {
        Box::new(move |scheduler: &mut Scheduler| {
            if let Some(vic) = self_ref.upgrade() {
                vic.borrow_mut().on_frame(scheduler);
            }
        })
    }

    /// The per-raster update (§4.5 steps 1-7). Runs from inside
    /// `Scheduler::drain`, so any re-registration goes through the passed
    /// `scheduler` directly rather than `self.scheduler.borrow_mut()`, which
    /// would double-borrow the `RefCell` `drain` already holds.
    fn on_raster(&mut self, scheduler: &mut Scheduler) {
        let raster = self.raster;

        // Step 1: raster-compare IRQ latch.
        if raster == self.raster_compare {
            self.irq_status |= 0x01;
        }
        self.update_irq();

        // Step 2: VC_base reset at raster 0, DEN sampled at raster 0x30.
        if raster == 0 {
            self.vc_base = -40;
        }
        if raster == 0x30 {
            self.display_enabled = self.den;
        }

        // Step 3: bad-line detection and RC/VC bookkeeping. The advance of
        // VC_base is ordered before the buffer refill (rather than after,
        // as the prose reads) so the very first bad line of a frame lands
        // on VC=0 instead of indexing the video matrix at -40; `rc` starts
        // at 7 out of `reset`, so that advance fires exactly once, at the
        // first bad line.
        let bad_line =
            (raster & 7) as u8 == (self.scroll_y & 7) && (0x30..=0xf7).contains(&raster) && self.display_enabled;
        let rc_was_7 = self.rc == 7;
        if bad_line {
            if rc_was_7 {
                self.vc_base += 40;
            }
            if let Some(fabric) = self.fabric.upgrade() {
                self.refill_line_buffers(&fabric.borrow());
            }
            self.rc = 0;
            self.idle = false;
            scheduler.advance(40);
        } else if rc_was_7 {
            self.idle = true;
        } else {
            self.rc += 1;
        }

        // Step 4: vertical border. Per the CSEL open question (DESIGN.md),
        // CSEL only gates the horizontal border; it plays no part here.
        let (top, bottom) = if self.rsel { (0x33, 0xfb) } else { (0x37, 0xf7) };
        let blank = raster < top || raster > bottom;

        // Steps 5-7: pixel fetch, sprite fetch, sprite-sprite collision.
        let line = match self.fabric.upgrade() {
            Some(fabric) => self.render_line(&fabric.borrow(), raster, blank),
            None => RenderLine::blank_at(raster),
        };
        self.pending_line = Some(line);

        let next_raster = if raster + 1 >= self.timing.lines_per_frame {
            0
        } else {
            raster + 1
        };
        self.raster = next_raster;

        let raster_callback = Self::build_raster_callback(self.self_ref.clone());
        scheduler.register(
            Source::Raster,
            Some(raster_callback),
            scheduler.clock() + self.timing.cycles_per_line,
        );
        let redraw_callback = Self::build_redraw_callback(self.self_ref.clone());
        scheduler.register(Source::Redraw, Some(redraw_callback), scheduler.clock() + 1);
        if next_raster == 0 {
            let frame_callback = Self::build_frame_callback(self.self_ref.clone());
            scheduler.register(Source::Frame, Some(frame_callback), scheduler.clock());
        }
    }

    fn on_redraw(&mut self, _scheduler: &mut Scheduler) {
        if let Some(line) = self.pending_line.take() {
            self.frame_buffer[line.raster as usize] = line;
        }
    }

    fn on_frame(&mut self, _scheduler: &mut Scheduler) {
        self.frame_count += 1;
    }

    fn update_irq(&mut self) {
        if self.irq_status & self.irq_enable & 0x0f != 0 {
            self.irq_status |= 0x80;
            self.irq_line.borrow_mut().set_low(self.irq_source, true);
            trace!(target: "vic::reg", "irq raised, status {:#04x}", self.irq_status);
        } else {
            self.irq_status &= 0x7f;
            self.irq_line.borrow_mut().set_low(self.irq_source, false);
        }
    }

    fn refill_line_buffers(&mut self, fabric: &Fabric) {
        for n in 0..40 {
            let offset = (self.vc_base + n as i32) as u16;
            self.c_buffer[n] = fabric.video_matrix_byte(offset);
            self.color_buffer[n] = fabric.color_ram_nybble(offset);
        }
    }

    fn render_line(&self, fabric: &Fabric, raster: u16, blank: bool) -> RenderLine {
        let mode = fetch_mode(self.idle, self.ecm, self.bmm);
        let mut blocks = [Block::default(); 40];
        if !blank {
            for (n, block) in blocks.iter_mut().enumerate() {
                *block = self.fetch_block(fabric, &mode, n);
            }
        }
        let sprites = self.fetch_sprites(fabric, raster);
        self.latch_collisions(&sprites);

        RenderLine {
            raster,
            blank,
            blocks,
            sprites,
            border_color: self.border_color,
            background_color: self.background_color,
            csel: self.csel,
            scroll_x: self.scroll_x,
        }
    }

    fn fetch_block(&self, fabric: &Fabric, mode: &FetchMode, n: usize) -> Block {
        match mode {
            FetchMode::Idle => Block {
                bits: fabric.video_bank_byte(0x3fff),
                colors: [0; 4],
                multicolor: false,
            },
            FetchMode::Invalid => Block::default(),
            FetchMode::Character => {
                let c_data = self.c_buffer[n];
                let color = self.color_buffer[n];
                let bits = fabric.char_base_byte((u16::from(c_data) << 3) | u16::from(self.rc));
                if color & 0x08 != 0 {
                    Block {
                        bits,
                        colors: [
                            self.background_color[0],
                            self.background_color[1],
                            self.background_color[2],
                            color & 0x07,
                        ],
                        multicolor: true,
                    }
                } else {
                    Block {
                        bits,
                        colors: [self.background_color[0], color, 0, 0],
                        multicolor: false,
                    }
                }
            }
            FetchMode::ExtColor => {
                let c_data = self.c_buffer[n];
                let char_code = c_data & 0x3f;
                let bg_index = usize::from(c_data >> 6);
                let bits = fabric.char_base_byte((u16::from(char_code) << 3) | u16::from(self.rc));
                Block {
                    bits,
                    colors: [self.background_color[bg_index], self.color_buffer[n], 0, 0],
                    multicolor: false,
                }
            }
            FetchMode::Bitmap => {
                let vc = self.vc_base + n as i32;
                let bits = fabric.bitmap_base_byte(((vc as u16) << 3) | u16::from(self.rc));
                let c = self.c_buffer[n];
                if self.mcm {
                    Block {
                        bits,
                        colors: [self.background_color[0], (c >> 4) & 0x0f, c & 0x0f, self.color_buffer[n]],
                        multicolor: true,
                    }
                } else {
                    Block {
                        bits,
                        colors: [c & 0x0f, (c >> 4) & 0x0f, 0, 0],
                        multicolor: false,
                    }
                }
            }
        }
    }

    fn fetch_sprites(&self, fabric: &Fabric, raster: u16) -> [Option<(u16, SpriteWord)>; 8] {
        let mut out: [Option<(u16, SpriteWord)>; 8] = [None, None, None, None, None, None, None, None];
        for i in 0..8 {
            if !self.sprite_enabled[i] {
                continue;
            }
            let dy = i32::from(raster) - i32::from(self.sprite_y[i]) - 1;
            let y = if self.sprite_expand_y[i] { dy / 2 } else { dy };
            if !(0..21).contains(&y) {
                continue;
            }
            let pointer = fabric.video_matrix_byte(0x3f8 + i as u16);
            let offset = (u16::from(pointer) << 6) + 3 * y as u16;
            let bits = (u32::from(fabric.video_bank_byte(offset)) << 16)
                | (u32::from(fabric.video_bank_byte(offset + 1)) << 8)
                | u32::from(fabric.video_bank_byte(offset + 2));
            out[i] = Some((
                self.sprite_x[i],
                SpriteWord {
                    bits,
                    color: self.sprite_color[i],
                    priority: self.sprite_priority[i],
                    multicolor: self.sprite_multicolor[i],
                    expand_x: self.sprite_expand_x[i],
                },
            ));
        }
        out
    }

    /// §4.5 step 7: every pair of sprites rendered on this line whose
    /// footprints share a pixel column latches both bits into $D01E.
    fn latch_collisions(&self, sprites: &[Option<(u16, SpriteWord)>; 8]) {
        let columns: Vec<Option<Vec<u16>>> = sprites
            .iter()
            .map(|slot| slot.as_ref().map(|(x, word)| opaque_columns(*x, word)))
            .collect();

        let mut hit = 0u8;
        for i in 0..8 {
            let ci = match &columns[i] {
                Some(c) => c,
                None => continue,
            };
            for j in (i + 1)..8 {
                let cj = match &columns[j] {
                    Some(c) => c,
                    None => continue,
                };
                if ci.iter().any(|c| cj.contains(c)) {
                    hit |= (1 << i) | (1 << j);
                }
            }
        }
        if hit != 0 {
            self.collision_sprite_sprite.set(self.collision_sprite_sprite.get() | hit);
        }
    }

    fn read_cr1(&self) -> u8 {
        let mut value = self.scroll_y & 0x07;
        if self.rsel {
            value |= 0x08;
        }
        if self.den {
            value |= 0x10;
        }
        if self.bmm {
            value |= 0x20;
        }
        if self.ecm {
            value |= 0x40;
        }
        if self.raster & 0x100 != 0 {
            value |= 0x80;
        }
        value
    }

    fn write_cr1(&mut self, value: u8) {
        self.scroll_y = value & 0x07;
        self.rsel = value & 0x08 != 0;
        self.den = value & 0x10 != 0;
        self.bmm = value & 0x20 != 0;
        self.ecm = value & 0x40 != 0;
        let msb = if value & 0x80 != 0 { 0x100 } else { 0 };
        self.raster_compare = (self.raster_compare & 0x00ff) | msb;
        self.update_irq();
    }

    fn read_cr2(&self) -> u8 {
        let mut value = (self.scroll_x & 0x07) | 0xc0;
        if self.csel {
            value |= 0x08;
        }
        if self.mcm {
            value |= 0x10;
        }
        value
    }

    fn write_cr2(&mut self, value: u8) {
        self.scroll_x = value & 0x07;
        self.csel = value & 0x08 != 0;
        self.mcm = value & 0x10 != 0;
    }
}

impl Addressable for Vic {
    fn read(&self, address: u16) -> u8 {
        let reg = address & 0x3f;
        let value = match reg {
            0x00..=0x0f => {
                let sprite = (reg / 2) as usize;
                if reg % 2 == 0 {
                    (self.sprite_x[sprite] & 0xff) as u8
                } else {
                    self.sprite_y[sprite]
                }
            }
            reg::MX8 => {
                let mut v = 0u8;
                for i in 0..8 {
                    if self.sprite_x[i] & 0x100 != 0 {
                        v |= 1 << i;
                    }
                }
                v
            }
            reg::CR1 => self.read_cr1(),
            reg::RASTER => (self.raster & 0xff) as u8,
            reg::LPX => self.light_pen_x,
            reg::LPY => self.light_pen_y,
            reg::ME => pack_bits(&self.sprite_enabled),
            reg::CR2 => self.read_cr2(),
            reg::MYE => pack_bits(&self.sprite_expand_y),
            reg::MEMPTR => self.mem_ptr | 0x01,
            reg::IRR => self.irq_status | 0x70,
            reg::IMR => self.irq_enable | 0xf0,
            reg::MDP => pack_bits(&self.sprite_priority),
            reg::MMC => pack_bits(&self.sprite_multicolor),
            reg::MXE => pack_bits(&self.sprite_expand_x),
            reg::MM => {
                let v = self.collision_sprite_sprite.get();
                self.collision_sprite_sprite.set(0);
                v
            }
            reg::MD => {
                let v = self.collision_sprite_data.get();
                self.collision_sprite_data.set(0);
                v
            }
            reg::EC => self.border_color | 0xf0,
            reg::B0C..=reg::B3C => self.background_color[(reg - reg::B0C) as usize] | 0xf0,
            reg::MM0 => self.mob_multicolor[0] | 0xf0,
            reg::MM1 => self.mob_multicolor[1] | 0xf0,
            reg::M0C..=reg::M7C => self.sprite_color[(reg - reg::M0C) as usize] | 0xf0,
            _ => 0xff,
        };
        trace!(target: "vic::reg", "read ${:02x} = {:02x}", reg, value);
        value
    }

    fn write(&mut self, address: u16, value: u8) {
        let reg = address & 0x3f;
        trace!(target: "vic::reg", "write ${:02x} = {:02x}", reg, value);
        match reg {
            0x00..=0x0f => {
                let sprite = (reg / 2) as usize;
                if reg % 2 == 0 {
                    self.sprite_x[sprite] = (self.sprite_x[sprite] & 0xff00) | u16::from(value);
                } else {
                    self.sprite_y[sprite] = value;
                }
            }
            reg::MX8 => {
                for i in 0..8 {
                    let msb = if value & (1 << i) != 0 { 0x100 } else { 0 };
                    self.sprite_x[i] = (self.sprite_x[i] & 0xff) | msb;
                }
            }
            reg::CR1 => self.write_cr1(value),
            reg::RASTER => {
                self.raster_compare = (self.raster_compare & 0x100) | u16::from(value);
            }
            reg::LPX => self.light_pen_x = value,
            reg::LPY => self.light_pen_y = value,
            reg::ME => unpack_bits(&mut self.sprite_enabled, value),
            reg::CR2 => self.write_cr2(value),
            reg::MYE => unpack_bits(&mut self.sprite_expand_y, value),
            reg::MEMPTR => self.mem_ptr = value,
            reg::IRR => {
                self.irq_status &= !(value & 0x0f);
                self.update_irq();
            }
            reg::IMR => {
                self.irq_enable = value & 0x0f;
                self.update_irq();
            }
            reg::MDP => unpack_bits(&mut self.sprite_priority, value),
            reg::MMC => unpack_bits(&mut self.sprite_multicolor, value),
            reg::MXE => unpack_bits(&mut self.sprite_expand_x, value),
            reg::MM | reg::MD => {}
            reg::EC => self.border_color = value & 0x0f,
            reg::B0C..=reg::B3C => self.background_color[(reg - reg::B0C) as usize] = value & 0x0f,
            reg::MM0 => self.mob_multicolor[0] = value & 0x0f,
            reg::MM1 => self.mob_multicolor[1] = value & 0x0f,
            reg::M0C..=reg::M7C => self.sprite_color[(reg - reg::M0C) as usize] = value & 0x0f,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::Fabric;
    use crate::util::Rom;

    struct NullChip;
    impl Addressable for NullChip {
        fn read(&self, _address: u16) -> u8 {
            0
        }
        fn write(&mut self, _address: u16, _value: u8) {}
    }

    fn setup() -> (Shared<Vic>, Shared<Scheduler>, Shared<IrqLine>) {
        let scheduler = new_shared(Scheduler::new());
        let irq_line = new_shared(IrqLine::new("vic-irq"));
        let vic = Vic::new_shared(scheduler.clone(), irq_line.clone(), 1, Timing::PAL);
        (vic, scheduler, irq_line)
    }

    fn attach_fabric(vic: &Shared<Vic>) -> Shared<Fabric> {
        let fabric = new_shared(Fabric::new(
            Rom::new(vec![0; 0x2000], 0xa000),
            Rom::new(vec![0; 0x2000], 0xe000),
            Rom::new(vec![0; 0x1000], 0xd000),
            new_shared(NullChip),
            new_shared(NullChip),
            new_shared(NullChip),
        ));
        vic.borrow_mut().attach_fabric(std::rc::Rc::downgrade(&fabric));
        fabric
    }

    #[test]
    fn sprite_position_registers_roundtrip_including_the_msb_byte() {
        let (vic, ..) = setup();
        vic.borrow_mut().write(0xd000, 0x40); // sprite 0 x low byte
        vic.borrow_mut().write(0xd010, 0x01); // sprite 0 x MSB
        assert_eq!(0x140, {
            let lo = u16::from(vic.borrow().read(0xd000));
            let msb = vic.borrow().read(0xd010) & 0x01;
            lo | (u16::from(msb) << 8)
        });
    }

    #[test]
    fn writing_cr1_sets_mode_flags_and_the_raster_compare_msb() {
        let (vic, ..) = setup();
        vic.borrow_mut().write(0xd011, 0x90); // DEN + raster-compare MSB
        assert!(vic.borrow().den);
        vic.borrow_mut().write(0xd012, 0x05);
        assert_eq!(0x105, vic.borrow().raster_compare);
    }

    #[test]
    fn raster_compare_match_latches_and_acks_through_irr() {
        let (vic, scheduler, irq_line) = setup();
        vic.borrow_mut().write(0xd012, 5);
        vic.borrow_mut().write(0xd01a, 0x01);
        for _ in 0..6 {
            let step = scheduler.borrow().time_left();
            scheduler.borrow_mut().advance(step);
            scheduler.borrow_mut().drain();
        }
        assert!(irq_line.borrow().is_low());
        assert_eq!(0x81, vic.borrow().read(0xd019));
        vic.borrow_mut().write(0xd019, 0x01);
        assert_eq!(0x00, vic.borrow().read(0xd019) & 0x81);
        assert!(!irq_line.borrow().is_low());
    }

    #[test]
    fn overlapping_sprites_latch_both_bits_and_clear_on_read() {
        let (vic, ..) = setup();
        let a = SpriteWord {
            bits: 0xffffff,
            color: 1,
            priority: false,
            multicolor: false,
            expand_x: false,
        };
        let b = SpriteWord {
            bits: 0xffffff,
            color: 2,
            priority: false,
            multicolor: false,
            expand_x: false,
        };
        let sprites = [Some((100u16, a)), Some((110u16, b)), None, None, None, None, None, None];
        vic.borrow().latch_collisions(&sprites);
        assert_eq!(0x03, vic.borrow().read(0xd01e));
        assert_eq!(0x00, vic.borrow().read(0xd01e));
    }

    #[test]
    fn non_overlapping_sprites_do_not_latch_a_collision() {
        let (vic, ..) = setup();
        let a = SpriteWord {
            bits: 0xff0000,
            color: 1,
            priority: false,
            multicolor: false,
            expand_x: false,
        };
        let b = SpriteWord {
            bits: 0x0000ff,
            color: 2,
            priority: false,
            multicolor: false,
            expand_x: false,
        };
        let sprites = [Some((0u16, a)), Some((100u16, b)), None, None, None, None, None, None];
        vic.borrow().latch_collisions(&sprites);
        assert_eq!(0x00, vic.borrow().read(0xd01e));
    }

    #[test]
    fn bad_line_cadence_matches_the_documented_per_frame_cycle_total() {
        let (vic, scheduler, _irq) = setup();
        let _fabric = attach_fabric(&vic);
        vic.borrow_mut().write(0xd011, 0x10); // DEN, 24-row window

        let mut total = 0i64;
        while vic.borrow().frame_count() == 0 {
            let step = scheduler.borrow().time_left().max(1);
            scheduler.borrow_mut().advance(step);
            total += step;
            scheduler.borrow_mut().drain();
        }
        assert_eq!(312 * 63 + 25 * 40, total);
    }

    #[test]
    fn idle_mode_fetches_from_the_fixed_video_bank_address() {
        let (vic, scheduler, _irq) = setup();
        let fabric = attach_fabric(&vic);
        fabric.borrow_mut().write(0x3fff, 0xaa);
        // Idle (DEN never set) keeps `idle` true; drive one raster inside
        // the display window and inspect the published line.
        for _ in 0..0x31 {
            let step = scheduler.borrow().time_left();
            scheduler.borrow_mut().advance(step);
            scheduler.borrow_mut().drain();
        }
        let line = &vic.borrow().frame_buffer()[0x30];
        assert!(!line.blank);
        assert_eq!(0xaa, line.blocks[0].bits);
    }
}
