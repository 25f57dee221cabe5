// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use bit_field::BitField;

/// A level-triggered interrupt line shared by several sources (CIA timers, the
/// VIC raster compare, ...). Each source owns one bit; the line is asserted
/// (low) while any bit is set.
pub struct IrqLine {
    name: &'static str,
    signal: u8,
}

impl IrqLine {
    pub fn new(name: &'static str) -> Self {
        Self { name, signal: 0 }
    }

    #[allow(unused)]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_low(&self) -> bool {
        self.signal != 0
    }

    pub fn reset(&mut self) {
        self.signal = 0;
    }

    pub fn set_low(&mut self, source: usize, value: bool) {
        self.signal.set_bit(source, value);
    }
}
