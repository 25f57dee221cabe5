// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

/// A bidirectional 8-bit I/O port with a direction register, used by CIA ports
/// and the CPU's own $00/$01 port. `direction` bit set means output.
pub struct IoPort {
    direction: u8,
    input: u8,
    output: u8,
}

impl IoPort {
    pub fn new(direction: u8, input: u8) -> Self {
        Self {
            direction,
            input,
            output: 0,
        }
    }

    pub fn get_direction(&self) -> u8 {
        self.direction
    }

    pub fn set_direction(&mut self, direction: u8) {
        self.direction = direction;
    }

    pub fn get_value(&self) -> u8 {
        (self.output & self.direction) | (self.input & !self.direction)
    }

    /// Like `get_value` but substitutes an externally-scanned `input` byte
    /// (used by CIA1 port B, whose input side is the keyboard/joystick scan).
    pub fn get_value_with_input(&self, input: u8) -> u8 {
        (self.output & self.direction) | (input & !self.direction)
    }

    pub fn set_input(&mut self, value: u8) {
        self.input = value;
    }

    pub fn set_value(&mut self, value: u8) {
        self.output = value;
    }

    pub fn reset(&mut self) {
        self.direction = 0x00;
        self.input = 0xff;
        self.output = 0x00;
    }
}
