// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

// Spec: §4.4/§6 keyboard matrix and joystick state, grounded on keyboard.c
// and cia1.c's `cia1_set_joysticks`. Host key capture itself (SDL scancodes,
// window focus, ...) is an external collaborator per §1; this module owns
// only the matrix, the joystick state bytes, and the fixed code table, plus a
// `type_char` convenience mirroring the teacher's `Keyboard::map_char` for
// feeding text without a host event loop.

use crate::util::Shared;

/// Bit 6 of a packed key code: hold SHIFT down for the duration of the press.
pub const SHIFT: u8 = 0x40;
/// Bit 7: hold the Commodore key down for the duration of the press.
pub const COMM: u8 = 0x80;

/// The 64 physical key positions of the C64 matrix, numbered exactly as
/// `keyboard.h`'s `C64Key` enum (row = code / 8, column = code % 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[rustfmt::skip]
pub enum KeyCode {
    Del = 0, Return = 1, Right = 2, F7 = 3, F1 = 4, F3 = 5, F5 = 6, Down = 7,
    Num3 = 8, W = 9, A = 10, Num4 = 11, Z = 12, S = 13, E = 14, LShift = 15,
    Num5 = 16, R = 17, D = 18, Num6 = 19, C = 20, F = 21, T = 22, X = 23,
    Num7 = 24, Y = 25, G = 26, Num8 = 27, B = 28, H = 29, U = 30, V = 31,
    Num9 = 32, I = 33, J = 34, Num0 = 35, M = 36, K = 37, O = 38, N = 39,
    Plus = 40, P = 41, L = 42, Minus = 43, Period = 44, Colon = 45, At = 46, Comma = 47,
    Pound = 48, Asterisk = 49, Semicolon = 50, Home = 51, RShift = 52, Equals = 53, ArrowUp = 54, Slash = 55,
    Num1 = 56, ArrowLeft = 57, Ctrl = 58, Num2 = 59, Space = 60, Commodore = 61, Q = 62, Stop = 63,
}

/// Eight row bytes (bit clear = pressed), scanned by CIA1's PRA/PRB.
pub struct Keyboard {
    rows: Shared<[u8; 8]>,
}

impl Keyboard {
    pub fn new(rows: Shared<[u8; 8]>) -> Self {
        Keyboard { rows }
    }

    pub fn reset(&mut self) {
        *self.rows.borrow_mut() = [0xff; 8];
    }

    pub fn press(&mut self, code: KeyCode) {
        let code = code as u8;
        self.rows.borrow_mut()[(code >> 3) as usize] &= !(1 << (code & 7));
    }

    pub fn release(&mut self, code: KeyCode) {
        let code = code as u8;
        self.rows.borrow_mut()[(code >> 3) as usize] |= 1 << (code & 7);
    }

    /// Presses `code` (plus SHIFT/Commodore if tagged in `packed`), mirroring
    /// `keyboard_keydown`'s handling of a >255 modifier-tagged mapping.
    pub fn press_packed(&mut self, packed: u32) {
        self.press(code_of(packed));
        if packed & u32::from(SHIFT) != 0 {
            self.press(KeyCode::LShift);
        }
        if packed & u32::from(COMM) != 0 {
            self.press(KeyCode::Commodore);
        }
    }

    pub fn release_packed(&mut self, packed: u32) {
        self.release(code_of(packed));
        if packed & u32::from(SHIFT) != 0 {
            self.release(KeyCode::LShift);
        }
        if packed & u32::from(COMM) != 0 {
            self.release(KeyCode::Commodore);
        }
    }

    /// `keyboard_read_rows`: ANDs together every row whose bit is clear in
    /// `column_mask`.
    pub fn scan_rows(&self, column_mask: u8) -> u8 {
        let rows = self.rows.borrow();
        let mut result = 0xffu8;
        for col in 0..8 {
            if column_mask & (1 << col) == 0 {
                result &= rows[col];
            }
        }
        result
    }

    /// Presses, then releases, the key(s) needed to type `c`, for feeding
    /// text without a host event loop (LOAD/RUN automation, test fixtures).
    pub fn type_char(&mut self, c: char) {
        if let Some(packed) = map_char(c) {
            self.press_packed(packed);
            self.release_packed(packed);
        }
    }
}

fn code_of(packed: u32) -> KeyCode {
    CODES[(packed & 0x3f) as usize]
}

#[rustfmt::skip]
const CODES: [KeyCode; 64] = [
    KeyCode::Del, KeyCode::Return, KeyCode::Right, KeyCode::F7, KeyCode::F1, KeyCode::F3, KeyCode::F5, KeyCode::Down,
    KeyCode::Num3, KeyCode::W, KeyCode::A, KeyCode::Num4, KeyCode::Z, KeyCode::S, KeyCode::E, KeyCode::LShift,
    KeyCode::Num5, KeyCode::R, KeyCode::D, KeyCode::Num6, KeyCode::C, KeyCode::F, KeyCode::T, KeyCode::X,
    KeyCode::Num7, KeyCode::Y, KeyCode::G, KeyCode::Num8, KeyCode::B, KeyCode::H, KeyCode::U, KeyCode::V,
    KeyCode::Num9, KeyCode::I, KeyCode::J, KeyCode::Num0, KeyCode::M, KeyCode::K, KeyCode::O, KeyCode::N,
    KeyCode::Plus, KeyCode::P, KeyCode::L, KeyCode::Minus, KeyCode::Period, KeyCode::Colon, KeyCode::At, KeyCode::Comma,
    KeyCode::Pound, KeyCode::Asterisk, KeyCode::Semicolon, KeyCode::Home, KeyCode::RShift, KeyCode::Equals, KeyCode::ArrowUp, KeyCode::Slash,
    KeyCode::Num1, KeyCode::ArrowLeft, KeyCode::Ctrl, KeyCode::Num2, KeyCode::Space, KeyCode::Commodore, KeyCode::Q, KeyCode::Stop,
];

/// Symbolic ASCII mapping, ported from `keyboard.c`'s `keyboard_keydown`
/// table entries that route through a plain SHIFT tag (the printable-ASCII
/// subset; positional punctuation quirks are a host-layout concern).
fn map_char(c: char) -> Option<u32> {
    let shift = u32::from(SHIFT);
    let code = |k: KeyCode| u32::from(k as u8);
    match c {
        '\n' => Some(code(KeyCode::Return)),
        ' ' => Some(code(KeyCode::Space)),
        '0' => Some(code(KeyCode::Num0)),
        '1' => Some(code(KeyCode::Num1)),
        '2' => Some(code(KeyCode::Num2)),
        '3' => Some(code(KeyCode::Num3)),
        '4' => Some(code(KeyCode::Num4)),
        '5' => Some(code(KeyCode::Num5)),
        '6' => Some(code(KeyCode::Num6)),
        '7' => Some(code(KeyCode::Num7)),
        '8' => Some(code(KeyCode::Num8)),
        '9' => Some(code(KeyCode::Num9)),
        'a'..='z' => letter_code(c, code),
        'A'..='Z' => letter_code(c.to_ascii_lowercase(), code).map(|v| v | shift),
        '+' => Some(code(KeyCode::Plus)),
        '-' => Some(code(KeyCode::Minus)),
        '*' => Some(code(KeyCode::Asterisk)),
        '.' => Some(code(KeyCode::Period)),
        ':' => Some(code(KeyCode::Colon)),
        '@' => Some(code(KeyCode::At)),
        ',' => Some(code(KeyCode::Comma)),
        ';' => Some(code(KeyCode::Semicolon)),
        '=' => Some(code(KeyCode::Equals)),
        '/' => Some(code(KeyCode::Slash)),
        _ => None,
    }
}

fn letter_code(c: char, code: impl Fn(KeyCode) -> u32) -> Option<u32> {
    Some(code(match c {
        'a' => KeyCode::A,
        'b' => KeyCode::B,
        'c' => KeyCode::C,
        'd' => KeyCode::D,
        'e' => KeyCode::E,
        'f' => KeyCode::F,
        'g' => KeyCode::G,
        'h' => KeyCode::H,
        'i' => KeyCode::I,
        'j' => KeyCode::J,
        'k' => KeyCode::K,
        'l' => KeyCode::L,
        'm' => KeyCode::M,
        'n' => KeyCode::N,
        'o' => KeyCode::O,
        'p' => KeyCode::P,
        'q' => KeyCode::Q,
        'r' => KeyCode::R,
        's' => KeyCode::S,
        't' => KeyCode::T,
        'u' => KeyCode::U,
        'v' => KeyCode::V,
        'w' => KeyCode::W,
        'x' => KeyCode::X,
        'y' => KeyCode::Y,
        'z' => KeyCode::Z,
        _ => return None,
    }))
}

/// Two host-fed joystick state bytes (bit clear = active), plus the selector
/// toggled by `joystick_select`, ported from `keyboard.c`'s globals.
pub struct Joysticks {
    joy1: Shared<u8>,
    joy2: Shared<u8>,
    selected: u8,
}

impl Joysticks {
    pub fn new(joy1: Shared<u8>, joy2: Shared<u8>) -> Self {
        Joysticks {
            joy1,
            joy2,
            selected: 2,
        }
    }

    pub fn select(&mut self, port: u8) {
        if port == 1 || port == 2 {
            self.selected = port;
        }
    }

    pub fn down(&mut self, mask: u8) {
        let value = *self.state().borrow() & !mask;
        *self.state().borrow_mut() = value;
    }

    pub fn up(&mut self, mask: u8) {
        let value = *self.state().borrow() | mask;
        *self.state().borrow_mut() = value;
    }

    fn state(&self) -> &Shared<u8> {
        if self.selected == 1 {
            &self.joy1
        } else {
            &self.joy2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::new_shared;

    #[test]
    fn pressing_a_key_clears_its_matrix_bit() {
        let mut kb = Keyboard::new(new_shared([0xff; 8]));
        kb.press(KeyCode::A);
        assert_eq!(0xff & !(1 << 2), kb.rows.borrow()[1]);
        kb.release(KeyCode::A);
        assert_eq!(0xff, kb.rows.borrow()[1]);
    }

    #[test]
    fn scan_rows_ands_only_the_selected_columns() {
        let mut kb = Keyboard::new(new_shared([0xff; 8]));
        kb.press(KeyCode::A); // row 1, col 2
        kb.press(KeyCode::Q); // row 7, col 6
        assert_eq!(0xff & !(1 << 2), kb.scan_rows(!(1 << 1)));
        assert_eq!(0xff, kb.scan_rows(!(1 << 3)));
        assert_eq!((0xff & !(1 << 2)) & (0xff & !(1 << 6)), kb.scan_rows(0x00));
    }

    #[test]
    fn joystick_down_clears_the_selected_ports_bits() {
        let joy1 = new_shared(0xffu8);
        let joy2 = new_shared(0xffu8);
        let mut joy = Joysticks::new(joy1.clone(), joy2.clone());
        joy.select(1);
        joy.down(0x01);
        assert_eq!(0xfe, *joy1.borrow());
        assert_eq!(0xff, *joy2.borrow());
        joy.up(0x01);
        assert_eq!(0xff, *joy1.borrow());
    }

    #[test]
    fn type_char_presses_and_releases_with_shift_for_uppercase() {
        let mut kb = Keyboard::new(new_shared([0xff; 8]));
        kb.type_char('A');
        // both keys released again afterwards
        assert_eq!([0xff; 8], *kb.rows.borrow());
    }
}
