// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

mod cia;
mod keyboard;
mod vic;

pub use self::cia::{Cia, Mode as CiaMode};
pub use self::keyboard::{KeyCode, Keyboard, Joysticks, COMM, SHIFT};
pub use self::vic::{RenderLine, Timing, Vic};
