// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

// Spec: §4.6 Peripheral Bus. Grounded on serial.c (ATN/byte protocol, device
// and secondary-address latches, the 256-byte write-side buffer) and
// disk_raw.c (per-channel read buffers, PETSCII filename translation, and
// the "code description track block" status format). Filesystem access
// itself is kept behind `DiskImage` (§4.6 ambient addition) so this module
// never touches `std::fs`; only device 8 (disk) is modeled, matching the
// spec's single stub device.

use log::trace;

/// Sentinel values returned by `Serial::read`, mirroring `serial.h`'s
/// out-of-band ints alongside the normal `0..=255` byte range.
pub const TIME_OUT: i32 = -1;
pub const DEVICE_NOT_PRESENT: i32 = -2;
pub const END_OF_FILE: i32 = 256;

const DISK_DEVICE: u8 = 0x08;
const BUFFER_SIZE: usize = 256;
const NUM_CHANNELS: usize = 16;
const COMMAND_CHANNEL: usize = 15;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ChannelMode {
    Closed,
    Read,
    Write,
}

struct Channel {
    mode: ChannelMode,
    buffer: Vec<u8>,
    pos: usize,
    filename: String,
}

impl Channel {
    fn new() -> Self {
        Channel {
            mode: ChannelMode::Closed,
            buffer: Vec::new(),
            pos: 0,
            filename: String::new(),
        }
    }
}

/// A read-only filesystem-like collaborator for channel 0 (LOAD) and
/// channel 15 directory listings. The core asks for bytes by ASCII
/// filename; everything PETSCII-specific stays inside this module.
pub trait DiskImage {
    /// Returns the bytes of `name`, or `None` if it doesn't exist.
    fn read_file(&mut self, name: &str) -> Option<Vec<u8>>;
    /// Directory entries, used for `LOAD"$",8`; empty by default.
    fn directory_entries(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Object-safe façade over `Serial<D>` so the CPU's kernal patches (§4.3,
/// ED40/EE13) can hold one without naming the disk image's concrete type.
pub trait SerialBus {
    fn read(&mut self) -> i32;
    fn write(&mut self, atn: bool, byte: u8) -> i32;
}

impl<D: DiskImage> SerialBus for Serial<D> {
    fn read(&mut self) -> i32 {
        Serial::read(self)
    }
    fn write(&mut self, atn: bool, byte: u8) -> i32 {
        Serial::write(self, atn, byte)
    }
}

pub struct Serial<D: DiskImage> {
    disk: D,
    device: u8,
    second: u8,
    write_buffer: Vec<u8>,
    channels: Vec<Channel>,
}

impl<D: DiskImage> Serial<D> {
    pub fn new(disk: D) -> Self {
        let mut channels = Vec::with_capacity(NUM_CHANNELS);
        for _ in 0..NUM_CHANNELS {
            channels.push(Channel::new());
        }
        Serial {
            disk,
            device: 0x1f,
            second: 0,
            write_buffer: Vec::with_capacity(BUFFER_SIZE),
            channels,
        }
    }

    pub fn reset(&mut self) {
        self.device = 0x1f;
        self.second = 0;
        self.write_buffer.clear();
        for ch in &mut self.channels {
            *ch = Channel::new();
        }
    }

    /// `serial_read()`: the byte the currently-addressed channel would hand
    /// back over the bus, or a negative/`END_OF_FILE`-tagged sentinel.
    pub fn read(&mut self) -> i32 {
        if self.device != DISK_DEVICE {
            return TIME_OUT;
        }
        self.raw_read((self.second & 0x0f) as usize)
    }

    /// `serial_write(atn, byte)`: under ATN this latches the device/secondary
    /// address (or dispatches a pending command first); otherwise it
    /// accumulates `byte` into the write-side buffer.
    pub fn write(&mut self, atn: bool, byte: u8) -> i32 {
        if atn {
            self.flush_buffer();
            trace!(target: "serial::bus", "ATN {:02x}", byte);
            self.second = byte;
            if byte < 0x60 {
                self.device = byte & 0x1f;
            } else if self.device != DISK_DEVICE {
                return DEVICE_NOT_PRESENT;
            }
        } else {
            if self.second < 0x60 {
                return TIME_OUT;
            }
            trace!(target: "serial::bus", "byte {:02x}", byte);
            self.write_buffer.push(byte);
            if self.write_buffer.len() == BUFFER_SIZE {
                self.flush_buffer();
            }
        }
        0
    }

    fn flush_buffer(&mut self) {
        let channel = (self.second & 0x0f) as usize;
        if self.device != DISK_DEVICE {
            self.write_buffer.clear();
            return;
        }
        match self.second & 0xf0 {
            0x60 => {
                if !self.write_buffer.is_empty() {
                    let data = std::mem::take(&mut self.write_buffer);
                    self.raw_write(channel, &data);
                }
            }
            0xe0 => {
                self.raw_close(channel);
            }
            0xf0 => {
                let name = std::mem::take(&mut self.write_buffer);
                self.raw_open(channel, &name);
            }
            _ => {}
        }
        self.write_buffer.clear();
    }

    fn raw_open(&mut self, ch: usize, command: &[u8]) -> i32 {
        if self.channels[ch].mode != ChannelMode::Closed {
            self.raw_close(ch);
        }
        if command.first() == Some(&b'$') {
            return self.condition(0, "ok", 0, 0);
        }
        if ch == 0 {
            return self.load_file(ch, command);
        }
        if ch == COMMAND_CHANNEL {
            return self.command_channel(command);
        }
        self.channels[ch].filename = convert_filename(command);
        self.condition(0, "ok", 0, 0)
    }

    fn raw_close(&mut self, ch: usize) -> i32 {
        self.channels[ch] = Channel::new();
        self.condition(0, "ok", 0, 0)
    }

    fn raw_read(&mut self, ch: usize) -> i32 {
        if self.channels[ch].mode != ChannelMode::Read {
            return self.condition(61, "file not open", 0, 0);
        }
        if self.channels[ch].pos >= self.channels[ch].buffer.len() {
            return TIME_OUT;
        }
        let byte = self.channels[ch].buffer[self.channels[ch].pos];
        self.channels[ch].pos += 1;
        if self.channels[ch].pos == self.channels[ch].buffer.len() {
            i32::from(byte) | END_OF_FILE
        } else {
            i32::from(byte)
        }
    }

    fn raw_write(&mut self, ch: usize, data: &[u8]) -> i32 {
        if ch == COMMAND_CHANNEL {
            return self.command_channel(data);
        }
        if self.channels[ch].mode != ChannelMode::Write {
            return self.condition(61, "file not open", 0, 0);
        }
        0
    }

    fn load_file(&mut self, ch: usize, command: &[u8]) -> i32 {
        if command.len() > 63 {
            return self.condition(32, "syntax error", 0, 0);
        }
        let filename = convert_filename(command);
        match self.disk.read_file(&filename) {
            Some(bytes) => {
                self.channels[ch].filename = filename;
                self.channels[ch].buffer = bytes;
                self.channels[ch].pos = 0;
                self.channels[ch].mode = ChannelMode::Read;
                self.condition(0, "ok", 0, 0)
            }
            None => self.condition(62, "file not found", 0, 0),
        }
    }

    fn command_channel(&mut self, cmd: &[u8]) -> i32 {
        if cmd.len() > 58 {
            self.condition(32, "syntax error", 0, 0)
        } else {
            self.condition(0, "ok", 0, 0)
        }
    }

    /// Formats the channel-15 status buffer as "code description track
    /// block" and returns -1 if `code` is nonzero, 0 otherwise (matching
    /// `condition()` in disk_raw.c).
    fn condition(&mut self, code: u32, description: &str, track: u32, block: u32) -> i32 {
        let message = format!("{} {} {} {}", code, description, track, block);
        trace!(target: "serial::status", "{}", message);
        self.channels[COMMAND_CHANNEL].buffer = message.into_bytes();
        self.channels[COMMAND_CHANNEL].pos = 0;
        self.channels[COMMAND_CHANNEL].mode = ChannelMode::Read;
        if code != 0 {
            -1
        } else {
            0
        }
    }
}

/// PETSCII to ASCII filename translation (§6): uppercase PETSCII
/// (0xC1..=0xDA) folds down to ASCII uppercase, unshifted PETSCII letters
/// (0x41..=0x5A) fold to ASCII lowercase, everything else passes through.
fn convert_filename(src: &[u8]) -> String {
    src.iter()
        .take(63)
        .map(|&b| match b {
            0x41..=0x5a => b + 32,
            0xc1..=0xda => b - 128,
            other => other,
        })
        .map(|b| b as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockDisk {
        files: std::collections::HashMap<String, Vec<u8>>,
    }

    impl DiskImage for MockDisk {
        fn read_file(&mut self, name: &str) -> Option<Vec<u8>> {
            self.files.get(name).cloned()
        }
    }

    fn setup() -> Serial<MockDisk> {
        let mut files = std::collections::HashMap::new();
        files.insert("game".to_string(), vec![0x01, 0x08, 0xaa]);
        Serial::new(MockDisk { files })
    }

    #[test]
    fn petscii_translation_matches_the_documented_table() {
        assert_eq!("game", convert_filename(b"GAME"));
        assert_eq!("GAME", convert_filename(&[0xc7, 0xc1, 0xcd, 0xc5]));
        assert_eq!("a1!", convert_filename(b"a1!"));
    }

    #[test]
    fn open_unknown_device_is_reported_as_device_not_present() {
        let mut serial = setup();
        assert_eq!(0, serial.write(true, 0xf0 | 0));
        serial.write(false, b'g');
        serial.write(false, b'a');
        serial.write(false, b'm');
        serial.write(false, b'e');
        assert_eq!(DEVICE_NOT_PRESENT, serial.write(true, 0x04));
    }

    #[test]
    fn load_open_then_read_streams_the_file_and_tags_eof() {
        let mut serial = setup();
        serial.write(true, 0xf0 | 0);
        for &b in b"game" {
            serial.write(false, b);
        }
        serial.write(true, 0x3f);
        assert_eq!(0x01, serial.read());
        assert_eq!(0x08, serial.read());
        assert_eq!(0xaa | END_OF_FILE, serial.read());
    }

    #[test]
    fn missing_file_reports_disk_error_62_on_channel_15() {
        let mut serial = setup();
        serial.write(true, 0xf0 | 0);
        for &b in b"nope" {
            serial.write(false, b);
        }
        serial.write(true, 0x3f);
        assert_eq!(b"62 file not found 0 0".to_vec(), serial.channels[15].buffer);
    }

    #[test]
    fn reading_before_any_open_reports_file_not_open() {
        let mut serial = setup();
        assert_eq!(-1, serial.raw_read(0));
    }
}
