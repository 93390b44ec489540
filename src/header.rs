//! The 64-byte Z-machine story header (offsets fixed across versions; flag
//! bits are interpreted differently pre/post v4).

use std::fmt::{Display, Error, Formatter};

use crate::error::ZError;

fn word(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn byte(bytes: &[u8], offset: usize) -> u8 {
    bytes[offset]
}

#[derive(Debug, Clone)]
pub struct Header {
    pub version: u8,
    pub flags1: u8,
    pub release: u16,
    pub base_high_mem: u16,
    pub initial_pc: u16,
    pub dictionary: u16,
    pub object_table_addr: u16,
    pub global_variables: u16,
    pub base_static_mem: u16,
    pub flags2: u16,
    pub serial: String,
    pub abbrev_table: u16,
    pub file_length: usize,
    pub checksum_file: u16,
    pub interpreter_number: u8,
    pub interpreter_version: u8,
    pub screen_rows: u8,
    pub screen_cols: u8,
    pub screen_width_units: u16,
    pub screen_height_units: u16,
    pub font_width_units: u8,
    pub font_height_units: u8,
    pub routines_offset: u16,
    pub strings_offset: u16,
    pub default_background: u8,
    pub default_foreground: u8,
    pub terminating_chars_table: u16,
    pub stream3_width: u16,
    pub standard_revision: u16,
    pub alphabet_table: u16,
    pub header_extension_table: u16,
}

impl Header {
    pub fn new(bytes: &[u8]) -> Result<Header, ZError> {
        if bytes.len() < 64 {
            return Err(ZError::BadMemoryAccess(
                "story file too small for a 64-byte header".to_string(),
            ));
        }
        let version = byte(bytes, 0x00);
        if !matches!(version, 3 | 4 | 5 | 7 | 8) {
            return Err(ZError::UnsupportedVersion(version));
        }

        let file_length_raw = word(bytes, 0x1a) as usize;
        // v1-3 store length/2, v4-5 length/4, v6-8 length/8.
        let length_multiplier = match version {
            1..=3 => 2,
            4 | 5 => 4,
            _ => 8,
        };

        let serial = bytes[0x12..0x18]
            .iter()
            .map(|&b| b as char)
            .collect::<String>();

        Ok(Header {
            version,
            flags1: byte(bytes, 0x01),
            release: word(bytes, 0x02),
            base_high_mem: word(bytes, 0x04),
            initial_pc: word(bytes, 0x06),
            dictionary: word(bytes, 0x08),
            object_table_addr: word(bytes, 0x0a),
            global_variables: word(bytes, 0x0c),
            base_static_mem: word(bytes, 0x0e),
            flags2: word(bytes, 0x10),
            serial,
            abbrev_table: word(bytes, 0x18),
            file_length: file_length_raw * length_multiplier,
            checksum_file: word(bytes, 0x1c),
            interpreter_number: byte(bytes, 0x1e),
            interpreter_version: byte(bytes, 0x1f),
            screen_rows: byte(bytes, 0x20),
            screen_cols: byte(bytes, 0x21),
            screen_width_units: word(bytes, 0x22),
            screen_height_units: word(bytes, 0x24),
            font_width_units: byte(bytes, 0x26),
            font_height_units: byte(bytes, 0x27),
            routines_offset: word(bytes, 0x28),
            strings_offset: word(bytes, 0x2a),
            default_background: byte(bytes, 0x2c),
            default_foreground: byte(bytes, 0x2d),
            terminating_chars_table: word(bytes, 0x2e),
            stream3_width: word(bytes, 0x30),
            standard_revision: word(bytes, 0x32),
            alphabet_table: word(bytes, 0x34),
            header_extension_table: word(bytes, 0x36),
        })
    }

    /// Set the interpreter-capability bits in flags2 the way a real
    /// interpreter announces what it supports (colour/bold/italic/fixed-pitch),
    /// based on what the attached I/O provider can do. Returns the byte to
    /// write back at offset 0x11 (flags2's low byte carries these bits).
    pub fn capability_flags2_byte(supports_color: bool, supports_bold: bool, supports_italic: bool) -> u8 {
        let mut bits = 0u8;
        if supports_color {
            bits |= 1 << 0;
        }
        if supports_bold {
            bits |= 1 << 1;
        }
        if supports_italic {
            bits |= 1 << 2;
        }
        bits |= 1 << 3; // fixed-pitch font always available
        bits
    }

    /// True if the status-line/screen-splitting flags (v3 flags1 semantics) or
    /// colour/sound/timed-input/extended-charset flags (v4+ semantics) are set.
    pub fn flag1_bit(&self, bit: u8) -> bool {
        self.flags1 & (1 << bit) != 0
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(
            f,
            "
Z-code version:           {}
Release number:           {}
Serial number:            {}
Start PC:                 {:#06x}
Dictionary address:       {:#06x}
Object table address:     {:#06x}
Global variables address: {:#06x}
Size of dynamic memory:   {:#06x}
Abbreviations address:    {:#06x}
File size:                {:#06x}
Checksum:                 {:#06x}
",
            self.version,
            self.release,
            self.serial,
            self.initial_pc,
            self.dictionary,
            self.object_table_addr,
            self.global_variables,
            self.base_static_mem,
            self.abbrev_table,
            self.file_length,
            self.checksum_file,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header(version: u8) -> Vec<u8> {
        let mut mem = vec![0u8; 64];
        mem[0x00] = version;
        mem[0x06] = 0x50; // initial PC high
        mem[0x07] = 0x00;
        mem[0x0c] = 0x01; // globals
        mem[0x0e] = 0x02; // base static mem
        mem
    }

    #[test]
    fn parses_known_version() {
        let mem = minimal_header(3);
        let h = Header::new(&mem).unwrap();
        assert_eq!(h.version, 3);
        assert_eq!(h.initial_pc, 0x5000);
        assert_eq!(h.global_variables, 0x0100);
    }

    #[test]
    fn rejects_unsupported_version() {
        let mem = minimal_header(6);
        assert_eq!(Header::new(&mem), Err(ZError::UnsupportedVersion(6)));
    }

    #[test]
    fn rejects_truncated_file() {
        let mem = vec![3u8; 10];
        assert!(Header::new(&mem).is_err());
    }
}
