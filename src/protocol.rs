
/// Status byte returned by the target after every successful phase
pub const RES_OK: u8 = 0xEA;

/// Maximum number of words in a single multi-word transfer
pub const MAX_CHUNK: usize = 32;

/// Address mask for the 32 word block multi-word transfers wrap within
pub const CHUNK_MASK: u16 = 0x1F;

/// Number of words cleared by a page erase
pub const PAGE_WORDS: u16 = 128;

/// Completion poll budget (in clock ticks) for word programming
pub const WRITE_TICKS: u32 = 0x800;

/// Completion poll budget (in clock ticks) for a page erase
pub const ERASE_PAGE_TICKS: u32 = 0x9600;

/// Completion poll budget (in clock ticks) for a full chip erase
pub const ERASE_ALL_TICKS: u32 = 0x60000;

/// Mask applied to the chip ID before comparing the family
pub const CHIP_FAMILY_MASK: u16 = 0xFFF0;

/// Chip ID family of the SN8F2288
pub const SN8F2288_FAMILY: u16 = 0x2700;

/// Unlock sequence, as (program line, output enable line) bytes shifted out MSB first
pub const UNLOCK_SEQUENCE: [(u8, u8); 8] = [
    (0x6A, 0x69),
    (0x95, 0x96),
    (0x95, 0x96),
    (0x6A, 0x69),
    (0x95, 0x96),
    (0x6A, 0x69),
    (0x6A, 0x69),
    (0x94, 0x96),
];

#[derive(Copy, Debug, PartialEq, Clone)]
pub enum Command {
    /// Liveness check, answered with a status byte only
    Check = 0x00,

    /// Erases the 128 word page containing the following address
    ErasePage = 0x40,

    /// Reads the 16 bit chip ID
    ChipId = 0x4A,

    /// Erases the whole code memory
    EraseAll = 0x60,

    /// Reads 1 + N words, N in the low five bits (0x80 - 0x9F)
    Read = 0x80,

    /// Writes 1 + N words, N in the low five bits (0xC0 - 0xDF)
    Write = 0xC0,
}

impl Command {
    /// Opcode for this command, with `extra` words encoded in the low bits
    ///
    /// Only `Read` and `Write` carry a word count, it is ignored otherwise.
    pub fn opcode(self, extra: u8) -> u8 {
        match self {
            Command::Read | Command::Write => self as u8 | (extra & CHUNK_MASK as u8),
            _ => self as u8,
        }
    }

    /// Decode an opcode as received by the target
    pub fn decode(opcode: u8) -> Option<(Command, u8)> {
        let extra = opcode & CHUNK_MASK as u8;
        match opcode {
            0x00 => Some((Command::Check, 0)),
            0x40 => Some((Command::ErasePage, 0)),
            0x4A => Some((Command::ChipId, 0)),
            0x60 => Some((Command::EraseAll, 0)),
            0x80..=0x9F => Some((Command::Read, extra)),
            0xC0..=0xDF => Some((Command::Write, extra)),
            _ => None,
        }
    }
}

/// Electrical configuration of the programming lines
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Mode {
    /// Not yet configured, after construction or shutdown
    ///
    /// The unlock sequence also leaves the lines in this state, it drives
    /// the program line outside of any mode.
    Unknown,
    /// Data line driven low, program line high, opcodes are shifted out
    Write,
    /// Data line released as input, program line low
    Read,
    /// Write mode with the program line pulled low for address / data words
    WriteData,
}

impl Mode {
    /// Compute the configuration to apply when `requested` is asked for.
    ///
    /// Returns `None` when the lines already match. `WriteData` is always
    /// re-applied, the program line is forced low for every word.
    pub fn transition(self, requested: Mode) -> Option<Mode> {
        match requested {
            Mode::WriteData => Some(Mode::WriteData),
            _ if self == requested => None,
            _ => Some(requested),
        }
    }
}

/// Word count field for a multi-word transfer of `len` words
pub fn word_count(len: usize) -> Option<u8> {
    match len {
        1..=MAX_CHUNK => Some((len - 1) as u8),
        _ => None,
    }
}

/// Address the target touches for the `index`th word of a transfer at `start`
///
/// The chip increments only the low five bits, so transfers wrap inside
/// the aligned 32 word block instead of spilling into the next one.
pub fn wrapped_address(start: u16, index: usize) -> u16 {
    (start & !CHUNK_MASK) | (start.wrapping_add(index as u16) & CHUNK_MASK)
}

/// Base address of the page containing `address`
pub fn page_base(address: u16) -> u16 {
    address & !(PAGE_WORDS - 1)
}

/// Accumulate a bit received MSB first (status bytes)
pub fn shift_in_msb(acc: u8, bit: bool) -> u8 {
    (acc << 1) | bit as u8
}

/// Accumulate a bit received LSB first (data words)
///
/// Each new bit enters at bit 15, so after 16 bits the first one lands in bit 0.
pub fn shift_in_lsb(acc: u16, bit: bool) -> u16 {
    (acc >> 1) | if bit { 0x8000 } else { 0 }
}
