//! Simulated SN8F target.
//!
//! `SimTarget` implements [`IspGpio`] and follows the pin activity the way
//! the chip does: it shifts in opcodes and words on clock rising edges while
//! the data line is driven by the programmer, and drives status bits, data
//! words and the ready signal while the programmer is reading. Used by the
//! unit tests and by the utility's `--sim` dry run.

use std::collections::HashMap;
use std::convert::Infallible;

use embedded_hal::blocking::delay::{DelayMs, DelayUs};

use crate::protocol::*;
use crate::{Direction, IspGpio, Pins};

/// Status answered for a frame whose complement does not match
const BAD_STATUS: u8 = 0x00;

const MEMORY_WORDS: usize = 0x10000;

const ERASED: u16 = 0xFFFF;

#[derive(Copy, Clone, PartialEq, Debug)]
struct Line {
    direction: Direction,
    level: bool,
}

impl Default for Line {
    fn default() -> Self {
        Self { direction: Direction::Input, level: false }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum Stage {
    Opcode,
    Address,
    Data,
    Output,
    Done,
}

#[derive(Clone, Debug)]
struct Transfer {
    command: Command,
    words: usize,
    address: u16,
    data: Vec<u16>,
}

#[derive(Clone, PartialEq, Debug)]
enum Phase {
    Idle,
    /// Capturing the unlock sequence
    Unlock { clocks: u32, program: u64, enable: u64 },
    /// Shifting in a framed value of `width` bits
    Shift { value: u64, bits: u32, width: u32 },
    /// Status byte out followed by a turnaround clock
    Status { status: u8, clocks: u32 },
    Turnaround { left: u32 },
    /// LSB first word output
    WordOut { index: usize, bit: u32 },
    Busy { left: u32 },
    /// Remaining status bits after the ready signal
    Completion { status: u8, sent: u32 },
}

/// Protocol level model of an SN8F chip attached to the ISP lines
pub struct SimTarget {
    pins: Pins,
    lines: HashMap<u32, Line>,
    powered: bool,
    out: bool,

    phase: Phase,
    stage: Stage,
    transfer: Option<Transfer>,
    memory: Vec<u16>,

    chip_id: u16,
    status: u8,
    check_status: Option<u8>,
    opcode_status: Option<(u8, u8)>,
    completion_status: u8,
    busy_ticks: u32,

    unlocked: bool,
    opcodes: Vec<u8>,
    addresses: Vec<u16>,
    clock_log: Vec<(bool, bool)>,
    busy_clocks: u32,
}

impl SimTarget {
    /// Create an erased, unpowered target wired to `pins`
    pub fn new(pins: Pins) -> Self {
        Self {
            pins,
            lines: HashMap::new(),
            powered: false,
            out: false,
            phase: Phase::Idle,
            stage: Stage::Done,
            transfer: None,
            memory: vec![ERASED; MEMORY_WORDS],
            chip_id: SN8F2288_FAMILY | 0x01,
            status: RES_OK,
            check_status: None,
            opcode_status: None,
            completion_status: RES_OK,
            busy_ticks: 8,
            unlocked: false,
            opcodes: Vec::new(),
            addresses: Vec::new(),
            clock_log: Vec::new(),
            busy_clocks: 0,
        }
    }

    pub fn with_chip_id(mut self, id: u16) -> Self {
        self.chip_id = id;
        self
    }

    /// Status answered after every framed phase
    pub fn with_status(mut self, status: u8) -> Self {
        self.status = status;
        self
    }

    /// Status answered to the check opcode only
    pub fn with_check_status(mut self, status: u8) -> Self {
        self.check_status = Some(status);
        self
    }

    /// Status answered to one specific opcode
    pub fn with_opcode_status(mut self, opcode: u8, status: u8) -> Self {
        self.opcode_status = Some((opcode, status));
        self
    }

    /// Status reported once an erase or write completes, the MSB doubles as ready
    pub fn with_completion_status(mut self, status: u8) -> Self {
        self.completion_status = status;
        self
    }

    /// Clocks an erase or write stays busy before signalling ready
    pub fn with_busy_ticks(mut self, ticks: u32) -> Self {
        self.busy_ticks = ticks;
        self
    }

    pub fn word(&self, address: u16) -> u16 {
        self.memory[address as usize]
    }

    pub fn set_word(&mut self, address: u16, word: u16) {
        self.memory[address as usize] = word;
    }

    pub fn powered(&self) -> bool {
        self.powered
    }

    /// Whether the unlock sequence was received since power up
    pub fn unlocked(&self) -> bool {
        self.unlocked
    }

    /// Valid opcodes received, in order
    pub fn opcodes(&self) -> &[u8] {
        &self.opcodes
    }

    /// Addresses received, in order
    pub fn addresses(&self) -> &[u16] {
        &self.addresses
    }

    /// (program, output enable) levels at each clock driven by the programmer
    pub fn clock_log(&self) -> &[(bool, bool)] {
        &self.clock_log
    }

    /// Clocks spent waiting in the most recent busy period
    pub fn busy_clocks(&self) -> u32 {
        self.busy_clocks
    }

    /// All lines driven, power off and the rest low
    pub fn lines_parked(&self) -> bool {
        let p = &self.pins;
        let out = |pin: u32, level: bool| {
            self.line(pin) == Line { direction: Direction::Output, level }
        };

        out(p.power, true)
            && out(p.clock, false)
            && out(p.output_enable, false)
            && out(p.program, false)
            && out(p.data, false)
    }

    fn line(&self, pin: u32) -> Line {
        self.lines.get(&pin).copied().unwrap_or_default()
    }

    fn update_power(&mut self) {
        let power = self.line(self.pins.power);
        let powered = power.direction == Direction::Output && !power.level;

        if powered != self.powered {
            debug!("Target {}", if powered { "powered" } else { "unpowered" });

            self.powered = powered;
            self.out = false;
            self.phase = Phase::Idle;
            self.transfer = None;
            self.unlocked = false;
        }
    }

    fn rising(&mut self) {
        let writing = self.line(self.pins.data).direction == Direction::Output;
        let program = self.line(self.pins.program).level;
        let enable = self.line(self.pins.output_enable).level;

        let phase = std::mem::replace(&mut self.phase, Phase::Idle);

        self.phase = if writing {
            self.clock_log.push((program, enable));
            self.clock_in(phase, program, enable)
        } else {
            self.clock_out(phase)
        };
    }

    fn clock_in(&mut self, phase: Phase, program: bool, enable: bool) -> Phase {
        match phase {
            Phase::Shift { value, bits, width } => {
                let value = value << 1 | enable as u64;
                if bits + 1 == width {
                    self.shifted(value, width)
                } else {
                    Phase::Shift { value, bits: bits + 1, width }
                }
            },
            Phase::Unlock { clocks, program: p, enable: e } => {
                let p = p << 1 | program as u64;
                let e = e << 1 | enable as u64;
                if clocks + 1 == 64 {
                    self.unlocked = (p, e) == unlock_bits();
                    debug!("Unlock sequence {}", if self.unlocked { "accepted" } else { "rejected" });
                    Phase::Idle
                } else {
                    Phase::Unlock { clocks: clocks + 1, program: p, enable: e }
                }
            },
            // Anything else starts a new exchange
            _ => {
                self.transfer = None;
                if program {
                    self.stage = Stage::Opcode;
                    Phase::Shift { value: enable as u64, bits: 1, width: 16 }
                } else {
                    Phase::Unlock { clocks: 1, program: 0, enable: enable as u64 }
                }
            },
        }
    }

    fn clock_out(&mut self, phase: Phase) -> Phase {
        match phase {
            Phase::Status { status, clocks } if clocks < 8 => {
                self.out = status & (0x80 >> clocks) != 0;
                Phase::Status { status, clocks: clocks + 1 }
            },
            Phase::Status { status, .. } => {
                self.out = false;
                if status == RES_OK {
                    self.advance()
                } else {
                    self.transfer = None;
                    Phase::Idle
                }
            },
            Phase::Turnaround { left } => {
                self.out = false;
                if left > 1 {
                    Phase::Turnaround { left: left - 1 }
                } else {
                    Phase::WordOut { index: 0, bit: 0 }
                }
            },
            Phase::WordOut { index, bit } => {
                let (word, words) = self.output_word(index);
                self.out = (word >> bit) & 1 != 0;

                if bit < 15 {
                    Phase::WordOut { index, bit: bit + 1 }
                } else if index + 1 < words {
                    Phase::WordOut { index: index + 1, bit: 0 }
                } else {
                    self.stage = Stage::Done;
                    Phase::Status { status: self.status, clocks: 0 }
                }
            },
            Phase::Busy { left } => {
                self.busy_clocks += 1;
                if left > 0 {
                    self.out = false;
                    Phase::Busy { left: left - 1 }
                } else {
                    let status = self.completion_status;
                    self.out = status & 0x80 != 0;
                    Phase::Completion { status, sent: 1 }
                }
            },
            Phase::Completion { status, sent } if sent < 8 => {
                self.out = status & (0x80 >> sent) != 0;
                Phase::Completion { status, sent: sent + 1 }
            },
            Phase::Completion { status, .. } => {
                self.out = false;
                if status == RES_OK {
                    self.commit();
                }
                self.transfer = None;
                Phase::Idle
            },
            // Turnaround and trailing clocks
            other => {
                self.out = false;
                other
            },
        }
    }

    /// Handle a fully shifted frame, answering with a status byte
    fn shifted(&mut self, value: u64, width: u32) -> Phase {
        let status = if width == 16 {
            let opcode = (value >> 8) as u8;
            match Command::decode(opcode) {
                Some((command, extra)) if value as u8 == !opcode => {
                    trace!("Sim opcode 0x{:02x}", opcode);
                    self.opcodes.push(opcode);
                    self.transfer = Some(Transfer {
                        command,
                        words: extra as usize + 1,
                        address: 0,
                        data: Vec::new(),
                    });
                    self.status_for(opcode)
                },
                _ => BAD_STATUS,
            }
        } else {
            let word = (value >> 16) as u16;
            match self.transfer.as_mut() {
                Some(t) if value as u16 == !word => {
                    if self.stage == Stage::Address {
                        t.address = word;
                        self.addresses.push(word);
                    } else {
                        t.data.push(word);
                    }
                    self.status
                },
                _ => BAD_STATUS,
            }
        };

        Phase::Status { status, clocks: 0 }
    }

    fn status_for(&self, opcode: u8) -> u8 {
        match (opcode, self.check_status, self.opcode_status) {
            (0x00, Some(s), _) => s,
            (o, _, Some((m, s))) if o == m => s,
            _ => self.status,
        }
    }

    /// Move on after a successful status byte
    fn advance(&mut self) -> Phase {
        let (command, pending) = match self.transfer.as_ref() {
            Some(t) => (t.command, t.data.len() < t.words),
            None => return Phase::Idle,
        };

        match (self.stage, command) {
            (Stage::Opcode, Command::Check) => {
                self.transfer = None;
                Phase::Idle
            },
            (Stage::Opcode, Command::ChipId) => {
                self.stage = Stage::Output;
                Phase::Turnaround { left: 3 }
            },
            (Stage::Opcode, _) => {
                self.stage = Stage::Address;
                Phase::Shift { value: 0, bits: 0, width: 32 }
            },
            (Stage::Address, Command::Read) => {
                self.stage = Stage::Output;
                Phase::Turnaround { left: 2 }
            },
            (Stage::Address, Command::Write) => {
                self.stage = Stage::Data;
                Phase::Shift { value: 0, bits: 0, width: 32 }
            },
            (Stage::Data, Command::Write) if pending => {
                Phase::Shift { value: 0, bits: 0, width: 32 }
            },
            (Stage::Address, _) | (Stage::Data, _) => {
                self.busy_clocks = 0;
                Phase::Busy { left: self.busy_ticks }
            },
            _ => {
                self.transfer = None;
                Phase::Idle
            },
        }
    }

    fn output_word(&self, index: usize) -> (u16, usize) {
        match self.transfer.as_ref() {
            Some(t) if t.command == Command::ChipId => (self.chip_id, 1),
            Some(t) => (self.word(wrapped_address(t.address, index)), t.words),
            None => (0, 1),
        }
    }

    /// Apply a completed erase or write
    fn commit(&mut self) {
        let t = match self.transfer.take() {
            Some(t) => t,
            None => return,
        };

        match t.command {
            Command::Write => {
                for (i, w) in t.data.iter().enumerate() {
                    let a = wrapped_address(t.address, i) as usize;
                    self.memory[a] &= *w;
                }
            },
            Command::ErasePage => {
                let base = page_base(t.address) as usize;
                for w in &mut self.memory[base..base + PAGE_WORDS as usize] {
                    *w = ERASED;
                }
            },
            Command::EraseAll => {
                for w in self.memory.iter_mut() {
                    *w = ERASED;
                }
            },
            _ => (),
        }
    }
}

fn unlock_bits() -> (u64, u64) {
    UNLOCK_SEQUENCE.iter().fold((0, 0), |(p, e), &(program, enable)| {
        (p << 8 | program as u64, e << 8 | enable as u64)
    })
}

impl IspGpio<Infallible> for SimTarget {
    fn set_direction(&mut self, pin: u32, direction: Direction) -> Result<(), Infallible> {
        self.lines.entry(pin).or_default().direction = direction;

        if pin == self.pins.power {
            self.update_power();
        }

        Ok(())
    }

    fn write(&mut self, pin: u32, high: bool) -> Result<(), Infallible> {
        let line = self.lines.entry(pin).or_default();
        let rising = high && !line.level;
        line.level = high;

        if pin == self.pins.power {
            self.update_power();
        } else if pin == self.pins.clock && rising && self.powered {
            self.rising();
        }

        Ok(())
    }

    fn read(&mut self, pin: u32) -> Result<bool, Infallible> {
        let line = self.line(pin);

        if pin == self.pins.data && line.direction == Direction::Input {
            return Ok(self.powered && self.out);
        }

        Ok(line.level)
    }
}

/// Delay that only records how long it was asked to wait
#[derive(Clone, PartialEq, Debug, Default)]
pub struct SimDelay {
    pub us: u64,
    pub ms: u64,
}

impl DelayUs<u32> for SimDelay {
    fn delay_us(&mut self, us: u32) {
        self.us += us as u64;
    }
}

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.ms += ms as u64;
    }
}
