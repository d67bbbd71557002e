//! SONiX SN8F In-System Programmer.
//!
//! Bit-banged driver for the five wire ISP interface (power, clock, output
//! enable, program and data) used by SN8F flash microcontrollers.

use core::marker::PhantomData;

#[macro_use]
extern crate log;

extern crate embedded_hal;
use embedded_hal::blocking::delay::{DelayMs, DelayUs};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub mod protocol;
use protocol::*;

mod transport;

/// Pin direction as seen from the programmer
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Direction {
    Input,
    Output,
}

/// Digital IO capability used to drive the programming lines
pub trait IspGpio<E> {
    fn set_direction(&mut self, pin: u32, direction: Direction) -> Result<(), E>;
    fn write(&mut self, pin: u32, high: bool) -> Result<(), E>;
    fn read(&mut self, pin: u32) -> Result<bool, E>;
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<GpioError> {
    #[error("gpio error: {0:?}")]
    Gpio(GpioError),

    #[error("invalid transfer length {0} (expected 1 to 32 words)")]
    InvalidLength(usize),

    #[error("chip check failed (status 0x{0:02x})")]
    ChipCheck(u8),

    #[error("unexpected status 0x{0:02x}")]
    InvalidStatus(u8),

    #[error("timeout waiting for operation to complete")]
    CompletionTimeout,

    #[error("unexpected chip id 0x{0:04x}")]
    UnexpectedChipId(u16),
}

impl<GpioError> From<GpioError> for Error<GpioError> {
    fn from(e: GpioError) -> Self {
        Self::Gpio(e)
    }
}

/// Parse a decimal or `0x` prefixed hexadecimal number
pub fn parse_u16(s: &str) -> Result<u16, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u16::from_str_radix(h, 16),
        None => s.parse(),
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Pins {
    /// Power enable line (active low)
    #[cfg_attr(feature = "structopt", structopt(long = "pin-power", default_value="8"))]
    pub power: u32,

    /// Clock line
    #[cfg_attr(feature = "structopt", structopt(long = "pin-clock", default_value="9"))]
    pub clock: u32,

    /// Output enable / serial data out line
    #[cfg_attr(feature = "structopt", structopt(long = "pin-oe", default_value="10"))]
    pub output_enable: u32,

    /// Program mode line
    #[cfg_attr(feature = "structopt", structopt(long = "pin-program", default_value="11"))]
    pub program: u32,

    /// Bidirectional data line
    #[cfg_attr(feature = "structopt", structopt(long = "pin-data", default_value="12"))]
    pub data: u32,
}

impl Default for Pins {
    fn default() -> Self {
        Self { power: 8, clock: 9, output_enable: 10, program: 11, data: 12 }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    #[cfg_attr(feature = "structopt", structopt(flatten))]
    pub pins: Pins,

    /// Code memory size in words
    #[cfg_attr(feature = "structopt", structopt(long, default_value="0x3000", parse(try_from_str = parse_u16)))]
    pub code_size: u16,

    /// User memory size in words
    #[cfg_attr(feature = "structopt", structopt(long, default_value="0x2FF8", parse(try_from_str = parse_u16)))]
    pub user_size: u16,

    /// Expected chip family (chip ID with the low nibble masked)
    #[cfg_attr(feature = "structopt", structopt(long, default_value="0x2700", parse(try_from_str = parse_u16)))]
    pub family: u16,

    /// Clock half period
    #[cfg_attr(feature = "structopt", structopt(long, default_value="100"))]
    pub clock_delay_us: u32,

    /// Settle time after changing the line configuration
    #[cfg_attr(feature = "structopt", structopt(long, default_value="100"))]
    pub settle_delay_us: u32,

    /// Time to hold the target unpowered before powering up
    #[cfg_attr(feature = "structopt", structopt(long, default_value="100"))]
    pub power_off_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pins: Pins::default(),
            code_size: 0x3000,
            user_size: 0x2FF8,
            family: SN8F2288_FAMILY,
            clock_delay_us: 100,
            settle_delay_us: 100,
            power_off_ms: 100,
        }
    }
}

impl Options {
    /// Address of the code option word (last word of code memory)
    pub fn code_option_address(&self) -> u16 {
        self.code_size.wrapping_sub(1)
    }
}

/// Programming session, owns the five ISP lines exclusively
pub struct Programmer<G, D, E> {
    mode: Mode,
    options: Options,
    gpio: G,
    delay: D,
    _err: PhantomData<E>,
}

impl <G, D, E> Programmer<G, D, E>
where
    G: IspGpio<E>,
    D: DelayUs<u32> + DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance, no IO is performed until power up
    pub fn new(gpio: G, delay: D, options: Options) -> Self {
        Self{mode: Mode::Unknown, options, gpio, delay, _err: PhantomData}
    }

    /// Fetch the current line configuration
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn gpio(&self) -> &G {
        &self.gpio
    }

    pub fn delay(&self) -> &D {
        &self.delay
    }

    /// Consume the programmer, returning the underlying GPIO and delay
    pub fn release(self) -> (G, D) {
        (self.gpio, self.delay)
    }

    /// Power cycle the target, leaving it powered with all lines low
    pub fn power_up(&mut self) -> Result<(), Error<E>> {
        self.shutdown()?;

        self.delay.delay_ms(self.options.power_off_ms);

        debug!("Powering up target");
        self.gpio.write(self.options.pins.power, false)?;

        Ok(())
    }

    /// Drive every line low and remove power from the target
    pub fn shutdown(&mut self) -> Result<(), Error<E>> {
        debug!("Shutting down target");

        let p = self.options.pins.clone();

        for pin in &[p.power, p.clock, p.output_enable, p.program, p.data] {
            self.gpio.set_direction(*pin, Direction::Output)?;
        }

        self.gpio.write(p.clock, false)?;
        self.gpio.write(p.output_enable, false)?;
        self.gpio.write(p.program, false)?;
        self.gpio.write(p.data, false)?;
        self.gpio.write(p.power, true)?;

        self.mode = Mode::Unknown;

        Ok(())
    }

    /// Power up and send the unlock sequence
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        self.power_up()?;
        self.unlock()
    }

    /// Configure the lines for shifting data into the target
    pub fn set_write_mode(&mut self) -> Result<(), Error<E>> {
        self.apply_mode(Mode::Write)
    }

    /// Configure the lines for sampling data from the target
    pub fn set_read_mode(&mut self) -> Result<(), Error<E>> {
        self.apply_mode(Mode::Read)
    }

    /// Write mode with the program line low, re-applied on every call
    pub(crate) fn set_write_data_mode(&mut self) -> Result<(), Error<E>> {
        self.apply_mode(Mode::WriteData)
    }

    fn apply_mode(&mut self, requested: Mode) -> Result<(), Error<E>> {
        let next = match self.mode.transition(requested) {
            Some(m) => m,
            None => return Ok(()),
        };

        let p = self.options.pins.clone();

        if next == Mode::WriteData {
            self.apply_mode(Mode::Write)?;
            self.gpio.write(p.program, false)?;
            self.mode = Mode::WriteData;
            return Ok(());
        }

        if next == Mode::Read {
            // TODO: check the datasheet for whether the data line needs a pull-up while reading
            self.gpio.set_direction(p.data, Direction::Input)?;
        } else {
            self.gpio.set_direction(p.data, Direction::Output)?;
            self.gpio.write(p.data, false)?;
        }

        self.gpio.write(p.clock, false)?;
        self.gpio.write(p.output_enable, false)?;
        self.gpio.write(p.program, next == Mode::Write)?;

        self.delay.delay_us(self.options.settle_delay_us);

        trace!("Mode {:?} -> {:?}", self.mode, next);
        self.mode = next;

        Ok(())
    }

    /// Liveness check, every other command starts with one
    pub fn check(&mut self) -> Result<(), Error<E>> {
        match self.send_opcode(Command::Check.opcode(0)) {
            Err(Error::InvalidStatus(s)) => {
                warn!("Chip check failed (status 0x{:02x})", s);
                Err(Error::ChipCheck(s))
            },
            r => r,
        }
    }

    /// Read a single word
    pub fn read_word(&mut self, address: u16) -> Result<u16, Error<E>> {
        let mut data = [0u16; 1];
        self.read_words(address, &mut data)?;
        Ok(data[0])
    }

    /// Read 1 to 32 words into `data`
    ///
    /// The target wraps inside the aligned 32 word block, so a transfer
    /// crossing a 0x20 boundary continues from the start of the same block.
    pub fn read_words(&mut self, address: u16, data: &mut [u16]) -> Result<(), Error<E>> {
        let extra = word_count(data.len()).ok_or(Error::InvalidLength(data.len()))?;

        debug!("Reading {} word(s) at 0x{:04x}", data.len(), address);

        self.check()?;
        self.send_opcode(Command::Read.opcode(extra))?;
        self.send_word(address)?;

        self.clk()?;
        self.clk()?;

        for w in data.iter_mut() {
            *w = self.receive_word()?;
        }

        self.read_status()?;

        self.clk()?;
        self.clk()?;

        Ok(())
    }

    /// Program a single word
    pub fn write_word(&mut self, address: u16, word: u16) -> Result<(), Error<E>> {
        self.write_words(address, &[word])
    }

    /// Program 1 to 32 words, wrapping like `read_words`
    pub fn write_words(&mut self, address: u16, data: &[u16]) -> Result<(), Error<E>> {
        let extra = word_count(data.len()).ok_or(Error::InvalidLength(data.len()))?;

        debug!("Writing {} word(s) at 0x{:04x}", data.len(), address);

        self.check()?;
        self.send_opcode(Command::Write.opcode(extra))?;
        self.send_word(address)?;

        for w in data {
            self.send_word(*w)?;
        }

        self.wait_status(WRITE_TICKS)?;

        self.clk()?;
        self.clk()?;

        Ok(())
    }

    /// Erase the whole code memory
    pub fn erase_all(&mut self) -> Result<(), Error<E>> {
        debug!("Erasing chip");

        self.check()?;
        self.send_opcode(Command::EraseAll.opcode(0))?;
        self.send_word(0)?;
        self.wait_status(ERASE_ALL_TICKS)?;

        self.clk()?;
        self.clk()?;

        Ok(())
    }

    /// Erase the 128 word page containing `address`
    pub fn erase_page(&mut self, address: u16) -> Result<(), Error<E>> {
        let page = page_base(address);

        debug!("Erasing page 0x{:04x}", page);

        self.check()?;
        self.send_opcode(Command::ErasePage.opcode(0))?;
        self.send_word(page)?;
        self.wait_status(ERASE_PAGE_TICKS)?;

        self.clk()?;
        self.clk()?;

        Ok(())
    }

    /// Read the 16 bit chip ID
    pub fn chip_id(&mut self) -> Result<u16, Error<E>> {
        self.check()?;
        self.send_opcode(Command::ChipId.opcode(0))?;

        self.clk()?;
        self.clk()?;
        self.clk()?;

        let id = self.receive_word()?;

        self.read_status()?;

        self.clk()?;
        self.clk()?;

        debug!("Chip ID: 0x{:04x}", id);

        Ok(id)
    }

    /// Read the chip ID and check it belongs to the configured family
    pub fn identify(&mut self) -> Result<u16, Error<E>> {
        let id = self.chip_id()?;

        if id & CHIP_FAMILY_MASK != self.options.family {
            error!("Chip ID 0x{:04x} does not match family 0x{:04x}", id, self.options.family);
            return Err(Error::UnexpectedChipId(id))
        }

        Ok(id)
    }

    /// Read the code option word
    pub fn read_code_option(&mut self) -> Result<u16, Error<E>> {
        let address = self.options.code_option_address();
        self.read_word(address)
    }

    /// Arm erase / write on the target
    ///
    /// The target only accepts erase and program commands after the code
    /// option word has been read, this must follow every unlock and erase.
    pub fn enable_erase_write(&mut self) -> Result<u16, Error<E>> {
        debug!("Enabling erase / write");
        self.read_code_option()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDelay, SimTarget};

    use core::convert::Infallible;

    type SimProgrammer = Programmer<SimTarget, SimDelay, Infallible>;

    fn programmer(target: SimTarget) -> SimProgrammer {
        let mut p: SimProgrammer = Programmer::new(target, SimDelay::default(), Options::default());
        p.power_up().unwrap();
        p
    }

    #[test]
    fn test_power_up_and_shutdown() {
        let mut p = programmer(SimTarget::new(Pins::default()));
        assert!(p.gpio().powered());
        assert_eq!(p.mode(), Mode::Unknown);

        p.check().unwrap();

        p.shutdown().unwrap();
        assert!(!p.gpio().powered());
        assert_eq!(p.mode(), Mode::Unknown);
        assert!(p.gpio().lines_parked());

        // Idempotent
        p.shutdown().unwrap();
        assert!(p.gpio().lines_parked());
    }

    #[test]
    fn test_power_off_time() {
        let p = programmer(SimTarget::new(Pins::default()));
        assert_eq!(p.delay().ms, 100);
    }

    #[test]
    fn test_unpowered_check_fails() {
        let mut p: SimProgrammer = Programmer::new(SimTarget::new(Pins::default()), SimDelay::default(), Options::default());
        p.shutdown().unwrap();
        assert_eq!(p.check(), Err(Error::ChipCheck(0x00)));
    }

    #[test]
    fn test_write_mode_settles_once() {
        let o = Options { settle_delay_us: 250, ..Options::default() };
        let mut p: SimProgrammer = Programmer::new(SimTarget::new(Pins::default()), SimDelay::default(), o);
        p.power_up().unwrap();

        let before = p.delay().us;
        p.set_write_mode().unwrap();
        assert_eq!(p.delay().us - before, 250);
        assert_eq!(p.mode(), Mode::Write);

        p.set_write_mode().unwrap();
        assert_eq!(p.delay().us - before, 250);

        p.set_read_mode().unwrap();
        assert_eq!(p.delay().us - before, 500);
        assert_eq!(p.mode(), Mode::Read);
    }

    #[test]
    fn test_opcode_framing() {
        let mut p = programmer(SimTarget::new(Pins::default()));
        p.chip_id().unwrap();

        // Check opcode then chip ID opcode, each followed by its complement
        let bits: Vec<bool> = p.gpio().clock_log().iter().map(|(_, oe)| *oe).collect();
        let expected = [0x00u8, 0xFF, 0x4A, 0xB5];
        for (i, byte) in expected.iter().enumerate() {
            for b in 0..8 {
                assert_eq!(bits[i * 8 + b], (*byte >> (7 - b)) & 1 != 0);
            }
        }
        assert_eq!(bits.len(), 32);

        // Program line held high for opcodes
        assert!(p.gpio().clock_log().iter().all(|(pgm, _)| *pgm));
    }

    #[test]
    fn test_word_transmission_reapplies_write_data() {
        let mut p = programmer(SimTarget::new(Pins::default()));
        p.check().unwrap();
        p.send_opcode(Command::Read.opcode(0)).unwrap();

        // Cached write mode, the program line is still dropped for the word
        p.set_write_mode().unwrap();
        assert_eq!(p.mode(), Mode::Write);
        let start = p.gpio().clock_log().len();

        p.send_word(0x1234).unwrap();

        let log = &p.gpio().clock_log()[start..];
        assert_eq!(log.len(), 32);
        assert!(log.iter().all(|(pgm, _)| !*pgm));

        let value = log.iter().fold(0u32, |acc, (_, oe)| (acc << 1) | *oe as u32);
        assert_eq!(value, 0x1234_EDCB);
        assert_eq!(p.gpio().addresses(), &[0x1234]);
    }

    #[test]
    fn test_read_write_word() {
        let mut p = programmer(SimTarget::new(Pins::default()));

        for &(address, word) in &[(0x0000, 0x0000), (0x0001, 0xA55A), (0x1234, 0x8001), (0xFFFF, 0x1234)] {
            p.write_word(address, word).unwrap();
            assert_eq!(p.read_word(address).unwrap(), word);
        }

        assert_eq!(p.gpio().word(0x1234), 0x8001);
    }

    #[test]
    fn test_read_word_lsb_first() {
        let mut t = SimTarget::new(Pins::default());
        t.set_word(0x0100, 0x0001);
        t.set_word(0x0101, 0x8000);

        let mut p = programmer(t);
        assert_eq!(p.read_word(0x0100).unwrap(), 0x0001);
        assert_eq!(p.read_word(0x0101).unwrap(), 0x8000);
    }

    #[test]
    fn test_read_words() {
        let mut t = SimTarget::new(Pins::default());
        for i in 0..0x40u16 {
            t.set_word(0x0200 + i, 0x1000 + i);
        }
        let mut p = programmer(t);

        let mut one = [0u16; 1];
        p.read_words(0x0200, &mut one).unwrap();
        assert_eq!(one, [0x1000]);
        assert_eq!(p.gpio().opcodes().last(), Some(&0x80));

        let mut all = [0u16; 32];
        p.read_words(0x0200, &mut all).unwrap();
        assert_eq!(p.gpio().opcodes().last(), Some(&0x9F));
        for (i, w) in all.iter().enumerate() {
            assert_eq!(*w, 0x1000 + i as u16);
        }
    }

    #[test]
    fn test_read_words_wraps_at_block() {
        let mut t = SimTarget::new(Pins::default());
        for i in 0..0x40u16 {
            t.set_word(0x0FE0 + i, i);
        }
        let mut p = programmer(t);

        let mut data = [0u16; 32];
        p.read_words(0x0FF0, &mut data).unwrap();

        // 0xFF0..0xFFF then back to 0xFE0, never 0x1000
        assert_eq!(data[0], 0x10);
        assert_eq!(data[15], 0x1F);
        assert_eq!(data[16], 0x00);
        assert_eq!(data[31], 0x0F);
    }

    #[test]
    fn test_write_words_wraps_at_block() {
        let mut p = programmer(SimTarget::new(Pins::default()));

        let data: Vec<u16> = (0..32).map(|i| 0x5000 + i).collect();
        p.write_words(0x0FF0, &data).unwrap();
        assert_eq!(p.gpio().opcodes().last(), Some(&0xDF));

        assert_eq!(p.gpio().word(0x0FF0), 0x5000);
        assert_eq!(p.gpio().word(0x0FFF), 0x500F);
        assert_eq!(p.gpio().word(0x0FE0), 0x5010);
        assert_eq!(p.gpio().word(0x1000), 0xFFFF);

        let mut back = [0u16; 32];
        p.read_words(0x0FF0, &mut back).unwrap();
        assert_eq!(&back[..], &data[..]);
    }

    #[test]
    fn test_invalid_length() {
        let mut p = programmer(SimTarget::new(Pins::default()));

        let mut empty: [u16; 0] = [];
        assert_eq!(p.read_words(0, &mut empty), Err(Error::InvalidLength(0)));

        let big = [0u16; 33];
        assert_eq!(p.write_words(0, &big), Err(Error::InvalidLength(33)));

        // Rejected before anything is sent
        assert!(p.gpio().opcodes().is_empty());
    }

    #[test]
    fn test_erase_page_masks_address() {
        let mut t = SimTarget::new(Pins::default());
        for a in 0x1180..0x1300u16 {
            t.set_word(a, 0x0000);
        }
        let mut p = programmer(t);

        p.erase_page(0x1234).unwrap();

        assert_eq!(p.gpio().addresses().last(), Some(&0x1200));
        assert_eq!(p.gpio().word(0x11FF), 0x0000);
        assert_eq!(p.gpio().word(0x1200), 0xFFFF);
        assert_eq!(p.gpio().word(0x127F), 0xFFFF);
        assert_eq!(p.gpio().word(0x1280), 0x0000);
    }

    #[test]
    fn test_erase_all() {
        let mut t = SimTarget::new(Pins::default());
        t.set_word(0x0000, 0x0000);
        t.set_word(0x2FFF, 0x1234);
        let mut p = programmer(t);

        p.erase_all().unwrap();

        assert_eq!(p.gpio().opcodes(), &[0x00, 0x60]);
        assert_eq!(p.gpio().addresses(), &[0x0000]);
        assert_eq!(p.read_word(0x0000).unwrap(), 0xFFFF);
        assert_eq!(p.read_word(0x2FFF).unwrap(), 0xFFFF);
    }

    #[test]
    fn test_chip_id() {
        let mut p = programmer(SimTarget::new(Pins::default()).with_chip_id(0x2705));

        assert_eq!(p.chip_id().unwrap(), 0x2705);
        assert_eq!(p.gpio().opcodes(), &[0x00, 0x4A]);
        assert!(p.gpio().addresses().is_empty());

        assert_eq!(p.identify().unwrap(), 0x2705);
    }

    #[test]
    fn test_identify_wrong_family() {
        let mut p = programmer(SimTarget::new(Pins::default()).with_chip_id(0x2511));
        assert_eq!(p.identify(), Err(Error::UnexpectedChipId(0x2511)));
    }

    #[test]
    fn test_check_failure_aborts_operations() {
        let mut p = programmer(SimTarget::new(Pins::default()).with_check_status(0x55));

        assert_eq!(p.check(), Err(Error::ChipCheck(0x55)));
        assert_eq!(p.read_word(0x10), Err(Error::ChipCheck(0x55)));
        let mut buf = [0u16; 4];
        assert_eq!(p.read_words(0x10, &mut buf), Err(Error::ChipCheck(0x55)));
        assert_eq!(p.write_word(0x10, 0), Err(Error::ChipCheck(0x55)));
        assert_eq!(p.write_words(0x10, &[1, 2]), Err(Error::ChipCheck(0x55)));
        assert_eq!(p.erase_all(), Err(Error::ChipCheck(0x55)));
        assert_eq!(p.erase_page(0x80), Err(Error::ChipCheck(0x55)));
        assert_eq!(p.chip_id(), Err(Error::ChipCheck(0x55)));

        // Nothing beyond the check opcode ever reached the target
        assert!(p.gpio().opcodes().iter().all(|o| *o == 0x00));
        assert!(p.gpio().addresses().is_empty());
        assert_eq!(p.gpio().word(0x10), 0xFFFF);
    }

    #[test]
    fn test_status_mismatch() {
        let mut p = programmer(SimTarget::new(Pins::default()).with_status(0xEB));
        assert_eq!(p.check(), Err(Error::ChipCheck(0xEB)));

        let mut p = programmer(SimTarget::new(Pins::default()).with_opcode_status(0x80, 0x6A));
        assert_eq!(p.read_word(0x0000), Err(Error::InvalidStatus(0x6A)));
    }

    #[test]
    fn test_write_completes_within_budget() {
        let mut p = programmer(SimTarget::new(Pins::default()).with_busy_ticks(WRITE_TICKS - 1));
        p.write_word(0x0040, 0x0F0F).unwrap();
        assert_eq!(p.read_word(0x0040).unwrap(), 0x0F0F);
    }

    #[test]
    fn test_write_timeout() {
        let mut p = programmer(SimTarget::new(Pins::default()).with_busy_ticks(WRITE_TICKS));
        assert_eq!(p.write_word(0x0040, 0x0F0F), Err(Error::CompletionTimeout));

        // Gave up after the budget without clocking out a status byte
        assert_eq!(p.gpio().busy_clocks(), WRITE_TICKS);
        assert_eq!(p.gpio().word(0x0040), 0xFFFF);
    }

    #[test]
    fn test_erase_page_budget() {
        let target = |ticks| {
            let mut t = SimTarget::new(Pins::default()).with_busy_ticks(ticks);
            t.set_word(0x0140, 0x1234);
            t
        };

        let mut p = programmer(target(ERASE_PAGE_TICKS - 1));
        p.erase_page(0x0140).unwrap();
        assert_eq!(p.gpio().busy_clocks(), ERASE_PAGE_TICKS);
        assert_eq!(p.gpio().word(0x0140), 0xFFFF);

        let mut p = programmer(target(ERASE_PAGE_TICKS));
        assert_eq!(p.erase_page(0x0140), Err(Error::CompletionTimeout));
        assert_eq!(p.gpio().busy_clocks(), ERASE_PAGE_TICKS);
        assert_eq!(p.gpio().word(0x0140), 0x1234);
    }

    #[test]
    fn test_erase_all_budget() {
        let target = |ticks| {
            let mut t = SimTarget::new(Pins::default()).with_busy_ticks(ticks);
            t.set_word(0x2FFF, 0x1234);
            t
        };

        let mut p = programmer(target(ERASE_ALL_TICKS - 1));
        p.erase_all().unwrap();
        assert_eq!(p.gpio().busy_clocks(), ERASE_ALL_TICKS);
        assert_eq!(p.gpio().word(0x2FFF), 0xFFFF);

        let mut p = programmer(target(ERASE_ALL_TICKS));
        assert_eq!(p.erase_all(), Err(Error::CompletionTimeout));
        assert_eq!(p.gpio().busy_clocks(), ERASE_ALL_TICKS);
        assert_eq!(p.gpio().word(0x2FFF), 0x1234);
    }

    #[test]
    fn test_completion_status_mismatch() {
        // Ready is raised but the final status is wrong
        let mut p = programmer(SimTarget::new(Pins::default()).with_completion_status(0xE8));
        assert_eq!(p.erase_page(0x0000), Err(Error::InvalidStatus(0xE8)));
    }

    #[test]
    fn test_recovers_after_failure() {
        let mut p = programmer(SimTarget::new(Pins::default()).with_opcode_status(0xC0, 0x00));
        assert_eq!(p.write_word(0x0041, 0x1111), Err(Error::InvalidStatus(0x00)));

        p.check().unwrap();
        assert_eq!(p.read_word(0x0041).unwrap(), 0xFFFF);
    }

    #[test]
    fn test_reset_unlocks() {
        let mut p = programmer(SimTarget::new(Pins::default()));
        assert!(!p.gpio().unlocked());

        p.reset().unwrap();
        assert!(p.gpio().unlocked());
        assert_eq!(p.mode(), Mode::Unknown);

        p.check().unwrap();
    }

    #[test]
    fn test_unlock_timing() {
        let o = Options { clock_delay_us: 1, settle_delay_us: 250, ..Options::default() };
        let mut p: SimProgrammer = Programmer::new(SimTarget::new(Pins::default()), SimDelay::default(), o);
        p.power_up().unwrap();
        p.set_write_mode().unwrap();
        assert_eq!(p.mode(), Mode::Write);

        let before = p.delay().us;
        p.unlock().unwrap();

        // Each of the 64 bits settles before its clock pulse
        assert_eq!(p.delay().us - before, 64 * (250 + 2));
        assert!(p.gpio().unlocked());
        assert_eq!(p.mode(), Mode::Unknown);
    }

    #[test]
    fn test_release() {
        let mut p = programmer(SimTarget::new(Pins::default()));
        p.shutdown().unwrap();

        let (target, delay) = p.release();
        assert!(target.lines_parked());
        assert_eq!(delay.ms, 100);
    }

    #[test]
    fn test_enable_erase_write_reads_code_option() {
        let mut t = SimTarget::new(Pins::default());
        t.set_word(0x2FFF, 0x3C5A);
        let mut p = programmer(t);

        assert_eq!(p.enable_erase_write().unwrap(), 0x3C5A);
        assert_eq!(p.gpio().addresses(), &[0x2FFF]);
    }

    #[test]
    fn test_parse_u16() {
        assert_eq!(parse_u16("0x3000"), Ok(0x3000));
        assert_eq!(parse_u16("0X2ff8"), Ok(0x2FF8));
        assert_eq!(parse_u16("128"), Ok(128));
        assert!(parse_u16("0x10000").is_err());
    }
}
