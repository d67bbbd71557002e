//! Clocked bit transport.
//!
//! Values written to the target are shifted out MSB first on the output
//! enable line followed by their complement, and answered with a status
//! byte. Words read back arrive LSB first, status bytes MSB first.

use embedded_hal::blocking::delay::{DelayMs, DelayUs};

use crate::protocol::*;
use crate::{Error, IspGpio, Programmer};

impl <G, D, E> Programmer<G, D, E>
where
    G: IspGpio<E>,
    D: DelayUs<u32> + DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Single clock cycle, every bit in either direction is framed by one
    pub(crate) fn clk(&mut self) -> Result<(), Error<E>> {
        let clock = self.options.pins.clock;

        self.gpio.write(clock, true)?;
        self.delay.delay_us(self.options.clock_delay_us);
        self.gpio.write(clock, false)?;
        self.delay.delay_us(self.options.clock_delay_us);

        Ok(())
    }

    fn sample(&mut self) -> Result<bool, Error<E>> {
        let v = self.gpio.read(self.options.pins.data)?;
        Ok(v)
    }

    /// Shift the low `bits` bits of `value` out MSB first
    fn shift_out(&mut self, value: u32, bits: u32) -> Result<(), Error<E>> {
        let oe = self.options.pins.output_enable;

        for i in (0..bits).rev() {
            self.gpio.write(oe, (value >> i) & 1 != 0)?;
            self.clk()?;
        }

        Ok(())
    }

    /// Send an opcode and its complement, then check the status
    pub(crate) fn send_opcode(&mut self, opcode: u8) -> Result<(), Error<E>> {
        self.set_write_mode()?;

        trace!("Opcode 0x{:02x}", opcode);
        self.shift_out((opcode as u32) << 8 | (!opcode) as u32, 16)?;

        self.read_status()
    }

    /// Send an address or data word and its complement, then check the status
    pub(crate) fn send_word(&mut self, word: u16) -> Result<(), Error<E>> {
        self.set_write_data_mode()?;

        trace!("Word 0x{:04x}", word);
        self.shift_out((word as u32) << 16 | (!word) as u32, 32)?;

        self.read_status()
    }

    /// Receive a data word, first bit in ends up as the LSB
    pub(crate) fn receive_word(&mut self) -> Result<u16, Error<E>> {
        self.set_read_mode()?;

        let mut word = 0;
        for _ in 0..16 {
            self.clk()?;
            word = shift_in_lsb(word, self.sample()?);
        }

        trace!("Read 0x{:04x}", word);

        Ok(word)
    }

    /// Receive a status byte followed by one turnaround clock
    pub(crate) fn read_status(&mut self) -> Result<(), Error<E>> {
        self.set_read_mode()?;

        let mut status = 0;
        for _ in 0..8 {
            self.clk()?;
            status = shift_in_msb(status, self.sample()?);
        }

        self.clk()?;

        check_status(status)
    }

    /// Clock the target until it signals ready, then check the status
    ///
    /// Gives up after `ticks` clocks without reading any status bits.
    pub(crate) fn wait_status(&mut self, ticks: u32) -> Result<(), Error<E>> {
        self.set_read_mode()?;

        let mut ready = false;
        for _ in 0..ticks {
            self.clk()?;
            if self.sample()? {
                ready = true;
                break;
            }
        }

        if !ready {
            error!("No ready signal after {} clocks", ticks);
            return Err(Error::CompletionTimeout);
        }

        // The ready level is the status MSB, sample before clocking
        let mut status = 0;
        for _ in 0..8 {
            status = shift_in_msb(status, self.sample()?);
            self.clk()?;
        }

        check_status(status)
    }

    /// Send the vendor unlock sequence
    ///
    /// The program and output enable lines are driven directly with no
    /// framing or status, so it is meant to follow `power_up` while the data
    /// line is still an output. The cached mode is dropped afterwards.
    pub fn unlock(&mut self) -> Result<(), Error<E>> {
        debug!("Sending unlock sequence");

        let p = self.options.pins.clone();

        for &(program, enable) in UNLOCK_SEQUENCE.iter() {
            for i in (0..8).rev() {
                self.gpio.write(p.program, (program >> i) & 1 != 0)?;
                self.gpio.write(p.output_enable, (enable >> i) & 1 != 0)?;
                self.delay.delay_us(self.options.settle_delay_us);
                self.clk()?;
            }
        }

        self.mode = Mode::Unknown;

        Ok(())
    }
}

fn check_status<E>(status: u8) -> Result<(), Error<E>> {
    if status != RES_OK {
        debug!("Unexpected status: 0x{:02x}", status);
        return Err(Error::InvalidStatus(status))
    }

    Ok(())
}
