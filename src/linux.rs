use std::collections::HashMap;

use linux_embedded_hal::sysfs_gpio::{Direction as SysfsDirection, Error as GpioError, Pin};
use linux_embedded_hal::Delay;

use crate::{Direction, IspGpio, Options, Pins, Programmer};

/// ISP lines exported through the sysfs GPIO interface
pub struct SysfsGpio {
    pins: HashMap<u32, Pin>,
}

impl SysfsGpio {
    /// Export the five ISP lines
    pub fn new(pins: &Pins) -> Result<Self, GpioError> {
        let mut exported = HashMap::new();

        for &n in &[pins.power, pins.clock, pins.output_enable, pins.program, pins.data] {
            debug!("Exporting GPIO {}", n);

            let pin = Pin::new(n as u64);
            pin.export()?;
            exported.insert(n, pin);
        }

        Ok(Self{ pins: exported })
    }

    fn pin(&self, n: u32) -> Result<&Pin, GpioError> {
        self.pins.get(&n)
            .ok_or_else(|| GpioError::Unexpected(format!("GPIO {} not exported", n)))
    }

    /// Unexport all lines, leaving them to the kernel
    pub fn unexport(self) -> Result<(), GpioError> {
        for (_n, pin) in self.pins {
            pin.unexport()?;
        }
        Ok(())
    }
}

impl IspGpio<GpioError> for SysfsGpio {
    fn set_direction(&mut self, pin: u32, direction: Direction) -> Result<(), GpioError> {
        let d = match direction {
            Direction::Input => SysfsDirection::In,
            Direction::Output => SysfsDirection::Out,
        };
        self.pin(pin)?.set_direction(d)
    }

    fn write(&mut self, pin: u32, high: bool) -> Result<(), GpioError> {
        self.pin(pin)?.set_value(high as u8)
    }

    fn read(&mut self, pin: u32) -> Result<bool, GpioError> {
        let v = self.pin(pin)?.get_value()?;
        Ok(v != 0)
    }
}

impl Programmer<SysfsGpio, Delay, GpioError> {
    /// Create a new linux sysfs GPIO programmer instance
    pub fn linux(options: Options) -> Result<Self, GpioError> {
        // Export lines
        let gpio = SysfsGpio::new(&options.pins)?;

        // Return instance
        Ok(Self::new(gpio, Delay {}, options))
    }
}
