//! Process-wide broker for the GPIO chip and I2C/SPI buses.
//!
//! Handles are created lazily on first request and shared by every caller
//! thereafter (cloning `rppal`'s handles is cheap — they're thin wrappers
//! around an `fd`/ioctl interface). `shutdown()` drops them in reverse
//! init order; after that any call to `gpio()`/`i2c()`/`spi()` re-opens a
//! fresh handle on demand, matching the broker's "lazy init" contract.

use std::sync::{Arc, Mutex};

use rppal::gpio::Gpio;
use rppal::i2c::I2c;
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

use super::errors::{Error, Result};

pub struct IoHub {
    gpio: Mutex<Option<Gpio>>,
    i2c: Mutex<Option<Arc<Mutex<I2c>>>>,
    spi: Mutex<Option<Arc<Mutex<Spi>>>>,
}

impl IoHub {
    pub fn new() -> IoHub {
        IoHub {
            gpio: Mutex::new(None),
            i2c: Mutex::new(None),
            spi: Mutex::new(None),
        }
    }

    /// Returns the shared GPIO chip handle, opening it on first call.
    /// `Gpio` is a cheap, cloneable wrapper in `rppal` — every caller gets
    /// its own handle onto the same underlying chip.
    pub fn gpio(&self) -> Result<Gpio> {
        let mut slot = self.gpio.lock().unwrap();
        if slot.is_none() {
            *slot = Some(Gpio::new().map_err(|_| Error::io_init("gpio"))?);
        }
        Ok(slot.as_ref().unwrap().clone())
    }

    /// Returns the shared I2C bus handle (bus 1, the default on
    /// Raspberry-Pi-class boards), opening it on first call. Unlike
    /// `Gpio`, `I2c` owns a file descriptor and can't be cloned, so
    /// callers share one instance behind a mutex.
    pub fn i2c(&self) -> Result<Arc<Mutex<I2c>>> {
        let mut slot = self.i2c.lock().unwrap();
        if slot.is_none() {
            let i2c = I2c::new().map_err(|_| Error::io_init("i2c"))?;
            *slot = Some(Arc::new(Mutex::new(i2c)));
        }
        Ok(slot.as_ref().unwrap().clone())
    }

    /// Returns the shared SPI bus handle, opening it on first call.
    pub fn spi(&self) -> Result<Arc<Mutex<Spi>>> {
        let mut slot = self.spi.lock().unwrap();
        if slot.is_none() {
            let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, 1_000_000, Mode::Mode0).map_err(|_| Error::io_init("spi"))?;
            *slot = Some(Arc::new(Mutex::new(spi)));
        }
        Ok(slot.as_ref().unwrap().clone())
    }

    /// Releases all three handles, in reverse init order (SPI, then I2C,
    /// then GPIO).
    pub fn shutdown(&self) {
        *self.spi.lock().unwrap() = None;
        *self.i2c.lock().unwrap() = None;
        *self.gpio.lock().unwrap() = None;
    }
}

impl Default for IoHub {
    fn default() -> Self {
        Self::new()
    }
}
