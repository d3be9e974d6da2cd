//! Single-wire humidity/temperature sensor (DHT22-class). Bit-banged: the
//! host switches one GPIO pin between output and input to issue the start
//! pulse and then reads back forty data bits by timing the low/high
//! duration of each.

use std::thread;
use std::time::{Duration, Instant};

use rppal::gpio::{IoPin, Level, Mode};

use super::Module;
use crate::agent::config::ModuleConfig;
use crate::agent::errors::{Error, Result};
use crate::agent::io_hub::IoHub;
use crate::agent::pin_map::map_physical_to_gpio;
use crate::agent::store::SensorReading;

const START_LOW: Duration = Duration::from_millis(18);
const RESPONSE_TIMEOUT: Duration = Duration::from_micros(200);
const BIT_ONE_THRESHOLD_US: u128 = 50;

struct Frame {
    humidity_x10: i32,
    temperature_x10: i32,
}

fn wait_for_level(pin: &IoPin, level: Level, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while pin.read() != level {
        if Instant::now() >= deadline {
            return false;
        }
    }
    true
}

/// Reads one 40-bit frame: humidity (16 bits), temperature (16 bits),
/// checksum (8 bits). Returns `None` on checksum mismatch or a timed-out
/// edge anywhere in the sequence.
fn read_frame(pin: &mut IoPin) -> Option<Frame> {
    pin.set_mode(Mode::Output);
    pin.set_low();
    thread::sleep(START_LOW);
    pin.set_high();
    pin.set_mode(Mode::Input);

    if !wait_for_level(pin, Level::Low, RESPONSE_TIMEOUT) {
        return None;
    }
    if !wait_for_level(pin, Level::High, RESPONSE_TIMEOUT) {
        return None;
    }
    if !wait_for_level(pin, Level::Low, RESPONSE_TIMEOUT) {
        return None;
    }

    let mut bytes = [0u8; 5];
    for byte in bytes.iter_mut() {
        for _ in 0..8 {
            if !wait_for_level(pin, Level::High, RESPONSE_TIMEOUT) {
                return None;
            }
            let high_started = Instant::now();
            if !wait_for_level(pin, Level::Low, RESPONSE_TIMEOUT) {
                return None;
            }
            let high_us = high_started.elapsed().as_micros();
            *byte <<= 1;
            if high_us > BIT_ONE_THRESHOLD_US {
                *byte |= 1;
            }
        }
    }

    let checksum = bytes[0].wrapping_add(bytes[1]).wrapping_add(bytes[2]).wrapping_add(bytes[3]);
    if checksum != bytes[4] {
        return None;
    }

    let humidity_x10 = ((bytes[0] as i32) << 8 | bytes[1] as i32) as i32;
    let raw_temp = (bytes[2] as i32 & 0x7f) << 8 | bytes[3] as i32;
    let temperature_x10 = if bytes[2] & 0x80 != 0 { -raw_temp } else { raw_temp };

    Some(Frame { humidity_x10, temperature_x10 })
}

pub struct DhtModule {
    config: ModuleConfig,
    pin: IoPin,
    next_due_ms: u64,
}

impl DhtModule {
    pub fn new(config: ModuleConfig, io: &IoHub) -> Result<DhtModule> {
        let physical = config.pin("PIN").ok_or_else(|| Error::config_invalid("module.pins.PIN"))?;
        let bcm = map_physical_to_gpio(physical).ok_or_else(|| Error::config_invalid("module.pins.PIN"))?;

        let gpio = io.gpio()?;
        let pin = gpio.get(bcm).map_err(|_| Error::module_init("DhtModule", &config.name))?.into_io(Mode::Input);

        Ok(DhtModule { config, pin, next_due_ms: 0 })
    }
}

impl Module for DhtModule {
    fn config(&self) -> &ModuleConfig {
        &self.config
    }

    fn patch_config(&mut self, config: ModuleConfig) {
        self.config = config;
    }

    fn tick(&mut self, now_ms: u64) -> Result<Vec<SensorReading>> {
        if now_ms < self.next_due_ms {
            return Ok(Vec::new());
        }

        self.next_due_ms += self.config.interval_ms as u64;

        let frame = match read_frame(&mut self.pin) {
            Some(frame) => frame,
            None => return Ok(Vec::new()),
        };

        let mut readings = Vec::new();
        for sensor in &self.config.sensors {
            match sensor.kind.as_str() {
                "TEMPERATURE" => readings.push(SensorReading {
                    sensor_id: sensor.id,
                    value: frame.temperature_x10 as f64 / 10.0,
                    created_at_ms: now_ms,
                }),
                "HUMIDITY" => {
                    readings.push(SensorReading { sensor_id: sensor.id, value: frame.humidity_x10 as f64 / 10.0, created_at_ms: now_ms })
                }
                _ => {}
            }
        }

        Ok(readings)
    }

    fn on_destroy(&mut self) {}
}
