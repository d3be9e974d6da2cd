//! Combined temperature/humidity/pressure sensor over I²C, register-level
//! driver implementing the compensation formulas from the Bosch BME280
//! datasheet directly (no vendored HAL driver crate — this codebase talks
//! to I²C through the shared `IoHub` handle the same way every other
//! module does).

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rppal::i2c::I2c;

use super::Module;
use crate::agent::config::ModuleConfig;
use crate::agent::errors::{Error, Result};
use crate::agent::io_hub::IoHub;
use crate::agent::store::SensorReading;

const I2C_ADDRESS: u16 = 0x76;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_CONFIG: u8 = 0xF5;
const REG_CALIB_00: u8 = 0x88;
const REG_CALIB_26: u8 = 0xE1;
const REG_PRESS_MSB: u8 = 0xF7;

struct Calibration {
    dig_t1: u16,
    dig_t2: i16,
    dig_t3: i16,
    dig_p1: u16,
    dig_p2: i16,
    dig_p3: i16,
    dig_p4: i16,
    dig_p5: i16,
    dig_p6: i16,
    dig_p7: i16,
    dig_p8: i16,
    dig_p9: i16,
    dig_h1: u8,
    dig_h2: i16,
    dig_h3: u8,
    dig_h4: i16,
    dig_h5: i16,
    dig_h6: i8,
}

fn read_register_block(i2c: &mut I2c, register: u8, out: &mut [u8]) -> rppal::i2c::Result<()> {
    i2c.write(&[register])?;
    i2c.read(out)?;
    Ok(())
}

fn le_i16(bytes: &[u8]) -> i16 {
    i16::from_le_bytes([bytes[0], bytes[1]])
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn read_calibration(i2c: &mut I2c) -> Result<Calibration> {
    let mut block0 = [0u8; 26];
    read_register_block(i2c, REG_CALIB_00, &mut block0).map_err(|_| Error::io_init("bme280"))?;

    let mut block1 = [0u8; 7];
    read_register_block(i2c, REG_CALIB_26, &mut block1).map_err(|_| Error::io_init("bme280"))?;

    Ok(Calibration {
        dig_t1: le_u16(&block0[0..2]),
        dig_t2: le_i16(&block0[2..4]),
        dig_t3: le_i16(&block0[4..6]),
        dig_p1: le_u16(&block0[6..8]),
        dig_p2: le_i16(&block0[8..10]),
        dig_p3: le_i16(&block0[10..12]),
        dig_p4: le_i16(&block0[12..14]),
        dig_p5: le_i16(&block0[14..16]),
        dig_p6: le_i16(&block0[16..18]),
        dig_p7: le_i16(&block0[18..20]),
        dig_p8: le_i16(&block0[20..22]),
        dig_p9: le_i16(&block0[22..24]),
        dig_h1: block0[25],
        dig_h2: le_i16(&block1[0..2]),
        dig_h3: block1[2],
        dig_h4: ((block1[3] as i16) << 4) | (block1[4] as i16 & 0x0f),
        dig_h5: ((block1[5] as i16) << 4) | (block1[4] as i16 >> 4),
        dig_h6: block1[6] as i8,
    })
}

/// Returns `(temperature_c, pressure_hpa, humidity_rh)` from a raw 8-byte
/// burst read starting at `REG_PRESS_MSB`.
fn compensate(calib: &Calibration, raw: &[u8; 8]) -> (f64, f64, f64) {
    let adc_p = (raw[0] as i32) << 12 | (raw[1] as i32) << 4 | (raw[2] as i32) >> 4;
    let adc_t = (raw[3] as i32) << 12 | (raw[4] as i32) << 4 | (raw[5] as i32) >> 4;
    let adc_h = (raw[6] as i32) << 8 | raw[7] as i32;

    let var1 = (adc_t as f64 / 16384.0 - calib.dig_t1 as f64 / 1024.0) * calib.dig_t2 as f64;
    let var2 = ((adc_t as f64 / 131072.0 - calib.dig_t1 as f64 / 8192.0) * (adc_t as f64 / 131072.0 - calib.dig_t1 as f64 / 8192.0)) * calib.dig_t3 as f64;
    let t_fine = var1 + var2;
    let temperature = t_fine / 5120.0;

    let mut var1 = t_fine / 2.0 - 64000.0;
    let mut var2 = var1 * var1 * calib.dig_p6 as f64 / 32768.0;
    var2 += var1 * calib.dig_p5 as f64 * 2.0;
    var2 = var2 / 4.0 + calib.dig_p4 as f64 * 65536.0;
    var1 = (calib.dig_p3 as f64 * var1 * var1 / 524288.0 + calib.dig_p2 as f64 * var1) / 524288.0;
    var1 = (1.0 + var1 / 32768.0) * calib.dig_p1 as f64;

    let pressure = if var1 == 0.0 {
        0.0
    } else {
        let mut p = 1048576.0 - adc_p as f64;
        p = (p - var2 / 4096.0) * 6250.0 / var1;
        var1 = calib.dig_p9 as f64 * p * p / 2147483648.0;
        var2 = p * calib.dig_p8 as f64 / 32768.0;
        p += (var1 + var2 + calib.dig_p7 as f64) / 16.0;
        p / 100.0
    };

    let mut h = t_fine - 76800.0;
    h = (adc_h as f64 - (calib.dig_h4 as f64 * 64.0 + calib.dig_h5 as f64 / 16384.0 * h))
        * (calib.dig_h2 as f64 / 65536.0 * (1.0 + calib.dig_h6 as f64 / 67108864.0 * h * (1.0 + calib.dig_h3 as f64 / 67108864.0 * h)));
    h *= 1.0 - calib.dig_h1 as f64 * h / 524288.0;
    let humidity = h.clamp(0.0, 100.0);

    (temperature, pressure, humidity)
}

pub struct Bme280Module {
    config: ModuleConfig,
    i2c: Arc<Mutex<I2c>>,
    calibration: Calibration,
    next_due_ms: u64,
}

impl Bme280Module {
    pub fn new(config: ModuleConfig, io: &IoHub) -> Result<Bme280Module> {
        let i2c = io.i2c()?;
        {
            let mut bus = i2c.lock().unwrap();
            bus.set_slave_address(I2C_ADDRESS).map_err(|_| Error::module_init("Bme280Module", &config.name))?;
            bus.write(&[REG_CTRL_HUM, 0x01]).map_err(|_| Error::module_init("Bme280Module", &config.name))?;
            bus.write(&[REG_CONFIG, 0x00]).map_err(|_| Error::module_init("Bme280Module", &config.name))?;
            bus.write(&[REG_CTRL_MEAS, 0x27]).map_err(|_| Error::module_init("Bme280Module", &config.name))?;
        }

        let calibration = {
            let mut bus = i2c.lock().unwrap();
            bus.set_slave_address(I2C_ADDRESS).map_err(|_| Error::module_init("Bme280Module", &config.name))?;
            read_calibration(&mut bus)?
        };

        thread::sleep(Duration::from_millis(500));

        Ok(Bme280Module { config, i2c, calibration, next_due_ms: 0 })
    }
}

impl Module for Bme280Module {
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

        let mut raw = [0u8; 8];
        {
            let mut bus = self.i2c.lock().unwrap();
            bus.set_slave_address(I2C_ADDRESS).map_err(|_| Error::module_init("Bme280Module", &self.config.name))?;
            read_register_block(&mut bus, REG_PRESS_MSB, &mut raw).map_err(|_| Error::module_init("Bme280Module", &self.config.name))?;
        }

        let (temperature, pressure, humidity) = compensate(&self.calibration, &raw);

        let mut readings = Vec::new();
        for sensor in &self.config.sensors {
            let value = match sensor.kind.as_str() {
                "TEMPERATURE" => round2(temperature),
                "HUMIDITY" => round2(humidity),
                "PRESSURE" => round2(pressure),
                _ => continue,
            };
            readings.push(SensorReading { sensor_id: sensor.id, value, created_at_ms: now_ms });
        }

        Ok(readings)
    }

    fn on_destroy(&mut self) {}
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
