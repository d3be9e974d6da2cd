//! Digital input sensor: reads one pin, inverted (active-low taken as 1).

use rppal::gpio::InputPin;

use super::Module;
use crate::agent::config::ModuleConfig;
use crate::agent::errors::{Error, Result};
use crate::agent::io_hub::IoHub;
use crate::agent::pin_map::map_physical_to_gpio;
use crate::agent::store::SensorReading;

pub struct BooleanReadModule {
    config: ModuleConfig,
    pin: InputPin,
    next_due_ms: u64,
}

impl BooleanReadModule {
    pub fn new(config: ModuleConfig, io: &IoHub) -> Result<BooleanReadModule> {
        let physical = config.pin("PIN").ok_or_else(|| Error::config_invalid("module.pins.PIN"))?;
        let bcm = map_physical_to_gpio(physical).ok_or_else(|| Error::config_invalid("module.pins.PIN"))?;

        let gpio = io.gpio()?;
        let pin = gpio.get(bcm).map_err(|_| Error::module_init("BooleanReadModule", &config.name))?.into_input();

        Ok(BooleanReadModule { config, pin, next_due_ms: 0 })
    }
}

impl Module for BooleanReadModule {
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

        let mut readings = Vec::new();
        if let Some(sensor) = self.config.sensors.first() {
            let value = if self.pin.is_high() { 0.0 } else { 1.0 };
            readings.push(SensorReading { sensor_id: sensor.id, value, created_at_ms: now_ms });
        }

        self.next_due_ms += self.config.interval_ms as u64;
        Ok(readings)
    }

    fn on_destroy(&mut self) {}
}
