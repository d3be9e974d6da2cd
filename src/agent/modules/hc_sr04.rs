//! Ultrasonic ranging sensor: a 10 µs trigger pulse, then rising/falling
//! edge timestamps captured on the echo line via GPIO interrupts.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rppal::gpio::{InputPin, Level, OutputPin, Trigger};

use super::Module;
use crate::agent::config::ModuleConfig;
use crate::agent::errors::{Error, Result};
use crate::agent::io_hub::IoHub;
use crate::agent::pin_map::map_physical_to_gpio;
use crate::agent::store::SensorReading;

/// sound needs ~0.0343 µs to travel 1 mm
const SOUND_SPEED_MM_PER_US: f64 = 0.0343;
const ECHO_TIMEOUT: Duration = Duration::from_millis(150);

#[derive(Default)]
struct EchoState {
    rising_at: Option<Instant>,
    duration: Option<Duration>,
    /// Set if a falling edge arrived before any rising edge was recorded
    /// for the current cycle — an out-of-order interrupt sequence.
    desynced: bool,
}

pub struct HcSr04Module {
    config: ModuleConfig,
    trigger: OutputPin,
    _echo: InputPin,
    state: Arc<Mutex<EchoState>>,
    next_due_ms: u64,
}

impl HcSr04Module {
    pub fn new(config: ModuleConfig, io: &IoHub) -> Result<HcSr04Module> {
        let trigger_physical = config.pin("trigger_pin").ok_or_else(|| Error::config_invalid("module.pins.trigger_pin"))?;
        let echo_physical = config.pin("echo_pin").ok_or_else(|| Error::config_invalid("module.pins.echo_pin"))?;

        let trigger_bcm = map_physical_to_gpio(trigger_physical).ok_or_else(|| Error::config_invalid("module.pins.trigger_pin"))?;
        let echo_bcm = map_physical_to_gpio(echo_physical).ok_or_else(|| Error::config_invalid("module.pins.echo_pin"))?;

        let gpio = io.gpio()?;
        let mut trigger = gpio.get(trigger_bcm).map_err(|_| Error::module_init("HcSr04Module", &config.name))?.into_output();
        trigger.set_high();

        let mut echo = gpio.get(echo_bcm).map_err(|_| Error::module_init("HcSr04Module", &config.name))?.into_input();

        let state = Arc::new(Mutex::new(EchoState::default()));
        let callback_state = Arc::clone(&state);
        echo.set_async_interrupt(Trigger::Both, move |level| {
            let mut state = callback_state.lock().unwrap();
            match level {
                Level::High => state.rising_at = Some(Instant::now()),
                Level::Low => match state.rising_at.take() {
                    Some(start) => state.duration = Some(Instant::now().saturating_duration_since(start)),
                    None => state.desynced = true,
                },
            }
        })
        .map_err(|_| Error::module_init("HcSr04Module", &config.name))?;

        Ok(HcSr04Module { config, trigger, _echo: echo, state, next_due_ms: 0 })
    }

    fn pulse_trigger(&mut self) {
        *self.state.lock().unwrap() = EchoState::default();
        self.trigger.set_low();
        thread::sleep(Duration::from_micros(10));
        self.trigger.set_high();
    }
}

impl Module for HcSr04Module {
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

        self.pulse_trigger();

        let deadline = Instant::now() + ECHO_TIMEOUT;
        let duration = loop {
            let state = self.state.lock().unwrap();
            if state.desynced {
                return Err(Error::module_init("HcSr04Module", &self.config.name));
            }
            if let Some(duration) = state.duration {
                break Some(duration);
            }
            drop(state);
            if Instant::now() >= deadline {
                break None;
            }
            thread::sleep(Duration::from_millis(1));
        };

        self.next_due_ms += self.config.interval_ms as u64;

        let duration = match duration {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };

        let mm = duration.as_micros() as f64 * SOUND_SPEED_MM_PER_US / 2.0;

        let readings = self
            .config
            .sensors
            .first()
            .map(|sensor| vec![SensorReading { sensor_id: sensor.id, value: mm, created_at_ms: now_ms }])
            .unwrap_or_default();

        Ok(readings)
    }

    fn on_destroy(&mut self) {
        let _ = self._echo.clear_async_interrupt();
    }
}
