//! Hybrid actuator for motorized open/close hardware (shutters, valves,
//! gates): drives two control pins from jobs, and optionally wires two
//! momentary buttons straight to the same control pins for local override.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rppal::gpio::{InputPin, Level, OutputPin, Trigger};
use serde_json::Value;

use super::Module;
use crate::agent::config::ModuleConfig;
use crate::agent::errors::{Error, Result};
use crate::agent::io_hub::IoHub;
use crate::agent::job::Job;
use crate::agent::mqtt_router::MqttRouter;
use crate::agent::pin_map::map_physical_to_gpio;
use crate::agent::store::SensorReading;

struct ControlPins {
    open: Option<OutputPin>,
    close: Option<OutputPin>,
}

impl ControlPins {
    /// `dir` is `"open"`, `"close"`, or anything else (including absent)
    /// for hold. Both control lines idle high; driving one low for
    /// 100 ms before releasing the other avoids shorting the motor
    /// through both directions at once. No-op once `release` has taken
    /// the pins, e.g. if a job is still winding down mid-teardown.
    fn set_direction(&mut self, dir: Option<&str>) {
        match dir {
            Some("open") => {
                if let Some(close) = self.close.as_mut() {
                    close.set_high();
                }
                thread::sleep(Duration::from_millis(100));
                if let Some(open) = self.open.as_mut() {
                    open.set_low();
                }
            }
            Some("close") => {
                if let Some(open) = self.open.as_mut() {
                    open.set_high();
                }
                thread::sleep(Duration::from_millis(100));
                if let Some(close) = self.close.as_mut() {
                    close.set_low();
                }
            }
            _ => {
                if let Some(open) = self.open.as_mut() {
                    open.set_high();
                }
                if let Some(close) = self.close.as_mut() {
                    close.set_high();
                }
            }
        }
    }

    /// Converts both control pins back to input mode so they don't linger
    /// driving a level after teardown.
    fn release(&mut self) {
        for pin in [self.open.take(), self.close.take()].into_iter().flatten() {
            let _ = pin.into_input();
        }
    }
}

fn open_required_pin(config: &ModuleConfig, io: &IoHub, key: &str) -> Result<OutputPin> {
    let physical = config.pin(key).ok_or_else(|| Error::config_invalid(format!("module.pins.{key}")))?;
    let bcm = map_physical_to_gpio(physical).ok_or_else(|| Error::config_invalid(format!("module.pins.{key}")))?;
    let gpio = io.gpio()?;
    let mut pin = gpio.get(bcm).map_err(|_| Error::module_init("OpenCloseModule", &config.name))?.into_output();
    pin.set_high();
    Ok(pin)
}

fn open_optional_button(config: &ModuleConfig, io: &IoHub, key: &str) -> Result<Option<InputPin>> {
    let physical = match config.pin(key) {
        Some(p) => p,
        None => return Ok(None),
    };
    let bcm = map_physical_to_gpio(physical).ok_or_else(|| Error::config_invalid(format!("module.pins.{key}")))?;
    let gpio = io.gpio()?;
    let pin = gpio.get(bcm).map_err(|_| Error::module_init("OpenCloseModule", &config.name))?.into_input_pullup();
    Ok(Some(pin))
}

pub struct OpenCloseModule {
    config: ModuleConfig,
    pins: Arc<Mutex<ControlPins>>,
    // Kept alive so the interrupt callbacks registered on them stay active;
    // never read directly once wired up.
    _button_open: Option<InputPin>,
    _button_close: Option<InputPin>,
    cancel: Arc<AtomicBool>,
    mqtt: MqttRouter,
    topic: String,
}

impl OpenCloseModule {
    pub fn new(config: ModuleConfig, io: &IoHub, mqtt: &MqttRouter) -> Result<OpenCloseModule> {
        let pins = ControlPins {
            open: Some(open_required_pin(&config, io, "control_open_pin")?),
            close: Some(open_required_pin(&config, io, "control_close_pin")?),
        };
        let pins = Arc::new(Mutex::new(pins));

        let mut button_open = open_optional_button(&config, io, "button_open_pin")?;
        let mut button_close = open_optional_button(&config, io, "button_close_pin")?;

        if let Some(pin) = button_open.as_mut() {
            let button_pins = Arc::clone(&pins);
            pin.set_async_interrupt(Trigger::Both, move |level| {
                let dir = if level == Level::Low { Some("open") } else { None };
                button_pins.lock().unwrap().set_direction(dir);
            })
            .map_err(|_| Error::module_init("OpenCloseModule", &config.name))?;
        } else {
            tracing::warn!(module = %config.name, "button_open_pin is not set on the interface");
        }

        if let Some(pin) = button_close.as_mut() {
            let button_pins = Arc::clone(&pins);
            pin.set_async_interrupt(Trigger::Both, move |level| {
                let dir = if level == Level::Low { Some("close") } else { None };
                button_pins.lock().unwrap().set_direction(dir);
            })
            .map_err(|_| Error::module_init("OpenCloseModule", &config.name))?;
        } else {
            tracing::warn!(module = %config.name, "button_close_pin is not set on the interface");
        }

        let default_dir = config.controllers.first().and_then(|c| c.default_value_for("dir")).and_then(Value::as_str).map(str::to_string);
        pins.lock().unwrap().set_direction(default_dir.as_deref());

        let topic = format!("module/{}", config.id);
        let cancel = Arc::new(AtomicBool::new(false));

        let job_pins = Arc::clone(&pins);
        let job_cancel = Arc::clone(&cancel);
        mqtt.subscribe(
            topic.clone(),
            Box::new(move |payload: Value| {
                let job: Job = match serde_json::from_value(payload) {
                    Ok(job) => job,
                    Err(err) => {
                        tracing::warn!(%err, "dropping malformed job payload");
                        return;
                    }
                };
                run_job(Arc::clone(&job_pins), Arc::clone(&job_cancel), job);
            }),
        );

        Ok(OpenCloseModule { config, pins, _button_open: button_open, _button_close: button_close, cancel, mqtt: mqtt.clone(), topic })
    }
}

fn run_job(pins: Arc<Mutex<ControlPins>>, cancel: Arc<AtomicBool>, job: Job) {
    thread::spawn(move || {
        if let Some(offset_ms) = job.offset_ms {
            if !wait_cancellable(&cancel, offset_ms) {
                return;
            }
        }

        for task in job.tasks {
            let dir = task.value.get("dir").and_then(Value::as_str).map(str::to_string);
            pins.lock().unwrap().set_direction(dir.as_deref());
            if !wait_cancellable(&cancel, task.duration_ms) {
                return;
            }
        }

        pins.lock().unwrap().set_direction(None);
    });
}

fn wait_cancellable(cancel: &AtomicBool, duration_ms: u32) -> bool {
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = Duration::from_millis(duration_ms as u64);
    while remaining > Duration::ZERO {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(SLICE);
        thread::sleep(step);
        remaining -= step;
    }
    !cancel.load(Ordering::Relaxed)
}

impl Module for OpenCloseModule {
    fn config(&self) -> &ModuleConfig {
        &self.config
    }

    fn patch_config(&mut self, config: ModuleConfig) {
        self.config = config;
        let default_dir = self.config.controllers.first().and_then(|c| c.default_value_for("dir")).and_then(Value::as_str).map(str::to_string);
        self.pins.lock().unwrap().set_direction(default_dir.as_deref());
    }

    fn tick(&mut self, _now_ms: u64) -> Result<Vec<SensorReading>> {
        Ok(Vec::new())
    }

    fn on_destroy(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.mqtt.unsubscribe_all(&self.topic);
        self.pins.lock().unwrap().release();
    }
}
