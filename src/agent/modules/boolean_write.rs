//! Digital actuator: drives up to four pins (PIN1/PIN2 follow the
//! commanded value, nPIN1/nPIN2 carry its complement) from jobs delivered
//! over `{base}/module/{id}`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rppal::gpio::OutputPin;
use serde_json::Value;

use super::Module;
use crate::agent::config::ModuleConfig;
use crate::agent::errors::{Error, Result};
use crate::agent::io_hub::IoHub;
use crate::agent::job::Job;
use crate::agent::mqtt_router::MqttRouter;
use crate::agent::pin_map::map_physical_to_gpio;
use crate::agent::store::SensorReading;

struct Pins {
    pin1: Option<OutputPin>,
    pin2: Option<OutputPin>,
    npin1: Option<OutputPin>,
    npin2: Option<OutputPin>,
}

impl Pins {
    fn drive(&mut self, on: bool) {
        let level = if on { 1u8 } else { 0u8 };
        if let Some(pin) = self.pin1.as_mut() {
            set(pin, level);
        }
        if let Some(pin) = self.pin2.as_mut() {
            set(pin, level);
        }
        if let Some(pin) = self.npin1.as_mut() {
            set(pin, 1 - level);
        }
        if let Some(pin) = self.npin2.as_mut() {
            set(pin, 1 - level);
        }
    }

    /// Drops every claimed pin as an `OutputPin`, converting it to an
    /// input first so it doesn't linger driving a level after teardown.
    fn release(&mut self) {
        for pin in [self.pin1.take(), self.pin2.take(), self.npin1.take(), self.npin2.take()].into_iter().flatten() {
            let _ = pin.into_input();
        }
    }
}

fn set(pin: &mut OutputPin, level: u8) {
    if level == 0 {
        pin.set_low();
    } else {
        pin.set_high();
    }
}

fn open_pin(config: &ModuleConfig, io: &IoHub, key: &str) -> Result<Option<OutputPin>> {
    let physical = match config.pin(key) {
        Some(p) => p,
        None => return Ok(None),
    };
    let bcm = map_physical_to_gpio(physical).ok_or_else(|| Error::config_invalid(format!("module.pins.{key}")))?;
    let gpio = io.gpio()?;
    let pin = gpio.get(bcm).map_err(|_| Error::module_init("BooleanWriteModule", &config.name))?.into_output();
    Ok(Some(pin))
}

fn task_value(value: &std::collections::HashMap<String, Value>) -> bool {
    value.get("value").and_then(Value::as_bool).or_else(|| value.get("value").and_then(Value::as_i64).map(|n| n != 0)).unwrap_or(false)
}

pub struct BooleanWriteModule {
    config: ModuleConfig,
    pins: Arc<Mutex<Pins>>,
    cancel: Arc<AtomicBool>,
    mqtt: MqttRouter,
    topic: String,
}

impl BooleanWriteModule {
    pub fn new(config: ModuleConfig, io: &IoHub, mqtt: &MqttRouter) -> Result<BooleanWriteModule> {
        let pins = Pins {
            pin1: open_pin(&config, io, "PIN1")?,
            pin2: open_pin(&config, io, "PIN2")?,
            npin1: open_pin(&config, io, "nPIN1")?,
            npin2: open_pin(&config, io, "nPIN2")?,
        };
        let pins = Arc::new(Mutex::new(pins));

        let default_on = config.controllers.first().and_then(|c| c.default_value_for("value")).and_then(Value::as_bool).unwrap_or(false);
        pins.lock().unwrap().drive(default_on);

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
                run_job(Arc::clone(&job_pins), Arc::clone(&job_cancel), job, default_on);
            }),
        );

        Ok(BooleanWriteModule { config, pins, cancel, mqtt: mqtt.clone(), topic })
    }
}

fn run_job(pins: Arc<Mutex<Pins>>, cancel: Arc<AtomicBool>, job: Job, default_on: bool) {
    thread::spawn(move || {
        if let Some(offset_ms) = job.offset_ms {
            if !wait_cancellable(&cancel, offset_ms) {
                return;
            }
        }

        for task in job.tasks {
            pins.lock().unwrap().drive(task_value(&task.value));
            if !wait_cancellable(&cancel, task.duration_ms) {
                return;
            }
        }

        pins.lock().unwrap().drive(default_on);
    });
}

/// Sleeps in short slices so a concurrent `on_destroy` can preempt a
/// running job quickly instead of waiting out its full duration. Returns
/// `false` if cancelled partway through.
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

impl Module for BooleanWriteModule {
    fn config(&self) -> &ModuleConfig {
        &self.config
    }

    fn patch_config(&mut self, config: ModuleConfig) {
        self.config = config;
        let default_on =
            self.config.controllers.first().and_then(|c| c.default_value_for("value")).and_then(Value::as_bool).unwrap_or(false);
        self.pins.lock().unwrap().drive(default_on);
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
