//! Software-PWM actuator: applies `{pwm_frequency, value}` from each job
//! task for its duration, then reverts to the controller's default.

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

fn apply(pin: &mut Option<OutputPin>, frequency_hz: f64, duty_percent: f64) {
    let pin = match pin.as_mut() {
        Some(pin) => pin,
        None => return,
    };
    let duty = (duty_percent / 100.0).clamp(0.0, 1.0);
    let _ = pin.set_pwm_frequency(frequency_hz.max(1.0), duty);
}

/// Converts the claimed pin back to input mode so it doesn't linger
/// driving a PWM signal after teardown.
fn release(pin: &mut Option<OutputPin>) {
    if let Some(pin) = pin.take() {
        let _ = pin.into_input();
    }
}

fn task_params(value: &std::collections::HashMap<String, Value>) -> (f64, f64) {
    let frequency = value.get("pwm_frequency").and_then(Value::as_f64).unwrap_or(1000.0);
    let duty = value.get("value").and_then(Value::as_f64).unwrap_or(0.0);
    (frequency, duty)
}

pub struct PwmModule {
    config: ModuleConfig,
    pin: Arc<Mutex<Option<OutputPin>>>,
    cancel: Arc<AtomicBool>,
    mqtt: MqttRouter,
    topic: String,
}

impl PwmModule {
    pub fn new(config: ModuleConfig, io: &IoHub, mqtt: &MqttRouter) -> Result<PwmModule> {
        let physical = config.pin("PIN").ok_or_else(|| Error::config_invalid("module.pins.PIN"))?;
        let bcm = map_physical_to_gpio(physical).ok_or_else(|| Error::config_invalid("module.pins.PIN"))?;

        let gpio = io.gpio()?;
        let pin = gpio.get(bcm).map_err(|_| Error::module_init("PwmModule", &config.name))?.into_output();
        let pin = Arc::new(Mutex::new(Some(pin)));

        let (default_frequency, default_duty) = if let Some(controller) = config.controllers.first() {
            let frequency = controller.default_value_for("pwm_frequency").and_then(Value::as_f64).unwrap_or(1000.0);
            let duty = controller.default_value_for("value").and_then(Value::as_f64).unwrap_or(0.0);
            apply(&mut pin.lock().unwrap(), frequency, duty);
            (frequency, duty)
        } else {
            (1000.0, 0.0)
        };

        let topic = format!("module/{}", config.id);
        let cancel = Arc::new(AtomicBool::new(false));

        let job_pin = Arc::clone(&pin);
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
                run_job(Arc::clone(&job_pin), Arc::clone(&job_cancel), job, default_frequency, default_duty);
            }),
        );

        Ok(PwmModule { config, pin, cancel, mqtt: mqtt.clone(), topic })
    }
}

fn run_job(pin: Arc<Mutex<Option<OutputPin>>>, cancel: Arc<AtomicBool>, job: Job, default_frequency: f64, default_duty: f64) {
    thread::spawn(move || {
        if let Some(offset_ms) = job.offset_ms {
            if !wait_cancellable(&cancel, offset_ms) {
                return;
            }
        }

        for task in job.tasks {
            let (frequency, duty) = task_params(&task.value);
            apply(&mut pin.lock().unwrap(), frequency, duty);
            if !wait_cancellable(&cancel, task.duration_ms) {
                return;
            }
        }

        apply(&mut pin.lock().unwrap(), default_frequency, default_duty);
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

impl Module for PwmModule {
    fn config(&self) -> &ModuleConfig {
        &self.config
    }

    fn patch_config(&mut self, config: ModuleConfig) {
        self.config = config;
        if let Some(controller) = self.config.controllers.first() {
            let frequency = controller.default_value_for("pwm_frequency").and_then(Value::as_f64).unwrap_or(1000.0);
            let duty = controller.default_value_for("value").and_then(Value::as_f64).unwrap_or(0.0);
            apply(&mut self.pin.lock().unwrap(), frequency, duty);
        }
    }

    fn tick(&mut self, _now_ms: u64) -> Result<Vec<SensorReading>> {
        Ok(Vec::new())
    }

    fn on_destroy(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.mqtt.unsubscribe_all(&self.topic);
        release(&mut self.pin.lock().unwrap());
    }
}
