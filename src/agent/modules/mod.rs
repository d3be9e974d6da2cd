//! Common lifecycle contract for hardware modules, and the kind-string
//! dispatch table that constructs them.

mod bme280;
mod boolean_read;
mod boolean_write;
mod dht;
mod display;
mod hc_sr04;
mod open_close;
mod pwm;
mod raspi_basic;

use super::config::ModuleConfig;
use super::errors::{Error, Result};
use super::io_hub::IoHub;
use super::mqtt_router::MqttRouter;
use super::store::SensorReading;

/// Implemented by every constructible hardware module. `tick` must not
/// block on the network or for long periods — it runs on the main loop's
/// tick, shared with every other module.
pub trait Module: Send {
    fn config(&self) -> &ModuleConfig;

    /// Folds a freshly reconciled config into the running module. Modules
    /// that expose a controller re-apply its default value here, matching
    /// the behavior they show right after construction.
    fn patch_config(&mut self, config: ModuleConfig);

    /// Produces zero or more readings if this tick is due, or leaves
    /// sensors untouched otherwise. Actuator-only modules always return
    /// an empty vector; their work happens on the MQTT callback thread.
    fn tick(&mut self, now_ms: u64) -> Result<Vec<SensorReading>>;

    /// Releases claimed pins and unsubscribes any MQTT topic. Called once,
    /// either because the module was reconciled away or the process is
    /// shutting down.
    fn on_destroy(&mut self);
}

/// The complete set of constructible kind strings. Exposed separately from
/// `construct` so callers (and tests) can validate a kind without needing
/// a live `IoHub`/`MqttRouter` to actually build one.
pub const KNOWN_KINDS: &[&str] =
    &["RASPI_BASIC", "DISPLAY", "DHT", "BME280", "BOOLEAN_READ", "HC-SR04", "BOOLEAN_WRITE", "PWM", "OPEN_CLOSE"];

/// Constructs a `Module` for `config.kind`. Unknown kinds are rejected as
/// `ConfigInvalid` rather than panicking — a malformed or forward-looking
/// server config must not bring the agent down.
pub fn construct(config: ModuleConfig, io: &IoHub, mqtt: &MqttRouter) -> Result<Box<dyn Module>> {
    match config.kind.as_str() {
        "RASPI_BASIC" => Ok(Box::new(raspi_basic::RaspiBasicModule::new(config))),
        "DISPLAY" => Ok(Box::new(display::DisplayModule::new(config))),
        "DHT" => Ok(Box::new(dht::DhtModule::new(config, io)?)),
        "BME280" => Ok(Box::new(bme280::Bme280Module::new(config, io)?)),
        "BOOLEAN_READ" => Ok(Box::new(boolean_read::BooleanReadModule::new(config, io)?)),
        "HC-SR04" => Ok(Box::new(hc_sr04::HcSr04Module::new(config, io)?)),
        "BOOLEAN_WRITE" => Ok(Box::new(boolean_write::BooleanWriteModule::new(config, io, mqtt)?)),
        "PWM" => Ok(Box::new(pwm::PwmModule::new(config, io, mqtt)?)),
        "OPEN_CLOSE" => Ok(Box::new(open_close::OpenCloseModule::new(config, io, mqtt)?)),
        other => Err(Error::config_invalid(format!("module.type={other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kinds_cover_every_dispatch_arm() {
        assert_eq!(KNOWN_KINDS.len(), 9);
        assert!(KNOWN_KINDS.contains(&"BME280"));
        assert!(KNOWN_KINDS.contains(&"DISPLAY"));
    }

    #[test]
    fn unknown_kind_is_rejected_before_dispatch() {
        assert!(!KNOWN_KINDS.contains(&"NOT_A_REAL_KIND"));
    }
}
