//! Host telemetry: CPU temperature from the platform thermal sensor.

use std::fs;

use super::Module;
use crate::agent::config::ModuleConfig;
use crate::agent::errors::Result;
use crate::agent::store::SensorReading;

const THERMAL_ZONE_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

pub struct RaspiBasicModule {
    config: ModuleConfig,
    next_due_ms: u64,
}

impl RaspiBasicModule {
    pub fn new(config: ModuleConfig) -> RaspiBasicModule {
        RaspiBasicModule { config, next_due_ms: 0 }
    }

    fn read_cpu_temperature() -> Option<f64> {
        let raw = fs::read_to_string(THERMAL_ZONE_PATH).ok()?;
        let millidegrees: f64 = raw.trim().parse().ok()?;
        Some(millidegrees / 1000.0)
    }
}

impl Module for RaspiBasicModule {
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
        if let Some(temp) = Self::read_cpu_temperature() {
            for sensor in &self.config.sensors {
                if sensor.kind == "CPU_TEMP" {
                    readings.push(SensorReading { sensor_id: sensor.id, value: round2(temp), created_at_ms: now_ms });
                }
            }
        }

        self.next_due_ms += self.config.interval_ms as u64;
        Ok(readings)
    }

    fn on_destroy(&mut self) {}
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> ModuleConfig {
        ModuleConfig::from_json(&json!({
            "moduleId": 1, "name": "host", "type": "RASPI_BASIC", "readingInterval": 60000,
            "interface": {}, "sensors": [{"id": 1, "type": "CPU_TEMP"}], "controllers": []
        }))
        .unwrap()
    }

    #[test]
    fn skips_when_not_yet_due() {
        let mut module = RaspiBasicModule::new(config());
        module.next_due_ms = 5000;
        assert!(module.tick(1000).unwrap().is_empty());
    }

    #[test]
    fn advances_next_due_by_interval_after_a_tick() {
        let mut module = RaspiBasicModule::new(config());
        let _ = module.tick(0);
        assert_eq!(module.next_due_ms, 60000);
    }

    #[test]
    fn a_starved_tick_advances_by_interval_without_drift() {
        let mut module = RaspiBasicModule::new(config());
        module.next_due_ms = 0;
        let _ = module.tick(70_000);
        assert_eq!(module.next_due_ms, 60_000);
    }
}
