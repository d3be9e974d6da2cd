//! Validated device/module/sensor/controller configuration entities.
//!
//! Mirrors the JSON shape the control plane hands back from
//! `GET /device-config`. Construction validates required fields and fails
//! with [`result::Error::Invalid`] otherwise; `ModuleConfig::patch` folds a
//! freshly-received config into the running one without re-creating child
//! entries whose id already exists, which is what lets a `Module` survive a
//! config refresh without tearing down its GPIO state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use self::result::Error;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SensorConfig {
    pub id: u32,
    pub kind: String,
}

impl SensorConfig {
    pub fn from_json(value: &Value) -> result::Result<SensorConfig> {
        let id = value.get("id").and_then(Value::as_u64).ok_or_else(|| Error::invalid("sensor.id"))? as u32;
        let kind = value.get("type").and_then(Value::as_str).ok_or_else(|| Error::invalid("sensor.type"))?.to_string();
        Ok(SensorConfig { id, kind })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    pub id: u32,
    pub kind: String,
    pub default_value: Option<HashMap<String, Value>>,
}

impl ControllerConfig {
    pub fn from_json(value: &Value) -> result::Result<ControllerConfig> {
        let id = value.get("id").and_then(Value::as_u64).ok_or_else(|| Error::invalid("controller.id"))? as u32;
        let kind = value.get("type").and_then(Value::as_str).ok_or_else(|| Error::invalid("controller.type"))?.to_string();
        let default_value = value
            .get("defaultValue")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        Ok(ControllerConfig { id, kind, default_value })
    }

    /// Patches mutable fields in place, preserving identity (`id`).
    pub fn patch(&mut self, value: &Value) -> result::Result<()> {
        let kind = value.get("type").and_then(Value::as_str).ok_or_else(|| Error::invalid("controller.type"))?;
        self.kind = kind.to_string();
        self.default_value = value
            .get("defaultValue")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        Ok(())
    }

    pub fn default_value_for(&self, key: &str) -> Option<&Value> {
        self.default_value.as_ref().and_then(|m| m.get(key))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig {
    pub id: u32,
    pub name: String,
    pub kind: String,
    pub interval_ms: u32,
    pub pins: HashMap<String, u8>,
    pub sensors: Vec<SensorConfig>,
    pub controllers: Vec<ControllerConfig>,
}

impl ModuleConfig {
    pub fn from_json(value: &Value) -> result::Result<ModuleConfig> {
        let id = value.get("moduleId").and_then(Value::as_u64).ok_or_else(|| Error::invalid("module.moduleId"))? as u32;
        let name = value.get("name").and_then(Value::as_str).ok_or_else(|| Error::invalid("module.name"))?.to_string();
        let kind = value.get("type").and_then(Value::as_str).ok_or_else(|| Error::invalid("module.type"))?.to_string();
        let interval_ms = value.get("readingInterval").and_then(Value::as_u64).ok_or_else(|| Error::invalid("module.readingInterval"))? as u32;

        let pins = value
            .get("interface")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::invalid("module.interface"))?
            .iter()
            .map(|(k, v)| v.as_u64().map(|n| (k.clone(), n as u8)))
            .collect::<Option<HashMap<_, _>>>()
            .ok_or_else(|| Error::invalid("module.interface"))?;

        let sensors = value
            .get("sensors")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::invalid("module.sensors"))?
            .iter()
            .map(SensorConfig::from_json)
            .collect::<result::Result<Vec<_>>>()?;

        let controllers = value
            .get("controllers")
            .and_then(Value::as_array)
            .unwrap_or(&Vec::new())
            .iter()
            .map(ControllerConfig::from_json)
            .collect::<result::Result<Vec<_>>>()?;

        Ok(ModuleConfig { id, name, kind, interval_ms, pins, sensors, controllers })
    }

    pub fn pin(&self, key: &str) -> Option<u8> {
        self.pins.get(key).copied()
    }

    pub fn sensor(&self, id: u32) -> Option<&SensorConfig> {
        self.sensors.iter().find(|s| s.id == id)
    }

    pub fn controller(&self, id: u32) -> Option<&ControllerConfig> {
        self.controllers.iter().find(|c| c.id == id)
    }

    /// Folds `other` into `self` in place: sensors and controllers whose id
    /// already exists are patched, not replaced; new ones are appended.
    /// Top-level scalar fields (name, kind, interval, pins) are overwritten.
    pub fn patch(&mut self, other: ModuleConfig) {
        self.name = other.name;
        self.kind = other.kind;
        self.interval_ms = other.interval_ms;
        self.pins = other.pins;

        for incoming in other.sensors {
            if let Some(existing) = self.sensors.iter_mut().find(|s| s.id == incoming.id) {
                *existing = incoming;
            } else {
                self.sensors.push(incoming);
            }
        }

        for incoming in other.controllers {
            if let Some(existing) = self.controllers.iter_mut().find(|c| c.id == incoming.id) {
                existing.kind = incoming.kind;
                existing.default_value = incoming.default_value;
            } else {
                self.controllers.push(incoming);
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub id: u32,
    pub name: String,
    pub modules: Vec<ModuleConfig>,
}

impl DeviceConfig {
    pub fn from_json(value: &Value) -> result::Result<DeviceConfig> {
        let id = value.get("id").and_then(Value::as_u64).ok_or_else(|| Error::invalid("device.id"))? as u32;
        let name = value.get("name").and_then(Value::as_str).ok_or_else(|| Error::invalid("device.name"))?.to_string();
        let modules = value
            .get("modules")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::invalid("device.modules"))?
            .iter()
            .map(ModuleConfig::from_json)
            .collect::<result::Result<Vec<_>>>()?;

        Ok(DeviceConfig { id, name, modules })
    }

    pub fn module(&self, id: u32) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.id == id)
    }
}

pub mod result {
    use core::fmt;
    use std::error;

    pub type Result<T> = core::result::Result<T, Error>;

    #[derive(Debug)]
    pub enum Error {
        Invalid { path: String },
    }

    impl Error {
        pub fn invalid(path: impl Into<String>) -> Self {
            Error::Invalid { path: path.into() }
        }
    }

    impl fmt::Display for Error {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Error::Invalid { path } => write!(f, "invalid configuration field: {path}"),
            }
        }
    }

    impl error::Error for Error {}
}

impl From<result::Error> for crate::agent::errors::Error {
    fn from(err: result::Error) -> Self {
        match err {
            result::Error::Invalid { path } => crate::agent::errors::Error::config_invalid(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_module(interval: u64) -> Value {
        json!({
            "moduleId": 7,
            "name": "outdoor",
            "type": "BME280",
            "readingInterval": interval,
            "interface": {"SDA": 2, "SCL": 3},
            "sensors": [{"id": 3, "type": "TEMPERATURE"}, {"id": 4, "type": "HUMIDITY"}],
            "controllers": []
        })
    }

    #[test]
    fn parses_a_well_formed_module() {
        let config = ModuleConfig::from_json(&sample_module(60000)).unwrap();
        assert_eq!(config.id, 7);
        assert_eq!(config.interval_ms, 60000);
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.pin("SDA"), Some(2));
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let mut value = sample_module(60000);
        value.as_object_mut().unwrap().remove("readingInterval");
        assert!(ModuleConfig::from_json(&value).is_err());
    }

    #[test]
    fn patch_preserves_identity_of_existing_children() {
        let mut config = ModuleConfig::from_json(&sample_module(60000)).unwrap();
        let patch = ModuleConfig::from_json(&sample_module(10000)).unwrap();

        config.patch(patch);

        assert_eq!(config.interval_ms, 10000);
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.sensor(3).unwrap().kind, "TEMPERATURE");
    }

    #[test]
    fn patch_is_idempotent() {
        let mut a = ModuleConfig::from_json(&sample_module(60000)).unwrap();
        let mut b = ModuleConfig::from_json(&sample_module(60000)).unwrap();

        let patch_value = sample_module(10000);
        let patch1 = ModuleConfig::from_json(&patch_value).unwrap();
        let patch2 = ModuleConfig::from_json(&patch_value).unwrap();

        a.patch(patch1);
        a.patch(patch2.clone());

        b.patch(patch2);

        assert_eq!(a, b);
    }
}
