//! Owns the set of running hardware modules and reconciles them against
//! whatever `DeviceConfig` the control plane hands back, without tearing
//! down modules whose identity survives the update.

use std::collections::HashSet;

use super::config::DeviceConfig;
use super::errors::{Error, Result};
use super::io_hub::IoHub;
use super::modules::{self, Module};
use super::mqtt_router::MqttRouter;
use super::store::SensorReading;

pub struct ModuleManager {
    modules: Vec<Box<dyn Module>>,
}

impl ModuleManager {
    pub fn new() -> ModuleManager {
        ModuleManager { modules: Vec::new() }
    }

    pub fn module_ids(&self) -> Vec<u32> {
        self.modules.iter().map(|m| m.config().id).collect()
    }

    /// Single-pass, idempotent reconciliation: modules absent from `config`
    /// are destroyed; modules present in both get `patch_config`; new ids
    /// are constructed by kind dispatch. The resulting module list is kept
    /// in `config.modules` order.
    ///
    /// A construction failure is logged and returned as `Err`, but every
    /// module reconciled successfully before the failure is still retained
    /// — a malformed config entry for one module must not tear down the
    /// modules that matched fine.
    pub fn reconcile(&mut self, config: &DeviceConfig, io: &IoHub, mqtt: &MqttRouter) -> Result<()> {
        let desired_ids: HashSet<u32> = config.modules.iter().map(|m| m.id).collect();

        let mut existing = Vec::with_capacity(self.modules.len());
        for mut module in self.modules.drain(..) {
            if desired_ids.contains(&module.config().id) {
                existing.push(module);
            } else {
                module.on_destroy();
            }
        }

        let mut ordered: Vec<Box<dyn Module>> = Vec::with_capacity(config.modules.len());
        let mut failure: Option<Error> = None;

        for desired in &config.modules {
            if let Some(position) = existing.iter().position(|m| m.config().id == desired.id) {
                let mut module = existing.remove(position);
                module.patch_config(desired.clone());
                ordered.push(module);
                continue;
            }

            match modules::construct(desired.clone(), io, mqtt) {
                Ok(module) => ordered.push(module),
                Err(err) => {
                    tracing::error!(module.id = desired.id, module.kind = %desired.kind, %err, "module construction failed");
                    failure = Some(Error::module_init(desired.kind.clone(), desired.name.clone()));
                    break;
                }
            }
        }

        // any leftover `existing` entries were matched to a desired id that
        // we never reached because construction failed earlier; destroy
        // them so they don't leak.
        for mut module in existing {
            module.on_destroy();
        }

        self.modules = ordered;

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Ticks every module in config order. A module's error is logged with
    /// its id and propagated — the main loop treats any tick failure as
    /// fatal.
    pub fn tick(&mut self, now_ms: u64) -> Result<Vec<SensorReading>> {
        let mut readings = Vec::new();
        for module in &mut self.modules {
            match module.tick(now_ms) {
                Ok(mut produced) => readings.append(&mut produced),
                Err(err) => {
                    tracing::error!(module.id = module.config().id, %err, "module tick failed");
                    return Err(err);
                }
            }
        }
        Ok(readings)
    }

    pub fn shutdown(&mut self) {
        for module in &mut self.modules {
            module.on_destroy();
        }
        self.modules.clear();
    }
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::config::ModuleConfig;
    use serde_json::json;

    fn raspi_basic_config(id: u32, interval_ms: u64) -> ModuleConfig {
        ModuleConfig::from_json(&json!({
            "moduleId": id,
            "name": format!("host-{id}"),
            "type": "RASPI_BASIC",
            "readingInterval": interval_ms,
            "interface": {},
            "sensors": [],
            "controllers": []
        }))
        .unwrap()
    }

    fn device_config(modules: Vec<ModuleConfig>) -> DeviceConfig {
        DeviceConfig { id: 1, name: "test-device".to_string(), modules }
    }

    #[test]
    fn reconcile_constructs_every_desired_module() {
        let io = IoHub::new();
        let mqtt = bare_mqtt_router();
        let mut manager = ModuleManager::new();

        manager.reconcile(&device_config(vec![raspi_basic_config(1, 60000), raspi_basic_config(2, 30000)]), &io, &mqtt).unwrap();

        assert_eq!(manager.module_ids(), vec![1, 2]);
    }

    #[test]
    fn reconcile_is_idempotent_given_the_same_config() {
        let io = IoHub::new();
        let mqtt = bare_mqtt_router();
        let mut manager = ModuleManager::new();
        let config = device_config(vec![raspi_basic_config(1, 60000)]);

        manager.reconcile(&config, &io, &mqtt).unwrap();
        manager.reconcile(&config, &io, &mqtt).unwrap();

        assert_eq!(manager.module_ids(), vec![1]);
    }

    #[test]
    fn reconcile_drops_modules_absent_from_the_new_config() {
        let io = IoHub::new();
        let mqtt = bare_mqtt_router();
        let mut manager = ModuleManager::new();

        manager.reconcile(&device_config(vec![raspi_basic_config(1, 60000), raspi_basic_config(2, 60000)]), &io, &mqtt).unwrap();
        manager.reconcile(&device_config(vec![raspi_basic_config(2, 60000)]), &io, &mqtt).unwrap();

        assert_eq!(manager.module_ids(), vec![2]);
    }

    #[test]
    fn reconcile_rejects_an_unknown_kind_without_losing_prior_modules() {
        let io = IoHub::new();
        let mqtt = bare_mqtt_router();
        let mut manager = ModuleManager::new();

        manager.reconcile(&device_config(vec![raspi_basic_config(1, 60000)]), &io, &mqtt).unwrap();

        let mut bad = raspi_basic_config(2, 60000);
        bad.kind = "NOT_A_REAL_KIND".to_string();
        let result = manager.reconcile(&device_config(vec![raspi_basic_config(1, 60000), bad]), &io, &mqtt);

        assert!(result.is_err());
        assert_eq!(manager.module_ids(), vec![1]);
    }

    fn bare_mqtt_router() -> MqttRouter {
        super::super::mqtt_router::unconnected_for_test("devices/test")
    }
}
