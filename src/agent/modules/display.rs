//! No-op stand-in for the on-device TUI/OLED stack, which is out of scope
//! for this crate. Satisfies the `DISPLAY` kind so the dispatch table and
//! reconciler can treat it like any other module.

use super::Module;
use crate::agent::config::ModuleConfig;
use crate::agent::errors::Result;
use crate::agent::store::SensorReading;

pub struct DisplayModule {
    config: ModuleConfig,
}

impl DisplayModule {
    pub fn new(config: ModuleConfig) -> DisplayModule {
        DisplayModule { config }
    }
}

impl Module for DisplayModule {
    fn config(&self) -> &ModuleConfig {
        &self.config
    }

    fn patch_config(&mut self, config: ModuleConfig) {
        self.config = config;
    }

    fn tick(&mut self, _now_ms: u64) -> Result<Vec<SensorReading>> {
        Ok(Vec::new())
    }

    fn on_destroy(&mut self) {}
}
