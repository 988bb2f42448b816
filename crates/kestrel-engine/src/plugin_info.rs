//! Bookkeeping the engine keeps per mounted plugin instance.

use kestrel_plugin::{Disposer, Plugin};
use kestrel_value::{Path, Value};

pub struct PluginInfo {
    pub path: Path,
    pub configuration: Value,
    pub plugin: Option<Box<dyn Plugin>>,
    pub state: Option<Value>,
    pub disabled: bool,
    pub subscription_disposers: Vec<Disposer>,
    pub command_disposers: Vec<Disposer>,
}

impl PluginInfo {
    pub fn new(path: Path, configuration: Value) -> Self {
        PluginInfo {
            path,
            configuration,
            plugin: None,
            state: None,
            disabled: false,
            subscription_disposers: Vec::new(),
            command_disposers: Vec::new(),
        }
    }

    pub fn dispose_handles(&mut self) {
        for dispose in self.subscription_disposers.drain(..) {
            dispose();
        }
        for dispose in self.command_disposers.drain(..) {
            dispose();
        }
    }
}
