//! Reference kestrel plug-ins, shipped alongside the core the same way the
//! original distribution ships `StateLoggerPlugin.py` next to
//! `ManagedTree.py`: useful for running `kestreld` end to end, not part of
//! the engine's own public contract.

mod echo;
mod state_logger;

pub use echo::EchoPlugin;
pub use state_logger::StateLoggerPlugin;

use std::rc::Rc;

use kestrel_plugin::{Plugin, PluginFactoryRegistry};

/// Registers every reference plug-in under its conventional `kestrel.*`
/// identifier.
pub fn register_all(registry: &mut PluginFactoryRegistry) {
    registry.register("kestrel.StateLogger", Rc::new(|| Box::new(StateLoggerPlugin::new()) as Box<dyn Plugin>));
    registry.register("kestrel.Echo", Rc::new(|| Box::new(EchoPlugin::new()) as Box<dyn Plugin>));
}
