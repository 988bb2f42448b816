//! The plugin-facing capability surface: what a [`Plugin`] receives at
//! `init`, and the [`Subtree`] helper most plugins use to publish state and
//! commands without hand-rolling path arithmetic.

mod subtree;

pub use subtree::Subtree;

use std::rc::Rc;

use kestrel_index::StateType;
use kestrel_value::{Path, Value};

/// A registered command's implementation.
pub type CommandFn = Rc<dyn Fn(Value) -> anyhow::Result<Value>>;

/// Disposer returned by `subscribe`/`register_command`; dropping it does
/// nothing on its own — call it to actually unsubscribe/unregister.
pub type Disposer = Box<dyn FnOnce()>;

/// The capabilities a plugin is handed at construction time, mirroring the
/// five keyword arguments `ManagedTree.__newPlugin` passes into a Python
/// plugin's constructor.
#[derive(Clone)]
pub struct PluginContext {
    pub path: Path,
    get: Rc<dyn Fn(&Path) -> Option<Value>>,
    subscribe: Rc<dyn Fn(Vec<(Path, StateType)>, Rc<dyn Fn(&[Option<Value>])>, bool) -> Disposer>,
    command: Rc<dyn Fn(&Path, &str) -> Option<CommandFn>>,
    set_state: Rc<dyn Fn(&Path, Option<Value>)>,
    register_command: Rc<dyn Fn(&Path, &str, CommandFn, Option<String>) -> Disposer>,
}

impl PluginContext {
    pub fn new(
        path: Path,
        get: Rc<dyn Fn(&Path) -> Option<Value>>,
        subscribe: Rc<dyn Fn(Vec<(Path, StateType)>, Rc<dyn Fn(&[Option<Value>])>, bool) -> Disposer>,
        command: Rc<dyn Fn(&Path, &str) -> Option<CommandFn>>,
        set_state: Rc<dyn Fn(&Path, Option<Value>)>,
        register_command: Rc<dyn Fn(&Path, &str, CommandFn, Option<String>) -> Disposer>,
    ) -> Self {
        PluginContext {
            path,
            get,
            subscribe,
            command,
            set_state,
            register_command,
        }
    }

    pub fn get(&self, path: &Path) -> Option<Value> {
        (self.get)(path)
    }

    pub fn subscribe(
        &self,
        watches: Vec<(Path, StateType)>,
        callback: Rc<dyn Fn(&[Option<Value>])>,
        initial: bool,
    ) -> Disposer {
        (self.subscribe)(watches, callback, initial)
    }

    pub fn command(&self, path: &Path, name: &str) -> Option<CommandFn> {
        (self.command)(path, name)
    }

    pub fn set_state(&self, path: &Path, value: Option<Value>) {
        (self.set_state)(path, value)
    }

    pub fn register_command(
        &self,
        path: &Path,
        name: &str,
        function: CommandFn,
        doc: Option<String>,
    ) -> Disposer {
        (self.register_command)(path, name, function, doc)
    }

    pub fn create_subtree(&self, path: Path, immediate_updates: bool) -> Subtree {
        Subtree::new(self.clone(), path, immediate_updates)
    }
}

/// A plugin reacts to its configuration and, while mounted, drives state
/// and commands through the [`PluginContext`] it was given.
pub trait Plugin {
    /// Called once, right after construction, with the plugin's own
    /// configuration subtree (the value at its mount path, minus
    /// `__plugin__`). Failure is captured by the engine and surfaced as
    /// `{ exception, chain }` state at the plugin's path, not propagated as
    /// a panic.
    fn init(&mut self, ctx: &PluginContext, config: &Value) -> anyhow::Result<()>;

    /// Called when the plugin's configuration node changes without its
    /// `__plugin__` identifier changing. Returning `Ok(true)` accepts the
    /// new configuration in place; `Ok(false)` or `Err` triggers a full
    /// shutdown-and-reinit with the new configuration.
    fn update_config(&mut self, _ctx: &PluginContext, _config: &Value) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Called when the plugin is removed (its node disappeared, or it's
    /// being replaced after a failed `update_config`).
    fn shutdown(&mut self, _ctx: &PluginContext) {}
}

/// Constructs a boxed plugin instance from its declared configuration.
pub type PluginFactory = Rc<dyn Fn() -> Box<dyn Plugin>>;

/// Maps a plugin's `__plugin__` identifier to the factory that builds it.
/// Stands in for the original's `importlib`-based `"module.ClassName"`
/// dynamic import, which has no equivalent in safe Rust without an
/// FFI/ABI surface this crate doesn't define.
#[derive(Default, Clone)]
pub struct PluginFactoryRegistry {
    factories: std::collections::HashMap<String, PluginFactory>,
}

impl PluginFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, identifier: impl Into<String>, factory: PluginFactory) {
        self.factories.insert(identifier.into(), factory);
    }

    pub fn resolve(&self, identifier: &str) -> Option<PluginFactory> {
        self.factories.get(identifier).cloned()
    }
}
