//! A minimal command-registering plug-in used as an end-to-end smoke test
//! for `kestreld`: publishes its own config echoed back at its mount path
//! and registers one command, `go`, that echoes its argument.

use std::rc::Rc;

use kestrel_plugin::{Disposer, Plugin, PluginContext};
use kestrel_value::{Path, Value};

#[derive(Default)]
pub struct EchoPlugin {
    unregister: Option<Disposer>,
}

impl EchoPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Plugin for EchoPlugin {
    fn init(&mut self, ctx: &PluginContext, config: &Value) -> anyhow::Result<()> {
        ctx.set_state(&ctx.path, Some(config.clone()));
        let unregister = ctx.register_command(
            &ctx.path,
            "go",
            Rc::new(|arg: Value| Ok(arg)),
            Some("echoes its argument back".to_owned()),
        );
        self.unregister = Some(unregister);
        Ok(())
    }

    fn update_config(&mut self, ctx: &PluginContext, config: &Value) -> anyhow::Result<bool> {
        ctx.set_state(&ctx.path, Some(config.clone()));
        Ok(true)
    }

    fn shutdown(&mut self, _ctx: &PluginContext) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_engine::Engine;
    use kestrel_index::StateType;
    use kestrel_plugin::PluginFactoryRegistry;
    use kestrel_value::PathElement;

    fn registry() -> PluginFactoryRegistry {
        let mut registry = PluginFactoryRegistry::new();
        registry.register("kestrel.Echo", Rc::new(|| Box::new(EchoPlugin::new()) as Box<dyn Plugin>));
        registry
    }

    #[test]
    fn registers_and_invokes_go_command() {
        let engine = Engine::new(registry());
        let raw = Value::map([(
            "e".to_owned(),
            Value::map([
                ("__plugin__".to_owned(), Value::string("kestrel.Echo")),
                ("greeting".to_owned(), Value::string("hi")),
            ]),
        )]);
        engine.set_raw_state(raw).unwrap();

        let mount = Path::new([PathElement::key("e")]);
        let published = engine.get(&mount, StateType::Unresolved).unwrap();
        assert_eq!(published.get_key("greeting"), Some(Value::string("hi")));

        let go = engine.command(&mount, "go").expect("go command registered");
        assert_eq!(go(Value::int(42)).unwrap(), Value::int(42));

        engine.set_raw_state(Value::empty_map()).unwrap();
        assert!(engine.command(&mount, "go").is_none());
    }
}
