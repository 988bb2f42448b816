//! Ports `pykzee.core.StateLoggerPlugin`: subscribes to one configured path
//! and logs every observed value, either as its `Debug` form or, with
//! `"pretty": true`, as an indented multi-line rendering.

use std::rc::Rc;

use kestrel_index::StateType;
use kestrel_plugin::{Disposer, Plugin, PluginContext};
use kestrel_value::{Path, PathElement, Value, parse_path};

#[derive(Default)]
pub struct StateLoggerPlugin {
    pretty: bool,
    unsubscribe: Option<Disposer>,
}

impl StateLoggerPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn watch_path(config: &Value) -> Path {
        match config.get_key("path") {
            Some(v) if v.is_list() || v.as_str().is_some() => {
                if let Some(s) = v.as_str() {
                    parse_path(s, &Path::root())
                } else {
                    v.iter_list()
                        .filter_map(|e| {
                            if let Some(s) = e.as_str() {
                                Some(PathElement::key(s))
                            } else {
                                e.as_int().map(|i| PathElement::index(i as usize))
                            }
                        })
                        .collect()
                }
            }
            _ => Path::root(),
        }
    }

    fn resubscribe(&mut self, ctx: &PluginContext, config: &Value) {
        if let Some(unsub) = self.unsubscribe.take() {
            unsub();
        }
        self.pretty = config.get_key("pretty").and_then(|v| v.as_bool()).unwrap_or(false);
        let path = Self::watch_path(config);
        let pretty = self.pretty;
        let callback = Rc::new(move |values: &[Option<Value>]| {
            let Some(state) = values[0].clone() else {
                tracing::debug!(%path, "state logger: watched path is Absent");
                return;
            };
            if pretty {
                for line in pretty_lines(&state) {
                    tracing::debug!("{line}");
                }
            } else {
                tracing::debug!(?state, "state logger update");
            }
        });
        self.unsubscribe = Some(ctx.subscribe(vec![(path, StateType::Resolved)], callback, true));
    }
}

impl Plugin for StateLoggerPlugin {
    fn init(&mut self, ctx: &PluginContext, config: &Value) -> anyhow::Result<()> {
        self.resubscribe(ctx, config);
        Ok(())
    }

    fn update_config(&mut self, ctx: &PluginContext, config: &Value) -> anyhow::Result<bool> {
        self.resubscribe(ctx, config);
        Ok(true)
    }

    fn shutdown(&mut self, _ctx: &PluginContext) {
        if let Some(unsub) = self.unsubscribe.take() {
            unsub();
        }
    }
}

/// Renders `value` as an indented multi-line form, one logical line per
/// string in the returned vector — the Rust analogue of the original's
/// `OutputLines` writer, minus the line-buffering (we already operate on
/// complete strings, so there's no partial-write state to carry).
fn pretty_lines(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    pretty_write(value, "", &mut out);
    out
}

fn pretty_write(value: &Value, indent: &str, out: &mut Vec<String>) {
    if value.is_map() {
        out.push(format!("{indent}{{"));
        let more = format!("{indent}  ");
        for (key, child) in value.iter_map() {
            let mut lines = Vec::new();
            pretty_write(&child, &more, &mut lines);
            if let Some((first, rest)) = lines.split_first() {
                out.push(format!("{more}{key:?}: {}", first.trim_start()));
                out.extend(rest.iter().cloned());
            }
        }
        out.push(format!("{indent}}}"));
    } else if value.is_list() {
        out.push(format!("{indent}["));
        let more = format!("{indent}  ");
        for child in value.iter_list() {
            pretty_write(&child, &more, out);
        }
        out.push(format!("{indent}]"));
    } else {
        out.push(format!("{indent}{value:?}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_engine::Engine;
    use kestrel_plugin::PluginFactoryRegistry;

    fn registry() -> PluginFactoryRegistry {
        let mut registry = PluginFactoryRegistry::new();
        registry.register("kestrel.StateLogger", Rc::new(|| Box::new(StateLoggerPlugin::new()) as Box<dyn Plugin>));
        registry
    }

    #[test]
    fn subscribes_and_survives_reconfiguration() {
        let engine = Engine::new(registry());
        let raw = Value::map([
            ("a".to_owned(), Value::int(1)),
            (
                "logger".to_owned(),
                Value::map([
                    ("__plugin__".to_owned(), Value::string("kestrel.StateLogger")),
                    ("path".to_owned(), Value::string("/a")),
                ]),
            ),
        ]);
        engine.set_raw_state(raw).unwrap();
        engine.dispatch_pending();

        let raw2 = Value::map([
            ("a".to_owned(), Value::int(2)),
            (
                "logger".to_owned(),
                Value::map([
                    ("__plugin__".to_owned(), Value::string("kestrel.StateLogger")),
                    ("path".to_owned(), Value::string("/a")),
                    ("pretty".to_owned(), Value::bool(true)),
                ]),
            ),
        ]);
        engine.set_raw_state(raw2).unwrap();
        engine.dispatch_pending();
    }

    #[test]
    fn pretty_print_nests_maps_and_lists() {
        let value = Value::map([
            ("x".to_owned(), Value::int(1)),
            ("y".to_owned(), Value::list([Value::int(1), Value::int(2)])),
        ]);
        let lines = pretty_lines(&value);
        assert!(lines.first().unwrap().ends_with('{'));
        assert!(lines.last().unwrap().ends_with('}'));
    }
}
