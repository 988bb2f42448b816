//! The managed tree: the engine that owns the raw/unresolved/resolved
//! snapshots, reconciles plugin instances against the declarative roster
//! found in raw state, and dispatches subscription callbacks through a
//! single cooperative update loop.
//!
//! Every public method except [`Engine::run`] is non-suspending: it
//! synchronously mutates engine structures and, if a subscriber's reported
//! state actually falls behind, queues that subscriber for dispatch and
//! wakes the update loop. Callback *invocation* is always deferred onto
//! the scheduler (`spawn_local` from [`Engine::run`], or an explicit
//! [`Engine::dispatch_pending`] call), so a callback never observes a
//! partially-updated snapshot.

mod error;
mod plugin_info;

pub use error::{EngineError, EngineResult};
pub use plugin_info::PluginInfo;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use tokio::sync::Notify;

use kestrel_index::{Directory, PendingDispatch, StateType, Subscription};
use kestrel_plugin::{CommandFn, Disposer, Plugin, PluginContext, PluginFactoryRegistry, Subtree};
use kestrel_value::{Path, PathElement, Value, format_path, get_at_path_p, set_at_path_p};

const SYS_KEY: &str = "sys";

#[derive(Clone)]
struct CommandEntry {
    function: CommandFn,
    doc: Option<String>,
}

struct Inner {
    raw: Value,
    unresolved: Value,
    resolved: Value,
    raw_root: Rc<RefCell<Directory>>,
    unresolved_root: Rc<RefCell<Directory>>,
    resolved_root: Rc<RefCell<Directory>>,
    plugins: Vec<Rc<RefCell<PluginInfo>>>,
    commands: HashMap<(Path, String), CommandEntry>,
    registry: PluginFactoryRegistry,
    notify: Rc<Notify>,
    pending_dispatch: Vec<Rc<RefCell<Subscription>>>,
}

/// The reactive state-tree engine. Cheaply `Clone`-able (an `Rc` handle);
/// every clone shares the same snapshots, roster, and subscription index.
/// Not `Send`/`Sync` — embed it behind a single-threaded `LocalSet`, per
/// the cooperative scheduling model.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<RefCell<Inner>>,
}

fn sys_path() -> Path {
    Path::new([PathElement::key(SYS_KEY)])
}

/// Splits a single disposal action into two independently callable
/// [`Disposer`]s that share one execute-once slot, so both the caller of
/// `subscribe`/`register_command` and the owning [`PluginInfo`]'s teardown
/// can hold a handle without double-disposing.
fn shared_disposer(action: impl FnOnce() + 'static) -> (Disposer, Disposer) {
    let slot: Rc<RefCell<Option<Box<dyn FnOnce()>>>> = Rc::new(RefCell::new(Some(Box::new(action))));
    let a = {
        let slot = slot.clone();
        Box::new(move || {
            if let Some(f) = slot.borrow_mut().take() {
                f();
            }
        }) as Disposer
    };
    let b = Box::new(move || {
        if let Some(f) = slot.borrow_mut().take() {
            f();
        }
    }) as Disposer;
    (a, b)
}

fn err_to_value(err: &anyhow::Error) -> Value {
    let chain: Vec<Value> = err.chain().map(|e| Value::string(e.to_string())).collect();
    Value::map([
        ("exception".to_owned(), Value::string(err.to_string())),
        ("chain".to_owned(), Value::list(chain)),
    ])
}

fn relative_path(mount: &Path, absolute: &Path) -> Path {
    assert!(
        absolute.starts_with(mount),
        "set_state path {absolute} must be under the plugin's own mount {mount}"
    );
    Path::new(absolute.elements()[mount.len()..].iter().cloned())
}

fn build_commands_value(commands: &HashMap<(Path, String), CommandEntry>) -> Value {
    let mut by_path: BTreeMap<String, Vec<(String, Value)>> = BTreeMap::new();
    for ((path, name), entry) in commands {
        let entry_value = Value::map([
            ("doc".to_owned(), Value::string(entry.doc.clone().unwrap_or_default())),
            // Rust has no runtime function-signature reflection; kestrel
            // surfaces the `CommandFn` type's own signature instead of the
            // plugin author's parameter list.
            ("signature".to_owned(), Value::string("fn(Value) -> anyhow::Result<Value>")),
        ]);
        by_path.entry(format_path(path)).or_default().push((name.clone(), entry_value));
    }
    Value::map(by_path.into_iter().map(|(path_str, mut names)| {
        names.sort_by(|a, b| a.0.cmp(&b.0));
        (path_str, Value::map(names))
    }))
}

fn build_symlinks_value(unresolved: &Value) -> Value {
    Value::map(
        kestrel_info::symlinks(unresolved)
            .into_iter()
            .map(|(location, target)| (format_path(&location), Value::string(format_path(&target)))),
    )
}

fn build_plugins_value(plugins: &[Rc<RefCell<PluginInfo>>]) -> Value {
    Value::map(plugins.iter().map(|p| {
        let p = p.borrow();
        (format_path(&p.path), p.configuration.clone())
    }))
}

impl Engine {
    pub fn new(registry: PluginFactoryRegistry) -> Self {
        let inner = Inner {
            raw: Value::empty_map(),
            unresolved: Value::empty_map(),
            resolved: Value::empty_map(),
            raw_root: Directory::new_root(),
            unresolved_root: Directory::new_root(),
            resolved_root: Directory::new_root(),
            plugins: Vec::new(),
            commands: HashMap::new(),
            registry,
            notify: Rc::new(Notify::new()),
            pending_dispatch: Vec::new(),
        };
        let engine = Engine { inner: Rc::new(RefCell::new(inner)) };
        engine.recompute_and_diff();
        engine
    }

    /// Ingests a new raw-state mapping from the loader. Sanitizes (must
    /// already be a JSON mapping; see `kestrel-loader`/`Value::from_json`
    /// for converting foreign input), strips the reserved `sys` key,
    /// pointer-compares against the previous raw value, and — if it
    /// actually changed — reconciles the plugin roster, rebuilds the
    /// unresolved snapshot, and recomputes `resolved`.
    #[tracing::instrument(skip(self, value))]
    pub fn set_raw_state(&self, value: Value) -> EngineResult<()> {
        if !value.is_map() {
            return Err(EngineError::InvalidState);
        }
        let stripped = value.without(&PathElement::key(SYS_KEY));
        {
            let inner = self.inner.borrow();
            if inner.raw.is(&stripped) {
                return Ok(());
            }
        }
        self.inner.borrow_mut().raw = stripped.clone();
        self.reconcile_plugins(&stripped);
        self.rebuild_unresolved();
        self.recompute_and_diff();
        Ok(())
    }

    /// Reads one path out of one of the three snapshots.
    pub fn get(&self, path: &Path, snapshot: StateType) -> Option<Value> {
        let inner = self.inner.borrow();
        let root = match snapshot {
            StateType::Raw => &inner.raw,
            StateType::Unresolved => &inner.unresolved,
            StateType::Resolved => &inner.resolved,
        };
        get_at_path_p(Some(root), path)
    }

    /// Subscribes `callback` to the resolved tuple of values at `watches`.
    /// `plugin` is `None` for engine-internal/loader-owned subscriptions
    /// and `Some` for a plugin's own subscriptions (so the disposer is
    /// also wired into that plugin's automatic teardown).
    pub fn subscribe(
        &self,
        plugin: Option<&Rc<RefCell<PluginInfo>>>,
        watches: Vec<(Path, StateType)>,
        callback: Rc<dyn Fn(&[Option<Value>])>,
        initial: bool,
    ) -> EngineResult<Disposer> {
        if let Some(p) = plugin
            && p.borrow().disabled
        {
            return Err(EngineError::DisabledActor { path: p.borrow().path.clone() });
        }

        let specs: Vec<(Path, Rc<RefCell<Directory>>, StateType)> = {
            let inner = self.inner.borrow();
            watches
                .into_iter()
                .map(|(path, kind)| {
                    let root = match kind {
                        StateType::Raw => inner.raw_root.clone(),
                        StateType::Unresolved => inner.unresolved_root.clone(),
                        StateType::Resolved => inner.resolved_root.clone(),
                    };
                    (path, root, kind)
                })
                .collect()
        };

        let sub = kestrel_index::subscribe(&specs, callback, initial);
        // Enqueue unmarked, same as `recompute_and_diff`: the dispatcher (`run`
        // / `dispatch_pending`) is the sole place that calls `mark_for_dispatch`,
        // which advances `reported_state`. Marking here too would make that
        // later call a no-op and silently swallow the `initial=true` delivery.
        self.inner.borrow_mut().pending_dispatch.push(sub.clone());
        self.wake();

        let sub_for_action = sub.clone();
        let (for_caller, for_plugin) = shared_disposer(move || {
            kestrel_index::unsubscribe(&sub_for_action);
        });

        if let Some(p) = plugin {
            p.borrow_mut().subscription_disposers.push(for_plugin);
        } else {
            drop(for_plugin);
        }

        Ok(for_caller)
    }

    /// A plugin pushes substate at `path` (must be `path == mount` or a
    /// descendant of it). No-op if the plugin is disabled.
    pub fn set_plugin_state(&self, plugin: &Rc<RefCell<PluginInfo>>, path: &Path, value: Option<Value>) {
        if plugin.borrow().disabled {
            return;
        }
        let relative = relative_path(&plugin.borrow().path, path);
        {
            let mut info = plugin.borrow_mut();
            info.state = Some(
                set_at_path_p(info.state.take(), &relative, value)
                    .expect("plugin state updates never hit a type-mismatched segment"),
            );
        }
        self.rebuild_unresolved();
        self.recompute_and_diff();
    }

    /// Registers a named command at `path`, owned by `plugin`. Fails with
    /// [`EngineError::DisabledActor`] if the plugin has been disabled, or
    /// [`EngineError::DuplicateCommand`] if `(path, name)` is already
    /// registered.
    pub fn register_command(
        &self,
        plugin: &Rc<RefCell<PluginInfo>>,
        path: &Path,
        name: &str,
        function: CommandFn,
        doc: Option<String>,
    ) -> EngineResult<Disposer> {
        if plugin.borrow().disabled {
            return Err(EngineError::DisabledActor { path: plugin.borrow().path.clone() });
        }
        let key = (path.clone(), name.to_owned());
        {
            let inner = self.inner.borrow();
            if inner.commands.contains_key(&key) {
                return Err(EngineError::DuplicateCommand { path: path.clone(), name: name.to_owned() });
            }
        }
        self.inner.borrow_mut().commands.insert(key.clone(), CommandEntry { function, doc });
        self.recompute_and_diff();

        let engine = self.clone();
        let key_for_action = key.clone();
        let (for_caller, for_plugin) = shared_disposer(move || {
            engine.inner.borrow_mut().commands.remove(&key_for_action);
            engine.recompute_and_diff();
        });
        plugin.borrow_mut().command_disposers.push(for_plugin);

        Ok(for_caller)
    }

    /// Looks up a registered command's implementation by `(path, name)`.
    pub fn command(&self, path: &Path, name: &str) -> Option<CommandFn> {
        self.inner
            .borrow()
            .commands
            .get(&(path.clone(), name.to_owned()))
            .map(|entry| entry.function.clone())
    }

    /// Runs the cooperative update loop: waits on the wake event, then
    /// drains pending dispatches, scheduling each one (via
    /// `spawn_local`, so it runs after this pass returns control to the
    /// scheduler) rather than calling it inline. Intended to be spawned
    /// once onto a `tokio::task::LocalSet` and run for the engine's
    /// lifetime.
    pub async fn run(self) {
        loop {
            let notify = self.inner.borrow().notify.clone();
            notify.notified().await;
            loop {
                let pending: Vec<Rc<RefCell<Subscription>>> = {
                    let mut inner = self.inner.borrow_mut();
                    std::mem::take(&mut inner.pending_dispatch)
                };
                if pending.is_empty() {
                    break;
                }
                for sub in pending {
                    if sub.borrow_mut().mark_for_dispatch() {
                        tokio::task::spawn_local(async move {
                            sub.borrow().dispatch();
                        });
                    }
                }
            }
        }
    }

    /// Synchronously drains and invokes any pending dispatches without a
    /// `LocalSet` or scheduler in the loop — the escape hatch `kestreld`
    /// and unit tests use instead of spawning [`Engine::run`].
    pub fn dispatch_pending(&self) {
        loop {
            let pending: Vec<Rc<RefCell<Subscription>>> = {
                let mut inner = self.inner.borrow_mut();
                std::mem::take(&mut inner.pending_dispatch)
            };
            if pending.is_empty() {
                break;
            }
            for sub in pending {
                if sub.borrow_mut().mark_for_dispatch() {
                    sub.borrow().dispatch();
                }
            }
        }
    }

    fn wake(&self) {
        self.inner.borrow().notify.notify_one();
    }

    fn make_context(&self, info: &Rc<RefCell<PluginInfo>>) -> PluginContext {
        let path = info.borrow().path.clone();

        let engine = self.clone();
        let get = Rc::new(move |p: &Path| engine.get(p, StateType::Resolved));

        let engine = self.clone();
        let info_sub = info.clone();
        let subscribe = Rc::new(
            move |watches: Vec<(Path, StateType)>, callback: Rc<dyn Fn(&[Option<Value>])>, initial: bool| {
                engine
                    .subscribe(Some(&info_sub), watches, callback, initial)
                    .unwrap_or_else(|_| Box::new(|| {}))
            },
        );

        let engine = self.clone();
        let command = Rc::new(move |p: &Path, name: &str| engine.command(p, name));

        let engine = self.clone();
        let info_set = info.clone();
        let set_state = Rc::new(move |p: &Path, value: Option<Value>| engine.set_plugin_state(&info_set, p, value));

        let engine = self.clone();
        let info_reg = info.clone();
        let register_command = Rc::new(
            move |p: &Path, name: &str, function: CommandFn, doc: Option<String>| {
                engine
                    .register_command(&info_reg, p, name, function, doc)
                    .unwrap_or_else(|_| Box::new(|| {}))
            },
        );

        PluginContext::new(path, get, subscribe, command, set_state, register_command)
    }

    fn reconcile_plugins(&self, raw: &Value) {
        let mut desired: Vec<(Path, Value)> = kestrel_info::plugins(raw);
        desired.sort_by(|a, b| format_path(&a.0).cmp(&format_path(&b.0)));

        let mut current: Vec<Rc<RefCell<PluginInfo>>> = self.inner.borrow().plugins.clone();
        current.sort_by(|a, b| format_path(&a.borrow().path).cmp(&format_path(&b.borrow().path)));

        let mut next: Vec<Rc<RefCell<PluginInfo>>> = Vec::with_capacity(desired.len());
        let mut di = 0;
        let mut ci = 0;
        while di < desired.len() || ci < current.len() {
            let order = match (desired.get(di), current.get(ci)) {
                (Some((dpath, _)), Some(cinfo)) => {
                    format_path(dpath).cmp(&format_path(&cinfo.borrow().path))
                }
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => unreachable!(),
            };

            match order {
                std::cmp::Ordering::Less => {
                    let (path, config) = desired[di].clone();
                    next.push(self.create_plugin(path, config));
                    di += 1;
                }
                std::cmp::Ordering::Greater => {
                    self.destroy_plugin(&current[ci]);
                    ci += 1;
                }
                std::cmp::Ordering::Equal => {
                    let (path, config) = desired[di].clone();
                    let cinfo = current[ci].clone();
                    next.push(self.reconcile_one(path, config, cinfo));
                    di += 1;
                    ci += 1;
                }
            }
        }

        self.inner.borrow_mut().plugins = next;
    }

    /// Same mount path in both rosters: keep as-is if the config is
    /// pointer-identical; try a live `update_config` if only the config
    /// changed; otherwise tear down and recreate.
    fn reconcile_one(&self, path: Path, config: Value, current: Rc<RefCell<PluginInfo>>) -> Rc<RefCell<PluginInfo>> {
        if current.borrow().configuration.is(&config) {
            return current;
        }

        let old_id = current.borrow().configuration.get_key("__plugin__");
        let new_id = config.get_key("__plugin__");
        if old_id == new_id && self.try_update_config(&current, &config) {
            current.borrow_mut().configuration = config;
            return current;
        }

        self.destroy_plugin(&current);
        self.create_plugin(path, config)
    }

    fn try_update_config(&self, info: &Rc<RefCell<PluginInfo>>, new_config: &Value) -> bool {
        let ctx = self.make_context(info);
        let mut guard = info.borrow_mut();
        let Some(plugin) = guard.plugin.as_mut() else {
            return false;
        };
        match plugin.update_config(&ctx, new_config) {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(path = %format_path(&guard.path), error = %err, "plugin update_config failed");
                false
            }
        }
    }

    fn create_plugin(&self, path: Path, config: Value) -> Rc<RefCell<PluginInfo>> {
        let info = Rc::new(RefCell::new(PluginInfo::new(path.clone(), config.clone())));
        let identifier = config.get_key("__plugin__").and_then(|v| v.as_str().map(str::to_owned));
        let factory = identifier.as_deref().and_then(|id| self.inner.borrow().registry.resolve(id));

        match (identifier, factory) {
            (Some(_), Some(factory)) => {
                let mut plugin = factory();
                let ctx = self.make_context(&info);
                match plugin.init(&ctx, &config) {
                    Ok(()) => {
                        info.borrow_mut().plugin = Some(plugin);
                    }
                    Err(err) => {
                        tracing::warn!(path = %format_path(&path), error = %err, "plugin init failed");
                        self.fail_plugin(&info, &err);
                    }
                }
            }
            (id, _) => {
                let err = anyhow::anyhow!("no plugin factory registered for {id:?}");
                tracing::warn!(path = %format_path(&path), error = %err, "plugin load failed");
                self.fail_plugin(&info, &err);
            }
        }
        info
    }

    fn fail_plugin(&self, info: &Rc<RefCell<PluginInfo>>, err: &anyhow::Error) {
        let mut i = info.borrow_mut();
        i.disabled = true;
        i.state = Some(err_to_value(err));
    }

    fn destroy_plugin(&self, info: &Rc<RefCell<PluginInfo>>) {
        let plugin = {
            let mut i = info.borrow_mut();
            i.disabled = true;
            let plugin = i.plugin.take();
            i.dispose_handles();
            i.state = None;
            plugin
        };
        if let Some(mut plugin) = plugin {
            let ctx = self.make_context(info);
            let path = info.borrow().path.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| plugin.shutdown(&ctx)));
            if result.is_err() {
                tracing::error!(path = %format_path(&path), "plugin shutdown panicked");
            }
        }
    }

    fn rebuild_unresolved(&self) {
        let (raw, plugins) = {
            let inner = self.inner.borrow();
            (inner.raw.clone(), inner.plugins.clone())
        };
        let mut tree = raw;
        for p in &plugins {
            let (path, state) = {
                let b = p.borrow();
                (b.path.clone(), b.state.clone())
            };
            tree = set_at_path_p(Some(tree), &path, state).expect("plugin mount path must be structurally settable");
        }
        self.inner.borrow_mut().unresolved = tree;
    }

    /// Overlays the `sys` subtree onto `unresolved`, resolves symlinks,
    /// and diffs every one of the three mirror trees against its previous
    /// state, queuing any subscriber whose reported tuple fell behind.
    fn recompute_and_diff(&self) {
        let (unresolved, raw, plugins, commands) = {
            let inner = self.inner.borrow();
            (inner.unresolved.clone(), inner.raw.clone(), inner.plugins.clone(), inner.commands.clone())
        };

        let sys = Value::map([
            ("commands".to_owned(), build_commands_value(&commands)),
            ("symlinks".to_owned(), build_symlinks_value(&unresolved)),
            ("unresolved".to_owned(), unresolved.clone()),
            ("raw".to_owned(), raw.clone()),
            ("plugins".to_owned(), build_plugins_value(&plugins)),
        ]);
        let working = set_at_path_p(Some(unresolved.clone()), &sys_path(), Some(sys))
            .expect("sys overlay never hits a type mismatch");
        let resolved = kestrel_info::resolved(&working);

        let (raw_root, unresolved_root, resolved_root) = {
            let inner = self.inner.borrow();
            (inner.raw_root.clone(), inner.unresolved_root.clone(), inner.resolved_root.clone())
        };
        let mut pending = PendingDispatch::new();
        Directory::update(&raw_root, Some(raw), &mut pending);
        Directory::update(&unresolved_root, Some(unresolved), &mut pending);
        Directory::update(&resolved_root, Some(resolved.clone()), &mut pending);

        let mut inner = self.inner.borrow_mut();
        inner.resolved = resolved;
        if !pending.is_empty() {
            inner.pending_dispatch.extend(pending.into_values());
            drop(inner);
            self.wake();
        }
    }
}

/// Convenience for plugins that want a batching [`Subtree`] rooted at
/// their own mount path instead of calling `set_plugin_state` directly.
pub fn root_subtree(ctx: &PluginContext, immediate_updates: bool) -> Subtree {
    ctx.create_subtree(ctx.path.clone(), immediate_updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct RecordingPlugin {
        fail_init: bool,
        accept_update: bool,
        shutdown_calls: Rc<Cell<u32>>,
    }

    impl Plugin for RecordingPlugin {
        fn init(&mut self, ctx: &PluginContext, _config: &Value) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("boom");
            }
            ctx.set_state(&ctx.path, Some(Value::string("ready")));
            Ok(())
        }

        fn update_config(&mut self, _ctx: &PluginContext, _config: &Value) -> anyhow::Result<bool> {
            Ok(self.accept_update)
        }

        fn shutdown(&mut self, _ctx: &PluginContext) {
            self.shutdown_calls.set(self.shutdown_calls.get() + 1);
        }
    }

    fn registry(accept_update: bool, fail_init: bool, shutdown_calls: Rc<Cell<u32>>) -> PluginFactoryRegistry {
        let mut registry = PluginFactoryRegistry::new();
        registry.register(
            "demo.Recorder",
            Rc::new(move || {
                Box::new(RecordingPlugin { fail_init, accept_update, shutdown_calls: shutdown_calls.clone() })
                    as Box<dyn Plugin>
            }),
        );
        registry
    }

    #[test]
    fn unchanged_raw_state_is_a_no_op() {
        let engine = Engine::new(PluginFactoryRegistry::new());
        let raw = Value::map([("a".to_owned(), Value::int(1))]);
        engine.set_raw_state(raw.clone()).unwrap();
        let first = engine.get(&Path::root(), StateType::Raw).unwrap();
        engine.set_raw_state(raw).unwrap();
        let second = engine.get(&Path::root(), StateType::Raw).unwrap();
        assert!(first.is(&second));
    }

    #[test]
    fn non_mapping_raw_state_is_rejected() {
        let engine = Engine::new(PluginFactoryRegistry::new());
        let err = engine.set_raw_state(Value::int(1)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState));
    }

    #[test]
    fn reserved_sys_key_is_stripped_on_ingest() {
        let engine = Engine::new(PluginFactoryRegistry::new());
        let raw = Value::map([
            ("a".to_owned(), Value::int(1)),
            ("sys".to_owned(), Value::string("should be dropped")),
        ]);
        engine.set_raw_state(raw).unwrap();
        let got = engine.get(&Path::new([PathElement::key("sys")]), StateType::Raw);
        assert_eq!(got, None);
    }

    #[test]
    fn plugin_reconcile_create_and_reconfigure() {
        let shutdown_calls = Rc::new(Cell::new(0));
        let engine = Engine::new(registry(true, false, shutdown_calls));

        let raw = Value::map([(
            "p".to_owned(),
            Value::map([
                ("__plugin__".to_owned(), Value::string("demo.Recorder")),
                ("path".to_owned(), Value::string("/x")),
            ]),
        )]);
        engine.set_raw_state(raw).unwrap();
        assert_eq!(engine.inner.borrow().plugins.len(), 1);
        let published = engine.get(&Path::new([PathElement::key("p")]), StateType::Unresolved);
        assert_eq!(published, Some(Value::string("ready")));

        let raw2 = Value::map([(
            "p".to_owned(),
            Value::map([
                ("__plugin__".to_owned(), Value::string("demo.Recorder")),
                ("path".to_owned(), Value::string("/y")),
            ]),
        )]);
        engine.set_raw_state(raw2).unwrap();
        assert_eq!(engine.inner.borrow().plugins.len(), 1, "update_config accepted => same instance kept");
    }

    #[test]
    fn plugin_reconcile_rejects_update_and_recreates() {
        let shutdown_calls = Rc::new(Cell::new(0));
        let engine = Engine::new(registry(false, false, shutdown_calls.clone()));

        let raw = Value::map([(
            "p".to_owned(),
            Value::map([
                ("__plugin__".to_owned(), Value::string("demo.Recorder")),
                ("path".to_owned(), Value::string("/x")),
            ]),
        )]);
        engine.set_raw_state(raw).unwrap();

        let raw2 = Value::map([(
            "p".to_owned(),
            Value::map([
                ("__plugin__".to_owned(), Value::string("demo.Recorder")),
                ("path".to_owned(), Value::string("/y")),
            ]),
        )]);
        engine.set_raw_state(raw2).unwrap();
        assert_eq!(shutdown_calls.get(), 1, "rejected update_config tears down the old instance");
    }

    #[test]
    fn plugin_removal_disables_and_shuts_down() {
        let shutdown_calls = Rc::new(Cell::new(0));
        let engine = Engine::new(registry(true, false, shutdown_calls.clone()));

        let raw = Value::map([(
            "p".to_owned(),
            Value::map([("__plugin__".to_owned(), Value::string("demo.Recorder"))]),
        )]);
        engine.set_raw_state(raw).unwrap();
        engine.set_raw_state(Value::empty_map()).unwrap();
        assert_eq!(shutdown_calls.get(), 1);
        assert!(engine.inner.borrow().plugins.is_empty());
    }

    #[test]
    fn failed_init_publishes_exception_state() {
        let shutdown_calls = Rc::new(Cell::new(0));
        let engine = Engine::new(registry(true, true, shutdown_calls));
        let raw = Value::map([(
            "p".to_owned(),
            Value::map([("__plugin__".to_owned(), Value::string("demo.Recorder"))]),
        )]);
        engine.set_raw_state(raw).unwrap();
        let state = engine.get(&Path::new([PathElement::key("p")]), StateType::Unresolved).unwrap();
        assert!(state.get_key("exception").is_some());
    }

    #[test]
    fn command_registry_round_trip() {
        let engine = Engine::new(PluginFactoryRegistry::new());
        let info = Rc::new(RefCell::new(PluginInfo::new(Path::new([PathElement::key("p")]), Value::empty_map())));

        let sub_path = Path::new([PathElement::key("p"), PathElement::key("sub")]);
        let function: CommandFn = Rc::new(|_| Ok(Value::int(1)));
        let disposer = engine
            .register_command(&info, &sub_path, "go", function.clone(), Some("do it".to_owned()))
            .unwrap();

        assert!(engine.command(&sub_path, "go").is_some());
        let commands = engine.get(&Path::new([PathElement::key("sys"), PathElement::key("commands")]), StateType::Resolved)
            .unwrap();
        let entry = commands.get_key(&format_path(&sub_path)).and_then(|m| m.get_key("go"));
        assert_eq!(entry.and_then(|e| e.get_key("doc")), Some(Value::string("do it")));

        let dup = engine.register_command(&info, &sub_path, "go", function, None);
        assert!(matches!(dup, Err(EngineError::DuplicateCommand { .. })));

        disposer();
        assert!(engine.command(&sub_path, "go").is_none());
    }

    #[test]
    fn disabled_plugin_cannot_register_commands_or_subscribe() {
        let engine = Engine::new(PluginFactoryRegistry::new());
        let info = Rc::new(RefCell::new(PluginInfo::new(Path::new([PathElement::key("p")]), Value::empty_map())));
        info.borrow_mut().disabled = true;

        let function: CommandFn = Rc::new(|_| Ok(Value::int(1)));
        let err = engine
            .register_command(&info, &Path::new([PathElement::key("p")]), "go", function, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::DisabledActor { .. }));

        let err = engine
            .subscribe(Some(&info), vec![(Path::root(), StateType::Resolved)], Rc::new(|_| {}), true)
            .unwrap_err();
        assert!(matches!(err, EngineError::DisabledActor { .. }));
    }

    #[test]
    fn subscription_dispatch_fires_initial_and_on_change_with_dispatch_pending() {
        let engine = Engine::new(PluginFactoryRegistry::new());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let _disposer = engine
            .subscribe(
                None,
                vec![(Path::new([PathElement::key("a")]), StateType::Resolved)],
                Rc::new(move |values| seen_clone.borrow_mut().push(values[0].clone())),
                true,
            )
            .unwrap();

        engine.dispatch_pending();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0], None);

        engine.set_raw_state(Value::map([("a".to_owned(), Value::int(1))])).unwrap();
        engine.dispatch_pending();
        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(seen.borrow()[1], Some(Value::int(1)));
    }

    #[test]
    fn plugin_substate_is_overlaid_and_symlinks_resolve_across_it() {
        let engine = Engine::new(PluginFactoryRegistry::new());
        let info = Rc::new(RefCell::new(PluginInfo::new(Path::new([PathElement::key("p")]), Value::empty_map())));
        engine.inner.borrow_mut().plugins.push(info.clone());

        engine.set_raw_state(Value::map([(
            "link".to_owned(),
            Value::map([("__symlink__".to_owned(), Value::string("/p/x"))]),
        )])).unwrap();

        engine.set_plugin_state(&info, &Path::new([PathElement::key("p")]), Some(Value::map([("x".to_owned(), Value::int(42))])));

        let resolved_link = engine.get(&Path::new([PathElement::key("link")]), StateType::Resolved);
        assert_eq!(resolved_link, Some(Value::int(42)));
    }
}
