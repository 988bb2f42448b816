//! A plugin-local scratch tree that batches writes and submits them to the
//! engine as one value per path, with its own nested command namespace.

use std::cell::RefCell;
use std::rc::Rc;

use kestrel_value::{Path, PathElement, Value, set_at_path_p};

use crate::{CommandFn, Disposer, PluginContext};

struct RegisteredCommand {
    unregister: Option<Disposer>,
}

struct Inner {
    ctx: PluginContext,
    path: Path,
    state: Option<Value>,
    /// `None` until the first submit; distinguishes "never reported" from
    /// "reported as empty/Absent" the same way a subscription's reported
    /// state does.
    reported_state: Option<Option<Value>>,
    immediate_updates: bool,
    deactivated: bool,
    commands: Vec<((Path, String), RegisteredCommand)>,
}

/// Mirrors `pykzee.Tree.Tree`: a plugin writes into its subtree with
/// [`Subtree::set`], which either submits immediately or waits for an
/// explicit [`Subtree::submit_state`], and registers commands scoped under
/// the subtree's own mount path.
#[derive(Clone)]
pub struct Subtree {
    inner: Rc<RefCell<Inner>>,
}

impl Subtree {
    pub(crate) fn new(ctx: PluginContext, path: Path, immediate_updates: bool) -> Self {
        Subtree {
            inner: Rc::new(RefCell::new(Inner {
                ctx,
                path,
                state: None,
                reported_state: None,
                immediate_updates,
                deactivated: false,
                commands: Vec::new(),
            })),
        }
    }

    /// Sets `path` (relative to this subtree) to `value`; `None` deletes.
    pub fn set(&self, path: &Path, value: Option<Value>) {
        let mut inner = self.inner.borrow_mut();
        if inner.deactivated {
            return;
        }
        inner.state = Some(
            set_at_path_p(inner.state.take(), path, value)
                .expect("plugin state updates never hit a type-mismatched segment"),
        );
        if inner.immediate_updates {
            Self::submit(&mut inner);
        }
    }

    /// Forces a submit of any state accumulated since the last one (a
    /// no-op under `immediate_updates`, which already submits on every
    /// `set`).
    pub fn submit_state(&self) {
        Self::submit(&mut self.inner.borrow_mut());
    }

    fn submit(inner: &mut Inner) {
        let current = inner.state.clone();
        if inner.reported_state.as_ref() == Some(&current) {
            return;
        }
        let mount_path = inner.path.clone();
        inner.ctx.set_state(&mount_path, current.clone());
        inner.reported_state = Some(current);
    }

    pub fn register_command(
        &self,
        path: Path,
        name: impl Into<String>,
        function: CommandFn,
        doc: Option<String>,
    ) -> Disposer {
        let name = name.into();
        let mut inner = self.inner.borrow_mut();
        let mount_path = inner.path.clone();
        let full_path = mount_path.join(&path);
        let unregister = inner.ctx.register_command(&full_path, &name, function, doc);
        inner
            .commands
            .push(((path, name), RegisteredCommand { unregister: Some(unregister) }));

        let weak = Rc::downgrade(&self.inner);
        let key = inner.commands.last().map(|_| inner.commands.len() - 1);
        drop(inner);
        Box::new(move || {
            if let (Some(strong), Some(index)) = (weak.upgrade(), key) {
                let mut inner = strong.borrow_mut();
                if let Some((_, cmd)) = inner.commands.get_mut(index) {
                    if let Some(unregister) = cmd.unregister.take() {
                        unregister();
                    }
                }
            }
        })
    }

    pub fn create_subtree(&self, path: impl Into<PathElement>, immediate_updates: bool) -> Subtree {
        let inner = self.inner.borrow();
        let full_path = inner.path.joined(path);
        inner.ctx.create_subtree(full_path, immediate_updates)
    }

    /// Unregisters every command and clears this subtree's published
    /// state.
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        for (_, mut cmd) in std::mem::take(&mut inner.commands) {
            if let Some(unregister) = cmd.unregister.take() {
                unregister();
            }
        }
        inner.state = None;
        let mount_path = inner.path.clone();
        inner.ctx.set_state(&mount_path, None);
        inner.reported_state = Some(None);
    }

    pub fn deactivate(&self) {
        let already = self.inner.borrow().deactivated;
        if already {
            return;
        }
        self.clear();
        self.inner.borrow_mut().deactivated = true;
    }

    pub fn path(&self) -> Path {
        self.inner.borrow().path.clone()
    }
}
