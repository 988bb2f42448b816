//! The subscription mirror tree: one [`Directory`] node per path element
//! anyone has subscribed through, lazily created and garbage-collected once
//! unwatched.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use kestrel_value::{PathElement, Value};

use crate::subscription::Subscription;

/// A node in the mirror tree. Mirrors the shape of the value tree it
/// shadows, one level at a time, only where a subscription has asked to be
/// notified.
pub struct Directory {
    parent: Option<Weak<RefCell<Directory>>>,
    path_element: Option<PathElement>,
    subdirectories: IndexMap<PathElement, Rc<RefCell<Directory>>>,
    subscriptions: Vec<(Weak<RefCell<Subscription>>, usize)>,
    state: Option<Value>,
}

/// Subscriptions whose reported state changed during an update pass, keyed
/// by the subscription's address so the same subscription is only queued
/// once even if several of its slots changed in one pass.
pub type PendingDispatch = HashMap<usize, Rc<RefCell<Subscription>>>;

impl Directory {
    pub fn new_root() -> Rc<RefCell<Directory>> {
        Rc::new(RefCell::new(Directory {
            parent: None,
            path_element: None,
            subdirectories: IndexMap::new(),
            subscriptions: Vec::new(),
            state: None,
        }))
    }

    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    /// Walks `path` from `dir`, creating intermediate directories as needed
    /// when `create` is `true`; returns `None` on a miss when `create` is
    /// `false`.
    pub fn get(
        dir: &Rc<RefCell<Directory>>,
        path: &[PathElement],
        create: bool,
    ) -> Option<Rc<RefCell<Directory>>> {
        let mut current = dir.clone();
        for element in path {
            let existing = current.borrow().subdirectories.get(element).cloned();
            current = match existing {
                Some(child) => child,
                None if create => Directory::new_child(&current, element.clone()),
                None => return None,
            };
        }
        Some(current)
    }

    fn new_child(parent: &Rc<RefCell<Directory>>, path_element: PathElement) -> Rc<RefCell<Directory>> {
        let state = parent
            .borrow()
            .state
            .as_ref()
            .and_then(|state| state.get(&path_element));
        let child = Rc::new(RefCell::new(Directory {
            parent: Some(Rc::downgrade(parent)),
            path_element: Some(path_element.clone()),
            subdirectories: IndexMap::new(),
            subscriptions: Vec::new(),
            state,
        }));
        parent
            .borrow_mut()
            .subdirectories
            .insert(path_element, child.clone());
        child
    }

    pub(crate) fn add_subscription(dir: &Rc<RefCell<Directory>>, sub: &Weak<RefCell<Subscription>>, idx: usize) {
        dir.borrow_mut().subscriptions.push((sub.clone(), idx));
    }

    /// Removes every slot of `sub` from `dir`, then garbage-collects `dir`
    /// if it became childless and subscription-less.
    pub(crate) fn remove_subscription(dir: &Rc<RefCell<Directory>>, sub: &Rc<RefCell<Subscription>>) {
        dir.borrow_mut()
            .subscriptions
            .retain(|(weak, _)| match weak.upgrade() {
                Some(existing) => !Rc::ptr_eq(&existing, sub),
                None => false,
            });
        Directory::garbage_collect(dir);
    }

    /// Removes `dir` from its parent, and its parent's parent, and so on,
    /// as long as each became empty — mirrors `Directory.garbageCollect`.
    pub fn garbage_collect(dir: &Rc<RefCell<Directory>>) {
        let (empty, parent_weak) = {
            let d = dir.borrow();
            (
                d.subdirectories.is_empty() && d.subscriptions.is_empty(),
                d.parent.clone(),
            )
        };
        if !empty {
            return;
        }
        let Some(parent_weak) = parent_weak else {
            return;
        };
        let Some(parent) = parent_weak.upgrade() else {
            return;
        };
        let path_element = dir.borrow().path_element.clone();
        if let Some(element) = path_element {
            parent.borrow_mut().subdirectories.shift_remove(&element);
        }
        dir.borrow_mut().parent = None;
        Directory::garbage_collect(&parent);
    }

    /// Propagates `new_state` through `dir` and every descendant directory,
    /// updating subscribed slots in place and recording which subscriptions
    /// need dispatch. A no-op if `new_state` is the same instance already
    /// stored (hash-consing makes this a cheap, exact check).
    pub fn update(dir: &Rc<RefCell<Directory>>, new_state: Option<Value>, pending: &mut PendingDispatch) {
        if dir.borrow().state == new_state {
            return;
        }

        let slots: Vec<(Weak<RefCell<Subscription>>, usize)> = {
            let mut d = dir.borrow_mut();
            d.subscriptions.retain(|(weak, _)| weak.strong_count() > 0);
            d.subscriptions.clone()
        };

        for (weak, idx) in slots {
            if let Some(sub) = weak.upgrade() {
                let changed = sub.borrow_mut().set_current_state(idx, new_state.clone());
                if changed {
                    pending.insert(Rc::as_ptr(&sub) as usize, sub);
                }
            }
        }

        let children: Vec<(PathElement, Rc<RefCell<Directory>>)> = dir
            .borrow()
            .subdirectories
            .iter()
            .map(|(key, child)| (key.clone(), child.clone()))
            .collect();

        for (key, child) in children {
            let child_state = new_state.as_ref().and_then(|state| state.get(&key));
            Directory::update(&child, child_state, pending);
        }

        dir.borrow_mut().state = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(elements: &[PathElement]) -> Vec<PathElement> {
        elements.to_vec()
    }

    #[test]
    fn update_propagates_to_descendants_and_trims_matching_state() {
        let root = Directory::new_root();
        let child = Directory::get(&root, &path(&[PathElement::key("a")]), true).unwrap();
        let grandchild = Directory::get(&child, &path(&[PathElement::key("b")]), true).unwrap();

        let mut pending = PendingDispatch::new();
        let state = Value::map([(
            "a".to_owned(),
            Value::map([("b".to_owned(), Value::int(1))]),
        )]);
        Directory::update(&root, Some(state.clone()), &mut pending);

        assert_eq!(grandchild.borrow().state(), Some(&Value::int(1)));

        // Re-applying the identical (pointer-equal) state short-circuits at the root.
        Directory::update(&root, Some(state), &mut pending);
        assert_eq!(grandchild.borrow().state(), Some(&Value::int(1)));
    }

    #[test]
    fn garbage_collect_prunes_empty_ancestors() {
        let root = Directory::new_root();
        let child = Directory::get(&root, &path(&[PathElement::key("a")]), true).unwrap();
        let _grandchild = Directory::get(&child, &path(&[PathElement::key("b")]), true).unwrap();
        assert_eq!(root.borrow().subdirectories.len(), 1);

        Directory::garbage_collect(&child);
        assert_eq!(root.borrow().subdirectories.len(), 1, "child still has a child of its own");

        child.borrow_mut().subdirectories.clear();
        Directory::garbage_collect(&child);
        assert_eq!(root.borrow().subdirectories.len(), 0);
    }
}
