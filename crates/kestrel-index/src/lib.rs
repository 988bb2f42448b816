//! The subscription index: a mirror tree of [`Directory`] nodes that
//! tracks, for every watched path, the latest value seen there, and decides
//! when a [`Subscription`]'s callback needs to run.

mod directory;
mod subscription;

use std::cell::RefCell;
use std::rc::Rc;

pub use directory::{Directory, PendingDispatch};
pub use subscription::{StateType, Subscription, SubscriptionSlot};

use kestrel_value::{Path, Value};

/// Creates a subscription across one or more `(path, root, state_type)`
/// triples, lazily materializing directories along each path and
/// registering the subscription as a (weak) listener on its leaf
/// directories.
pub fn subscribe(
    watches: &[(Path, Rc<RefCell<Directory>>, StateType)],
    callback: Rc<dyn Fn(&[Option<Value>])>,
    initial: bool,
) -> Rc<RefCell<Subscription>> {
    let slots: Vec<SubscriptionSlot> = watches
        .iter()
        .map(|(path, root, state_type)| {
            let dir = Directory::get(root, path.elements(), true)
                .expect("create=true always yields a directory");
            SubscriptionSlot {
                path: path.clone(),
                directory: dir,
                state_type: *state_type,
            }
        })
        .collect();

    let current_state: Vec<Option<Value>> = slots
        .iter()
        .map(|slot| slot.directory.borrow().state().cloned())
        .collect();

    let sub = Rc::new(RefCell::new(Subscription::new(
        slots,
        current_state,
        initial,
        callback,
    )));

    let weak = Rc::downgrade(&sub);
    for (idx, slot) in sub.borrow().slots.iter().enumerate() {
        Directory::add_subscription(&slot.directory, &weak, idx);
    }

    sub
}

/// Disables `sub` and removes it from every directory it was registered
/// on, garbage-collecting directories left empty behind it.
pub fn unsubscribe(sub: &Rc<RefCell<Subscription>>) {
    sub.borrow_mut().disabled = true;
    let directories: Vec<Rc<RefCell<Directory>>> = sub
        .borrow()
        .slots
        .iter()
        .map(|slot| slot.directory.clone())
        .collect();
    for directory in directories {
        Directory::remove_subscription(&directory, sub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_value::PathElement;
    use std::cell::Cell;

    #[test]
    fn subscription_fires_on_update_and_unsubscribe_stops_it() {
        let root = Directory::new_root();
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();
        let sub = subscribe(
            &[(Path::new([PathElement::key("x")]), root.clone(), StateType::Resolved)],
            Rc::new(move |_states| calls_clone.set(calls_clone.get() + 1)),
            true,
        );

        let mut pending = PendingDispatch::new();
        Directory::update(&root, Some(Value::map([("x".to_owned(), Value::int(1))])), &mut pending);
        for (_, pending_sub) in pending.drain() {
            if pending_sub.borrow_mut().mark_for_dispatch() {
                pending_sub.borrow().dispatch();
            }
        }
        assert_eq!(calls.get(), 1);

        unsubscribe(&sub);
        let mut pending = PendingDispatch::new();
        Directory::update(&root, Some(Value::map([("x".to_owned(), Value::int(2))])), &mut pending);
        assert!(pending.is_empty());
        assert_eq!(calls.get(), 1);
    }
}
