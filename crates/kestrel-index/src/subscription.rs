//! Subscriptions: a set of watched paths, the latest value seen at each,
//! and the callback to run when the reported batch falls behind.

use std::rc::Rc;

use kestrel_value::{Path, Value};

/// Which of the engine's three snapshots a subscription slot watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    Raw,
    Unresolved,
    Resolved,
}

#[derive(Clone)]
pub struct SubscriptionSlot {
    pub path: Path,
    pub directory: Rc<std::cell::RefCell<crate::directory::Directory>>,
    pub state_type: StateType,
}

/// One subscriber's view across its watched slots. `current_state` always
/// reflects the latest values; `reported_state` is what the callback was
/// last told, so dispatch only fires on an actual change. The outer
/// `Option` in `reported_state` distinguishes "never reported" from
/// "reported as Absent" — collapsing them would suppress the first
/// dispatch whenever a watched path starts out Absent.
pub struct Subscription {
    pub slots: Vec<SubscriptionSlot>,
    current_state: Vec<Option<Value>>,
    reported_state: Vec<Option<Option<Value>>>,
    pub disabled: bool,
    callback: Rc<dyn Fn(&[Option<Value>])>,
}

impl Subscription {
    pub fn new(
        slots: Vec<SubscriptionSlot>,
        current_state: Vec<Option<Value>>,
        initial: bool,
        callback: Rc<dyn Fn(&[Option<Value>])>,
    ) -> Self {
        let reported_state = if initial {
            vec![None; current_state.len()]
        } else {
            current_state.iter().cloned().map(Some).collect()
        };
        Subscription {
            slots,
            current_state,
            reported_state,
            disabled: false,
            callback,
        }
    }

    pub fn current_state(&self) -> &[Option<Value>] {
        &self.current_state
    }

    /// Updates slot `idx`; returns `true` if the value actually changed.
    pub fn set_current_state(&mut self, idx: usize, state: Option<Value>) -> bool {
        let changed = self.current_state[idx] != state;
        self.current_state[idx] = state;
        changed
    }

    /// `true` (and advances `reported_state`) if `current_state` differs
    /// from what was last reported and a dispatch should be scheduled.
    pub fn mark_for_dispatch(&mut self) -> bool {
        if self.disabled {
            return false;
        }
        let unchanged = self
            .reported_state
            .iter()
            .zip(self.current_state.iter())
            .all(|(reported, current)| reported.as_ref() == Some(current));
        if unchanged {
            return false;
        }
        self.reported_state = self.current_state.iter().cloned().map(Some).collect();
        true
    }

    pub fn dispatch(&self) {
        if !self.disabled {
            (self.callback)(&self.current_state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Directory;
    use std::cell::RefCell;

    fn slot(directory: Rc<RefCell<Directory>>) -> SubscriptionSlot {
        SubscriptionSlot {
            path: Path::root(),
            directory,
            state_type: StateType::Resolved,
        }
    }

    #[test]
    fn initial_true_dispatches_even_when_value_is_absent() {
        let dir = Directory::new_root();
        let mut sub = Subscription::new(vec![slot(dir)], vec![None], true, Rc::new(|_| {}));
        assert!(sub.mark_for_dispatch());
    }

    #[test]
    fn initial_false_suppresses_dispatch_until_a_real_change() {
        let dir = Directory::new_root();
        let mut sub = Subscription::new(vec![slot(dir)], vec![Some(Value::int(1))], false, Rc::new(|_| {}));
        assert!(!sub.mark_for_dispatch());
        sub.set_current_state(0, Some(Value::int(2)));
        assert!(sub.mark_for_dispatch());
    }
}
