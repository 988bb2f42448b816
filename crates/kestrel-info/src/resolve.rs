//! Iterative symlink resolution: rewrites every symlink in a tree to the
//! (structurally shared) subtree it points at.

use kestrel_value::{Path, PathElement, Value, get_at_path_p};

use crate::symlink::{get_subtree, is_self_ancestor, realpaths};

const STEP_CACHE_KEY: &str = "kestrel-info::resolve-step";
const STEP_BACK_CACHE_KEY: &str = "kestrel-info::resolve-step-back";

/// Default iteration budget for [`resolved`], matching [`resolved_with`]'s
/// defaults.
const DEFAULT_MAX_STEPS: usize = 5;
/// Number of leading passes that tolerate a symlink resolving back through
/// one of its own ancestors, before such symlinks are dropped instead.
const DEFAULT_MAX_BACKRESOLVE_STEPS: usize = 1;

/// Resolves every symlink in `data`, iterating until the tree stops
/// changing or a fixed step budget is exhausted. The first pass is
/// permitted to resolve a symlink back through one of its own ancestors
/// (so a symlink created next to the thing it points at still resolves on
/// the first pass); later passes drop such symlinks instead of looping.
pub fn resolved(data: &Value) -> Value {
    resolved_with(data, DEFAULT_MAX_STEPS, DEFAULT_MAX_BACKRESOLVE_STEPS)
}

pub fn resolved_with(data: &Value, max_steps: usize, max_backresolve_steps: usize) -> Value {
    let mut current = data.clone();
    for level in 0..max_steps {
        let next = if level < max_backresolve_steps {
            resolve_step_back(&current)
        } else {
            resolve_step(&current)
        };
        if next.is(&current) {
            break;
        }
        current = next;
    }
    current
}

fn resolve_step(data: &Value) -> Value {
    data.cache_get_or_compute(STEP_CACHE_KEY, |data| {
        let replacements: Vec<(Path, Option<Value>)> = realpaths(data)
            .into_iter()
            .filter(|(loc, dest)| !is_self_ancestor(loc, dest))
            .map(|(loc, dest)| (loc, get_subtree(data, &dest)))
            .collect();
        apply(data, replacements)
    })
}

fn resolve_step_back(data: &Value) -> Value {
    data.cache_get_or_compute(STEP_BACK_CACHE_KEY, |data| {
        let replacements: Vec<(Path, Option<Value>)> = realpaths(data)
            .into_iter()
            .map(|(loc, dest)| (loc, get_subtree(data, &dest)))
            .collect();
        apply(data, replacements)
    })
}

fn apply(data: &Value, replacements: Vec<(Path, Option<Value>)>) -> Value {
    if replacements.is_empty() {
        return data.clone();
    }
    resolve_impl(Some(data.clone()), &replacements).unwrap_or_else(Value::empty_map)
}

/// Applies a batch of path-scoped replacements to `data` in one pass,
/// grouping replacements that share a common path prefix so each child is
/// only ever rebuilt once. A lone replacement at the root path replaces
/// `data` wholesale (and may delete it, by way of `None`).
fn resolve_impl(data: Option<Value>, replacements: &[(Path, Option<Value>)]) -> Option<Value> {
    if replacements.len() == 1 && replacements[0].0.is_root() {
        return replacements[0].1.clone();
    }
    if replacements.is_empty() {
        return data;
    }

    let mut data = data;
    let mut i = 0;
    while i < replacements.len() {
        let first_elem = replacements[i]
            .0
            .first()
            .cloned()
            .expect("grouped replacement path must be non-root");
        let mut j = i + 1;
        while j < replacements.len() && replacements[j].0.first() == Some(&first_elem) {
            j += 1;
        }

        if j - i == 1 && replacements[i].0.len() == 1 {
            data = Some(set_single(data, &first_elem, replacements[i].1.clone()));
        } else {
            let child = data.as_ref().and_then(|d| d.get(&first_elem));
            let subreplacements: Vec<(Path, Option<Value>)> = (i..j)
                .map(|k| (replacements[k].0.tail(), replacements[k].1.clone()))
                .collect();
            let new_child = resolve_impl(child, &subreplacements);
            data = Some(set_single(data, &first_elem, new_child));
        }
        i = j;
    }
    data
}

fn set_single(data: Option<Value>, element: &PathElement, value: Option<Value>) -> Value {
    match value {
        None => match data {
            Some(d) if d.is_map() || d.is_list() => d.without(element),
            Some(d) => d,
            None => Value::empty_map(),
        },
        Some(v) => {
            let base = data.unwrap_or_else(|| match element {
                PathElement::Key(_) => Value::empty_map(),
                PathElement::Index(_) => Value::empty_list(),
            });
            base.with(element, v)
                .expect("resolve target location must already exist in the source tree")
        }
    }
}

#[allow(dead_code)]
fn debug_get(data: &Value, path: &Path) -> Option<Value> {
    get_at_path_p(Some(data), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_symlink_to_sibling() {
        let data = Value::map([
            ("foo".to_owned(), Value::string("bar")),
            (
                "link".to_owned(),
                Value::map([("__symlink__".to_owned(), Value::string("foo"))]),
            ),
        ]);
        let r = resolved(&data);
        assert_eq!(r.get_key("link"), Some(Value::string("bar")));
    }

    #[test]
    fn resolves_nested_and_chained_symlinks() {
        let data = Value::map([
            ("foo".to_owned(), Value::string("bar")),
            (
                "x1".to_owned(),
                Value::list([
                    Value::int(0),
                    Value::int(1),
                    Value::int(2),
                    Value::map([("__symlink__".to_owned(), Value::string("x2"))]),
                    Value::int(4),
                ]),
            ),
            (
                "x2".to_owned(),
                Value::map([
                    ("y1".to_owned(), Value::int(123)),
                    (
                        "y2".to_owned(),
                        Value::map([("__symlink__".to_owned(), Value::string("foo"))]),
                    ),
                    (
                        "y3".to_owned(),
                        Value::map([(
                            "__symlink__".to_owned(),
                            Value::string("/x1/[3]/y1"),
                        )]),
                    ),
                    (
                        "y4".to_owned(),
                        Value::map([(
                            "__symlink__".to_owned(),
                            Value::list([Value::string("x2"), Value::string("y2")]),
                        )]),
                    ),
                ]),
            ),
        ]);

        let r = resolved(&data);
        let x2 = r.get_key("x2").unwrap();
        assert_eq!(x2.get_key("y1"), Some(Value::int(123)));
        assert_eq!(x2.get_key("y2"), Some(Value::string("bar")));
        assert_eq!(x2.get_key("y3"), Some(Value::int(123)));
        assert_eq!(x2.get_key("y4"), Some(Value::string("bar")));

        let x1 = r.get_key("x1").unwrap();
        let x1_3 = x1.get_index(3).unwrap();
        assert_eq!(x1_3, x2);
    }

    #[test]
    fn unresolvable_cycle_is_dropped() {
        let data = Value::map([
            ("a".to_owned(), Value::map([("__symlink__".to_owned(), Value::string("b"))])),
            ("b".to_owned(), Value::map([("__symlink__".to_owned(), Value::string("a"))])),
        ]);
        let r = resolved(&data);
        assert!(r.is(&data));
    }
}
