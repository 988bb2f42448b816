//! Plugin roster extraction: finds every subtree tagged `__plugin__`.

use kestrel_value::{Path, PathElement, Value};

const CACHE_KEY: &str = "kestrel-info::plugins";

/// Every plugin-tagged subtree reachable from `data`, as `(path, subtree)`
/// pairs with `path` relative to `data`. A map with a `__plugin__` key is a
/// plugin node and is not searched further; recursion into map children
/// visits keys in ascending sorted order, so results are deterministic.
pub fn plugins(data: &Value) -> Vec<(Path, Value)> {
    data.cache_get_or_compute(CACHE_KEY, compute)
}

fn compute(data: &Value) -> Vec<(Path, Value)> {
    if data.is_map() && data.get_key("__plugin__").is_some() {
        return vec![(Path::root(), data.clone())];
    }

    let mut out = Vec::new();
    if data.is_map() {
        let mut entries: Vec<(String, Value)> =
            data.iter_map().map(|(k, v)| (k.to_owned(), v)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in entries {
            if value.is_map() || value.is_list() {
                for (path, plugin) in plugins(&value) {
                    out.push((path.prepend(PathElement::key(key.clone())), plugin));
                }
            }
        }
    } else if data.is_list() {
        for (index, value) in data.iter_list().enumerate() {
            if value.is_map() || value.is_list() {
                for (path, plugin) in plugins(&value) {
                    out.push((path.prepend(PathElement::index(index)), plugin));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_plugin_nodes_in_sorted_order() {
        let data = Value::map([
            (
                "b".to_owned(),
                Value::map([("__plugin__".to_owned(), Value::string("demo"))]),
            ),
            (
                "a".to_owned(),
                Value::map([("__plugin__".to_owned(), Value::string("demo"))]),
            ),
            ("c".to_owned(), Value::int(1)),
        ]);

        let found = plugins(&data);
        let paths: Vec<String> = found
            .iter()
            .map(|(path, _)| kestrel_value::format_path(path))
            .collect();
        assert_eq!(paths, vec!["/a", "/b"]);
    }

    #[test]
    fn plugin_node_is_not_searched_further() {
        let inner = Value::map([
            ("__plugin__".to_owned(), Value::string("demo")),
            (
                "nested".to_owned(),
                Value::map([("__plugin__".to_owned(), Value::string("hidden"))]),
            ),
        ]);
        let found = plugins(&inner);
        assert_eq!(found.len(), 1);
        assert!(found[0].0.is_root());
    }
}
