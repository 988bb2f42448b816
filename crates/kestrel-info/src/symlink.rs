//! Symlink discovery and path resolution.
//!
//! A map of exactly one entry keyed `__symlink__` marks a symlink node. Its
//! value names the destination, either as a slash-separated string (parsed
//! the same way an absolute path is) or as a list of literal path elements
//! (strings and non-negative integers, taken as-is with no escaping).

use std::collections::HashMap;

use kestrel_value::{Path, PathElement, Value, get_at_path_p, parse_path};

const SYMLINKS_CACHE_KEY: &str = "kestrel-info::symlinks";
const REALPATHS_CACHE_KEY: &str = "kestrel-info::realpaths";
const TABLE_CACHE_KEY: &str = "kestrel-info::symlink-table";

enum Marker {
    Target(Path),
    Invalid,
    Absent,
}

fn marker(data: &Value) -> Marker {
    if data.is_map()
        && data.map_len() == Some(1)
        && let Some(target) = data.get_key("__symlink__")
    {
        return match make_path(&target) {
            Some(path) => Marker::Target(path),
            None => Marker::Invalid,
        };
    }
    Marker::Absent
}

fn make_path(value: &Value) -> Option<Path> {
    if let Some(s) = value.as_str() {
        return Some(parse_path(s, &Path::root()));
    }
    if value.is_list() {
        let mut elements = Vec::new();
        for item in value.iter_list() {
            if let Some(s) = item.as_str() {
                elements.push(PathElement::key(s));
            } else if let Some(i) = item.as_int() {
                if i < 0 {
                    return None;
                }
                elements.push(PathElement::index(i as usize));
            } else {
                return None;
            }
        }
        return Some(Path::new(elements));
    }
    None
}

/// Every symlink reachable from `data`, as `(location, destination)` pairs
/// with `location` relative to `data`. A symlink node with an invalid
/// target halts recursion into that subtree (it hides any symlinks nested
/// beneath it, matching a plugin node's behavior).
pub fn symlinks(data: &Value) -> Vec<(Path, Path)> {
    data.cache_get_or_compute(SYMLINKS_CACHE_KEY, compute_symlinks)
}

fn compute_symlinks(data: &Value) -> Vec<(Path, Path)> {
    match marker(data) {
        Marker::Invalid => Vec::new(),
        Marker::Target(dest) => vec![(Path::root(), dest)],
        Marker::Absent => {
            let mut out = Vec::new();
            if data.is_map() {
                let mut entries: Vec<(String, Value)> =
                    data.iter_map().map(|(k, v)| (k.to_owned(), v)).collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                for (key, value) in entries {
                    if value.is_map() || value.is_list() {
                        for (path, dest) in symlinks(&value) {
                            out.push((path.prepend(PathElement::key(key.clone())), dest));
                        }
                    }
                }
            } else if data.is_list() {
                for (index, value) in data.iter_list().enumerate() {
                    if value.is_map() || value.is_list() {
                        for (path, dest) in symlinks(&value) {
                            out.push((path.prepend(PathElement::index(index)), dest));
                        }
                    }
                }
            }
            out
        }
    }
}

/// Follows `location` through `table`, substituting a full destination
/// whenever a traversed prefix is itself a symlink source. Returns `None`
/// if the same source location is revisited without the remaining suffix
/// getting shorter (a cycle).
pub fn realpath_impl(table: &HashMap<Path, Path>, location: &Path) -> Option<Path> {
    let mut remaining: Vec<PathElement> = location.elements().to_vec();
    let mut result: Vec<PathElement> = Vec::new();
    let mut seen_at_length: HashMap<Path, usize> = HashMap::new();

    while !remaining.is_empty() {
        let first = remaining.remove(0);
        result.push(first);
        let result_path = Path::new(result.iter().cloned());

        if let Some(dest) = table.get(&result_path) {
            if let Some(&prev_remaining_len) = seen_at_length.get(&result_path)
                && remaining.len() >= prev_remaining_len
            {
                return None;
            }
            seen_at_length.insert(result_path, remaining.len());
            let mut next = dest.elements().to_vec();
            next.extend(remaining);
            remaining = next;
            result = Vec::new();
        }
    }

    Some(Path::new(result))
}

/// The symlink table for `data`: every symlink location mapped to its raw
/// (unresolved) destination.
pub fn symlink_table(data: &Value) -> HashMap<Path, Path> {
    data.cache_get_or_compute(TABLE_CACHE_KEY, |data| symlinks(data).into_iter().collect())
}

/// Resolves `location` against `data`'s symlink table, returning `None` on
/// a cyclic chain.
pub fn realpath(data: &Value, location: &Path) -> Option<Path> {
    realpath_impl(&symlink_table(data), location)
}

/// Every symlink in `data`, with destinations fully resolved through
/// `data`'s own symlink table. Dangling chains (cycles) are dropped.
pub fn realpaths(data: &Value) -> Vec<(Path, Path)> {
    data.cache_get_or_compute(REALPATHS_CACHE_KEY, |data| {
        let direct = symlinks(data);
        let table: HashMap<Path, Path> = direct.iter().cloned().collect();
        direct
            .into_iter()
            .filter_map(|(location, destination)| {
                realpath_impl(&table, &destination).map(|real| (location, real))
            })
            .collect()
    })
}

/// `true` if `dest` is exactly the `dest.len()`-element prefix of `loc`
/// (the location would resolve back through one of its own ancestors).
pub fn is_self_ancestor(loc: &Path, dest: &Path) -> bool {
    loc.len() >= dest.len() && &loc.elements()[..dest.len()] == dest.elements()
}

/// Fetches the subtree at `path`, or `None` if any segment is missing or
/// type-mismatched.
pub fn get_subtree(data: &Value, path: &Path) -> Option<Value> {
    get_at_path_p(Some(data), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_and_list_symlink_targets_are_recognized() {
        let data = Value::map([
            ("x1".to_owned(), Value::map([("__symlink__".to_owned(), Value::string("x2"))])),
            (
                "x2".to_owned(),
                Value::map([(
                    "__symlink__".to_owned(),
                    Value::list([Value::string("x3")]),
                )]),
            ),
        ]);
        let sls = symlinks(&data);
        assert_eq!(sls.len(), 2);
    }

    #[test]
    fn cycle_is_reported_as_none() {
        let mut table = HashMap::new();
        table.insert(Path::new([PathElement::key("a")]), Path::new([PathElement::key("b")]));
        table.insert(Path::new([PathElement::key("b")]), Path::new([PathElement::key("a")]));
        let result = realpath_impl(&table, &Path::new([PathElement::key("a")]));
        assert_eq!(result, None);
    }

    #[test]
    fn self_ancestor_detection() {
        let loc = Path::new([PathElement::key("a"), PathElement::key("b")]);
        let dest = Path::new([PathElement::key("a")]);
        assert!(is_self_ancestor(&loc, &dest));
        assert!(!is_self_ancestor(&dest, &loc));
    }
}
