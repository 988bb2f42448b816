//! Path algebra: typed path elements, parsing, and printing.
//!
//! A [`Path`] is an ordered sequence of [`PathElement`]s. The textual form is
//! slash-separated; integer elements print as `[n]`; `%`, `/`, and a leading
//! `[` in string elements are percent-escaped; `.` and `..` are reserved for
//! relative resolution and escaped as `%2E` / `%2E.` when literal.

use std::fmt;

/// One segment of a [`Path`]: a mapping key or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathElement {
    Key(String),
    Index(usize),
}

impl PathElement {
    pub fn key(s: impl Into<String>) -> Self {
        Self::Key(s.into())
    }

    pub fn index(i: usize) -> Self {
        Self::Index(i)
    }

    pub fn as_key(&self) -> Option<&str> {
        match self {
            Self::Key(k) => Some(k),
            Self::Index(_) => None,
        }
    }

    pub fn as_index(&self) -> Option<usize> {
        match self {
            Self::Index(i) => Some(*i),
            Self::Key(_) => None,
        }
    }
}

impl From<&str> for PathElement {
    fn from(s: &str) -> Self {
        Self::Key(s.to_owned())
    }
}

impl From<String> for PathElement {
    fn from(s: String) -> Self {
        Self::Key(s)
    }
}

impl From<usize> for PathElement {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

/// An ordered sequence of [`PathElement`]s.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Path(Vec<PathElement>);

impl Path {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(elements: impl IntoIterator<Item = PathElement>) -> Self {
        Self(elements.into_iter().collect())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.0
    }

    pub fn first(&self) -> Option<&PathElement> {
        self.0.first()
    }

    /// The path with its first element removed, or `self` if already root.
    pub fn tail(&self) -> Path {
        if self.0.is_empty() {
            Path::root()
        } else {
            Path(self.0[1..].to_vec())
        }
    }

    pub fn push(&mut self, element: impl Into<PathElement>) {
        self.0.push(element.into());
    }

    pub fn joined(&self, element: impl Into<PathElement>) -> Path {
        let mut out = self.clone();
        out.push(element);
        out
    }

    /// `self` with `element` inserted at the front.
    pub fn prepend(&self, element: impl Into<PathElement>) -> Path {
        let mut out = Vec::with_capacity(self.0.len() + 1);
        out.push(element.into());
        out.extend(self.0.iter().cloned());
        Path(out)
    }

    pub fn join(&self, other: &Path) -> Path {
        let mut out = self.0.clone();
        out.extend(other.0.iter().cloned());
        Path(out)
    }

    /// `true` if `self` is `other` or a descendant of `other`.
    pub fn starts_with(&self, other: &Path) -> bool {
        self.0.len() >= other.0.len() && self.0[..other.0.len()] == other.0[..]
    }
}

impl IntoIterator for Path {
    type Item = PathElement;
    type IntoIter = std::vec::IntoIter<PathElement>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a PathElement;
    type IntoIter = std::slice::Iter<'a, PathElement>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<PathElement> for Path {
    fn from_iter<T: IntoIterator<Item = PathElement>>(iter: T) -> Self {
        Path(iter.into_iter().collect())
    }
}

/// Parses a textual path. An absolute path (leading `/`) is returned as-is;
/// a relative path is resolved against `base`. `.` is skipped; `..` pops one
/// element from the accumulated result (a no-op at the root).
pub fn parse_path(s: &str, base: &Path) -> Path {
    let absolute = s.starts_with('/');
    let trimmed = s.trim_matches('/');

    if trimmed.is_empty() {
        return if absolute { Path::root() } else { base.clone() };
    }

    let mut result: Vec<PathElement> = if absolute {
        Vec::new()
    } else {
        base.0.clone()
    };

    for segment in trimmed.split('/') {
        match segment {
            ".." => {
                result.pop();
            }
            "." => {}
            other => result.push(parse_path_element(other)),
        }
    }

    Path(result)
}

/// Parses a single textual path segment: `[n]` decodes to an index, anything
/// else is percent-decoded and kept as a key.
pub fn parse_path_element(segment: &str) -> PathElement {
    if let Some(digits) = segment
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        && !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && let Ok(index) = digits.parse::<usize>()
    {
        return PathElement::Index(index);
    }
    PathElement::Key(percent_decode(segment))
}

/// Formats a [`Path`] back to its textual, slash-separated form. Lossless
/// for any path produced by [`parse_path`] or emitted by the engine.
pub fn format_path(path: &Path) -> String {
    let mut out = String::from("/");
    for (i, element) in path.0.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(&format_path_element(element));
    }
    out
}

pub fn format_path_element(element: &PathElement) -> String {
    match element {
        PathElement::Index(i) => format!("[{i}]"),
        PathElement::Key(key) => {
            if key == "." {
                "%2E".to_owned()
            } else if key == ".." {
                "%2E.".to_owned()
            } else {
                let escaped = key.replace('%', "%25").replace('/', "%2F");
                if escaped.starts_with('[') {
                    format!("%5B{}", &escaped[1..])
                } else {
                    escaped
                }
            }
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_path(self))
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3])
                && let Ok(value) = u8::from_str_radix(hex, 16)
            {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_path() {
        let p = parse_path("/a/b/[1]", &Path::root());
        assert_eq!(
            p.elements(),
            &[
                PathElement::key("a"),
                PathElement::key("b"),
                PathElement::index(1),
            ]
        );
    }

    #[test]
    fn relative_path_resolves_against_base() {
        let base = Path::new([PathElement::key("a"), PathElement::key("b")]);
        let p = parse_path("c", &base);
        assert_eq!(
            p.elements(),
            &[PathElement::key("a"), PathElement::key("b"), PathElement::key("c")]
        );
    }

    #[test]
    fn dotdot_pops_one_element_and_is_noop_at_root() {
        let base = Path::new([PathElement::key("a")]);
        assert_eq!(parse_path("..", &base), Path::root());
        assert_eq!(parse_path("../../x", &Path::root()), Path::new([PathElement::key("x")]));
    }

    #[test]
    fn dot_segment_is_skipped() {
        let p = parse_path("/a/./b", &Path::root());
        assert_eq!(p.elements(), &[PathElement::key("a"), PathElement::key("b")]);
    }

    #[test]
    fn format_round_trips_through_parse() {
        let p = Path::new([
            PathElement::key("weird/key%"),
            PathElement::index(3),
            PathElement::key("."),
            PathElement::key(".."),
            PathElement::key("[literal]"),
        ]);
        let s = format_path(&p);
        let reparsed = parse_path(&s, &Path::root());
        assert_eq!(p, reparsed);
    }

    #[test]
    fn format_escapes_literal_dot_and_dotdot() {
        let p = Path::new([PathElement::key("."), PathElement::key("..")]);
        assert_eq!(format_path(&p), "/%2E/%2E.");
    }

    #[test]
    fn starts_with() {
        let a = Path::new([PathElement::key("a"), PathElement::key("b")]);
        let b = Path::new([PathElement::key("a")]);
        assert!(a.starts_with(&b));
        assert!(!b.starts_with(&a));
        assert!(a.starts_with(&a));
    }
}
