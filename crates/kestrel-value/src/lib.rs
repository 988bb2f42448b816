//! Content-hashed, structurally-shared JSON values and path algebra.
//!
//! This crate is the foundation of the kestrel state-tree engine: an
//! immutable [`Value`] tree with hash-consing (so pointer equality implies
//! deep equality) and a typed [`Path`] algebra for addressing into it.

pub mod error;
pub mod path;
pub mod value;

pub use error::{ValueError, ValueResult};
pub use path::{Path, PathElement, format_path, format_path_element, parse_path, parse_path_element};
pub use value::{Value, get_at_path, get_at_path_p, set_at_path, set_at_path_p};
