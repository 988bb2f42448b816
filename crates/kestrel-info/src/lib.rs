//! Derived, memoized structural analyses over [`kestrel_value::Value`]
//! trees: the plugin roster, the symlink table, realpath resolution, and
//! the fully-resolved (symlink-free) tree. Each analysis is cached on the
//! node it was computed from, so results are reused for free whenever the
//! same subtree instance reappears elsewhere.

mod plugins;
mod resolve;
mod symlink;

pub use plugins::plugins;
pub use resolve::{resolved, resolved_with};
pub use symlink::{get_subtree, is_self_ancestor, realpath, realpath_impl, realpaths, symlink_table, symlinks};
