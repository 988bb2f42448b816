//! The reference filesystem loader: materializes a config directory tree
//! into a [`kestrel_value::Value`] and debounces filesystem events into a
//! single `set_raw_state` call per quiescent period.
//!
//! This crate is not part of the engine's public contract (`kestrel-engine`
//! knows nothing about files or `notify`) — it is one concrete way to feed
//! `Engine::set_raw_state`, ported from `pykzee.core.RawStateLoader`.

mod error;

pub use error::{LoaderError, LoaderResult};

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::future::BoxFuture;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use kestrel_value::Value;

/// Builder for [`Loader`], following the crate's `fn new(...)` /
/// fluent-setter builder convention.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    root: PathBuf,
    debounce: Duration,
}

impl LoaderConfig {
    /// `root` defaults are the caller's concern; the on-disk contract (§6)
    /// treats the process working directory as the default root, but this
    /// builder always takes an explicit one.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), debounce: Duration::from_secs(2) }
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Watches [`LoaderConfig::root`] for changes and, after each quiescent
/// period of at least its debounce duration, rereads the whole tree and
/// hands it to whatever callback [`Loader::run`] was given. The watcher
/// itself lives on its own OS thread (per `notify`'s contract) and only
/// ever touches the loader through the `Send` channel that feeds `run`'s
/// debounce loop — it never calls into the (non-`Send`) engine directly,
/// matching the single cross-thread boundary described in §5.
pub struct Loader {
    config: LoaderConfig,
    reread_tx: mpsc::UnboundedSender<()>,
    reread_rx: RefCell<Option<mpsc::UnboundedReceiver<()>>>,
    // Kept alive for the loader's lifetime; dropping it stops the watch.
    _watcher: RecommendedWatcher,
}

impl Loader {
    pub fn new(config: LoaderConfig) -> LoaderResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let event_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if res.is_ok() {
                let _ = event_tx.send(());
            }
        })
        .map_err(|source| LoaderError::Watch { path: config.root.clone(), source })?;

        watcher
            .watch(&config.root, RecursiveMode::Recursive)
            .map_err(|source| LoaderError::Watch { path: config.root.clone(), source })?;

        Ok(Loader { config, reread_tx: tx, reread_rx: RefCell::new(Some(rx)), _watcher: watcher })
    }

    /// Reads the config tree once, outside of the debounce loop — used for
    /// the initial `set_raw_state` call before any filesystem event has
    /// fired.
    #[tracing::instrument(skip(self))]
    pub async fn read_state_from_disk(&self) -> LoaderResult<Value> {
        load_state_tree(&self.config.root).await
    }

    /// Forces a reread on the next debounce window, as if a filesystem
    /// event had just fired. Useful for tests and manual `SIGHUP`-style
    /// reload triggers.
    pub fn request_reread(&self) {
        let _ = self.reread_tx.send(());
    }

    /// Runs the debounce loop forever (until the internal channel closes,
    /// which only happens if this `Loader` is dropped): waits for a
    /// filesystem event, then for `debounce` quiescence with no further
    /// events, then rereads the tree once and invokes `on_change`. Mirrors
    /// `RawStateLoader.__rereadTaskImpl`. Must be called at most once per
    /// `Loader` (subsequent calls panic — the receiver half is consumed).
    pub async fn run(&self, on_change: impl Fn(Value)) {
        let mut rx = self.reread_rx.borrow_mut().take().expect("Loader::run called more than once");
        loop {
            if rx.recv().await.is_none() {
                return;
            }
            loop {
                match tokio::time::timeout(self.config.debounce, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_elapsed) => break,
                }
            }
            match load_state_tree(&self.config.root).await {
                Ok(value) => on_change(value),
                Err(error) => {
                    tracing::error!(%error, "failed to reread config directory; keeping previous raw state");
                }
            }
        }
    }
}

/// Materializes a directory tree into a [`Value`] mapping, per §6:
/// dotfiles and files ending in `~` are ignored; directories become
/// mappings; `.json` files are parsed, `.txt` files are read as text with
/// the extension stripped, any other regular file is read as raw text
/// under its own filename; non-regular files are skipped with a warning.
pub fn load_state_tree(dir: &Path) -> BoxFuture<'_, LoaderResult<Value>> {
    Box::pin(async move {
        let mut reader =
            tokio::fs::read_dir(dir).await.map_err(|source| LoaderError::Io { path: dir.to_path_buf(), source })?;

        let mut names = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|source| LoaderError::Io { path: dir.to_path_buf(), source })?
        {
            names.push(entry.file_name());
        }
        names.sort();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let name_str = name.to_string_lossy().into_owned();
            if name_str.starts_with('.') || name_str.ends_with('~') {
                continue;
            }

            let fspath = dir.join(&name);
            let metadata = tokio::fs::symlink_metadata(&fspath)
                .await
                .map_err(|source| LoaderError::Io { path: fspath.clone(), source })?;

            if metadata.is_dir() {
                let child = load_state_tree(&fspath).await?;
                out.push((name_str, child));
            } else if metadata.is_file() {
                let content = tokio::fs::read_to_string(&fspath)
                    .await
                    .map_err(|source| LoaderError::Io { path: fspath.clone(), source })?;
                if let Some(stem) = name_str.strip_suffix(".json") {
                    let json: serde_json::Value = serde_json::from_str(&content)
                        .map_err(|source| LoaderError::Json { path: fspath.clone(), source })?;
                    out.push((stem.to_owned(), Value::from_json(&json)?));
                } else if let Some(stem) = name_str.strip_suffix(".txt") {
                    out.push((stem.to_owned(), Value::string(content)));
                } else {
                    out.push((name_str, Value::string(content)));
                }
            } else {
                tracing::warn!(path = %fspath.display(), "ignoring non-regular file");
            }
        }
        Ok(Value::map(out))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[tokio::test]
    async fn materializes_directories_json_and_text_files() {
        let root = unique_test_root("kestrel-loader-materialize");
        tokio::fs::create_dir_all(root.join("nested")).await.unwrap();
        tokio::fs::write(root.join("a.json"), r#"{"n": 1}"#).await.unwrap();
        tokio::fs::write(root.join("b.txt"), "hello").await.unwrap();
        tokio::fs::write(root.join("raw"), "unparsed").await.unwrap();
        tokio::fs::write(root.join(".hidden"), "nope").await.unwrap();
        tokio::fs::write(root.join("backup~"), "nope").await.unwrap();
        tokio::fs::write(root.join("nested").join("c.txt"), "deep").await.unwrap();

        let value = load_state_tree(&root).await.unwrap();
        assert_eq!(value.get_key("a").unwrap().get_key("n"), Some(Value::int(1)));
        assert_eq!(value.get_key("b"), Some(Value::string("hello")));
        assert_eq!(value.get_key("raw"), Some(Value::string("unparsed")));
        assert_eq!(value.get_key(".hidden"), None);
        assert_eq!(value.get_key("backup~"), None);
        assert_eq!(value.get_key("nested").unwrap().get_key("c"), Some(Value::string("deep")));

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_json_is_a_loader_error_not_a_panic() {
        let root = unique_test_root("kestrel-loader-bad-json");
        tokio::fs::create_dir_all(&root).await.unwrap();
        tokio::fs::write(root.join("broken.json"), "{not json").await.unwrap();

        let result = load_state_tree(&root).await;
        assert!(matches!(result, Err(LoaderError::Json { .. })));

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
