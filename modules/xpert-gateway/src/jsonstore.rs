//! Single-writer, file-backed JSON store abstraction.
//!
//! `JsonStore<T>` owns one in-memory `T`, guarded by a `tokio::sync::Mutex`,
//! mirrored to one JSON file on disk. Every commit is a write to a temp file
//! followed by a rename, which is atomic on the same filesystem. A caller
//! needing a different backing store (an embedded key-value store, a
//! relational table) can swap the implementation without touching callers.

use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

pub struct JsonStore<T> {
    path: PathBuf,
    state: Mutex<T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default + Send,
{
    /// Load `path` if it exists, otherwise start from `T::default()`.
    /// I/O failures on load are treated as an empty store (fail-open for
    /// reads; writes are retried rather than silently skipped).
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "corrupt store file, starting empty");
                T::default()
            }),
            Err(e) => {
                tracing::info!(path = %path.display(), error = %e, "store file unreadable, starting empty");
                T::default()
            }
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Hold the lock across a read-modify-write closure, then persist.
    /// The closure must not perform network I/O — the lock must be released
    /// before any suspension point that isn't the final file write.
    pub async fn modify<F, R>(&self, f: F) -> Result<R, std::io::Error>
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut guard = self.state.lock().await;
        let result = f(&mut guard);
        self.persist(&guard).await?;
        Ok(result)
    }

    pub async fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        let guard = self.state.lock().await;
        f(&guard)
    }

    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().await
    }

    /// Persist the current in-memory state without otherwise mutating it.
    pub async fn flush(&self) -> Result<(), std::io::Error> {
        let guard = self.state.lock().await;
        self.persist(&guard).await
    }

    async fn persist(&self, value: &T) -> Result<(), std::io::Error> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp_path = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Counter {
        n: i64,
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = std::env::temp_dir().join(format!("jsonstore-test-{}", uuid_like()));
        let store: JsonStore<Counter> = JsonStore::load(dir.join("nope.json")).await;
        assert_eq!(store.read(|c| c.n).await, 0);
    }

    #[tokio::test]
    async fn modify_persists_across_reload() {
        let dir = std::env::temp_dir().join(format!("jsonstore-test-{}", uuid_like()));
        let path = dir.join("counter.json");
        let store: JsonStore<Counter> = JsonStore::load(&path).await;
        store.modify(|c| c.n += 5).await.unwrap();

        let reloaded: JsonStore<Counter> = JsonStore::load(&path).await;
        assert_eq!(reloaded.read(|c| c.n).await, 5);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    fn uuid_like() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64
    }
}
