use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use ulid::Ulid;

use crate::{StoreError, StoreResult};

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a JSON document. A missing file is `Ok(None)`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(path, err)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Serialize as pretty JSON and replace the file atomically.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write(path, &bytes)
}

/// Read-modify-write of the document at `path` under an exclusive lock.
///
/// The document is re-read from disk after the lock is taken, so changes made
/// by other handles since they were opened are kept. A missing file starts
/// from `T::default()`. Returns the written document and the result of `apply`.
pub(crate) fn update_json<T, R, F>(path: &Path, apply: F) -> StoreResult<(T, R)>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(&mut T) -> R,
{
    let _lock = StoreLock::acquire(path)?;
    let mut document = read_json::<T>(path)?.unwrap_or_default();
    let result = apply(&mut document);
    write_json(path, &document)?;
    Ok((document, result))
}

/// Advisory lock on `.{name}.lock` next to a store document, released on drop.
struct StoreLock {
    file: File,
}

impl StoreLock {
    fn acquire(path: &Path) -> StoreResult<Self> {
        ensure_parent(path)?;
        let lock_path = hidden_sibling(path, "lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| io_error(&lock_path, err))?;
        FileExt::lock_exclusive(&file).map_err(|err| io_error(&lock_path, err))?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %err, "failed to release store lock");
        }
    }
}

fn ensure_parent(path: &Path) -> StoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
    }
    Ok(())
}

/// Write to a sibling temp file, then rename over the target.
///
/// Each writer gets its own temp name so concurrent writers never share one.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    ensure_parent(path)?;

    let temp_path = hidden_sibling(path, &format!("{}.tmp", Ulid::new()));
    std::fs::write(&temp_path, bytes).map_err(|err| io_error(&temp_path, err))?;
    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(io_error(path, err));
    }
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "persisted store document");
    Ok(())
}

fn hidden_sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "store".to_string(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::{atomic_write, read_json, update_json, write_json};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[test]
    fn write_then_read_leaves_no_temp_files() {
        let dir = std::env::temp_dir().join(format!("crew-desk-fsio-{}", ulid::Ulid::new()));
        let path = dir.join("nested").join("doc.json");

        assert!(write_json(&path, &json!({ "a": 1 })).is_ok());
        let read: Option<Value> = read_json(&path).unwrap_or_else(|_| unreachable!());
        assert_eq!(read, Some(json!({ "a": 1 })));

        let entries = std::fs::read_dir(dir.join("nested"))
            .map(|it| it.filter_map(Result::ok).count())
            .unwrap_or_default();
        assert_eq!(entries, 1);
    }

    #[test]
    fn missing_file_reads_as_none_and_garbage_is_corrupt() {
        let dir = std::env::temp_dir().join(format!("crew-desk-fsio-{}", ulid::Ulid::new()));
        let path = dir.join("doc.json");

        let missing: Result<Option<Value>, _> = read_json(&path);
        assert!(matches!(missing, Ok(None)));

        assert!(atomic_write(&path, b"{not json").is_ok());
        let corrupt: Result<Option<Value>, _> = read_json(&path);
        assert!(matches!(corrupt, Err(crate::StoreError::Corrupt { .. })));
    }

    #[test]
    fn concurrent_updates_are_serialized() {
        let dir = std::env::temp_dir().join(format!("crew-desk-fsio-{}", ulid::Ulid::new()));
        let path = Arc::new(dir.join("counters.json"));

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let path = Arc::clone(&path);
                std::thread::spawn(move || {
                    for step in 0..10 {
                        let updated = update_json(&path, |doc: &mut BTreeMap<String, u32>| {
                            doc.insert(format!("w{worker}-{step}"), step);
                        });
                        assert!(updated.is_ok());
                    }
                })
            })
            .collect();
        for worker in workers {
            assert!(worker.join().is_ok());
        }

        let read: Option<BTreeMap<String, u32>> =
            read_json(&path).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(read.map(|doc| doc.len()), Some(40));
    }
}
