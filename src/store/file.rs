use super::StoreBackend;
use crate::Error;
use crate::proto::StoreSnapshotProto;
use prost::Message;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// The snapshot's full file name with `.tmp` appended, so stores that share
/// a file stem never share a temporary file.
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Writes `bytes` to `tmp`, flushes it to disk and renames it over `path`.
fn write_durably(tmp: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp, path)
}

/// Durable backend that keeps the namespace in a single snapshot file.
///
/// Every mutation writes the complete snapshot to a sibling temporary file
/// and renames it over the previous one, so a put or a clear either lands
/// completely or not at all. Reads are served from memory.
pub struct FileBackend {
    path: PathBuf,
    tmp_path: PathBuf,
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl FileBackend {
    /// Opens the snapshot at `path`, starting empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        let entries = match fs::read(&path) {
            Ok(bytes) => StoreSnapshotProto::deserialize(&bytes)?.entries,
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                warn!(path = %path.display(), "failed to read key store: {err}");
                return Err(Error::Storage(err.to_string()));
            }
        };
        debug!(path = %path.display(), entries = entries.len(), "opened key store");

        Ok(Self {
            tmp_path: tmp_path(&path),
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>, Error> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("file store lock poisoned".to_string()))
    }

    fn persist(&self, entries: HashMap<String, Vec<u8>>) -> Result<(), Error> {
        let bytes = StoreSnapshotProto::new(entries).encode_to_vec();

        write_durably(&self.tmp_path, &self.path, &bytes).map_err(|err| {
            warn!(path = %self.path.display(), "failed to persist key store: {err}");
            Error::Storage(err.to_string())
        })
    }
}

impl StoreBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let mut entries = self.lock()?;

        let mut next = entries.clone();
        next.insert(key.to_string(), value);
        self.persist(next.clone())?;

        *entries = next;
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        let mut entries = self.lock()?;

        self.persist(HashMap::new())?;
        entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");

        {
            let backend = FileBackend::open(&path).unwrap();
            backend.put("device_id", b"device-1".to_vec()).unwrap();
            backend.put("prekeys_uploaded", vec![1]).unwrap();
        }

        let reopened = FileBackend::open(&path).unwrap();
        assert_eq!(reopened.get("device_id").unwrap(), Some(b"device-1".to_vec()));
        assert_eq!(reopened.get("prekeys_uploaded").unwrap(), Some(vec![1]));
        assert_eq!(reopened.get("missing").unwrap(), None);
    }

    #[test]
    fn test_clear_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");

        let backend = FileBackend::open(&path).unwrap();
        backend.put("device_id", b"device-1".to_vec()).unwrap();
        backend.clear().unwrap();
        drop(backend);

        let reopened = FileBackend::open(&path).unwrap();
        assert_eq!(reopened.get("device_id").unwrap(), None);
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_stores_sharing_a_stem_stay_apart() {
        let dir = tempfile::tempdir().unwrap();
        let keys = FileBackend::open(dir.path().join("a.keys")).unwrap();
        let db = FileBackend::open(dir.path().join("a.db")).unwrap();

        keys.put("device_id", b"from-keys".to_vec()).unwrap();
        db.put("device_id", b"from-db".to_vec()).unwrap();
        keys.put("prekeys_uploaded", vec![1]).unwrap();

        assert_eq!(tmp_path(keys.path()), dir.path().join("a.keys.tmp"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);

        let keys = FileBackend::open(dir.path().join("a.keys")).unwrap();
        let db = FileBackend::open(dir.path().join("a.db")).unwrap();
        assert_eq!(keys.get("device_id").unwrap(), Some(b"from-keys".to_vec()));
        assert_eq!(keys.get("prekeys_uploaded").unwrap(), Some(vec![1]));
        assert_eq!(db.get("device_id").unwrap(), Some(b"from-db".to_vec()));
        assert_eq!(db.get("prekeys_uploaded").unwrap(), None);
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        fs::write(&path, [0xFF, 0xFF, 0xFF, 0xFF]).unwrap();

        assert!(matches!(FileBackend::open(&path), Err(Error::Storage(_))));
    }
}
