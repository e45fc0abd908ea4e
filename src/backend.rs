//! Persistence layer behind [`SwitchStore`](crate::SwitchStore).
//!
//! The store only needs a key-value table of switches with upsert, delete, and enumerate
//! operations. A backend also exposes a generation counter that changes on every write; stores
//! sharing a backend compare it to detect writes made by someone else.
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

use crate::{Error, Result, Switch};

/// Persistence contract required by the switch store.
pub trait Backend: Send + Sync {
    /// Load a single switch. `Ok(None)` if it does not exist.
    fn load(&self, key: &str) -> Result<Option<Switch>>;

    /// Insert or replace a switch.
    fn save(&self, switch: &Switch) -> Result<()>;

    /// Remove a switch. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Every stored switch.
    fn list_all(&self) -> Result<Vec<Switch>>;

    /// Counter that changes whenever the table is written. Backends that cannot detect foreign
    /// writes return a constant.
    fn generation(&self) -> Result<u64> {
        Ok(0)
    }
}

/// In-memory backend. Share one instance between several stores (via `Arc`) to model stores in
/// different processes over the same database.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    switches: RwLock<HashMap<String, Switch>>,
    generation: AtomicU64,
}

impl MemoryBackend {
    /// An empty table.
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }

    /// Create a backend pre-populated with `switches`.
    pub fn with_switches(switches: impl IntoIterator<Item = Switch>) -> MemoryBackend {
        let backend = MemoryBackend::new();
        {
            let mut table = backend
                .switches
                .write()
                .expect("thread holding backend lock should not panic");
            for switch in switches {
                table.insert(switch.key.clone(), switch);
            }
        }
        backend
    }
}

impl Backend for MemoryBackend {
    fn load(&self, key: &str) -> Result<Option<Switch>> {
        let switches = self
            .switches
            .read()
            .map_err(|_| Error::Storage("memory backend lock poisoned".to_owned()))?;
        Ok(switches.get(key).cloned())
    }

    fn save(&self, switch: &Switch) -> Result<()> {
        let mut switches = self
            .switches
            .write()
            .map_err(|_| Error::Storage("memory backend lock poisoned".to_owned()))?;
        switches.insert(switch.key.clone(), switch.clone());
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut switches = self
            .switches
            .write()
            .map_err(|_| Error::Storage("memory backend lock poisoned".to_owned()))?;
        if switches.remove(key).is_some() {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<Switch>> {
        let switches = self
            .switches
            .read()
            .map_err(|_| Error::Storage("memory backend lock poisoned".to_owned()))?;
        Ok(switches.values().cloned().collect())
    }

    fn generation(&self) -> Result<u64> {
        Ok(self.generation.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileTable {
    #[serde(default)]
    generation: u64,
    #[serde(default)]
    switches: BTreeMap<String, Switch>,
}

/// Identifies one version of the table file without reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: SystemTime,
    len: u64,
}

impl Fingerprint {
    /// `None` if the file does not exist.
    fn of(path: &Path) -> Result<Option<Fingerprint>> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(Some(Fingerprint {
                modified: metadata.modified()?,
                len: metadata.len(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Backend storing the whole table as one JSON document.
///
/// Writes go to a sibling temporary file that is renamed over the original, so readers never see
/// a partially written table. Writers within one process are serialized; writers in different
/// processes are last-write-wins.
///
/// The parsed table is kept in memory and only re-read when the file's modification time or
/// size changes, so polling [`Backend::generation`] costs one `stat`.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    write_lock: Mutex<()>,
    snapshot: Mutex<Option<(Option<Fingerprint>, Arc<FileTable>)>>,
}

impl FileBackend {
    /// Use the table at `path`. A missing file is treated as an empty table.
    pub fn new(path: impl Into<PathBuf>) -> FileBackend {
        FileBackend {
            path: path.into(),
            write_lock: Mutex::new(()),
            snapshot: Mutex::new(None),
        }
    }

    /// Location of the table.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_table(&self) -> Result<Arc<FileTable>> {
        // Taken before parsing: a concurrent replace can only make the parsed table newer than
        // its fingerprint, which forces another parse on the next read.
        let fingerprint = Fingerprint::of(&self.path)?;
        let mut snapshot = self
            .snapshot
            .lock()
            .map_err(|_| Error::Storage("file backend lock poisoned".to_owned()))?;
        if let Some((seen, table)) = snapshot.as_ref() {
            if *seen == fingerprint {
                return Ok(table.clone());
            }
        }

        let table = Arc::new(self.parse_table()?);
        log::trace!(target: "switchyard", path:? = self.path, generation = table.generation; "parsed switch table");
        *snapshot = Some((fingerprint, table.clone()));
        Ok(table)
    }

    fn parse_table(&self) -> Result<FileTable> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FileTable::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn modify(&self, f: impl FnOnce(&mut FileTable) -> bool) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Storage("file backend lock poisoned".to_owned()))?;

        let mut table = self.parse_table()?;
        if !f(&mut table) {
            return Ok(());
        }
        table.generation += 1;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&table)?)?;
        fs::rename(&tmp, &self.path)?;

        *self
            .snapshot
            .lock()
            .map_err(|_| Error::Storage("file backend lock poisoned".to_owned()))? = None;
        Ok(())
    }
}

impl Backend for FileBackend {
    fn load(&self, key: &str) -> Result<Option<Switch>> {
        Ok(self.read_table()?.switches.get(key).cloned())
    }

    fn save(&self, switch: &Switch) -> Result<()> {
        self.modify(|table| {
            table.switches.insert(switch.key.clone(), switch.clone());
            true
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.modify(|table| table.switches.remove(key).is_some())
    }

    fn list_all(&self) -> Result<Vec<Switch>> {
        Ok(self.read_table()?.switches.values().cloned().collect())
    }

    fn generation(&self) -> Result<u64> {
        Ok(self.read_table()?.generation)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Backend, FileBackend, MemoryBackend};
    use crate::{Switch, SwitchStatus};

    fn exercise(backend: &dyn Backend) {
        assert!(backend.load("test").unwrap().is_none());
        let start = backend.generation().unwrap();

        let switch = Switch::new("test", SwitchStatus::Selective).with_label("Test");
        backend.save(&switch).unwrap();
        assert_eq!(backend.load("test").unwrap(), Some(switch.clone()));
        assert_ne!(backend.generation().unwrap(), start);

        backend
            .save(&Switch::new("test:child", SwitchStatus::Inherit))
            .unwrap();
        assert_eq!(backend.list_all().unwrap().len(), 2);

        backend.delete("test").unwrap();
        backend.delete("test").unwrap();
        assert!(backend.load("test").unwrap().is_none());
        assert_eq!(backend.list_all().unwrap().len(), 1);
    }

    #[test]
    fn memory_backend() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("switches.json"));
        exercise(&backend);

        // a second handle over the same file sees the same table
        let other = FileBackend::new(backend.path());
        assert!(other.load("test:child").unwrap().is_some());
        assert_eq!(other.generation().unwrap(), backend.generation().unwrap());
    }

    #[test]
    fn file_backend_rejects_corrupt_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switches.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(FileBackend::new(path).list_all().is_err());
    }

    #[test]
    fn file_backend_reparses_only_changed_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switches.json");
        let writer = FileBackend::new(&path);
        let reader = FileBackend::new(&path);

        writer.save(&Switch::new("test", SwitchStatus::Disabled)).unwrap();
        let generation = reader.generation().unwrap();
        let first = reader.read_table().unwrap();
        assert!(Arc::ptr_eq(&first, &reader.read_table().unwrap()));
        assert_eq!(reader.generation().unwrap(), generation);

        writer
            .save(&Switch::new("test", SwitchStatus::Selective).with_label("Changed"))
            .unwrap();
        assert_ne!(reader.generation().unwrap(), generation);
        assert_eq!(
            reader.load("test").unwrap().unwrap().status,
            SwitchStatus::Selective
        );
        assert!(!Arc::ptr_eq(&first, &reader.read_table().unwrap()));
    }
}
