//! # Object Store Interface
//!
//! FILE objects read and write their bytes through this random-access store
//! abstraction; the engine itself never touches a filesystem. The store maps
//! an opaque path to a handle supporting positioned reads/writes, and the
//! receiver may rename an object once its INFO (typically the file name)
//! arrives.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and by
//! applications that stage objects in RAM.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

/// A random-access byte store handle for one object.
pub trait StoreFile: Send {
    /// Read up to `buf.len()` bytes at `offset`. Returns bytes read (short at
    /// end of object).
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `data` at `offset`, extending the object as needed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Current object size in bytes.
    fn size(&self) -> u64;

    /// Rename the underlying object (e.g. on `RX_OBJECT_INFO`).
    fn rename(&mut self, name: &str) -> io::Result<()>;

    /// Name the handle currently maps to.
    fn name(&self) -> String;
}

/// Factory mapping opaque paths to handles.
pub trait ObjectStore: Send {
    /// Open an existing object read-only.
    fn open_read(&mut self, path: &str) -> io::Result<Box<dyn StoreFile>>;

    /// Create (or truncate) an object read-write.
    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn StoreFile>>;
}

// ─── In-memory implementation ───────────────────────────────────────────────

type SharedMap = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// An in-process store: a name → bytes map shared by all handles.
#[derive(Default, Clone)]
pub struct MemoryStore {
    objects: SharedMap,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Seed an object, returning the store for chaining.
    pub fn with_object(self, path: &str, data: &[u8]) -> Self {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), data.to_vec());
        self
    }

    /// Snapshot an object's current contents.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    /// Names currently present.
    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

pub struct MemoryFile {
    objects: SharedMap,
    name: String,
}

impl ObjectStore for MemoryStore {
    fn open_read(&mut self, path: &str) -> io::Result<Box<dyn StoreFile>> {
        if !self.objects.lock().unwrap().contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, path.to_string()));
        }
        Ok(Box::new(MemoryFile {
            objects: self.objects.clone(),
            name: path.to_string(),
        }))
    }

    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn StoreFile>> {
        self.objects
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default();
        Ok(Box::new(MemoryFile {
            objects: self.objects.clone(),
            name: path.to_string(),
        }))
    }
}

impl StoreFile for MemoryFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let map = self.objects.lock().unwrap();
        let data = map
            .get(&self.name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, self.name.clone()))?;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut map = self.objects.lock().unwrap();
        let obj = map
            .get_mut(&self.name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, self.name.clone()))?;
        let end = offset as usize + data.len();
        if obj.len() < end {
            obj.resize(end, 0);
        }
        obj[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.objects
            .lock()
            .unwrap()
            .get(&self.name)
            .map(|d| d.len() as u64)
            .unwrap_or(0)
    }

    fn rename(&mut self, name: &str) -> io::Result<()> {
        let mut map = self.objects.lock().unwrap();
        let data = map
            .remove(&self.name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, self.name.clone()))?;
        map.insert(name.to_string(), data);
        self.name = name.to_string();
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
