//! # raft-storage
//!
//! why: provide durable persistence for raft recovery state using standard rust fs apis
//! relations: used by raft-core, which owns the encoding of what gets saved
//! what: Persister trait, FilePersister implementation, MemoryPersister for testing

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// trait for durable storage of a node's recovery state
///
/// the state is an opaque blob: this crate never looks inside it.
/// implementations must make `save` atomic, a crash mid-save leaves
/// either the previous blob or the new one, never a mix.
pub trait Persister: Send + Sync {
    /// replace the persisted state with `state`
    fn save(&self, state: &[u8]) -> io::Result<()>;

    /// load the persisted state, `None` on first run
    fn load(&self) -> io::Result<Option<Vec<u8>>>;

    /// size in bytes of the persisted state
    fn state_size(&self) -> io::Result<usize>;

    /// clear all persisted state (for testing)
    fn clear(&self) -> io::Result<()>;
}

// -- file persister implementation --

/// file-based persister using std::fs
///
/// stores the blob in `<dir>/raft-state.bin`, written through a temp file
/// and renamed into place.
pub struct FilePersister {
    /// directory path for storing state files
    dir: PathBuf,
    /// serializes writers so two saves never share the temp file
    write_lock: Mutex<()>,
}

impl FilePersister {
    /// create a new file persister at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("raft-state.bin")
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join("raft-state.tmp")
    }
}

impl Persister for FilePersister {
    fn save(&self, state: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock();

        // atomic write: write to temp file then rename
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(state)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;

        debug!(bytes = state.len(), dir = %self.dir.display(), "persisted raft state");
        Ok(())
    }

    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None); // default for new nodes
        }

        let mut file = File::open(&path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        Ok(Some(contents))
    }

    fn state_size(&self) -> io::Result<usize> {
        match fs::metadata(self.state_path()) {
            Ok(meta) => Ok(meta.len() as usize),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear(&self) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        remove_if_present(self.state_path())?;
        remove_if_present(self.temp_path())
    }
}

// a file that is already gone counts as removed
fn remove_if_present(path: PathBuf) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// -- in-memory persister implementation --

/// in-memory persister for testing
///
/// clones share the same slot, so a test can hand one clone to a node,
/// kill the node, and hand another clone to its replacement to simulate
/// a crash and restart within one process.
#[derive(Clone, Default)]
pub struct MemoryPersister {
    state: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryPersister {
    /// create a new, empty in-memory persister
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn save(&self, state: &[u8]) -> io::Result<()> {
        *self.state.lock() = Some(state.to_vec());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.state.lock().clone())
    }

    fn state_size(&self) -> io::Result<usize> {
        Ok(self.state.lock().as_ref().map_or(0, Vec::len))
    }

    fn clear(&self) -> io::Result<()> {
        *self.state.lock() = None;
        Ok(())
    }
}
