use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::layout::{self, Geometry, NOTIFY_SEQ_OFFSET};
use crate::core::lock::FileLockGuard;
use crate::core::mmap::SharedMap;
use crate::core::wait::WakeWord;
use crate::core::{Error, Result};
use crate::store::{CoordinationStore, StoreState};

/// Store backed by a memory-mapped file at a well-known path.
///
/// Exclusion between processes comes from `flock` on the file; exclusion
/// between threads sharing one `FileStore` comes from the inner mutex. The
/// wake word at [`NOTIFY_SEQ_OFFSET`] is the only part of the mapping
/// touched without the lock.
pub struct FileStore {
    path: PathBuf,
    file: File,
    map: Mutex<SharedMap>,
    notify: *const AtomicU32,
}

// SAFETY: `notify` points into `map`, which is never remapped for the life
// of the store, and the word is only accessed atomically.
unsafe impl Send for FileStore {}
unsafe impl Sync for FileStore {}

impl FileStore {
    /// Opens the store at `path`, creating and initializing it with
    /// `geometry` if the file is new. An existing store keeps the geometry
    /// it was created with.
    pub fn open(path: impl AsRef<Path>, geometry: Geometry) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| Error::StoreUnavailable {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| Error::StoreUnavailable {
                path: path.clone(),
                source,
            })?;

        let map = {
            let _guard = FileLockGuard::acquire(&file)?;
            match Self::read_geometry(&file)? {
                None => {
                    let len = file.metadata()?.len();
                    if len > 0 {
                        log::warn!(
                            "store {} was never fully initialized ({len} bytes), initializing",
                            path.display()
                        );
                    }
                    let mut map = SharedMap::map(&file, geometry.file_len()?)?;
                    geometry.init(map.as_mut_slice())?;
                    map.flush_async()?;
                    log::debug!(
                        "created store {} ({} slots, {} byte payloads)",
                        path.display(),
                        geometry.capacity,
                        geometry.max_payload
                    );
                    map
                }
                Some(existing) => {
                    let len = existing.file_len()?;
                    if file.metadata()?.len() < len as u64 {
                        return Err(Error::Corrupt("store truncated"));
                    }
                    let map = SharedMap::map(&file, len)?;
                    layout::decode(map.as_slice())?;
                    if existing != geometry {
                        log::debug!(
                            "store {} keeps its geometry {:?} over requested {:?}",
                            path.display(),
                            existing,
                            geometry
                        );
                    }
                    map
                }
            }
        };

        let notify = unsafe { map.as_ptr().add(NOTIFY_SEQ_OFFSET) as *const AtomicU32 };
        Ok(Self {
            path,
            file,
            map: Mutex::new(map),
            notify,
        })
    }

    /// Deletes the store file. Processes that still have it mapped keep
    /// working on the unlinked copy; new launches create a fresh store.
    pub fn remove(path: impl AsRef<Path>) -> Result<()> {
        match std::fs::remove_file(path.as_ref()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> Result<Geometry> {
        let map = self.lock_map();
        Geometry::read(map.as_slice())
    }

    /// Geometry of an initialized store, or `None` while the magic is still
    /// zero. The magic is written last, so a creator that died part way
    /// leaves a file that is safe to initialize again.
    fn read_geometry(file: &File) -> Result<Option<Geometry>> {
        use std::io::Read;

        let mut header = Vec::with_capacity(layout::SLOTS_OFFSET);
        file.take(layout::SLOTS_OFFSET as u64).read_to_end(&mut header)?;
        if header.iter().take(4).all(|&byte| byte == 0) {
            return Ok(None);
        }
        Geometry::read(&header).map(Some)
    }

    // The mapping is re-validated by its checksum on every decode, so a
    // poisoned mutex is safe to reuse.
    fn lock_map(&self) -> MutexGuard<'_, SharedMap> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_word(&self) -> WakeWord<'_> {
        WakeWord::new(unsafe { &*self.notify })
    }
}

impl CoordinationStore for FileStore {
    fn with_exclusive_access<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StoreState) -> Result<R>,
    {
        let mut map = self.lock_map();
        let _guard = FileLockGuard::acquire(&self.file)?;
        let mut state = layout::decode(map.as_slice())?;
        let before = state.clone();
        let out = f(&mut state)?;
        if state != before {
            layout::encode(&state, map.as_mut_slice())?;
        }
        Ok(out)
    }

    fn change_seq(&self) -> u32 {
        self.wake_word().load()
    }

    fn notify_change(&self) -> Result<()> {
        self.wake_word().bump()
    }

    fn wait_for_change(&self, seen: u32, timeout: Duration) -> Result<()> {
        self.wake_word().wait(seen, timeout)
    }
}
