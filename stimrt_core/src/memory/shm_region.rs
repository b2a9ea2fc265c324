// Shared memory region backed by a memory-mapped file under the session directory
use crate::error::{StimError, StimResult};
use crate::memory::platform::safe_name;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Named memory-mapped region shared between the processes of one session.
///
/// The creator zero-fills the region; every other process opens it by name.
/// Regions are never resized after creation.
#[derive(Debug)]
pub struct ShmRegion {
    _mmap: MmapMut,
    ptr: NonNull<u8>,
    size: usize,
    path: PathBuf,
    _file: File,
    name: String,
    owner: bool,
}

impl ShmRegion {
    /// Create a fresh region (truncating any stale file with the same name)
    pub fn create(dir: &Path, name: &str, size: usize) -> StimResult<Self> {
        if size == 0 {
            return Err(StimError::InvalidInput(format!(
                "shared memory region '{}' must not be empty",
                name
            )));
        }
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("stimrt_{}", safe_name(name)));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size as u64)?;

        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        mmap.fill(0);
        let ptr = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| StimError::Internal(format!("null mapping for '{}'", name)))?;

        Ok(Self {
            _mmap: mmap,
            ptr,
            size,
            path,
            _file: file,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Open existing shared memory region (no creation)
    pub fn open(dir: &Path, name: &str) -> StimResult<Self> {
        let path = dir.join(format!("stimrt_{}", safe_name(name)));
        if !path.exists() {
            return Err(StimError::InvalidInput(format!(
                "shared memory '{}' does not exist at {}",
                name,
                path.display()
            )));
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(StimError::Internal(format!(
                "shared memory '{}' is empty",
                name
            )));
        }

        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        let ptr = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| StimError::Internal(format!("null mapping for '{}'", name)))?;

        Ok(Self {
            _mmap: mmap,
            ptr,
            size,
            path,
            _file: file,
            name: name.to_string(),
            owner: false,
        })
    }

    /// Base pointer of the mapping.
    ///
    /// All shared mutation goes through atomics or under a `ShmMutex`
    /// living inside the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Remove the backing file. The mapping stays valid until drop.
    pub fn unlink(&self) -> StimResult<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

// Thread safety
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_create_and_open_share_memory() {
        let dir = tempfile::tempdir().unwrap();
        let a = ShmRegion::create(dir.path(), "shared/counter", 64).unwrap();
        let b = ShmRegion::open(dir.path(), "shared/counter").unwrap();
        assert!(a.is_owner());
        assert!(!b.is_owner());
        assert_eq!(b.size(), 64);

        let wa = unsafe { &*(a.as_ptr() as *const AtomicU64) };
        let wb = unsafe { &*(b.as_ptr() as *const AtomicU64) };
        wa.store(42, Ordering::Release);
        assert_eq!(wb.load(Ordering::Acquire), 42);
    }

    #[test]
    fn test_open_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShmRegion::open(dir.path(), "missing").is_err());
    }

    #[test]
    fn test_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let region = ShmRegion::create(dir.path(), "gone", 16).unwrap();
        assert!(region.path().exists());
        region.unlink().unwrap();
        assert!(!region.path().exists());
    }
}
