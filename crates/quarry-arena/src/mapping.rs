//! File-backed memory mappings.

use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::ArenaError;

/// A mapped shared-memory region backed by a file.
#[derive(Debug)]
pub(crate) struct Mapping {
    base_addr: usize,
    size: usize,
    path: PathBuf,
}

impl Mapping {
    #[inline]
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.base_addr as *mut u8
    }

    #[inline]
    pub(crate) fn base_addr(&self) -> usize {
        self.base_addr
    }

    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base_addr/size came from a successful mmap in map_file.
        let rc = unsafe { libc::munmap(self.base_ptr() as *mut libc::c_void, self.size) };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            tracing::error!(error = %e, size = self.size, path = %self.path.display(),
                "munmap failed for arena mapping");
        } else {
            tracing::debug!(size = self.size, path = %self.path.display(), "unmapped arena");
        }
    }
}

/// Create or open `path` and map `size` bytes of it shared read-write.
///
/// With `create` the file is created exclusively and sized; otherwise it
/// must already exist and be at least `size` bytes (pass the file length
/// itself to map the whole segment).
pub(crate) fn map_file(path: &Path, size: usize, create: bool) -> Result<Arc<Mapping>, ArenaError> {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    if size == 0 {
        return Err(ArenaError::InvalidConfig("mapping size must be > 0"));
    }

    let file = if create {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size as u64)?;
        file
    } else {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() < size as u64 {
            return Err(ArenaError::BadSegment("segment file smaller than expected"));
        }
        file
    };

    // SAFETY: fd is valid for the duration of the call; the kernel keeps the
    // mapping alive after the file is closed.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(ArenaError::System(std::io::Error::last_os_error()));
    }

    let base = NonNull::new(ptr as *mut u8)
        .ok_or_else(|| ArenaError::System(std::io::Error::other("mmap returned null")))?;

    tracing::debug!(size, create, path = %path.display(), "mapped arena segment");

    Ok(Arc::new(Mapping {
        base_addr: base.as_ptr() as usize,
        size,
        path: path.to_path_buf(),
    }))
}

/// Length of the backing file, for openers that size the mapping from it.
pub(crate) fn file_len(path: &Path) -> Result<usize, ArenaError> {
    Ok(std::fs::metadata(path)?.len() as usize)
}
