// src/file.rs
use crate::error::{EtudeError, EtudeResult};
use crate::http::Outcome;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::warn;

/// A document mapped read-only for transmission with `writev`.
///
/// Empty files are not mapped; [`as_bytes`](Self::as_bytes) is then empty.
#[derive(Debug)]
pub struct StaticFile {
    path: PathBuf,
    map: Option<NonNull<u8>>,
    len: usize,
}

// The mapping is private and read-only; only the owning connection touches it.
unsafe impl Send for StaticFile {}

impl StaticFile {
    /// Stat `path` and map it when it may be served.
    pub fn resolve(path: &Path) -> Outcome {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(_) => return Outcome::NotFound,
        };
        if meta.permissions().mode() & (libc::S_IROTH as u32) == 0 {
            return Outcome::Forbidden;
        }
        // Directories, FIFOs and device nodes are never served.
        if !meta.is_file() {
            return Outcome::BadRequest;
        }
        match Self::map(path, meta.len() as usize) {
            Ok(file) => Outcome::File(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to map document");
                Outcome::InternalError
            }
        }
    }

    fn map(path: &Path, len: usize) -> EtudeResult<Self> {
        if len == 0 {
            return Ok(Self {
                path: path.to_path_buf(),
                map: None,
                len: 0,
            });
        }

        let file = File::open(path)?;
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(EtudeError::Io(io::Error::last_os_error()));
        }
        // The descriptor can close; the mapping keeps the pages alive.
        drop(file);

        Ok(Self {
            path: path.to_path_buf(),
            map: NonNull::new(addr as *mut u8),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self.map {
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }

    /// Content type guessed from the file extension.
    pub fn content_type(&self) -> String {
        mime_guess::from_path(&self.path)
            .first_or_octet_stream()
            .to_string()
    }
}

impl Drop for StaticFile {
    fn drop(&mut self) {
        if let Some(ptr) = self.map.take() {
            unsafe {
                libc::munmap(ptr.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }
}
