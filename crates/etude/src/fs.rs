// src/fs.rs
//! Mapping request URLs onto files under the document root.

use crate::parser::HttpCode;
use arrayvec::ArrayVec;
use libc::c_void;
use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::{self, NonNull};
use tracing::{debug, warn};

/// Capacity of the resolved path, document root included.
pub const FILENAME_LEN: usize = 200;

/// World-readable permission bit.
const S_IROTH: u32 = 0o004;

/// Read-only private mapping of a whole file. Unmapped on drop.
#[derive(Debug)]
pub struct MappedFile {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is read-only and owned by exactly one value.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Map `len` bytes of `file`. `len` must be non-zero.
    pub fn map(file: &File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut c_void, self.len);
        }
    }
}

/// A file a request resolved to.
#[derive(Debug)]
pub struct ServedFile {
    pub size: u64,
    pub mode: u32,
    /// `None` for empty files, which are never mapped.
    pub mapping: Option<MappedFile>,
}

/// `doc_root` followed by `url`, cut off at [`FILENAME_LEN`] bytes.
pub fn real_path(doc_root: &Path, url: &[u8]) -> ArrayVec<u8, FILENAME_LEN> {
    let mut path = ArrayVec::new();
    for &b in doc_root.as_os_str().as_bytes().iter().chain(url) {
        if path.try_push(b).is_err() {
            break;
        }
    }
    path
}

fn escapes_root(url: &[u8]) -> bool {
    url.split(|&b| b == b'/').any(|segment| segment == b"..")
}

/// Resolve `url` under `doc_root`.
///
/// On failure the error is the outcome to answer with: missing files are
/// [`HttpCode::NoResource`], files others may not read are
/// [`HttpCode::ForbiddenRequest`] and directories are [`HttpCode::BadRequest`].
pub fn resolve(doc_root: &Path, url: &[u8]) -> Result<ServedFile, HttpCode> {
    if escapes_root(url) {
        debug!(url = %String::from_utf8_lossy(url), "rejecting path outside document root");
        return Err(HttpCode::NoResource);
    }

    let buf = real_path(doc_root, url);
    let path = Path::new(OsStr::from_bytes(&buf));

    let meta = std::fs::metadata(path).map_err(|_| HttpCode::NoResource)?;
    if meta.mode() & S_IROTH == 0 {
        return Err(HttpCode::ForbiddenRequest);
    }
    if meta.is_dir() {
        return Err(HttpCode::BadRequest);
    }

    if meta.len() == 0 {
        return Ok(ServedFile {
            size: 0,
            mode: meta.mode(),
            mapping: None,
        });
    }

    // The descriptor closes when `file` drops; the mapping outlives it.
    let file = File::open(path).map_err(|e| {
        warn!(path = %path.display(), error = %e, "open failed");
        HttpCode::InternalError
    })?;
    map_opened(&file, meta.mode())
}

/// Map an opened file, sized by `fstat` on the descriptor itself so a
/// change between the path lookup and the open is not trusted.
///
/// Truncation after the mapping is made is not detected: pages past the new
/// end of file fault when touched (`SIGBUS` on a user-space read, `EFAULT`
/// from the send). Serve only files nothing rewrites in place.
fn map_opened(file: &File, mode: u32) -> Result<ServedFile, HttpCode> {
    let size = file
        .metadata()
        .map_err(|e| {
            warn!(error = %e, "fstat failed");
            HttpCode::InternalError
        })?
        .len();
    let mapping = if size == 0 {
        None
    } else {
        let len = usize::try_from(size).map_err(|_| HttpCode::InternalError)?;
        let mapping = MappedFile::map(file, len).map_err(|e| {
            warn!(error = %e, "mmap failed");
            HttpCode::InternalError
        })?;
        Some(mapping)
    };

    Ok(ServedFile {
        size,
        mode,
        mapping,
    })
}
