//! Positional file I/O with optional page-cache bypass
//!
//! - Linux: O_DIRECT flag
//! - macOS: F_NOCACHE fcntl
//!
//! With direct I/O enabled, offsets and lengths must be multiples of
//! [`SECTOR_ALIGNMENT`] and buffers must come from [`AlignedBuffer`].

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::Path;
use strata_common::{Error, Result};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Offset and length granularity for direct I/O
pub const SECTOR_ALIGNMENT: usize = 512;

/// Memory alignment of I/O buffers
pub const BUFFER_ALIGNMENT: usize = 4096;

/// File or block device handle
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    direct: bool,
}

impl RawFile {
    /// Open an existing file or block device
    pub fn open(path: impl AsRef<Path>, direct: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        Self::apply_direct_flag(&mut options, direct);

        let file = options
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to open {path_str}: {e}")))?;
        Self::disable_cache(&file, &path_str, direct)?;

        let size = Self::device_size(&file, &path_str)?;
        Ok(Self {
            file,
            path: path_str,
            size,
            direct,
        })
    }

    /// Create (or truncate) a file of the given size
    ///
    /// Block devices are opened as-is and keep their own size.
    pub fn create(path: impl AsRef<Path>, size: u64, direct: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let is_block_device = std::fs::metadata(&path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_block_device {
            options.create(true).truncate(true);
        }
        Self::apply_direct_flag(&mut options, direct);

        let file = options
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to create {path_str}: {e}")))?;
        Self::disable_cache(&file, &path_str, direct)?;

        let size = if is_block_device {
            Self::device_size(&file, &path_str)?
        } else {
            file.set_len(size).map_err(|e| {
                Error::storage(format!("failed to set size for {path_str}: {e}"))
            })?;
            size
        };

        Ok(Self {
            file,
            path: path_str,
            size,
            direct,
        })
    }

    #[cfg(target_os = "linux")]
    fn apply_direct_flag(options: &mut OpenOptions, direct: bool) {
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_direct_flag(_options: &mut OpenOptions, _direct: bool) {}

    #[cfg(target_os = "macos")]
    #[allow(unsafe_code)]
    fn disable_cache(file: &File, path: &str, direct: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        if !direct {
            return Ok(());
        }
        // SAFETY: the descriptor is owned by `file` and stays open for the call
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
        if ret == -1 {
            return Err(Error::storage(format!(
                "failed to set F_NOCACHE on {path}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    #[allow(clippy::unnecessary_wraps)]
    const fn disable_cache(_file: &File, _path: &str, _direct: bool) -> Result<()> {
        Ok(())
    }

    /// Size of a regular file from metadata, of a block device by seeking
    fn device_size(file: &File, path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};

        let metadata = file
            .metadata()
            .map_err(|e| Error::storage(format!("failed to get metadata for {path}: {e}")))?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let mut f = file;
        let size = f
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::storage(format!("failed to get device size for {path}: {e}")))?;
        f.seek(SeekFrom::Start(0))
            .map_err(|e| Error::storage(format!("failed to seek to start for {path}: {e}")))?;
        Ok(size)
    }

    /// Get the file size
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Get the file path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the page cache is bypassed
    pub const fn is_direct(&self) -> bool {
        self.direct
    }

    /// Fill `buf` from `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::storage(format!("read failed on {}: {e}", self.path)))
    }

    /// Write all of `buf` at `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::storage(format!("write failed on {}: {e}", self.path)))
    }

    /// Sync data and metadata to disk
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::storage(format!("sync failed on {}: {e}", self.path)))
    }

    fn check_alignment(&self, offset: u64, size: usize) -> Result<()> {
        if !self.direct {
            return Ok(());
        }
        if offset % SECTOR_ALIGNMENT as u64 != 0 {
            return Err(Error::storage(format!(
                "offset {offset} is not aligned to {SECTOR_ALIGNMENT}"
            )));
        }
        if size % SECTOR_ALIGNMENT != 0 {
            return Err(Error::storage(format!(
                "size {size} is not aligned to {SECTOR_ALIGNMENT}"
            )));
        }
        Ok(())
    }
}

/// Zeroed buffer whose start is aligned to [`BUFFER_ALIGNMENT`]
///
/// Over-allocates and exposes an aligned window, so no custom allocator is
/// involved. The backing vector is never resized.
#[derive(Debug)]
pub struct AlignedBuffer {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuffer {
    /// Create a zeroed buffer of `len` bytes
    #[must_use]
    pub fn new(len: usize) -> Self {
        let storage = vec![0u8; len + BUFFER_ALIGNMENT];
        let start = storage.as_ptr().align_offset(BUFFER_ALIGNMENT);
        Self {
            storage,
            start,
            len,
        }
    }

    /// Get the buffer as a slice
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    /// Get the buffer as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }

    /// Get the buffer size
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if buffer is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy data into the buffer, zero filling the rest
    pub fn copy_from(&mut self, src: &[u8]) {
        let dst = self.as_mut_slice();
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        dst[n..].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(1024);
        assert_eq!(buf.len(), 1024);
        assert_eq!(buf.as_slice().as_ptr() as usize % BUFFER_ALIGNMENT, 0);

        buf.copy_from(b"hello");
        assert_eq!(&buf.as_slice()[..5], b"hello");
        assert!(buf.as_slice()[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_raw_file_create_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        {
            let file = RawFile::create(path, 8192, false).unwrap();
            let mut buf = AlignedBuffer::new(512);
            buf.copy_from(b"test data pattern");
            file.write_at(1024, buf.as_slice()).unwrap();
            file.sync().unwrap();
        }

        let file = RawFile::open(path, false).unwrap();
        assert_eq!(file.size(), 8192);
        let mut buf = AlignedBuffer::new(512);
        file.read_at(1024, buf.as_mut_slice()).unwrap();
        assert!(buf.as_slice().starts_with(b"test data pattern"));
    }

    #[test]
    fn test_direct_alignment_checked() {
        let temp = NamedTempFile::new().unwrap();
        let file = RawFile::create(temp.path(), 4096, false).unwrap();
        // buffered handles accept any offset
        file.write_at(3, b"x").unwrap();

        let direct = RawFile {
            file: file.file.try_clone().unwrap(),
            path: file.path.clone(),
            size: file.size,
            direct: true,
        };
        assert!(direct.check_alignment(3, 512).is_err());
        assert!(direct.check_alignment(512, 100).is_err());
        assert!(direct.check_alignment(1024, 512).is_ok());
    }
}
