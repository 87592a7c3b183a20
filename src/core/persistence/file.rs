//! Opening targets for unbuffered I/O.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;

use tracing::debug;

use super::error::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    WriteOnly,
    ReadOnly,
    ReadWrite,
}

/// Open `path` with O_DIRECT when `direct` is set. Writable modes create the file.
pub fn open(path: &Path, mode: OpenMode, direct: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    match mode {
        OpenMode::WriteOnly => options.write(true).create(true),
        OpenMode::ReadOnly => options.read(true),
        OpenMode::ReadWrite => options.read(true).write(true).create(true),
    };
    options.mode(0o664);
    if direct {
        options.custom_flags(libc::O_DIRECT);
    }

    debug!(path = %path.display(), ?mode, direct, "opening storage target");
    options.open(path).map_err(|source| StorageError::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// True for block devices. Those are never truncated.
pub fn is_block_device(file: &File) -> Result<bool> {
    Ok(file.metadata()?.file_type().is_block_device())
}
