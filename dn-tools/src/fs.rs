//! Small filesystem helpers used by the location and chunk file code.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{format_err, Context, Error};

/// Atomically replace the contents of `path`: write to a temporary sibling
/// and rename it into place. Optionally fsyncs the file before the rename.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8], fsync: bool) -> Result<(), Error> {
    let path = path.as_ref();
    let tmp_path = path.with_extension("tmp~");

    let mut file = File::create(&tmp_path)
        .map_err(|err| format_err!("unable to create {tmp_path:?} - {err}"))?;
    file.write_all(data)
        .map_err(|err| format_err!("unable to write {tmp_path:?} - {err}"))?;
    if fsync {
        nix::unistd::fsync(file.as_raw_fd())
            .map_err(|err| format_err!("fsync of {tmp_path:?} failed - {err}"))?;
    }
    drop(file);

    std::fs::rename(&tmp_path, path)
        .map_err(|err| format_err!("renaming {tmp_path:?} to {path:?} failed - {err}"))?;

    Ok(())
}

/// Fsync the directory containing `path` so a previous rename is durable.
pub fn fsync_parent_dir<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .ok_or_else(|| format_err!("{path:?} has no parent directory"))?;
    let handle = File::open(dir)?;
    nix::unistd::fsync(handle.as_raw_fd())
        .map_err(|err| format_err!("fsync of {dir:?} failed - {err}"))?;
    Ok(())
}

pub fn read_file_string<P: AsRef<Path>>(path: P) -> Result<String, Error> {
    let path = path.as_ref();
    let mut data = String::new();
    File::open(path)
        .and_then(|mut file| file.read_to_string(&mut data))
        .map_err(|err| format_err!("unable to read {path:?} - {err}"))?;
    Ok(data)
}

pub fn file_size<P: AsRef<Path>>(path: P) -> Result<u64, Error> {
    let path = path.as_ref();
    let metadata =
        std::fs::metadata(path).map_err(|err| format_err!("unable to stat {path:?} - {err}"))?;
    Ok(metadata.len())
}

/// Available bytes on the filesystem backing `path` (per `statvfs`).
pub fn disk_available_space<P: AsRef<Path>>(path: P) -> Result<u64, Error> {
    let path = path.as_ref();
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|err| format_err!("statvfs of {path:?} failed - {err}"))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Open a file with `O_DIRECT | O_SYNC`, bypassing the page cache. Used by
/// the disk health probe so that the actual device is exercised.
pub fn open_direct<P: AsRef<Path>>(path: P, write: bool) -> Result<File, Error> {
    use std::os::unix::fs::OpenOptionsExt;

    let path = path.as_ref();
    let mut options = OpenOptions::new();
    if write {
        options.write(true).create(true).truncate(true);
    } else {
        options.read(true);
    }
    options
        .custom_flags(libc::O_DIRECT | libc::O_SYNC)
        .open(path)
        .with_context(|| format!("unable to open {path:?} with O_DIRECT"))
}
