//! Tag links: the mutable `tag → digest` indirection.
//!
//! A tag is a symlink at `<namespace>/<project>/<tag>` whose target is the relative path of a
//! storage entry (`.digests/<alg>/<xx>/<hex>`).  Moving a tag replaces the link atomically, so a
//! reader resolving the tag sees either the old or the new image, never nothing.

use std::{
    ffi::OsStr,
    fs::create_dir_all,
    io,
    os::{fd::OwnedFd, unix::ffi::OsStrExt},
    path::{Path, PathBuf},
};

use log::debug;
use rustix::{
    fs::{
        openat, readlinkat, renameat, statat, symlinkat, unlinkat, AtFlags, FileType, Mode,
        OFlags, CWD,
    },
    io::Errno,
};
use thiserror::Error;

use crate::util::{generate_tmpname, ErrnoFilter};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("{path} exists and is not a symlink")]
    Conflict { path: PathBuf },
    #[error("{path} is not a valid tag link path")]
    InvalidPath { path: PathBuf },
    #[error("failed to update tag link {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What [`repoint`] did to a tag link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// There was no link; one was created.
    Created,
    /// The link pointed at `previous` (as stored, ie. relative) and now points at the new target.
    Repointed { previous: PathBuf },
    /// The link already had the requested target.
    Unchanged,
    /// Something other than a symlink occupies the path.  Nothing was modified.
    Conflict,
}

fn io_error(path: &Path) -> impl FnOnce(Errno) -> LinkError + '_ {
    move |errno| LinkError::Io {
        path: path.to_path_buf(),
        source: errno.into(),
    }
}

/// Makes `tag_link` a symlink to `target`.
///
/// `target` is stored verbatim and should be relative to the link's directory; use
/// [`resolve_target`] to get the path it refers to.  The parent directory is created if needed.
pub fn repoint(tag_link: &Path, target: &Path) -> Result<LinkAction, LinkError> {
    let (Some(parent), Some(name)) = (tag_link.parent(), tag_link.file_name()) else {
        return Err(LinkError::InvalidPath {
            path: tag_link.to_path_buf(),
        });
    };

    create_dir_all(parent).map_err(|source| LinkError::Io {
        path: parent.to_path_buf(),
        source,
    })?;
    let dirfd = openat(
        CWD,
        parent,
        OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(io_error(parent))?;

    let Some(stat) = statat(&dirfd, name, AtFlags::SYMLINK_NOFOLLOW)
        .filter_errno(Errno::NOENT)
        .map_err(io_error(tag_link))?
    else {
        symlinkat(target, &dirfd, name).map_err(io_error(tag_link))?;
        debug!("Created {} → {}", tag_link.display(), target.display());
        return Ok(LinkAction::Created);
    };

    if FileType::from_raw_mode(stat.st_mode) != FileType::Symlink {
        return Ok(LinkAction::Conflict);
    }

    let current = readlinkat(&dirfd, name, []).map_err(io_error(tag_link))?;
    if current.as_bytes() == target.as_os_str().as_bytes() {
        return Ok(LinkAction::Unchanged);
    }

    replace_symlinkat(target, &dirfd, name).map_err(io_error(tag_link))?;
    let previous = PathBuf::from(OsStr::from_bytes(current.as_bytes()));
    debug!(
        "Repointed {} from {} to {}",
        tag_link.display(),
        previous.display(),
        target.display()
    );
    Ok(LinkAction::Repointed { previous })
}

/// The path a tag link target refers to, given the link's own path.
pub fn resolve_target(tag_link: &Path, target: &Path) -> PathBuf {
    match tag_link.parent() {
        Some(parent) => parent.join(target),
        None => target.to_path_buf(),
    }
}

/// Atomically replaces an existing symlink by renaming a freshly created one over it.
fn replace_symlinkat(target: &Path, dirfd: &OwnedFd, name: &OsStr) -> rustix::io::Result<()> {
    for _ in 0..16 {
        let tmp_name = generate_tmpname(".symlink-");
        if symlinkat(target, dirfd, &tmp_name)
            .filter_errno(Errno::EXIST)?
            .is_none()
        {
            // This temporary filename already exists, try another
            continue;
        }

        return match renameat(dirfd, &tmp_name, dirfd, name) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = unlinkat(dirfd, tmp_name, AtFlags::empty());
                Err(e)
            }
        };
    }

    Err(Errno::EXIST)
}
