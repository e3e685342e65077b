//! Content-addressed layout of a publication root.
//!
//! ```text
//! <mount_root>/<repository>/<sub_root>/
//! ├── .publications.json                          # the publication index
//! └── <namespace>/<project>/
//!     ├── latest → .digests/sha256/4e/4e67eaccd9fd...
//!     └── .digests/
//!         └── sha256/
//!             └── 4e/                             # first two hex characters
//!                 └── 4e67eaccd9fd.../            # one unpacked image
//! ```
//!
//! Storage entries are created at most once per digest and never modified afterwards; they are
//! only ever removed by pruning.

use std::{
    ffi::CStr,
    fs::{create_dir_all, set_permissions, File, Permissions},
    io,
    os::{fd::OwnedFd, unix::fs::PermissionsExt},
    path::{Path, PathBuf},
};

use log::{debug, info};
use rustix::fs::{chmodat, openat, statat, AtFlags, Dir, FileType, Mode, OFlags, CWD};

use crate::{
    external::{MaterializeError, Materializer},
    image::{Digest, ImageReference},
};

/// Name of the publication index, relative to the layout root.
pub const INDEX_FILENAME: &str = ".publications.json";

/// Directory holding the storage entries of a project.
pub const DIGESTS_DIR: &str = ".digests";

/// Marker asking CernVM-FS to give a subtree its own nested catalog.
pub const CATALOG_MARKER: &str = ".cvmfscatalog";

/// Directories created in images that look like a Linux root filesystem, so they can be used as
/// bind mount targets by container runtimes.
pub const BIND_POINTS: [&str; 5] = ["srv", "cvmfs", "dev", "proc", "sys"];

/// The paths that make up one publication root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    /// A layout rooted at `<mount_root>/<repository>/<sub_root>`.  `sub_root` may be empty.
    pub fn new(
        mount_root: impl AsRef<Path>,
        repository: &str,
        sub_root: impl AsRef<Path>,
    ) -> Self {
        Self {
            root: mount_root.as_ref().join(repository).join(sub_root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILENAME)
    }

    /// The directory holding the tags and storage entries of the image's project.
    pub fn project_dir(&self, image: &ImageReference) -> PathBuf {
        self.root.join(&image.namespace).join(&image.project)
    }

    pub fn tag_link(&self, image: &ImageReference) -> PathBuf {
        self.project_dir(image).join(&image.tag)
    }

    pub fn storage_path(&self, image: &ImageReference, digest: &Digest) -> PathBuf {
        resolve_path(self.project_dir(image), digest)
    }
}

/// `.digests/<algorithm>/<xx>/<hex>`: where a digest lives relative to its project directory.
///
/// This is also the target stored in tag links.
pub fn digest_relative_path(digest: &Digest) -> PathBuf {
    [DIGESTS_DIR, digest.algorithm(), digest.prefix(), digest.hex()]
        .iter()
        .collect()
}

/// The storage entry path for `digest` below `namespace_base`.
pub fn resolve_path(namespace_base: impl AsRef<Path>, digest: &Digest) -> PathBuf {
    namespace_base.as_ref().join(digest_relative_path(digest))
}

/// Whether anything occupies `path`.  Symlinks are not followed.
pub fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> MaterializeError + '_ {
    move |source| MaterializeError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Creates the storage entry at `path` from `image`.
///
/// The unpacking itself is done by `materializer`.  Afterwards the tree is fixed up so it can be
/// served: permissions are made owner-readable (and owner-writable/searchable for directories),
/// bind points are added to anything that looks like a Linux root filesystem, and the catalog
/// marker is written.
///
/// On failure the partially written directory is left in place; it is discarded when the
/// transaction is aborted.
pub fn materialize(
    path: &Path,
    image: &ImageReference,
    materializer: &dyn Materializer,
) -> Result<(), MaterializeError> {
    create_dir_all(path).map_err(io_error(path))?;
    materializer.materialize(image, path)?;

    let dirfd = openat(
        CWD,
        path,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| io_error(path)(e.into()))?;
    normalize_permissions(&dirfd).map_err(|e| io_error(path)(e.into()))?;

    // Adding bind points and unpublishing are much easier with write access to the root
    set_permissions(path, Permissions::from_mode(0o755)).map_err(io_error(path))?;

    if is_linux_root(&dirfd) {
        for bind_point in BIND_POINTS {
            let bind_path = path.join(bind_point);
            match std::fs::create_dir(&bind_path) {
                Ok(()) => debug!("Created bind point {}", bind_path.display()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_error(&bind_path)(e)),
            }
        }
    }

    let marker = path.join(CATALOG_MARKER);
    File::create(&marker).map_err(io_error(&marker))?;

    info!("Materialized {} at {}", image.name(), path.display());
    Ok(())
}

/// Whether the tree has an `etc/*-release` file.
///
/// `etc` must be a real directory; a symlink could point anywhere on the host.
fn is_linux_root(dirfd: &OwnedFd) -> bool {
    let Ok(etc) = openat(
        dirfd,
        c"etc",
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    ) else {
        return false;
    };
    let Ok(entries) = Dir::read_from(&etc) else {
        return false;
    };
    entries
        .filter_map(Result::ok)
        .any(|entry| entry.file_name().to_bytes().ends_with(b"-release"))
}

/// Every file must be at least owner-readable and every directory at least owner-readable,
/// writable and searchable; otherwise the repository can neither serve nor later remove them.
fn normalize_permissions(dirfd: &OwnedFd) -> rustix::io::Result<()> {
    for item in Dir::read_from(dirfd)? {
        let entry = item?;
        let name = entry.file_name();
        if name == c"." || name == c".." {
            continue;
        }

        let stat = statat(dirfd, name, AtFlags::SYMLINK_NOFOLLOW)?;
        let mode = stat.st_mode & 0o7777;
        match FileType::from_raw_mode(stat.st_mode) {
            FileType::Symlink => {}
            FileType::Directory => {
                fix_mode(dirfd, name, mode, mode | 0o700)?;
                // only after fixing it, or we may not be allowed in
                let child = openat(
                    dirfd,
                    name,
                    OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
                    Mode::empty(),
                )?;
                normalize_permissions(&child)?;
            }
            _ => fix_mode(dirfd, name, mode, mode | 0o400)?,
        }
    }
    Ok(())
}

fn fix_mode(dirfd: &OwnedFd, name: &CStr, old: u32, new: u32) -> rustix::io::Result<()> {
    if old != new {
        debug!("Fixing mode of {name:?} from {old:o} to {new:o}");
        chmodat(dirfd, name, Mode::from_raw_mode(new), AtFlags::empty())?;
    }
    Ok(())
}
