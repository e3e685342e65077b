//! The publication index: which tag links reference which storage entries.
//!
//! The index is a single JSON document at the root of a layout:
//!
//! ```json
//! {
//!   "publications": {
//!     "/cvmfs/repo/foo/bar/.digests/sha256/aa/aaaa...": [
//!       "/cvmfs/repo/foo/bar/latest"
//!     ]
//!   }
//! }
//! ```
//!
//! It is the only source of reference counts: link targets on disk are never scanned to rebuild
//! it.  An entry with an empty list is an orphan and is deleted, together with its directory, by
//! [`PublicationIndex::prune_orphans`].
//!
//! Every operation reads the whole document, modifies it in memory and writes the whole document
//! back through a temporary file that is renamed over the existing one, so readers never see a
//! partial write.  Top-level keys other than `publications` are carried through unchanged.

use std::{
    collections::BTreeMap,
    fs::{create_dir_all, remove_dir, remove_dir_all, Permissions},
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use thiserror::Error;

const PUBLICATIONS: &str = "publications";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("{tag_link} is not recorded as a reference to {storage}")]
    NotFound { storage: String, tag_link: String },
    #[error("path {0:?} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
    #[error("cannot parse publication index {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("publication index I/O on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Storage entry path → tag link paths referencing it.
pub type Publications = BTreeMap<String, Vec<String>>;

#[derive(Debug, Default, Deserialize)]
struct IndexDocument {
    #[serde(default)]
    publications: Publications,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl IndexDocument {
    fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        // Collect through a BTreeMap so the top-level keys come out sorted too
        let mut document: BTreeMap<&str, Value> = self
            .extra
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect();
        document.insert(PUBLICATIONS, serde_json::to_value(&self.publications)?);

        let mut json = serde_json::to_vec_pretty(&document)?;
        json.push(b'\n');
        Ok(json)
    }
}

fn path_str(path: &Path) -> Result<&str, IndexError> {
    path.to_str()
        .ok_or_else(|| IndexError::NonUtf8Path(path.to_path_buf()))
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> IndexError + '_ {
    move |source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Handle on the publication index file of one layout.
#[derive(Debug, Clone)]
pub struct PublicationIndex {
    path: PathBuf,
}

impl PublicationIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<IndexDocument, IndexError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} doesn't exist yet", self.path.display());
                return Ok(IndexDocument::default());
            }
            Err(e) => return Err(io_error(&self.path)(e)),
        };

        serde_json::from_slice(&data).map_err(|source| IndexError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, document: &IndexDocument) -> Result<(), IndexError> {
        let json = document.to_json().map_err(|source| IndexError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        create_dir_all(dir).map_err(io_error(dir))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(io_error(dir))?;
        tmp.write_all(&json).map_err(io_error(&self.path))?;
        // NamedTempFile is created 0600, but the index is published with everything else
        tmp.as_file()
            .set_permissions(Permissions::from_mode(0o644))
            .map_err(io_error(&self.path))?;
        tmp.as_file().sync_all().map_err(io_error(&self.path))?;
        tmp.persist(&self.path)
            .map_err(|e| io_error(&self.path)(e.error))?;
        Ok(())
    }

    /// The whole table.  A missing index file reads as empty.
    pub fn entries(&self) -> Result<Publications, IndexError> {
        Ok(self.load()?.publications)
    }

    /// The tag links recorded for `storage`, or `None` if it isn't in the index.
    pub fn references(&self, storage: &Path) -> Result<Option<Vec<String>>, IndexError> {
        let storage = path_str(storage)?;
        Ok(self.load()?.publications.remove(storage))
    }

    /// Records that `tag_link` references `storage`.
    ///
    /// Returns `false` (and leaves the file alone) if the reference was already recorded.
    pub fn add_reference(&self, storage: &Path, tag_link: &Path) -> Result<bool, IndexError> {
        let (storage, tag_link) = (path_str(storage)?, path_str(tag_link)?);
        let mut document = self.load()?;

        let references = document
            .publications
            .entry(storage.to_string())
            .or_default();
        if references.iter().any(|r| r == tag_link) {
            return Ok(false);
        }
        references.push(tag_link.to_string());

        self.store(&document)?;
        debug!("Added reference {tag_link} → {storage}");
        Ok(true)
    }

    /// Forgets that `tag_link` references `storage`.
    ///
    /// The entry for `storage` stays in the index, possibly with no references left, until the
    /// next [`prune_orphans`](Self::prune_orphans).
    pub fn remove_reference(&self, storage: &Path, tag_link: &Path) -> Result<(), IndexError> {
        let (storage, tag_link) = (path_str(storage)?, path_str(tag_link)?);
        let mut document = self.load()?;

        let not_found = || IndexError::NotFound {
            storage: storage.to_string(),
            tag_link: tag_link.to_string(),
        };
        let references = document
            .publications
            .get_mut(storage)
            .ok_or_else(not_found)?;
        let position = references
            .iter()
            .position(|r| r == tag_link)
            .ok_or_else(not_found)?;
        references.remove(position);

        self.store(&document)?;
        debug!("Removed reference {tag_link} → {storage}");
        Ok(())
    }

    /// Deletes every storage entry that no tag references any more.
    ///
    /// For each orphan the directory tree is removed, then the entry is dropped from the index
    /// and removal of the (possibly now empty) parent directory is attempted.  Returns the
    /// removed storage paths.
    pub fn prune_orphans(&self) -> Result<Vec<PathBuf>, IndexError> {
        let mut document = self.load()?;
        let orphans: Vec<String> = document
            .publications
            .iter()
            .filter(|(_, references)| references.is_empty())
            .map(|(storage, _)| storage.clone())
            .collect();

        if orphans.is_empty() {
            return Ok(vec![]);
        }

        let mut pruned = vec![];
        for orphan in orphans {
            let path = PathBuf::from(&orphan);
            match remove_dir_all(&path) {
                Ok(()) => info!("Pruned {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("Orphan {} was already gone", path.display())
                }
                Err(e) => return Err(io_error(&path)(e)),
            }
            document.publications.remove(&orphan);

            // Only succeeds if this was the last entry with that prefix
            if let Some(parent) = path.parent() {
                let _ = remove_dir(parent);
            }
            pruned.push(path);
        }

        self.store(&document)?;
        Ok(pruned)
    }
}
