//! Publishing an image under a tag.
//!
//! [`Publisher::publish`] runs one request through these stages:
//!
//! 1. **Resolving**: check the reference and look up the digest if the request doesn't carry
//!    one.  Nothing has been touched yet, so a failure here is reported as is.
//! 2. Open a transaction.  If that fails nothing has been touched either.
//! 3. **Materializing**: unpack the image into its storage entry, unless the entry already
//!    exists.
//! 4. **Linking**: point the tag link at the storage entry.
//! 5. **Indexing**: record the new reference and forget the one the tag had before.
//! 6. **Pruning**: delete storage entries nothing references any more.
//! 7. **Committing**: publish the transaction.
//!
//! Any failure in stages 3 to 6 aborts the transaction, which discards everything written since
//! it was opened (content, links and index alike).  Pruning is never attempted on that path.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    external::{DigestResolver, MaterializeError, Materializer, ResolutionError},
    image::{Digest, ImageReference, ParseError},
    index::{IndexError, PublicationIndex},
    layout::{self, digest_relative_path, StoreLayout},
    link::{self, resolve_target, LinkAction, LinkError},
    txn::{FilesystemController, TransactionSession, TxnError},
};

/// The stages of a publish that run inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Materializing,
    Linking,
    Indexing,
    Pruning,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Materializing => "materializing",
            Stage::Linking => "linking",
            Stage::Indexing => "indexing",
            Stage::Pruning => "pruning",
        })
    }
}

/// What went wrong inside the transaction.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// How far a failed publish got, as far as the repository is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing was written.
    Untouched,
    /// Changes were attempted and thrown away again.
    RolledBack,
    /// Changes are on disk but the transaction couldn't be published (or aborted); someone needs
    /// to look at the repository.
    Uncommitted,
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("invalid image reference: {0}")]
    Reference(#[from] ParseError),
    #[error("cannot resolve digest: {0}")]
    Resolution(#[from] ResolutionError),
    #[error("cannot open transaction: {0}")]
    Begin(#[source] TxnError),
    #[error("{stage} failed, transaction aborted: {source}")]
    Aborted {
        stage: Stage,
        #[source]
        source: StageError,
    },
    #[error("{stage} failed ({source}) and the abort failed too: {abort}")]
    AbortFailed {
        stage: Stage,
        source: StageError,
        abort: TxnError,
    },
    #[error("cannot commit transaction; changes are left unpublished: {0}")]
    Commit(#[source] TxnError),
}

impl PublishError {
    pub fn disposition(&self) -> Disposition {
        match self {
            PublishError::Reference(_)
            | PublishError::Resolution(_)
            | PublishError::Begin(_) => Disposition::Untouched,
            PublishError::Aborted { .. } => Disposition::RolledBack,
            PublishError::AbortFailed { .. } | PublishError::Commit(_) => Disposition::Uncommitted,
        }
    }
}

/// The outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub digest: Digest,
    pub storage_path: PathBuf,
    pub tag_link: PathBuf,
    /// Whether the materializer was run (`false` if the storage entry already existed).
    pub materialized: bool,
    pub link_action: LinkAction,
    /// Storage entries deleted by the prune pass.
    pub pruned: Vec<PathBuf>,
}

/// Publishes images into one repository.
pub struct Publisher<'a> {
    repository: String,
    mount_root: PathBuf,
    controller: &'a dyn FilesystemController,
    materializer: &'a dyn Materializer,
    resolver: &'a dyn DigestResolver,
}

impl fmt::Debug for Publisher<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("repository", &self.repository)
            .field("mount_root", &self.mount_root)
            .finish_non_exhaustive()
    }
}

impl<'a> Publisher<'a> {
    pub fn new(
        repository: impl Into<String>,
        mount_root: impl Into<PathBuf>,
        controller: &'a dyn FilesystemController,
        materializer: &'a dyn Materializer,
        resolver: &'a dyn DigestResolver,
    ) -> Self {
        Self {
            repository: repository.into(),
            mount_root: mount_root.into(),
            controller,
            materializer,
            resolver,
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The layout of the publication root `sub_root` (which may be empty).
    pub fn layout(&self, sub_root: impl AsRef<Path>) -> StoreLayout {
        StoreLayout::new(&self.mount_root, &self.repository, sub_root)
    }

    /// Publishes `image` below `sub_root`, see the module documentation.
    pub fn publish(
        &self,
        image: &ImageReference,
        sub_root: impl AsRef<Path>,
    ) -> Result<Publication, PublishError> {
        // namespace, project and tag become path components below the publication root
        image.validate()?;
        let digest = match &image.digest {
            Some(digest) => digest.clone(),
            None => self.resolver.resolve(image)?,
        };
        info!("Publishing {} ({digest})", image.name());

        let layout = self.layout(sub_root);
        let mut session = TransactionSession::new(&self.repository);
        session
            .begin(self.controller)
            .map_err(PublishError::Begin)?;

        let publication = self.in_transaction(&mut session, |stage| {
            self.publish_in_session(&layout, image, &digest, stage)
        })?;

        session
            .commit(self.controller)
            .map_err(PublishError::Commit)?;
        info!(
            "Published {} → {}",
            publication.tag_link.display(),
            publication.storage_path.display()
        );
        Ok(publication)
    }

    /// Runs a prune pass over `sub_root` in a transaction of its own.
    pub fn prune(&self, sub_root: impl AsRef<Path>) -> Result<Vec<PathBuf>, PublishError> {
        let index = PublicationIndex::new(self.layout(sub_root).index_path());
        let mut session = TransactionSession::new(&self.repository);
        session
            .begin(self.controller)
            .map_err(PublishError::Begin)?;

        let pruned = self.in_transaction(&mut session, |stage| {
            *stage = Stage::Pruning;
            Ok(index.prune_orphans()?)
        })?;

        session
            .commit(self.controller)
            .map_err(PublishError::Commit)?;
        Ok(pruned)
    }

    /// Runs `body` in the open session, aborting the session if it fails.
    ///
    /// `body` keeps the stage it is in up to date so failures can be attributed.
    fn in_transaction<T>(
        &self,
        session: &mut TransactionSession,
        body: impl FnOnce(&mut Stage) -> Result<T, StageError>,
    ) -> Result<T, PublishError> {
        let mut stage = Stage::Materializing;
        match body(&mut stage) {
            Ok(value) => Ok(value),
            Err(source) => {
                warn!("{stage} failed: {source}");
                match session.abort(self.controller) {
                    Ok(()) => Err(PublishError::Aborted { stage, source }),
                    Err(abort) => Err(PublishError::AbortFailed {
                        stage,
                        source,
                        abort,
                    }),
                }
            }
        }
    }

    fn publish_in_session(
        &self,
        layout: &StoreLayout,
        image: &ImageReference,
        digest: &Digest,
        stage: &mut Stage,
    ) -> Result<Publication, StageError> {
        let storage_path = layout.storage_path(image, digest);
        let relative = digest_relative_path(digest);
        let tag_link = layout.tag_link(image);
        let index = PublicationIndex::new(layout.index_path());

        *stage = Stage::Materializing;
        let materialized = if layout::exists(&storage_path) {
            debug!("{} already exists", storage_path.display());
            false
        } else {
            layout::materialize(&storage_path, image, self.materializer)?;
            true
        };

        *stage = Stage::Linking;
        let link_action = match link::repoint(&tag_link, &relative)? {
            LinkAction::Conflict => return Err(LinkError::Conflict { path: tag_link }.into()),
            action => action,
        };

        *stage = Stage::Indexing;
        index.add_reference(&storage_path, &tag_link)?;
        if let LinkAction::Repointed { previous } = &link_action {
            let previous = resolve_target(&tag_link, previous);
            match index.remove_reference(&previous, &tag_link) {
                Ok(()) => {}
                // whatever the tag pointed at was pruned or never indexed
                Err(IndexError::NotFound { .. }) => warn!(
                    "{} was not recorded as referencing {}",
                    tag_link.display(),
                    previous.display()
                ),
                Err(other) => return Err(other.into()),
            }
        }

        *stage = Stage::Pruning;
        let pruned = index.prune_orphans()?;

        Ok(Publication {
            digest: digest.clone(),
            storage_path,
            tag_link,
            materialized,
            link_action,
            pruned,
        })
    }
}
