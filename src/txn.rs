//! Transactions against the underlying versioned filesystem.
//!
//! CernVM-FS only makes changes visible when a transaction is published, and throws away
//! everything written since `transaction` when it is aborted.  That envelope is the only atomicity
//! and mutual exclusion the publisher relies on: the content tree, the tag links and the
//! publication index all live inside it.
//!
//! The actual transaction commands are run by a [`FilesystemController`]; a
//! [`TransactionSession`] tracks whether this publish call currently holds one open.

use std::{
    io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

use log::{debug, info, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TxnError {
    #[error("failed to run {operation} on {repository}: {source}")]
    Spawn {
        operation: &'static str,
        repository: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to abort lingering transaction on {repository} ({status})")]
    StaleAbort {
        repository: String,
        status: ExitStatus,
    },
    #[error("transaction start on {repository} failed ({status}); will not attempt update")]
    Begin {
        repository: String,
        status: ExitStatus,
    },
    #[error("publishing {repository} failed ({status})")]
    Publish {
        repository: String,
        status: ExitStatus,
    },
    #[error("aborting transaction on {repository} failed ({status})")]
    Abort {
        repository: String,
        status: ExitStatus,
    },
}

/// The transaction primitives of a versioned filesystem.
///
/// Each operation reports the exit status of whatever implements it; anything other than
/// success is a failure of that operation.
pub trait FilesystemController {
    fn begin(&self, repository: &str) -> io::Result<ExitStatus>;
    fn publish(&self, repository: &str) -> io::Result<ExitStatus>;
    fn abort(&self, repository: &str) -> io::Result<ExitStatus>;

    /// The file whose existence means a transaction is open on `repository`, whichever process
    /// opened it.
    fn lock_marker(&self, repository: &str) -> PathBuf;
}

/// Drives transactions with the `cvmfs_server` tool.
#[derive(Debug, Clone)]
pub struct CvmfsServer {
    command: PathBuf,
    spool_root: PathBuf,
}

impl CvmfsServer {
    pub fn new(command: impl Into<PathBuf>, spool_root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            spool_root: spool_root.into(),
        }
    }

    fn run(&self, args: &[&str]) -> io::Result<ExitStatus> {
        debug!("Running {} {}", self.command.display(), args.join(" "));
        Command::new(&self.command).args(args).status()
    }
}

impl Default for CvmfsServer {
    fn default() -> Self {
        Self::new("cvmfs_server", "/var/spool/cvmfs")
    }
}

impl FilesystemController for CvmfsServer {
    fn begin(&self, repository: &str) -> io::Result<ExitStatus> {
        self.run(&["transaction", repository])
    }

    fn publish(&self, repository: &str) -> io::Result<ExitStatus> {
        self.run(&["publish", repository])
    }

    fn abort(&self, repository: &str) -> io::Result<ExitStatus> {
        self.run(&["abort", "-f", repository])
    }

    fn lock_marker(&self, repository: &str) -> PathBuf {
        self.spool_root.join(repository).join("in_transaction.lock")
    }
}

/// Whether this publish call holds an open transaction on one repository.
///
/// One session is created per publish call.  It isn't a lock: two processes working on the same
/// repository have to be kept apart by the deployment.
#[derive(Debug)]
pub struct TransactionSession {
    repository: String,
    open: bool,
}

impl TransactionSession {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            open: false,
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn spawn_error(&self, operation: &'static str) -> impl FnOnce(io::Error) -> TxnError + '_ {
        move |source| TxnError::Spawn {
            operation,
            repository: self.repository.clone(),
            source,
        }
    }

    /// Opens a transaction, unless this session already has one open.
    ///
    /// A lock marker left behind by an earlier run is cleared with a forced abort first; if that
    /// abort fails, no new transaction is attempted.
    pub fn begin(&mut self, controller: &dyn FilesystemController) -> Result<(), TxnError> {
        if self.open {
            return Ok(());
        }

        let marker = controller.lock_marker(&self.repository);
        if lock_marker_exists(&marker) {
            warn!(
                "Found lingering transaction on {} ({}); aborting it",
                self.repository,
                marker.display()
            );
            let status = controller
                .abort(&self.repository)
                .map_err(self.spawn_error("abort"))?;
            if !status.success() {
                return Err(TxnError::StaleAbort {
                    repository: self.repository.clone(),
                    status,
                });
            }
        }

        let status = controller
            .begin(&self.repository)
            .map_err(self.spawn_error("transaction"))?;
        if !status.success() {
            return Err(TxnError::Begin {
                repository: self.repository.clone(),
                status,
            });
        }

        debug!("Opened transaction on {}", self.repository);
        self.open = true;
        Ok(())
    }

    /// Publishes the open transaction.  Does nothing if none is open.
    ///
    /// The session counts as closed even if publishing fails; the lock marker the failed
    /// transaction leaves behind is dealt with by the next `begin`.
    pub fn commit(&mut self, controller: &dyn FilesystemController) -> Result<(), TxnError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        let status = controller
            .publish(&self.repository)
            .map_err(self.spawn_error("publish"))?;
        if !status.success() {
            return Err(TxnError::Publish {
                repository: self.repository.clone(),
                status,
            });
        }

        info!("Published {}", self.repository);
        Ok(())
    }

    /// Discards everything written since `begin`.
    ///
    /// The abort is always issued, open or not, so this also clears transactions left over by
    /// other processes.
    pub fn abort(&mut self, controller: &dyn FilesystemController) -> Result<(), TxnError> {
        warn!("Aborting transaction on {}", self.repository);
        self.open = false;

        let status = controller
            .abort(&self.repository)
            .map_err(self.spawn_error("abort"))?;
        if !status.success() {
            return Err(TxnError::Abort {
                repository: self.repository.clone(),
                status,
            });
        }
        Ok(())
    }
}

fn lock_marker_exists(marker: &Path) -> bool {
    // symlink_metadata so a dangling marker still counts
    marker.symlink_metadata().is_ok()
}
