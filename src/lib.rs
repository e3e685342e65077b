//! Publishing container images into a CernVM-FS repository.
//!
//! Every image is unpacked once into a directory named after its content digest, and tags are
//! symlinks pointing at those directories.  A JSON index next to the images records which tags
//! reference which directory, so directories nothing references any more can be deleted.  All
//! changes to the repository happen inside a `cvmfs_server` transaction: either a publish is
//! committed as a whole, or it is aborted and readers never see any of it.
//!
//! [`publish::Publisher`] is the entry point; the other modules are its building blocks.

pub mod config;
pub mod external;
pub mod image;
pub mod index;
pub mod layout;
pub mod link;
pub mod publish;
pub mod txn;
pub mod webhook;

mod util;
