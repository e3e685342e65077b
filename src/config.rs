//! Publisher configuration.
//!
//! Read from a TOML file, by default `/etc/cvmfs-publisher.toml`.  Every field is optional:
//!
//! ```toml
//! repository = "ligo-containers.opensciencegrid.org"
//! mount_root = "/cvmfs"
//! spool_root = "/var/spool/cvmfs"
//! cvmfs_server = "cvmfs_server"
//!
//! [materializer]
//! program = "docker"
//! args = ["run", "-v", "{output}:/output", "--rm", "ligo/singularity:latest", "{image}", "{uid}", "{gid}"]
//!
//! [webhook]
//! # Only publish tags matching one of these (whole tag match); empty accepts everything
//! accept_tags = ["latest", "v[0-9.]+"]
//! ```

use std::{io, path::Path, path::PathBuf};

use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::{external::CommandMaterializer, txn::CvmfsServer};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cvmfs-publisher.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherConfig {
    /// The CernVM-FS repository (fully qualified name) to publish into.
    pub repository: String,
    /// Where repositories are mounted.
    pub mount_root: PathBuf,
    /// Where `cvmfs_server` keeps its per-repository state, including the transaction lock.
    pub spool_root: PathBuf,
    pub cvmfs_server: PathBuf,
    pub materializer: MaterializerConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaterializerConfig {
    pub program: String,
    /// Arguments; `{image}`, `{output}`, `{uid}` and `{gid}` are substituted.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    pub accept_tags: Vec<String>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            repository: "ligo-containers.opensciencegrid.org".into(),
            mount_root: "/cvmfs".into(),
            spool_root: "/var/spool/cvmfs".into(),
            cvmfs_server: "cvmfs_server".into(),
            materializer: MaterializerConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        let materializer = CommandMaterializer::default();
        Self {
            program: materializer.program().to_string(),
            args: materializer.args().to_vec(),
        }
    }
}

impl PublisherConfig {
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Loads the file at `path`.  A missing file gives the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn controller(&self) -> CvmfsServer {
        CvmfsServer::new(&self.cvmfs_server, &self.spool_root)
    }

    pub fn materializer(&self) -> CommandMaterializer {
        CommandMaterializer::new(&self.materializer.program, self.materializer.args.clone())
    }
}
