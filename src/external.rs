//! External collaborators: the image materializer and the digest resolver.
//!
//! Neither of these is implemented here.  Materialization is delegated to a conversion tool run
//! as a separate process (by default the singularity conversion container, run through docker),
//! and digest resolution goes through skopeo via containers-image-proxy.  Both are traits so the
//! publisher can be driven by test doubles.

use std::{
    io,
    path::Path,
    process::{Command, ExitStatus},
};

use containers_image_proxy::{ImageProxy, ImageProxyConfig};
use log::{debug, info};
use oci_spec::image::ImageManifest;
use rustix::process::{getgid, getuid};
use thiserror::Error;

use crate::image::{Digest, ImageReference, ParseError};

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("failed to run materializer {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("materializer exited with {status} while converting {image}")]
    Failed { image: String, status: ExitStatus },
    #[error("failed to prepare {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("cannot determine digest of {image}: {message}")]
    Lookup { image: String, message: String },
    #[error("registry returned an unusable digest for {image}: {source}")]
    InvalidDigest {
        image: String,
        #[source]
        source: ParseError,
    },
}

/// Populates a directory with the unpacked content of an image.
pub trait Materializer {
    /// Unpack `image` into `output`, which already exists and is empty.
    fn materialize(&self, image: &ImageReference, output: &Path) -> Result<(), MaterializeError>;
}

/// Determines the content digest currently behind a tag.
pub trait DigestResolver {
    fn resolve(&self, image: &ImageReference) -> Result<Digest, ResolutionError>;
}

/// Runs an external program to unpack an image.
///
/// Each argument may contain the placeholders `{image}`, `{output}`, `{uid}` and `{gid}`, which
/// are substituted before the program is run.  The program must exit successfully for the
/// materialization to count.
#[derive(Debug, Clone)]
pub struct CommandMaterializer {
    program: String,
    args: Vec<String>,
}

impl CommandMaterializer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn expand(&self, image: &ImageReference, output: &Path) -> Vec<String> {
        let name = image.name();
        let output = output.to_string_lossy();
        let uid = getuid().as_raw().to_string();
        let gid = getgid().as_raw().to_string();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{image}", &name)
                    .replace("{output}", &output)
                    .replace("{uid}", &uid)
                    .replace("{gid}", &gid)
            })
            .collect()
    }
}

impl Default for CommandMaterializer {
    fn default() -> Self {
        Self::new(
            "docker",
            [
                "run",
                "-v",
                "{output}:/output",
                "--rm",
                "ligo/singularity:latest",
                "{image}",
                "{uid}",
                "{gid}",
            ]
            .map(String::from)
            .to_vec(),
        )
    }
}

impl Materializer for CommandMaterializer {
    fn materialize(&self, image: &ImageReference, output: &Path) -> Result<(), MaterializeError> {
        let args = self.expand(image, output);
        info!("Materializing {} into {}", image.name(), output.display());
        debug!("Running {} {:?}", self.program, args);

        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .map_err(|source| MaterializeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(MaterializeError::Failed {
                image: image.name(),
                status,
            });
        }
        Ok(())
    }
}

/// Resolves tags to manifest digests by asking the registry through skopeo.
#[derive(Debug, Default)]
pub struct ProxyResolver {
    insecure_skip_tls_verification: Option<bool>,
}

impl ProxyResolver {
    pub fn new(insecure_skip_tls_verification: Option<bool>) -> Self {
        Self {
            insecure_skip_tls_verification,
        }
    }

    async fn fetch_digest(&self, imgref: &str) -> anyhow::Result<String> {
        let config = ImageProxyConfig {
            insecure_skip_tls_verification: self.insecure_skip_tls_verification,
            ..ImageProxyConfig::default()
        };
        let proxy = ImageProxy::new_with_config(config).await?;
        let img = proxy.open_image(imgref).await?;
        let (digest, manifest): (String, ImageManifest) = proxy.fetch_manifest(&img).await?;
        debug!("{imgref} has {} layers", manifest.layers().len());
        proxy.close_image(&img).await?;
        proxy.finalize().await?;
        Ok(digest)
    }
}

impl DigestResolver for ProxyResolver {
    fn resolve(&self, image: &ImageReference) -> Result<Digest, ResolutionError> {
        let name = image.name();
        let imgref = format!("docker://{name}");
        info!("Resolving digest of {imgref}");

        // Publishing is synchronous; the proxy only needs a runtime for the duration of the call
        let digest = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(anyhow::Error::from)
            .and_then(|runtime| runtime.block_on(self.fetch_digest(&imgref)))
            .map_err(|err| ResolutionError::Lookup {
                image: name.clone(),
                message: format!("{err:#}"),
            })?;

        digest
            .parse()
            .map_err(|source| ResolutionError::InvalidDigest {
                image: name,
                source,
            })
    }
}
