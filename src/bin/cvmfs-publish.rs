use std::{fs::File, io::Read, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use cvmfs_publisher::{
    config::{PublisherConfig, DEFAULT_CONFIG_PATH},
    external::ProxyResolver,
    image::{Digest, ImageReference},
    index::PublicationIndex,
    publish::{Disposition, PublishError, Publisher},
    txn::TransactionSession,
    webhook::{Payload, TagFilter},
};

/// cvmfs-publish
#[derive(Debug, Parser)]
#[clap(name = "cvmfs-publish", version)]
pub struct App {
    /// Configuration file; defaults are used if it doesn't exist
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Publish into this repository instead of the configured one
    #[clap(long)]
    repository: Option<String>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publishes an image, eg. `docker.io/library/ubuntu:22.04`
    Publish {
        image: String,
        /// The image's manifest digest; asked from the registry if not given
        #[clap(long)]
        digest: Option<String>,
        #[clap(long, default_value = "")]
        sub_root: PathBuf,
    },
    /// Publishes the image a registry or Docker Hub push notification refers to
    Webhook {
        /// the JSON payload (default: stdin)
        payload: Option<PathBuf>,
    },
    /// Deletes unpacked images no tag refers to any more
    Prune {
        #[clap(long, default_value = "")]
        sub_root: PathBuf,
    },
    /// Prints the publication index
    List {
        #[clap(long, default_value = "")]
        sub_root: PathBuf,
    },
    /// Aborts whatever transaction is open on the repository
    Abort,
}

fn read_payload(path: Option<&PathBuf>) -> Result<Payload> {
    let mut content = vec![];
    match path {
        Some(path) => File::open(path)
            .and_then(|mut file| file.read_to_end(&mut content))
            .with_context(|| format!("Reading {}", path.display()))?,
        None => std::io::stdin()
            .read_to_end(&mut content)
            .context("Reading payload from stdin")?,
    };
    Ok(Payload::from_reader(content.as_slice())?)
}

fn report(result: Result<(), PublishError>) -> Result<()> {
    if let Err(err) = &result {
        match err.disposition() {
            Disposition::Untouched => {}
            Disposition::RolledBack => warn!("All changes were rolled back"),
            Disposition::Uncommitted => {
                error!("The repository may be left with unpublished changes; check it by hand")
            }
        }
    }
    Ok(result?)
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    let mut config = PublisherConfig::load(&args.config)?;
    if let Some(repository) = args.repository {
        config.repository = repository;
    }

    let controller = config.controller();
    let materializer = config.materializer();
    let resolver = ProxyResolver::default();
    let publisher = Publisher::new(
        &config.repository,
        &config.mount_root,
        &controller,
        &materializer,
        &resolver,
    );

    match args.cmd {
        Command::Publish {
            ref image,
            ref digest,
            ref sub_root,
        } => {
            let mut image: ImageReference = image
                .parse()
                .with_context(|| format!("Parsing image reference {image:?}"))?;
            if let Some(digest) = digest {
                let digest: Digest = digest.parse().context("Parsing --digest")?;
                image = image.with_digest(digest);
            }
            report(publisher.publish(&image, sub_root).map(|publication| {
                println!("{}", publication.storage_path.display());
            }))?;
        }
        Command::Webhook { ref payload } => {
            let payload = read_payload(payload.as_ref())?;
            let Some(request) = payload.request()? else {
                info!("Nothing to publish");
                return Ok(());
            };

            let filter = TagFilter::new(&config.webhook.accept_tags)?;
            if !filter.accepts(&request.image.tag) {
                info!("Tag {:?} is not accepted, ignoring", request.image.tag);
                return Ok(());
            }

            report(
                publisher
                    .publish(&request.image, &request.sub_root)
                    .map(|publication| {
                        println!("{}", publication.storage_path.display());
                    }),
            )?;
        }
        Command::Prune { ref sub_root } => {
            report(publisher.prune(sub_root).map(|pruned| {
                for path in pruned {
                    println!("{}", path.display());
                }
            }))?;
        }
        Command::List { ref sub_root } => {
            let index = PublicationIndex::new(publisher.layout(sub_root).index_path());
            for (storage, references) in index.entries()? {
                println!("{storage}");
                for reference in references {
                    println!("    {reference}");
                }
            }
        }
        Command::Abort => {
            TransactionSession::new(&config.repository).abort(&controller)?;
        }
    }
    Ok(())
}
