use std::{
    cell::RefCell,
    collections::HashMap,
    fs::{read_link, read_to_string, write},
    io,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::ExitStatus,
};

use serde_json::Value;
use sha2::{Digest as _, Sha256};
use similar_asserts::assert_eq;
use tempfile::TempDir;

use cvmfs_publisher::{
    external::{DigestResolver, MaterializeError, Materializer, ResolutionError},
    image::{Digest, ImageReference},
    link::LinkAction,
    publish::Publisher,
    txn::FilesystemController,
    webhook::{Payload, TagFilter},
};

/// A registry of image contents; digests are the sha256 of the content.
#[derive(Default)]
struct Registry {
    images: RefCell<HashMap<String, String>>,
}

impl Registry {
    fn push(&self, name: &str, content: &str) -> Digest {
        self.images
            .borrow_mut()
            .insert(name.to_string(), content.to_string());
        digest_of(content)
    }
}

fn digest_of(content: &str) -> Digest {
    Digest::new("sha256", &hex::encode(Sha256::digest(content))).unwrap()
}

impl Materializer for Registry {
    fn materialize(&self, image: &ImageReference, output: &Path) -> Result<(), MaterializeError> {
        let images = self.images.borrow();
        let content = &images[&image.name()];
        write(output.join("content"), content).map_err(|source| MaterializeError::Io {
            path: output.display().to_string(),
            source,
        })
    }
}

impl DigestResolver for Registry {
    fn resolve(&self, image: &ImageReference) -> Result<Digest, ResolutionError> {
        let images = self.images.borrow();
        match images.get(&image.name()) {
            Some(content) => Ok(digest_of(content)),
            None => Err(ResolutionError::Lookup {
                image: image.name(),
                message: "not found".into(),
            }),
        }
    }
}

struct AlwaysSucceeds(PathBuf);

impl FilesystemController for AlwaysSucceeds {
    fn begin(&self, _: &str) -> io::Result<ExitStatus> {
        Ok(ExitStatus::from_raw(0))
    }

    fn publish(&self, _: &str) -> io::Result<ExitStatus> {
        Ok(ExitStatus::from_raw(0))
    }

    fn abort(&self, _: &str) -> io::Result<ExitStatus> {
        Ok(ExitStatus::from_raw(0))
    }

    fn lock_marker(&self, repository: &str) -> PathBuf {
        self.0.join(repository).join("in_transaction.lock")
    }
}

fn index_json(root: &Path) -> Value {
    serde_json::from_str(&read_to_string(root.join(".publications.json")).unwrap()).unwrap()
}

#[test]
fn test_publish_then_move_tag() {
    let tmp = TempDir::new().unwrap();
    let registry = Registry::default();
    let controller = AlwaysSucceeds(tmp.path().join("spool"));
    let publisher = Publisher::new(
        "repo.example.org",
        tmp.path().join("cvmfs"),
        &controller,
        &registry,
        &registry,
    );
    let root = tmp.path().join("cvmfs/repo.example.org");
    let image = ImageReference::new("", "foo", "bar", "latest");

    let first = registry.push("foo/bar:latest", "first");
    let a = publisher.publish(&image, "").unwrap();
    assert_eq!(a.digest, first);
    assert_eq!(
        read_link(root.join("foo/bar/latest")).unwrap(),
        PathBuf::from(format!(".digests/sha256/{}/{}", first.prefix(), first.hex()))
    );
    assert_eq!(
        read_to_string(root.join("foo/bar/latest/content")).unwrap(),
        "first"
    );
    assert_eq!(
        index_json(&root)["publications"][a.storage_path.to_str().unwrap()],
        serde_json::json!([root.join("foo/bar/latest").to_str().unwrap()])
    );

    let second = registry.push("foo/bar:latest", "second");
    let b = publisher.publish(&image, "").unwrap();
    assert_eq!(b.digest, second);
    assert!(matches!(b.link_action, LinkAction::Repointed { .. }));
    assert_eq!(b.pruned, vec![a.storage_path.clone()]);
    assert_eq!(
        read_to_string(root.join("foo/bar/latest/content")).unwrap(),
        "second"
    );

    let publications = index_json(&root)["publications"].clone();
    assert_eq!(publications.as_object().unwrap().len(), 1);
    assert!(publications.get(b.storage_path.to_str().unwrap()).is_some());
}

#[test]
fn test_dockerhub_webhook() {
    let tmp = TempDir::new().unwrap();
    let registry = Registry::default();
    let controller = AlwaysSucceeds(tmp.path().join("spool"));
    let publisher = Publisher::new(
        "repo.example.org",
        tmp.path().join("cvmfs"),
        &controller,
        &registry,
        &registry,
    );
    registry.push("foo/bar:v2", "hub content");

    let payload = Payload::from_reader(
        &br#"{
  "push_data": { "tag": "v2" },
  "repository": { "name": "bar", "namespace": "foo" }
}"#[..],
    )
    .unwrap();
    let request = payload.request().unwrap().unwrap();
    assert!(TagFilter::new(["v[0-9]+"]).unwrap().accepts(&request.image.tag));

    publisher
        .publish(&request.image, &request.sub_root)
        .unwrap();
    let root = tmp.path().join("cvmfs/repo.example.org/dockerhub");
    assert_eq!(
        read_to_string(root.join("foo/bar/v2/content")).unwrap(),
        "hub content"
    );
    assert!(root.join(".publications.json").is_file());
}

#[test]
fn test_names_cannot_leave_the_root() {
    let tmp = TempDir::new().unwrap();
    let registry = Registry::default();
    let controller = AlwaysSucceeds(tmp.path().join("spool"));
    let publisher = Publisher::new(
        "repo.example.org",
        tmp.path().join("cvmfs"),
        &controller,
        &registry,
        &registry,
    );
    registry.push("../../../escaped:latest", "outside");
    registry.push("foo/bar:nested/tag", "nested");

    assert!("../../../escaped:latest".parse::<ImageReference>().is_err());
    assert!(publisher
        .publish(&ImageReference::new("", "../../..", "escaped", "latest"), "")
        .is_err());
    assert!(publisher
        .publish(&ImageReference::new("", "foo", "bar", "nested/tag"), "")
        .is_err());

    assert!(!tmp.path().join("escaped").exists());
    assert!(!tmp.path().join("cvmfs").exists());
}
