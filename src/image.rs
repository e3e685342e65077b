//! Image references and content digests.
//!
//! An [`ImageReference`] names a publication target (`registry/namespace/project:tag`) and may
//! carry the [`Digest`] of the content that tag currently resolves to.  Digests are what the
//! on-disk layout is keyed by; tags are only ever stored as links.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// The tag used when a reference doesn't name one.
pub const DEFAULT_TAG: &str = "latest";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("digest {0:?} is not in the form <algorithm>:<hex>")]
    DigestFormat(String),
    #[error("digest algorithm {0:?} is invalid")]
    DigestAlgorithm(String),
    #[error("digest value {0:?} is not valid hex")]
    DigestHex(String),
    #[error("sha256 digest must be 32 bytes, got {0}")]
    DigestLength(usize),
    #[error("image reference {0:?} must name at least a namespace and a project")]
    Reference(String),
    #[error("tag {0:?} is invalid")]
    Tag(String),
    #[error("name component {0:?} is invalid")]
    Component(String),
}

/// Longest tag accepted, as for docker.
const MAX_TAG_LENGTH: usize = 128;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Tags follow the docker grammar `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
fn validate_tag(tag: &str) -> Result<(), ParseError> {
    let mut chars = tag.chars();
    let valid = tag.len() <= MAX_TAG_LENGTH
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && chars.all(is_name_char);
    if !valid {
        return Err(ParseError::Tag(tag.to_string()));
    }
    Ok(())
}

/// A namespace or project component: starts alphanumeric, so neither empty nor `.`, `..` or a
/// hidden name that could collide with `.digests`.
fn validate_component(component: &str) -> Result<(), ParseError> {
    let mut chars = component.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) && chars.all(is_name_char);
    if !valid {
        return Err(ParseError::Component(component.to_string()));
    }
    Ok(())
}

/// A content digest: an algorithm name and the lowercase hex encoding of the hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Creates a digest from its two halves, validating both.
    pub fn new(algorithm: &str, hex_value: &str) -> Result<Self, ParseError> {
        if algorithm.is_empty()
            || !algorithm
                .bytes()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(ParseError::DigestAlgorithm(algorithm.to_string()));
        }

        // The first two characters name the fan-out directory, so we need at least one byte.
        let bytes =
            hex::decode(hex_value).map_err(|_| ParseError::DigestHex(hex_value.to_string()))?;
        if bytes.is_empty() {
            return Err(ParseError::DigestHex(hex_value.to_string()));
        }
        if algorithm == "sha256" && bytes.len() != 32 {
            return Err(ParseError::DigestLength(bytes.len()));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex_value.to_ascii_lowercase(),
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// The two-character fan-out prefix used to spread entries across directories.
    pub fn prefix(&self) -> &str {
        &self.hex[..2]
    }
}

impl FromStr for Digest {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((algorithm, hex_value)) => Self::new(algorithm, hex_value),
            None => Err(ParseError::DigestFormat(s.to_string())),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// A request to publish `registry/namespace/project:tag`.
///
/// The digest is optional at request time; if it is missing the publisher asks a
/// [`DigestResolver`](crate::external::DigestResolver) for it before touching the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub namespace: String,
    pub project: String,
    pub digest: Option<Digest>,
    pub tag: String,
}

impl ImageReference {
    pub fn new(
        registry: impl Into<String>,
        namespace: impl Into<String>,
        project: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            namespace: namespace.into(),
            project: project.into(),
            digest: None,
            tag: tag.into(),
        }
    }

    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Checks that the namespace, project and tag are safe to use as path components below a
    /// publication root.
    ///
    /// The namespace may consist of several `/`-separated components; the project and tag are a
    /// single component each.
    pub fn validate(&self) -> Result<(), ParseError> {
        for component in self.namespace.split('/') {
            validate_component(component)?;
        }
        validate_component(&self.project)?;
        validate_tag(&self.tag)
    }

    /// The pullable name of the image, eg. `docker.io/library/ubuntu:latest`.
    ///
    /// Empty components (typically the registry) are skipped.
    pub fn name(&self) -> String {
        let path = [&self.registry, &self.namespace, &self.project]
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("/");
        format!("{path}:{}", self.tag)
    }
}

impl FromStr for ImageReference {
    type Err = ParseError;

    /// Parses `[registry/]namespace/project[:tag][@algorithm:hex]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.parse()?)),
            None => (s, None),
        };

        // A ':' before the last '/' belongs to a registry port, not a tag
        let last_slash = rest.rfind('/').unwrap_or(0);
        let (path, tag) = match rest[last_slash..].find(':') {
            Some(idx) => (&rest[..last_slash + idx], &rest[last_slash + idx + 1..]),
            None => (rest, DEFAULT_TAG),
        };

        let mut components: Vec<&str> = path.split('/').collect();
        if components.iter().any(|c| c.is_empty()) || tag.is_empty() {
            return Err(ParseError::Reference(s.to_string()));
        }

        // Like docker: the first component is a registry only if it looks like a host name
        let has_registry = components.len() > 2
            && (components[0].contains(['.', ':']) || components[0] == "localhost");
        let registry = if has_registry {
            components.remove(0)
        } else {
            ""
        };
        let Some(project) = components.pop() else {
            return Err(ParseError::Reference(s.to_string()));
        };
        if components.is_empty() {
            return Err(ParseError::Reference(s.to_string()));
        }

        let image = Self {
            registry: registry.to_string(),
            namespace: components.join("/"),
            project: project.to_string(),
            digest,
            tag: tag.to_string(),
        };
        image.validate()?;
        Ok(image)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    const HEX: &str = "aaaa5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a";

    #[test]
    fn test_digest_parse() {
        let digest: Digest = format!("sha256:{HEX}").parse().unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.hex(), HEX);
        assert_eq!(digest.prefix(), "aa");
        assert_eq!(digest.to_string(), format!("sha256:{HEX}"));

        // uppercase hex is normalized
        let upper: Digest = format!("sha256:{}", HEX.to_uppercase()).parse().unwrap();
        assert_eq!(upper, digest);

        // other algorithms aren't length-checked
        let short: Digest = "sha512:abcd".parse().unwrap();
        assert_eq!(short.prefix(), "ab");
    }

    #[test]
    fn test_digest_invalid() {
        assert_eq!(
            "nocolon".parse::<Digest>(),
            Err(ParseError::DigestFormat("nocolon".into()))
        );
        assert_eq!(
            ":abcd".parse::<Digest>(),
            Err(ParseError::DigestAlgorithm("".into()))
        );
        assert_eq!(
            "SHA256:abcd".parse::<Digest>(),
            Err(ParseError::DigestAlgorithm("SHA256".into()))
        );
        assert_eq!(
            "sha256:".parse::<Digest>(),
            Err(ParseError::DigestHex("".into()))
        );
        assert_eq!(
            "sha256:/etc/shadow".parse::<Digest>(),
            Err(ParseError::DigestHex("/etc/shadow".into()))
        );
        assert_eq!(
            "sha256:abcd".parse::<Digest>(),
            Err(ParseError::DigestLength(2))
        );
    }

    #[test]
    fn test_reference_name() {
        let image = ImageReference::new("", "foo", "bar", "latest");
        assert_eq!(image.name(), "foo/bar:latest");

        let image = ImageReference::new("containers.ligo.org", "lscsoft", "lalsuite", "v1");
        assert_eq!(image.name(), "containers.ligo.org/lscsoft/lalsuite:v1");
    }

    #[test]
    fn test_reference_parse() {
        let image: ImageReference = "foo/bar".parse().unwrap();
        assert_eq!(image, ImageReference::new("", "foo", "bar", "latest"));

        let image: ImageReference = "registry.example.com:5000/foo/bar:v2".parse().unwrap();
        assert_eq!(
            image,
            ImageReference::new("registry.example.com:5000", "foo", "bar", "v2")
        );

        // nested namespaces stay together
        let image: ImageReference = "containers.ligo.org/group/sub/proj".parse().unwrap();
        assert_eq!(
            image,
            ImageReference::new("containers.ligo.org", "group/sub", "proj", "latest")
        );
        let image: ImageReference = "group/sub/proj".parse().unwrap();
        assert_eq!(image, ImageReference::new("", "group/sub", "proj", "latest"));

        let image: ImageReference = format!("foo/bar:v3@sha256:{HEX}").parse().unwrap();
        assert_eq!(image.tag, "v3");
        assert_eq!(image.digest.unwrap().hex(), HEX);
    }

    #[test]
    fn test_reference_invalid() {
        for bad in ["bar", "bar:latest", "/bar", "foo//bar", "foo/bar:", "foo/bar@nope"] {
            assert!(bad.parse::<ImageReference>().is_err(), "{bad} should not parse");
        }

        assert_eq!(
            "../../../escaped:latest".parse::<ImageReference>(),
            Err(ParseError::Component("..".into()))
        );
        assert_eq!(
            "foo/./bar".parse::<ImageReference>(),
            Err(ParseError::Component(".".into()))
        );
        assert_eq!(
            "foo/bar:-rc".parse::<ImageReference>(),
            Err(ParseError::Tag("-rc".into()))
        );
    }

    #[test]
    fn test_validate() {
        assert_eq!(ImageReference::new("", "foo", "bar", "latest").validate(), Ok(()));
        assert_eq!(
            ImageReference::new("", "group/sub", "proj", "v1.2_rc-3").validate(),
            Ok(())
        );
        assert_eq!(ImageReference::new("", "foo", "bar", "_x").validate(), Ok(()));

        for tag in ["", "nested/tag", ".hidden", "..", "-rc", "a b", "x".repeat(129).as_str()] {
            assert_eq!(
                ImageReference::new("", "foo", "bar", tag).validate(),
                Err(ParseError::Tag(tag.to_string())),
                "{tag:?}"
            );
        }
        assert_eq!(
            ImageReference::new("", "foo", "bar", "x".repeat(128)).validate(),
            Ok(())
        );

        for (namespace, project, bad) in [
            ("", "bar", ""),
            ("foo", "", ""),
            ("..", "bar", ".."),
            ("foo/..", "bar", ".."),
            ("foo", ".", "."),
            ("foo", ".digests", ".digests"),
            ("foo//x", "bar", ""),
        ] {
            assert_eq!(
                ImageReference::new("", namespace, project, "latest").validate(),
                Err(ParseError::Component(bad.into())),
                "{namespace}/{project}"
            );
        }
    }
}
