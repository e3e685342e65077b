//! Turning registry push notifications into publish requests.
//!
//! Two payload shapes are understood:
//!
//!  - Docker registry notifications, which carry a list of `events`.  The first event that
//!    reports a pushed, tagged v2 manifest is published under the repository's top level.
//!  - Docker Hub webhooks, which describe a single push to `repository` with the tag in
//!    `push_data`.  These are published under the `dockerhub` sub-root.

use std::{io::Read, str::FromStr};

use log::{debug, warn};
use regex_automata::{
    meta::{BuildError, Regex},
    Anchored, Input,
};
use serde::Deserialize;
use thiserror::Error;

use crate::image::{Digest, ImageReference, ParseError};

pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Sub-root that Docker Hub pushes are published under.
pub const DOCKERHUB_SUB_ROOT: &str = "dockerhub";

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("malformed payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("payload has neither `events` nor `repository`")]
    Unrecognized,
    #[error("Docker Hub payload has no `push_data.tag`")]
    MissingTag,
    #[error("payload names an invalid image: {0}")]
    Reference(#[from] ParseError),
    #[error("invalid tag pattern: {0}")]
    Pattern(#[from] BuildError),
}

#[derive(Debug, Default, Deserialize)]
pub struct Payload {
    pub events: Option<Vec<Event>>,
    pub repository: Option<HubRepository>,
    pub push_data: Option<PushData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Event {
    pub action: String,
    pub target: Option<Target>,
    pub request: Option<Request>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Target {
    pub media_type: String,
    pub repository: String,
    pub digest: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Request {
    pub host: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HubRepository {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PushData {
    pub tag: Option<String>,
}

/// An image to publish and the sub-root to publish it under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub image: ImageReference,
    pub sub_root: String,
}

impl Payload {
    pub fn from_reader(reader: impl Read) -> Result<Self, WebhookError> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// The publish request this payload asks for, if any.
    ///
    /// `Ok(None)` means the payload was understood but nothing in it needs publishing.
    pub fn request(&self) -> Result<Option<PublishRequest>, WebhookError> {
        if let Some(events) = &self.events {
            return Ok(events.iter().find_map(Event::request));
        }

        let Some(repository) = &self.repository else {
            return Err(WebhookError::Unrecognized);
        };
        let Some(tag) = self.push_data.as_ref().and_then(|p| p.tag.as_ref()) else {
            return Err(WebhookError::MissingTag);
        };
        let image = ImageReference::new("", &repository.namespace, &repository.name, tag);
        image.validate()?;
        Ok(Some(PublishRequest {
            image,
            sub_root: DOCKERHUB_SUB_ROOT.into(),
        }))
    }
}

impl Event {
    fn request(&self) -> Option<PublishRequest> {
        let target = self.target.as_ref()?;
        let tag = target.tag.as_ref()?;
        if self.action != "push" || target.media_type != MANIFEST_V2 {
            debug!("Ignoring {} event on {}", self.action, target.repository);
            return None;
        }

        let (namespace, project) = target
            .repository
            .rsplit_once('/')
            .unwrap_or(("", target.repository.as_str()));
        let host = self.request.as_ref().map_or("", |r| r.host.as_str());
        let mut image = ImageReference::new(host, namespace, project, tag);
        if let Err(e) = image.validate() {
            warn!("Ignoring push of {}: {e}", image.name());
            return None;
        }

        // The registry tells us which manifest was pushed; no need to ask it again later
        if let Some(digest) = &target.digest {
            match Digest::from_str(digest) {
                Ok(digest) => image = image.with_digest(digest),
                Err(e) => warn!("Ignoring digest {digest:?} of {}: {e}", image.name()),
            }
        }

        Some(PublishRequest {
            image,
            sub_root: String::new(),
        })
    }
}

/// An allow-list of tag patterns.  Each pattern must match the whole tag.
///
/// An empty list accepts every tag.
#[derive(Debug)]
pub struct TagFilter {
    regex: Option<Regex>,
}

impl TagFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self, WebhookError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let anchored: Vec<String> = patterns
            .into_iter()
            .map(|p| format!("(?:{})$", p.as_ref()))
            .collect();
        if anchored.is_empty() {
            return Ok(Self { regex: None });
        }
        Ok(Self {
            regex: Some(Regex::new_many(&anchored)?),
        })
    }

    pub fn accepts(&self, tag: &str) -> bool {
        match &self.regex {
            None => true,
            Some(regex) => regex.is_match(Input::new(tag).anchored(Anchored::Yes)),
        }
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::digest;

    fn parse(json: &str) -> Payload {
        Payload::from_reader(json.as_bytes()).unwrap()
    }

    #[test]
    fn test_registry_event() {
        let payload = parse(&format!(
            r#"{{
  "events": [
    {{
      "action": "pull",
      "target": {{ "mediaType": "{MANIFEST_V2}", "repository": "foo/bar", "tag": "old" }},
      "request": {{ "host": "containers.example.org" }}
    }},
    {{
      "action": "push",
      "target": {{ "mediaType": "application/octet-stream", "repository": "foo/bar", "tag": "blob" }}
    }},
    {{
      "action": "push",
      "target": {{ "mediaType": "{MANIFEST_V2}", "repository": "foo/bar" }}
    }},
    {{
      "action": "push",
      "target": {{
        "mediaType": "{MANIFEST_V2}",
        "repository": "group/foo/bar",
        "digest": "{}",
        "tag": "v1"
      }},
      "request": {{ "host": "containers.example.org", "method": "PUT" }}
    }},
    {{
      "action": "push",
      "target": {{ "mediaType": "{MANIFEST_V2}", "repository": "second/one", "tag": "v2" }}
    }}
  ]
}}"#,
            digest("c")
        ));

        assert_eq!(
            payload.request().unwrap(),
            Some(PublishRequest {
                image: ImageReference::new("containers.example.org", "group/foo", "bar", "v1")
                    .with_digest(digest("c")),
                sub_root: "".into(),
            })
        );
    }

    #[test]
    fn test_registry_without_tag_events() {
        let payload = parse(r#"{ "events": [ { "action": "push", "target": {} } ] }"#);
        assert_eq!(payload.request().unwrap(), None);

        let payload = parse(r#"{ "events": [] }"#);
        assert_eq!(payload.request().unwrap(), None);
    }

    #[test]
    fn test_registry_bad_digest_is_ignored() {
        let payload = parse(&format!(
            r#"{{ "events": [ {{ "action": "push", "target": {{
                "mediaType": "{MANIFEST_V2}", "repository": "foo/bar", "tag": "latest",
                "digest": "nonsense" }} }} ] }}"#
        ));
        let request = payload.request().unwrap().unwrap();
        assert_eq!(request.image, ImageReference::new("", "foo", "bar", "latest"));
    }

    #[test]
    fn test_registry_invalid_names_are_skipped() {
        let payload = parse(&format!(
            r#"{{ "events": [
    {{ "action": "push", "target": {{ "mediaType": "{MANIFEST_V2}", "repository": "bar", "tag": "v1" }} }},
    {{ "action": "push", "target": {{ "mediaType": "{MANIFEST_V2}", "repository": "../../x", "tag": "v1" }} }},
    {{ "action": "push", "target": {{ "mediaType": "{MANIFEST_V2}", "repository": "foo/bar", "tag": "a/b" }} }},
    {{ "action": "push", "target": {{ "mediaType": "{MANIFEST_V2}", "repository": "foo/bar", "tag": "ok" }} }}
] }}"#
        ));
        assert_eq!(
            payload.request().unwrap().unwrap().image,
            ImageReference::new("", "foo", "bar", "ok")
        );
    }

    #[test]
    fn test_dockerhub() {
        let payload = parse(
            r#"{
  "callback_url": "https://registry.hub.docker.com/u/foo/bar/hook/1/",
  "push_data": { "pushed_at": 1417566161, "pusher": "someone", "tag": "v2" },
  "repository": { "name": "bar", "namespace": "foo", "repo_name": "foo/bar" }
}"#,
        );
        assert_eq!(
            payload.request().unwrap(),
            Some(PublishRequest {
                image: ImageReference::new("", "foo", "bar", "v2"),
                sub_root: "dockerhub".into(),
            })
        );
    }

    #[test]
    fn test_dockerhub_invalid_names() {
        let payload = parse(
            r#"{ "push_data": { "tag": "nested/tag" },
                 "repository": { "name": "bar", "namespace": "foo" } }"#,
        );
        assert!(matches!(
            payload.request(),
            Err(WebhookError::Reference(ParseError::Tag(_)))
        ));

        for repository in [
            r#"{ "name": "bar", "namespace": "" }"#,
            r#"{ "name": "", "namespace": "foo" }"#,
            r#"{ "name": "bar" }"#,
            r#"{ "name": "..", "namespace": "foo" }"#,
        ] {
            let payload = parse(&format!(
                r#"{{ "push_data": {{ "tag": "latest" }}, "repository": {repository} }}"#
            ));
            assert!(
                matches!(
                    payload.request(),
                    Err(WebhookError::Reference(ParseError::Component(_)))
                ),
                "{repository}"
            );
        }
    }

    #[test]
    fn test_dockerhub_missing_tag() {
        let payload = parse(r#"{ "repository": { "name": "bar", "namespace": "foo" } }"#);
        assert!(matches!(payload.request(), Err(WebhookError::MissingTag)));
    }

    #[test]
    fn test_unrecognized() {
        assert!(matches!(
            parse(r#"{ "hello": "world" }"#).request(),
            Err(WebhookError::Unrecognized)
        ));
        assert!(matches!(
            Payload::from_reader(&b"[1, 2"[..]),
            Err(WebhookError::Parse(_))
        ));
    }

    #[test]
    fn test_tag_filter() {
        let all = TagFilter::new(Vec::<String>::new()).unwrap();
        assert!(all.accepts("anything"));
        assert!(all.accepts(""));

        let filter = TagFilter::new(["latest", r"v[0-9]+(\.[0-9]+)*"]).unwrap();
        assert!(filter.accepts("latest"));
        assert!(filter.accepts("v1"));
        assert!(filter.accepts("v1.2.3"));
        assert!(!filter.accepts("latest-rc"));
        assert!(!filter.accepts("my-latest"));
        assert!(!filter.accepts("v1.2-dev"));

        assert!(matches!(
            TagFilter::new(["("]),
            Err(WebhookError::Pattern(_))
        ));
    }
}
