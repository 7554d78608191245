//! Image reference parsing
//!
//! Splits Docker-style references like:
//! - nginx
//! - nginx:1.25
//! - myuser/myapp:v1.0
//! - ghcr.io/owner/repo:tag
//! - registry.example.com:5000/app@sha256:abc...
//!
//! References coming out of compose manifests may carry env-substitution
//! syntax in the tag position (`app:${TAG:-prod}`); the default is taken
//! as the tag.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_INDEX: &str = "index.docker.io";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,
    #[error("image reference contains whitespace: {0:?}")]
    Whitespace(String),
}

/// A parsed image reference, normalized across Docker Hub aliases.
///
/// `docker.io/library/redis:latest`, `index.docker.io/redis` and plain
/// `redis` all compare equal.
#[derive(Debug, Clone)]
pub struct Reference {
    /// Registry host, `None` for Docker Hub.
    registry: Option<String>,
    /// Repository path. Single-segment Docker Hub names are stored with
    /// the implicit `library/` prefix.
    repository: String,
    tag: String,
    digest: Option<String>,
    /// The string the reference was parsed from.
    raw: String,
}

impl Reference {
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(ReferenceError::Whitespace(s.to_string()));
        }

        let (name_part, digest) = match s.split_once('@') {
            Some((n, d)) => (n, Some(d.to_string())),
            None => (s, None),
        };

        // A leading component is a registry when it looks like a host:
        // contains a dot or port, or is "localhost".
        let (registry, rest) = match name_part.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), remainder)
            }
            _ => (None, name_part),
        };

        // The tag is everything after the last ':' that is not part of a
        // path segment. Tags never contain '/'.
        let (repository, tag) = match rest.rfind(':') {
            Some(idx) if !rest[idx + 1..].contains('/') => (
                rest[..idx].to_string(),
                Some(resolve_substitution(&rest[idx + 1..])),
            ),
            _ => (rest.to_string(), None),
        };

        let registry = match registry.as_deref() {
            Some(DOCKER_HUB) | Some(DOCKER_HUB_INDEX) => None,
            _ => registry,
        };

        // Docker Hub official images live under library/.
        let repository = if registry.is_none() && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        let tag = match (&tag, &digest) {
            (Some(t), _) => t.clone(),
            (None, Some(_)) => String::new(),
            (None, None) => "latest".to_string(),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
            raw: s.to_string(),
        })
    }

    /// The repository in the form the Docker engine reports it: Docker Hub
    /// official images drop the registry and `library/` prefix, other hub
    /// images drop only the registry.
    pub fn repository(&self) -> String {
        match &self.registry {
            Some(reg) => format!("{reg}/{}", self.repository),
            None => self
                .repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string(),
        }
    }

    /// Repository path as the registry v2 API addresses it; Docker Hub
    /// official images keep the `library/` prefix here.
    pub fn api_repository(&self) -> &str {
        &self.repository
    }

    /// Registry host, `None` for Docker Hub.
    pub fn registry_host(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Digest-pinned references are immutable and never updated.
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Every fully-qualified name the engine may know this image under.
    ///
    /// Local image lookups walk these in order; the literal input comes
    /// first so the form the container was created with wins.
    pub fn canonical_aliases(&self) -> Vec<String> {
        let mut names = vec![self.raw.clone(), self.to_string()];

        let suffix = match (&self.digest, self.tag.as_str()) {
            (Some(d), _) => format!("@{d}"),
            (None, t) => format!(":{t}"),
        };

        match &self.registry {
            Some(reg) => {
                names.push(format!("{reg}/{}{suffix}", self.repository));
            }
            None => {
                let short = self
                    .repository
                    .strip_prefix("library/")
                    .unwrap_or(&self.repository);
                for repo in [short, &self.repository as &str] {
                    names.push(format!("{repo}{suffix}"));
                    names.push(format!("{DOCKER_HUB}/{repo}{suffix}"));
                    names.push(format!("{DOCKER_HUB_INDEX}/{repo}{suffix}"));
                }
            }
        }

        let mut seen = BTreeSet::new();
        names.retain(|n| seen.insert(n.clone()));
        names
    }
}

/// `${VAR:-default}` in the tag position resolves to the default; any
/// other substitution syntax is kept verbatim.
fn resolve_substitution(tag: &str) -> String {
    if let Some(inner) = tag.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
        if let Some((_, default)) = inner.split_once(":-") {
            return default.to_string();
        }
    }
    tag.to_string()
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.registry == other.registry
            && self.repository == other.repository
            && self.tag == other.tag
            && self.digest == other.digest
    }
}

impl Eq for Reference {}

impl std::hash::Hash for Reference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.registry.hash(state);
        self.repository.hash(state);
        self.tag.hash(state);
        self.digest.hash(state);
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository())?;
        match &self.digest {
            Some(d) => write!(f, "@{d}"),
            None => write!(f, ":{}", self.tag),
        }
    }
}

impl FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
