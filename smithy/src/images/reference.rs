use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use oci_distribution::Reference;

use crate::error::Error;

pub const DOCKER_HUB_REGISTRY: &str = "index.docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// A parsed `registry/repository[:tag][@digest]` reference with defaults filled in.
///
/// References without a registry host land on Docker Hub, and single-segment
/// Docker Hub repositories get the `library/` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    raw: String,
    inner: Reference,
    explicit_tag: bool,
}

impl ImageReference {
    /// The string this reference was parsed from.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn registry(&self) -> &str {
        self.inner.resolve_registry()
    }

    pub fn repository(&self) -> &str {
        self.inner.repository()
    }

    /// Tag, defaulting to `latest` when neither tag nor digest was given.
    pub fn tag(&self) -> &str {
        self.explicit_tag().unwrap_or(DEFAULT_TAG)
    }

    pub fn explicit_tag(&self) -> Option<&str> {
        self.inner.tag().filter(|_| self.explicit_tag)
    }

    pub fn digest(&self) -> Option<&str> {
        self.inner.digest()
    }

    /// `registry/repository`.
    pub fn repository_name(&self) -> String {
        format!("{}/{}", self.registry(), self.repository())
    }

    /// Fully qualified name, e.g. `index.docker.io/library/alpine:3.19`.
    pub fn name(&self) -> String {
        match (self.explicit_tag(), self.digest()) {
            (Some(tag), Some(digest)) => format!("{}:{tag}@{digest}", self.repository_name()),
            (None, Some(digest)) => format!("{}@{digest}", self.repository_name()),
            _ => format!("{}:{}", self.repository_name(), self.tag()),
        }
    }

    pub fn is_docker_hub(&self) -> bool {
        self.registry() == DOCKER_HUB_REGISTRY
    }

    /// The distribution client's view of this reference.
    pub fn as_oci(&self) -> &Reference {
        &self.inner
    }
}

impl FromStr for ImageReference {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.contains(char::is_whitespace) {
            bail!(Error::Validation(format!("invalid image reference '{raw}'")));
        }
        let inner: Reference = raw.parse().map_err(|e| {
            Error::Validation(format!("invalid image reference '{raw}': {e}"))
        })?;

        Ok(Self {
            raw: raw.to_string(),
            inner,
            explicit_tag: has_tag(raw),
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A `:` after the last `/` of the name part; a registry port never qualifies.
fn has_tag(raw: &str) -> bool {
    let name = raw.split_once('@').map_or(raw, |(name, _)| name);
    let last_segment = name.rsplit_once('/').map_or(name, |(_, segment)| segment);
    last_segment.contains(':')
}
