use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::construct::ConstructId;
use crate::digest::DigestAlgorithm;
use crate::manifest::Manifest;

/// Maven coordinates of a library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LibraryId {
    pub group: String,
    pub artifact: String,
    pub version: String,
}

impl LibraryId {
    pub fn new(group: impl Into<String>, artifact: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            artifact: artifact.into(),
            version: version.into(),
        }
    }

    /// Parses `group:artifact:version`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split(':');
        let group = parts.next().filter(|p| !p.is_empty())?;
        let artifact = parts.next().filter(|p| !p.is_empty())?;
        let version = parts.next().filter(|p| !p.is_empty())?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(group, artifact, version))
    }
}

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.artifact, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropertySource {
    JavaManifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Property {
    pub source: PropertySource,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Library {
    pub digest: String,
    pub digest_algorithm: DigestAlgorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_id: Option<LibraryId>,
    pub constructs: BTreeSet<ConstructId>,
    pub bundled_library_ids: BTreeSet<LibraryId>,
    pub properties: BTreeSet<Property>,
}

impl Library {
    pub fn new(digest: String) -> Self {
        Self {
            digest,
            digest_algorithm: DigestAlgorithm::Sha256,
            library_id: None,
            constructs: BTreeSet::new(),
            bundled_library_ids: BTreeSet::new(),
            properties: BTreeSet::new(),
        }
    }

    pub fn with_manifest(mut self, manifest: &Manifest) -> Self {
        self.properties = manifest_properties(manifest);
        self
    }
}

pub fn manifest_properties(manifest: &Manifest) -> BTreeSet<Property> {
    manifest
        .attributes()
        .map(|(k, v)| Property {
            source: PropertySource::JavaManifest,
            key: k.to_string(),
            value: v.to_string(),
        })
        .collect()
}
