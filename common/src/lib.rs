//! Dataset record and volume definitions shared by the dataset node plugin.

pub mod path;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Kind of resource a file reference points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    Volume,
    /// Any kind this plugin does not resolve; references of such kinds are skipped.
    Other(String),
}

impl ReferenceKind {
    pub const VOLUME: &'static str = "Volume";

    pub fn parse(kind: &str) -> Self {
        if kind == Self::VOLUME {
            ReferenceKind::Volume
        } else {
            ReferenceKind::Other(kind.to_string())
        }
    }

    pub fn is_volume(&self) -> bool {
        matches!(self, ReferenceKind::Volume)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeRef {
    pub kind: ReferenceKind,
    pub name: String,
    pub creator: String,
}

impl VolumeRef {
    pub fn volume(creator: impl Into<String>, name: impl Into<String>) -> Self {
        VolumeRef {
            kind: ReferenceKind::Volume,
            name: name.into(),
            creator: creator.into(),
        }
    }

    /// Cache key of the referenced volume, `<creator>/<name>`.
    pub fn key(&self) -> VolumeKey {
        VolumeKey {
            creator: self.creator.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeKey {
    pub creator: String,
    pub name: String,
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.creator, self.name)
    }
}

/// One file of a dataset record: a key inside a storage volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReference {
    pub volume: VolumeRef,
    pub key: String,
    pub content_length: u64,
}

/// A data item as listed by the catalog.
///
/// `files` keeps the catalog order; annotation values are plain JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub files: Vec<FileReference>,
    pub annotations: BTreeMap<String, serde_json::Value>,
}

/// Identity of one dataset version in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub name: String,
    pub version: String,
    pub creator: String,
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.creator, self.name, self.version)
    }
}

/// Physical location of a volume: bucket plus a prefix inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub bucket: String,
    pub path: String,
}

impl VolumeDescriptor {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        VolumeDescriptor {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// `<bucket>/<path>/<key>`, cleaned.
    pub fn file_path(&self, key: &str) -> String {
        path::join([self.bucket.as_str(), self.path.as_str(), key])
    }

    /// Same as [`VolumeDescriptor::file_path`] below a local mount prefix.
    pub fn local_path(&self, mount_prefix: &str, key: &str) -> String {
        path::join([mount_prefix, self.bucket.as_str(), self.path.as_str(), key])
    }
}

/// Row handed to the file-location database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationEntry {
    pub path: String,
    pub size: u64,
    /// Root the path is relative to when it is not the dataset data root.
    pub root: Option<PathBuf>,
}

impl LocationEntry {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        LocationEntry {
            path: path.into(),
            size,
            root: None,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }
}
