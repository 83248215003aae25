//! Sample manifest: the static, ordered list of example programs
//!
//! Entries are declared once at startup. `id` is unique across the manifest and
//! `group` is a presentational label whose entries must stay contiguous, so the
//! sample switcher can render one option group per run of equal labels.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Errors from loading or validating a manifest
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Manifest has no samples")]
    Empty,

    #[error("Duplicate sample id: {0}")]
    DuplicateId(String),

    #[error("Group '{0}' is split into non-contiguous runs")]
    GroupNotContiguous(String),
}

/// One manifest record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEntry {
    /// Category label used for clustering in the switcher
    pub group: String,
    /// Human-readable name
    #[serde(rename = "name", alias = "display_name")]
    pub display_name: String,
    /// Stable identifier, also used as the address fragment
    pub id: String,
    /// Locator handed to the fetcher
    pub path: String,
}

impl SampleEntry {
    pub fn new(
        group: impl Into<String>,
        display_name: impl Into<String>,
        id: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            display_name: display_name.into(),
            id: id.into(),
            path: path.into(),
        }
    }
}

/// A contiguous run of entries sharing a group label
#[derive(Debug, Serialize)]
pub struct SampleGroup<'a> {
    pub label: &'a str,
    pub entries: Vec<&'a SampleEntry>,
}

#[derive(Deserialize)]
struct ManifestFile {
    #[serde(rename = "sample", default)]
    samples: Vec<SampleEntry>,
}

/// Validated sample manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    entries: Vec<SampleEntry>,
}

impl Manifest {
    /// Build a manifest, checking id uniqueness and group contiguity
    pub fn new(entries: Vec<SampleEntry>) -> Result<Self, ManifestError> {
        if entries.is_empty() {
            return Err(ManifestError::Empty);
        }

        let mut ids = HashSet::new();
        for entry in &entries {
            if !ids.insert(entry.id.as_str()) {
                return Err(ManifestError::DuplicateId(entry.id.clone()));
            }
        }

        let mut closed_groups: HashSet<&str> = HashSet::new();
        let mut current: Option<&str> = None;
        for entry in &entries {
            if current == Some(entry.group.as_str()) {
                continue;
            }
            if let Some(previous) = current {
                closed_groups.insert(previous);
            }
            if closed_groups.contains(entry.group.as_str()) {
                return Err(ManifestError::GroupNotContiguous(entry.group.clone()));
            }
            current = Some(entry.group.as_str());
        }

        Ok(Self { entries })
    }

    /// Parse a manifest from TOML (`[[sample]]` tables)
    pub fn from_toml_str(contents: &str) -> Result<Self, ManifestError> {
        let file: ManifestFile = toml::from_str(contents)?;
        Self::new(file.samples)
    }

    /// Read and parse a manifest file
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// The manifest shipped with the crate
    pub fn builtin() -> Result<Self, ManifestError> {
        Self::from_toml_str(BUILTIN_MANIFEST)
    }

    pub fn entries(&self) -> &[SampleEntry] {
        &self.entries
    }

    pub fn find(&self, id: &str) -> Option<&SampleEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Id selected when the address fragment is empty
    pub fn default_id(&self) -> &str {
        // Non-empty is checked in `new`
        &self.entries[0].id
    }

    /// Entries clustered by group, in manifest order
    pub fn groups(&self) -> Vec<SampleGroup<'_>> {
        let mut groups: Vec<SampleGroup<'_>> = Vec::new();
        for entry in &self.entries {
            match groups.last_mut() {
                Some(group) if group.label == entry.group => group.entries.push(entry),
                _ => groups.push(SampleGroup {
                    label: &entry.group,
                    entries: vec![entry],
                }),
            }
        }
        groups
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

const BUILTIN_MANIFEST: &str = include_str!("../samples/manifest.toml");

const BUILTIN_SOURCES: &[(&str, &str)] = &[
    ("test_add.py", include_str!("../samples/test_add.py")),
    ("test_ifelse.py", include_str!("../samples/test_ifelse.py")),
    ("test_for.py", include_str!("../samples/test_for.py")),
    ("test_while.py", include_str!("../samples/test_while.py")),
    (
        "test_while_nested.py",
        include_str!("../samples/test_while_nested.py"),
    ),
    ("test_fibonacci.py", include_str!("../samples/test_fibonacci.py")),
    ("test_is_prime.py", include_str!("../samples/test_is_prime.py")),
    ("test_raise.py", include_str!("../samples/test_raise.py")),
];

/// Source texts of the built-in samples, keyed by manifest path
pub fn builtin_sources() -> HashMap<String, String> {
    BUILTIN_SOURCES
        .iter()
        .map(|(path, text)| (path.to_string(), text.to_string()))
        .collect()
}
