//! The build-time asset manifest.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{PrecacheError, PrecacheResult};

/// Length of a content hash in hex characters.
pub const CONTENT_HASH_LEN: usize = 32;

/// One asset that must be precached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Root-relative, relative or absolute URL of the asset.
    pub logical_path: String,
    /// Opaque content fingerprint.
    pub content_hash: String,
}

impl ManifestEntry {
    /// Create an entry, checking the hash shape.
    pub fn new(logical_path: impl Into<String>, content_hash: impl Into<String>) -> PrecacheResult<Self> {
        let logical_path = logical_path.into();
        let content_hash = content_hash.into();

        if logical_path.is_empty() {
            return Err(PrecacheError::InvalidManifest("empty logical path".into()));
        }
        if content_hash.len() != CONTENT_HASH_LEN
            || !content_hash.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(PrecacheError::InvalidManifest(format!(
                "content hash for {} must be {} hex characters, got {:?}",
                logical_path, CONTENT_HASH_LEN, content_hash
            )));
        }

        Ok(Self {
            logical_path,
            content_hash,
        })
    }
}

/// Ordered, immutable set of assets to precache.
///
/// Serialized as an array of `[path, hash]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(String, String)>", into = "Vec<(String, String)>")]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build a manifest; logical paths must be unique.
    pub fn new(entries: Vec<ManifestEntry>) -> PrecacheResult<Self> {
        {
            let mut seen = HashSet::with_capacity(entries.len());
            if let Some(dup) = entries.iter().find(|e| !seen.insert(e.logical_path.as_str())) {
                return Err(PrecacheError::InvalidManifest(format!(
                    "duplicate logical path {}",
                    dup.logical_path
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Build a manifest from `(path, hash)` pairs.
    pub fn from_pairs<I, P, H>(pairs: I) -> PrecacheResult<Self>
    where
        I: IntoIterator<Item = (P, H)>,
        P: Into<String>,
        H: Into<String>,
    {
        let entries = pairs
            .into_iter()
            .map(|(path, hash)| ManifestEntry::new(path, hash))
            .collect::<PrecacheResult<Vec<_>>>()?;
        Self::new(entries)
    }

    /// Parse the JSON pair-array form.
    pub fn from_json(json: &str) -> PrecacheResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load the JSON pair-array form from a file.
    pub fn load(path: &Path) -> PrecacheResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter()
    }

    /// Find the entry for a logical path.
    pub fn get(&self, logical_path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.logical_path == logical_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TryFrom<Vec<(String, String)>> for Manifest {
    type Error = PrecacheError;

    fn try_from(pairs: Vec<(String, String)>) -> Result<Self, Self::Error> {
        Self::from_pairs(pairs)
    }
}

impl From<Manifest> for Vec<(String, String)> {
    fn from(manifest: Manifest) -> Self {
        manifest
            .entries
            .into_iter()
            .map(|e| (e.logical_path, e.content_hash))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_A: &str = "0a642be9e1b7fb02b86a2e52fc88a8a7";
    const HASH_B: &str = "59dabb570c57dd421d5197009bf1d07f";

    #[test]
    fn test_from_json_keeps_order() {
        let manifest = Manifest::from_json(&format!(
            r#"[["/", "{HASH_A}"], ["static/core.js", "{HASH_B}"]]"#
        ))
        .unwrap();

        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.entries()[0].logical_path, "/");
        assert_eq!(manifest.entries()[1].logical_path, "static/core.js");
        assert_eq!(manifest.get("/").unwrap().content_hash, HASH_A);
    }

    #[test]
    fn test_rejects_bad_hash() {
        assert!(ManifestEntry::new("/", "abc").is_err());
        assert!(ManifestEntry::new("/", "zz642be9e1b7fb02b86a2e52fc88a8a7").is_err());
        assert!(ManifestEntry::new("/", HASH_A).is_ok());
    }

    #[test]
    fn test_rejects_duplicate_paths() {
        let err = Manifest::from_pairs([("/", HASH_A), ("/", HASH_B)]).unwrap_err();
        assert!(matches!(err, PrecacheError::InvalidManifest(_)));
    }

    #[test]
    fn test_invalid_json_entry_fails_deserialization() {
        assert!(Manifest::from_json(r#"[["/", "short"]]"#).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, format!(r#"[["/index.html", "{HASH_B}"]]"#)).unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.entries()[0].content_hash, HASH_B);
    }
}
