//! Append-only version archive.
//!
//! Every accepted code+manifest pair is written to
//! `versions/<name>/v<N>.json`. Snapshots are first written to a temporary
//! file and then hard-linked to their final name, so an existing label is
//! never overwritten even when two writers race for the same number.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::VersionError;
use crate::plugins::manifest::PluginManifest;

/// Attempts at claiming a fresh label before giving up.
const MAX_LABEL_ATTEMPTS: u32 = 16;

static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v([1-9][0-9]*)$").expect("static regex"));

/// BLAKE3 hex digest identifying a code artifact.
pub fn content_hash(code: &str) -> String {
    blake3::hash(code.as_bytes()).to_hex().to_string()
}

/// Parse `vN` into `N`.
pub fn parse_label(label: &str) -> Option<u32> {
    LABEL_RE
        .captures(label)
        .and_then(|caps| caps.get(1))
        .and_then(|n| n.as_str().parse().ok())
}

/// On-disk snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    label: String,
    code: String,
    manifest: PluginManifest,
    content_hash: String,
    created_at: DateTime<Utc>,
}

/// Summary of one stored version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionInfo {
    pub label: String,
    pub number: u32,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
}

pub struct VersionStore {
    root: PathBuf,
}

impl VersionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Archive `code` and `manifest` under the next free label.
    ///
    /// The stored manifest copy carries the new label as its version and the
    /// save time as `updated_at`.
    pub async fn save(
        &self,
        name: &str,
        code: &str,
        manifest: &PluginManifest,
    ) -> Result<String, VersionError> {
        let dir = self.artifact_dir(name);
        fs::create_dir_all(&dir).await.map_err(|e| io_error(&dir, e))?;

        let mut number = self.highest_number(name).await? + 1;
        for _ in 0..MAX_LABEL_ATTEMPTS {
            let label = format!("v{number}");
            let now = Utc::now();
            let mut manifest = manifest.clone();
            manifest.version = label.clone();
            manifest.updated_at = Some(now);

            let snapshot = Snapshot {
                label: label.clone(),
                code: code.to_string(),
                manifest,
                content_hash: content_hash(code),
                created_at: now,
            };
            let body = serde_json::to_vec_pretty(&snapshot)
                .map_err(|e| VersionError::Serialize(e.to_string()))?;

            let tmp = dir.join(format!(".{label}.{}.tmp", uuid::Uuid::new_v4()));
            fs::write(&tmp, &body).await.map_err(|e| io_error(&tmp, e))?;

            let target = dir.join(format!("{label}.json"));
            let linked = fs::hard_link(&tmp, &target).await;
            if let Err(e) = fs::remove_file(&tmp).await {
                tracing::warn!("Failed to remove snapshot temp file {}: {}", tmp.display(), e);
            }

            match linked {
                Ok(()) => {
                    tracing::debug!(name = %name, label = %label, "Saved version");
                    return Ok(label);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    number += 1;
                }
                Err(e) => return Err(io_error(&target, e)),
            }
        }

        Err(VersionError::LabelContention {
            name: name.to_string(),
            attempts: MAX_LABEL_ATTEMPTS,
        })
    }

    /// All stored versions, oldest first. Unreadable snapshots are skipped.
    pub async fn list_versions(&self, name: &str) -> Result<Vec<VersionInfo>, VersionError> {
        let mut versions = Vec::new();
        for (number, path) in self.snapshot_paths(name).await? {
            match read_snapshot(&path).await {
                Ok(snapshot) => versions.push(VersionInfo {
                    number,
                    label: snapshot.label,
                    content_hash: snapshot.content_hash,
                    created_at: snapshot.created_at,
                    description: snapshot.manifest.description,
                }),
                Err(e) => {
                    tracing::warn!(name = %name, "Skipping unreadable snapshot {}: {}", path.display(), e);
                }
            }
        }
        versions.sort_by_key(|v| v.number);
        Ok(versions)
    }

    /// Code and manifest stored under `label`, or `None` if there is no
    /// such version.
    pub async fn get_version(
        &self,
        name: &str,
        label: &str,
    ) -> Result<Option<(String, PluginManifest)>, VersionError> {
        if parse_label(label).is_none() {
            return Err(VersionError::InvalidLabel(label.to_string()));
        }

        let path = self.artifact_dir(name).join(format!("{label}.json"));
        let snapshot = match read_snapshot(&path).await {
            Ok(snapshot) => snapshot,
            Err(VersionError::Io { .. }) if !path.exists() => return Ok(None),
            Err(e) => return Err(e),
        };

        if content_hash(&snapshot.code) != snapshot.content_hash {
            return Err(VersionError::IntegrityMismatch {
                name: name.to_string(),
                label: label.to_string(),
            });
        }
        Ok(Some((snapshot.code, snapshot.manifest)))
    }

    /// Most recent version, if any.
    pub async fn latest(&self, name: &str) -> Result<Option<VersionInfo>, VersionError> {
        Ok(self.list_versions(name).await?.pop())
    }

    async fn highest_number(&self, name: &str) -> Result<u32, VersionError> {
        Ok(self
            .snapshot_paths(name)
            .await?
            .into_iter()
            .map(|(n, _)| n)
            .max()
            .unwrap_or(0))
    }

    async fn snapshot_paths(&self, name: &str) -> Result<Vec<(u32, PathBuf)>, VersionError> {
        let dir = self.artifact_dir(name);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            let Some(stem) = path
                .file_name()
                .and_then(|f| f.to_str())
                .and_then(|f| f.strip_suffix(".json"))
            else {
                continue;
            };
            if let Some(number) = parse_label(stem) {
                paths.push((number, path));
            }
        }
        Ok(paths)
    }
}

async fn read_snapshot(path: &Path) -> Result<Snapshot, VersionError> {
    let raw = fs::read(path).await.map_err(|e| io_error(path, e))?;
    serde_json::from_slice(&raw).map_err(|e| VersionError::Serialize(format!("{}: {e}", path.display())))
}

fn io_error(path: &Path, err: std::io::Error) -> VersionError {
    VersionError::Io {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn manifest() -> PluginManifest {
        PluginManifest::generated("reverse_text", "Reverse text", json!({"type": "object"}))
    }

    #[test]
    fn test_parse_label() {
        assert_eq!(parse_label("v1"), Some(1));
        assert_eq!(parse_label("v12"), Some(12));
        assert_eq!(parse_label("v0"), None);
        assert_eq!(parse_label("1"), None);
        assert_eq!(parse_label("v1/../x"), None);
    }

    #[tokio::test]
    async fn test_save_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::new(dir.path());
        let code = "def reverse_text(text):\n    return text[::-1]  # ünïcode\n";

        let label = store.save("reverse_text", code, &manifest()).await.unwrap();
        assert_eq!(label, "v1");

        let (stored, stored_manifest) = store
            .get_version("reverse_text", "v1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, code);
        assert_eq!(stored_manifest.version, "v1");
        assert!(stored_manifest.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_labels_increase_and_are_never_reused() {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::new(dir.path());

        for expected in ["v1", "v2", "v3"] {
            let label = store.save("t", "def t():\n    pass\n", &manifest()).await.unwrap();
            assert_eq!(label, expected);
        }

        // Losing v2 on disk does not make its label available again.
        std::fs::remove_file(dir.path().join("t/v2.json")).unwrap();
        assert_eq!(store.save("t", "x", &manifest()).await.unwrap(), "v4");

        let labels: Vec<String> = store
            .list_versions("t")
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.label)
            .collect();
        assert_eq!(labels, vec!["v1", "v3", "v4"]);
    }

    #[tokio::test]
    async fn test_concurrent_saves_get_distinct_labels() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(VersionStore::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.save("race", &format!("# {i}"), &manifest()).await.unwrap()
            }));
        }
        let mut labels = Vec::new();
        for handle in handles {
            labels.push(handle.await.unwrap());
        }
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), 8);
    }

    #[tokio::test]
    async fn test_missing_version_is_none() {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::new(dir.path());
        assert!(store.get_version("nothing", "v1").await.unwrap().is_none());
        assert!(store.list_versions("nothing").await.unwrap().is_empty());
        assert!(store.latest("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_label_rejected() {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::new(dir.path());
        let err = store.get_version("t", "../etc").await.unwrap_err();
        assert!(matches!(err, VersionError::InvalidLabel(_)));
    }

    #[tokio::test]
    async fn test_tampered_code_fails_integrity_check() {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::new(dir.path());
        store.save("t", "def t():\n    return 1\n", &manifest()).await.unwrap();

        let path = dir.path().join("t/v1.json");
        let mut snapshot: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        snapshot["code"] = json!("def t():\n    return 2\n");
        std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let err = store.get_version("t", "v1").await.unwrap_err();
        assert!(matches!(err, VersionError::IntegrityMismatch { .. }));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::new(dir.path());
        store.save("t", "a", &manifest()).await.unwrap();
        store.save("t", "b", &manifest()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("t"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
        assert_eq!(names.len(), 2);
    }
}
