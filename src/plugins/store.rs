//! Filesystem persistence for artifacts and their failure records.
//!
//! ```text
//! <root>/
//!   pending/<name>/     manifest.yaml tool.py tests.yaml schema.yaml state.yaml scripts/*.py
//!   available/<name>/
//!   failed/<name>/
//!   versions/<name>/    (owned by VersionStore)
//!   errors/<name>.json
//!   .staging/
//! ```
//!
//! Files are replaced via temp file + rename. New artifacts are assembled in
//! `.staging/` and renamed into their membership directory in one step, and
//! membership changes are directory renames, so an artifact is never
//! observed half-written or in two sets at once.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::StoreError;
use crate::plugins::lifecycle::{LifecycleState, Membership};
use crate::plugins::manifest::{FailureRecord, PluginManifest, TestCase, ToolSchemaFile, validate_name};

pub const MANIFEST_FILE: &str = "manifest.yaml";
pub const CODE_FILE: &str = "tool.py";
pub const TESTS_FILE: &str = "tests.yaml";
pub const SCHEMA_FILE: &str = "schema.yaml";
pub const STATE_FILE: &str = "state.yaml";
pub const SCRIPTS_DIR: &str = "scripts";

const STAGING_DIR: &str = ".staging";
const ERRORS_DIR: &str = "errors";
const VERSIONS_DIR: &str = "versions";

/// `state.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactState {
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ArtifactState {
    pub fn new(state: LifecycleState) -> Self {
        Self {
            state,
            reason: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// State assumed for hand-placed artifacts without a `state.yaml`.
    fn implied_by(membership: Membership) -> Self {
        let state = match membership {
            Membership::Pending => LifecycleState::PendingReview,
            Membership::Available => LifecycleState::Enabled,
            Membership::Failed => LifecycleState::Rejected,
        };
        Self::new(state)
    }
}

/// The files making up one artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactFiles {
    pub manifest: PluginManifest,
    pub code: String,
    pub tests: Vec<TestCase>,
    pub schema: Option<ToolSchemaFile>,
    /// Helper modules from `scripts/`, sorted by file name.
    pub scripts: Vec<HelperScript>,
}

/// One `scripts/*.py` helper module.
#[derive(Debug, Clone, PartialEq)]
pub struct HelperScript {
    pub file_name: String,
    pub code: String,
}

impl ArtifactFiles {
    /// Read an artifact directory. `manifest.yaml` and `tool.py` are
    /// required; tests, schema and helper scripts are optional.
    pub async fn read_dir(dir: &Path) -> Result<Self, StoreError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = read_string(&manifest_path).await?;
        let manifest = PluginManifest::from_yaml(&raw).map_err(|e| corrupt(&manifest_path, e))?;

        let code = read_string(&dir.join(CODE_FILE)).await?;

        let tests_path = dir.join(TESTS_FILE);
        let tests = match read_optional(&tests_path).await? {
            Some(raw) => TestCase::list_from_yaml(&raw).map_err(|e| corrupt(&tests_path, e))?,
            None => Vec::new(),
        };

        let schema_path = dir.join(SCHEMA_FILE);
        let schema = match read_optional(&schema_path).await? {
            Some(raw) => Some(serde_yml::from_str(&raw).map_err(|e| corrupt(&schema_path, e))?),
            None => None,
        };

        let scripts = read_scripts(&dir.join(SCRIPTS_DIR)).await?;

        Ok(Self {
            manifest,
            code,
            tests,
            schema,
            scripts,
        })
    }
}

async fn read_scripts(dir: &Path) -> Result<Vec<HelperScript>, StoreError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut scripts = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::io(dir, e))? {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "py") || !path.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let code = read_string(&path).await?;
        scripts.push(HelperScript { file_name, code });
    }
    scripts.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(scripts)
}

/// An artifact as loaded from its membership directory.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub membership: Membership,
    pub dir: PathBuf,
    pub files: ArtifactFiles,
    pub state: ArtifactState,
}

pub struct PluginStore {
    root: PathBuf,
}

impl PluginStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.root.join(VERSIONS_DIR)
    }

    /// Create the directory layout. Leftovers in `.staging/` from an
    /// interrupted write are discarded.
    pub async fn init(&self) -> Result<(), StoreError> {
        let staging = self.root.join(STAGING_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .await
                .map_err(|e| StoreError::io(&staging, e))?;
        }

        let mut dirs: Vec<PathBuf> = Membership::ALL
            .iter()
            .map(|m| self.root.join(m.dir_name()))
            .collect();
        dirs.extend([staging, self.root.join(ERRORS_DIR), self.versions_dir()]);
        for dir in dirs {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    pub fn artifact_dir(&self, membership: Membership, name: &str) -> PathBuf {
        self.root.join(membership.dir_name()).join(name)
    }

    /// The membership set currently holding `name`.
    pub fn find(&self, name: &str) -> Option<Membership> {
        if validate_name(name).is_err() {
            return None;
        }
        Membership::ALL
            .into_iter()
            .find(|m| self.artifact_dir(*m, name).is_dir())
    }

    /// Names in one membership set, sorted.
    pub async fn names(&self, membership: Membership) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(membership.dir_name());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_dir && validate_name(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Write a brand-new artifact into `membership`.
    pub async fn create(
        &self,
        membership: Membership,
        files: &ArtifactFiles,
        state: &ArtifactState,
    ) -> Result<PathBuf, StoreError> {
        let name = files.manifest.name.as_str();
        if validate_name(name).is_err() {
            return Err(StoreError::InvalidName {
                name: name.to_string(),
            });
        }
        if let Some(existing) = self.find(name) {
            return Err(StoreError::AlreadyExists {
                name: name.to_string(),
                membership: existing.to_string(),
            });
        }

        let staging = self
            .root
            .join(STAGING_DIR)
            .join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&staging)
            .await
            .map_err(|e| StoreError::io(&staging, e))?;

        let written = async {
            write_yaml(&staging.join(MANIFEST_FILE), &files.manifest, "manifest").await?;
            write_atomic(&staging.join(CODE_FILE), files.code.as_bytes()).await?;
            write_yaml(&staging.join(TESTS_FILE), &files.tests, "tests").await?;
            if let Some(schema) = &files.schema {
                write_yaml(&staging.join(SCHEMA_FILE), schema, "schema").await?;
            }
            if !files.scripts.is_empty() {
                let scripts_dir = staging.join(SCRIPTS_DIR);
                fs::create_dir_all(&scripts_dir)
                    .await
                    .map_err(|e| StoreError::io(&scripts_dir, e))?;
                for script in &files.scripts {
                    write_atomic(&scripts_dir.join(&script.file_name), script.code.as_bytes()).await?;
                }
            }
            write_yaml(&staging.join(STATE_FILE), state, "state").await
        }
        .await;

        let target = self.artifact_dir(membership, name);
        let placed = match written {
            Ok(()) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| StoreError::io(parent, e))?;
                }
                fs::rename(&staging, &target)
                    .await
                    .map_err(|e| StoreError::io(&target, e))
            }
            Err(e) => Err(e),
        };

        if placed.is_err() && staging.exists() {
            if let Err(e) = fs::remove_dir_all(&staging).await {
                tracing::warn!("Failed to clean staging dir {}: {}", staging.display(), e);
            }
        }
        placed?;

        tracing::debug!(name = %name, membership = %membership, "Stored new artifact");
        Ok(target)
    }

    pub async fn load(&self, membership: Membership, name: &str) -> Result<StoredArtifact, StoreError> {
        let dir = self.artifact_dir(membership, name);
        let files = ArtifactFiles::read_dir(&dir).await?;

        let state_path = dir.join(STATE_FILE);
        let state = match read_optional(&state_path).await? {
            Some(raw) => serde_yml::from_str(&raw).map_err(|e| corrupt(&state_path, e))?,
            None => ArtifactState::implied_by(membership),
        };

        Ok(StoredArtifact {
            membership,
            dir,
            files,
            state,
        })
    }

    /// Move an artifact between membership sets.
    pub async fn move_to(&self, name: &str, from: Membership, to: Membership) -> Result<PathBuf, StoreError> {
        let source = self.artifact_dir(from, name);
        let target = self.artifact_dir(to, name);
        if target.exists() {
            return Err(StoreError::AlreadyExists {
                name: name.to_string(),
                membership: to.to_string(),
            });
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        fs::rename(&source, &target)
            .await
            .map_err(|e| StoreError::io(&source, e))?;
        tracing::debug!(name = %name, from = %from, to = %to, "Moved artifact");
        Ok(target)
    }

    pub async fn write_code(&self, membership: Membership, name: &str, code: &str) -> Result<(), StoreError> {
        write_atomic(&self.artifact_dir(membership, name).join(CODE_FILE), code.as_bytes()).await
    }

    pub async fn write_manifest(
        &self,
        membership: Membership,
        manifest: &PluginManifest,
    ) -> Result<(), StoreError> {
        let path = self.artifact_dir(membership, &manifest.name).join(MANIFEST_FILE);
        write_yaml(&path, manifest, "manifest").await
    }

    pub async fn write_state(
        &self,
        membership: Membership,
        name: &str,
        state: &ArtifactState,
    ) -> Result<(), StoreError> {
        let path = self.artifact_dir(membership, name).join(STATE_FILE);
        write_yaml(&path, state, "state").await
    }

    // ── failure records ──

    fn errors_path(&self, name: &str) -> PathBuf {
        self.root.join(ERRORS_DIR).join(format!("{name}.json"))
    }

    /// Failure records for `name`, oldest first.
    pub async fn failures(&self, name: &str) -> Result<Vec<FailureRecord>, StoreError> {
        let path = self.errors_path(name);
        match read_optional(&path).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| corrupt(&path, e)),
            None => Ok(Vec::new()),
        }
    }

    pub async fn append_failure(&self, record: &FailureRecord) -> Result<(), StoreError> {
        let mut records = self.failures(&record.tool_name).await?;
        records.push(record.clone());

        let path = self.errors_path(&record.tool_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        let body = serde_json::to_vec_pretty(&records).map_err(|e| StoreError::Serialize {
            what: "failure records".to_string(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, &body).await
    }

    pub async fn clear_failures(&self, name: &str) -> Result<(), StoreError> {
        let path = self.errors_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    pub async fn last_failure(&self, name: &str) -> Result<Option<FailureRecord>, StoreError> {
        Ok(self.failures(name).await?.pop())
    }

    pub async fn failure_count(&self, name: &str) -> Result<usize, StoreError> {
        Ok(self.failures(name).await?.len())
    }
}

async fn read_string(path: &Path) -> Result<String, StoreError> {
    fs::read_to_string(path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Replace `path` with `body` via a sibling temp file and rename.
async fn write_atomic(path: &Path, body: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    fs::write(&tmp, body)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

async fn write_yaml<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<(), StoreError> {
    let body = serde_yml::to_string(value).map_err(|e| StoreError::Serialize {
        what: what.to_string(),
        reason: e.to_string(),
    })?;
    write_atomic(path, body.as_bytes()).await
}

fn corrupt(path: &Path, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}
