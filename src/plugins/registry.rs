//! Plugin registry: the lifecycle state machine over the store.
//!
//! This is the only component that adds or removes live capabilities in
//! the [`ToolRegistry`] and [`HookBus`]. Every mutation runs under one
//! registry-wide lock, so no two callers race an artifact between
//! membership sets.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::PluginsConfig;
use crate::error::PluginError;
use crate::hooks::HookBus;
use crate::plugins::lifecycle::{Action, LifecycleState, Membership};
use crate::plugins::loader::{self, LoadedPlugin};
use crate::plugins::manifest::{
    FailureKind, FailureRecord, PluginManifest, TestCase, ToolSchemaFile, TrustLevel, validate_name,
};
use crate::plugins::runner::{LOAD_RESULT, PRESENCE_RESULT, TestRun, TestRunner};
use crate::plugins::store::{ArtifactFiles, ArtifactState, PluginStore, StoredArtifact};
use crate::plugins::validator::CodeValidator;
use crate::plugins::versions::{VersionInfo, VersionStore};
use crate::tools::{ToolError, ToolRegistry};

/// A candidate artifact proposed by the agent.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's keyword arguments.
    pub parameters: serde_json::Value,
    pub code: String,
    pub tests: Vec<TestCase>,
}

#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// Static checks failed. Nothing was persisted.
    ValidationFailed { issues: Vec<String> },
    /// Tests failed. The artifact waits in review with failure attempt 1.
    TestsFailed {
        run: TestRun,
        failure: Option<FailureRecord>,
    },
    PendingReview { version: String },
    Enabled { version: String },
}

impl CreateOutcome {
    pub fn state(&self) -> LifecycleState {
        match self {
            CreateOutcome::ValidationFailed { .. } => LifecycleState::ValidationFailed,
            CreateOutcome::TestsFailed { .. } | CreateOutcome::PendingReview { .. } => {
                LifecycleState::PendingReview
            }
            CreateOutcome::Enabled { .. } => LifecycleState::Enabled,
        }
    }
}

#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Updated { version: String },
    ValidationFailed { issues: Vec<String>, attempt: u32 },
    TestsFailed {
        run: TestRun,
        attempt: u32,
        failure: Option<FailureRecord>,
    },
    /// The fix-attempt cap is reached; a human must approve, roll back or
    /// reset before more fixes are accepted.
    NeedsManualIntervention { attempts: usize, max_attempts: u32 },
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: String,
    pub trust_level: TrustLevel,
    pub state: LifecycleState,
    pub enabled: bool,
    pub status: Membership,
    pub tool_count: usize,
}

impl PluginSummary {
    fn from_artifact(artifact: &StoredArtifact) -> Self {
        let manifest = &artifact.files.manifest;
        Self {
            name: manifest.name.clone(),
            description: manifest.description.clone(),
            version: manifest.version.clone(),
            author: manifest.author.clone(),
            trust_level: manifest.trust_level,
            state: artifact.state.state,
            enabled: artifact.state.state.is_live(),
            status: artifact.membership,
            tool_count: loader::tool_definitions(manifest, artifact.files.schema.as_ref()).len(),
        }
    }
}

/// Review-queue entry, including the code under review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingPlugin {
    pub name: String,
    pub description: String,
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
    pub trust_level: TrustLevel,
    pub tool_count: usize,
    pub code: String,
    pub path: PathBuf,
    pub failure_count: usize,
}

/// Result of installing an operator-authored artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstallOutcome {
    pub name: String,
    pub trust_level: TrustLevel,
    pub tool_count: usize,
}

pub struct PluginRegistry {
    config: PluginsConfig,
    store: PluginStore,
    versions: VersionStore,
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookBus>,
    lock: Mutex<()>,
}

impl PluginRegistry {
    /// Open the store under `config.dir`, creating its layout.
    pub async fn open(
        config: PluginsConfig,
        tools: Arc<ToolRegistry>,
        hooks: Arc<HookBus>,
    ) -> Result<Self, PluginError> {
        let store = PluginStore::new(&config.dir);
        store.init().await?;
        let versions = VersionStore::new(store.versions_dir());
        Ok(Self {
            config,
            store,
            versions,
            tools,
            hooks,
            lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &PluginsConfig {
        &self.config
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    fn runner(&self, trust: TrustLevel) -> TestRunner {
        TestRunner::new(self.config.test_timeout(), trust.policy(self.config.max_steps))
    }

    fn check_size(&self, code: &str) -> Result<(), PluginError> {
        if code.len() > self.config.max_code_size_bytes {
            return Err(PluginError::CodeTooLarge {
                size: code.len(),
                max: self.config.max_code_size_bytes,
            });
        }
        Ok(())
    }

    // ── creation ────────────────────────────────────────────────────────

    /// Vet, test and store agent-generated code.
    pub async fn create(&self, request: CreateRequest) -> Result<CreateOutcome, PluginError> {
        if !self.config.allow_generated {
            return Err(PluginError::GenerationDisabled);
        }
        validate_name(&request.name).map_err(|reason| PluginError::InvalidName {
            name: request.name.clone(),
            reason,
        })?;
        self.check_size(&request.code)?;

        let _guard = self.lock.lock().await;
        if self.store.find(&request.name).is_some() {
            return Err(PluginError::AlreadyExists { name: request.name });
        }

        let manifest = PluginManifest::generated(&request.name, &request.description, request.parameters);
        self.ensure_names_free(&request.name, &declared_tool_names(&manifest, None))
            .await?;
        let mut issues = manifest.lint();
        issues.extend(CodeValidator::for_trust(manifest.trust_level).validate(&request.code).issues);
        if !issues.is_empty() {
            tracing::info!(name = %request.name, issues = issues.len(), "Rejected generated code");
            return Ok(CreateOutcome::ValidationFailed { issues });
        }

        let run = self
            .runner(manifest.trust_level)
            .run_tests(&request.code, &request.tests, &request.name)
            .await;

        let mut files = ArtifactFiles {
            schema: manifest.tools.first().map(ToolSchemaFile::from),
            manifest,
            code: request.code,
            tests: request.tests,
            scripts: Vec::new(),
        };

        if !run.all_passed {
            let failure = failure_from_run(&files.manifest.name, &run, 1, self.config.max_fix_attempts);
            self.store
                .create(
                    Membership::Pending,
                    &files,
                    &ArtifactState::new(LifecycleState::PendingReview),
                )
                .await?;
            if let Some(record) = &failure {
                self.store.append_failure(record).await?;
            }
            tracing::info!(name = %files.manifest.name, "Tests failed, artifact held for review");
            return Ok(CreateOutcome::TestsFailed { run, failure });
        }

        let name = files.manifest.name.clone();
        let version = self.versions.save(&name, &files.code, &files.manifest).await?;
        files.manifest.version = version.clone();
        files.manifest.updated_at = Some(Utc::now());

        if self.config.auto_approve && files.manifest.trust_level == TrustLevel::Sandbox {
            let loaded = loader::load_plugin(&files, &self.config)?;
            self.store
                .create(
                    Membership::Available,
                    &files,
                    &ArtifactState::new(LifecycleState::Enabled),
                )
                .await?;
            self.register(&name, loaded).await?;
            tracing::info!(name = %name, version = %version, "Created and enabled artifact");
            Ok(CreateOutcome::Enabled { version })
        } else {
            self.store
                .create(
                    Membership::Pending,
                    &files,
                    &ArtifactState::new(LifecycleState::PendingReview),
                )
                .await?;
            tracing::info!(name = %name, version = %version, "Created artifact pending review");
            Ok(CreateOutcome::PendingReview { version })
        }
    }

    /// Copy an operator-authored artifact directory into the review queue.
    /// Auto-approval never applies.
    pub async fn install(&self, source: &Path) -> Result<InstallOutcome, PluginError> {
        let source = expand_home(source);
        if !source.is_dir() {
            return Err(PluginError::Load {
                name: source.display().to_string(),
                reason: "source is not a directory".to_string(),
            });
        }

        let files = ArtifactFiles::read_dir(&source).await?;
        let manifest = &files.manifest;
        validate_name(&manifest.name).map_err(|reason| PluginError::InvalidName {
            name: manifest.name.clone(),
            reason,
        })?;
        let problems = manifest.lint();
        if !problems.is_empty() {
            return Err(PluginError::InvalidManifest {
                name: manifest.name.clone(),
                reason: problems.join("; "),
            });
        }
        self.check_size(&files.code)?;

        let _guard = self.lock.lock().await;
        if self.store.find(&manifest.name).is_some() {
            return Err(PluginError::AlreadyExists {
                name: manifest.name.clone(),
            });
        }
        self.ensure_names_free(
            &manifest.name,
            &declared_tool_names(manifest, files.schema.as_ref()),
        )
        .await?;
        self.store
            .create(
                Membership::Pending,
                &files,
                &ArtifactState::new(LifecycleState::PendingReview),
            )
            .await?;

        let outcome = InstallOutcome {
            name: manifest.name.clone(),
            trust_level: manifest.trust_level,
            tool_count: loader::tool_definitions(manifest, files.schema.as_ref()).len(),
        };
        tracing::info!(
            name = %outcome.name,
            trust = %outcome.trust_level,
            source = %source.display(),
            "Installed artifact for review"
        );
        Ok(outcome)
    }

    // ── review ──────────────────────────────────────────────────────────

    /// Move a pending artifact to available and enable it.
    pub async fn approve(&self, name: &str) -> Result<(), PluginError> {
        let _guard = self.lock.lock().await;
        let artifact = self.locate(name).await?;
        check(Action::Approve, name, artifact.state.state)?;

        if artifact.files.manifest.trust_level == TrustLevel::Local {
            tracing::warn!(
                name = %name,
                "Approving local-trust plugin, it will have clock and environment access"
            );
        }

        // Compile before moving so a broken artifact stays in review.
        let loaded = loader::load_plugin(&artifact.files, &self.config)?;
        self.ensure_names_free(name, &loaded.tool_names()).await?;

        if self.versions.latest(name).await?.is_none() {
            self.versions
                .save(name, &artifact.files.code, &artifact.files.manifest)
                .await?;
        }

        let next = ArtifactState::new(Action::Approve.target(artifact.state.state));
        self.relocate(name, Membership::Pending, Membership::Available, &artifact.state, &next)
            .await?;
        if let Err(e) = self.store.clear_failures(name).await {
            tracing::warn!(name = %name, "Failed to clear failure records: {}", e);
        }
        self.register(name, loaded).await?;

        tracing::info!(name = %name, "Approved artifact");
        Ok(())
    }

    pub async fn reject(&self, name: &str, reason: &str) -> Result<(), PluginError> {
        let _guard = self.lock.lock().await;
        let artifact = self.locate(name).await?;
        check(Action::Reject, name, artifact.state.state)?;

        let mut state = ArtifactState::new(Action::Reject.target(artifact.state.state));
        if !reason.is_empty() {
            state = state.with_reason(reason);
        }
        self.relocate(name, Membership::Pending, Membership::Failed, &artifact.state, &state)
            .await?;

        tracing::info!(name = %name, reason = %reason, "Rejected artifact");
        Ok(())
    }

    // ── live toggles ────────────────────────────────────────────────────

    pub async fn enable(&self, name: &str) -> Result<(), PluginError> {
        let _guard = self.lock.lock().await;
        let artifact = self.locate(name).await?;
        check(Action::Enable, name, artifact.state.state)?;

        let loaded = loader::load_plugin(&artifact.files, &self.config)?;
        self.ensure_names_free(name, &loaded.tool_names()).await?;
        self.store
            .write_state(
                Membership::Available,
                name,
                &ArtifactState::new(LifecycleState::Enabled),
            )
            .await?;
        self.register(name, loaded).await
    }

    pub async fn disable(&self, name: &str) -> Result<(), PluginError> {
        let _guard = self.lock.lock().await;
        let artifact = self.locate(name).await?;
        check(Action::Disable, name, artifact.state.state)?;

        self.store
            .write_state(
                Membership::Available,
                name,
                &ArtifactState::new(LifecycleState::Disabled),
            )
            .await?;
        self.unregister(name).await;
        Ok(())
    }

    // ── code changes ────────────────────────────────────────────────────

    /// Restore the code and manifest of `label` into the live slot. History
    /// is left untouched.
    pub async fn rollback(&self, name: &str, label: &str) -> Result<(), PluginError> {
        let _guard = self.lock.lock().await;
        let artifact = self.locate(name).await?;
        check(Action::Rollback, name, artifact.state.state)?;

        let (code, manifest) = self
            .versions
            .get_version(name, label)
            .await?
            .ok_or_else(|| PluginError::VersionNotFound {
                name: name.to_string(),
                label: label.to_string(),
            })?;

        let report = CodeValidator::for_trust(manifest.trust_level).validate(&code);
        if !report.accepted {
            return Err(PluginError::RollbackRejected {
                name: name.to_string(),
                label: label.to_string(),
                issues: report.issues,
            });
        }

        let files = ArtifactFiles {
            manifest,
            code,
            tests: artifact.files.tests,
            schema: artifact.files.schema,
            scripts: artifact.files.scripts,
        };
        let loaded = if artifact.state.state.is_live() {
            Some(loader::load_plugin(&files, &self.config)?)
        } else {
            None
        };
        if let Some(loaded) = &loaded {
            self.ensure_names_free(name, &loaded.tool_names()).await?;
        }

        self.store
            .write_code(Membership::Available, name, &files.code)
            .await?;
        self.store
            .write_manifest(Membership::Available, &files.manifest)
            .await?;
        self.store.clear_failures(name).await?;
        if let Some(loaded) = loaded {
            self.register(name, loaded).await?;
        }

        tracing::info!(name = %name, label = %label, "Rolled back artifact");
        Ok(())
    }

    /// Apply a fix to a pending or available artifact.
    ///
    /// Once the failure count reaches `max_fix_attempts` the fix is refused
    /// outright, before any validation or test work.
    pub async fn update_code(&self, name: &str, code: &str) -> Result<UpdateOutcome, PluginError> {
        let _guard = self.lock.lock().await;
        let artifact = self.locate(name).await?;
        check(Action::UpdateCode, name, artifact.state.state)?;

        let attempts = self.store.failure_count(name).await?;
        let max_attempts = self.config.max_fix_attempts;
        if attempts >= max_attempts as usize {
            tracing::info!(name = %name, attempts, "Fix refused, attempt cap reached");
            return Ok(UpdateOutcome::NeedsManualIntervention {
                attempts,
                max_attempts,
            });
        }
        self.check_size(code)?;

        let attempt = attempts as u32 + 1;
        let mut manifest = artifact.files.manifest;
        let report = CodeValidator::for_trust(manifest.trust_level).validate(code);
        if !report.accepted {
            let record = failure_from_issues(name, &report.issues, attempt, max_attempts);
            self.store.append_failure(&record).await?;
            return Ok(UpdateOutcome::ValidationFailed {
                issues: report.issues,
                attempt,
            });
        }

        let tests = artifact.files.tests;
        if !tests.is_empty() {
            let helpers = loader::helper_programs(name, &artifact.files.scripts, manifest.trust_level);
            let run = self
                .runner(manifest.trust_level)
                .run_tests_with_helpers(code, &helpers, &tests, name)
                .await;
            if !run.all_passed {
                let failure = failure_from_run(name, &run, attempt, max_attempts);
                if let Some(record) = &failure {
                    self.store.append_failure(record).await?;
                }
                tracing::info!(name = %name, attempt, "Fix failed its tests");
                return Ok(UpdateOutcome::TestsFailed {
                    run,
                    attempt,
                    failure,
                });
            }
        }

        let version = self.versions.save(name, code, &manifest).await?;
        manifest.version = version.clone();
        manifest.updated_at = Some(Utc::now());

        let files = ArtifactFiles {
            manifest,
            code: code.to_string(),
            tests,
            schema: artifact.files.schema,
            scripts: artifact.files.scripts,
        };
        let loaded = if artifact.state.state.is_live() {
            Some(loader::load_plugin(&files, &self.config)?)
        } else {
            None
        };
        if let Some(loaded) = &loaded {
            self.ensure_names_free(name, &loaded.tool_names()).await?;
        }

        self.store
            .write_code(artifact.membership, name, code)
            .await?;
        self.store
            .write_manifest(artifact.membership, &files.manifest)
            .await?;
        self.store.clear_failures(name).await?;
        if let Some(loaded) = loaded {
            self.register(name, loaded).await?;
        }

        tracing::info!(name = %name, version = %version, "Updated artifact code");
        Ok(UpdateOutcome::Updated { version })
    }

    /// Human action clearing the failure record so fixes are accepted again.
    pub async fn reset_attempts(&self, name: &str) -> Result<(), PluginError> {
        let _guard = self.lock.lock().await;
        let artifact = self.locate(name).await?;
        check(Action::ResetAttempts, name, artifact.state.state)?;
        self.store.clear_failures(name).await?;
        tracing::info!(name = %name, "Reset fix attempts");
        Ok(())
    }

    // ── startup ─────────────────────────────────────────────────────────

    /// Register every enabled artifact. Artifacts that fail to load are
    /// skipped with a warning. Returns the names registered.
    pub async fn load_all(&self) -> Vec<String> {
        let _guard = self.lock.lock().await;
        let names = match self.store.names(Membership::Available).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!("Failed to list available plugins: {}", e);
                return Vec::new();
            }
        };

        let mut loaded_names = Vec::new();
        for name in names {
            let artifact = match self.store.load(Membership::Available, &name).await {
                Ok(artifact) => artifact,
                Err(e) => {
                    tracing::warn!(name = %name, "Skipping unreadable plugin: {}", e);
                    continue;
                }
            };
            if !artifact.state.state.is_live() {
                continue;
            }
            let registered = match loader::load_plugin(&artifact.files, &self.config) {
                Ok(loaded) => self.register(&name, loaded).await,
                Err(e) => Err(e),
            };
            match registered {
                Ok(()) => loaded_names.push(name),
                Err(e) => tracing::warn!(name = %name, "Skipping plugin: {}", e),
            }
        }

        tracing::info!(count = loaded_names.len(), "Loaded enabled plugins");
        loaded_names
    }

    // ── introspection ───────────────────────────────────────────────────

    /// Available artifacts, plus pending ones when asked.
    pub async fn list(&self, include_pending: bool) -> Vec<PluginSummary> {
        let mut sets = vec![Membership::Available];
        if include_pending {
            sets.push(Membership::Pending);
        }

        let mut summaries = Vec::new();
        for membership in sets {
            for artifact in self.read_set(membership).await {
                summaries.push(PluginSummary::from_artifact(&artifact));
            }
        }
        summaries
    }

    pub async fn list_pending(&self) -> Vec<PendingPlugin> {
        let mut pending = Vec::new();
        for artifact in self.read_set(Membership::Pending).await {
            let manifest = &artifact.files.manifest;
            pending.push(PendingPlugin {
                name: manifest.name.clone(),
                description: manifest.description.clone(),
                author: manifest.author.clone(),
                created_at: manifest.created_at,
                trust_level: manifest.trust_level,
                tool_count: loader::tool_definitions(manifest, artifact.files.schema.as_ref()).len(),
                code: artifact.files.code.clone(),
                path: artifact.dir.clone(),
                failure_count: self.failure_count(&manifest.name).await,
            });
        }
        pending
    }

    pub async fn get(&self, name: &str) -> Option<StoredArtifact> {
        let membership = self.store.find(name)?;
        match self.store.load(membership, name).await {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                tracing::warn!(name = %name, "Failed to read plugin: {}", e);
                None
            }
        }
    }

    pub async fn state(&self, name: &str) -> Option<LifecycleState> {
        self.get(name).await.map(|artifact| artifact.state.state)
    }

    pub async fn last_failure(&self, name: &str) -> Option<FailureRecord> {
        match self.store.last_failure(name).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(name = %name, "Failed to read failure records: {}", e);
                None
            }
        }
    }

    pub async fn failure_count(&self, name: &str) -> usize {
        match self.store.failure_count(name).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(name = %name, "Failed to read failure records: {}", e);
                0
            }
        }
    }

    pub async fn versions(&self, name: &str) -> Result<Vec<VersionInfo>, PluginError> {
        Ok(self.versions.list_versions(name).await?)
    }

    // ── internals ───────────────────────────────────────────────────────

    async fn locate(&self, name: &str) -> Result<StoredArtifact, PluginError> {
        let membership = self.store.find(name).ok_or_else(|| PluginError::NotFound {
            name: name.to_string(),
        })?;
        Ok(self.store.load(membership, name).await?)
    }

    async fn read_set(&self, membership: Membership) -> Vec<StoredArtifact> {
        let names = match self.store.names(membership).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(membership = %membership, "Failed to list plugins: {}", e);
                return Vec::new();
            }
        };
        let mut artifacts = Vec::new();
        for name in names {
            match self.store.load(membership, &name).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => tracing::warn!(name = %name, "Skipping unreadable plugin: {}", e),
            }
        }
        artifacts
    }

    /// Write `next` into the artifact's current slot, then move it. A failed
    /// move puts `previous` back so the artifact stays where it was.
    async fn relocate(
        &self,
        name: &str,
        from: Membership,
        to: Membership,
        previous: &ArtifactState,
        next: &ArtifactState,
    ) -> Result<(), PluginError> {
        self.store.write_state(from, name, next).await?;
        if let Err(e) = self.store.move_to(name, from, to).await {
            if let Err(restore) = self.store.write_state(from, name, previous).await {
                tracing::warn!(name = %name, "Failed to restore state after a failed move: {}", restore);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Refuse tool names the host or another artifact already holds.
    async fn ensure_names_free(&self, owner: &str, tools: &[String]) -> Result<(), PluginError> {
        for tool in tools {
            if let Some(holder) = self.tools.holder_of(tool, owner).await {
                return Err(PluginError::ToolNameTaken {
                    name: owner.to_string(),
                    tool: tool.clone(),
                    holder,
                });
            }
        }
        Ok(())
    }

    /// Replace whatever `name` had registered with `loaded`. On a tool name
    /// conflict the previous registration stays in place.
    async fn register(&self, name: &str, loaded: LoadedPlugin) -> Result<(), PluginError> {
        let tool_count = loaded.tools.len();
        let hook_count = loaded.hooks.len();
        self.tools
            .replace_owned(name, loaded.tools)
            .await
            .map_err(|e| match e {
                ToolError::NameTaken { name: tool, holder } => PluginError::ToolNameTaken {
                    name: name.to_string(),
                    tool,
                    holder,
                },
                other => PluginError::Load {
                    name: name.to_string(),
                    reason: other.to_string(),
                },
            })?;
        self.hooks.unregister_by_source(&loader::hook_source(name));
        for hook in loaded.hooks {
            self.hooks.register(hook);
        }
        tracing::debug!(name = %name, tools = tool_count, hooks = hook_count, "Registered plugin");
        Ok(())
    }

    async fn unregister(&self, name: &str) {
        self.tools.unregister_owner(name).await;
        self.hooks.unregister_by_source(&loader::hook_source(name));
    }
}

fn check(action: Action, name: &str, state: LifecycleState) -> Result<(), PluginError> {
    if action.permits(state) {
        Ok(())
    } else {
        Err(PluginError::InvalidTransition {
            name: name.to_string(),
            action: action.as_str().to_string(),
            state: state.to_string(),
        })
    }
}

fn declared_tool_names(manifest: &PluginManifest, schema: Option<&ToolSchemaFile>) -> Vec<String> {
    loader::tool_definitions(manifest, schema)
        .into_iter()
        .map(|def| def.name)
        .collect()
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Failure record for the first failing result of a run.
fn failure_from_run(name: &str, run: &TestRun, attempt: u32, max_attempts: u32) -> Option<FailureRecord> {
    let failed = run.first_failure()?;
    let message = failed
        .error
        .clone()
        .unwrap_or_else(|| "Test failed".to_string());
    let kind = match failed.name.as_str() {
        LOAD_RESULT if message.contains("Syntax error") => FailureKind::Syntax,
        LOAD_RESULT | PRESENCE_RESULT => FailureKind::Runtime,
        _ if failed.traceback.is_some() || run.timed_out => FailureKind::Runtime,
        _ => FailureKind::TestFailure,
    };
    let expected_output = if failed.name == LOAD_RESULT || failed.name == PRESENCE_RESULT {
        None
    } else {
        failed.expected.clone()
    };

    Some(FailureRecord {
        tool_name: name.to_string(),
        kind,
        message,
        traceback: failed.traceback.clone().unwrap_or_default(),
        input_args: failed.input.clone(),
        expected_output,
        actual_output: failed.output.clone(),
        attempt_number: attempt,
        max_attempts,
        timestamp: Utc::now(),
    })
}

fn failure_from_issues(name: &str, issues: &[String], attempt: u32, max_attempts: u32) -> FailureRecord {
    let kind = if issues.len() == 1 && issues[0].starts_with("Syntax error") {
        FailureKind::Syntax
    } else {
        FailureKind::Validation
    };
    FailureRecord {
        tool_name: name.to_string(),
        kind,
        message: format!("Code validation failed: {}", issues.join(", ")),
        traceback: String::new(),
        input_args: serde_json::Map::new(),
        expected_output: None,
        actual_output: None,
        attempt_number: attempt,
        max_attempts,
        timestamp: Utc::now(),
    }
}
