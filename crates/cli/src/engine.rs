use crate::artifact_cache::ArtifactCache;
use crate::config::EngineConfig;
use crate::context::AppContext;
use crate::error::{GenerationError, GenerationResult};
use crate::metrics::EngineMetrics;
use crate::selection_key::SelectionKey;
use crate::session::{ProjectSession, ProjectSpec};
use crate::worker::render_in_worker;
use codeprompt_assembler::RenderJob;
use codeprompt_indexer::RefreshLimiter;
use codeprompt_protocol::{uses_clipboard, CachedArtifact, TemplateProvider};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// One generation (or precompute) request from the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationRequest {
    pub selection: Vec<String>,
    /// Template name, resolved through the engine's template provider.
    pub template: String,
    pub clipboard: String,
    /// Result goes to the clipboard instead of the output sink.
    pub to_clipboard: bool,
}

/// A validated request bound to the session it was validated against.
#[derive(Clone)]
pub struct PreparedRequest {
    pub session: Arc<ProjectSession>,
    /// Sorted and deduplicated.
    pub selection: Vec<String>,
    pub template_name: String,
    pub template: String,
    pub clipboard: String,
    pub to_clipboard: bool,
    pub key: SelectionKey,
}

#[derive(Debug, Clone)]
pub struct RenderedArtifact {
    pub artifact: Arc<CachedArtifact>,
    pub offloaded: bool,
}

/// Owns the active project session and everything shared between the
/// precompute loop and the dispatcher.
pub struct Engine {
    context: Arc<AppContext>,
    config: EngineConfig,
    templates: Arc<dyn TemplateProvider>,
    limiter: RefreshLimiter,
    session: RwLock<Option<Arc<ProjectSession>>>,
    artifacts: ArtifactCache,
    metrics: EngineMetrics,
    worker_exe: Option<PathBuf>,
}

impl Engine {
    pub fn new(
        context: Arc<AppContext>,
        config: EngineConfig,
        templates: Arc<dyn TemplateProvider>,
    ) -> Self {
        let artifacts = ArtifactCache::new(
            config.artifact_cache_capacity,
            context.instance_id(),
            config.cache_expiry(),
        );
        Self {
            limiter: RefreshLimiter::new(config.refresh_concurrency),
            context,
            config,
            templates,
            session: RwLock::new(None),
            artifacts,
            metrics: EngineMetrics::default(),
            worker_exe: None,
        }
    }

    /// Enable process offload for large selections, using `exe` as the
    /// `render-worker` binary.
    #[must_use]
    pub fn with_worker_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.worker_exe = Some(exe.into());
        self
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn artifacts(&self) -> &ArtifactCache {
        &self.artifacts
    }

    pub fn limiter(&self) -> &RefreshLimiter {
        &self.limiter
    }

    /// Scan `spec` and make it the active project. Cached prompts of the
    /// previous project are dropped.
    pub async fn open_project(&self, spec: ProjectSpec) -> GenerationResult<Arc<ProjectSession>> {
        let session = ProjectSession::open(spec, &self.config, self.limiter.clone()).await?;
        *self
            .session
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(session.clone());
        self.artifacts.clear();
        self.artifacts.remove_mirror();
        info!("Active project: {} ({})", session.name(), session.root().display());
        Ok(session)
    }

    pub fn active_session(&self) -> GenerationResult<Arc<ProjectSession>> {
        self.session
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or(GenerationError::NoActiveProject)
    }

    /// Template body by name; missing or blank bodies are rejected.
    pub fn template(&self, name: &str) -> GenerationResult<String> {
        match self.templates.template_content(name) {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(GenerationError::InvalidTemplate(name.to_string())),
        }
    }

    /// Validate `request` and compute its key. Nothing is read or rendered.
    pub fn prepare(&self, request: &GenerationRequest) -> GenerationResult<PreparedRequest> {
        let session = self.active_session()?;
        if !session.root().is_dir() {
            return Err(GenerationError::InvalidProjectPath(session.root().to_path_buf()));
        }
        let template = self.template(&request.template)?;

        let mut selection = request.selection.clone();
        selection.sort();
        selection.dedup();
        if selection.is_empty() && !uses_clipboard(&template) {
            return Err(GenerationError::EmptySelection);
        }
        if selection.len() > self.config.max_files {
            return Err(GenerationError::SelectionTooLarge {
                selected: selection.len(),
                max: self.config.max_files,
            });
        }

        let key = SelectionKey::compute(
            session.name(),
            session.root(),
            &selection,
            &request.template,
            &template,
            &request.clipboard,
        );
        Ok(PreparedRequest {
            session,
            selection,
            template_name: request.template.clone(),
            template,
            clipboard: request.clipboard.clone(),
            to_clipboard: request.to_clipboard,
            key,
        })
    }

    /// Cached artifact for `key`, counted as a hit or a miss.
    pub fn cached(&self, key: &SelectionKey) -> Option<Arc<CachedArtifact>> {
        let hit = self.artifacts.get(key);
        self.metrics.record_lookup(hit.is_some());
        hit
    }

    /// Refresh the selection, render it, and store the artifact under the
    /// prepared key. Large selections go to a worker process when
    /// `allow_offload` is set and a worker binary is configured.
    pub async fn render_prepared(
        &self,
        prepared: &PreparedRequest,
        allow_offload: bool,
    ) -> GenerationResult<RenderedArtifact> {
        let cache = prepared.session.cache();
        if !prepared.selection.is_empty() {
            let changed = cache.refresh(&prepared.selection).await?;
            debug!("Refresh for {} changed={changed}", prepared.key);
        }

        let selection_bytes = cache.total_size(&prepared.selection);
        let job = self.build_job(prepared);
        let offload_to = self
            .worker_exe
            .as_deref()
            .filter(|_| allow_offload && selection_bytes > self.config.offload_threshold_bytes());

        let (artifact, offloaded) = if let Some(exe) = offload_to {
            debug!(
                "Offloading render of {} bytes to {}",
                selection_bytes,
                exe.display()
            );
            let artifact = render_in_worker(exe, &job, self.config.worker_timeout()).await?;
            (artifact, true)
        } else {
            let artifact = tokio::task::spawn_blocking(move || job.render())
                .await
                .map_err(|err| GenerationError::WorkerFailed(format!("render task failed: {err}")))?
                .map_err(|err| GenerationError::WorkerFailed(err.to_string()))?;
            (artifact, false)
        };
        self.metrics.record_render(offloaded);

        if artifact.has_omissions() {
            warn!(
                "{} oversized and {} truncated files left out of the prompt",
                artifact.oversized_files.len(),
                artifact.truncated_files.len()
            );
        }
        let artifact = Arc::new(artifact);
        self.artifacts.insert(prepared.key.clone(), artifact.clone());
        Ok(RenderedArtifact {
            artifact,
            offloaded,
        })
    }

    pub fn build_job(&self, prepared: &PreparedRequest) -> RenderJob {
        let session = &prepared.session;
        RenderJob {
            selection: prepared.selection.clone(),
            template: prepared.template.clone(),
            clipboard: prepared.clipboard.clone(),
            directory_tree: session.inventory().tree.clone(),
            prefix: session.spec().prefix.clone(),
            max_content_size: self.config.max_content_size,
            files: session.cache().snapshot(&prepared.selection),
        }
    }

    /// Signal every background loop to stop and remove the prompt mirror.
    pub fn shutdown(&self) {
        self.context.request_stop();
        self.artifacts.remove_mirror();
        debug!("Engine for instance {} shut down", self.context.instance_id());
    }
}
