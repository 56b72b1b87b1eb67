use crate::engine::{Engine, GenerationRequest, PreparedRequest};
use crate::error::{GenerationError, GenerationResult};
use crate::selection_key::SelectionKey;
use crate::store::SettingsStore;
use codeprompt_protocol::{CachedArtifact, OutputSink};
use log::{debug, error, info};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub request_id: u64,
    pub artifact: Arc<CachedArtifact>,
    pub key: SelectionKey,
    pub from_cache: bool,
    pub offloaded: bool,
    pub to_clipboard: bool,
    /// Where the sink stored the prompt, when one was configured.
    pub saved_to: Option<PathBuf>,
}

#[derive(Debug)]
pub enum GenerationEvent {
    Completed(GenerationOutcome),
    Failed {
        request_id: u64,
        error: GenerationError,
    },
}

impl GenerationEvent {
    pub const fn request_id(&self) -> u64 {
        match self {
            Self::Completed(outcome) => outcome.request_id,
            Self::Failed { request_id, .. } => *request_id,
        }
    }
}

/// Runs explicit generation requests off the caller's task and posts the
/// result to a single inbox.
pub struct GenerationDispatcher {
    engine: Arc<Engine>,
    sink: Option<Arc<dyn OutputSink>>,
    history: Option<Arc<SettingsStore>>,
    events: mpsc::UnboundedSender<GenerationEvent>,
    next_id: AtomicU64,
}

impl GenerationDispatcher {
    pub fn new(
        engine: Arc<Engine>,
        sink: Option<Arc<dyn OutputSink>>,
    ) -> (Self, mpsc::UnboundedReceiver<GenerationEvent>) {
        let (events, inbox) = mpsc::unbounded_channel();
        (
            Self {
                engine,
                sink,
                history: None,
                events,
                next_id: AtomicU64::new(1),
            },
            inbox,
        )
    }

    /// Record every successful generation in the store's selection history.
    #[must_use]
    pub fn with_history(mut self, store: Arc<SettingsStore>) -> Self {
        self.history = Some(store);
        self
    }

    /// Validate and start a generation; the result arrives on the inbox
    /// tagged with the returned id. Validation failures return immediately.
    pub fn generate(&self, request: &GenerationRequest) -> GenerationResult<u64> {
        let prepared = self.engine.prepare(request)?;
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let engine = self.engine.clone();
        let sink = self.sink.clone();
        let history = self.history.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let event = match fulfill(&engine, sink, history, request_id, prepared).await {
                Ok(outcome) => GenerationEvent::Completed(outcome),
                Err(error) => {
                    engine.metrics().record_failure();
                    error!("Generation {request_id} failed: {error}");
                    GenerationEvent::Failed { request_id, error }
                }
            };
            if events.send(event).is_err() {
                debug!("Generation {request_id} finished after the inbox closed");
            }
        });
        Ok(request_id)
    }
}

async fn fulfill(
    engine: &Engine,
    sink: Option<Arc<dyn OutputSink>>,
    history: Option<Arc<SettingsStore>>,
    request_id: u64,
    prepared: PreparedRequest,
) -> GenerationResult<GenerationOutcome> {
    let (artifact, from_cache, offloaded) = match engine.cached(&prepared.key) {
        Some(artifact) => {
            debug!("Generation {request_id} served from cache ({})", prepared.key);
            (artifact, true, false)
        }
        None => {
            let rendered = engine.render_prepared(&prepared, true).await?;
            (rendered.artifact, false, rendered.offloaded)
        }
    };

    let saved_to = match sink {
        Some(sink) if !prepared.to_clipboard => {
            Some(save(engine, sink, &prepared, artifact.clone()).await?)
        }
        _ => None,
    };
    if let Some(store) = history {
        store.add_history(
            prepared.session.name(),
            &prepared.selection,
            artifact.total_selection_chars,
            Some(&prepared.template_name),
        );
    }
    info!(
        "Generation {request_id}: {} files, {} chars{}",
        prepared.selection.len(),
        artifact.total_selection_chars,
        if from_cache { " (cached)" } else { "" }
    );
    Ok(GenerationOutcome {
        request_id,
        artifact,
        key: prepared.key,
        from_cache,
        offloaded,
        to_clipboard: prepared.to_clipboard,
        saved_to,
    })
}

async fn save(
    engine: &Engine,
    sink: Arc<dyn OutputSink>,
    prepared: &PreparedRequest,
    artifact: Arc<CachedArtifact>,
) -> GenerationResult<PathBuf> {
    let staged = engine.artifacts().take_mirror(&prepared.key);
    let project = prepared.session.name().to_string();
    let template = prepared.template_name.clone();
    let selection = prepared.selection.clone();

    tokio::task::spawn_blocking(move || match staged {
        Some(staged) => sink.save_from_file(&staged, &project, &template, &selection),
        None => sink.save(&artifact.prompt, &project, &template, &selection),
    })
    .await
    .map_err(|err| GenerationError::Save(format!("save task failed: {err}")))?
    .map_err(|err| GenerationError::Save(format!("{err:#}")))
}
