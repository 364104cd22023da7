//! # Orchestrator
//!
//! Public facade: owns configuration, state, the run registry and the
//! defaults, and fans prompts out to one [`RunController`] task per
//! (model, run).

use shared::{
    config::{ApiConfig, AppConfig},
    models::{DefaultEntry, DefaultOverrides, ImageAsset, Message, MessageRole, MessageStatus, Session},
};
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::{sync::broadcast, task::JoinSet};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    composer::{ComposeInput, compose},
    controller::{RunController, RunDependencies, RunReport, RunSpec},
    cost::{CostReconciler, UsageLookup},
    defaults::DefaultsRegistry,
    errors::{OrchestratorError, OrchestratorResult},
    images::{ImageFetcher, ImagePipeline},
    persistence::Persistence,
    state::{StateEvent, StateStore},
    supervisor::{RunKey, RunRegistry},
    transport::{CompletionTransport, HttpClient},
};

/// External collaborators the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Completion endpoint.
    pub transport: Arc<dyn CompletionTransport>,
    /// Generation lookup, when the provider offers one.
    pub lookup: Option<Arc<dyn UsageLookup>>,
    /// Remote image downloads.
    pub fetcher: Arc<dyn ImageFetcher>,
    /// Durable storage.
    pub persistence: Arc<dyn Persistence>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("lookup", &self.lookup.is_some())
            .finish_non_exhaustive()
    }
}

impl Collaborators {
    /// One [`HttpClient`] serving completions, generation lookups and image
    /// downloads.
    ///
    /// # Errors
    /// Fails when the HTTP client cannot be built.
    pub fn http(api: &ApiConfig, persistence: Arc<dyn Persistence>) -> OrchestratorResult<Self> {
        let client = Arc::new(HttpClient::new(api)?);
        Ok(Self {
            transport: client.clone(),
            lookup: Some(client.clone()),
            fetcher: client,
            persistence,
        })
    }
}

/// Run indices for a prompt fan-out: a single run is unindexed.
fn run_indices(runs: u32) -> Vec<Option<u32>> {
    if runs <= 1 {
        vec![None]
    } else {
        (1..=runs).map(Some).collect()
    }
}

/// Entry point for sessions, prompts, aborts and default entries.
pub struct Orchestrator {
    config: AppConfig,
    state: Arc<StateStore>,
    registry: Arc<RunRegistry>,
    defaults: RwLock<DefaultsRegistry>,
    persistence: Arc<dyn Persistence>,
    images: Arc<ImagePipeline>,
    controller: Arc<RunController>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("active_runs", &self.registry.active_count())
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Wires the run controller, state store and registries around `collaborators`.
    #[must_use]
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Self {
        let settings = &config.orchestrator;
        let state = Arc::new(StateStore::new());
        let registry = Arc::new(RunRegistry::new());
        let images = Arc::new(ImagePipeline::new(
            collaborators.fetcher,
            Arc::clone(&collaborators.persistence),
        ));
        let reconciler = CostReconciler::new(
            collaborators.lookup,
            settings.lookup_attempts,
            settings.lookup_base_delay(),
            settings.cost_tolerance,
        );

        let controller = RunController::new(
            RunDependencies {
                transport: collaborators.transport,
                state: Arc::clone(&state),
                registry: Arc::clone(&registry),
                images: Arc::clone(&images),
                reconciler,
                persistence: Arc::clone(&collaborators.persistence),
            },
            settings,
        );

        let defaults = DefaultsRegistry::new(config.defaults.clone());
        Self {
            config,
            state,
            registry,
            defaults: RwLock::new(defaults),
            persistence: collaborators.persistence,
            images,
            controller: Arc::new(controller),
        }
    }

    /// Builds an orchestrator talking HTTP to the configured endpoint.
    ///
    /// # Errors
    /// Fails when the HTTP client cannot be built.
    pub fn with_http(config: AppConfig, persistence: Arc<dyn Persistence>) -> OrchestratorResult<Self> {
        let collaborators = Collaborators::http(&config.api, persistence)?;
        Ok(Self::new(config, collaborators))
    }

    /// Resolved configuration.
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// In-memory session state.
    #[must_use]
    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Active runs.
    #[must_use]
    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Receiver of state change events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.state.subscribe()
    }

    /// Creates and stores a session comparing `models`.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::Config`] for an empty model list.
    pub async fn create_session(&self, models: Vec<String>) -> OrchestratorResult<Session> {
        if models.is_empty() {
            return Err(OrchestratorError::Config("a session needs at least one model".into()));
        }
        let session = Session::new(models);
        self.persistence.put_session(&session).await?;
        self.state.upsert_session(session.clone());
        info!(session_id = %session.id, models = ?session.models, "session created");
        Ok(session)
    }

    /// Loads a stored session into memory. Messages left `Streaming` by an
    /// interrupted process are marked `Aborted`.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::NotFound`] when the session is unknown.
    pub async fn load_session(&self, session_id: Uuid) -> OrchestratorResult<Session> {
        let session = self
            .persistence
            .get_session(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {session_id}")))?;

        let mut messages = Vec::new();
        let mut stats = Vec::new();
        for model_id in &session.models {
            for mut message in self.persistence.messages_for(session_id, model_id).await? {
                if message.status == MessageStatus::Streaming {
                    message.status = MessageStatus::Aborted;
                    message.touch();
                    self.persistence.put_message(&message).await?;
                }
                messages.push(message);
            }
            if let Some(entry) = self.persistence.get_stats(session_id, model_id).await? {
                stats.push(entry);
            }
        }

        self.state.hydrate(session.clone(), messages, stats);
        Ok(session)
    }

    /// Stores a user image and returns its id for [`Orchestrator::send_prompt`].
    ///
    /// # Errors
    /// Fails when the bytes are not an image or cannot be stored.
    pub async fn import_image(&self, bytes: Vec<u8>, mime_type: Option<&str>) -> OrchestratorResult<String> {
        self.images.import(bytes, mime_type).await
    }

    /// Appends the prompt to every model conversation of the session and runs
    /// each model `runs` times concurrently. A failing run never stops its
    /// siblings; its failure is part of the returned reports.
    ///
    /// # Errors
    /// Fails when the session is unknown or `runs` is zero.
    #[instrument(skip(self, prompt, image_ids), fields(session_id = %session_id))]
    pub async fn send_prompt(
        &self,
        session_id: Uuid,
        prompt: &str,
        image_ids: &[String],
        runs: u32,
    ) -> OrchestratorResult<Vec<RunReport>> {
        if runs == 0 {
            return Err(OrchestratorError::Config("runs must be at least 1".into()));
        }
        let session = self
            .state
            .session(session_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {session_id}")))?;

        for model_id in &session.models {
            let mut message = Message::new(session_id, model_id, MessageRole::User, prompt, None);
            message.image_ids = image_ids.to_vec();
            self.persistence.put_message(&message).await?;
            self.state.push_message(message);
        }
        if let Some(updated) = self.state.update_session(session_id, |session| {
            session.message_count += session.models.len() as u64;
            session.clone()
        }) {
            self.persistence.put_session(&updated).await?;
        }

        let mut tasks = JoinSet::new();
        for model_id in &session.models {
            for run_index in run_indices(runs) {
                let spec = self.build_spec(session_id, model_id, run_index).await;
                let controller = Arc::clone(&self.controller);
                tasks.spawn(async move { controller.run(spec).await });
            }
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(err)) => warn!(error = %err, "run did not start"),
                Err(err) => error!(error = %err, "run task panicked"),
            }
        }

        // A panicked task never cleared its streaming flag.
        for model_id in &session.models {
            self.state.set_streaming(
                session_id,
                model_id,
                self.registry.is_model_active(session_id, model_id),
            );
        }

        reports.sort_by_key(|report| {
            let position = session
                .models
                .iter()
                .position(|model| *model == report.key.model_id)
                .unwrap_or(usize::MAX);
            (position, report.key.run_index)
        });
        Ok(reports)
    }

    /// Deletes the last assistant message of the run and everything after
    /// it in the same run scope, then runs the model again.
    ///
    /// # Errors
    /// Fails when the run is still active or has no assistant message.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn rerun_last(
        &self,
        session_id: Uuid,
        model_id: &str,
        run_index: Option<u32>,
    ) -> OrchestratorResult<RunReport> {
        let key = RunKey::new(session_id, model_id, run_index);
        if self.registry.is_active(&key) {
            return Err(OrchestratorError::RunActive(key.to_string()));
        }

        let scoped: Vec<Message> = self
            .state
            .messages(session_id, model_id)
            .into_iter()
            .filter(|message| message.run_index == run_index)
            .collect();
        let start = scoped
            .iter()
            .rposition(|message| message.role == MessageRole::Assistant)
            .ok_or_else(|| OrchestratorError::NotFound(format!("assistant message for {key}")))?;
        let doomed: Vec<Uuid> = scoped[start..].iter().map(|message| message.id).collect();

        self.state.remove_messages(session_id, model_id, &doomed);
        for id in &doomed {
            if let Err(err) = self.controller.delete_message(*id).await {
                warn!(message_id = %id, error = %err, "failed to delete message");
            }
        }
        self.state.update_session(session_id, |session| {
            session.message_count = session.message_count.saturating_sub(doomed.len() as u64);
        });

        let spec = self.build_spec(session_id, model_id, run_index).await;
        self.controller.run(spec).await
    }

    /// Cancels one run, or every run of the model when `run_index` is `None`.
    pub fn abort(&self, session_id: Uuid, model_id: &str, run_index: Option<u32>) -> usize {
        let cancelled = self.registry.cancel(session_id, model_id, run_index);
        info!(%session_id, model_id, ?run_index, cancelled, "abort requested");
        cancelled
    }

    /// Cancels every active run.
    pub fn abort_all(&self) -> usize {
        let cancelled = self.registry.cancel_all();
        info!(cancelled, "abort all requested");
        cancelled
    }

    /// Writes pending debounced messages.
    pub async fn flush(&self) -> usize {
        self.controller.flush().await
    }

    /// Configured default entries.
    #[must_use]
    pub fn defaults(&self) -> Vec<DefaultEntry> {
        self.defaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries()
            .to_vec()
    }

    /// Adds or replaces a default entry.
    ///
    /// # Errors
    /// Fails for an invalid pattern or an attempt to re-pattern the common default.
    pub fn upsert_default(&self, entry: DefaultEntry) -> OrchestratorResult<()> {
        self.defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .upsert(entry)
    }

    /// Removes a default entry.
    ///
    /// # Errors
    /// Fails for unknown ids and for the common default.
    pub fn remove_default(&self, id: &str) -> OrchestratorResult<DefaultEntry> {
        self.defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Common default layered with the entries matching `model_id`.
    #[must_use]
    pub fn resolved_defaults(&self, model_id: &str) -> DefaultOverrides {
        self.defaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(model_id)
    }

    async fn build_spec(&self, session_id: Uuid, model_id: &str, run_index: Option<u32>) -> RunSpec {
        let history = self.state.messages(session_id, model_id);
        let images = self.history_images(&history).await;
        let defaults = self.resolved_defaults(model_id);
        let model_info = self.config.model(model_id);

        let request = compose(&ComposeInput {
            model_id,
            run_index,
            history: &history,
            parameters: self.config.parameters_for(model_id),
            defaults: &defaults,
            model_info,
            images: &images,
        });

        RunSpec {
            key: RunKey::new(session_id, model_id, run_index),
            request,
            defaults,
            pricing: model_info.map(|info| info.pricing),
        }
    }

    /// Assets attached to user messages or generated by earlier answers,
    /// keyed by id.
    async fn history_images(&self, history: &[Message]) -> HashMap<String, ImageAsset> {
        let mut images = HashMap::new();
        let ids = history
            .iter()
            .filter(|message| matches!(message.role, MessageRole::User | MessageRole::Assistant))
            .flat_map(|message| message.image_ids.iter());
        for id in ids {
            if images.contains_key(id) {
                continue;
            }
            match self.persistence.get_image(id).await {
                Ok(Some(asset)) => {
                    images.insert(id.clone(), asset);
                }
                Ok(None) => warn!(image_id = %id, "attached image is missing"),
                Err(err) => warn!(image_id = %id, error = %err, "failed to load attached image"),
            }
        }
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_run_is_unindexed() {
        assert_eq!(run_indices(1), vec![None]);
        assert_eq!(run_indices(3), vec![Some(1), Some(2), Some(3)]);
    }
}
