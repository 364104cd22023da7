//! # Run controller
//!
//! Drives one (model, run) from request to terminal state:
//!
//! ```text
//! idle -> streaming -> { finalizing | falling-back | erroring | aborted } -> terminal
//! ```
//!
//! Exactly one of complete, fail or abort writes the terminal status of a
//! run, and the run key is unregistered on every path by the [`RunGuard`]
//! drop.
//!
//! [`RunGuard`]: crate::supervisor::RunGuard

use futures::{FutureExt, StreamExt};
use metrics::{counter, histogram};
use shared::{
    config::{ModelPricing, OrchestratorSettings},
    models::{DefaultOverrides, Message, MessageStatus, Timestamp, TokenUsage},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    composer::CompletionRequest,
    cost::{CostReconciler, ReconcileInput, Reconciliation},
    debounce::{Debouncer, Sink, TokioTimer},
    decoder::{StreamDecoder, StreamEvent, UsageReport},
    errors::OrchestratorResult,
    images::{ImagePipeline, ImageSources, ResolvedImages, StreamedImage, strip_inline_images},
    persistence::Persistence,
    state::{StateEvent, StateStore},
    supervisor::{RunHandle, RunKey, RunRegistry, RunStopReason},
    transport::CompletionTransport,
};

/// Everything needed to execute one run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Identity of the run.
    pub key: RunKey,
    /// Streaming request; the fallback reuses it with `stream: false`.
    pub request: CompletionRequest,
    /// The matched default for the model.
    pub defaults: DefaultOverrides,
    /// Rates for the local cost estimate.
    pub pricing: Option<ModelPricing>,
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The answer was finalized.
    Completed,
    /// The run failed with the given error.
    Failed(String),
    /// The user aborted the run.
    Aborted,
}

impl RunOutcome {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "complete",
            Self::Failed(_) => "error",
            Self::Aborted => "aborted",
        }
    }
}

/// Result of one finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Identity of the run.
    pub key: RunKey,
    /// The assistant message written by the run.
    pub message_id: Uuid,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Whether the single-shot fallback was taken.
    pub fallback_used: bool,
    /// Reconciled token usage of a completed run.
    pub usage: Option<TokenUsage>,
    /// Reconciled cost in USD, when known.
    pub cost: Option<f64>,
    /// Final state of the run handle.
    pub stop_reason: RunStopReason,
    /// Time from registration to the terminal write.
    pub elapsed: Duration,
}

/// The five signals that count as output. Whitespace-only text counts.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisibleOutput {
    /// Answer text.
    pub text: bool,
    /// Reasoning text.
    pub reasoning: bool,
    /// Thinking text.
    pub thinking: bool,
    /// Image URLs or data URIs.
    pub images: bool,
    /// Attachments.
    pub attachments: bool,
}

impl VisibleOutput {
    /// Whether any signal was seen.
    #[must_use]
    pub const fn any(&self) -> bool {
        self.text || self.reasoning || self.thinking || self.images || self.attachments
    }

    /// Output consisted of image references only.
    #[must_use]
    pub const fn images_only(&self) -> bool {
        (self.images || self.attachments) && !self.text && !self.reasoning && !self.thinking
    }
}

#[derive(Debug, Default)]
struct RunProgress {
    visible: VisibleOutput,
    /// Byte length of the answer text streamed so far.
    text_len: usize,
    images: Vec<StreamedImage>,
    usage: Option<UsageReport>,
    request_id: Option<String>,
}

impl RunProgress {
    fn merge_usage(&mut self, report: UsageReport) {
        let current = self.usage.get_or_insert_with(UsageReport::default);
        current.prompt_tokens = report.prompt_tokens.or(current.prompt_tokens);
        current.completion_tokens = report.completion_tokens.or(current.completion_tokens);
        current.cost = report.cost.or(current.cost);
    }
}

#[derive(Debug, PartialEq)]
enum StreamEnd {
    Completed,
    Stalled,
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
enum Terminal {
    Finalize,
    Error(String),
    Abort,
}

enum Resolution {
    Ready(ResolvedImages),
    Empty,
    Cancelled,
}

/// Shared collaborators of every run.
#[derive(Clone)]
pub struct RunDependencies {
    /// Completion endpoint.
    pub transport: Arc<dyn CompletionTransport>,
    /// In-memory session state.
    pub state: Arc<StateStore>,
    /// Active runs.
    pub registry: Arc<RunRegistry>,
    /// Image resolution.
    pub images: Arc<ImagePipeline>,
    /// Usage and cost reconciliation.
    pub reconciler: CostReconciler,
    /// Durable storage.
    pub persistence: Arc<dyn Persistence>,
}

impl std::fmt::Debug for RunDependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunDependencies")
            .field("registry", &self.registry)
            .field("images", &self.images)
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

/// Text collected from one batch of decoder events.
#[derive(Debug, Default)]
struct EventBatch {
    text: String,
    reasoning: String,
    thinking: String,
    full_text: Option<String>,
}

impl EventBatch {
    /// Records visibility, images, usage and the request id on `progress`
    /// and collects the text. Stops at the first fatal error.
    fn fold(&mut self, events: Vec<StreamEvent>, progress: &mut RunProgress, keep_reasoning: bool) -> Option<StreamEnd> {
        let mut end = None;
        for event in events {
            match event {
                StreamEvent::Token(token) if !token.is_empty() => {
                    progress.visible.text = true;
                    self.text.push_str(&token);
                }
                StreamEvent::ReasoningToken(token) if !token.is_empty() => {
                    progress.visible.reasoning = true;
                    if keep_reasoning {
                        self.reasoning.push_str(&token);
                    }
                }
                StreamEvent::ThinkingToken(token) if !token.is_empty() => {
                    progress.visible.thinking = true;
                    if keep_reasoning {
                        self.thinking.push_str(&token);
                    }
                }
                StreamEvent::Token(_) | StreamEvent::ReasoningToken(_) | StreamEvent::ThinkingToken(_) => {}
                StreamEvent::Message {
                    text,
                    image_urls,
                    attachments,
                } => {
                    let offset = progress.text_len + self.text.len();
                    if !image_urls.is_empty() {
                        progress.visible.images = true;
                        progress
                            .images
                            .extend(image_urls.into_iter().map(|url| StreamedImage::url(offset, url)));
                    }
                    if !attachments.is_empty() {
                        progress.visible.attachments = true;
                        progress.images.extend(
                            attachments
                                .into_iter()
                                .map(|attachment| StreamedImage::attachment(offset, attachment)),
                        );
                    }
                    if !text.is_empty() {
                        self.full_text = Some(text);
                    }
                }
                StreamEvent::Usage(report) => progress.merge_usage(report),
                StreamEvent::RequestId(id) => progress.request_id = Some(id),
                StreamEvent::Done => {
                    end.get_or_insert(StreamEnd::Completed);
                }
                StreamEvent::Error { message, fatal: true } => {
                    end = Some(StreamEnd::Failed(message));
                    break;
                }
                StreamEvent::Error { message, fatal: false } => {
                    warn!(%message, "skipping undecodable frame");
                }
            }
        }
        end
    }

    fn changes_content(&self) -> bool {
        !self.text.is_empty() || !self.reasoning.is_empty() || !self.thinking.is_empty() || self.full_text.is_some()
    }
}

type WriteLocks = Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>;

/// Serializes the writes of each message. Every write persists the latest
/// in-memory snapshot, so a slow write can delay a newer one but never
/// land after it.
#[derive(Clone)]
struct MessageWriter {
    state: Arc<StateStore>,
    persistence: Arc<dyn Persistence>,
    locks: Arc<WriteLocks>,
}

impl MessageWriter {
    fn new(state: Arc<StateStore>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            state,
            persistence,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Writes the current snapshot of the message. A message no longer in
    /// memory is skipped, so a late write cannot revive a deleted one.
    async fn write_latest(&self, session_id: Uuid, model_id: &str, message_id: Uuid) {
        let lock = self.lock_for(message_id);
        {
            let _serialized = lock.lock().await;
            if let Some(latest) = self.state.message(session_id, model_id, message_id)
                && let Err(err) = self.persistence.put_message(&latest).await
            {
                warn!(%message_id, error = %err, "failed to persist message");
            }
        }
        self.release(message_id, &lock);
    }

    async fn delete(&self, message_id: Uuid) -> OrchestratorResult<bool> {
        let lock = self.lock_for(message_id);
        let deleted = {
            let _serialized = lock.lock().await;
            self.persistence.delete_message_cascade(message_id).await
        };
        self.release(message_id, &lock);
        deleted
    }

    fn lock_for(&self, message_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(message_id).or_default())
    }

    /// Drops the lock entry once no other writer holds or waits for it.
    fn release(&self, message_id: Uuid, lock: &Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = Arc::strong_count(lock) == 2
            && locks
                .get(&message_id)
                .is_some_and(|current| Arc::ptr_eq(current, lock));
        if idle {
            locks.remove(&message_id);
        }
    }

    fn sink(&self) -> Sink<Message> {
        let writer = self.clone();
        Arc::new(move |payload: Message| {
            let writer = writer.clone();
            async move {
                writer
                    .write_latest(payload.session_id, &payload.model_id, payload.id)
                    .await;
            }
            .boxed()
        })
    }
}

/// Executes runs. One controller serves every run of an orchestrator.
pub struct RunController {
    transport: Arc<dyn CompletionTransport>,
    state: Arc<StateStore>,
    registry: Arc<RunRegistry>,
    images: Arc<ImagePipeline>,
    reconciler: CostReconciler,
    persistence: Arc<dyn Persistence>,
    writer: MessageWriter,
    debouncer: Debouncer<Uuid, Message>,
    stall_timeout: Duration,
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController")
            .field("stall_timeout", &self.stall_timeout)
            .field("active_runs", &self.registry.active_count())
            .finish_non_exhaustive()
    }
}

impl RunController {
    /// Creates a controller with the configured stall timeout and debounce.
    #[must_use]
    pub fn new(deps: RunDependencies, settings: &OrchestratorSettings) -> Self {
        Self::with_timeouts(deps, settings.stall_timeout(), settings.persist_debounce())
    }

    /// Same as [`RunController::new`] with explicit timings.
    #[must_use]
    pub fn with_timeouts(deps: RunDependencies, stall_timeout: Duration, debounce: Duration) -> Self {
        let writer = MessageWriter::new(Arc::clone(&deps.state), Arc::clone(&deps.persistence));
        Self {
            transport: deps.transport,
            state: deps.state,
            registry: deps.registry,
            images: deps.images,
            reconciler: deps.reconciler,
            persistence: deps.persistence,
            debouncer: Debouncer::new(debounce, Arc::new(TokioTimer), writer.sink()),
            writer,
            stall_timeout,
        }
    }

    /// Writes every pending debounced message now.
    pub async fn flush(&self) -> usize {
        self.debouncer.flush_all().await
    }

    /// Deletes a stored message and its orphaned images once any write of
    /// that message in progress has landed.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn delete_message(&self, message_id: Uuid) -> OrchestratorResult<bool> {
        self.debouncer.cancel(&message_id);
        self.writer.delete(message_id).await
    }

    /// Executes one run to its terminal state.
    ///
    /// # Errors
    /// Only fails when the run key is already active; every later failure is
    /// recorded on the assistant message and reported as [`RunOutcome::Failed`].
    #[instrument(name = "run", skip(self, spec), fields(run = %spec.key))]
    pub async fn run(&self, spec: RunSpec) -> OrchestratorResult<RunReport> {
        let guard = self.registry.register(spec.key.clone())?;
        let handle = Arc::clone(guard.handle());
        let key = guard.key().clone();

        let placeholder = Message::streaming_placeholder(key.session_id, &key.model_id, key.run_index);
        let message_id = placeholder.id;
        self.state.push_message(placeholder.clone());
        self.state.set_streaming(key.session_id, &key.model_id, true);
        self.state.set_model_error(key.session_id, &key.model_id, None);
        self.state
            .update_session(key.session_id, |session| session.message_count += 1);
        self.writer
            .write_latest(key.session_id, &key.model_id, message_id)
            .await;
        info!("run started");

        let mut progress = RunProgress::default();
        let mut terminal = match self.stream_phase(&spec, &handle, message_id, &mut progress).await {
            StreamEnd::Cancelled => Terminal::Abort,
            StreamEnd::Failed(error) => Terminal::Error(error),
            StreamEnd::Stalled => {
                counter!("polychat_run_stalls_total").increment(1);
                warn!(timeout_ms = self.stall_timeout.as_millis(), "no output before stall timeout");
                self.fallback(&spec, &handle, message_id, &mut progress).await
            }
            StreamEnd::Completed if !progress.visible.any() => {
                info!("stream finished without visible output");
                self.fallback(&spec, &handle, message_id, &mut progress).await
            }
            StreamEnd::Completed => Terminal::Finalize,
        };

        let (outcome, reconciliation) = loop {
            match terminal {
                Terminal::Finalize => match self.resolve_images(&spec, &handle, message_id, &progress).await {
                    Resolution::Ready(resolved) => {
                        let reconciliation = self.complete(&spec, &handle, message_id, &progress, resolved).await;
                        break (RunOutcome::Completed, Some(reconciliation));
                    }
                    Resolution::Cancelled => terminal = Terminal::Abort,
                    Resolution::Empty if handle.fallback_started() => {
                        terminal = Terminal::Error("model returned no usable output".to_string());
                    }
                    Resolution::Empty => {
                        info!("every image reference failed to resolve");
                        terminal = self.fallback(&spec, &handle, message_id, &mut progress).await;
                    }
                },
                Terminal::Error(error) => break (self.fail(&key, message_id, error).await, None),
                Terminal::Abort => break (self.abort(&key, message_id).await, None),
            }
        };

        let fallback_used = handle.fallback_started();
        let stop_reason = handle.stop_reason();
        let elapsed = handle.started_at().elapsed();
        drop(guard);
        self.state.set_streaming(
            key.session_id,
            &key.model_id,
            self.registry.is_model_active(key.session_id, &key.model_id),
        );

        counter!("polychat_run_outcomes_total", "outcome" => outcome.as_str()).increment(1);
        histogram!("polychat_run_duration_ms", "outcome" => outcome.as_str())
            .record(elapsed.as_secs_f64() * 1000.0);
        info!(
            outcome = outcome.as_str(),
            ?stop_reason,
            fallback_used,
            elapsed_ms = elapsed.as_millis(),
            "run finished"
        );
        Ok(RunReport {
            key,
            message_id,
            outcome,
            fallback_used,
            usage: reconciliation.map(|r| r.usage),
            cost: reconciliation.and_then(|r| r.cost),
            stop_reason,
            elapsed,
        })
    }

    async fn stream_phase(
        &self,
        spec: &RunSpec,
        handle: &RunHandle,
        message_id: Uuid,
        progress: &mut RunProgress,
    ) -> StreamEnd {
        let user = handle.user_token();
        let stream_token = handle.stream_token();
        let stall = tokio::time::sleep(self.stall_timeout);
        tokio::pin!(stall);

        let mut body = tokio::select! {
            biased;
            () = user.cancelled() => return StreamEnd::Cancelled,
            () = &mut stall => return StreamEnd::Stalled,
            opened = self.transport.stream(&spec.request, stream_token.clone()) => match opened {
                Ok(body) => body,
                Err(_) if user.is_cancelled() => return StreamEnd::Cancelled,
                Err(err) => return StreamEnd::Failed(err.to_string()),
            },
        };

        let mut decoder = StreamDecoder::new();
        loop {
            let stall_armed = !progress.visible.any();
            let events = tokio::select! {
                biased;
                () = user.cancelled() => return StreamEnd::Cancelled,
                () = &mut stall, if stall_armed => return StreamEnd::Stalled,
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => decoder.feed(&bytes),
                    Some(Err(_)) if user.is_cancelled() => return StreamEnd::Cancelled,
                    Some(Err(err)) => return StreamEnd::Failed(err.to_string()),
                    None if user.is_cancelled() => return StreamEnd::Cancelled,
                    None => {
                        let events = decoder.finish();
                        return self
                            .apply_events(spec, message_id, progress, events)
                            .unwrap_or(StreamEnd::Completed);
                    }
                },
            };

            if let Some(end) = self.apply_events(spec, message_id, progress, events) {
                return end;
            }
        }
    }

    /// Folds decoder events into the assistant message. Returns the end of
    /// the stream once `Done` or a fatal error was seen.
    fn apply_events(
        &self,
        spec: &RunSpec,
        message_id: Uuid,
        progress: &mut RunProgress,
        events: Vec<StreamEvent>,
    ) -> Option<StreamEnd> {
        if events.is_empty() {
            return None;
        }

        let was_visible = progress.visible.any();
        let mut batch = EventBatch::default();
        let end = batch.fold(events, progress, spec.defaults.keeps_reasoning());

        let first_output = !was_visible && progress.visible.any();
        if first_output {
            let elapsed = Timestamp::now().millis_since(&self.message_created_at(spec, message_id));
            #[allow(clippy::cast_precision_loss)]
            histogram!("polychat_first_token_latency_ms").record(elapsed as f64);
            debug!(latency_ms = elapsed, "first output");
        }

        let changed = first_output || batch.changes_content();
        let EventBatch {
            text,
            reasoning,
            thinking,
            full_text,
        } = batch;
        progress.text_len += match &full_text {
            Some(full) if progress.text_len == 0 && text.is_empty() => full.len(),
            _ => text.len(),
        };
        if changed {
            let key = &spec.key;
            let snapshot = self.state.update_message(key.session_id, &key.model_id, message_id, |message| {
                message.content.push_str(&text);
                if message.content.is_empty() && let Some(full) = full_text {
                    message.content = full;
                }
                if !reasoning.is_empty() {
                    message.reasoning.get_or_insert_with(String::new).push_str(&reasoning);
                }
                if !thinking.is_empty() {
                    message.thinking.get_or_insert_with(String::new).push_str(&thinking);
                }
                if first_output && message.first_token_at.is_none() {
                    message.first_token_at = Some(Timestamp::now());
                }
            });
            if let Some(snapshot) = snapshot {
                self.debouncer.schedule(message_id, snapshot);
            }
        }

        end
    }

    fn message_created_at(&self, spec: &RunSpec, message_id: Uuid) -> Timestamp {
        self.state
            .message(spec.key.session_id, &spec.key.model_id, message_id)
            .map_or_else(Timestamp::now, |message| message.created_at)
    }

    /// Single-shot retrieval replacing whatever the stream produced. Runs at
    /// most once per run.
    async fn fallback(
        &self,
        spec: &RunSpec,
        handle: &RunHandle,
        message_id: Uuid,
        progress: &mut RunProgress,
    ) -> Terminal {
        if !handle.begin_fallback() {
            return Terminal::Error("model returned no output".to_string());
        }
        info!("falling back to single-shot completion");

        *progress = RunProgress::default();
        let key = &spec.key;
        self.state.update_message(key.session_id, &key.model_id, message_id, |message| {
            message.content.clear();
            message.reasoning = None;
            message.thinking = None;
            message.first_token_at = None;
        });

        let user = handle.user_token();
        let request = spec.request.clone().with_stream(false);
        let result = tokio::select! {
            biased;
            () = user.cancelled() => return Terminal::Abort,
            result = self.transport.complete(&request, user.clone()) => result,
        };

        match result {
            Err(_) if handle.is_cancelled() => Terminal::Abort,
            Err(err) if err.is_cancelled() => Terminal::Abort,
            Err(err) => Terminal::Error(format!("fallback request failed: {err}")),
            Ok(body) => {
                let events = StreamDecoder::decode_response(&body);
                match self.apply_events(spec, message_id, progress, events) {
                    Some(StreamEnd::Failed(error)) => Terminal::Error(error),
                    _ if !progress.visible.any() => {
                        Terminal::Error("model returned no output after fallback".to_string())
                    }
                    _ => Terminal::Finalize,
                }
            }
        }
    }

    async fn resolve_images(
        &self,
        spec: &RunSpec,
        handle: &RunHandle,
        message_id: Uuid,
        progress: &RunProgress,
    ) -> Resolution {
        let key = &spec.key;
        let content = self
            .state
            .message(key.session_id, &key.model_id, message_id)
            .map(|message| message.content)
            .unwrap_or_default();

        let resolved = self
            .images
            .resolve(
                ImageSources {
                    streamed: &progress.images,
                    text: &content,
                    keep_only_last: spec.defaults.keep_only_last_image(),
                },
                &handle.user_token(),
            )
            .await;

        if handle.is_cancelled() {
            Resolution::Cancelled
        } else if resolved.ids.is_empty() && progress.visible.images_only() {
            Resolution::Empty
        } else {
            Resolution::Ready(resolved)
        }
    }

    async fn complete(
        &self,
        spec: &RunSpec,
        handle: &RunHandle,
        message_id: Uuid,
        progress: &RunProgress,
        resolved: ResolvedImages,
    ) -> Reconciliation {
        let key = &spec.key;
        let clear_text = spec.defaults.keep_only_last_image() && !resolved.ids.is_empty();

        self.state.update_message(key.session_id, &key.model_id, message_id, |message| {
            for id in &resolved.ids {
                if !message.image_ids.contains(id) {
                    message.image_ids.push(id.clone());
                }
            }
            message.content = if clear_text {
                String::new()
            } else {
                strip_inline_images(&message.content, &resolved.inlined)
            };
            message.status = MessageStatus::Complete;
            message.error = None;
            message.completed_at = Some(Timestamp::now());
        });
        self.debouncer.cancel(&message_id);
        self.writer
            .write_latest(key.session_id, &key.model_id, message_id)
            .await;

        let reconciliation = self
            .reconciler
            .reconcile(
                ReconcileInput {
                    streamed: progress.usage,
                    request_id: progress.request_id.as_deref(),
                    pricing: spec.pricing.as_ref(),
                    image_count: resolved.ids.len(),
                },
                &handle.user_token(),
            )
            .await;

        let stats = self.state.record_stats(
            key.session_id,
            &key.model_id,
            reconciliation.usage,
            reconciliation.cost,
        );
        if let Err(err) = self.persistence.put_stats(&stats).await {
            warn!(error = %err, "failed to persist model stats");
        }

        let session = self.state.update_session(key.session_id, |session| {
            session.record_run(reconciliation.usage.total(), reconciliation.cost.unwrap_or(0.0));
            session.clone()
        });
        if let Some(session) = session && let Err(err) = self.persistence.put_session(&session).await {
            warn!(error = %err, "failed to persist session");
        }

        if let Some(verification) = reconciliation.verification {
            self.state.notify(StateEvent::CostVerified {
                session_id: key.session_id,
                model_id: key.model_id.clone(),
                run_index: key.run_index,
                verification,
            });
        }

        handle.mark_completed();
        info!(
            images = resolved.ids.len(),
            prompt_tokens = reconciliation.usage.prompt_tokens,
            completion_tokens = reconciliation.usage.completion_tokens,
            cost = ?reconciliation.cost,
            cost_source = reconciliation.source.as_str(),
            "run complete"
        );
        reconciliation
    }

    async fn fail(&self, key: &RunKey, message_id: Uuid, error: String) -> RunOutcome {
        self.state.update_message(key.session_id, &key.model_id, message_id, |message| {
            message.status = MessageStatus::Error;
            message.error = Some(error.clone());
            message.completed_at = Some(Timestamp::now());
        });
        self.debouncer.cancel(&message_id);
        self.writer
            .write_latest(key.session_id, &key.model_id, message_id)
            .await;
        self.state
            .set_model_error(key.session_id, &key.model_id, Some(error.clone()));

        warn!(%error, "run failed");
        RunOutcome::Failed(error)
    }

    async fn abort(&self, key: &RunKey, message_id: Uuid) -> RunOutcome {
        self.state.update_message(key.session_id, &key.model_id, message_id, |message| {
            message.status = MessageStatus::Aborted;
            message.error = None;
            message.completed_at = Some(Timestamp::now());
        });
        self.debouncer.cancel(&message_id);
        self.writer
            .write_latest(key.session_id, &key.model_id, message_id)
            .await;

        info!("run aborted");
        RunOutcome::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;

    #[test]
    fn visible_output_conditions() {
        assert!(!VisibleOutput::default().any());

        for output in [
            VisibleOutput { text: true, ..VisibleOutput::default() },
            VisibleOutput { reasoning: true, ..VisibleOutput::default() },
            VisibleOutput { thinking: true, ..VisibleOutput::default() },
            VisibleOutput { images: true, ..VisibleOutput::default() },
            VisibleOutput { attachments: true, ..VisibleOutput::default() },
        ] {
            assert!(output.any());
        }

        assert!(VisibleOutput { images: true, ..VisibleOutput::default() }.images_only());
        assert!(!VisibleOutput { images: true, text: true, ..VisibleOutput::default() }.images_only());
    }

    #[test]
    fn usage_merge_keeps_earlier_fields() {
        let mut progress = RunProgress::default();
        progress.merge_usage(UsageReport {
            prompt_tokens: Some(10),
            completion_tokens: None,
            cost: Some(0.1),
        });
        progress.merge_usage(UsageReport {
            prompt_tokens: None,
            completion_tokens: Some(4),
            cost: None,
        });

        assert_eq!(
            progress.usage,
            Some(UsageReport {
                prompt_tokens: Some(10),
                completion_tokens: Some(4),
                cost: Some(0.1),
            })
        );
    }

    #[tokio::test]
    async fn writer_persists_latest_snapshot_and_forgets_idle_locks() {
        let state = Arc::new(StateStore::new());
        let store = Arc::new(MemoryPersistence::new());
        let writer = MessageWriter::new(Arc::clone(&state), store.clone());
        let message = Message::streaming_placeholder(Uuid::new_v4(), "m", None);
        let (session_id, message_id) = (message.session_id, message.id);
        state.push_message(message);
        state.update_message(session_id, "m", message_id, |message| message.content = "latest".into());

        tokio::join!(
            writer.write_latest(session_id, "m", message_id),
            writer.write_latest(session_id, "m", message_id),
        );

        let stored = store.get_message(message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "latest");
        assert!(writer.locks.lock().unwrap().is_empty());

        state.remove_messages(session_id, "m", &[message_id]);
        assert!(writer.delete(message_id).await.unwrap());
        writer.write_latest(session_id, "m", message_id).await;
        assert!(store.get_message(message_id).await.unwrap().is_none());
        assert!(writer.locks.lock().unwrap().is_empty());
    }
}
