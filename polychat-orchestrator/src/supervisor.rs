//! Run keys, cancellation handles and the registry of active runs.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Instant,
};

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{OrchestratorError, OrchestratorResult};

/// Identity of one in-flight (session, model, run).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    /// Owning session.
    pub session_id: Uuid,
    /// Model being run.
    pub model_id: String,
    /// Run index, `None` for single-run sends.
    pub run_index: Option<u32>,
}

impl RunKey {
    /// Key of one (session, model, run).
    #[must_use]
    pub fn new(session_id: Uuid, model_id: impl Into<String>, run_index: Option<u32>) -> Self {
        Self {
            session_id,
            model_id: model_id.into(),
            run_index,
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.run_index {
            Some(index) => write!(f, "{}/{}#{index}", self.session_id, self.model_id),
            None => write!(f, "{}/{}", self.session_id, self.model_id),
        }
    }
}

/// How a run left the active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStopReason {
    /// Still active, or ended by an error.
    None,
    /// Aborted by the user.
    Cancelled,
    /// Finished normally.
    Completed,
}

const STATE_ACTIVE: u8 = 0;
const STATE_CANCELLED: u8 = 1;
const STATE_COMPLETED: u8 = 2;

/// Cancellation handles of one run. The stream token is a child of the user
/// token: a user abort stops everything, a stall only stops the stream.
#[derive(Debug)]
pub struct RunHandle {
    user: CancellationToken,
    stream: CancellationToken,
    state: AtomicU8,
    fallback_started: AtomicBool,
    started_at: Instant,
}

impl RunHandle {
    fn new() -> Arc<Self> {
        let user = CancellationToken::new();
        let stream = user.child_token();
        Arc::new(Self {
            user,
            stream,
            state: AtomicU8::new(STATE_ACTIVE),
            fallback_started: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    /// Token cancelled by a user abort.
    #[must_use]
    pub fn user_token(&self) -> CancellationToken {
        self.user.clone()
    }

    /// Token cancelled by a user abort or a stall.
    #[must_use]
    pub fn stream_token(&self) -> CancellationToken {
        self.stream.clone()
    }

    /// Whether the user aborted the run.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.user.is_cancelled()
    }

    /// When the run was registered.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// User abort. Returns `false` when the run already finished or was
    /// cancelled before.
    pub fn mark_cancelled(&self) -> bool {
        if self
            .state
            .compare_exchange(
                STATE_ACTIVE,
                STATE_CANCELLED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.user.cancel();
            counter!("polychat_run_cancels_total").increment(1);
            let elapsed_ms = self.started_at.elapsed().as_secs_f64() * 1000.0;
            histogram!("polychat_run_cancel_latency_ms").record(elapsed_ms);
            true
        } else {
            false
        }
    }

    /// One-shot fallback latch. The first caller wins and the stream token is
    /// cancelled; every later call returns `false`.
    pub fn begin_fallback(&self) -> bool {
        if self
            .fallback_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.stream.cancel();
            counter!("polychat_run_fallbacks_total").increment(1);
            true
        } else {
            false
        }
    }

    /// Whether the single-shot fallback has begun.
    #[must_use]
    pub fn fallback_started(&self) -> bool {
        self.fallback_started.load(Ordering::SeqCst)
    }

    /// Marks a normal finish; no effect after a cancel.
    pub fn mark_completed(&self) {
        let _ = self.state.compare_exchange(
            STATE_ACTIVE,
            STATE_COMPLETED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Current stop reason.
    #[must_use]
    pub fn stop_reason(&self) -> RunStopReason {
        match self.state.load(Ordering::SeqCst) {
            STATE_CANCELLED => RunStopReason::Cancelled,
            STATE_COMPLETED => RunStopReason::Completed,
            _ => RunStopReason::None,
        }
    }
}

/// In-flight runs keyed by [`RunKey`].
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RunKey, Arc<RunHandle>>>,
}

impl RunRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new run. The returned guard unregisters it on drop,
    /// including during unwinding.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::RunActive`] when the key is already taken.
    pub fn register(self: &Arc<Self>, key: RunKey) -> OrchestratorResult<RunGuard> {
        let handle = RunHandle::new();
        {
            let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
            if runs.contains_key(&key) {
                return Err(OrchestratorError::RunActive(key.to_string()));
            }
            runs.insert(key.clone(), Arc::clone(&handle));
        }

        Ok(RunGuard {
            registry: Arc::clone(self),
            key,
            handle,
        })
    }

    fn unregister(&self, key: &RunKey) {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        runs.remove(key);
    }

    /// Cancels one run when `run_index` is given, otherwise every run of the
    /// model. Returns how many runs were newly cancelled.
    pub fn cancel(&self, session_id: Uuid, model_id: &str, run_index: Option<u32>) -> usize {
        let targets: Vec<Arc<RunHandle>> = {
            let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
            runs.iter()
                .filter(|(key, _)| key.session_id == session_id && key.model_id == model_id)
                .filter(|(key, _)| run_index.is_none() || key.run_index == run_index)
                .map(|(_, handle)| Arc::clone(handle))
                .collect()
        };

        targets.iter().filter(|handle| handle.mark_cancelled()).count()
    }

    /// Cancels every run of every session.
    pub fn cancel_all(&self) -> usize {
        let targets: Vec<Arc<RunHandle>> = {
            let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
            runs.values().cloned().collect()
        };
        targets.iter().filter(|handle| handle.mark_cancelled()).count()
    }

    /// Whether a run with `key` is registered.
    #[must_use]
    pub fn is_active(&self, key: &RunKey) -> bool {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Whether any run of the model is registered.
    #[must_use]
    pub fn is_model_active(&self, session_id: Uuid, model_id: &str) -> bool {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|key| key.session_id == session_id && key.model_id == model_id)
    }

    /// Number of registered runs.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.runs.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Keeps a run registered for as long as it lives.
#[derive(Debug)]
pub struct RunGuard {
    registry: Arc<RunRegistry>,
    key: RunKey,
    handle: Arc<RunHandle>,
}

impl RunGuard {
    /// Key the run is registered under.
    #[must_use]
    pub fn key(&self) -> &RunKey {
        &self.key
    }

    /// Cancellation handle of the run.
    #[must_use]
    pub fn handle(&self) -> &Arc<RunHandle> {
        &self.handle
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent() {
        let registry = Arc::new(RunRegistry::new());
        let session_id = Uuid::new_v4();
        let guard = registry.register(RunKey::new(session_id, "m", None)).unwrap();

        assert_eq!(registry.cancel(session_id, "m", None), 1);
        assert_eq!(registry.cancel(session_id, "m", None), 0);
        assert_eq!(guard.handle().stop_reason(), RunStopReason::Cancelled);
        assert!(guard.handle().stream_token().is_cancelled());
    }

    #[test]
    fn targeted_cancel_leaves_siblings_running() {
        let registry = Arc::new(RunRegistry::new());
        let session_id = Uuid::new_v4();
        let first = registry.register(RunKey::new(session_id, "m", Some(1))).unwrap();
        let second = registry.register(RunKey::new(session_id, "m", Some(2))).unwrap();

        assert_eq!(registry.cancel(session_id, "m", Some(2)), 1);

        assert!(!first.handle().is_cancelled());
        assert!(second.handle().is_cancelled());
    }

    #[test]
    fn duplicate_registration_is_rejected_and_guard_unregisters() {
        let registry = Arc::new(RunRegistry::new());
        let key = RunKey::new(Uuid::new_v4(), "m", Some(1));
        let guard = registry.register(key.clone()).unwrap();

        assert!(matches!(
            registry.register(key.clone()),
            Err(OrchestratorError::RunActive(_))
        ));
        assert!(registry.is_model_active(key.session_id, "m"));

        drop(guard);
        assert!(!registry.is_active(&key));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn fallback_latch_fires_once_and_spares_user_token() {
        let registry = Arc::new(RunRegistry::new());
        let guard = registry.register(RunKey::new(Uuid::new_v4(), "m", None)).unwrap();
        let handle = guard.handle();

        assert!(handle.begin_fallback());
        assert!(!handle.begin_fallback());
        assert!(handle.stream_token().is_cancelled());
        assert!(!handle.user_token().is_cancelled());

        handle.mark_completed();
        assert!(!handle.mark_cancelled());
        assert_eq!(handle.stop_reason(), RunStopReason::Completed);
    }
}
