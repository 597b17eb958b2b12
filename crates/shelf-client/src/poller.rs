//! Submission & polling client.
//!
//! A [`Poller`] takes one user request at a time per [`RequestSlot`], submits
//! it, and either hands back an immediate result or registers the queued
//! task and follows it with a cancellable poll chain until it reaches a
//! terminal status.  Outcomes go to three places: the shared
//! [`TaskRegistry`], the slot's local state, and the [`PollEvent`] channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shelf_proto::config::{Config, TransientErrorPolicy};
use shelf_proto::protocol::{
    GenerationOption, GenerationRequest, Progress, Submission, TaskKind, TaskPatch, TaskResult,
    TaskStatus, TaskStatusReport, TrackedTask,
};
use shelf_proto::registry::TaskRegistry;

use crate::api::GenerationApi;
use crate::cleanup::CleanupPolicy;
use crate::error::{Error, Result};

// ── Local request state ──────────────────────────────────────────────────────

/// State of one user-initiated request, as seen by the view that made it.
///
/// ```text
/// Idle -> Submitting -> ResultReady
///                    -> Polling -> Polling ... -> Completed | Failed
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestState {
    #[default]
    Idle,
    Submitting,
    /// Answered synchronously; nothing was registered.
    ResultReady(TaskResult),
    Polling {
        task_id: String,
        progress: Option<Progress>,
    },
    Completed {
        task_id: String,
        result: TaskResult,
    },
    Failed {
        task_id: String,
        error: String,
    },
}

impl RequestState {
    pub fn is_busy(&self) -> bool {
        matches!(self, RequestState::Submitting | RequestState::Polling { .. })
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            RequestState::Polling { task_id, .. }
            | RequestState::Completed { task_id, .. }
            | RequestState::Failed { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// Observable holder of one [`RequestState`].  Clones share the same state.
#[derive(Debug, Clone)]
pub struct RequestSlot {
    tx: Arc<watch::Sender<RequestState>>,
}

impl RequestSlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RequestState::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<RequestState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> RequestState {
        self.tx.borrow().clone()
    }

    pub fn set(&self, state: RequestState) {
        self.tx.send_replace(state);
    }

    /// Write `state` unless `cancel` has fired.  The check runs under the
    /// channel lock, so a `cancel()` followed by `set(Idle)` always wins.
    fn set_unless_cancelled(&self, cancel: &CancellationToken, state: RequestState) -> bool {
        self.tx.send_if_modified(|current| {
            if cancel.is_cancelled() {
                return false;
            }
            *current = state;
            true
        })
    }
}

impl Default for RequestSlot {
    fn default() -> Self {
        Self::new()
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Outcome reported to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// Transient user-facing notification.
    Notify { level: NoticeLevel, message: String },
    /// A finished artifact for the playback/display sink.  `task_id` is
    /// `None` for results that came back synchronously.
    ArtifactReady {
        task_id: Option<String>,
        kind: TaskKind,
        result: TaskResult,
    },
    /// Fresh option list after a completion.
    OptionsRefreshed {
        context_id: Option<i64>,
        options: Vec<GenerationOption>,
    },
}

impl PollEvent {
    fn notify(level: NoticeLevel, message: impl Into<String>) -> Self {
        PollEvent::Notify {
            level,
            message: message.into(),
        }
    }
}

// ── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub transient_errors: TransientErrorPolicy,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub cleanup: CleanupPolicy,
}

impl PollSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.polling.interval(),
            transient_errors: config.polling.transient_errors,
            max_retries: config.polling.max_retries,
            retry_backoff: config.polling.retry_backoff(),
            cleanup: CleanupPolicy::from_config(&config.cleanup),
        }
    }

    /// Linear backoff before retry `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(attempt.max(1))
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ── Poll handles ─────────────────────────────────────────────────────────────

/// One running poll chain.  Dropping the handle cancels the chain.
#[derive(Debug)]
pub struct PollHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl PollHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Poll handles keyed by task id.  At most one live chain per id.
#[derive(Debug, Default)]
pub struct PollSet {
    handles: HashMap<String, PollHandle>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self) {
        self.handles.retain(|_, h| !h.is_finished());
    }

    pub fn is_polling(&self, task_id: &str) -> bool {
        self.handles
            .get(task_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Store `handle` unless a live chain for `task_id` exists.  A rejected
    /// handle is dropped, which cancels it.
    pub fn insert(&mut self, task_id: String, handle: PollHandle) -> bool {
        self.prune();
        if self.handles.contains_key(&task_id) {
            return false;
        }
        self.handles.insert(task_id, handle);
        true
    }

    pub fn cancel(&mut self, task_id: &str) -> bool {
        match self.handles.remove(task_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.cancel();
        }
    }

    pub fn len(&mut self) -> usize {
        self.prune();
        self.handles.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}

// ── Poller ───────────────────────────────────────────────────────────────────

/// Submits generation requests and drives their poll chains.
///
/// Clones share the same poll set.  Poll chains stop when the last clone is
/// dropped or [`Poller::cancel_all`] is called; registry entries stay.
#[derive(Clone)]
pub struct Poller {
    core: Arc<PollCore>,
    polls: Arc<Mutex<PollSet>>,
}

/// State shared by the poller and its chains.  Chains never hold the poll
/// set, so dropping the last `Poller` drops every handle.
struct PollCore {
    api: Arc<dyn GenerationApi>,
    registry: TaskRegistry,
    settings: PollSettings,
    events: mpsc::Sender<PollEvent>,
}

impl PollCore {
    async fn emit(&self, event: PollEvent) {
        let _ = self.events.send(event).await;
    }
}

impl Poller {
    pub fn new(
        api: Arc<dyn GenerationApi>,
        registry: TaskRegistry,
        settings: PollSettings,
    ) -> (Self, mpsc::Receiver<PollEvent>) {
        let (events, events_rx) = mpsc::channel(256);
        let poller = Self {
            core: Arc::new(PollCore {
                api,
                registry,
                settings,
                events,
            }),
            polls: Arc::new(Mutex::new(PollSet::new())),
        };
        (poller, events_rx)
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.core.registry
    }

    fn with_polls<R>(&self, f: impl FnOnce(&mut PollSet) -> R) -> R {
        let mut polls = self.polls.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut polls)
    }

    pub fn is_polling(&self, task_id: &str) -> bool {
        self.with_polls(|polls| polls.is_polling(task_id))
    }

    pub fn active_polls(&self) -> usize {
        self.with_polls(|polls| polls.len())
    }

    /// Stop polling `task_id`.  The registry entry is left as it is.
    pub fn cancel(&self, task_id: &str) -> bool {
        let cancelled = self.with_polls(|polls| polls.cancel(task_id));
        if cancelled {
            debug!("poller: cancelled chain for {}", task_id);
        }
        cancelled
    }

    /// Stop every chain owned by this poller (view teardown).
    pub fn cancel_all(&self) {
        self.with_polls(|polls| polls.cancel_all());
    }

    async fn emit(&self, event: PollEvent) {
        self.core.emit(event).await;
    }

    /// Submit `request` and move `slot` through its state machine.
    ///
    /// Rejections (empty payload, failed submission call) put the slot back
    /// to Idle, emit a notification and are returned as `Err`; nothing is
    /// registered in that case.
    pub async fn submit(&self, slot: &RequestSlot, request: GenerationRequest) -> Result<Submission> {
        if request.is_empty() {
            slot.set(RequestState::Idle);
            self.emit(PollEvent::notify(
                NoticeLevel::Warning,
                "Nothing to generate: text is empty",
            ))
            .await;
            return Err(Error::EmptyPayload);
        }

        slot.set(RequestState::Submitting);
        let submission = match self.core.api.submit_generation(&request).await {
            Ok(submission) => submission,
            Err(e) => {
                warn!("poller: {:?} submission failed: {}", request.kind, e);
                slot.set(RequestState::Idle);
                self.emit(PollEvent::notify(
                    NoticeLevel::Error,
                    format!("{} failed: {}", request.kind.title(), e),
                ))
                .await;
                return Err(e);
            }
        };

        match &submission {
            Submission::Ready(result) => {
                info!("poller: {:?} answered synchronously", request.kind);
                slot.set(RequestState::ResultReady(result.clone()));
                self.emit(PollEvent::ArtifactReady {
                    task_id: None,
                    kind: request.kind,
                    result: result.clone(),
                })
                .await;
            }
            Submission::Queued { task_id } => {
                self.track(slot, &request, task_id).await;
            }
        }
        Ok(submission)
    }

    /// Register a queued task and start following it.
    async fn track(&self, slot: &RequestSlot, request: &GenerationRequest, task_id: &str) {
        let added = self
            .core
            .registry
            .add_task(TrackedTask::pending(
                task_id,
                request.kind,
                request.metadata.clone(),
            ))
            .await;
        if added {
            info!("poller: tracking {:?} task {}", request.kind, task_id);
            self.emit(PollEvent::notify(
                NoticeLevel::Info,
                format!("{} started", request.kind.title()),
            ))
            .await;
        } else {
            debug!("poller: task {} already registered", task_id);
        }

        slot.set(RequestState::Polling {
            task_id: task_id.to_string(),
            progress: Some(Progress::seed()),
        });

        self.with_polls(|polls| {
            if polls.is_polling(task_id) {
                debug!("poller: {} already has a live chain", task_id);
                return;
            }
            let cancel = CancellationToken::new();
            let chain = PollChain {
                core: self.core.clone(),
                slot: slot.clone(),
                task_id: task_id.to_string(),
                kind: request.kind,
                context_id: request.context_id,
                cancel: cancel.clone(),
            };
            let join = tokio::spawn(chain.run());
            polls.insert(task_id.to_string(), PollHandle { cancel, join });
        });
    }
}

/// Everything one poll chain needs.
struct PollChain {
    core: Arc<PollCore>,
    slot: RequestSlot,
    task_id: String,
    kind: TaskKind,
    context_id: Option<i64>,
    /// Once fired, the chain writes nothing more anywhere.
    cancel: CancellationToken,
}

/// What to do after one poll attempt.
enum Step {
    Again(Duration),
    Stop,
}

impl PollChain {
    async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.core.api.get_task_status(&self.task_id) => r,
            };

            let step = match outcome {
                Ok(report) => {
                    failures = 0;
                    self.on_report(report).await
                }
                Err(e) => {
                    failures += 1;
                    self.on_error(e, failures).await
                }
            };

            let delay = match step {
                Step::Again(delay) => delay,
                Step::Stop => return,
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("poller: chain for {} cancelled", self.task_id);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn set_slot(&self, state: RequestState) {
        self.slot.set_unless_cancelled(&self.cancel, state);
    }

    async fn emit(&self, event: PollEvent) {
        if !self.is_cancelled() {
            self.core.emit(event).await;
        }
    }

    async fn on_report(&self, report: TaskStatusReport) -> Step {
        if self.is_cancelled() {
            return Step::Stop;
        }
        match report.status {
            TaskStatus::Pending | TaskStatus::Running => {
                self.core
                    .registry
                    .update_task(
                        &self.task_id,
                        TaskPatch::status(report.status).with_progress(report.progress.clone()),
                    )
                    .await;
                self.set_slot(RequestState::Polling {
                    task_id: self.task_id.clone(),
                    progress: report.progress,
                });
                Step::Again(self.core.settings.interval)
            }
            TaskStatus::Completed => {
                self.on_completed(report.result).await;
                Step::Stop
            }
            TaskStatus::Failed => {
                let error = report
                    .error
                    .unwrap_or_else(|| "task failed without a message".to_string());
                self.fail(error).await;
                Step::Stop
            }
        }
    }

    async fn on_error(&self, error: Error, failures: u32) -> Step {
        if self.is_cancelled() {
            return Step::Stop;
        }
        let settings = &self.core.settings;
        match settings.transient_errors {
            TransientErrorPolicy::Stall => {
                warn!(
                    "poller: status poll for {} failed, polling stalled: {}",
                    self.task_id, error
                );
                Step::Stop
            }
            TransientErrorPolicy::Retry if error.is_transient() && failures <= settings.max_retries => {
                let delay = settings.backoff(failures);
                warn!(
                    "poller: status poll for {} failed ({}/{}), retrying in {:?}: {}",
                    self.task_id, failures, settings.max_retries, delay, error
                );
                Step::Again(delay)
            }
            TransientErrorPolicy::Retry => {
                warn!("poller: giving up on {}: {}", self.task_id, error);
                self.fail(error.to_string()).await;
                Step::Stop
            }
        }
    }

    async fn on_completed(&self, result: Option<TaskResult>) {
        let registry = &self.core.registry;
        let well_formed = result
            .as_ref()
            .map(|r| r.has_expected_field(self.kind))
            .unwrap_or(false);

        if self.is_cancelled() {
            return;
        }
        let finished = registry
            .finish_task(
                &self.task_id,
                TaskPatch::status(TaskStatus::Completed).with_result(result.clone()),
            )
            .await;
        if let Some(generation) = finished {
            self.core.settings.cleanup.schedule(
                registry,
                &self.task_id,
                generation,
                TaskStatus::Completed,
            );
        }

        let result = match result {
            Some(result) if well_formed => result,
            _ => {
                let error = format!(
                    "{} finished without a result ({} missing)",
                    self.kind.title(),
                    self.kind.result_fields().join("/")
                );
                warn!("poller: task {} completed malformed", self.task_id);
                self.set_slot(RequestState::Failed {
                    task_id: self.task_id.clone(),
                    error: error.clone(),
                });
                self.emit(PollEvent::notify(NoticeLevel::Error, error)).await;
                return;
            }
        };

        info!("poller: task {} completed", self.task_id);
        self.set_slot(RequestState::Completed {
            task_id: self.task_id.clone(),
            result: result.clone(),
        });
        self.emit(PollEvent::ArtifactReady {
            task_id: Some(self.task_id.clone()),
            kind: self.kind,
            result,
        })
        .await;
        self.emit(PollEvent::notify(
            NoticeLevel::Success,
            format!("{} finished", self.kind.title()),
        ))
        .await;

        if self.kind == TaskKind::SpeechSynthesis && !self.is_cancelled() {
            self.refresh_options().await;
        }
    }

    async fn refresh_options(&self) {
        match self.core.api.list_generation_options(self.context_id).await {
            Ok(options) => {
                self.emit(PollEvent::OptionsRefreshed {
                    context_id: self.context_id,
                    options,
                })
                .await;
            }
            Err(e) => warn!("poller: option refresh failed: {}", e),
        }
    }

    async fn fail(&self, error: String) {
        if self.is_cancelled() {
            return;
        }
        let registry = &self.core.registry;
        let finished = registry
            .finish_task(
                &self.task_id,
                TaskPatch::status(TaskStatus::Failed).with_error(error.clone()),
            )
            .await;
        if let Some(generation) = finished {
            self.core.settings.cleanup.schedule(
                registry,
                &self.task_id,
                generation,
                TaskStatus::Failed,
            );
        }

        warn!("poller: task {} failed: {}", self.task_id, error);
        self.set_slot(RequestState::Failed {
            task_id: self.task_id.clone(),
            error: error.clone(),
        });
        self.emit(PollEvent::notify(
            NoticeLevel::Error,
            format!("{} failed: {}", self.kind.title(), error),
        ))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted reply to one status poll.
    enum Reply {
        Report(TaskStatusReport),
        Transport,
        Missing,
    }

    #[derive(Default)]
    struct FakeApi {
        submissions: Mutex<VecDeque<Result<Submission>>>,
        script: Mutex<VecDeque<Reply>>,
        submit_calls: AtomicUsize,
        status_calls: AtomicUsize,
        option_calls: AtomicUsize,
        /// Run once inside the next status call: stop the chain and release
        /// the slot, the way the UI does on "stop"/"dismiss".
        cancel_during_status: Mutex<Option<(Poller, RequestSlot)>>,
    }

    impl FakeApi {
        fn queued(id: &str) -> Self {
            let api = Self::default();
            api.submissions.lock().unwrap().push_back(Ok(Submission::Queued {
                task_id: id.to_string(),
            }));
            api
        }

        fn then(self, reply: Reply) -> Self {
            self.script.lock().unwrap().push_back(reply);
            self
        }

        fn status_calls(&self) -> usize {
            self.status_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationApi for FakeApi {
        async fn submit_generation(&self, _request: &GenerationRequest) -> Result<Submission> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            self.submissions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Submission::Queued {
                    task_id: "t1".into(),
                }))
        }

        async fn get_task_status(&self, task_id: &str) -> Result<TaskStatusReport> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let hook = self.cancel_during_status.lock().unwrap().take();
            if let Some((poller, slot)) = hook {
                poller.cancel(task_id);
                slot.set(RequestState::Idle);
            }
            let reply = self.script.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Report(report)) => Ok(report),
                Some(Reply::Transport) => {
                    Err(serde_json::from_str::<TaskStatusReport>("<html>").unwrap_err().into())
                }
                Some(Reply::Missing) => Err(Error::NotFound(format!("Task {} not found", task_id))),
                None => Ok(running(50)),
            }
        }

        async fn list_generation_options(
            &self,
            _context_id: Option<i64>,
        ) -> Result<Vec<GenerationOption>> {
            self.option_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![GenerationOption {
                name: "Kore".into(),
                description: "Firm".into(),
                is_available: true,
                result_ref: Some("https://cdn/kore.wav".into()),
            }])
        }
    }

    fn report(status: TaskStatus) -> TaskStatusReport {
        TaskStatusReport {
            id: None,
            status,
            progress: None,
            result: None,
            error: None,
            kind: None,
        }
    }

    fn running(current: u64) -> TaskStatusReport {
        TaskStatusReport {
            progress: Some(Progress {
                current,
                total: 100,
                stage: "processing".into(),
            }),
            ..report(TaskStatus::Running)
        }
    }

    fn completed(result: serde_json::Value) -> TaskStatusReport {
        TaskStatusReport {
            result: Some(TaskResult::new(result)),
            ..report(TaskStatus::Completed)
        }
    }

    fn failed(error: &str) -> TaskStatusReport {
        TaskStatusReport {
            error: Some(error.into()),
            ..report(TaskStatus::Failed)
        }
    }

    fn setup(
        api: FakeApi,
        settings: PollSettings,
    ) -> (Arc<FakeApi>, Poller, mpsc::Receiver<PollEvent>) {
        let api = Arc::new(api);
        let (poller, rx) = Poller::new(api.clone(), TaskRegistry::new(), settings);
        (api, poller, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<PollEvent>) -> Vec<PollEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn speech() -> GenerationRequest {
        GenerationRequest::speech("Once upon a time", "Kore").with_context(7)
    }

    async fn settle(slot: &RequestSlot, pred: impl Fn(&RequestState) -> bool) -> RequestState {
        let mut rx = slot.subscribe();
        let state = rx.wait_for(|s| pred(s)).await.unwrap().clone();
        state
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload_refused_without_network() {
        let (api, poller, mut rx) = setup(FakeApi::default(), PollSettings::default());
        let slot = RequestSlot::new();

        let err = poller
            .submit(&slot, GenerationRequest::speech("  ", "Kore"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyPayload));
        assert_eq!(api.submit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(slot.state(), RequestState::Idle);
        assert!(poller.registry().is_empty().await);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [PollEvent::Notify {
                level: NoticeLevel::Warning,
                ..
            }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_failure_returns_to_idle() {
        let api = FakeApi::default();
        api.submissions.lock().unwrap().push_back(Err(Error::Api {
            status: 500,
            message: "Failed to generate speech".into(),
        }));
        let (_api, poller, mut rx) = setup(api, PollSettings::default());
        let slot = RequestSlot::new();

        assert!(poller.submit(&slot, speech()).await.is_err());
        assert_eq!(slot.state(), RequestState::Idle);
        assert!(poller.registry().is_empty().await);
        match drain(&mut rx).as_slice() {
            [PollEvent::Notify { level, message }] => {
                assert_eq!(*level, NoticeLevel::Error);
                assert!(message.contains("Failed to generate speech"));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_result_short_circuits() {
        let api = FakeApi::default();
        api.submissions
            .lock()
            .unwrap()
            .push_back(Ok(Submission::Ready(TaskResult::new(
                json!({ "audioUrl": "https://cdn/cached.wav" }),
            ))));
        let (api, poller, mut rx) = setup(api, PollSettings::default());
        let slot = RequestSlot::new();

        poller.submit(&slot, speech()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(matches!(slot.state(), RequestState::ResultReady(_)));
        assert!(poller.registry().is_empty().await);
        assert_eq!(api.status_calls(), 0);
        assert!(drain(&mut rx).iter().any(|ev| matches!(
            ev,
            PollEvent::ArtifactReady { task_id: None, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_task_registered_and_polled_immediately() {
        let (api, poller, _rx) = setup(FakeApi::queued("t1"), PollSettings::default());
        let slot = RequestSlot::new();

        poller.submit(&slot, speech()).await.unwrap();
        let task = poller.registry().get_task("t1").await.unwrap();
        assert_eq!(task.metadata.option_label.as_deref(), Some("Kore"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.status_calls(), 1);
        assert!(poller.is_polling("t1"));

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(api.status_calls(), 2);
        assert_eq!(
            poller.registry().get_task("t1").await.unwrap().percent(),
            50
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_then_completion_then_removal() {
        let api = FakeApi::queued("t1")
            .then(Reply::Report(running(30)))
            .then(Reply::Report(running(70)))
            .then(Reply::Report(completed(json!({ "audioUrl": "https://cdn/t1.wav" }))));
        let (api, poller, mut rx) = setup(api, PollSettings::default());
        let slot = RequestSlot::new();
        let mut registry_rx = poller.registry().subscribe();

        poller.submit(&slot, speech()).await.unwrap();
        let state = settle(&slot, |s| matches!(s, RequestState::Completed { .. })).await;
        assert_eq!(state.task_id(), Some("t1"));

        // Still visible right after the terminal transition.
        let task = poller.registry().get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(poller.registry().contains("t1").await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!poller.registry().contains("t1").await);

        // No polls after the terminal status.
        assert_eq!(api.status_calls(), 3);
        assert_eq!(api.option_calls.load(Ordering::SeqCst), 1);

        let events = drain(&mut rx);
        assert!(events.iter().any(|ev| matches!(
            ev,
            PollEvent::ArtifactReady { task_id: Some(id), .. } if id == "t1"
        )));
        assert!(events.iter().any(|ev| matches!(
            ev,
            PollEvent::OptionsRefreshed { context_id: Some(7), options } if options.len() == 1
        )));

        let mut seen = Vec::new();
        while let Ok(ev) = registry_rx.try_recv() {
            seen.push(ev);
        }
        assert_eq!(seen.first(), Some(&shelf_proto::RegistryEvent::Added("t1".into())));
        assert_eq!(seen.last(), Some(&shelf_proto::RegistryEvent::Removed("t1".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_persists() {
        let api = FakeApi::queued("t1").then(Reply::Report(failed("quota exceeded")));
        let (_api, poller, mut rx) = setup(api, PollSettings::default());
        let slot = RequestSlot::new();

        poller.submit(&slot, speech()).await.unwrap();
        let state = settle(&slot, |s| matches!(s, RequestState::Failed { .. })).await;
        assert_eq!(
            state,
            RequestState::Failed {
                task_id: "t1".into(),
                error: "quota exceeded".into()
            }
        );

        tokio::time::sleep(Duration::from_secs(3600)).await;
        let task = poller.registry().get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("quota exceeded"));
        assert!(drain(&mut rx).iter().any(|ev| matches!(
            ev,
            PollEvent::Notify { level: NoticeLevel::Error, message } if message.contains("quota exceeded")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_completion_reports_error() {
        let api = FakeApi::queued("t1").then(Reply::Report(completed(json!({ "voice": "Kore" }))));
        let (api, poller, mut rx) = setup(api, PollSettings::default());
        let slot = RequestSlot::new();

        poller.submit(&slot, speech()).await.unwrap();
        settle(&slot, |s| matches!(s, RequestState::Failed { .. })).await;

        let task = poller.registry().get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        let events = drain(&mut rx);
        assert!(!events
            .iter()
            .any(|ev| matches!(ev, PollEvent::ArtifactReady { .. })));
        assert!(events.iter().any(|ev| matches!(
            ev,
            PollEvent::Notify { level: NoticeLevel::Error, .. }
        )));
        assert_eq!(api.option_calls.load(Ordering::SeqCst), 0);

        // Cleanup still follows the COMPLETED rule.
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(poller.registry().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling_and_keeps_entry() {
        let (api, poller, _rx) = setup(FakeApi::queued("t1"), PollSettings::default());
        let slot = RequestSlot::new();

        poller.submit(&slot, speech()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.status_calls(), 1);

        assert!(poller.cancel("t1"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.status_calls(), 1);
        assert!(!poller.is_polling("t1"));
        assert!(poller.registry().contains("t1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_poller_cancels_chains() {
        let (api, poller, _rx) = setup(FakeApi::queued("t1"), PollSettings::default());
        let registry = poller.registry().clone();
        let slot = RequestSlot::new();

        poller.submit(&slot, speech()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(poller);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(api.status_calls() <= 2);
        assert!(registry.contains("t1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_task_id_single_chain() {
        let api = FakeApi::queued("same");
        api.submissions.lock().unwrap().push_back(Ok(Submission::Queued {
            task_id: "same".into(),
        }));
        let (api, poller, _rx) = setup(api, PollSettings::default());

        poller.submit(&RequestSlot::new(), speech()).await.unwrap();
        poller.submit(&RequestSlot::new(), speech()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(poller.registry().len().await, 1);
        assert_eq!(poller.active_polls(), 1);
        assert_eq!(api.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_concurrent_tasks() {
        let api = FakeApi::queued("a");
        api.submissions.lock().unwrap().push_back(Ok(Submission::Queued {
            task_id: "b".into(),
        }));
        let (_api, poller, _rx) = setup(api, PollSettings::default());
        let (slot_a, slot_b) = (RequestSlot::new(), RequestSlot::new());

        poller.submit(&slot_a, speech()).await.unwrap();
        poller.submit(&slot_b, speech()).await.unwrap();
        assert_eq!(poller.active_polls(), 2);

        poller.cancel("a");
        poller.registry().remove_task("a").await;
        assert!(poller.registry().contains("b").await);
        assert!(poller.is_polling("b"));
        assert_eq!(slot_b.state().task_id(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_policy_keeps_last_state() {
        let api = FakeApi::queued("t1")
            .then(Reply::Report(running(40)))
            .then(Reply::Transport);
        let (api, poller, _rx) = setup(api, PollSettings::default());
        let slot = RequestSlot::new();

        poller.submit(&slot, speech()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(api.status_calls(), 2);
        let task = poller.registry().get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.percent(), 40);
        assert!(matches!(slot.state(), RequestState::Polling { .. }));
        assert!(!poller.is_polling("t1"));
    }

    fn retrying(max_retries: u32) -> PollSettings {
        PollSettings {
            transient_errors: TransientErrorPolicy::Retry,
            max_retries,
            retry_backoff: Duration::from_millis(1000),
            ..PollSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_fails_after_limit() {
        let api = FakeApi::queued("t1")
            .then(Reply::Transport)
            .then(Reply::Transport)
            .then(Reply::Report(running(10)))
            .then(Reply::Transport)
            .then(Reply::Transport)
            .then(Reply::Transport);
        let (api, poller, _rx) = setup(api, retrying(2));
        let slot = RequestSlot::new();

        poller.submit(&slot, speech()).await.unwrap();
        settle(&slot, |s| matches!(s, RequestState::Failed { .. })).await;

        assert_eq!(api.status_calls(), 6);
        let task = poller.registry().get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_single_failure_is_not_fatal() {
        let api = FakeApi::queued("t1")
            .then(Reply::Transport)
            .then(Reply::Report(completed(json!({ "audioUrl": "https://cdn/t1.wav" }))));
        let (_api, poller, _rx) = setup(api, retrying(3));
        let slot = RequestSlot::new();

        poller.submit(&slot, speech()).await.unwrap();
        settle(&slot, |s| matches!(s, RequestState::Completed { .. })).await;
        assert_eq!(
            poller.registry().get_task("t1").await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_not_found_fails_immediately() {
        let api = FakeApi::queued("t1").then(Reply::Missing);
        let (api, poller, _rx) = setup(api, retrying(5));
        let slot = RequestSlot::new();

        poller.submit(&slot, speech()).await.unwrap();
        settle(&slot, |s| matches!(s, RequestState::Failed { .. })).await;
        assert_eq!(api.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_poll_keeps_released_slot_idle() {
        let api = FakeApi::queued("t1").then(Reply::Report(running(40)));
        let (api, poller, mut rx) = setup(api, PollSettings::default());
        let slot = RequestSlot::new();
        *api.cancel_during_status.lock().unwrap() = Some((poller.clone(), slot.clone()));

        poller.submit(&slot, speech()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(slot.state(), RequestState::Idle);
        assert_eq!(api.status_calls(), 1);
        assert!(!poller.is_polling("t1"));

        // The report that raced the cancel is not applied either.
        let task = poller.registry().get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.percent(), 0);
        assert!(drain(&mut rx)
            .iter()
            .all(|ev| matches!(ev, PollEvent::Notify { level: NoticeLevel::Info, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_poll_drops_completion() {
        let api = FakeApi::queued("t1")
            .then(Reply::Report(completed(json!({ "audioUrl": "https://cdn/t1.wav" }))));
        let (api, poller, mut rx) = setup(api, PollSettings::default());
        let slot = RequestSlot::new();
        *api.cancel_during_status.lock().unwrap() = Some((poller.clone(), slot.clone()));

        poller.submit(&slot, speech()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(slot.state(), RequestState::Idle);
        assert_eq!(api.option_calls.load(Ordering::SeqCst), 0);
        assert!(!drain(&mut rx)
            .iter()
            .any(|ev| matches!(ev, PollEvent::ArtifactReady { .. })));
        assert_eq!(
            poller.registry().get_task("t1").await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn test_cancelled_slot_write_is_dropped() {
        let slot = RequestSlot::new();
        let cancel = CancellationToken::new();
        assert!(slot.set_unless_cancelled(&cancel, RequestState::Submitting));
        assert_eq!(slot.state(), RequestState::Submitting);

        cancel.cancel();
        slot.set(RequestState::Idle);
        assert!(!slot.set_unless_cancelled(
            &cancel,
            RequestState::Polling {
                task_id: "t".into(),
                progress: None,
            }
        ));
        assert_eq!(slot.state(), RequestState::Idle);
    }

    #[test]
    fn test_zero_config_delays_are_floored() {
        let mut config = Config::default();
        config.polling.interval_ms = 0;
        config.polling.retry_backoff_ms = 0;
        let settings = PollSettings::from_config(&config);
        assert!(settings.interval > Duration::ZERO);
        assert!(settings.backoff(1) > Duration::ZERO);
    }

    #[test]
    fn test_linear_backoff() {
        let settings = retrying(3);
        assert_eq!(settings.backoff(1), Duration::from_millis(1000));
        assert_eq!(settings.backoff(3), Duration::from_millis(3000));
    }
}
