use serde::{Deserialize, Serialize};

/// Category of a generation task.  Purely descriptive: it picks the submit
/// route and the presentation, never the lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskKind {
    #[serde(rename = "TTS", alias = "SPEECH_SYNTHESIS")]
    SpeechSynthesis,
    #[serde(rename = "TRANSLATION", alias = "TRANSLATE")]
    Translation,
    #[serde(rename = "SUMMARY")]
    Summary,
    #[serde(rename = "COMIC", alias = "IMAGE_GENERATION")]
    ImageGeneration,
}

impl TaskKind {
    /// Short label for badges (≤5 chars).
    pub fn badge_label(&self) -> &'static str {
        match self {
            TaskKind::SpeechSynthesis => "TTS",
            TaskKind::Translation => "TRANS",
            TaskKind::Summary => "SUMM",
            TaskKind::ImageGeneration => "COMIC",
        }
    }

    /// Headline shown by progress views while the task is in flight.
    pub fn title(&self) -> &'static str {
        match self {
            TaskKind::SpeechSynthesis => "Generating narration",
            TaskKind::Translation => "Translating",
            TaskKind::Summary => "Summarising",
            TaskKind::ImageGeneration => "Drawing comic",
        }
    }

    /// Result fields that must be present in a COMPLETED payload for this
    /// kind.  Any one of them is enough.
    pub fn result_fields(&self) -> &'static [&'static str] {
        match self {
            TaskKind::SpeechSynthesis => &["audioUrl", "url"],
            TaskKind::Translation => &["translation"],
            TaskKind::Summary => &["summary"],
            TaskKind::ImageGeneration => &["pageCount", "comic_data"],
        }
    }
}

/// Lifecycle status of a task.
///
/// Transitions:
///   Pending -> Running -> Completed | Failed
///   Pending -> Completed | Failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    #[serde(alias = "PROCESSING")]
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Progress report as produced by the processing backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Progress {
    #[serde(default)]
    pub current: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub stage: String,
}

impl Progress {
    /// Seed value recorded the moment a task id is first received.
    pub fn seed() -> Self {
        Self {
            current: 0,
            total: 100,
            stage: "init".to_string(),
        }
    }

    /// Whole-number percentage, 0 when `total` is 0, never above 100.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = (self.current as f64 / self.total as f64 * 100.0).round();
        pct.clamp(0.0, 100.0) as u8
    }

    /// Human readable description of the current stage.
    pub fn label(&self) -> String {
        match self.stage.as_str() {
            "uploading" => "uploading".to_string(),
            "processing" | "translating" | "generating_images" => {
                format!("processing {}/{}", self.current, self.total)
            }
            _ => "initialising".to_string(),
        }
    }
}

/// Percentage for an optional progress value (absent progress renders as 0).
pub fn progress_percent(progress: Option<&Progress>) -> u8 {
    progress.map(Progress::percent).unwrap_or(0)
}

/// Opaque payload of a finished task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct TaskResult(pub serde_json::Value);

impl TaskResult {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// True when the payload carries one of the fields expected for `kind`.
    pub fn has_expected_field(&self, kind: TaskKind) -> bool {
        kind.result_fields().iter().any(|field| {
            self.0
                .get(*field)
                .map(|v| !v.is_null())
                .unwrap_or(false)
        })
    }

    /// Resource locator of the produced artifact, if the payload has one.
    pub fn artifact_ref(&self) -> Option<&str> {
        ["audioUrl", "url", "secure_url"]
            .iter()
            .find_map(|field| self.0.get(*field).and_then(|v| v.as_str()))
            .filter(|s| !s.is_empty())
    }

    /// First string-valued expected field for `kind` (a URL, a translated
    /// text, a summary).
    pub fn primary_text(&self, kind: TaskKind) -> Option<&str> {
        kind.result_fields()
            .iter()
            .find_map(|field| self.0.get(*field).and_then(|v| v.as_str()))
    }
}

/// Display labels attached at submission time.  The polling machinery never
/// touches these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_title: Option<String>,
    /// Selected option, e.g. the voice name or target language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_label: Option<String>,
}

/// One entry of the task registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedTask {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub submitted_at: chrono::DateTime<chrono::Local>,
    /// Set by the registry on insert, so a dismissed id that comes back is
    /// a different entry from the one it replaced.
    #[serde(skip)]
    pub generation: u64,
}

impl TrackedTask {
    /// A freshly queued task: PENDING with the seed progress value.
    pub fn pending(id: impl Into<String>, kind: TaskKind, metadata: TaskMetadata) -> Self {
        Self {
            id: id.into(),
            kind,
            status: TaskStatus::Pending,
            progress: Some(Progress::seed()),
            result: None,
            error: None,
            metadata,
            submitted_at: chrono::Local::now(),
            generation: 0,
        }
    }

    /// Merge a partial update.  `metadata`, `id` and `kind` are never patched.
    pub fn apply(&mut self, patch: TaskPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = Some(progress);
        }
        if let Some(result) = patch.result {
            self.result = Some(result);
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
    }

    pub fn percent(&self) -> u8 {
        progress_percent(self.progress.as_ref())
    }
}

/// Partial update for a tracked task.  `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<Progress>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: Option<Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_result(mut self, result: Option<TaskResult>) -> Self {
        self.result = result;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

// ── Wire types (external processing API) ─────────────────────────────────────

/// What the caller wants generated.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub kind: TaskKind,
    /// Content to process.
    pub text: String,
    /// Selection parameter: voice name for TTS, target language for
    /// translation.  Ignored by the other kinds.
    pub option: Option<String>,
    /// Backend context (chapter id).  Lets the backend use cached artifacts
    /// and stored content.
    pub context_id: Option<i64>,
    pub metadata: TaskMetadata,
}

impl GenerationRequest {
    pub fn speech(text: impl Into<String>, voice: impl Into<String>) -> Self {
        let voice = voice.into();
        Self {
            kind: TaskKind::SpeechSynthesis,
            text: text.into(),
            option: Some(voice.clone()),
            context_id: None,
            metadata: TaskMetadata {
                option_label: Some(voice),
                ..TaskMetadata::default()
            },
        }
    }

    pub fn with_context(mut self, context_id: i64) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn with_metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// A request with blank text and no backend context has nothing to process.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.context_id.is_none()
    }
}

/// Raw submission reply.  The backend answers with either a task id or an
/// immediately available result; which one is decided by
/// [`SubmitReply::into_submission`].
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReply {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// Discriminated submission outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Finished synchronously; nothing to poll.
    Ready(TaskResult),
    /// Accepted for background processing under `task_id`.
    Queued { task_id: String },
}

impl SubmitReply {
    pub fn into_submission(self) -> Submission {
        if let Some(task_id) = self.task_id.filter(|id| !id.is_empty()) {
            return Submission::Queued { task_id };
        }
        if let Some(result) = self.result {
            return Submission::Ready(TaskResult(result));
        }
        // TTS answers `{audioUrl, message, voice}` and cached comics answer
        // `{comic_data, ...}` at the top level.
        let mut body = self.rest;
        if let Some(message) = self.message {
            body.insert("message".to_string(), serde_json::Value::String(message));
        }
        Submission::Ready(TaskResult(serde_json::Value::Object(body)))
    }
}

/// Body of `GET tasks/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusReport {
    #[serde(default)]
    pub id: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<TaskKind>,
}

/// A selectable generation option (a voice) and whether an artifact for it
/// already exists for the current context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOption {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_available: bool,
    #[serde(default, alias = "url", skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

/// Pick the default option: `preferred` by name if listed, else the first.
pub fn default_option<'a>(
    options: &'a [GenerationOption],
    preferred: &str,
) -> Option<&'a GenerationOption> {
    options
        .iter()
        .find(|o| o.name == preferred)
        .or_else(|| options.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_processing_is_running() {
        let report: TaskStatusReport =
            serde_json::from_value(json!({ "id": "t1", "status": "PROCESSING" })).unwrap();
        assert_eq!(report.status, TaskStatus::Running);
        assert!(!report.status.is_terminal());
    }

    #[test]
    fn test_status_report_full() {
        let report: TaskStatusReport = serde_json::from_value(json!({
            "id": "t1",
            "status": "COMPLETED",
            "result": { "audioUrl": "https://cdn/x.wav" },
            "error": null,
            "progress": { "current": 10, "total": 10, "stage": "completed" },
            "type": "TTS"
        }))
        .unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(report.kind, Some(TaskKind::SpeechSynthesis));
        let result = report.result.unwrap();
        assert_eq!(result.artifact_ref(), Some("https://cdn/x.wav"));
        assert!(result.has_expected_field(TaskKind::SpeechSynthesis));
        assert!(!result.has_expected_field(TaskKind::Translation));
    }

    #[test]
    fn test_percent_sequence_is_monotonic() {
        let seq: Vec<u8> = [0u64, 30, 70, 100]
            .iter()
            .map(|c| {
                Progress {
                    current: *c,
                    total: 100,
                    stage: "processing".into(),
                }
                .percent()
            })
            .collect();
        assert_eq!(seq, vec![0, 30, 70, 100]);
    }

    #[test]
    fn test_percent_edge_cases() {
        assert_eq!(progress_percent(None), 0);
        let zero_total = Progress {
            current: 5,
            total: 0,
            stage: String::new(),
        };
        assert_eq!(zero_total.percent(), 0);
        let third = Progress {
            current: 1,
            total: 3,
            stage: String::new(),
        };
        assert_eq!(third.percent(), 33);
        let over = Progress {
            current: 12,
            total: 10,
            stage: String::new(),
        };
        assert_eq!(over.percent(), 100);
    }

    #[test]
    fn test_stage_labels() {
        let mut p = Progress::seed();
        assert_eq!(p.label(), "initialising");
        p.stage = "uploading".into();
        assert_eq!(p.label(), "uploading");
        p.stage = "translating".into();
        p.current = 3;
        p.total = 8;
        assert_eq!(p.label(), "processing 3/8");
    }

    #[test]
    fn test_submit_reply_with_task_id_is_queued() {
        let reply: SubmitReply = serde_json::from_value(json!({
            "taskId": "abc",
            "message": "Translation task started",
            "status": "PENDING"
        }))
        .unwrap();
        assert_eq!(
            reply.into_submission(),
            Submission::Queued {
                task_id: "abc".into()
            }
        );
    }

    #[test]
    fn test_submit_reply_top_level_audio_url_is_ready() {
        let reply: SubmitReply = serde_json::from_value(json!({
            "audioUrl": "https://cdn/a.wav",
            "message": "Retrieved from cache",
            "voice": "Kore"
        }))
        .unwrap();
        match reply.into_submission() {
            Submission::Ready(result) => {
                assert_eq!(result.artifact_ref(), Some("https://cdn/a.wav"));
                assert!(result.has_expected_field(TaskKind::SpeechSynthesis));
            }
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[test]
    fn test_submit_reply_nested_result_is_ready() {
        let reply: SubmitReply = serde_json::from_value(json!({
            "status": "COMPLETED",
            "result": { "translation": "xin chào", "language": "Vietnamese" }
        }))
        .unwrap();
        match reply.into_submission() {
            Submission::Ready(result) => {
                assert_eq!(
                    result.primary_text(TaskKind::Translation),
                    Some("xin chào")
                );
            }
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_task_id_is_not_queued() {
        let reply: SubmitReply =
            serde_json::from_value(json!({ "taskId": "", "url": "https://cdn/b.wav" })).unwrap();
        assert!(matches!(reply.into_submission(), Submission::Ready(_)));
    }

    #[test]
    fn test_patch_keeps_metadata() {
        let meta = TaskMetadata {
            book_title: Some("Book".into()),
            chapter_title: Some("Ch 1".into()),
            option_label: Some("Kore".into()),
        };
        let mut task = TrackedTask::pending("t", TaskKind::SpeechSynthesis, meta.clone());
        task.apply(
            TaskPatch::status(TaskStatus::Failed).with_error("quota exceeded"),
        );
        assert_eq!(task.metadata, meta);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("quota exceeded"));
        // Progress untouched by a patch without progress.
        assert_eq!(task.progress, Some(Progress::seed()));
    }

    #[test]
    fn test_default_option() {
        let opts = vec![
            GenerationOption {
                name: "Zephyr".into(),
                description: "Bright".into(),
                is_available: false,
                result_ref: None,
            },
            GenerationOption {
                name: "Kore".into(),
                description: "Firm".into(),
                is_available: true,
                result_ref: Some("https://cdn/k.wav".into()),
            },
        ];
        assert_eq!(default_option(&opts, "Kore").unwrap().name, "Kore");
        assert_eq!(default_option(&opts, "Puck").unwrap().name, "Zephyr");
        assert!(default_option(&[], "Kore").is_none());
    }

    #[test]
    fn test_request_emptiness() {
        assert!(GenerationRequest::speech("   ", "Kore").is_empty());
        assert!(!GenerationRequest::speech("   ", "Kore")
            .with_context(7)
            .is_empty());
        assert!(!GenerationRequest::speech("hello", "Kore").is_empty());
    }
}
