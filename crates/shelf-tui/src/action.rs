//! Action enum: user intents produced by components, dispatched by the App.

use crate::widgets::toast::Severity;

/// Unique identifier for a focusable component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentId {
    SpeechPanel,
    TaskPanel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Quit,
    FocusNext,

    // ── Generation ───────────────────────────────────────────────────────────
    /// Submit `text` for narration with `voice`.
    Generate { text: String, voice: String },
    /// Hand a finished artifact to the player.
    Play(String),
    /// The option list in `AppState` was replaced.
    OptionsUpdated,
    ReloadOptions,

    // ── Task tracker ─────────────────────────────────────────────────────────
    DismissTask(String),
    StopPolling(String),
    ClearTasks,
    ToggleTracker,

    Notify(Severity, String),
}
