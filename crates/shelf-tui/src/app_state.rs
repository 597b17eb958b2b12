//! Data shared read-only with every component.

use std::collections::HashMap;

use shelf_client::RequestState;
use shelf_proto::protocol::{GenerationOption, TrackedTask};

#[derive(Debug, Default)]
pub struct AppState {
    /// Registry snapshot, insertion order.
    pub tasks: Vec<TrackedTask>,
    pub options: Vec<GenerationOption>,
    pub options_loading: bool,
    /// Local request state per voice name.
    pub requests: HashMap<String, RequestState>,
    pub context_id: Option<i64>,
    /// Last WARN/ERROR line from the log.
    pub last_log: Option<String>,
}

impl AppState {
    pub fn request(&self, voice: &str) -> &RequestState {
        static IDLE: RequestState = RequestState::Idle;
        self.requests.get(voice).unwrap_or(&IDLE)
    }
}
