//! App: component-based event loop.
//!
//! - `App` owns the components and `AppState` (read-only data for components).
//! - Background tasks feed `AppMessage`s in over one `tokio::mpsc` channel:
//!   terminal input, registry changes, poller events, request states and
//!   forwarded log lines.
//! - Components return `Vec<Action>`; the App dispatches each Action.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use ratatui::crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    text::{Line, Span},
    widgets::Paragraph,
    Terminal,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use shelf_client::{GenerationApi, PollEvent, PollSettings, Poller, RequestSlot, RequestState};
use shelf_proto::config::Config;
use shelf_proto::protocol::{GenerationOption, GenerationRequest, TaskKind, TaskMetadata};
use shelf_proto::registry::TaskRegistry;

use crate::action::{Action, ComponentId};
use crate::app_state::AppState;
use crate::component::Component;
use crate::components::{speech_panel::SpeechPanel, task_panel::TaskPanel};
use crate::player::Player;
use crate::theme::{style_muted, style_secondary};
use crate::widgets::toast::ToastManager;

/// Longest translated/summarised text shown in a toast.
const PREVIEW_CHARS: usize = 48;

#[derive(Debug)]
pub enum AppMessage {
    Event(Event),
    TasksChanged,
    Poll(PollEvent),
    Request(String, RequestState),
    Options(Result<Vec<GenerationOption>, String>),
    Log(String),
}

pub struct App {
    config: Config,
    pub state: AppState,

    // ── Components ────────────────────────────────────────────────────────────
    speech: SpeechPanel,
    tasks: TaskPanel,
    focus: ComponentId,

    // ── Task tracking ─────────────────────────────────────────────────────────
    api: Arc<dyn GenerationApi>,
    registry: TaskRegistry,
    poller: Poller,
    poll_events: Option<mpsc::Receiver<PollEvent>>,
    /// One request slot per voice, so voices generate independently.
    slots: HashMap<String, RequestSlot>,

    tx: Option<mpsc::Sender<AppMessage>>,
    toast: ToastManager,
    player: Player,
    should_quit: bool,
}

impl App {
    pub fn new(config: Config, api: Arc<dyn GenerationApi>, registry: TaskRegistry) -> Self {
        let (poller, poll_events) = Poller::new(
            api.clone(),
            registry.clone(),
            PollSettings::from_config(&config),
        );
        let state = AppState {
            context_id: config.ui.context_id,
            ..AppState::default()
        };
        Self {
            speech: SpeechPanel::new(config.ui.default_option.clone()),
            tasks: TaskPanel::new(),
            focus: ComponentId::SpeechPanel,
            player: Player::new(config.ui.player.clone()),
            config,
            state,
            api,
            registry,
            poller,
            poll_events: Some(poll_events),
            slots: HashMap::new(),
            tx: None,
            toast: ToastManager::new(),
            should_quit: false,
        }
    }

    /// Wire the background forwarders into `tx`.  Called by `run`, and
    /// directly by tests that drive the App without a terminal.
    fn start_background(&mut self, tx: mpsc::Sender<AppMessage>) {
        self.tx = Some(tx.clone());

        // ── Registry changes → fresh snapshot ────────────────────────────────
        let mut registry_rx = self.registry.subscribe();
        let reg_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match registry_rx.recv().await {
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("registry receiver lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if reg_tx.send(AppMessage::TasksChanged).await.is_err() {
                    break;
                }
            }
        });

        // ── Poller outcomes ──────────────────────────────────────────────────
        if let Some(mut events) = self.poll_events.take() {
            let poll_tx = tx;
            tokio::spawn(async move {
                while let Some(ev) = events.recv().await {
                    if poll_tx.send(AppMessage::Poll(ev)).await.is_err() {
                        break;
                    }
                }
            });
        }

        self.reload_options();
    }

    pub async fn run(mut self, mut log_rx: broadcast::Receiver<String>) -> anyhow::Result<()> {
        debug!("run(): enabling raw mode");
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let (tx, mut rx) = mpsc::channel::<AppMessage>(1024);

        // ── Keyboard events ───────────────────────────────────────────────────
        let event_tx = tx.clone();
        tokio::task::spawn_blocking(move || loop {
            match event::read() {
                Ok(ev) => {
                    if event_tx.blocking_send(AppMessage::Event(ev)).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        });

        // ── WARN/ERROR lines from the tracing layer ──────────────────────────
        let log_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match log_rx.recv().await {
                    Ok(line) => {
                        if log_tx.send(AppMessage::Log(line)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.start_background(tx);
        info!("shelf ui started");

        // Toast expiry + spinner animation
        let mut ui_tick = tokio::time::interval(Duration::from_millis(100));
        ui_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // ── Main loop ─────────────────────────────────────────────────────────
        let mut needs_redraw = true;
        loop {
            if needs_redraw {
                terminal.draw(|f| self.draw(f))?;
                needs_redraw = false;
            }

            if self.should_quit {
                break;
            }

            tokio::select! {
                Some(msg) = rx.recv() => {
                    needs_redraw |= self.handle_message(msg).await;
                    // Drain whatever queued up behind it before the next frame.
                    while let Ok(msg) = rx.try_recv() {
                        needs_redraw |= self.handle_message(msg).await;
                    }
                }
                _ = ui_tick.tick() => {
                    self.toast.tick();
                    self.speech.tick(&self.state);
                    self.tasks.tick(&self.state);
                    needs_redraw = true;
                }
            }
        }

        // ── Teardown ──────────────────────────────────────────────────────────
        // Polling belongs to this view; registry entries are left as they are.
        self.poller.cancel_all();
        self.player.stop();
        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        Ok(())
    }

    // ── Message handler ───────────────────────────────────────────────────────

    /// Returns `true` if the message requires a redraw.
    async fn handle_message(&mut self, msg: AppMessage) -> bool {
        match msg {
            AppMessage::Event(Event::Key(key)) => {
                if key.kind == KeyEventKind::Release {
                    return false;
                }
                for action in self.handle_key(key) {
                    self.dispatch(action);
                }
            }
            AppMessage::Event(Event::Resize(_, _)) => {}
            AppMessage::Event(_) => return false,
            AppMessage::TasksChanged => {
                self.state.tasks = self.registry.list_tasks().await;
            }
            AppMessage::Poll(ev) => self.on_poll_event(ev),
            AppMessage::Request(voice, request) => {
                self.state.requests.insert(voice, request);
            }
            AppMessage::Options(Ok(options)) => {
                debug!("loaded {} voices", options.len());
                self.state.options_loading = false;
                self.state.options = options;
                self.dispatch(Action::OptionsUpdated);
            }
            AppMessage::Options(Err(e)) => {
                self.state.options_loading = false;
                self.toast.error(format!("Could not load voices: {}", e));
            }
            AppMessage::Log(line) => {
                self.state.last_log = Some(line);
            }
        }
        true
    }

    fn on_poll_event(&mut self, ev: PollEvent) {
        match ev {
            PollEvent::Notify { level, message } => self.toast.notify(level.into(), message),
            PollEvent::ArtifactReady { kind, result, .. } => match kind {
                TaskKind::SpeechSynthesis => match result.artifact_ref() {
                    Some(url) => {
                        let url = url.to_string();
                        self.play(&url);
                    }
                    None => self.toast.warning("Narration finished without audio"),
                },
                TaskKind::Translation | TaskKind::Summary => {
                    let text = result.primary_text(kind).unwrap_or_default();
                    self.toast.info(preview(text, PREVIEW_CHARS));
                }
                TaskKind::ImageGeneration => {
                    let pages = result.0.get("pageCount").and_then(|v| v.as_u64());
                    self.toast.info(match pages {
                        Some(n) => format!("Comic ready: {} pages", n),
                        None => "Comic ready".to_string(),
                    });
                }
            },
            PollEvent::OptionsRefreshed { options, .. } => {
                self.state.options = options;
                self.dispatch(Action::OptionsUpdated);
            }
        }
    }

    // ── Input ─────────────────────────────────────────────────────────────────

    fn focused(&mut self) -> &mut dyn Component {
        match self.focus {
            ComponentId::SpeechPanel => &mut self.speech,
            ComponentId::TaskPanel => &mut self.tasks,
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Vec<Action> {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return vec![Action::Quit];
        }
        if self.focused().is_editing() {
            let state = std::mem::take(&mut self.state);
            let actions = self.focused().handle_key(key, &state);
            self.state = state;
            return actions;
        }
        match key.code {
            KeyCode::Char('q') => vec![Action::Quit],
            KeyCode::Tab | KeyCode::BackTab => vec![Action::FocusNext],
            KeyCode::Char('m') => vec![Action::ToggleTracker],
            _ => {
                let state = std::mem::take(&mut self.state);
                let actions = self.focused().handle_key(key, &state);
                self.state = state;
                actions
            }
        }
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    fn dispatch(&mut self, action: Action) {
        match action {
            Action::Quit => self.should_quit = true,
            Action::FocusNext => {
                self.focus = match self.focus {
                    ComponentId::SpeechPanel if !self.tasks.is_minimized() => {
                        ComponentId::TaskPanel
                    }
                    _ => ComponentId::SpeechPanel,
                };
            }
            Action::Generate { text, voice } => self.generate(text, voice),
            Action::Play(url) => self.play(&url),
            Action::ReloadOptions => self.reload_options(),
            Action::DismissTask(id) => {
                self.poller.cancel(&id);
                self.release_slots(|task_id| task_id == id);
                let registry = self.registry.clone();
                tokio::spawn(async move {
                    registry.remove_task(&id).await;
                });
            }
            Action::StopPolling(id) => {
                if self.poller.cancel(&id) {
                    self.toast.info("Stopped following task");
                }
                self.release_slots(|task_id| task_id == id);
            }
            Action::ClearTasks => {
                self.poller.cancel_all();
                self.release_slots(|_| true);
                let registry = self.registry.clone();
                tokio::spawn(async move {
                    registry.clear_all_tasks().await;
                });
            }
            Action::Notify(severity, message) => self.toast.notify(severity, message),
            Action::OptionsUpdated | Action::ToggleTracker => {
                if action == Action::ToggleTracker
                    && !self.tasks.is_minimized()
                    && self.focus == ComponentId::TaskPanel
                {
                    self.focus = ComponentId::SpeechPanel;
                }
                let mut follow_up = self.speech.on_action(&action, &self.state);
                follow_up.extend(self.tasks.on_action(&action, &self.state));
                for a in follow_up {
                    self.dispatch(a);
                }
            }
        }
    }

    /// Slot for `voice`, created on first use with a forwarder that reports
    /// its state changes to the event loop.
    fn slot_for(&mut self, voice: &str) -> RequestSlot {
        if let Some(slot) = self.slots.get(voice) {
            return slot.clone();
        }
        let slot = RequestSlot::new();
        if let Some(tx) = self.tx.clone() {
            let mut rx = slot.subscribe();
            let name = voice.to_string();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let state = rx.borrow_and_update().clone();
                    if tx.send(AppMessage::Request(name.clone(), state)).await.is_err() {
                        break;
                    }
                }
            });
        }
        self.slots.insert(voice.to_string(), slot.clone());
        slot
    }

    /// Put slots whose task is no longer followed back to Idle.
    fn release_slots(&mut self, matches: impl Fn(&str) -> bool) {
        for slot in self.slots.values() {
            let state = slot.state();
            if state.is_busy() && state.task_id().map(&matches).unwrap_or(false) {
                slot.set(RequestState::Idle);
            }
        }
    }

    fn generate(&mut self, text: String, voice: String) {
        let metadata = TaskMetadata {
            book_title: self.config.ui.book_title.clone(),
            chapter_title: self.config.ui.chapter_title.clone(),
            option_label: Some(voice.clone()),
        };
        let mut request = GenerationRequest::speech(text, voice.clone()).with_metadata(metadata);
        if let Some(id) = self.config.ui.context_id {
            request = request.with_context(id);
        }

        let slot = self.slot_for(&voice);
        let poller = self.poller.clone();
        tokio::spawn(async move {
            // Rejections are already reported on the poll event channel.
            if let Err(e) = poller.submit(&slot, request).await {
                debug!("submit for {} rejected: {}", voice, e);
            }
        });
    }

    fn reload_options(&mut self) {
        let Some(tx) = self.tx.clone() else {
            return;
        };
        self.state.options_loading = true;
        let api = self.api.clone();
        let context_id = self.config.ui.context_id;
        tokio::spawn(async move {
            let result = api
                .list_generation_options(context_id)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(AppMessage::Options(result)).await;
        });
    }

    fn play(&mut self, url: &str) {
        match self.player.play(url) {
            Ok(()) => self.toast.info("Playing narration"),
            Err(e) => {
                warn!("player {} failed: {}", self.config.ui.player, e);
                self.toast
                    .warning(format!("Cannot start {}; audio at {}", self.config.ui.player, url));
            }
        }
    }

    // ── Rendering ─────────────────────────────────────────────────────────────

    fn draw(&mut self, frame: &mut ratatui::Frame) {
        let area = frame.area();
        let tracker_h = self.tasks.desired_height(&self.state);
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Min(6),
                Constraint::Length(tracker_h),
                Constraint::Length(1),
            ])
            .split(area);

        let speech_focused = self.focus == self.speech.id();
        let tasks_focused = self.focus == self.tasks.id();
        self.speech.draw(frame, rows[0], speech_focused, &self.state);
        self.tasks.draw(frame, rows[1], tasks_focused, &self.state);

        let status = match &self.state.last_log {
            Some(line) => Line::from(Span::styled(format!(" {}", line), style_secondary())),
            None => Line::from(Span::styled(
                " q quit · tab focus · m minimize tracker · x dismiss · s stop · C clear",
                style_muted(),
            )),
        };
        frame.render_widget(Paragraph::new(status), rows[2]);

        self.toast.draw(frame, area);
    }
}

/// First `max` characters of `text` on one line, with an ellipsis if cut.
fn preview(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let mut cut: String = flat.chars().take(max).collect();
    cut.push('…');
    cut
}
