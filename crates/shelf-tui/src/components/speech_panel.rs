//! SpeechPanel: passage editor, voice list and per-voice generation state.

use ratatui::crossterm::event::{KeyCode, KeyEvent};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::Style,
    text::{Line, Span},
    widgets::Paragraph,
    Frame,
};
use unicode_width::UnicodeWidthStr;

use shelf_client::RequestState;
use shelf_proto::protocol::{default_option, GenerationOption};

use crate::action::{Action, ComponentId};
use crate::app_state::AppState;
use crate::component::Component;
use crate::theme::{
    style_default, style_muted, style_secondary, style_selected, style_selected_focused, C_DONE,
    C_ERROR, C_RUNNING, C_TAG,
};
use crate::widgets::pane_chrome::{pane_chrome, Badge};
use crate::widgets::text_input::{InputAction, TextInput};
use crate::widgets::toast::Severity;

pub struct SpeechPanel {
    input: TextInput,
    selected: usize,
    /// Name of the selected voice, so a refreshed list keeps the selection.
    selected_name: Option<String>,
    /// Voice picked when the list first loads.
    preferred: String,
}

impl SpeechPanel {
    pub fn new(preferred: impl Into<String>) -> Self {
        Self {
            input: TextInput::new("press i and type the passage to narrate"),
            selected: 0,
            selected_name: None,
            preferred: preferred.into(),
        }
    }

    fn select(&mut self, index: usize, state: &AppState) {
        self.selected = index;
        self.selected_name = state.options.get(index).map(|o| o.name.clone());
    }

    pub fn selected_option<'a>(&self, state: &'a AppState) -> Option<&'a GenerationOption> {
        state.options.get(self.selected)
    }

    /// Artifact for `option`: a fresh result from this session first, then
    /// whatever the backend already has on file.
    fn playable_url(option: &GenerationOption, state: &AppState) -> Option<String> {
        let fresh = match state.request(&option.name) {
            RequestState::ResultReady(result) | RequestState::Completed { result, .. } => {
                result.artifact_ref().map(str::to_string)
            }
            _ => None,
        };
        fresh.or_else(|| {
            option
                .result_ref
                .clone()
                .filter(|_| option.is_available)
        })
    }

    fn status_span(option: &GenerationOption, state: &AppState) -> Span<'static> {
        match state.request(&option.name) {
            RequestState::Submitting => {
                Span::styled("submitting…", Style::default().fg(C_RUNNING))
            }
            RequestState::Polling { progress, .. } => {
                let text = match progress {
                    Some(p) => format!("generating {}% · {}", p.percent(), p.label()),
                    None => "generating…".to_string(),
                };
                Span::styled(text, Style::default().fg(C_RUNNING))
            }
            RequestState::ResultReady(_) | RequestState::Completed { .. } => {
                Span::styled("● ready", Style::default().fg(C_DONE))
            }
            RequestState::Failed { error, .. } => {
                Span::styled(format!("✗ {}", error), Style::default().fg(C_ERROR))
            }
            RequestState::Idle if option.is_available => {
                Span::styled("● audio available", Style::default().fg(C_DONE))
            }
            RequestState::Idle => Span::raw(""),
        }
    }
}

impl Component for SpeechPanel {
    fn id(&self) -> ComponentId {
        ComponentId::SpeechPanel
    }

    fn is_editing(&self) -> bool {
        self.input.is_active()
    }

    fn handle_key(&mut self, key: KeyEvent, state: &AppState) -> Vec<Action> {
        if self.input.is_active() {
            if self.input.handle_key(key) == InputAction::Confirmed && !self.input.text().is_empty() {
                return vec![Action::Notify(
                    Severity::Info,
                    "Passage saved (g to generate)".into(),
                )];
            }
            return vec![];
        }
        match key.code {
            KeyCode::Char('i') | KeyCode::Char('e') => {
                self.input.activate();
                vec![]
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.select(self.selected.saturating_sub(1), state);
                vec![]
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.selected + 1 < state.options.len() {
                    self.select(self.selected + 1, state);
                }
                vec![]
            }
            KeyCode::Char('g') | KeyCode::Enter => {
                let Some(option) = self.selected_option(state) else {
                    return vec![Action::Notify(
                        Severity::Warning,
                        "No voices loaded yet (r to reload)".into(),
                    )];
                };
                if state.request(&option.name).is_busy() {
                    return vec![Action::Notify(
                        Severity::Info,
                        format!("{} is already generating", option.name),
                    )];
                }
                vec![Action::Generate {
                    text: self.input.text().to_string(),
                    voice: option.name.clone(),
                }]
            }
            KeyCode::Char('p') => match self.selected_option(state) {
                Some(option) => match Self::playable_url(option, state) {
                    Some(url) => vec![Action::Play(url)],
                    None => vec![Action::Notify(
                        Severity::Warning,
                        format!("No audio for {} yet (g to generate)", option.name),
                    )],
                },
                None => vec![],
            },
            KeyCode::Char('r') => vec![Action::ReloadOptions],
            _ => vec![],
        }
    }

    fn on_action(&mut self, action: &Action, state: &AppState) -> Vec<Action> {
        if *action == Action::OptionsUpdated {
            let keep = self
                .selected_name
                .as_ref()
                .and_then(|name| state.options.iter().position(|o| &o.name == name));
            let index = keep
                .or_else(|| {
                    default_option(&state.options, &self.preferred)
                        .and_then(|d| state.options.iter().position(|o| o.name == d.name))
                })
                .unwrap_or(0);
            self.select(index, state);
        }
        vec![]
    }

    fn draw(&mut self, frame: &mut Frame, area: Rect, focused: bool, state: &AppState) {
        let badge = state.context_id.map(|id| Badge {
            text: format!("ch {}", id),
            color: C_TAG,
        });
        let block = pane_chrome("Narration", focused, badge);
        let inner = block.inner(area);
        frame.render_widget(block, area);
        if inner.height < 3 {
            return;
        }

        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Length(1),
                Constraint::Min(1),
                Constraint::Length(1),
            ])
            .split(inner);

        self.input.draw(frame, rows[0]);

        if state.options.is_empty() {
            let msg = if state.options_loading {
                "loading voices…"
            } else {
                "no voices (r to reload)"
            };
            frame.render_widget(Paragraph::new(Span::styled(msg, style_muted())), rows[2]);
        } else {
            let name_w = state
                .options
                .iter()
                .map(|o| o.name.width())
                .max()
                .unwrap_or(0);
            let height = rows[2].height as usize;
            let offset = self.selected.saturating_sub(height.saturating_sub(1));
            let lines: Vec<Line> = state
                .options
                .iter()
                .enumerate()
                .skip(offset)
                .take(height)
                .map(|(i, option)| {
                    let is_sel = i == self.selected;
                    let style = match (is_sel, focused) {
                        (true, true) => style_selected_focused(),
                        (true, false) => style_selected(),
                        _ => style_default(),
                    };
                    let pad = name_w.saturating_sub(option.name.width());
                    Line::from(vec![
                        Span::styled(if is_sel { " ▸ " } else { "   " }, style),
                        Span::styled(format!("{}{}", option.name, " ".repeat(pad)), style),
                        Span::styled(format!("  {:<12} ", option.description), style_secondary()),
                        Self::status_span(option, state),
                    ])
                })
                .collect();
            frame.render_widget(Paragraph::new(lines), rows[2]);
        }

        frame.render_widget(
            Paragraph::new(Span::styled(
                " i edit · g generate · p play · r reload · tab tasks",
                style_muted(),
            )),
            rows[3],
        );
    }
}
