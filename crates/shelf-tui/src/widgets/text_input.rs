//! TextInput: wraps tui-input for the passage editor line.

use ratatui::crossterm::event::{Event, KeyCode, KeyEvent};
use ratatui::{
    layout::Rect,
    style::Style,
    text::{Line, Span},
    widgets::Paragraph,
    Frame,
};
use tui_input::{backend::crossterm::EventHandler, Input};

use crate::theme::{C_INPUT_BG, C_INPUT_FG, C_MUTED, C_SECONDARY};

#[derive(Debug, PartialEq, Eq)]
pub enum InputAction {
    Changed,
    Confirmed,
    Cancelled,
}

pub struct TextInput {
    input: Input,
    active: bool,
    placeholder: String,
}

impl TextInput {
    pub fn new(placeholder: impl Into<String>) -> Self {
        Self {
            input: Input::default(),
            active: false,
            placeholder: placeholder.into(),
        }
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn text(&self) -> &str {
        self.input.value()
    }

    /// Esc leaves the editor keeping the text; Enter confirms.
    pub fn handle_key(&mut self, key: KeyEvent) -> InputAction {
        match key.code {
            KeyCode::Esc => {
                self.active = false;
                InputAction::Cancelled
            }
            KeyCode::Enter => {
                self.active = false;
                InputAction::Confirmed
            }
            _ => {
                self.input.handle_event(&Event::Key(key));
                InputAction::Changed
            }
        }
    }

    pub fn draw(&self, frame: &mut Frame, area: Rect) {
        let scroll = self
            .input
            .visual_scroll(area.width.saturating_sub(4) as usize);
        let value = self.input.value();
        let display = if value.is_empty() {
            Span::styled(
                format!("✎ {}", self.placeholder),
                Style::default().fg(C_MUTED),
            )
        } else {
            let fg = if self.active { C_INPUT_FG } else { C_SECONDARY };
            let visible: String = value.chars().skip(scroll).collect();
            Span::styled(format!("✎ {}", visible), Style::default().fg(fg))
        };

        frame.render_widget(
            Paragraph::new(Line::from(vec![display])).style(Style::default().bg(C_INPUT_BG)),
            area,
        );

        if self.active {
            let cursor_x = area.x + 2 + (self.input.visual_cursor().saturating_sub(scroll)) as u16;
            frame.set_cursor_position((cursor_x.min(area.x + area.width.saturating_sub(1)), area.y));
        }
    }
}
