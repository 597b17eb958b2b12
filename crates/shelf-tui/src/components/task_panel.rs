//! TaskPanel: global tracker of every registered generation task.
//!
//! Reads the registry snapshot from `AppState`; the only writes it asks for
//! are dismissal, clear-all and stopping a poll chain.

use ratatui::crossterm::event::{KeyCode, KeyEvent};
use ratatui::{
    layout::Rect,
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::Paragraph,
    Frame,
};

use shelf_proto::protocol::{TaskStatus, TrackedTask};

use crate::action::{Action, ComponentId};
use crate::app_state::AppState;
use crate::component::Component;
use crate::theme::{status_color, style_muted, style_secondary, C_ERROR, C_RUNNING, C_SELECTION_BG};
use crate::widgets::pane_chrome::{draw_collapsed_pane, pane_chrome, Badge};
use crate::widgets::progress_bar::draw_progress;

const SPINNER_FRAMES: &[&str] = &["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"];

/// Rows per task: label line + progress line.
const ROWS_PER_TASK: u16 = 2;

pub struct TaskPanel {
    selected: usize,
    minimized: bool,
    frame: usize,
}

impl TaskPanel {
    pub fn new() -> Self {
        Self {
            selected: 0,
            minimized: false,
            frame: 0,
        }
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    /// Height the panel wants for the current snapshot.
    pub fn desired_height(&self, state: &AppState) -> u16 {
        if self.minimized {
            return 1;
        }
        let rows = (state.tasks.len() as u16).max(1) * ROWS_PER_TASK;
        (rows + 2).min(14)
    }

    fn selected_task<'a>(&self, state: &'a AppState) -> Option<&'a TrackedTask> {
        state.tasks.get(self.selected.min(state.tasks.len().saturating_sub(1)))
    }
}

impl Default for TaskPanel {
    fn default() -> Self {
        Self::new()
    }
}

/// "2 running · 1 done · 1 failed"
pub fn tracker_summary(tasks: &[TrackedTask]) -> String {
    if tasks.is_empty() {
        return "no active tasks".to_string();
    }
    let count = |f: fn(&TaskStatus) -> bool| tasks.iter().filter(|t| f(&t.status)).count();
    let active = count(|s| !s.is_terminal());
    let done = count(|s| *s == TaskStatus::Completed);
    let failed = count(|s| *s == TaskStatus::Failed);

    let mut parts = Vec::new();
    if active > 0 {
        parts.push(format!("{} running", active));
    }
    if done > 0 {
        parts.push(format!("{} done", done));
    }
    if failed > 0 {
        parts.push(format!("{} failed", failed));
    }
    parts.join(" · ")
}

/// "Generating narration · Kore · The Hobbit / Chapter 3"
pub fn task_label(task: &TrackedTask) -> String {
    let mut label = task.kind.title().to_string();
    if let Some(option) = &task.metadata.option_label {
        label.push_str(" · ");
        label.push_str(option);
    }
    let place: Vec<&str> = [&task.metadata.book_title, &task.metadata.chapter_title]
        .into_iter()
        .filter_map(|s| s.as_deref())
        .collect();
    if !place.is_empty() {
        label.push_str(" · ");
        label.push_str(&place.join(" / "));
    }
    label
}

/// Text after the bar: stage while in flight, the outcome once terminal.
pub fn task_detail(task: &TrackedTask) -> String {
    match task.status {
        TaskStatus::Completed => "done".to_string(),
        TaskStatus::Failed => task
            .error
            .clone()
            .unwrap_or_else(|| "failed".to_string()),
        TaskStatus::Pending | TaskStatus::Running => task
            .progress
            .as_ref()
            .map(|p| p.label())
            .unwrap_or_else(|| "initialising".to_string()),
    }
}

impl Component for TaskPanel {
    fn id(&self) -> ComponentId {
        ComponentId::TaskPanel
    }

    fn handle_key(&mut self, key: KeyEvent, state: &AppState) -> Vec<Action> {
        match key.code {
            KeyCode::Up | KeyCode::Char('k') => {
                self.selected = self.selected.saturating_sub(1);
                vec![]
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.selected + 1 < state.tasks.len() {
                    self.selected += 1;
                }
                vec![]
            }
            KeyCode::Char('x') | KeyCode::Delete => self
                .selected_task(state)
                .map(|t| vec![Action::DismissTask(t.id.clone())])
                .unwrap_or_default(),
            KeyCode::Char('s') => self
                .selected_task(state)
                .filter(|t| !t.status.is_terminal())
                .map(|t| vec![Action::StopPolling(t.id.clone())])
                .unwrap_or_default(),
            KeyCode::Char('C') => vec![Action::ClearTasks],
            _ => vec![],
        }
    }

    fn tick(&mut self, state: &AppState) {
        if state.tasks.iter().any(|t| !t.status.is_terminal()) {
            self.frame = (self.frame + 1) % SPINNER_FRAMES.len();
        }
        if self.selected >= state.tasks.len() {
            self.selected = state.tasks.len().saturating_sub(1);
        }
    }

    fn on_action(&mut self, action: &Action, _state: &AppState) -> Vec<Action> {
        if *action == Action::ToggleTracker {
            self.minimized = !self.minimized;
        }
        vec![]
    }

    fn draw(&mut self, frame: &mut Frame, area: Rect, focused: bool, state: &AppState) {
        if area.height == 0 {
            return;
        }
        let summary = tracker_summary(&state.tasks);
        if self.minimized || area.height < 3 {
            draw_collapsed_pane(frame, area, "Tasks", Some(&summary), focused);
            return;
        }

        let active = state.tasks.iter().filter(|t| !t.status.is_terminal()).count();
        let badge = (active > 0).then(|| Badge {
            text: format!("{} RUN", active),
            color: C_RUNNING,
        });
        let block = pane_chrome("Tasks", focused, badge);
        let inner = block.inner(area);
        frame.render_widget(block, area);

        if state.tasks.is_empty() {
            frame.render_widget(
                Paragraph::new(Span::styled(" no active tasks", style_muted())),
                inner,
            );
            return;
        }

        let visible = (inner.height / ROWS_PER_TASK) as usize;
        let offset = self.selected.saturating_sub(visible.saturating_sub(1));
        for (slot, (i, task)) in state
            .tasks
            .iter()
            .enumerate()
            .skip(offset)
            .take(visible)
            .enumerate()
        {
            let y = inner.y + slot as u16 * ROWS_PER_TASK;
            let is_sel = focused && i == self.selected;
            let color = status_color(task.status);
            let icon = match task.status {
                TaskStatus::Pending | TaskStatus::Running => SPINNER_FRAMES[self.frame],
                TaskStatus::Completed => "✓",
                TaskStatus::Failed => "✗",
            };

            let mut label_style = Style::default().add_modifier(Modifier::BOLD);
            if is_sel {
                label_style = label_style.bg(C_SELECTION_BG);
            }
            let label = Line::from(vec![
                Span::styled(format!(" {} ", icon), Style::default().fg(color)),
                Span::styled(format!("[{}] ", task.kind.badge_label()), style_secondary()),
                Span::styled(task_label(task), label_style),
                Span::styled(
                    format!("  {}", task.submitted_at.format("%H:%M:%S")),
                    style_muted(),
                ),
            ]);
            frame.render_widget(
                Paragraph::new(label),
                Rect {
                    x: inner.x,
                    y,
                    width: inner.width,
                    height: 1,
                },
            );

            let detail = task_detail(task);
            let detail_w = (detail.chars().count() as u16 + 2).min(inner.width / 2);
            let bar_area = Rect {
                x: inner.x + 3,
                y: y + 1,
                width: inner.width.saturating_sub(3 + detail_w),
                height: 1,
            };
            if task.status == TaskStatus::Failed {
                frame.render_widget(
                    Paragraph::new(Span::styled(format!(" {}", detail), Style::default().fg(C_ERROR))),
                    Rect {
                        x: inner.x + 2,
                        width: inner.width.saturating_sub(2),
                        ..bar_area
                    },
                );
                continue;
            }
            draw_progress(frame, bar_area, task.percent(), color);
            frame.render_widget(
                Paragraph::new(Span::styled(format!("  {}", detail), style_secondary())),
                Rect {
                    x: bar_area.x + bar_area.width,
                    width: detail_w,
                    ..bar_area
                },
            );
        }
    }
}
