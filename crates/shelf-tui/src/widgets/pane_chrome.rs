//! PaneChrome: bordered pane with focus styling and an optional badge.

use ratatui::{
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

use crate::theme::{
    style_focused_border, style_unfocused_border, C_MUTED, C_PANEL_BORDER, C_PRIMARY, C_SECONDARY,
};

/// A badge shown in the top-right of the pane header (e.g. "2 RUN").
pub struct Badge {
    pub text: String,
    pub color: Color,
}

pub fn pane_chrome(title: &str, focused: bool, badge: Option<Badge>) -> Block<'static> {
    let border_style = if focused {
        style_focused_border()
    } else {
        style_unfocused_border()
    };
    let title_style = if focused {
        Style::default().fg(C_PRIMARY).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(C_MUTED)
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(border_style)
        .title(Line::from(Span::styled(format!(" {} ", title), title_style)));

    match badge {
        Some(b) => block.title_top(
            Line::from(Span::styled(
                format!(" {} ", b.text),
                Style::default().fg(b.color).add_modifier(Modifier::BOLD),
            ))
            .right_aligned(),
        ),
        None => block,
    }
}

/// Single-row strip for a minimized pane: " ▸ title  summary ".
pub fn draw_collapsed_pane(
    frame: &mut Frame,
    area: Rect,
    title: &str,
    summary: Option<&str>,
    focused: bool,
) {
    if area.height == 0 {
        return;
    }
    let title_style = if focused {
        Style::default().fg(C_PRIMARY).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(C_MUTED)
    };

    let mut spans = vec![
        Span::styled(" ▸ ", Style::default().fg(C_PANEL_BORDER)),
        Span::styled(title.to_string(), title_style),
    ];
    if let Some(s) = summary.filter(|s| !s.is_empty()) {
        spans.push(Span::raw("  "));
        spans.push(Span::styled(s.to_string(), Style::default().fg(C_SECONDARY)));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}
