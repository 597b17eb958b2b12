//! Smooth Unicode progress bar widget.

use ratatui::{
    layout::Rect,
    style::{Color, Style},
    text::{Line, Span},
    widgets::Paragraph,
    Frame,
};

use crate::theme::C_SECONDARY;

const BLOCKS: [char; 9] = [' ', '▏', '▎', '▍', '▌', '▋', '▊', '▉', '█'];

/// Bar of exactly `width` cells for `fraction` (0.0..=1.0), with eighth-cell
/// resolution.
pub fn bar_string(fraction: f64, width: usize) -> String {
    let eighths = (fraction.clamp(0.0, 1.0) * width as f64 * 8.0).round() as usize;
    let full_blocks = (eighths / 8).min(width);
    let partial = eighths % 8;

    let mut bar = String::with_capacity(width * 3);
    for _ in 0..full_blocks {
        bar.push('█');
    }
    if full_blocks < width {
        bar.push(BLOCKS[partial]);
        for _ in (full_blocks + 1)..width {
            bar.push(' ');
        }
    }
    bar
}

/// Render a bar followed by a right-aligned percentage label.
pub fn draw_progress(frame: &mut Frame, area: Rect, percent: u8, color: Color) {
    if area.width < 6 || area.height == 0 {
        return;
    }
    let label = format!(" {:>3}%", percent);
    let bar_w = area.width.saturating_sub(label.len() as u16) as usize;
    let spans = vec![
        Span::styled(
            bar_string(percent as f64 / 100.0, bar_w),
            Style::default().fg(color),
        ),
        Span::styled(label, Style::default().fg(C_SECONDARY)),
    ];
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}
