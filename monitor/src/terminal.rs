/// Text rendering of a progress surface for terminals.
use std::io::Write;

use crate::surface::{ProgressSurface, Toast, ToastKind};

/// Generate a simple text progress bar.
pub fn progress_bar(percent: u8) -> String {
    let filled = (percent.min(100) as usize) / 5; // 20 chars total
    let empty = 20_usize.saturating_sub(filled);
    format!("[{}{}]", "=".repeat(filled), " ".repeat(empty))
}

/// Writes one line per visible change: the bar, the percentage and the status.
pub struct TerminalSurface<W: Write + Send> {
    out: W,
    visible: bool,
    width: u8,
    status: String,
    error_style: bool,
    last_line: Option<String>,
}

impl<W: Write + Send> TerminalSurface<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            visible: false,
            width: 0,
            status: String::new(),
            error_style: false,
            last_line: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn render(&mut self) {
        if !self.visible || self.status.is_empty() {
            return;
        }
        let marker = if self.error_style { "!" } else { " " };
        let line = format!("{}{} {:>3}% {}", marker, progress_bar(self.width), self.width, self.status);
        if self.last_line.as_deref() == Some(line.as_str()) {
            return;
        }
        self.write_line(&line);
        self.last_line = Some(line);
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{}", line).and_then(|_| self.out.flush()) {
            tracing::debug!("Terminal surface write failed: {}", e);
        }
    }
}

impl<W: Write + Send> ProgressSurface for TerminalSurface<W> {
    fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
        if visible {
            self.render();
        } else {
            self.last_line = None;
        }
    }

    fn set_width(&mut self, percent: u8) {
        self.width = percent.min(100);
        self.render();
    }

    fn set_status(&mut self, text: &str) {
        self.status = text.to_string();
        self.render();
    }

    fn set_filename(&mut self, text: &str) {
        self.write_line(text);
    }

    fn set_error_style(&mut self, on: bool) {
        self.error_style = on;
    }

    fn toast(&mut self, toast: Toast) {
        let icon = match toast.kind {
            ToastKind::Success => "ok",
            ToastKind::Error => "error",
        };
        let line = format!("  ({} {}) {}", icon, toast.at.format("%H:%M:%S"), toast.message);
        self.write_line(&line);
    }
}
