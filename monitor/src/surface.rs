/// Progress surface abstraction.
///
/// The monitor never renders directly; it mutates a surface made of a
/// container (visibility), a bar (width and error style), a status line, a
/// filename label, and a toast area.
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

/// Toast severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
    Success,
    Error,
}

/// A transient notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub kind: ToastKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Toast {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Success,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Error,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Rendering target for a download monitor.
pub trait ProgressSurface: Send {
    fn set_visible(&mut self, visible: bool);
    /// Bar width as a percentage, 0..=100.
    fn set_width(&mut self, percent: u8);
    fn set_status(&mut self, text: &str);
    fn set_filename(&mut self, text: &str);
    fn set_error_style(&mut self, on: bool);
    fn toast(&mut self, toast: Toast);
}

/// Plain snapshot of everything a surface shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurfaceState {
    pub visible: bool,
    pub width: u8,
    pub status: String,
    pub filename: String,
    pub error_style: bool,
    pub toasts: Vec<Toast>,
}

impl SurfaceState {
    /// Width as the bar's style value, e.g. `57%`.
    pub fn width_css(&self) -> String {
        format!("{}%", self.width)
    }

    pub fn last_toast(&self) -> Option<&Toast> {
        self.toasts.last()
    }
}

/// In-memory surface whose state can be read from another task.
#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
    state: Arc<Mutex<SurfaceState>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SurfaceState {
        self.with(|s| s.clone())
    }

    fn with<R>(&self, f: impl FnOnce(&mut SurfaceState) -> R) -> R {
        // A poisoned lock only means a panicking writer; the state is still plain data.
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl ProgressSurface for RecordingSurface {
    fn set_visible(&mut self, visible: bool) {
        self.with(|s| s.visible = visible);
    }

    fn set_width(&mut self, percent: u8) {
        self.with(|s| s.width = percent.min(100));
    }

    fn set_status(&mut self, text: &str) {
        self.with(|s| s.status = text.to_string());
    }

    fn set_filename(&mut self, text: &str) {
        self.with(|s| s.filename = text.to_string());
    }

    fn set_error_style(&mut self, on: bool) {
        self.with(|s| s.error_style = on);
    }

    fn toast(&mut self, toast: Toast) {
        self.with(|s| s.toasts.push(toast));
    }
}
