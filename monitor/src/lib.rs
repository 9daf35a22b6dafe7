/// Tubewatch monitor: follows a server-sent progress feed for one download
/// job at a time and renders it onto a progress surface.
pub mod monitor;
pub mod stream;
pub mod surface;
pub mod terminal;
pub mod transfer;

pub use monitor::{spawn_monitor, DownloadMonitor, MonitorHandle, MonitorInput, SessionId, SessionState};
pub use stream::{SseOpener, StreamHandle, StreamOpener, StreamSignal};
pub use surface::{ProgressSurface, RecordingSurface, Toast, ToastKind};
pub use terminal::TerminalSurface;
