/// Download progress monitor.
///
/// Owns the single active progress stream and the surface it renders to. All
/// state changes happen inside `handle`, which the monitor task calls for one
/// input at a time; stream readers and the hide timer only post inputs.
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tubewatch_shared::errors::LinkError;
use tubewatch_shared::link::DownloadLink;
use tubewatch_shared::progress_event::{round_percent, ProgressEvent};

use crate::stream::{StreamHandle, StreamOpener, StreamSignal};
use crate::surface::{ProgressSurface, Toast};

/// Identifies one activation of a download link.
pub type SessionId = Uuid;

/// Everything the monitor task reacts to.
#[derive(Debug)]
pub enum MonitorInput {
    /// The user activated a download link.
    Activate(DownloadLink),
    /// A stream reader reported a payload or a transport error.
    Stream {
        session: SessionId,
        signal: StreamSignal,
    },
    /// The post-completion display delay ran out.
    HideElapsed { session: SessionId },
    Shutdown,
}

/// Per-session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    Receiving(u8),
    Completed,
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Errored)
    }
}

/// What observers can see of the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorStatus {
    pub session: Option<SessionId>,
    pub state: SessionState,
    pub visible: bool,
    pub stream_open: bool,
}

impl Default for MonitorStatus {
    fn default() -> Self {
        Self {
            session: None,
            state: SessionState::Idle,
            visible: false,
            stream_open: false,
        }
    }
}

struct ActiveStream {
    session: SessionId,
    handle: StreamHandle,
}

pub struct DownloadMonitor<S, O> {
    surface: S,
    opener: O,
    hide_delay: Duration,
    inbox: mpsc::UnboundedSender<MonitorInput>,
    stream: Option<ActiveStream>,
    session: Option<SessionId>,
    state: SessionState,
    visible: bool,
    full_notified: bool,
    status_tx: watch::Sender<MonitorStatus>,
}

impl<S: ProgressSurface, O: StreamOpener> DownloadMonitor<S, O> {
    /// Create a monitor and the inbox it reads from.
    pub fn new(
        surface: S,
        opener: O,
        hide_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<MonitorInput>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(MonitorStatus::default());
        let monitor = Self {
            surface,
            opener,
            hide_delay,
            inbox,
            stream: None,
            session: None,
            state: SessionState::Idle,
            visible: false,
            full_notified: false,
            status_tx,
        };
        (monitor, rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn has_open_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status_tx.subscribe()
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<MonitorInput> {
        self.inbox.clone()
    }

    /// Process inputs until shutdown.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MonitorInput>) {
        while let Some(input) = rx.recv().await {
            if matches!(input, MonitorInput::Shutdown) {
                break;
            }
            self.handle(input);
        }
        self.close_stream();
        self.publish();
        debug!("Download monitor stopped");
    }

    /// Apply one input. Never fails; problems are logged.
    pub fn handle(&mut self, input: MonitorInput) {
        match input {
            MonitorInput::Activate(link) => {
                if let Err(e) = self.activate(&link) {
                    warn!("Cannot monitor {}: {}", link.href, e);
                }
            }
            MonitorInput::Stream { session, signal } => {
                if !self.is_open_session(session) {
                    debug!("Dropping signal from closed session {}", session);
                    return;
                }
                match signal {
                    StreamSignal::Message(data) => self.on_stream_message(&data),
                    StreamSignal::Error(reason) => self.on_stream_error(&reason),
                    StreamSignal::Closed(reason) => self.on_stream_closed(&reason),
                }
            }
            MonitorInput::HideElapsed { session } => self.on_hide_elapsed(session),
            MonitorInput::Shutdown => self.close_stream(),
        }
        self.publish();
    }

    /// Start monitoring a link, closing any stream still open.
    pub fn activate(&mut self, link: &DownloadLink) -> Result<SessionId, LinkError> {
        let url = link.progress_url()?;

        self.surface.set_filename(&format!("Downloading: {}", link.filename));
        self.surface.set_visible(true);
        self.surface.set_width(0);
        self.surface.set_error_style(false);
        self.surface.set_status("Initializing download...");
        self.visible = true;

        self.close_stream();

        let session = Uuid::new_v4();
        info!(
            "Monitoring {} itag={} type={} (session {})",
            link.video_id, link.itag, link.media_type, session
        );
        let handle = self.opener.open(url, session, self.inbox.clone());
        self.stream = Some(ActiveStream { session, handle });
        self.session = Some(session);
        self.state = SessionState::Initializing;
        self.full_notified = false;
        self.publish();
        Ok(session)
    }

    /// Render one payload from the active stream.
    pub fn on_stream_message(&mut self, data: &str) {
        let event = match ProgressEvent::from_json(data) {
            Ok(e) => e,
            Err(e) => {
                warn!(
                    "Invalid progress payload: {} (data: {})",
                    e,
                    data.chars().take(200).collect::<String>()
                );
                return;
            }
        };

        let terminal = event.is_terminal();
        match event {
            ProgressEvent::Error { message } => {
                self.surface.set_width(100);
                self.surface.set_error_style(true);
                self.surface.set_status(&format!("Error: {}", message));
                self.surface.toast(Toast::error(format!("Error: {}", message)));
                self.state = SessionState::Errored;
                warn!("Download failed: {}", message);
            }
            ProgressEvent::Progress {
                progress,
                downloaded_mb,
                total_mb,
            } => {
                let percent = round_percent(progress);
                self.surface.set_width(percent);
                if percent == 100 {
                    self.surface.set_status("Download complete! Processing...");
                    if !self.full_notified {
                        self.surface.toast(Toast::success("Download complete! File saved."));
                        self.full_notified = true;
                    }
                } else {
                    self.surface.set_status(&format_progress(percent, downloaded_mb, total_mb));
                }
                self.state = SessionState::Receiving(percent);
            }
            ProgressEvent::Completed { filename } => {
                self.surface.set_width(100);
                self.surface.set_status(&format!("Download finished: {}", filename));
                self.surface.toast(Toast::success(format!("Finished: {}", filename)));
                self.state = SessionState::Completed;
                info!("Download finished: {}", filename);
                self.schedule_hide();
            }
            ProgressEvent::Unrecognized { status } => {
                debug!("Ignoring progress payload with status {:?}", status);
            }
        }
        if terminal {
            self.close_stream();
        }
    }

    /// Transport disconnect or end of stream. A terminal payload may already
    /// have arrived or may still arrive, so this only logs.
    pub fn on_stream_error(&mut self, reason: &str) {
        warn!("Progress stream error: {}", reason);
    }

    /// The reader gave up without a terminal payload. The surface keeps its
    /// last rendering; only re-activation starts a new stream.
    fn on_stream_closed(&mut self, reason: &str) {
        if let Some(active) = self.stream.take() {
            warn!(
                "Progress stream for session {} closed in state {:?}: {}",
                active.session, self.state, reason
            );
        }
    }

    fn on_hide_elapsed(&mut self, session: SessionId) {
        if self.session != Some(session) || self.state != SessionState::Completed {
            debug!("Hide timer for superseded session {} ignored", session);
            return;
        }
        self.surface.set_visible(false);
        self.surface.set_width(0);
        self.visible = false;
    }

    fn schedule_hide(&self) {
        let Some(session) = self.session else { return };
        let inbox = self.inbox.clone();
        let delay = self.hide_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(MonitorInput::HideElapsed { session });
        });
    }

    fn is_open_session(&self, session: SessionId) -> bool {
        self.stream.as_ref().is_some_and(|s| s.session == session)
    }

    fn close_stream(&mut self) {
        if let Some(active) = self.stream.take() {
            active.handle.close();
            debug!("Closed progress stream for session {}", active.session);
        }
    }

    fn publish(&self) {
        let status = MonitorStatus {
            session: self.session,
            state: self.state,
            visible: self.visible,
            stream_open: self.stream.is_some(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Status line for an in-flight progress payload.
pub fn format_progress(percent: u8, downloaded_mb: f64, total_mb: f64) -> String {
    format!(
        "{}% complete ({:.2} MB / {:.2} MB)",
        percent, downloaded_mb, total_mb
    )
}

/// Cloneable front door to a running monitor task.
#[derive(Clone)]
pub struct MonitorHandle {
    inbox: mpsc::UnboundedSender<MonitorInput>,
    status: watch::Receiver<MonitorStatus>,
}

impl MonitorHandle {
    /// Fire-and-forget session start.
    pub fn activate(&self, link: DownloadLink) {
        if self.inbox.send(MonitorInput::Activate(link)).is_err() {
            warn!("Download monitor is not running");
        }
    }

    /// Wait until the latest session has settled: hidden after a completion,
    /// showing the error, or left without a stream before reaching either.
    /// Returns the state it settled in.
    pub async fn wait_settled(&mut self) -> SessionState {
        loop {
            {
                let status = self.status.borrow_and_update();
                match status.state {
                    SessionState::Errored => return SessionState::Errored,
                    SessionState::Completed if !status.visible => return SessionState::Completed,
                    state if status.session.is_some() && !state.is_terminal() && !status.stream_open => {
                        return state;
                    }
                    _ => {}
                }
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().state;
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.inbox.send(MonitorInput::Shutdown);
    }
}

/// Spawn a monitor task and return its handle.
pub fn spawn_monitor<S, O>(
    surface: S,
    opener: O,
    hide_delay: Duration,
) -> (MonitorHandle, JoinHandle<()>)
where
    S: ProgressSurface + 'static,
    O: StreamOpener + 'static,
{
    let (monitor, rx) = DownloadMonitor::new(surface, opener, hide_delay);
    let handle = MonitorHandle {
        inbox: monitor.sender(),
        status: monitor.subscribe(),
    };
    let task = tokio::spawn(monitor.run(rx));
    (handle, task)
}
