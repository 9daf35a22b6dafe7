/// Progress feed wire types.
///
/// Each SSE `data:` payload from `/progress/{video_id}/{itag}/{type}` is one
/// JSON object. The server always sends a flat object, so the tag is derived
/// from which fields are present rather than from an explicit discriminator.
use serde::Deserialize;

/// Fields the server may put in a progress payload. Everything is optional.
#[derive(Debug, Default, Deserialize)]
struct RawPayload {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    downloaded_mb: Option<f64>,
    #[serde(default)]
    total_mb: Option<f64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

/// One message on a progress stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// The job failed server-side.
    Error { message: String },
    /// Source fetch progress. Missing sizes default to zero.
    Progress {
        progress: f64,
        downloaded_mb: f64,
        total_mb: f64,
    },
    /// The server finished the job and the artifact is ready.
    Completed { filename: String },
    /// A payload matching none of the shapes (e.g. `{"status":"pending_start_or_error"}`).
    Unrecognized { status: Option<String> },
}

impl ProgressEvent {
    /// Parse one `data:` payload.
    ///
    /// Precedence: a non-empty `error` wins, then `status == "completed"`,
    /// then a numeric `progress`. The server repeats `progress: 100` inside
    /// its completion payload, so completion is checked before progress.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        let raw: RawPayload = serde_json::from_str(data)?;
        Ok(Self::classify(raw))
    }

    fn classify(raw: RawPayload) -> Self {
        if let Some(message) = raw.error.filter(|m| !m.is_empty()) {
            return ProgressEvent::Error { message };
        }
        if raw.status.as_deref() == Some("completed") {
            return ProgressEvent::Completed {
                filename: raw.filename.unwrap_or_default(),
            };
        }
        match raw.progress {
            Some(progress) if progress.is_finite() => ProgressEvent::Progress {
                progress,
                downloaded_mb: raw.downloaded_mb.filter(|v| v.is_finite()).unwrap_or(0.0),
                total_mb: raw.total_mb.filter(|v| v.is_finite()).unwrap_or(0.0),
            },
            _ => ProgressEvent::Unrecognized { status: raw.status },
        }
    }

    /// Whether this event ends the stream's useful lifetime.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Error { .. } | ProgressEvent::Completed { .. })
    }
}

/// Round half up and clamp to a displayable percentage.
pub fn round_percent(progress: f64) -> u8 {
    progress.round().clamp(0.0, 100.0) as u8
}
