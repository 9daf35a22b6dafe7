/// Progress stream transport.
///
/// An `EventSource`-style SSE client on top of `reqwest`: one reader task per
/// stream, reconnecting on EOF or network errors until its handle is closed.
/// Payloads and transport errors are posted to the monitor's inbox tagged with
/// the session they belong to.
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use tubewatch_shared::errors::TransportError;

use crate::monitor::{MonitorInput, SessionId};

/// What a stream reports to its monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    /// One `data:` payload of a default-type event.
    Message(String),
    /// The transport disconnected or the stream ended.
    Error(String),
    /// The reader gave up for good and will not reconnect.
    Closed(String),
}

/// Owning handle to an open stream. Closing (or dropping) it stops the reader.
#[derive(Debug)]
pub struct StreamHandle {
    token: CancellationToken,
}

impl StreamHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Opens progress streams for the monitor.
pub trait StreamOpener: Send {
    fn open(
        &self,
        url: Url,
        session: SessionId,
        inbox: mpsc::UnboundedSender<MonitorInput>,
    ) -> StreamHandle;
}

// ====== SSE DECODER ======

/// A dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    after_cr: bool,
    data: String,
    has_data: bool,
    event_type: String,
    last_event_id: Option<String>,
    retry: Option<u64>,
    past_first_line: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &b in chunk {
            match b {
                b'\r' => {
                    self.after_cr = true;
                    self.end_line(&mut events);
                }
                b'\n' if self.after_cr => self.after_cr = false,
                b'\n' => self.end_line(&mut events),
                _ => {
                    self.after_cr = false;
                    self.line.push(b);
                }
            }
        }
        events
    }

    /// Last `id:` seen, sent back as `Last-Event-ID` on reconnect.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnect delay requested by the server, in milliseconds.
    pub fn retry(&self) -> Option<u64> {
        self.retry
    }

    /// Drop a half-received event, as happens when the connection breaks.
    /// The next bytes are treated as the start of a new stream.
    pub fn reset_pending(&mut self) {
        self.line.clear();
        self.after_cr = false;
        self.data.clear();
        self.has_data = false;
        self.event_type.clear();
        self.past_first_line = false;
    }

    fn end_line(&mut self, events: &mut Vec<SseEvent>) {
        let raw = std::mem::take(&mut self.line);
        let mut line = String::from_utf8_lossy(&raw);
        if !self.past_first_line {
            self.past_first_line = true;
            if let Some(rest) = line.strip_prefix('\u{feff}') {
                line = rest.to_string().into();
            }
        }

        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line.as_ref(), ""),
        };

        match field {
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
                self.has_data = true;
            }
            "event" => self.event_type = value.to_string(),
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            "retry" if !value.is_empty() && value.bytes().all(|c| c.is_ascii_digit()) => {
                self.retry = value.parse().ok();
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        let event_type = std::mem::take(&mut self.event_type);
        if !self.has_data {
            return;
        }
        let mut data = std::mem::take(&mut self.data);
        self.has_data = false;
        if data.ends_with('\n') {
            data.pop();
        }
        events.push(SseEvent {
            event_type: if event_type.is_empty() {
                "message".to_string()
            } else {
                event_type
            },
            data,
        });
    }
}

// ====== HTTP TRANSPORT ======

/// Opens SSE streams over HTTP.
#[derive(Debug, Clone)]
pub struct SseOpener {
    client: reqwest::Client,
    retry: Duration,
}

impl SseOpener {
    pub fn new(client: reqwest::Client, retry: Duration) -> Self {
        Self { client, retry }
    }
}

impl StreamOpener for SseOpener {
    fn open(
        &self,
        url: Url,
        session: SessionId,
        inbox: mpsc::UnboundedSender<MonitorInput>,
    ) -> StreamHandle {
        let token = CancellationToken::new();
        let reader = SseReader {
            client: self.client.clone(),
            url,
            session,
            inbox,
            retry: self.retry,
            decoder: SseDecoder::new(),
        };
        tokio::spawn(reader.run(token.clone()));
        StreamHandle::new(token)
    }
}

struct SseReader {
    client: reqwest::Client,
    url: Url,
    session: SessionId,
    inbox: mpsc::UnboundedSender<MonitorInput>,
    retry: Duration,
    decoder: SseDecoder,
}

impl SseReader {
    async fn run(mut self, token: CancellationToken) {
        info!("Opening progress stream {} (session {})", self.url, self.session);

        loop {
            let err = tokio::select! {
                _ = token.cancelled() => break,
                err = self.connect_and_read() => err,
            };

            if token.is_cancelled() {
                break;
            }
            let fatal = err.is_fatal();
            if !self.post(StreamSignal::Error(err.to_string())) {
                break;
            }
            if fatal {
                warn!("Progress stream {} failed permanently: {}", self.url, err);
                self.post(StreamSignal::Closed(err.to_string()));
                break;
            }

            self.decoder.reset_pending();
            if let Some(ms) = self.decoder.retry() {
                self.retry = Duration::from_millis(ms);
            }
            debug!("Reconnecting to {} in {:?}", self.url, self.retry);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.retry) => {}
            }
        }

        debug!("Progress stream reader for session {} ended", self.session);
    }

    /// Read one connection to its end. Always returns the reason it stopped.
    async fn connect_and_read(&mut self) -> TransportError {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = self.decoder.last_event_id() {
            request = request.header("Last-Event-ID", id);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return TransportError::Connect(e.to_string()),
        };

        let status = response.status();
        if !status.is_success() {
            return TransportError::Status(status.as_u16());
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("text/event-stream") {
            return TransportError::ContentType(content_type);
        }

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => return TransportError::Connect(e.to_string()),
            };
            for event in self.decoder.feed(&chunk) {
                if event.event_type != "message" {
                    debug!("Ignoring '{}' event on {}", event.event_type, self.url);
                    continue;
                }
                if !self.post(StreamSignal::Message(event.data)) {
                    return TransportError::Eof;
                }
            }
        }

        TransportError::Eof
    }

    /// Post to the monitor. False once the monitor is gone.
    fn post(&self, signal: StreamSignal) -> bool {
        self.inbox
            .send(MonitorInput::Stream {
                session: self.session,
                signal,
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::response::sse::{Event, Sse};
    use axum::routing::get;
    use axum::Router;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    type EventList = futures::stream::Iter<std::vec::IntoIter<Result<Event, Infallible>>>;

    /// Records the `Last-Event-ID` header of every request it serves.
    #[derive(Clone)]
    struct Reconnects {
        retry: Duration,
        seen: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl Reconnects {
        fn with_retry(retry: Duration) -> Self {
            Self { retry, seen: Arc::default() }
        }

        fn requests(&self) -> Vec<Option<String>> {
            self.seen.lock().unwrap().clone()
        }
    }

    async fn resumable_feed(State(log): State<Reconnects>, headers: HeaderMap) -> Sse<EventList> {
        let last_id = headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let first = {
            let mut seen = log.seen.lock().unwrap();
            seen.push(last_id);
            seen.len() == 1
        };
        let events = if first {
            vec![Ok(Event::default()
                .id("7")
                .retry(log.retry)
                .data(r#"{"progress":10}"#))]
        } else {
            vec![Ok(Event::default().data(r#"{"progress":20}"#))]
        };
        Sse::new(futures::stream::iter(events))
    }

    #[test]
    fn test_decoder_basic_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: {\"progress\":1}\n\ndata: {\"progress\":2}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "message");
        assert_eq!(events[0].data, r#"{"progress":1}"#);
        assert_eq!(events[1].data, r#"{"progress":2}"#);
    }

    #[test]
    fn test_decoder_split_chunks_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"prog").is_empty());
        assert!(decoder.feed(b"ress\":5}\r").is_empty());
        let events = decoder.feed(b"\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, r#"{"progress":5}"#);
    }

    #[test]
    fn test_decoder_multiline_comments_and_fields() {
        let mut decoder = SseDecoder::new();
        let stream = b": keep-alive\nid: 7\nretry: 1500\nevent: ping\ndata: a\ndata:b\n\ndata\n\n";
        let events = decoder.feed(stream);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "ping");
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(events[1].event_type, "message");
        assert_eq!(events[1].data, "");
        assert_eq!(decoder.last_event_id(), Some("7"));
        assert_eq!(decoder.retry(), Some(1500));
    }

    #[test]
    fn test_decoder_blank_line_without_data() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: x\n\n\n").is_empty());
        let events = decoder.feed(b"data: y\n\n");
        assert_eq!(events[0].event_type, "message");
    }

    #[test]
    fn test_decoder_strips_leading_bom() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed("\u{feff}data: first\n\ndata: second\n\n".as_bytes());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "first");

        // Only the first line of a stream may carry it.
        let events = decoder.feed("\u{feff}data: third\n\n".as_bytes());
        assert!(events.is_empty());

        decoder.reset_pending();
        let events = decoder.feed("\u{feff}data: fourth\n\n".as_bytes());
        assert_eq!(events[0].data, "fourth");
    }

    #[test]
    fn test_stream_handle_closes_on_drop() {
        let token = CancellationToken::new();
        let handle = StreamHandle::new(token.clone());
        assert!(!handle.is_closed());
        drop(handle);
        assert!(token.is_cancelled());
    }

    async fn serve(app: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{}/", addr)).unwrap()
    }

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<MonitorInput>) -> (SessionId, StreamSignal) {
        let input = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for stream signal")
            .expect("inbox closed");
        match input {
            MonitorInput::Stream { session, signal } => (session, signal),
            other => panic!("unexpected input {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sse_opener_reads_feed_and_reports_eof() {
        let app = Router::new().route(
            "/progress/:video_id/:itag/:kind",
            get(|| async {
                let events = vec![
                    Ok::<_, Infallible>(Event::default().data(r#"{"progress":50,"downloaded_mb":1,"total_mb":2}"#)),
                    Ok(Event::default().event("debug").data("ignored")),
                    Ok(Event::default().data(r#"{"status":"completed","filename":"clip.mp4"}"#)),
                ];
                Sse::new(futures::stream::iter(events))
            }),
        );
        let base = serve(app).await;
        let url = base.join("/progress/abc/22/video").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = SessionId::new_v4();
        let opener = SseOpener::new(reqwest::Client::new(), Duration::from_secs(60));
        let handle = opener.open(url, session, tx);

        let (s, first) = next_signal(&mut rx).await;
        assert_eq!(s, session);
        assert_eq!(
            first,
            StreamSignal::Message(r#"{"progress":50,"downloaded_mb":1,"total_mb":2}"#.into())
        );
        let (_, second) = next_signal(&mut rx).await;
        assert_eq!(
            second,
            StreamSignal::Message(r#"{"status":"completed","filename":"clip.mp4"}"#.into())
        );
        let (_, third) = next_signal(&mut rx).await;
        assert_eq!(third, StreamSignal::Error("Stream ended".into()));

        handle.close();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_sse_opener_stops_on_http_error() {
        let app = Router::new();
        let base = serve(app).await;
        let url = base.join("/progress/missing/1/video").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let opener = SseOpener::new(reqwest::Client::new(), Duration::from_millis(10));
        let _handle = opener.open(url, SessionId::new_v4(), tx);

        let (_, signal) = next_signal(&mut rx).await;
        assert_eq!(signal, StreamSignal::Error("Server answered with HTTP 404".into()));
        let (_, signal) = next_signal(&mut rx).await;
        assert_eq!(signal, StreamSignal::Closed("Server answered with HTTP 404".into()));

        // Fatal: the reader exits and drops its sender, so no reconnect follows.
        let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_honours_retry_and_last_event_id() {
        let log = Reconnects::with_retry(Duration::from_millis(10));
        let app = Router::new()
            .route("/progress/:video_id/:itag/:kind", get(resumable_feed))
            .with_state(log.clone());
        let base = serve(app).await;
        let url = base.join("/progress/abc/22/video").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        // Far longer than the test timeout: only the server's `retry: 10` lets it reconnect.
        let opener = SseOpener::new(reqwest::Client::new(), Duration::from_secs(60));
        let handle = opener.open(url, SessionId::new_v4(), tx);

        let (_, signal) = next_signal(&mut rx).await;
        assert_eq!(signal, StreamSignal::Message(r#"{"progress":10}"#.into()));
        let (_, signal) = next_signal(&mut rx).await;
        assert_eq!(signal, StreamSignal::Error("Stream ended".into()));
        let (_, signal) = next_signal(&mut rx).await;
        assert_eq!(signal, StreamSignal::Message(r#"{"progress":20}"#.into()));

        handle.close();
        let requests = log.requests();
        assert_eq!(requests[0], None);
        assert_eq!(requests[1].as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_close_during_retry_stops_reconnecting() {
        let log = Reconnects::with_retry(Duration::from_secs(2));
        let app = Router::new()
            .route("/progress/:video_id/:itag/:kind", get(resumable_feed))
            .with_state(log.clone());
        let base = serve(app).await;
        let url = base.join("/progress/abc/22/video").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let opener = SseOpener::new(reqwest::Client::new(), Duration::from_secs(60));
        let handle = opener.open(url, SessionId::new_v4(), tx);

        let (_, signal) = next_signal(&mut rx).await;
        assert_eq!(signal, StreamSignal::Message(r#"{"progress":10}"#.into()));
        let (_, signal) = next_signal(&mut rx).await;
        assert_eq!(signal, StreamSignal::Error("Stream ended".into()));

        // The reader is now waiting out the server's 2 s retry.
        handle.close();

        // It exits without reconnecting and drops its sender.
        let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(closed.is_none());
        assert_eq!(log.requests().len(), 1);
    }
}
