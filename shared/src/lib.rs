/// Tubewatch shared crate: progress feed wire types, download link parsing,
/// errors and configuration used by the monitor.
pub mod config;
pub mod errors;
pub mod link;
pub mod progress_event;

pub use config::MonitorConfig;
pub use errors::{LinkError, TransportError, TubewatchError, TubewatchResult};
pub use link::{discover_links, DownloadLink, MediaType};
pub use progress_event::ProgressEvent;
