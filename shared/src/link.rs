/// Download links and the job identifiers they carry.
///
/// A link's href points at the file retrieval endpoint; the monitor only reads
/// `video_id`, `itag` and `type` from it to build the progress feed URL.
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use url::Url;

use crate::errors::LinkError;

/// Filename shown when a link carries no `data-filename`.
pub const DEFAULT_FILENAME: &str = "downloading_file...";

/// Media type of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
}

impl MediaType {
    pub fn as_str(&self) -> &str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "video" => Some(MediaType::Video),
            "audio" => Some(MediaType::Audio),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A download link as rendered by the server page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadLink {
    /// Absolute file retrieval URL.
    pub href: Url,
    pub video_id: String,
    pub itag: u32,
    pub media_type: MediaType,
    pub filename: String,
}

impl DownloadLink {
    /// Build a link from an href (absolute, or relative to `base`).
    ///
    /// Identifiers come from the `video_id`, `itag` and `type` query
    /// parameters, falling back to the `/download/{video_id}/{itag}/{type}`
    /// path form.
    pub fn from_href(href: &str, filename: Option<&str>, base: &Url) -> Result<Self, LinkError> {
        let url = base.join(href.trim()).map_err(|e| LinkError::InvalidUrl {
            href: href.to_string(),
            reason: e.to_string(),
        })?;

        let (video_id, itag, kind) = match query_identifiers(&url)? {
            Some(ids) => ids,
            None => path_identifiers(&url)?,
        };

        if video_id.is_empty() {
            return Err(LinkError::MissingParam("video_id"));
        }
        // Dot segments would be collapsed out of the progress path.
        if video_id == "." || video_id == ".." {
            return Err(LinkError::InvalidVideoId(video_id));
        }
        let itag: u32 = itag.parse().map_err(|_| LinkError::InvalidItag(itag.clone()))?;
        let media_type = MediaType::parse(&kind).ok_or(LinkError::UnknownMediaType(kind))?;

        let filename = filename
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_FILENAME)
            .to_string();

        Ok(Self {
            href: url,
            video_id,
            itag,
            media_type,
            filename,
        })
    }

    /// Absolute progress feed URL on the same origin as the href:
    /// `/progress/{video_id}/{itag}/{type}`, each segment percent-encoded.
    pub fn progress_url(&self) -> Result<Url, LinkError> {
        let mut url = self.href.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| LinkError::InvalidUrl {
                href: self.href.to_string(),
                reason: "URL cannot carry a path".to_string(),
            })?
            .clear()
            .push("progress")
            .push(&self.video_id)
            .push(&self.itag.to_string())
            .push(self.media_type.as_str());
        Ok(url)
    }
}

fn query_identifiers(url: &Url) -> Result<Option<(String, String, String)>, LinkError> {
    let mut video_id = None;
    let mut itag = None;
    let mut kind = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "video_id" => video_id = Some(value.into_owned()),
            "itag" => itag = Some(value.into_owned()),
            "type" => kind = Some(value.into_owned()),
            _ => {}
        }
    }
    // No identifiers at all means this is not the query form.
    if video_id.is_none() && itag.is_none() && kind.is_none() {
        return Ok(None);
    }
    Ok(Some((
        video_id.ok_or(LinkError::MissingParam("video_id"))?,
        itag.ok_or(LinkError::MissingParam("itag"))?,
        kind.ok_or(LinkError::MissingParam("type"))?,
    )))
}

fn path_identifiers(url: &Url) -> Result<(String, String, String), LinkError> {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    match segments.as_slice() {
        [.., "download", video_id, itag, kind] => Ok((
            decode_segment(video_id),
            decode_segment(itag),
            decode_segment(kind),
        )),
        _ => Err(LinkError::MissingParam("video_id")),
    }
}

fn decode_segment(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

// ====== PAGE DISCOVERY ======

static ANCHOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<a\b([^>]*)>").unwrap()
});

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});

/// Find every `download-link` anchor in a rendered page.
///
/// Anchors whose href cannot be resolved to job identifiers are skipped.
pub fn discover_links(html: &str, base: &Url) -> Vec<DownloadLink> {
    let mut links = Vec::new();

    for cap in ANCHOR_RE.captures_iter(html) {
        let attrs = &cap[1];
        let mut href = None;
        let mut filename = None;
        let mut is_download = false;

        for attr in ATTR_RE.captures_iter(attrs) {
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .or_else(|| attr.get(4))
                .map(|m| decode_entities(m.as_str()))
                .unwrap_or_default();
            match attr[1].to_ascii_lowercase().as_str() {
                "class" => is_download = value.split_whitespace().any(|c| c == "download-link"),
                "href" => href = Some(value),
                "data-filename" => filename = Some(value),
                _ => {}
            }
        }

        if !is_download {
            continue;
        }
        let Some(href) = href else { continue };

        match DownloadLink::from_href(&href, filename.as_deref(), base) {
            Ok(link) => links.push(link),
            Err(e) => tracing::debug!("Skipping download link {}: {}", href, e),
        }
    }

    links
}

fn decode_entities(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
