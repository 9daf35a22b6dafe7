/// Native file transfer trigger.
///
/// Stands in for the browser following a download link's href: a plain GET
/// that saves the body to disk. It runs independently of the progress monitor
/// and shares nothing with it beyond the link.
use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tubewatch_shared::errors::{TransportError, TubewatchResult};
use tubewatch_shared::link::DownloadLink;

/// Strip characters that are not valid in file names and cap the length.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');
    let capped: String = cleaned.chars().take(150).collect();
    if capped.is_empty() {
        "download".to_string()
    } else {
        capped
    }
}

/// Background transfer of `link.href` into `save_dir`. The outcome is only
/// logged; await the handle to let it finish.
pub fn spawn_native_transfer(
    client: reqwest::Client,
    link: DownloadLink,
    save_dir: PathBuf,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match transfer(&client, &link, &save_dir).await {
            Ok((path, bytes)) => info!("Saved {} ({} bytes)", path.display(), bytes),
            Err(e) => warn!("Native transfer of {} failed: {}", link.href, e),
        }
    })
}

/// Download `link.href` into `save_dir`, returning the written path and size.
///
/// The body is written to `<name>.part` and only renamed once complete, so an
/// interrupted or failed transfer never leaves a truncated file under the
/// final name.
pub async fn transfer(
    client: &reqwest::Client,
    link: &DownloadLink,
    save_dir: &Path,
) -> TubewatchResult<(PathBuf, u64)> {
    tokio::fs::create_dir_all(save_dir).await?;

    let response = client
        .get(link.href.clone())
        .send()
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()).into());
    }

    let name = sanitize_filename(&link.filename);
    let path = save_dir.join(&name);
    let part = save_dir.join(format!("{}.part", name));

    match write_body(response, &part).await {
        Ok(written) => {
            tokio::fs::rename(&part, &path).await?;
            Ok((path, written))
        }
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&part).await {
                warn!("Could not remove {}: {}", part.display(), rm);
            }
            Err(e)
        }
    }
}

async fn write_body(response: reqwest::Response, part: &Path) -> TubewatchResult<u64> {
    let mut file = tokio::fs::File::create(part).await?;
    let mut written: u64 = 0;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| TransportError::Connect(e.to_string()))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}
