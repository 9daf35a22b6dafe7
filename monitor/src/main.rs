/// Tubewatch - download progress monitor
///
/// Activates a download link against a media server: follows the job's
/// server-sent progress feed and renders it in the terminal, optionally
/// fetching the file itself alongside.
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};
use url::Url;

use tubewatch_monitor::transfer::spawn_native_transfer;
use tubewatch_monitor::{spawn_monitor, SessionState, SseOpener, TerminalSurface};
use tubewatch_shared::config::{parse_base_url, MonitorConfig};
use tubewatch_shared::link::{discover_links, DownloadLink};

#[derive(Debug, Parser)]
#[command(name = "tubewatch", version, about = "Follow a server-side download's progress feed")]
struct Args {
    /// Download link href, absolute or relative to the base URL.
    #[arg(required_unless_present = "page")]
    href: Option<String>,

    /// Display filename for the link (the page's data-filename).
    #[arg(long)]
    filename: Option<String>,

    /// Read download links from this rendered page instead of HREF.
    #[arg(long, conflicts_with = "href")]
    page: Option<String>,

    /// Which discovered link to activate (0-based).
    #[arg(long, default_value_t = 0)]
    pick: usize,

    /// Server origin used to resolve relative hrefs.
    #[arg(long, env = "TUBEWATCH_BASE_URL")]
    base_url: Option<String>,

    /// Also fetch the file itself into this directory.
    #[arg(long, env = "TUBEWATCH_SAVE_DIR")]
    save_dir: Option<PathBuf>,

    /// Do not fetch the file itself, only follow progress. Wins over --save-dir.
    #[arg(long)]
    no_transfer: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenvy::dotenv().ok();

    // Init tracing (stderr: stdout belongs to the progress surface)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tubewatch=info,tubewatch_monitor=info,tubewatch_shared=info".into()),
        )
        .init();

    let args = Args::parse();

    // Config
    let mut config = MonitorConfig::from_env()?;
    if let Some(raw) = &args.base_url {
        config.base_url = parse_base_url(raw)?;
    }
    if let Some(dir) = &args.save_dir {
        config.save_dir = Some(dir.clone());
    }
    if args.no_transfer {
        config.save_dir = None;
    }
    info!("Media server: {}", config.base_url);

    let client = reqwest::Client::builder()
        .user_agent(concat!("tubewatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let link = match &args.page {
        Some(page) => pick_from_page(&client, &config.base_url, page, args.pick).await?,
        None => {
            let href = args.href.as_deref().context("HREF is required without --page")?;
            DownloadLink::from_href(href, args.filename.as_deref(), &config.base_url)?
        }
    };

    let (mut monitor, task) = spawn_monitor(
        TerminalSurface::new(std::io::stdout()),
        SseOpener::new(client.clone(), config.retry_delay),
        config.hide_delay,
    );

    monitor.activate(link.clone());
    let transfer = config.save_dir.clone().map(|dir| {
        info!("Fetching {} into {}", link.href, dir.display());
        spawn_native_transfer(client.clone(), link, dir)
    });

    let outcome = tokio::select! {
        state = monitor.wait_settled() => Some(state),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing progress stream");
            None
        }
    };

    monitor.shutdown();
    if let Err(e) = task.await {
        error!("Monitor task failed: {}", e);
    }

    let Some(state) = outcome else {
        std::process::exit(130);
    };

    // Let the file transfer finish unless interrupted; dropping it would cut
    // the body off mid-write.
    if let Some(transfer) = transfer {
        info!("Waiting for the file transfer to finish");
        tokio::select! {
            joined = transfer => {
                if let Err(e) = joined {
                    error!("Transfer task failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, abandoning file transfer");
                std::process::exit(130);
            }
        }
    }

    match state {
        SessionState::Completed => Ok(()),
        SessionState::Errored => std::process::exit(1),
        other => bail!("Progress stream closed before the download finished (state {:?})", other),
    }
}

/// Fetch a rendered page and choose one of its download links.
async fn pick_from_page(
    client: &reqwest::Client,
    base: &Url,
    page: &str,
    pick: usize,
) -> anyhow::Result<DownloadLink> {
    let page_url = base.join(page).with_context(|| format!("Invalid page URL '{}'", page))?;
    let html = client
        .get(page_url.clone())
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("Failed to fetch {}", page_url))?
        .text()
        .await?;

    let links = discover_links(&html, &page_url);
    if links.is_empty() {
        bail!("No download links found on {}", page_url);
    }
    for (i, l) in links.iter().enumerate() {
        info!("[{}] {} ({} itag {})", i, l.filename, l.media_type, l.itag);
    }

    links
        .into_iter()
        .nth(pick)
        .with_context(|| format!("--pick {} is out of range", pick))
}
