use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use leaf_core::locator::{format_display_title, parse_navigation_path};
use leaf_core::progress::format_duration;
use leaf_core::text_format::tidy_for_display;
use leaf_core::{
    DocumentLoader, FileStateStore, LeafConfig, PageNumber, PageState, ReadingProgressStore,
    SourceLocator, StateStore, ViewerCommand, ViewerSession,
};
use leaf_http::{build_client, HttpFetcher, ProxyFetcher};
use leaf_render::PdfiumOpener;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use url::Url;

const RASTER_POLLS: usize = 1200;

#[derive(Debug, Parser)]
#[command(
    name = "leaf",
    version,
    about = "Progressive PDF reader with local reading progress"
)]
struct Args {
    /// Directory holding reading progress and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Path to a config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Open a document, record the visit and optionally export a page
    Open {
        /// URL, local path, or `uploaded/<id>`
        target: String,
        /// Page to start on (1-based)
        #[arg(short = 'p', long = "page")]
        page: Option<PageNumber>,
        /// Write the start page as PNG
        #[arg(long)]
        render: Option<PathBuf>,
        /// Print the start page's text
        #[arg(long)]
        text: bool,
        /// Seconds to stay on each page before closing or advancing
        #[arg(long, default_value_t = 0)]
        dwell: u64,
        /// Pages to step forward through after the start page
        #[arg(long, default_value_t = 0)]
        advance: usize,
    },
    /// Search the full text of a document
    Search { target: String, query: String },
    /// List stored reading sessions, most recent first
    Sessions {
        #[arg(long)]
        json: bool,
    },
    /// Reading statistics for one session
    Stats {
        id: String,
        #[arg(long)]
        json: bool,
    },
    #[command(subcommand)]
    Bookmark(BookmarkCommand),
    /// Stored size and preview housekeeping
    Storage {
        #[arg(long)]
        clear_previews: bool,
    },
    /// Forget one session, or everything with --all
    Forget {
        id: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Run the proxy and upload server
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum BookmarkCommand {
    Add {
        session: String,
        #[arg(short = 'p', long = "page")]
        page: PageNumber,
        #[arg(short = 't', long)]
        title: String,
        #[arg(short = 'n', long)]
        note: Option<String>,
    },
    Remove { session: String, bookmark: String },
    List { session: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "leaf", "leaf")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| project_dirs.data_local_dir().to_path_buf());
    let _log_guard = init_logging(&data_dir.join("logs"))?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join("config.toml"));
    let config = LeafConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(data_dir.join("state"))?);
    let progress = Arc::new(ReadingProgressStore::new(store, config.progress.clone()));

    match args.command {
        CliCommand::Open {
            target,
            page,
            render,
            text,
            dwell,
            advance,
        } => {
            let (locator, start_page) = resolve_target(&target, page)?;
            let loader = build_loader(&config)?;
            let reading = Reading {
                render,
                text,
                dwell: Duration::from_secs(dwell),
                advance,
            };
            open_document(&loader, locator, start_page, progress, &config, reading).await
        }
        CliCommand::Search { target, query } => {
            let (locator, start_page) = resolve_target(&target, None)?;
            let loader = build_loader(&config)?;
            search_document(&loader, locator, start_page, progress, &config, &query).await
        }
        CliCommand::Sessions { json } => list_sessions(&progress, json),
        CliCommand::Stats { id, json } => show_stats(&progress, &id, json),
        CliCommand::Bookmark(command) => run_bookmark(&progress, command),
        CliCommand::Storage { clear_previews } => {
            if clear_previews {
                progress.clear_all_previews()?;
            }
            let info = progress.storage_info();
            println!(
                "{} sessions, {} previews, {} MB ({} bytes)",
                info.session_count, info.preview_count, info.size_in_mb, info.size_in_bytes
            );
            Ok(())
        }
        CliCommand::Forget { id, all } => match (id, all) {
            (_, true) => {
                progress.clear_all()?;
                println!("cleared all reading progress");
                Ok(())
            }
            (Some(id), false) => {
                if progress.remove_session(&id)? {
                    println!("removed {id}");
                    Ok(())
                } else {
                    bail!("no session stored for {id}")
                }
            }
            (None, false) => bail!("pass a session id or --all"),
        },
        CliCommand::Serve { bind } => {
            let mut server = config.server.clone();
            if let Some(bind) = bind {
                server.bind = bind;
            }
            let upload_dir = server
                .upload_dir
                .clone()
                .unwrap_or_else(|| data_dir.join("uploads"));
            leaf_http::serve(&server, upload_dir).await
        }
    }
}

fn build_loader(config: &LeafConfig) -> Result<DocumentLoader> {
    let opener = Arc::new(PdfiumOpener::new()?);
    let client = build_client(&config.server.user_agent)?;
    let mut loader = DocumentLoader::new(Arc::new(HttpFetcher::new(client.clone())), opener);
    if let Some(base) = &config.network.proxy_base {
        let base = Url::parse(base).with_context(|| format!("invalid proxy base {base:?}"))?;
        loader = loader
            .with_proxy(Arc::new(ProxyFetcher::new(client, base.clone())))
            .with_upload_base(base);
    }
    Ok(loader)
}

/// Local files become `file://` URLs; anything else goes through the
/// navigation path rules, so `uploaded/<id>` and bare hosts work too.
fn resolve_target(raw: &str, page: Option<PageNumber>) -> Result<(SourceLocator, PageNumber)> {
    let path = Path::new(raw);
    if path.exists() {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {raw:?}"))?;
        let url = Url::from_file_path(&absolute)
            .map_err(|_| anyhow!("cannot express {} as a URL", absolute.display()))?;
        return Ok((SourceLocator::Remote(url), page.unwrap_or(1).max(1)));
    }
    if let Ok(locator) = SourceLocator::parse(raw) {
        if raw.contains("://") {
            return Ok((locator, page.unwrap_or(1).max(1)));
        }
    }
    let target = parse_navigation_path(raw)?;
    Ok((target.locator, page.unwrap_or(target.start_page).max(1)))
}

async fn open_viewer(
    loader: &DocumentLoader,
    locator: SourceLocator,
    start_page: PageNumber,
    progress: Arc<ReadingProgressStore>,
    config: &LeafConfig,
) -> Result<ViewerSession> {
    ViewerSession::open(loader, locator, start_page, progress, config)
        .await
        .map_err(|err| anyhow!("{} ({})", err.user_message(), err.message))
}

struct Reading {
    render: Option<PathBuf>,
    text: bool,
    dwell: Duration,
    advance: usize,
}

async fn open_document(
    loader: &DocumentLoader,
    locator: SourceLocator,
    start_page: PageNumber,
    progress: Arc<ReadingProgressStore>,
    config: &LeafConfig,
    reading: Reading,
) -> Result<()> {
    let viewer = open_viewer(loader, locator, start_page, Arc::clone(&progress), config).await?;
    let identity = viewer.locator().identity();
    let page = viewer.current_page();
    println!("{} ({} pages), page {}", viewer.title(), viewer.page_count(), page);

    if let Some(output) = reading.render {
        viewer
            .renderer()
            .request_page(page)
            .await
            .with_context(|| format!("failed to render page {page}"))?;
        let raster = loaded_raster(&viewer, page).await?;
        fs::write(&output, &raster.png)
            .with_context(|| format!("failed to write {}", output.display()))?;
        println!("wrote {}x{} PNG to {}", raster.width, raster.height, output.display());
    }

    if reading.text {
        match viewer.wait_for_corpus().await {
            Some(corpus) => println!("{}", tidy_for_display(corpus.formatted_text(page))),
            None => println!("(text unavailable)"),
        }
    }

    tokio::time::sleep(reading.dwell).await;
    for _ in 0..reading.advance {
        viewer.apply(ViewerCommand::NextPage)?;
        tokio::time::sleep(reading.dwell).await;
    }

    viewer.close().await;
    if let Some(stats) = progress.stats(&identity) {
        println!(
            "{}% read, {} spent, {} bookmarks",
            stats.progress, stats.time_spent, stats.bookmarks_count
        );
    }
    Ok(())
}

/// The page may already be in flight from the prefetcher.
async fn loaded_raster(viewer: &ViewerSession, page: PageNumber) -> Result<leaf_core::Raster> {
    for _ in 0..RASTER_POLLS {
        if let Some(raster) = viewer.page(page).and_then(|record| record.raster) {
            return Ok(raster);
        }
        if viewer.renderer().state(page) == Some(PageState::NotRequested) {
            bail!("page {page} failed to render");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("timed out waiting for page {page}")
}

async fn search_document(
    loader: &DocumentLoader,
    locator: SourceLocator,
    start_page: PageNumber,
    progress: Arc<ReadingProgressStore>,
    config: &LeafConfig,
    query: &str,
) -> Result<()> {
    let viewer = open_viewer(loader, locator, start_page, progress, config).await?;
    let results = match viewer.search().await {
        Some(search) => search.search_now(query).await,
        None => Vec::new(),
    };
    if results.is_empty() {
        println!("no matches for {query:?}");
    }
    for result in &results {
        println!("p.{:<4} {}", result.page_number, result.context_snippet);
    }
    info!(query, matches = results.len(), "search finished");
    viewer.close().await;
    Ok(())
}

fn list_sessions(progress: &ReadingProgressStore, json: bool) -> Result<()> {
    let sessions = progress.list_sessions();
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("no reading sessions yet");
    }
    for session in sessions {
        println!(
            "{}  {}  page {}/{}  {}",
            session.last_read_at.format("%Y-%m-%d %H:%M"),
            format_display_title(&session.title),
            session.current_page,
            session.total_pages,
            session.url
        );
    }
    Ok(())
}

fn show_stats(progress: &ReadingProgressStore, id: &str, json: bool) -> Result<()> {
    let stats = progress
        .stats(id)
        .ok_or_else(|| anyhow!("no session stored for {id}"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("progress:   {}% ({} of {} pages)", stats.progress, stats.pages_read, stats.total_pages);
    println!("time spent: {}", stats.time_spent);
    if let Some(remaining) = &stats.estimated_time_remaining {
        println!("remaining:  ~{remaining}");
    }
    println!("bookmarks:  {}", stats.bookmarks_count);
    println!("last read:  {}", stats.last_read_at.to_rfc3339());
    Ok(())
}

fn run_bookmark(progress: &ReadingProgressStore, command: BookmarkCommand) -> Result<()> {
    match command {
        BookmarkCommand::Add {
            session,
            page,
            title,
            note,
        } => {
            resume(progress, &session)?;
            let added = progress.add_bookmark(page, &title, note);
            progress.end_session()?;
            println!("added bookmark {}", added?);
        }
        BookmarkCommand::Remove { session, bookmark } => {
            resume(progress, &session)?;
            let removed = progress.remove_bookmark(&bookmark);
            progress.end_session()?;
            if !removed? {
                bail!("no bookmark {bookmark} in {session}");
            }
            println!("removed bookmark {bookmark}");
        }
        BookmarkCommand::List { session } => {
            let stored = progress
                .get_session(&session)
                .ok_or_else(|| anyhow!("no session stored for {session}"))?;
            for bookmark in &stored.bookmarks {
                let note = bookmark.note.as_deref().unwrap_or("");
                println!("{}  p.{}  {}  {}", bookmark.id, bookmark.page_number, bookmark.title, note);
            }
            if stored.bookmarks.is_empty() {
                println!("no bookmarks");
            }
            println!("time spent: {}", format_duration(stored.total_time_spent));
        }
    }
    Ok(())
}

/// Makes a stored session active again without opening its document.
fn resume(progress: &ReadingProgressStore, id: &str) -> Result<()> {
    let stored = progress
        .get_session(id)
        .ok_or_else(|| anyhow!("no session stored for {id}"))?;
    progress.start_session(id, &stored.title, stored.total_pages)?;
    Ok(())
}

fn init_logging(log_dir: &Path) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "leaf.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn local_paths_become_file_urls() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("book.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        let (locator, page) = resolve_target(path.to_str().unwrap(), Some(4)).unwrap();
        match locator {
            SourceLocator::Remote(url) => assert_eq!(url.scheme(), "file"),
            other => panic!("unexpected locator {other:?}"),
        }
        assert_eq!(page, 4);
    }

    #[test]
    fn remote_and_uploaded_targets_are_recognised() {
        let (locator, page) = resolve_target("https://example.com/a.pdf?page=9", None).unwrap();
        assert_eq!(locator.identity(), "https://example.com/a.pdf?page=9");
        assert_eq!(page, 1);

        let (locator, page) = resolve_target("uploaded/abc?page=3", None).unwrap();
        assert_eq!(locator, SourceLocator::Uploaded("abc".into()));
        assert_eq!(page, 3);

        let (locator, _) = resolve_target("example.com/docs/a.pdf", Some(0)).unwrap();
        assert_eq!(locator.identity(), "https://example.com/docs/a.pdf");
    }

    #[test]
    fn bookmark_notes_are_stored_on_the_resumed_session() {
        let progress = ReadingProgressStore::new(
            Arc::new(leaf_core::MemoryStateStore::new()),
            leaf_core::config::ProgressConfig::default(),
        );
        progress.start_session("doc", "Doc", 10).unwrap();
        progress.end_session().unwrap();

        run_bookmark(
            &progress,
            BookmarkCommand::Add {
                session: "doc".into(),
                page: 4,
                title: "Method".into(),
                note: Some("reread".into()),
            },
        )
        .unwrap();

        assert!(progress.current_session().is_none());
        let bookmarks = progress.get_session("doc").unwrap().bookmarks;
        assert_eq!(bookmarks.len(), 1);
        assert_eq!(bookmarks[0].page_number, 4);
        assert_eq!(bookmarks[0].note.as_deref(), Some("reread"));
    }

    #[test]
    fn subcommands_parse() {
        let args = Args::try_parse_from([
            "leaf", "--data-dir", "/tmp/leaf", "bookmark", "add", "id", "-p", "3", "-t", "Intro",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            CliCommand::Bookmark(BookmarkCommand::Add { page: 3, .. })
        ));
        assert!(Args::try_parse_from(["leaf", "open"]).is_err());
    }
}
