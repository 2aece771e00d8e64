use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use citemark_core::config::project_dirs;
use citemark_core::{
    paint_onto, Citation, DocumentBackend, DocumentSource, EngineConfig, LoadTicket,
    PageCandidateResolver, RenderImage, RenderRequest, Scope, SurfaceCommand, SurfaceEvent,
    ViewerError, ViewerEvent, ViewerLifecycleController, ViewerOptions,
};
use citemark_net::{HttpRectLookup, NetError};
use citemark_render::{save_png, PdfiumProvider};
use clap::Parser;
use directories::ProjectDirs;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Upper bound on render/notify rounds before giving up on a settling page.
const MAX_SURFACE_ROUNDS: usize = 8;

#[derive(Debug, Parser)]
#[command(
    name = "citemark",
    version,
    about = "Locate a citation inside its source document and render the highlighted page"
)]
struct Args {
    /// Config file (defaults to config.toml in the platform config dir)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Backend document id used for the rectangle lookup
    #[arg(short = 'd', long = "doc-id")]
    doc_id: Option<String>,

    /// Local copy of the document; downloaded from the backend when absent
    #[arg(short = 'f', long = "file", required_unless_present = "doc_id")]
    file: Option<PathBuf>,

    /// Page the citation claims to come from (1-based)
    #[arg(short = 'p', long = "page", allow_negative_numbers = true)]
    page: Option<i64>,

    /// Cited snippet text
    #[arg(short = 's', long = "snippet")]
    snippet: Option<String>,

    /// Anchor phrase; preferred over the snippet when given
    #[arg(long = "anchor")]
    anchor: Option<String>,

    /// Query that produced the citation; may be repeated
    #[arg(short = 'q', long = "query")]
    queries: Vec<String>,

    #[arg(long = "tenant")]
    tenant: Option<String>,

    #[arg(long = "user")]
    user_id: Option<String>,

    #[arg(long = "notebook")]
    notebook_id: Option<String>,

    #[arg(long = "include-global")]
    include_global: bool,

    /// Render scale; clamped to the configured range
    #[arg(long = "scale")]
    scale: Option<f32>,

    /// Where to write the highlighted page
    #[arg(short = 'o', long = "output", default_value = "citemark-page.png")]
    output: PathBuf,

    /// Print resolver and viewer diagnostics as JSON
    #[arg(long = "diagnostics")]
    diagnostics: bool,
}

impl Args {
    fn citation(&self) -> Citation {
        Citation {
            text: self.snippet.clone(),
            anchor_phrase: self.anchor.clone().filter(|anchor| !anchor.trim().is_empty()),
            document_id: self.doc_id.clone(),
            page: self.page,
            title: self
                .file
                .as_ref()
                .and_then(|path| path.file_name())
                .map(|name| name.to_string_lossy().into_owned()),
            queries: self.queries.clone(),
        }
    }

    fn apply_scope(&self, scope: &mut Scope) {
        if let Some(tenant) = &self.tenant {
            scope.tenant = tenant.clone();
        }
        if let Some(user_id) = &self.user_id {
            scope.user_id = user_id.clone();
        }
        if let Some(notebook_id) = &self.notebook_id {
            scope.notebook_id = notebook_id.clone();
        }
        if self.include_global {
            scope.include_global = true;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs =
        project_dirs().ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let mut config = EngineConfig::load(args.config.as_deref())?;
    args.apply_scope(&mut config.scope);

    let provider = PdfiumProvider::new(config.render.pdfium_library.as_deref())?;
    let lookup = HttpRectLookup::new(&config.lookup).context("invalid lookup configuration")?;
    let resolver = PageCandidateResolver::new(
        lookup.clone(),
        config.scope.clone(),
        config.resolver_options(),
    );
    let mut viewer = ViewerLifecycleController::new(ViewerOptions::from(&config));
    if let Some(scale) = args.scale {
        viewer.set_scale(scale)?;
    }

    let session = resolver.begin(&args.citation());
    viewer.begin_highlight_session(&session);
    let ticket = viewer.begin_load()?;
    let (backend, outcome) = tokio::join!(
        load_document(&ticket, &provider, &lookup, &args, &config.scope),
        resolver.run(&session),
    );
    viewer.finish_load(ticket, backend);
    let status = viewer
        .apply_outcome(&session, outcome)
        .unwrap_or_else(|| viewer.status().clone());

    let image = drive_surface(&mut viewer)?;
    log_events(&viewer);

    if let Some(mut image) = image {
        if let Some(frame) = viewer.last_frame() {
            paint_onto(&mut image, frame);
        }
        save_png(&image, &args.output)?;
        println!(
            "page {} of {} written to {}",
            viewer.state().current_page,
            viewer.state().page_count,
            args.output.display()
        );
    }
    println!("{}", status.message());

    if args.diagnostics {
        let report = serde_json::json!({
            "resolver": resolver.diagnostics(),
            "viewer": viewer.diagnostics(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    viewer.dispose();
    Ok(())
}

async fn load_document(
    ticket: &LoadTicket,
    provider: &PdfiumProvider,
    lookup: &HttpRectLookup,
    args: &Args,
    scope: &Scope,
) -> Result<Arc<dyn DocumentBackend>, ViewerError> {
    let source = match (&args.file, &args.doc_id) {
        (Some(path), _) => DocumentSource::Path(path.clone()),
        (None, Some(doc_id)) => {
            let progress = ticket.progress();
            let bytes = lookup
                .fetch_document(
                    doc_id,
                    scope,
                    |loaded, total| progress.report(loaded, total),
                    &ticket.cancel_token(),
                )
                .await
                .map_err(|err| match err {
                    NetError::Cancelled => ViewerError::Cancelled,
                    other => ViewerError::Render(other.to_string()),
                })?;
            DocumentSource::Bytes(bytes.to_vec())
        }
        (None, None) => return Err(ViewerError::NoDocument),
    };
    ticket.open(provider, source).await
}

/// Plays the rendering surface: renders what the viewer asks for and reports
/// both the raster and the text layer as done.
fn drive_surface(viewer: &mut ViewerLifecycleController) -> Result<Option<RenderImage>> {
    let Some(backend) = viewer.backend() else {
        return Ok(None);
    };
    let mut rendered = None;
    for _ in 0..MAX_SURFACE_ROUNDS {
        // Earlier commands in a batch are already superseded.
        let Some(SurfaceCommand::RenderPage { page, scale }) = viewer.drain_commands().pop() else {
            break;
        };
        debug!(page, scale, "rendering page");
        let image = backend
            .render_page(RenderRequest {
                page_index: page as usize - 1,
                scale,
            })
            .with_context(|| format!("failed to render page {page}"))?;
        viewer.handle(SurfaceEvent::PageRendered { page });
        viewer.handle(SurfaceEvent::TextLayerRendered { page });
        rendered = Some((page, image));
    }
    Ok(rendered
        .filter(|(page, _)| *page == viewer.state().current_page)
        .map(|(_, image)| image))
}

fn log_events(viewer: &ViewerLifecycleController) {
    for event in viewer.drain_events() {
        match event {
            ViewerEvent::Progress { loaded, total } => debug!(loaded, ?total, "download progress"),
            ViewerEvent::Ready { ready, page } => debug!(ready, page, "page readiness"),
            ViewerEvent::Paint { page, rect_count } => {
                info!(page, rect_count, "highlight painted")
            }
            ViewerEvent::Error { message } => warn!(%message, "viewer error"),
        }
    }
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory at {:?}", log_dir))?;

    let file_appender = tracing_appender::rolling::never(log_dir, "citemark.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
