//! Lifecycle of one document view and the highlight painted over it.
//!
//! The controller is a synchronous state machine. Hosts feed it surface
//! signals through [`ViewerLifecycleController::handle`], drain the
//! [`SurfaceCommand`]s it issues, and read [`ViewerEvent`]s from the shared
//! queue returned by [`ViewerLifecycleController::events`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_with::skip_serializing_none;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{ResolveError, ViewerError};
use crate::model::{NormalizedRect, RenderImage, RenderRequest, TextSpanRect};
use crate::normalize::{denormalize, RectNormalizer};
use crate::overlay::{render_overlay, OverlayFrame};
use crate::resolver::{ResolveOutcome, ResolveSession};
use crate::snap::{snap_to_spans, suppress_fallback, SpanCache, SNAP_TOLERANCE_PX};
use crate::viewport::PageViewport;

/// An opened document as seen by the viewer.
pub trait DocumentBackend: Send + Sync {
    fn page_count(&self) -> usize;
    fn viewport(&self, page_index: usize, scale: f32) -> Result<PageViewport, ViewerError>;
    /// Glyph-run boxes of the page's text layer, in pixels of `viewport`.
    fn text_spans(
        &self,
        page_index: usize,
        viewport: &PageViewport,
    ) -> Result<Vec<TextSpanRect>, ViewerError>;
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage, ViewerError>;
}

#[async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, source: DocumentSource) -> Result<Arc<dyn DocumentBackend>, ViewerError>;
}

#[derive(Debug, Clone)]
pub enum DocumentSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    DocumentLoading,
    DocumentReady,
    PageRendering { page: u32 },
    PageReady { page: u32 },
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewerEvent {
    Ready { ready: bool, page: u32 },
    Paint { page: u32, rect_count: usize },
    Progress { loaded: u64, total: Option<u64> },
    Error { message: String },
}

/// Work the host must carry out on the rendering surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurfaceCommand {
    RenderPage { page: u32, scale: f32 },
}

/// Signals coming back from the rendering surface. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurfaceEvent {
    DocumentReady,
    PageRendered { page: u32 },
    TextLayerRendered { page: u32 },
    ScaleChanging,
    ScaleChanged { scale: f32 },
}

/// What the user is told about the current citation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum HighlightStatus {
    Idle,
    Searching,
    Highlighted { page: u32, count: usize },
    NoHighlight(String),
    NothingToSearch,
    Rejected(String),
    LoadFailed(String),
}

impl HighlightStatus {
    pub fn message(&self) -> String {
        match self {
            HighlightStatus::Idle => "idle".to_string(),
            HighlightStatus::Searching => "searching for the cited passage".to_string(),
            HighlightStatus::Highlighted { page, count } => {
                format!("{count} highlight(s) on page {page}")
            }
            HighlightStatus::NoHighlight(message) => message.clone(),
            HighlightStatus::NothingToSearch => ResolveError::NothingToSearch.to_string(),
            HighlightStatus::Rejected(reason) => format!("lookup rejected: {reason}"),
            HighlightStatus::LoadFailed(message) => format!("document failed to load: {message}"),
        }
    }
}

/// Reports download progress for one load; inert once that load is superseded.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    generation: u64,
    current: Arc<AtomicU64>,
    events: Arc<Mutex<Vec<ViewerEvent>>>,
}

impl ProgressSink {
    pub fn report(&self, loaded: u64, total: Option<u64>) {
        if self.current.load(Ordering::SeqCst) != self.generation {
            return;
        }
        self.events
            .lock()
            .push(ViewerEvent::Progress { loaded, total });
    }
}

/// Handle for one exclusive document load.
#[derive(Debug)]
pub struct LoadTicket {
    generation: u64,
    cancel: CancellationToken,
    progress: ProgressSink,
}

impl LoadTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn progress(&self) -> ProgressSink {
        self.progress.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Opens `source`, giving up as soon as the load is superseded.
    pub async fn open<P>(
        &self,
        provider: &P,
        source: DocumentSource,
    ) -> Result<Arc<dyn DocumentBackend>, ViewerError>
    where
        P: DocumentProvider + ?Sized,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ViewerError::Cancelled),
            result = provider.open(source) => result,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewerOptions {
    pub initial_scale: f32,
    pub min_scale: f32,
    pub max_scale: f32,
    pub snap_tolerance: f64,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            initial_scale: 1.0,
            min_scale: 0.25,
            max_scale: 4.0,
            snap_tolerance: SNAP_TOLERANCE_PX,
        }
    }
}

impl From<&EngineConfig> for ViewerOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            initial_scale: config.viewer.initial_scale,
            min_scale: config.viewer.min_scale,
            max_scale: config.viewer.max_scale,
            snap_tolerance: config.snap.tolerance_px,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewerState {
    /// 1-based; 0 until the first navigation.
    pub current_page: u32,
    pub page_count: usize,
    pub scale: f32,
    pub requested_page: u32,
    pub page_rendered: bool,
    pub text_layer_rendered: bool,
    pub initial_navigation_done: bool,
    pub painting_enabled: bool,
}

impl ViewerState {
    fn new(scale: f32) -> Self {
        Self {
            current_page: 0,
            page_count: 0,
            scale,
            requested_page: 1,
            page_rendered: false,
            text_layer_rendered: false,
            initial_navigation_done: false,
            painting_enabled: true,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ViewerDiagnostics {
    pub phase: Phase,
    pub load_generation: u64,
    pub highlight_session: Option<Uuid>,
    pub current_page: u32,
    pub page_count: usize,
    pub scale: f32,
    pub requested_page: u32,
    pub pages_with_rects: Vec<u32>,
    pub painted_rects: Option<usize>,
    pub cached_span_pages: Vec<usize>,
    pub status: HighlightStatus,
    pub last_error: Option<String>,
}

pub struct ViewerLifecycleController {
    options: ViewerOptions,
    phase: Phase,
    generation: Arc<AtomicU64>,
    loading: Option<CancellationToken>,
    backend: Option<Arc<dyn DocumentBackend>>,
    state: ViewerState,
    normalizer: RectNormalizer,
    spans: SpanCache,
    events: Arc<Mutex<Vec<ViewerEvent>>>,
    commands: Vec<SurfaceCommand>,
    highlight_session: Option<Uuid>,
    status: HighlightStatus,
    last_frame: Option<OverlayFrame>,
    last_error: Option<String>,
}

impl ViewerLifecycleController {
    pub fn new(options: ViewerOptions) -> Self {
        let scale = options
            .initial_scale
            .clamp(options.min_scale, options.max_scale);
        Self {
            options,
            phase: Phase::Idle,
            generation: Arc::new(AtomicU64::new(0)),
            loading: None,
            backend: None,
            state: ViewerState::new(scale),
            normalizer: RectNormalizer::new(),
            spans: SpanCache::new(),
            events: Arc::new(Mutex::new(Vec::new())),
            commands: Vec::new(),
            highlight_session: None,
            status: HighlightStatus::Idle,
            last_frame: None,
            last_error: None,
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ViewerEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<ViewerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn drain_commands(&mut self) -> Vec<SurfaceCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &ViewerState {
        &self.state
    }

    pub fn status(&self) -> &HighlightStatus {
        &self.status
    }

    pub fn backend(&self) -> Option<Arc<dyn DocumentBackend>> {
        self.backend.clone()
    }

    pub fn last_frame(&self) -> Option<&OverlayFrame> {
        self.last_frame.as_ref()
    }

    /// Tears down the current document and starts a new exclusive load.
    #[instrument(skip(self))]
    pub fn begin_load(&mut self) -> Result<LoadTicket, ViewerError> {
        if self.phase == Phase::Disposed {
            return Err(ViewerError::Disposed);
        }
        if self.backend.is_some() {
            // Highlights of the previous document never carry over; a session
            // started before the first document opened is kept for it.
            self.discard_highlight();
        }
        self.teardown_document();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        self.loading = Some(cancel.clone());
        self.phase = Phase::DocumentLoading;
        debug!(generation, "document load started");
        Ok(LoadTicket {
            generation,
            cancel,
            progress: ProgressSink {
                generation,
                current: Arc::clone(&self.generation),
                events: Arc::clone(&self.events),
            },
        })
    }

    /// Commits the result of a load. Returns `false` when `ticket` is stale.
    #[instrument(skip(self, ticket, result), fields(generation = ticket.generation))]
    pub fn finish_load(
        &mut self,
        ticket: LoadTicket,
        result: Result<Arc<dyn DocumentBackend>, ViewerError>,
    ) -> bool {
        if self.phase == Phase::Disposed
            || ticket.generation != self.generation.load(Ordering::SeqCst)
        {
            debug!("ignoring completion of a superseded load");
            return false;
        }
        self.loading = None;

        let backend = match result {
            Ok(backend) if backend.page_count() == 0 => {
                self.fail_load("document has no pages".to_string());
                return true;
            }
            Ok(backend) => backend,
            Err(err) => {
                self.fail_load(err.to_string());
                return true;
            }
        };

        self.state.page_count = backend.page_count();
        self.backend = Some(backend);
        self.state.painting_enabled = true;
        self.state.initial_navigation_done = false;
        self.last_error = None;
        if matches!(self.status, HighlightStatus::LoadFailed(_)) {
            self.status = HighlightStatus::Idle;
        }
        self.phase = Phase::DocumentReady;
        debug!(pages = self.state.page_count, "document ready");
        self.initial_navigation();
        true
    }

    fn discard_highlight(&mut self) {
        debug!(session = ?self.highlight_session, "discarding highlight of the previous document");
        self.highlight_session = None;
        self.normalizer.clear();
        self.status = HighlightStatus::Idle;
    }

    fn fail_load(&mut self, message: String) {
        warn!(%message, "document failed to load");
        self.backend = None;
        self.state.page_count = 0;
        self.state.current_page = 0;
        self.state.painting_enabled = false;
        self.phase = Phase::Idle;
        self.last_frame = None;
        self.last_error = Some(message.clone());
        self.status = HighlightStatus::LoadFailed(message.clone());
        self.emit(ViewerEvent::Error { message });
    }

    /// Marks the start of a highlight session; only its outcome is applied.
    pub fn begin_highlight_session(&mut self, session: &ResolveSession) {
        if self.phase == Phase::Disposed {
            return;
        }
        self.highlight_session = Some(session.id);
        self.state.requested_page = session.requested_page;
        self.normalizer.clear();
        self.status = HighlightStatus::Searching;
        self.repaint();
    }

    /// Applies a resolver result. Returns `None` when the session is stale
    /// or was superseded.
    #[instrument(skip(self, session, result), fields(session = %session.id))]
    pub fn apply_outcome(
        &mut self,
        session: &ResolveSession,
        result: Result<ResolveOutcome, ResolveError>,
    ) -> Option<HighlightStatus> {
        if self.phase == Phase::Disposed || self.highlight_session != Some(session.id) {
            debug!("ignoring outcome of a stale highlight session");
            return None;
        }

        let status = match result {
            Ok(ResolveOutcome::Superseded) => return None,
            Ok(ResolveOutcome::Resolved(resolved)) => {
                self.normalizer.set_bundles(&resolved.bundles);
                let status = HighlightStatus::Highlighted {
                    page: resolved.page,
                    count: resolved.rect_count,
                };
                self.status = status.clone();
                if self.backend.is_some() {
                    self.show_page(resolved.page);
                }
                return Some(status);
            }
            Err(ResolveError::NothingToSearch) | Err(ResolveError::MissingDocument) => {
                HighlightStatus::NothingToSearch
            }
            Err(ResolveError::Rejected { reason }) => HighlightStatus::Rejected(reason),
            Err(err @ ResolveError::NotFound { .. }) => {
                HighlightStatus::NoHighlight(err.to_string())
            }
        };
        self.normalizer.clear();
        self.status = status.clone();
        self.repaint();
        Some(status)
    }

    /// Installs normalized rects supplied by the host, keyed by 0-based page.
    pub fn provide_rects(&mut self, rects: BTreeMap<usize, Vec<NormalizedRect>>) {
        self.normalizer.set_provided(rects);
        self.repaint();
    }

    pub fn clamp_page(&self, page: u32) -> u32 {
        let last = u32::try_from(self.state.page_count)
            .unwrap_or(u32::MAX)
            .max(1);
        page.clamp(1, last)
    }

    pub fn navigate(&mut self, page: u32) -> Result<u32, ViewerError> {
        if self.phase == Phase::Disposed {
            return Err(ViewerError::Disposed);
        }
        if self.backend.is_none() {
            return Err(ViewerError::NoDocument);
        }
        let page = self.clamp_page(page);
        self.show_page(page);
        Ok(page)
    }

    pub fn set_scale(&mut self, scale: f32) -> Result<f32, ViewerError> {
        if self.phase == Phase::Disposed {
            return Err(ViewerError::Disposed);
        }
        let scale = if scale.is_finite() {
            scale.clamp(self.options.min_scale, self.options.max_scale)
        } else {
            self.state.scale
        };
        self.apply_scale(scale);
        Ok(scale)
    }

    pub fn handle(&mut self, event: SurfaceEvent) {
        if self.phase == Phase::Disposed || self.backend.is_none() {
            debug!(?event, "surface event without an open document");
            return;
        }
        match event {
            SurfaceEvent::DocumentReady => self.initial_navigation(),
            SurfaceEvent::PageRendered { page } => {
                if !self.is_current_page(page) {
                    debug!(page, "ignoring render of a page that is no longer shown");
                    return;
                }
                self.spans.invalidate(page as usize - 1);
                self.state.page_rendered = true;
                self.emit(ViewerEvent::Ready { ready: true, page });
                self.try_complete(page);
            }
            SurfaceEvent::TextLayerRendered { page } => {
                if !self.is_current_page(page) {
                    debug!(page, "ignoring text layer of a page that is no longer shown");
                    return;
                }
                self.spans.invalidate(page as usize - 1);
                self.state.text_layer_rendered = true;
                self.try_complete(page);
            }
            SurfaceEvent::ScaleChanging => self.spans.clear(),
            SurfaceEvent::ScaleChanged { scale } => {
                if !scale.is_finite() {
                    warn!(scale, "surface reported an invalid scale");
                    return;
                }
                let scale = scale.clamp(self.options.min_scale, self.options.max_scale);
                if (scale - self.state.scale).abs() > f32::EPSILON {
                    self.apply_scale(scale);
                } else {
                    self.spans.clear();
                    self.repaint();
                }
            }
        }
    }

    /// Final teardown; the controller ignores everything afterwards.
    pub fn dispose(&mut self) {
        if self.phase == Phase::Disposed {
            return;
        }
        self.teardown_document();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.normalizer.clear();
        self.commands.clear();
        self.highlight_session = None;
        self.phase = Phase::Disposed;
        debug!("viewer disposed");
    }

    pub fn diagnostics(&self) -> ViewerDiagnostics {
        ViewerDiagnostics {
            phase: self.phase,
            load_generation: self.generation.load(Ordering::SeqCst),
            highlight_session: self.highlight_session,
            current_page: self.state.current_page,
            page_count: self.state.page_count,
            scale: self.state.scale,
            requested_page: self.state.requested_page,
            pages_with_rects: self.normalizer.pages_with_rects(),
            painted_rects: self.last_frame.as_ref().map(|frame| frame.boxes.len()),
            cached_span_pages: self.spans.cached_pages(),
            status: self.status.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn teardown_document(&mut self) {
        if let Some(loading) = self.loading.take() {
            loading.cancel();
        }
        self.backend = None;
        self.spans.clear();
        self.normalizer.invalidate_all();
        self.commands.clear();
        self.last_frame = None;
        self.state.current_page = 0;
        self.state.page_count = 0;
        self.state.page_rendered = false;
        self.state.text_layer_rendered = false;
        self.state.initial_navigation_done = false;
    }

    fn initial_navigation(&mut self) {
        if self.state.initial_navigation_done || self.backend.is_none() {
            return;
        }
        self.state.initial_navigation_done = true;
        let page = self.pick_page();
        self.show_page(page);
    }

    /// A page known to carry rects wins over the raw requested page.
    fn pick_page(&self) -> u32 {
        if let HighlightStatus::Highlighted { page, .. } = self.status {
            return self.clamp_page(page);
        }
        let requested = self.state.requested_page;
        let pages = self.normalizer.pages_with_rects();
        let page = if pages.contains(&requested) {
            requested
        } else {
            pages.first().copied().unwrap_or(requested)
        };
        self.clamp_page(page)
    }

    fn show_page(&mut self, page: u32) {
        let page = self.clamp_page(page);
        if self.phase == (Phase::PageReady { page }) {
            self.repaint();
            return;
        }
        self.render_page(page);
    }

    fn render_page(&mut self, page: u32) {
        self.spans.invalidate(page as usize - 1);
        self.state.current_page = page;
        self.state.page_rendered = false;
        self.state.text_layer_rendered = false;
        self.last_frame = None;
        self.phase = Phase::PageRendering { page };
        self.commands.push(SurfaceCommand::RenderPage {
            page,
            scale: self.state.scale,
        });
        self.emit(ViewerEvent::Ready { ready: false, page });
    }

    fn apply_scale(&mut self, scale: f32) {
        if (scale - self.state.scale).abs() <= f32::EPSILON {
            return;
        }
        debug!(from = self.state.scale, to = scale, "scale changed");
        self.state.scale = scale;
        self.spans.clear();
        self.normalizer.invalidate_all();
        match self.phase {
            Phase::PageRendering { page } | Phase::PageReady { page } => self.render_page(page),
            _ => {}
        }
    }

    fn is_current_page(&self, page: u32) -> bool {
        match self.phase {
            Phase::PageRendering { page: shown } | Phase::PageReady { page: shown } => {
                page >= 1 && shown == page
            }
            _ => false,
        }
    }

    fn try_complete(&mut self, page: u32) {
        if self.state.page_rendered && self.state.text_layer_rendered {
            self.phase = Phase::PageReady { page };
            self.repaint();
        }
    }

    fn repaint(&mut self) {
        let Phase::PageReady { page } = self.phase else {
            return;
        };
        if !self.state.painting_enabled {
            return;
        }
        let Some(backend) = self.backend.clone() else {
            return;
        };
        let page_index = page as usize - 1;
        let viewport = match backend.viewport(page_index, self.state.scale) {
            Ok(viewport) => viewport,
            Err(err) => {
                warn!(page, %err, "cannot compute viewport, skipping paint");
                return;
            }
        };
        let size = viewport.size();
        let rects = self.normalizer.rects_for_page(page_index, &viewport);
        let mut boxes = denormalize(&rects, size);
        if !boxes.is_empty() {
            let tolerance = self.options.snap_tolerance;
            let spans = self.spans.get_or_collect(page_index, || {
                backend
                    .text_spans(page_index, &viewport)
                    .unwrap_or_else(|err| {
                        warn!(page, %err, "text layer unavailable, painting unsnapped boxes");
                        Vec::new()
                    })
            });
            boxes = suppress_fallback(snap_to_spans(&boxes, spans, size, tolerance));
        }

        let frame = render_overlay(page, &boxes, size);
        debug!(page, rects = frame.boxes.len(), "painted highlight overlay");
        self.emit(ViewerEvent::Paint {
            page,
            rect_count: frame.boxes.len(),
        });
        self.last_frame = Some(frame);
    }

    fn emit(&self, event: ViewerEvent) {
        if self.phase == Phase::Disposed {
            return;
        }
        self.events.lock().push(event);
    }
}

impl Drop for ViewerLifecycleController {
    fn drop(&mut self) {
        if let Some(loading) = self.loading.take() {
            loading.cancel();
        }
    }
}
