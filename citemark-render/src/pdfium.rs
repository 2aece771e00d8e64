use std::convert::TryFrom;
use std::mem;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use citemark_core::{
    DocumentBackend, DocumentProvider, DocumentSource, PageViewport, PixelRect, RenderImage,
    RenderRequest, TextSpanRect, ViewerError,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, instrument};

use crate::{bind_first, pdfium_library_candidates};

pub struct PdfiumProvider {
    pdfium: Arc<Pdfium>,
}

impl PdfiumProvider {
    /// Binds pdfium from `library` when given, else the working directory,
    /// else the system library path.
    pub fn new(library: Option<&Path>) -> Result<Self> {
        let platform_name = Pdfium::pdfium_platform_library_name()
            .to_string_lossy()
            .into_owned();
        let candidates = pdfium_library_candidates(library, &platform_name);
        let bindings = bind_first(
            &candidates,
            |path| Pdfium::bind_to_library(path),
            Pdfium::bind_to_system_library,
        )?;
        Ok(Self {
            pdfium: Arc::new(Pdfium::new(bindings)),
        })
    }

    fn open_sync(&self, source: DocumentSource) -> Result<PdfiumDocument> {
        let document = match &source {
            DocumentSource::Path(path) => self
                .pdfium
                .load_pdf_from_file(path, None)
                .with_context(|| format!("failed to open {:?}", path))?,
            DocumentSource::Bytes(bytes) => self
                .pdfium
                .load_pdf_from_byte_vec(bytes.clone(), None)
                .context("failed to parse downloaded document")?,
        };
        // SAFETY: the document borrows the bindings owned by `self.pdfium`. PdfiumDocument keeps
        // its own Arc to the same instance and declares `document` before `_pdfium`, so the
        // document is dropped first and the borrow never outlives the bindings.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        let page_count = usize::from(document.pages().len());
        debug!(page_count, "opened document with pdfium");
        Ok(PdfiumDocument {
            document: Mutex::new(document),
            render_cache: Mutex::new(None),
            page_count,
            _pdfium: Arc::clone(&self.pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumProvider {
    async fn open(&self, source: DocumentSource) -> Result<Arc<dyn DocumentBackend>, ViewerError> {
        let document = self.open_sync(source).map_err(into_viewer_error)?;
        if document.page_count == 0 {
            return Err(ViewerError::Render("document has no pages".into()));
        }
        Ok(Arc::new(document))
    }
}

struct PdfiumDocument {
    document: Mutex<PdfDocument<'static>>,
    render_cache: Mutex<Option<RenderCacheEntry>>,
    page_count: usize,
    _pdfium: Arc<Pdfium>,
}

struct RenderCacheEntry {
    page_index: usize,
    scale_milli: u32,
    image: RenderImage,
}

fn into_viewer_error(err: anyhow::Error) -> ViewerError {
    ViewerError::Render(format!("{err:#}"))
}

fn quantize_scale(scale: f32) -> u32 {
    let scaled = (scale * 1000.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}

impl PdfiumDocument {
    fn with_page<R, F>(&self, page_index: usize, f: F) -> Result<R>
    where
        F: FnOnce(&PdfPage<'_>) -> Result<R>,
    {
        let document = self.document.lock();
        let index: PdfPageIndex = page_index
            .try_into()
            .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
        let page = document
            .pages()
            .get(index)
            .with_context(|| format!("page {} out of range", page_index))?;
        f(&page)
    }
}

/// Pdfium reports page sizes with the page rotation already applied; the
/// viewport wants the unrotated box and the rotation separately.
fn page_viewport(page: &PdfPage<'_>, scale: f32) -> PageViewport {
    let rotation = match page.rotation() {
        Ok(PdfPageRenderRotation::Degrees90) => 90,
        Ok(PdfPageRenderRotation::Degrees180) => 180,
        Ok(PdfPageRenderRotation::Degrees270) => 270,
        _ => 0,
    };
    let width = f64::from(page.width().value);
    let height = f64::from(page.height().value);
    let (width, height) = if rotation % 180 == 90 {
        (height, width)
    } else {
        (width, height)
    };
    PageViewport::new(width, height, f64::from(scale.max(0.1)), rotation)
}

impl DocumentBackend for PdfiumDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn viewport(&self, page_index: usize, scale: f32) -> Result<PageViewport, ViewerError> {
        self.with_page(page_index, |page| Ok(page_viewport(page, scale)))
            .map_err(into_viewer_error)
    }

    #[instrument(skip(self, viewport))]
    fn text_spans(
        &self,
        page_index: usize,
        viewport: &PageViewport,
    ) -> Result<Vec<TextSpanRect>, ViewerError> {
        self.with_page(page_index, |page| {
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;
            let mut spans = Vec::new();
            for (idx, segment) in text.segments().iter().enumerate() {
                let bounds = segment.bounds();
                let [x1, y1, x2, y2] = viewport.to_viewport_rect([
                    f64::from(bounds.left().value),
                    f64::from(bounds.bottom().value),
                    f64::from(bounds.right().value),
                    f64::from(bounds.top().value),
                ]);
                let rect = PixelRect {
                    left: x1.min(x2),
                    top: y1.min(y2),
                    width: (x2 - x1).abs(),
                    height: (y2 - y1).abs(),
                };
                if rect.width > 0.0 && rect.height > 0.0 {
                    spans.push(TextSpanRect {
                        key: format!("{page_index}:{idx}"),
                        rect,
                    });
                }
            }
            debug!(spans = spans.len(), "collected text spans");
            Ok(spans)
        })
        .map_err(into_viewer_error)
    }

    #[instrument(skip(self))]
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage, ViewerError> {
        let scale_milli = quantize_scale(request.scale);
        {
            let cache = self.render_cache.lock();
            if let Some(entry) = cache.as_ref() {
                if entry.page_index == request.page_index && entry.scale_milli == scale_milli {
                    return Ok(entry.image.clone());
                }
            }
        }

        let image = self
            .with_page(request.page_index, |page| {
                let config = PdfRenderConfig::new().scale_page_by_factor(request.scale.max(0.1));
                let bitmap = page
                    .render_with_config(&config)
                    .with_context(|| format!("failed to render page {}", request.page_index))?;
                let pixels = bitmap.as_image().to_rgba8().into_raw();
                Ok(RenderImage {
                    width: u32::try_from(bitmap.width()).unwrap_or_default(),
                    height: u32::try_from(bitmap.height()).unwrap_or_default(),
                    pixels,
                })
            })
            .map_err(into_viewer_error)?;

        *self.render_cache.lock() = Some(RenderCacheEntry {
            page_index: request.page_index,
            scale_milli,
            image: image.clone(),
        });
        Ok(image)
    }
}
