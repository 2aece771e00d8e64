//! Conversion of lookup geometry into resolution-independent rectangles.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::model::{
    HighlightBox, NormalizedRect, PixelRect, RawRect, RectBundle, RectSource, ViewportSize,
};
use crate::viewport::PageViewport;

/// Maps raw page-space rects through `viewport` into unit-box fractions.
///
/// Rects with a non-finite coordinate are dropped, never coerced.
pub fn pdf_rects_to_normalized(
    rects: &[RawRect],
    viewport: &PageViewport,
    page_index: usize,
    source: RectSource,
) -> Vec<NormalizedRect> {
    let size = viewport.size().sanitized();
    rects
        .iter()
        .filter(|rect| rect.is_finite())
        .enumerate()
        .filter_map(|(idx, rect)| {
            let [x1, y1, x2, y2] =
                viewport.to_viewport_rect([rect.x1, rect.y1, rect.x2, rect.y2]);
            let normalized = NormalizedRect {
                page_index,
                x: x1.min(x2) / size.width,
                y: y1.min(y2) / size.height,
                width: (x2 - x1).abs() / size.width,
                height: (y2 - y1).abs() / size.height,
                id: format!("{page_index}-{idx}"),
                source,
            };
            if !coords_finite(&normalized) {
                return None;
            }
            let clipped = normalized.clip_to_page();
            clipped.has_area().then_some(clipped)
        })
        .collect()
}

fn coords_finite(rect: &NormalizedRect) -> bool {
    [rect.x, rect.y, rect.width, rect.height]
        .iter()
        .all(|value| value.is_finite())
}

/// Cleans a normalized rect supplied from outside the engine.
pub fn sanitize_normalized(
    rect: &NormalizedRect,
    fallback_page_index: usize,
    rect_idx: usize,
) -> Option<NormalizedRect> {
    if !coords_finite(rect) {
        return None;
    }
    let id = if rect.id.is_empty() {
        format!("{fallback_page_index}-{rect_idx}")
    } else {
        rect.id.clone()
    };
    let cleaned = NormalizedRect {
        id,
        ..rect.clone()
    }
    .clip_to_page();
    cleaned.has_area().then_some(cleaned)
}

/// Fractions back to pixels for the given viewport size.
pub fn denormalize(rects: &[NormalizedRect], size: ViewportSize) -> Vec<HighlightBox> {
    let size = size.sanitized();
    rects
        .iter()
        .map(|rect| HighlightBox {
            rect: rect.clone(),
            abs: PixelRect {
                left: rect.x * size.width,
                top: rect.y * size.height,
                width: rect.width * size.width,
                height: rect.height * size.height,
            },
            span_key: None,
        })
        .collect()
}

#[derive(Debug, Clone)]
struct CachedPage {
    size_key: (u32, u32),
    rects: Vec<NormalizedRect>,
}

/// Holds the highlight geometry of one resolution session, keyed by 0-based page.
#[derive(Debug, Default)]
pub struct RectNormalizer {
    raw: BTreeMap<usize, Vec<RawRect>>,
    raw_source: BTreeMap<usize, RectSource>,
    provided: BTreeMap<usize, Vec<NormalizedRect>>,
    cache: HashMap<usize, CachedPage>,
}

impl RectNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the raw geometry with the given bundles.
    pub fn set_bundles(&mut self, bundles: &[RectBundle]) {
        self.raw.clear();
        self.raw_source.clear();
        self.cache.clear();
        for bundle in bundles {
            if bundle.rects.is_empty() {
                continue;
            }
            let page_index = bundle.page.max(1) as usize - 1;
            self.raw
                .entry(page_index)
                .or_default()
                .extend(bundle.rects.iter().cloned());
            // A page with any server bundle counts as server geometry.
            let source = self.raw_source.entry(page_index).or_insert(bundle.source);
            if bundle.source == RectSource::Server {
                *source = RectSource::Server;
            }
        }
    }

    /// Installs already-normalized rects; they take precedence over bundles.
    pub fn set_provided(&mut self, record: BTreeMap<usize, Vec<NormalizedRect>>) {
        self.provided.clear();
        for (page_index, rects) in record {
            let sanitized: Vec<_> = rects
                .iter()
                .enumerate()
                .filter_map(|(idx, rect)| sanitize_normalized(rect, page_index, idx))
                .collect();
            if !sanitized.is_empty() {
                self.provided.insert(page_index, sanitized);
            }
        }
    }

    pub fn clear(&mut self) {
        self.raw.clear();
        self.raw_source.clear();
        self.provided.clear();
        self.cache.clear();
    }

    pub fn invalidate(&mut self, page_index: usize) {
        self.cache.remove(&page_index);
    }

    pub fn invalidate_all(&mut self) {
        self.cache.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty() && self.provided.is_empty()
    }

    /// Normalized rects for one page at the viewport it is rendered with.
    pub fn rects_for_page(
        &mut self,
        page_index: usize,
        viewport: &PageViewport,
    ) -> Vec<NormalizedRect> {
        if let Some(provided) = self.provided.get(&page_index) {
            return provided.clone();
        }

        let size_key = viewport.size_key();
        if let Some(cached) = self.cache.get(&page_index) {
            if cached.size_key == size_key {
                return cached.rects.clone();
            }
            debug!(page_index, "viewport size changed, renormalizing");
        }

        let rects = match self.raw.get(&page_index) {
            Some(raw) => {
                let source = self
                    .raw_source
                    .get(&page_index)
                    .copied()
                    .unwrap_or_default();
                pdf_rects_to_normalized(raw, viewport, page_index, source)
            }
            None => Vec::new(),
        };
        self.cache.insert(
            page_index,
            CachedPage {
                size_key,
                rects: rects.clone(),
            },
        );
        rects
    }

    /// Sorted 1-based page numbers that carry at least one rect.
    pub fn pages_with_rects(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self
            .raw
            .iter()
            .filter(|(_, rects)| rects.iter().any(RawRect::is_finite))
            .map(|(idx, _)| *idx as u32 + 1)
            .chain(self.provided.keys().map(|idx| *idx as u32 + 1))
            .collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}
