//! Snapping of coarse lookup geometry onto rendered glyph spans.

use std::collections::{HashMap, HashSet};

use crate::model::{HighlightBox, RectSource, TextSpanRect, ViewportSize};

pub const SNAP_TOLERANCE_PX: f64 = 2.0;

/// Text-layer spans per 0-based page.
///
/// Entries are dropped when a page re-renders, when the scale changes, and
/// when the document is swapped.
#[derive(Debug, Default)]
pub struct SpanCache {
    pages: HashMap<usize, Vec<TextSpanRect>>,
}

impl SpanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached spans, collecting them on first use.
    ///
    /// Empty collections are not cached: the text layer may simply not be
    /// laid out yet.
    pub fn get_or_collect<F>(&mut self, page_index: usize, collect: F) -> &[TextSpanRect]
    where
        F: FnOnce() -> Vec<TextSpanRect>,
    {
        if !self.pages.contains_key(&page_index) {
            let spans: Vec<_> = collect()
                .into_iter()
                .filter(|span| span.rect.width > 0.0 && span.rect.height > 0.0)
                .collect();
            if spans.is_empty() {
                return &[];
            }
            self.pages.insert(page_index, spans);
        }
        self.pages
            .get(&page_index)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn invalidate(&mut self, page_index: usize) {
        self.pages.remove(&page_index);
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn cached_pages(&self) -> Vec<usize> {
        let mut pages: Vec<_> = self.pages.keys().copied().collect();
        pages.sort_unstable();
        pages
    }
}

/// Replaces each box by the spans it overlaps.
///
/// Boxes without any overlapping span are kept as they are and tagged as
/// fallback.
pub fn snap_to_spans(
    boxes: &[HighlightBox],
    spans: &[TextSpanRect],
    size: ViewportSize,
    tolerance: f64,
) -> Vec<HighlightBox> {
    let size = size.sanitized();
    let mut seen = HashSet::new();
    let mut snapped = Vec::with_capacity(boxes.len());

    for highlight in boxes {
        let hits: Vec<&TextSpanRect> = spans
            .iter()
            .filter(|span| span.rect.overlaps(&highlight.abs, tolerance))
            .collect();

        if hits.is_empty() {
            let mut unsnapped = highlight.clone();
            unsnapped.rect.source = RectSource::Fallback;
            snapped.push(unsnapped);
            continue;
        }

        for span in hits {
            if !seen.insert((highlight.rect.id.clone(), span.key.clone())) {
                continue;
            }
            let mut rect = highlight.rect.clone();
            rect.x = span.rect.left / size.width;
            rect.y = span.rect.top / size.height;
            rect.width = span.rect.width / size.width;
            rect.height = span.rect.height / size.height;
            snapped.push(HighlightBox {
                rect,
                abs: span.rect,
                span_key: Some(span.key.clone()),
            });
        }
    }

    snapped
}

/// Drops fallback boxes when the page has any server box at all.
pub fn suppress_fallback(boxes: Vec<HighlightBox>) -> Vec<HighlightBox> {
    let has_server = boxes
        .iter()
        .any(|highlight| highlight.rect.source == RectSource::Server);
    if !has_server {
        return boxes;
    }
    boxes
        .into_iter()
        .filter(|highlight| highlight.rect.source == RectSource::Server)
        .collect()
}
