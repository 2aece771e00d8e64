use serde::{Deserialize, Serialize};

/// A text citation handed over by the retrieval step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub text: Option<String>,
    /// Preferred over `text` as the highlight seed when present.
    pub anchor_phrase: Option<String>,
    pub document_id: Option<String>,
    pub page: Option<i64>,
    pub title: Option<String>,
    /// Free-text queries that produced the citation. Only mined for Latin tokens.
    #[serde(default)]
    pub queries: Vec<String>,
}

impl Citation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_page(mut self, page: i64) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_queries<I, S>(mut self, queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queries = queries.into_iter().map(Into::into).collect();
        self
    }

    pub fn highlight_seed(&self) -> &str {
        self.anchor_phrase
            .as_deref()
            .or(self.text.as_deref())
            .unwrap_or("")
    }
}

/// Tenant / notebook scope sent along with every backend request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scope {
    pub tenant: String,
    pub user_id: String,
    pub notebook_id: String,
    pub include_global: bool,
}

impl Default for Scope {
    fn default() -> Self {
        Self {
            tenant: "demo".to_string(),
            user_id: "local".to_string(),
            notebook_id: String::new(),
            include_global: false,
        }
    }
}

impl Scope {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("tenant", self.tenant.clone()),
            ("user_id", self.user_id.clone()),
            ("notebook_id", self.notebook_id.clone()),
            (
                "include_global",
                if self.include_global { "true" } else { "false" }.to_string(),
            ),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RectSource {
    Server,
    Fallback,
}

impl Default for RectSource {
    fn default() -> Self {
        RectSource::Server
    }
}

/// `[x1, y1, x2, y2, term?]` in page point space (origin bottom-left).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub term: Option<String>,
}

impl RawRect {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            term: None,
        }
    }

    pub fn is_finite(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|value| value.is_finite())
    }
}

/// Rectangles the lookup service returned for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectBundle {
    /// 1-based.
    pub page: u32,
    pub rects: Vec<RawRect>,
    pub page_width: Option<f64>,
    pub page_height: Option<f64>,
    pub source: RectSource,
}

/// A highlight rectangle expressed as fractions of the page size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRect {
    /// 0-based.
    pub page_index: usize,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub id: String,
    pub source: RectSource,
}

impl NormalizedRect {
    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|value| value.is_finite() && *value >= 0.0)
    }

    /// Clips the rectangle to the unit page box.
    pub fn clip_to_page(mut self) -> Self {
        let left = self.x.clamp(0.0, 1.0);
        let top = self.y.clamp(0.0, 1.0);
        let right = (self.x + self.width).clamp(0.0, 1.0);
        let bottom = (self.y + self.height).clamp(0.0, 1.0);
        self.x = left;
        self.y = top;
        self.width = (right - left).max(0.0);
        self.height = (bottom - top).max(0.0);
        self
    }

    pub fn has_area(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

/// Axis-aligned box in page-pixel space, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl PixelRect {
    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    /// Overlap test that treats boxes within `tolerance` pixels as touching.
    pub fn overlaps(&self, other: &PixelRect, tolerance: f64) -> bool {
        self.right() >= other.left - tolerance
            && self.left <= other.right() + tolerance
            && self.bottom() >= other.top - tolerance
            && self.top <= other.bottom() + tolerance
    }
}

/// Glyph-level rectangle read from a rendered text layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSpanRect {
    pub key: String,
    pub rect: PixelRect,
}

/// Size in pixels of the surface a page is drawn on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: f64,
    pub height: f64,
}

impl ViewportSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Zero or non-finite dimensions fall back to one pixel.
    pub fn sanitized(self) -> Self {
        let fix = |value: f64| {
            if value.is_finite() && value > 0.0 {
                value
            } else {
                1.0
            }
        };
        Self {
            width: fix(self.width),
            height: fix(self.height),
        }
    }
}

/// A normalized rectangle paired with its pixel box for one viewport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighlightBox {
    pub rect: NormalizedRect,
    pub abs: PixelRect,
    /// Key of the text span this box was snapped onto.
    pub span_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub page_index: usize,
    pub scale: f32,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page_index: 0,
            scale: 1.0,
        }
    }
}
