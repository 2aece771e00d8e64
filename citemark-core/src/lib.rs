pub mod config;
pub mod error;
pub mod model;
pub mod normalize;
pub mod overlay;
pub mod resolver;
pub mod snap;
pub mod terms;
pub mod viewer;
pub mod viewport;

pub use config::EngineConfig;
pub use error::{ConfigError, LookupError, ResolveError, ViewerError};
pub use model::{
    Citation, HighlightBox, NormalizedRect, PixelRect, RawRect, RectBundle, RectSource,
    RenderImage, RenderRequest, Scope, TextSpanRect, ViewportSize,
};
pub use overlay::{paint_onto, render_overlay, OverlayBox, OverlayFrame};
pub use resolver::{
    LookupQuery, PageCandidateResolver, RectLookup, ResolveDiagnostics, ResolveOutcome,
    ResolveSession, ResolvedHighlight, ResolverOptions,
};
pub use terms::{extract_terms, TermSet};
pub use viewer::{
    DocumentBackend, DocumentProvider, DocumentSource, HighlightStatus, LoadTicket, Phase,
    ProgressSink, SurfaceCommand, SurfaceEvent, ViewerDiagnostics, ViewerEvent,
    ViewerLifecycleController, ViewerOptions,
};
pub use viewport::PageViewport;
