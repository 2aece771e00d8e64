//! Sequential page-candidate search against the rectangle-lookup service.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use serde_with::skip_serializing_none;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{LookupError, ResolveError};
use crate::model::{Citation, RawRect, RectBundle, RectSource, Scope};
use crate::terms::{extract_terms, TermSet};

pub const DEFAULT_CANDIDATE_OFFSETS: [i64; 5] = [0, -1, 1, -2, 2];

/// One rectangle-lookup request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LookupQuery {
    pub document_id: String,
    /// 1-based.
    pub page: u32,
    pub scope: Scope,
    pub phrase: Option<String>,
    pub terms: Vec<String>,
    pub debug: bool,
}

/// The external rectangle-lookup service.
///
/// Implementations return the raw JSON body; shape handling lives in
/// [`parse_lookup_response`]. Dropping the returned future must abort the
/// request.
#[async_trait]
pub trait RectLookup: Send + Sync {
    async fn lookup(&self, query: &LookupQuery) -> Result<Value, LookupError>;
}

#[async_trait]
impl<T: RectLookup + ?Sized> RectLookup for std::sync::Arc<T> {
    async fn lookup(&self, query: &LookupQuery) -> Result<Value, LookupError> {
        (**self).lookup(query).await
    }
}

/// A lookup response reduced to what the resolver acts on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupPayload {
    pub bundles: Vec<RectBundle>,
    pub page: Option<u32>,
    pub reason: Option<String>,
}

impl LookupPayload {
    pub fn rect_count(&self) -> usize {
        self.bundles.iter().map(|bundle| bundle.rects.len()).sum()
    }
}

/// Accepts both the per-page entry list and the single-page shape.
pub fn parse_lookup_response(payload: &Value) -> LookupPayload {
    let reason = payload
        .get("reason")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .map(str::to_string);
    let page = payload
        .get("page")
        .and_then(to_number)
        .filter(|page| *page > 0.0)
        .map(|page| page.floor() as u32);

    let entries = page_entries(payload);
    let mut bundles = Vec::new();
    for entry in entries {
        let Some(page) = field(entry, &["page"])
            .or_else(|| payload.get("page"))
            .and_then(to_number)
            .filter(|page| *page > 0.0)
        else {
            continue;
        };
        let rects: Vec<RawRect> = entry
            .get("rects")
            .and_then(Value::as_array)
            .map(|rects| rects.iter().filter_map(convert_rect).collect())
            .unwrap_or_default();
        if rects.is_empty() {
            continue;
        }
        let engine = field(entry, &["engine"]).or_else(|| field(payload, &["engine", "impl"]));
        bundles.push(RectBundle {
            page: page.floor() as u32,
            rects,
            page_width: field(entry, &["w", "width"])
                .or_else(|| field(payload, &["w", "width"]))
                .and_then(to_number),
            page_height: field(entry, &["h", "height"])
                .or_else(|| field(payload, &["h", "height"]))
                .and_then(to_number),
            source: if engine.is_some() {
                RectSource::Server
            } else {
                RectSource::Fallback
            },
        });
    }

    if bundles.is_empty() {
        if let Some(rects) = payload.get("rects").and_then(Value::as_array) {
            if rects.iter().all(Value::is_array) {
                let rects: Vec<RawRect> = rects.iter().filter_map(convert_rect).collect();
                if !rects.is_empty() {
                    bundles.push(RectBundle {
                        page: page.unwrap_or(1),
                        rects,
                        page_width: field(payload, &["w", "width"]).and_then(to_number),
                        page_height: field(payload, &["h", "height"]).and_then(to_number),
                        source: RectSource::Fallback,
                    });
                }
            }
        }
    }

    bundles.sort_by_key(|bundle| bundle.page);
    LookupPayload {
        bundles,
        page,
        reason,
    }
}

fn page_entries(payload: &Value) -> &[Value] {
    let looks_like_entry = |entry: &Value| {
        entry.is_object() && (entry.get("rects").is_some() || entry.get("page").is_some())
    };

    for key in ["pages", "rect_pages"] {
        if let Some(entries) = payload.get(key).and_then(Value::as_array) {
            return entries;
        }
    }
    if let Some(rects) = payload.get("rects").and_then(Value::as_array) {
        if rects.iter().all(looks_like_entry) {
            return rects;
        }
    }
    if let Some(items) = payload.get("items").and_then(Value::as_array) {
        return items;
    }
    payload.as_array().map(Vec::as_slice).unwrap_or_default()
}

/// First present, non-null field among `keys`.
fn field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|found| !found.is_null())
}

fn to_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

/// `[x1, y1, x2, y2, term?]` or an object with edge / size fields.
fn convert_rect(rect: &Value) -> Option<RawRect> {
    if let Some(items) = rect.as_array() {
        if items.len() < 4 {
            return None;
        }
        let coords: Vec<f64> = items[..4].iter().filter_map(to_number).collect();
        if coords.len() != 4 {
            return None;
        }
        return Some(RawRect {
            x1: coords[0],
            y1: coords[1],
            x2: coords[2],
            y2: coords[3],
            term: items.get(4).and_then(Value::as_str).map(str::to_string),
        });
    }

    if !rect.is_object() {
        return None;
    }
    let x1 = field(rect, &["x1", "x", "left", "x0"]).and_then(to_number)?;
    let y1 = field(rect, &["y1", "y", "top", "y0"]).and_then(to_number)?;
    let x2 = field(rect, &["x2", "right"])
        .and_then(to_number)
        .or_else(|| field(rect, &["width"]).and_then(to_number).map(|w| x1 + w))?;
    let y2 = field(rect, &["y2", "bottom"])
        .and_then(to_number)
        .or_else(|| field(rect, &["height"]).and_then(to_number).map(|h| y1 + h))?;
    Some(RawRect {
        x1,
        y1,
        x2,
        y2,
        term: rect.get("term").and_then(Value::as_str).map(str::to_string),
    })
}

/// Explicit page in the payload, else the first bundle's page, else `fallback`.
pub fn resolve_target_page(payload: &LookupPayload, fallback: u32) -> u32 {
    payload
        .page
        .or_else(|| payload.bundles.first().map(|bundle| bundle.page))
        .unwrap_or(fallback)
        .max(1)
}

/// Absent, non-finite or non-positive pages become page 1.
pub fn to_positive_page(page: Option<i64>) -> u32 {
    match page {
        Some(page) if page > 0 => u32::try_from(page).unwrap_or(u32::MAX),
        _ => 1,
    }
}

/// Ordered, de-duplicated, positive-only pages around `requested`.
pub fn candidate_pages(requested: u32, offsets: &[i64]) -> Vec<u32> {
    let mut candidates = Vec::with_capacity(offsets.len());
    for offset in offsets {
        let value = i64::from(requested) + offset;
        if value <= 0 {
            continue;
        }
        let Ok(page) = u32::try_from(value) else {
            continue;
        };
        if !candidates.contains(&page) {
            candidates.push(page);
        }
    }
    if candidates.is_empty() {
        candidates.push(requested.max(1));
    }
    candidates
}

/// One resolution attempt for a single citation.
#[derive(Debug, Clone)]
pub struct ResolveSession {
    pub id: Uuid,
    pub generation: u64,
    pub document_id: Option<String>,
    pub requested_page: u32,
    pub terms: TermSet,
    pub candidates: Vec<u32>,
    cancel: CancellationToken,
}

impl ResolveSession {
    /// Identity of the inputs; sessions with equal keys resolve the same way.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.document_id.as_deref().unwrap_or(""),
            self.requested_page,
            self.terms.key()
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedHighlight {
    /// 1-based page the viewer should show.
    pub page: u32,
    pub bundles: Vec<RectBundle>,
    pub rect_count: usize,
    pub tried: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Resolved(ResolvedHighlight),
    /// A newer session replaced this one, or it was aborted.
    Superseded,
}

/// Snapshot of the latest resolution attempt, published on demand.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolveDiagnostics {
    pub session_id: Option<Uuid>,
    pub requested_page: u32,
    pub tried_pages: Vec<u32>,
    pub picked_page: Option<u32>,
    pub server_rects_count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub candidate_offsets: Vec<i64>,
    pub debug: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            candidate_offsets: DEFAULT_CANDIDATE_OFFSETS.to_vec(),
            debug: true,
        }
    }
}

pub struct PageCandidateResolver<L> {
    lookup: L,
    scope: Scope,
    options: ResolverOptions,
    generation: AtomicU64,
    active: Mutex<Option<CancellationToken>>,
    diagnostics: Mutex<Option<ResolveDiagnostics>>,
}

impl<L: RectLookup> PageCandidateResolver<L> {
    pub fn new(lookup: L, scope: Scope, options: ResolverOptions) -> Self {
        Self {
            lookup,
            scope,
            options,
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
            diagnostics: Mutex::new(None),
        }
    }

    pub fn lookup(&self) -> &L {
        &self.lookup
    }

    /// Starts a new session, cancelling whichever one was active.
    pub fn begin(&self, citation: &Citation) -> ResolveSession {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        if let Some(previous) = self.active.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let requested_page = to_positive_page(citation.page);
        let terms = extract_terms(citation.highlight_seed(), &citation.queries);
        let session = ResolveSession {
            id: Uuid::new_v4(),
            generation,
            document_id: citation
                .document_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            requested_page,
            candidates: candidate_pages(requested_page, &self.options.candidate_offsets),
            terms,
            cancel,
        };
        *self.diagnostics.lock() = Some(ResolveDiagnostics {
            session_id: Some(session.id),
            requested_page,
            ..ResolveDiagnostics::default()
        });
        session
    }

    /// Cancels the active session, if any.
    pub fn abort(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(active) = self.active.lock().take() {
            active.cancel();
        }
    }

    pub fn is_current(&self, session: &ResolveSession) -> bool {
        !session.is_cancelled() && self.generation.load(Ordering::SeqCst) == session.generation
    }

    pub fn diagnostics(&self) -> Option<ResolveDiagnostics> {
        self.diagnostics.lock().clone()
    }

    /// Queries candidate pages one at a time until one yields rectangles.
    #[instrument(skip(self, session), fields(session = %session.id, generation = session.generation))]
    pub async fn run(&self, session: &ResolveSession) -> Result<ResolveOutcome, ResolveError> {
        let Some(document_id) = session.document_id.clone() else {
            self.record(session, |diag| diag.error = Some("missing-document".into()));
            return Err(ResolveError::MissingDocument);
        };
        if session.terms.is_empty() {
            self.record(session, |diag| diag.error = Some("nothing-to-search".into()));
            return Err(ResolveError::NothingToSearch);
        }

        let phrase = Some(session.terms.phrase.clone()).filter(|phrase| !phrase.is_empty());
        let terms = session.terms.texts();
        let mut tried = Vec::with_capacity(session.candidates.len());

        for &candidate in &session.candidates {
            if !self.is_current(session) {
                return Ok(ResolveOutcome::Superseded);
            }
            tried.push(candidate);
            let snapshot = tried.clone();
            self.record(session, |diag| {
                diag.tried_pages = snapshot;
                diag.error = None;
            });

            let query = LookupQuery {
                document_id: document_id.clone(),
                page: candidate,
                scope: self.scope.clone(),
                phrase: phrase.clone(),
                terms: terms.clone(),
                debug: self.options.debug,
            };
            debug!(page = candidate, "querying rectangles");

            let response = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => return Ok(ResolveOutcome::Superseded),
                response = self.lookup.lookup(&query) => response,
            };
            if !self.is_current(session) {
                debug!(page = candidate, "dropping response of a superseded session");
                return Ok(ResolveOutcome::Superseded);
            }

            let payload = match response {
                Ok(body) => parse_lookup_response(&body),
                Err(err) => {
                    warn!(page = candidate, %err, "rect lookup failed");
                    let message = err.to_string();
                    self.record(session, |diag| diag.error = Some(message));
                    continue;
                }
            };

            let count = payload.rect_count();
            if let Some(reason) = payload.reason.clone() {
                self.record(session, |diag| {
                    diag.server_rects_count = count;
                    diag.error = Some(reason.clone());
                });
                return Err(ResolveError::Rejected { reason });
            }
            if count > 0 {
                let page = resolve_target_page(&payload, candidate);
                self.record(session, |diag| {
                    diag.server_rects_count = count;
                    diag.picked_page = Some(page);
                });
                return Ok(ResolveOutcome::Resolved(ResolvedHighlight {
                    page,
                    bundles: payload.bundles,
                    rect_count: count,
                    tried,
                }));
            }
            debug!(page = candidate, "no rectangles on candidate page");
        }

        self.record(session, |diag| diag.error = Some("no_server_rects".into()));
        Err(ResolveError::NotFound { tried })
    }

    fn record<F>(&self, session: &ResolveSession, update: F)
    where
        F: FnOnce(&mut ResolveDiagnostics),
    {
        let mut guard = self.diagnostics.lock();
        if let Some(diag) = guard.as_mut() {
            if diag.session_id == Some(session.id) {
                update(diag);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::Notify;

    enum Scripted {
        Body(Value),
        Fail,
    }

    #[derive(Default)]
    struct ScriptedLookup {
        pages: Mutex<HashMap<u32, Scripted>>,
        calls: Mutex<Vec<LookupQuery>>,
    }

    impl ScriptedLookup {
        fn with(self, page: u32, scripted: Scripted) -> Self {
            self.pages.lock().insert(page, scripted);
            self
        }

        fn called_pages(&self) -> Vec<u32> {
            self.calls.lock().iter().map(|query| query.page).collect()
        }
    }

    #[async_trait]
    impl RectLookup for ScriptedLookup {
        async fn lookup(&self, query: &LookupQuery) -> Result<Value, LookupError> {
            self.calls.lock().push(query.clone());
            match self.pages.lock().get(&query.page) {
                Some(Scripted::Body(body)) => Ok(body.clone()),
                Some(Scripted::Fail) => Err(LookupError::Status(502)),
                None => Ok(json!({ "page": query.page, "rects": [] })),
            }
        }
    }

    fn resolver(lookup: ScriptedLookup) -> PageCandidateResolver<ScriptedLookup> {
        PageCandidateResolver::new(lookup, Scope::default(), ResolverOptions::default())
    }

    fn citation(text: &str, page: i64) -> Citation {
        Citation::new(text).with_document("doc-1").with_page(page)
    }

    #[test]
    fn candidates_follow_offset_pattern() {
        assert_eq!(candidate_pages(5, &DEFAULT_CANDIDATE_OFFSETS), vec![5, 4, 6, 3, 7]);
        assert_eq!(candidate_pages(1, &DEFAULT_CANDIDATE_OFFSETS), vec![1, 2, 3]);
        assert_eq!(candidate_pages(2, &DEFAULT_CANDIDATE_OFFSETS), vec![2, 1, 3, 4]);
        assert_eq!(candidate_pages(3, &[0, 0, -5]), vec![3]);
    }

    #[test]
    fn requested_page_defaults_to_one() {
        assert_eq!(to_positive_page(None), 1);
        assert_eq!(to_positive_page(Some(0)), 1);
        assert_eq!(to_positive_page(Some(-3)), 1);
        assert_eq!(to_positive_page(Some(12)), 12);
    }

    #[test]
    fn parses_per_page_entries() {
        let payload = parse_lookup_response(&json!({
            "engine": "chars",
            "pages": [
                { "page": 7, "rects": [[1, 2, 3, 4, "term"]], "w": 600, "h": 800 },
                { "page": 6, "rects": [{ "x": 10, "y": 20, "width": 5, "height": 6 }] },
                { "page": 8, "rects": [] },
                { "page": 0, "rects": [[1, 2, 3, 4]] }
            ]
        }));
        assert_eq!(payload.bundles.len(), 2);
        assert_eq!(payload.bundles[0].page, 6);
        assert_eq!(payload.bundles[0].rects[0], RawRect::new(10.0, 20.0, 15.0, 26.0));
        assert_eq!(payload.bundles[1].rects[0].term.as_deref(), Some("term"));
        assert_eq!(payload.bundles[1].page_width, Some(600.0));
        assert!(payload
            .bundles
            .iter()
            .all(|bundle| bundle.source == RectSource::Server));
        assert_eq!(payload.rect_count(), 2);
    }

    #[test]
    fn parses_single_page_shape() {
        let payload = parse_lookup_response(&json!({
            "page": 4,
            "rects": [[1, 2, 3, 4], ["5", "6", "7", "8"], [1, 2, "x", 4], [1, 2]],
            "height": 842
        }));
        assert_eq!(payload.page, Some(4));
        assert_eq!(payload.bundles.len(), 1);
        let bundle = &payload.bundles[0];
        assert_eq!(bundle.page, 4);
        assert_eq!(bundle.rects.len(), 2);
        assert_eq!(bundle.page_height, Some(842.0));
        assert_eq!(bundle.source, RectSource::Fallback);
    }

    #[test]
    fn reason_is_extracted() {
        let payload =
            parse_lookup_response(&json!({ "reason": "doc_not_in_notebook", "rects": [] }));
        assert_eq!(payload.reason.as_deref(), Some("doc_not_in_notebook"));
        assert_eq!(payload.rect_count(), 0);
        assert_eq!(parse_lookup_response(&json!({ "reason": "  " })).reason, None);
    }

    #[test]
    fn target_page_prefers_explicit_field() {
        let mut payload = parse_lookup_response(&json!([{ "page": 9, "rects": [[0, 0, 1, 1]] }]));
        assert_eq!(resolve_target_page(&payload, 3), 9);
        payload.page = Some(11);
        assert_eq!(resolve_target_page(&payload, 3), 11);
        assert_eq!(resolve_target_page(&LookupPayload::default(), 3), 3);
    }

    #[tokio::test]
    async fn scenario_a_walks_to_the_first_page_with_rects() {
        let lookup = ScriptedLookup::default().with(
            6,
            Scripted::Body(json!({
                "page": 6,
                "engine": "chars",
                "pages": [{ "page": 6, "rects": [[10, 10, 50, 20], [60, 10, 90, 20]] }]
            })),
        );
        let resolver = resolver(lookup);
        let session = resolver.begin(&citation("APIの設計原則について", 5));
        let outcome = resolver.run(&session).await.unwrap();

        let ResolveOutcome::Resolved(resolved) = outcome else {
            panic!("expected a resolution");
        };
        assert_eq!(resolved.page, 6);
        assert_eq!(resolved.rect_count, 2);
        assert_eq!(resolved.tried, vec![5, 4, 6]);
        assert_eq!(resolver.lookup().called_pages(), vec![5, 4, 6]);

        let diag = resolver.diagnostics().unwrap();
        assert_eq!(diag.picked_page, Some(6));
        assert_eq!(diag.server_rects_count, 2);
    }

    #[tokio::test]
    async fn queries_carry_phrase_terms_and_scope() {
        let resolver = resolver(ScriptedLookup::default());
        let session = resolver.begin(&citation("APIの設計原則について", 1));
        let _ = resolver.run(&session).await;
        let calls = resolver.lookup().calls.lock();
        let first = &calls[0];
        assert_eq!(first.document_id, "doc-1");
        assert_eq!(first.phrase.as_deref(), Some("APIの設計原則について"));
        assert_eq!(first.terms, session.terms.texts());
        assert!(first.debug);
        assert_eq!(first.scope.tenant, "demo");
    }

    #[tokio::test]
    async fn scenario_b_issues_no_request() {
        let resolver = resolver(ScriptedLookup::default());
        let session = resolver.begin(&citation("、。！？「」", 3));
        let err = resolver.run(&session).await.unwrap_err();
        assert_eq!(err, ResolveError::NothingToSearch);
        assert!(resolver.lookup().called_pages().is_empty());
    }

    #[tokio::test]
    async fn two_character_cjk_snippet_is_sent_as_a_phrase() {
        let resolver = resolver(ScriptedLookup::default());
        let session = resolver.begin(&citation("設計", 1));
        let _ = resolver.run(&session).await;
        let calls = resolver.lookup().calls.lock();
        assert!(!calls.is_empty());
        assert_eq!(calls[0].phrase.as_deref(), Some("設計"));
        assert!(calls[0].terms.is_empty());
    }

    #[tokio::test]
    async fn scenario_c_rejection_stops_after_one_request() {
        let lookup = ScriptedLookup::default().with(
            2,
            Scripted::Body(json!({ "reason": "doc_not_in_notebook", "rects": [] })),
        );
        let resolver = resolver(lookup);
        let session = resolver.begin(&citation("distributed consensus", 2));
        let err = resolver.run(&session).await.unwrap_err();
        assert_eq!(
            err,
            ResolveError::Rejected {
                reason: "doc_not_in_notebook".into()
            }
        );
        assert_eq!(resolver.lookup().called_pages(), vec![2]);
    }

    #[tokio::test]
    async fn not_found_after_all_candidates() {
        let resolver = resolver(ScriptedLookup::default());
        let session = resolver.begin(&citation("distributed consensus", 5));
        let err = resolver.run(&session).await.unwrap_err();
        assert_eq!(
            err,
            ResolveError::NotFound {
                tried: vec![5, 4, 6, 3, 7]
            }
        );
        assert_eq!(resolver.lookup().called_pages().len(), 5);
    }

    #[tokio::test]
    async fn transient_failures_advance_to_the_next_candidate() {
        let lookup = ScriptedLookup::default()
            .with(3, Scripted::Fail)
            .with(2, Scripted::Body(json!({ "page": 2, "rects": [[1, 1, 5, 5]] })));
        let resolver = resolver(lookup);
        let session = resolver.begin(&citation("raft leader election", 3));
        let outcome = resolver.run(&session).await.unwrap();
        assert!(matches!(outcome, ResolveOutcome::Resolved(ref r) if r.page == 2));
        assert_eq!(resolver.lookup().called_pages(), vec![3, 2]);
    }

    #[tokio::test]
    async fn failure_on_the_last_candidate_degrades_to_not_found() {
        let lookup = ScriptedLookup::default().with(2, Scripted::Fail);
        let resolver = PageCandidateResolver::new(
            lookup,
            Scope::default(),
            ResolverOptions {
                candidate_offsets: vec![0, 1],
                debug: false,
            },
        );
        let session = resolver.begin(&citation("raft leader election", 1));
        let err = resolver.run(&session).await.unwrap_err();
        assert_eq!(err, ResolveError::NotFound { tried: vec![1, 2] });
        assert_eq!(resolver.diagnostics().unwrap().error.as_deref(), Some("no_server_rects"));
    }

    #[tokio::test]
    async fn missing_document_is_rejected_without_requests() {
        let resolver = resolver(ScriptedLookup::default());
        let session = resolver.begin(&Citation::new("raft leader election"));
        assert_eq!(
            resolver.run(&session).await.unwrap_err(),
            ResolveError::MissingDocument
        );
        assert!(resolver.lookup().called_pages().is_empty());
    }

    struct GatedLookup {
        started: Notify,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl RectLookup for GatedLookup {
        async fn lookup(&self, query: &LookupQuery) -> Result<Value, LookupError> {
            *self.calls.lock() += 1;
            self.started.notify_one();
            if query.document_id == "slow" {
                std::future::pending::<()>().await;
            }
            Ok(json!({ "page": query.page, "engine": "chars", "rects": [[1, 1, 5, 5]] }))
        }
    }

    #[tokio::test]
    async fn scenario_d_replacing_the_citation_aborts_the_stale_request() {
        let resolver = Arc::new(PageCandidateResolver::new(
            GatedLookup {
                started: Notify::new(),
                calls: Mutex::new(0),
            },
            Scope::default(),
            ResolverOptions::default(),
        ));

        let stale = resolver.begin(&Citation::new("consensus").with_document("slow"));
        let task = {
            let resolver = Arc::clone(&resolver);
            let stale = stale.clone();
            tokio::spawn(async move { resolver.run(&stale).await })
        };
        resolver.lookup().started.notified().await;

        let fresh = resolver.begin(&Citation::new("consensus").with_document("fast"));
        assert!(stale.is_cancelled());
        assert!(!resolver.is_current(&stale));

        let stale_outcome = task.await.unwrap().unwrap();
        assert_eq!(stale_outcome, ResolveOutcome::Superseded);

        let fresh_outcome = resolver.run(&fresh).await.unwrap();
        assert!(matches!(fresh_outcome, ResolveOutcome::Resolved(_)));
        assert_eq!(*resolver.lookup().calls.lock(), 2);
    }

    #[tokio::test]
    async fn session_key_changes_with_inputs() {
        let resolver = resolver(ScriptedLookup::default());
        let a = resolver.begin(&citation("consensus protocol", 2));
        let b = resolver.begin(&citation("consensus protocol", 2));
        let c = resolver.begin(&citation("consensus protocol", 3));
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert!(a.generation < b.generation && b.generation < c.generation);
    }
}
