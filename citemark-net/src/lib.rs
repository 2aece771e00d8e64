//! HTTP access to the retrieval backend: rectangle lookups and document bytes.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use citemark_core::config::LookupConfig;
use citemark_core::{LookupError, LookupQuery, RectLookup, Scope};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

const REQUESTED_BY: &str = "citemark";
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid backend url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("download was cancelled")]
    Cancelled,
}

/// Client for the backend's `/docs` endpoints.
#[derive(Debug, Clone)]
pub struct HttpRectLookup {
    client: Client,
    base: Url,
    api_key: Option<String>,
}

impl HttpRectLookup {
    pub fn new(config: &LookupConfig) -> Result<Self, NetError> {
        let base = Url::parse(config.base_url.trim()).map_err(|err| NetError::InvalidUrl {
            url: config.base_url.clone(),
            reason: err.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(NetError::InvalidUrl {
                url: config.base_url.clone(),
                reason: "not a hierarchical url".into(),
            });
        }
        let mut builder = Client::builder();
        if let Some(secs) = config.timeout_secs.filter(|secs| *secs > 0) {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().map_err(NetError::Client)?;
        Ok(Self {
            client,
            base,
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub fn rects_url(&self, query: &LookupQuery) -> Url {
        let mut url = self.endpoint(&["docs", "rects"]);
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("doc_id", &query.document_id)
                .append_pair("page", &query.page.to_string())
                .append_pair("debug", if query.debug { "1" } else { "0" });
            if let Some(phrase) = &query.phrase {
                pairs.append_pair("phrase", phrase);
            }
            for term in &query.terms {
                pairs.append_pair("terms", term);
            }
            for (key, value) in query.scope.query_pairs() {
                pairs.append_pair(key, &value);
            }
            pairs
                .append_pair("engine", "chars")
                .append_pair("include_items", "1");
        }
        url
    }

    pub fn document_url(&self, document_id: &str, scope: &Scope) -> Url {
        let mut url = self.endpoint(&["docs", document_id, "pdf"]);
        url.query_pairs_mut().extend_pairs(scope.query_pairs());
        url
    }

    fn scoped(
        &self,
        request: RequestBuilder,
        scope: &Scope,
        accept: &'static str,
    ) -> RequestBuilder {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(accept));
        headers.insert(
            HeaderName::from_static("x-requested-by"),
            HeaderValue::from_static(REQUESTED_BY),
        );
        let include_global = if scope.include_global { "true" } else { "false" };
        for (name, value) in [
            ("x-tenant", scope.tenant.as_str()),
            ("x-user-id", scope.user_id.as_str()),
            ("x-notebook-id", scope.notebook_id.as_str()),
            ("x-include-global", include_global),
        ] {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.insert(HeaderName::from_static(name), value);
                }
                Err(_) => warn!(header = name, "scope value is not a valid header, skipping"),
            }
        }
        if let Some(key) = &self.api_key {
            if let (Ok(bearer), Ok(raw)) = (
                HeaderValue::from_str(&format!("Bearer {key}")),
                HeaderValue::from_str(key),
            ) {
                headers.insert(AUTHORIZATION, bearer);
                headers.insert(HeaderName::from_static("x-api-key"), raw);
            }
        }
        request.headers(headers)
    }

    pub fn rects_request(&self, query: &LookupQuery) -> RequestBuilder {
        self.scoped(
            self.client.get(self.rects_url(query)),
            &query.scope,
            "application/json",
        )
    }

    /// Downloads a document, reporting `(loaded, total)` after every chunk.
    #[instrument(skip(self, scope, progress, cancel))]
    pub async fn fetch_document<F>(
        &self,
        document_id: &str,
        scope: &Scope,
        progress: F,
        cancel: &CancellationToken,
    ) -> Result<Bytes, NetError>
    where
        F: Fn(u64, Option<u64>),
    {
        let request = self.scoped(
            self.client.get(self.document_url(document_id, scope)),
            scope,
            "application/pdf",
        );
        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetError::Cancelled),
            response = request.send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(NetError::Status(status.as_u16()));
        }

        let total = response.content_length();
        let capacity = total.unwrap_or(0).min(MAX_PREALLOCATION) as usize;
        let mut buffer = BytesMut::with_capacity(capacity);
        progress(0, total);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(NetError::Cancelled),
                chunk = response.chunk() => chunk?,
            };
            let Some(chunk) = chunk else {
                break;
            };
            buffer.extend_from_slice(&chunk);
            progress(buffer.len() as u64, total);
        }
        debug!(bytes = buffer.len(), "document downloaded");
        Ok(buffer.freeze())
    }
}

fn status_error(status: StatusCode) -> LookupError {
    LookupError::Status(status.as_u16())
}

#[async_trait]
impl RectLookup for HttpRectLookup {
    async fn lookup(&self, query: &LookupQuery) -> Result<Value, LookupError> {
        let response = self
            .rects_request(query)
            .send()
            .await
            .map_err(|err| LookupError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| LookupError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(base_url: &str, api_key: Option<&str>) -> HttpRectLookup {
        HttpRectLookup::new(&LookupConfig {
            base_url: base_url.to_string(),
            api_key: api_key.map(str::to_string),
            ..LookupConfig::default()
        })
        .unwrap()
    }

    fn query() -> LookupQuery {
        LookupQuery {
            document_id: "doc 1".into(),
            page: 6,
            scope: Scope {
                notebook_id: "nb-7".into(),
                ..Scope::default()
            },
            phrase: Some("APIの設計原則について".into()),
            terms: vec!["APIの設計原".into(), "REST".into()],
            debug: true,
        }
    }

    #[test]
    fn rects_url_carries_query_and_scope() {
        let url = lookup("http://127.0.0.1:3002", None).rects_url(&query());
        assert_eq!(url.path(), "/docs/rects");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        let get = |key: &str| -> Vec<&str> {
            pairs
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .collect()
        };
        assert_eq!(get("doc_id"), vec!["doc 1"]);
        assert_eq!(get("page"), vec!["6"]);
        assert_eq!(get("debug"), vec!["1"]);
        assert_eq!(get("phrase"), vec!["APIの設計原則について"]);
        assert_eq!(get("terms"), vec!["APIの設計原", "REST"]);
        assert_eq!(get("tenant"), vec!["demo"]);
        assert_eq!(get("notebook_id"), vec!["nb-7"]);
        assert_eq!(get("include_global"), vec!["false"]);
        assert_eq!(get("engine"), vec!["chars"]);
        assert_eq!(get("include_items"), vec!["1"]);
    }

    #[test]
    fn base_path_is_preserved() {
        let client = lookup("https://rag.example.com/api/", None);
        let mut without_phrase = query();
        without_phrase.phrase = None;
        let url = client.rects_url(&without_phrase);
        assert_eq!(url.path(), "/api/docs/rects");
        assert!(url.query_pairs().all(|(key, _)| key != "phrase"));

        let doc = client.document_url("a/b", &Scope::default());
        assert_eq!(doc.path(), "/api/docs/a%2Fb/pdf");
        assert!(doc.query().unwrap().contains("user_id=local"));
    }

    #[test]
    fn headers_include_scope_and_credentials() {
        let request = lookup("http://localhost:3002", Some("k3y"))
            .rects_request(&query())
            .build()
            .unwrap();
        let headers = request.headers();
        assert_eq!(headers[ACCEPT], "application/json");
        assert_eq!(headers["x-requested-by"], REQUESTED_BY);
        assert_eq!(headers["x-tenant"], "demo");
        assert_eq!(headers["x-notebook-id"], "nb-7");
        assert_eq!(headers["x-include-global"], "false");
        assert_eq!(headers[AUTHORIZATION], "Bearer k3y");
        assert_eq!(headers["x-api-key"], "k3y");

        let anonymous = lookup("http://localhost:3002", None)
            .rects_request(&query())
            .build()
            .unwrap();
        assert!(anonymous.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = HttpRectLookup::new(&LookupConfig {
            base_url: "not a url".into(),
            ..LookupConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, NetError::InvalidUrl { .. }));
    }

    #[test]
    fn status_codes_map_to_lookup_errors() {
        let err = status_error(StatusCode::BAD_GATEWAY);
        assert!(matches!(err, LookupError::Status(502)));
        assert_eq!(err.to_string(), "HTTP 502");
    }

    #[tokio::test]
    async fn cancelled_download_never_sends() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = lookup("http://127.0.0.1:9", None);
        let result = client
            .fetch_document("doc", &Scope::default(), |_, _| {}, &cancel)
            .await;
        assert!(matches!(result, Err(NetError::Cancelled)));
    }
}
