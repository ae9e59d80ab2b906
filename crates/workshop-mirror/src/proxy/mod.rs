//! Upstream forwarding for every mirrored browsing route.
//!
//! Requests are replayed against the upstream origin with compression
//! negotiation removed, so response bodies arrive as plain text and can be
//! rewritten by [`rewrite::RewriteRules`].

pub mod rewrite;

use crate::error::{MirrorError, MirrorResult};
use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::Method;
use axum::response::Response;
use rewrite::RewriteRules;
use std::time::Duration;
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest inbound request body replayed upstream.
const MAX_REQUEST_BODY: usize = 8 * 1024 * 1024;

/// Request headers that are never forwarded.
const DROPPED_REQUEST_HEADERS: &[HeaderName] = &[
    header::HOST,
    header::ACCEPT_ENCODING,
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
];

/// The mirrored upstream site.
pub struct Upstream {
    client: reqwest::Client,
    origin: Url,
    rules: RewriteRules,
}

impl Upstream {
    pub fn new(origin: Url) -> MirrorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let rules = RewriteRules::for_origin(&origin);
        Ok(Self {
            client,
            origin,
            rules,
        })
    }

    /// Upstream URL for an inbound path and query.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut target = self.origin.clone();
        target.set_path(path);
        target.set_query(query);
        target
    }

    /// Inbound headers minus hop-by-hop and compression headers. `Referer`
    /// and `Origin` pointing at the mirror itself are moved to the upstream
    /// origin.
    pub fn outbound_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mirror_host = inbound
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut headers = inbound.clone();
        for name in DROPPED_REQUEST_HEADERS {
            headers.remove(name);
        }

        if let Some(host) = mirror_host {
            for name in [header::REFERER, header::ORIGIN] {
                let moved = headers
                    .get(&name)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| self.point_at_upstream(v, &host));
                if let Some(value) = moved.and_then(|v| HeaderValue::from_str(&v).ok()) {
                    headers.insert(name, value);
                }
            }
        }
        headers
    }

    fn point_at_upstream(&self, value: &str, mirror_host: &str) -> Option<String> {
        let upstream = self.origin.as_str().trim_end_matches('/');
        ["http://", "https://"].iter().find_map(|scheme| {
            let rest = value.strip_prefix(scheme)?.strip_prefix(mirror_host)?;
            (rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
                .then(|| format!("{upstream}{rest}"))
        })
    }

    /// Replay `req` upstream and rewrite the response for the mirror.
    ///
    /// Transport failures map to [`MirrorError::Upstream`]; a body that
    /// cannot be read or rewritten maps to [`MirrorError::Rewrite`].
    pub async fn forward(&self, req: Request) -> MirrorResult<Response> {
        let (parts, body) = req.into_parts();
        let target = self.target_url(parts.uri.path(), parts.uri.query());
        let headers = self.outbound_headers(&parts.headers);
        let body = to_bytes(body, MAX_REQUEST_BODY)
            .await
            .map_err(|e| MirrorError::Rewrite(format!("failed to read request body: {e}")))?;

        debug!(method = %parts.method, %target, "forwarding upstream");
        let upstream = self
            .client
            .request(parts.method.clone(), target)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        let body = upstream
            .bytes()
            .await
            .map_err(|e| MirrorError::Rewrite(format!("failed to read upstream body: {e}")))?;

        let body = if parts.method == Method::HEAD {
            self.rules.rewrite_headers(&mut headers);
            body
        } else {
            self.rules.rewrite_response(&mut headers, body)?
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}
