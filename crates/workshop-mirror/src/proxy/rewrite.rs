//! Response rewriting for the mirror.
//!
//! Every link into the mirrored hosts becomes a site-relative path, so
//! browsing stays on the mirror. Subscribe controls gain download buttons
//! that point at the archive routes.

use crate::error::{MirrorError, MirrorResult};
use axum::body::Bytes;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use regex::Regex;
use scraper::{Html, Node, Selector};
use std::collections::VecDeque;
use std::sync::OnceLock;
use url::Url;

const SITE_NAME: &str = "Steam Community";
const TITLE_REPLACEMENT: &str = "Workshop Mirror";
const AJAX_SEARCH_PATH: &str = "/workshop/ajaxfindworkshops";

/// Hosts whose absolute URLs are folded onto the mirror, subdomains included.
const MIRRORED_HOSTS: &[&str] = &["steamcommunity.com", "akamai.steamstatic.com"];


/// Response headers removed from every proxied response.
const STRIPPED_HEADERS: &[HeaderName] = &[
    header::CONTENT_SECURITY_POLICY,
    header::X_FRAME_OPTIONS,
    header::CONTENT_ENCODING,
    header::ACCESS_CONTROL_ALLOW_ORIGIN,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// `top.location.href='<url>'` at the start of a handler; group 1 is the URL.
fn top_location_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^top\.location\.href='([^']*)'").expect("top location regex is valid")
    })
}

fn subscribe_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\b(SubscribeCollectionItem|SubscribeCollection|SubscribeItem)\s*\(\s*'(\d+)'\s*,\s*'(\d+)'\s*\)",
        )
        .expect("subscribe regex is valid")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeKind {
    Item,
    Collection,
    CollectionItem,
}

/// A parsed inline subscribe handler. The page passes the content id first
/// and the app id second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeCall {
    pub kind: SubscribeKind,
    pub id: u64,
    pub app_id: u64,
}

/// First subscribe call found in an inline handler.
pub fn parse_subscribe(handler: &str) -> Option<SubscribeCall> {
    let caps = subscribe_pattern().captures(handler)?;
    let kind = match caps[1].to_ascii_lowercase().as_str() {
        "subscribeitem" => SubscribeKind::Item,
        "subscribecollection" => SubscribeKind::Collection,
        _ => SubscribeKind::CollectionItem,
    };
    Some(SubscribeCall {
        kind,
        id: caps[2].parse().ok()?,
        app_id: caps[3].parse().ok()?,
    })
}

/// Per-response state carried through one HTML transform.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RewriteContext {
    pub title_replaced: bool,
    /// Set once the page's collection download button is placed.
    pub collection_button_placed: bool,
}

fn item_button(app_id: u64, item_id: u64) -> String {
    format!(
        r#"<div><a href="/api/workshop/{app_id}/{item_id}" class="btn_darkred_white_innerfade btn_border_2px btn_medium" style="position: relative"> <div class="followIcon"></div> <span class="subscribeText"> <div>Download</div> </span> </a> </div>"#
    )
}

fn collection_button(app_id: u64, collection_id: u64) -> String {
    format!(
        r#"<a class="general_btn subscribe" style="background: #640000; color: white;display:table" href="/api/collection/{app_id}/{collection_id}"><div class="followIcon"></div> <span class="subscribeText">Download Collection</span> </a>"#
    )
}

/// The mirror's rewriting rules for one upstream origin.
#[derive(Debug, Clone)]
pub struct RewriteRules {
    hosts: Vec<String>,
    ajax_endpoint: String,
    repo_url: String,
}

impl Default for RewriteRules {
    fn default() -> Self {
        let origin = Url::parse(crate::config::DEFAULT_UPSTREAM)
            .expect("default upstream is a valid URL");
        Self::for_origin(&origin)
    }
}

impl RewriteRules {
    pub fn for_origin(origin: &Url) -> Self {
        let mut hosts: Vec<String> = MIRRORED_HOSTS.iter().map(|h| h.to_string()).collect();
        if let Some(host) = origin.host_str() {
            if !hosts.iter().any(|h| h == host) {
                hosts.push(host.to_string());
            }
        }
        Self {
            hosts,
            ajax_endpoint: format!(
                "{}{AJAX_SEARCH_PATH}",
                origin.as_str().trim_end_matches('/')
            ),
            repo_url: env!("CARGO_PKG_REPOSITORY").to_string(),
        }
    }

    fn is_mirrored(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.hosts
            .iter()
            .any(|h| host == *h || host.ends_with(&format!(".{h}")))
    }

    /// Fold an absolute URL on a mirrored host into a site-relative path.
    ///
    /// Empty values, fragments, `mailto:`/`javascript:` links, relative URLs
    /// and foreign hosts come back unchanged. In a `top.location.href='...'`
    /// handler only the quoted URL is rewritten; any trailing script stays.
    pub fn rewrite_url(&self, raw: &str) -> String {
        let lower = raw.to_ascii_lowercase();
        if raw.is_empty()
            || raw.starts_with('#')
            || lower.starts_with("mailto:")
            || lower.starts_with("javascript:")
        {
            return raw.to_string();
        }

        if let Some(url) = top_location_pattern()
            .captures(raw)
            .and_then(|caps| caps.get(1))
        {
            return match self.fold(url.as_str()) {
                Some(relative) => format!(
                    "{}{relative}{}",
                    &raw[..url.start()],
                    &raw[url.end()..]
                ),
                None => raw.to_string(),
            };
        }
        self.fold(raw).unwrap_or_else(|| raw.to_string())
    }

    /// Request URI of `url` when it is absolute and on a mirrored host.
    fn fold(&self, url: &str) -> Option<String> {
        let parsed = if url.starts_with("//") {
            Url::parse(&format!("https:{url}"))
        } else {
            Url::parse(url)
        };
        parsed
            .ok()
            .filter(|u| u.host_str().is_some_and(|h| self.is_mirrored(h)))
            .map(|u| request_uri(&u))
    }

    /// Apply [`rewrite_url`](Self::rewrite_url) to each URL of a `srcset`,
    /// keeping width and density descriptors.
    pub fn rewrite_srcset(&self, srcset: &str) -> String {
        srcset
            .split(',')
            .filter_map(|candidate| {
                let mut parts = candidate.split_whitespace();
                let url = parts.next()?;
                let mut out = self.rewrite_url(url);
                for descriptor in parts {
                    out.push(' ');
                    out.push_str(descriptor);
                }
                Some(out)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Transform one HTML page. Steps run in a fixed order: title, injected
    /// controls, then URL attributes.
    pub fn rewrite_html(&self, html: &str, ctx: &mut RewriteContext) -> String {
        let mut doc = Html::parse_document(html);
        replace_title(&mut doc, ctx);
        self.inject_controls(&mut doc, ctx);
        self.rewrite_attributes(&mut doc);
        doc.html()
    }

    /// Download buttons and the footer link.
    ///
    /// Targets are chosen on the unmodified tree, then markup is appended in
    /// page order: item buttons, footer links, collection buttons. Item
    /// buttons go on the subscribe anchor's grandparent. The first collection
    /// control gets the collection button; any later one gets an item-style
    /// button.
    fn inject_controls(&self, doc: &mut Html, ctx: &mut RewriteContext) {
        let mut plan = Vec::new();

        for anchor in doc.select(&selector("a[onclick]")) {
            let Some(call) = anchor.value().attr("onclick").and_then(parse_subscribe) else {
                continue;
            };
            if call.kind != SubscribeKind::Item {
                continue;
            }
            if let Some(target) = anchor.parent().and_then(|p| p.parent()) {
                plan.push((target.id(), item_button(call.app_id, call.id)));
            }
        }

        let repo_link = format!(
            r#" |  <a style="color: #1497cb;font-weight: bold;font-size: medium;" href="{}" target="_blank">Workshop Mirror source</a>"#,
            self.repo_url
        );
        for links in doc.select(&selector("span.valve_links")) {
            plan.push((links.id(), repo_link.clone()));
        }

        for control in doc.select(&selector(".subscribe[onclick]")) {
            let Some(call) = control.value().attr("onclick").and_then(parse_subscribe) else {
                continue;
            };
            if call.kind == SubscribeKind::Item {
                continue;
            }
            let Some(parent) = control.parent() else {
                continue;
            };
            let markup = if ctx.collection_button_placed {
                item_button(call.app_id, call.id)
            } else {
                ctx.collection_button_placed = true;
                collection_button(call.app_id, call.id)
            };
            plan.push((parent.id(), markup));
        }

        for (target, markup) in plan {
            let fragment = Html::parse_fragment(&markup);
            let mut queue: VecDeque<_> = fragment
                .root_element()
                .children()
                .map(|child| (target, child))
                .collect();
            while let Some((dest, src)) = queue.pop_front() {
                let Some(mut dest_node) = doc.tree.get_mut(dest) else {
                    continue;
                };
                let copied = dest_node.append(src.value().clone()).id();
                queue.extend(src.children().map(|child| (copied, child)));
            }
        }
    }

    fn rewrite_attributes(&self, doc: &mut Html) {
        let ids: Vec<_> = doc
            .select(&selector("[href], [onclick], [src], [srcset]"))
            .map(|el| el.id())
            .collect();
        for id in ids {
            let Some(mut node) = doc.tree.get_mut(id) else {
                continue;
            };
            let Node::Element(el) = node.value() else {
                continue;
            };
            for (name, value) in el.attrs.iter_mut() {
                let rewritten = match &*name.local {
                    "href" | "onclick" | "src" => self.rewrite_url(value),
                    "srcset" => self.rewrite_srcset(value),
                    _ => continue,
                };
                if rewritten != **value {
                    *value = rewritten.into();
                }
            }
        }
    }

    /// Apply the response header policy: rewrite `Location`, drop the
    /// stripped and hop-by-hop headers.
    pub fn rewrite_headers(&self, headers: &mut HeaderMap) {
        if let Some(location) = headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| self.rewrite_url(v))
        {
            if let Ok(value) = HeaderValue::from_str(&location) {
                headers.insert(header::LOCATION, value);
            }
        }
        for name in STRIPPED_HEADERS {
            headers.remove(name);
        }
    }

    /// Rewrite a complete upstream response: headers, then the body by
    /// content type. `Content-Length` is set to the new body's length.
    pub fn rewrite_response(&self, headers: &mut HeaderMap, body: Bytes) -> MirrorResult<Bytes> {
        self.rewrite_headers(headers);

        let is_html = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"));

        let body = if is_html {
            let html = std::str::from_utf8(&body)
                .map_err(|e| MirrorError::Rewrite(format!("upstream HTML is not UTF-8: {e}")))?;
            let mut ctx = RewriteContext::default();
            Bytes::from(self.rewrite_html(html, &mut ctx))
        } else {
            replace_all(body, self.ajax_endpoint.as_bytes(), AJAX_SEARCH_PATH.as_bytes())
        };

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        Ok(body)
    }
}

/// Path, query and fragment of an absolute URL.
fn request_uri(url: &Url) -> String {
    let mut out = url.path().to_string();
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

fn replace_all(body: Bytes, needle: &[u8], replacement: &[u8]) -> Bytes {
    if needle.is_empty() || !body.windows(needle.len()).any(|w| w == needle) {
        return body;
    }
    let mut out = Vec::with_capacity(body.len());
    let mut rest = &body[..];
    while let Some(pos) = rest.windows(needle.len()).position(|w| w == needle) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(replacement);
        rest = &rest[pos + needle.len()..];
    }
    out.extend_from_slice(rest);
    Bytes::from(out)
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("selector is valid")
}

/// Replace the first site-name occurrence in the page title.
fn replace_title(doc: &mut Html, ctx: &mut RewriteContext) {
    if ctx.title_replaced {
        return;
    }
    let Some(title_id) = doc.select(&selector("title")).next().map(|t| t.id()) else {
        return;
    };
    let Some(title) = doc.tree.get(title_id) else {
        return;
    };
    let text_ids: Vec<_> = title
        .children()
        .filter(|c| c.value().is_text())
        .map(|c| c.id())
        .collect();
    let full: String = title
        .children()
        .filter_map(|c| c.value().as_text())
        .map(|t| &*t.text)
        .collect();
    if !full.contains(SITE_NAME) {
        return;
    }
    let replaced = full.replacen(SITE_NAME, TITLE_REPLACEMENT, 1);

    let mut text_ids = text_ids.into_iter();
    if let Some(mut node) = text_ids.next().and_then(|id| doc.tree.get_mut(id)) {
        if let Node::Text(text) = node.value() {
            text.text = replaced.into();
        }
    }
    for rest in text_ids {
        if let Some(mut node) = doc.tree.get_mut(rest) {
            node.detach();
        }
    }
    ctx.title_replaced = true;
}
