//! Resolve workshop titles and collection manifests from upstream pages.
//!
//! The `MetadataResolver` trait is what the pipeline depends on;
//! `WorkshopScraper` implements it by fetching the item's details page and
//! reading the title and collection listing with CSS selectors.

use crate::acquisition::ContentIdentifier;
use crate::error::{MirrorError, MirrorResult};
use async_trait::async_trait;
use dashmap::DashMap;
use scraper::{Html, Selector};
use std::time::{Duration, Instant};
use url::Url;

/// How long a resolved title or manifest is reused.
const MEMO_TTL: Duration = Duration::from_secs(60);

/// Upstream request timeout for details pages.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One item listed in a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionChild {
    pub id: ContentIdentifier,
    pub title: String,
}

/// A collection's title and its children in page order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionManifest {
    pub title: String,
    pub children: Vec<CollectionChild>,
}

/// Looks up display metadata for workshop content.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// Title of a single workshop item.
    async fn item_title(&self, item_id: u64) -> MirrorResult<String>;

    /// Title and children of a collection. Children inherit `app_id`.
    async fn collection(&self, app_id: u64, collection_id: u64)
        -> MirrorResult<CollectionManifest>;
}

/// Extract the item title: trimmed text of the first `div.workshopItemTitle`.
pub fn parse_item_title(html: &str) -> Option<String> {
    page_title(&Html::parse_document(html))
}

fn page_title(document: &Html) -> Option<String> {
    let sel = Selector::parse("div.workshopItemTitle").ok()?;
    let title = document
        .select(&sel)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    (!title.is_empty()).then_some(title)
}

/// Extract a collection's title and `(item id, title)` pairs in page order.
///
/// Children whose link carries no numeric `id` query parameter are skipped.
pub fn parse_collection(html: &str) -> (String, Vec<(u64, String)>) {
    let document = Html::parse_document(html);
    let title = page_title(&document).unwrap_or_default();

    let (Ok(item_sel), Ok(title_sel), Ok(link_sel)) = (
        Selector::parse("div.collectionItem"),
        Selector::parse("div.collectionItemTitle"),
        Selector::parse("a[href]"),
    ) else {
        return (title, Vec::new());
    };

    let mut children = Vec::new();
    for item in document.select(&item_sel) {
        let Some(href) = item
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            continue;
        };
        let Some(id) = id_from_href(href) else {
            continue;
        };
        let child_title = item
            .select(&title_sel)
            .next()
            .map(|t| t.text().collect::<String>())
            .unwrap_or_default();
        children.push((id, child_title.trim().to_string()));
    }
    (title, children)
}

/// `id` query parameter of a details link, absolute or relative.
fn id_from_href(href: &str) -> Option<u64> {
    let base = Url::parse("https://steamcommunity.com/").ok()?;
    let url = base.join(href).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "id")
        .and_then(|(_, v)| v.parse().ok())
}

/// Memoized values with an expiry.
struct Memo<K, V> {
    entries: DashMap<K, (Instant, V)>,
    ttl: Duration,
}

impl<K: std::hash::Hash + Eq, V: Clone> Memo<K, V> {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let fresh = self.entries.get(key).and_then(|entry| {
            let (stored_at, value) = entry.value();
            (stored_at.elapsed() < self.ttl).then(|| value.clone())
        });
        if fresh.is_none() {
            self.entries
                .remove_if(key, |_, (stored_at, _)| stored_at.elapsed() >= self.ttl);
        }
        fresh
    }

    /// Store `value`, dropping every expired entry first.
    fn insert(&self, key: K, value: V) {
        self.entries
            .retain(|_, (stored_at, _)| stored_at.elapsed() < self.ttl);
        self.entries.insert(key, (Instant::now(), value));
    }
}

/// Resolves metadata by scraping `<origin>/sharedfiles/filedetails/?id=<id>`.
pub struct WorkshopScraper {
    client: reqwest::Client,
    origin: Url,
    titles: Memo<u64, String>,
    manifests: Memo<(u64, u64), CollectionManifest>,
}

impl WorkshopScraper {
    pub fn new(origin: Url) -> MirrorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("workshop-mirror/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            origin,
            titles: Memo::new(MEMO_TTL),
            manifests: Memo::new(MEMO_TTL),
        })
    }

    fn details_url(&self, id: u64) -> MirrorResult<Url> {
        let mut url = self
            .origin
            .join("/sharedfiles/filedetails/")
            .map_err(|e| MirrorError::resolution(format!("workshop item {id}"), e))?;
        url.set_query(Some(&format!("id={id}")));
        Ok(url)
    }

    async fn fetch_details(&self, id: u64, subject: &str) -> MirrorResult<String> {
        let url = self.details_url(id)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MirrorError::resolution(subject, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MirrorError::resolution(
                subject,
                format!("upstream returned status {status}"),
            ));
        }
        resp.text()
            .await
            .map_err(|e| MirrorError::resolution(subject, e))
    }
}

#[async_trait]
impl MetadataResolver for WorkshopScraper {
    async fn item_title(&self, item_id: u64) -> MirrorResult<String> {
        if let Some(title) = self.titles.get(&item_id) {
            return Ok(title);
        }
        let subject = format!("workshop item {item_id}");
        let body = self.fetch_details(item_id, &subject).await?;
        let title = parse_item_title(&body)
            .ok_or_else(|| MirrorError::resolution(&subject, "page has no item title"))?;
        self.titles.insert(item_id, title.clone());
        Ok(title)
    }

    async fn collection(
        &self,
        app_id: u64,
        collection_id: u64,
    ) -> MirrorResult<CollectionManifest> {
        if let Some(manifest) = self.manifests.get(&(app_id, collection_id)) {
            return Ok(manifest);
        }
        let subject = format!("collection {collection_id}");
        let body = self.fetch_details(collection_id, &subject).await?;
        let (title, children) = parse_collection(&body);
        let manifest = CollectionManifest {
            title,
            children: children
                .into_iter()
                .map(|(item_id, title)| CollectionChild {
                    id: ContentIdentifier::new(app_id, item_id),
                    title,
                })
                .collect(),
        };
        self.manifests
            .insert((app_id, collection_id), manifest.clone());
        Ok(manifest)
    }
}
