//! Rendered search page adapter
//!
//! For directories without a usable structured endpoint. A session is warmed
//! up by visiting the home page once, then each record issues one search page
//! load and collects the links whose URL matches the listing pattern.
//!
//! Page loading sits behind [`PageRenderer`] so a real browser driver can be
//! swapped in; [`HttpPageRenderer`] is a cookie-keeping HTTP client that reads
//! anchors out of the returned markup.

use super::SourceAdapter;
use crate::error::{classify_status, ResolveError, ResolveResult};
use crate::throttle::RequestGate;
use crate::types::{ListingLink, RawCandidate, SourceRecord};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Client;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use url::Url;

/// Links kept per search page
pub const MAX_LINK_CANDIDATES: usize = 10;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Anchor as seen on a loaded page
#[derive(Debug, Clone, PartialEq)]
pub struct PageLink {
    pub href: String,
    pub text: String,
}

/// Result of loading one page
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPage {
    pub status: u16,
    /// URL after redirects; relative hrefs resolve against it
    pub final_url: String,
    pub links: Vec<PageLink>,
}

/// Loads pages inside a session that keeps cookies between calls
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn open(&self, url: &str) -> ResolveResult<RenderedPage>;

    /// Discard session state (cookies) before the next warm-up
    fn reset(&self) {}
}

/// HTTP session renderer with browser-like headers
pub struct HttpPageRenderer {
    label: String,
    timeout: Duration,
    client: Mutex<Client>,
}

impl HttpPageRenderer {
    pub fn new(label: impl Into<String>, timeout: Duration) -> ResolveResult<Self> {
        let client = Self::build_client(timeout)?;
        Ok(Self {
            label: label.into(),
            timeout,
            client: Mutex::new(client),
        })
    }

    fn build_client(timeout: Duration) -> ResolveResult<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        Client::builder()
            .cookie_store(true)
            .user_agent(BROWSER_USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ResolveError::Unexpected(format!("Failed to build HTTP client: {}", e)))
    }

    fn client(&self) -> Client {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl PageRenderer for HttpPageRenderer {
    async fn open(&self, url: &str) -> ResolveResult<RenderedPage> {
        let response = self
            .client()
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::network(&self.label, e))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| ResolveError::network(&self.label, e))?;

        Ok(RenderedPage {
            status,
            final_url,
            links: extract_links(&body),
        })
    }

    fn reset(&self) {
        match Self::build_client(self.timeout) {
            Ok(fresh) => {
                *self.client.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
            }
            Err(e) => tracing::warn!(renderer = %self.label, error = %e, "Session reset failed"),
        }
    }
}

fn anchor_regex() -> &'static Regex {
    static ANCHOR: OnceLock<Regex> = OnceLock::new();
    ANCHOR.get_or_init(|| {
        Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#)
            .expect("anchor pattern is valid")
    })
}

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern is valid"))
}

fn decode_entities(text: &str) -> String {
    // `&amp;` last, so an escaped entity decodes exactly once
    text.replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Anchors in document order with their visible text
pub fn extract_links(html: &str) -> Vec<PageLink> {
    anchor_regex()
        .captures_iter(html)
        .map(|caps| {
            let inner = tag_regex().replace_all(&caps[2], " ");
            let text = decode_entities(&inner)
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            PageLink {
                href: decode_entities(&caps[1]),
                text,
            }
        })
        .collect()
}

/// Construction parameters, resolved from configuration
#[derive(Debug, Clone)]
pub struct RenderedPageSettings {
    pub home_url: String,
    /// Contains `{query}` and/or `{location}`
    pub search_url: String,
    /// Capture group 1 is the listing id
    pub link_pattern: Regex,
    pub settle: Duration,
}

/// Search-page adapter over a [`PageRenderer`]
pub struct RenderedPageAdapter {
    name: String,
    renderer: Arc<dyn PageRenderer>,
    settings: RenderedPageSettings,
    gate: RequestGate,
    warmed_up: AtomicBool,
}

impl RenderedPageAdapter {
    pub fn new(
        name: impl Into<String>,
        renderer: Arc<dyn PageRenderer>,
        settings: RenderedPageSettings,
        gate: RequestGate,
    ) -> Self {
        Self {
            name: name.into(),
            renderer,
            settings,
            gate,
            warmed_up: AtomicBool::new(false),
        }
    }

    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }

    fn search_url(&self, target: &SourceRecord) -> String {
        let encode = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
        self.settings
            .search_url
            .replace("{query}", &encode(&target.name))
            .replace("{location}", &encode(&format!("{}, {}", target.city, target.state)))
    }

    async fn settle(&self) {
        if !self.settings.settle.is_zero() {
            tokio::time::sleep(self.settings.settle).await;
        }
    }

    /// Load a page and map its status into the taxonomy
    async fn load(&self, url: &str) -> ResolveResult<RenderedPage> {
        let page = self.renderer.open(url).await?;
        if let Some(err) = classify_status(&self.name, page.status, "") {
            return Err(err);
        }
        Ok(page)
    }

    async fn warm_up(&self) -> ResolveResult<()> {
        if self.warmed_up.load(Ordering::SeqCst) {
            return Ok(());
        }

        tracing::debug!(adapter = %self.name, url = %self.settings.home_url, "Warming up session");
        self.gate.execute(|| self.load(&self.settings.home_url)).await?;
        self.settle().await;
        self.warmed_up.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Listing links on `page`, deduplicated by id, absolute and query-free
    pub fn candidates_from(&self, page: &RenderedPage) -> Vec<RawCandidate> {
        let base = Url::parse(&page.final_url).ok();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for link in &page.links {
            if link.text.is_empty() {
                continue;
            }

            let absolute = match &base {
                Some(base) => base.join(&link.href).ok(),
                None => Url::parse(&link.href).ok(),
            };
            let Some(mut absolute) = absolute else {
                continue;
            };
            absolute.set_query(None);
            absolute.set_fragment(None);

            let Some(id) = self
                .settings
                .link_pattern
                .captures(absolute.path())
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
            else {
                continue;
            };

            if !seen.insert(id.clone()) {
                continue;
            }

            out.push(RawCandidate::Link(ListingLink {
                id,
                name: link.text.clone(),
                url: absolute.to_string(),
            }));

            if out.len() >= MAX_LINK_CANDIDATES {
                break;
            }
        }

        out
    }
}

#[async_trait]
impl SourceAdapter for RenderedPageAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, target: &SourceRecord) -> ResolveResult<Vec<RawCandidate>> {
        self.warm_up().await?;

        let url = self.search_url(target);
        tracing::debug!(record_id = %target.id, adapter = %self.name, url = %url, "Loading search page");

        let page = match self.gate.execute(|| self.load(&url)).await {
            Ok(page) => page,
            Err(e @ ResolveError::PermanentBlock { .. }) => {
                // Session is likely flagged; start a fresh one next record
                self.warmed_up.store(false, Ordering::SeqCst);
                self.renderer.reset();
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.settle().await;

        Ok(self.candidates_from(&page))
    }
}
