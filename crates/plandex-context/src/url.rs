use anyhow::{Context as _, Result, anyhow};
use reqwest::blocking::Client;
use scraper::Html;
use std::time::Duration;

const MAX_URL_NAME_CHARS: usize = 40;
const URL_NAME_EDGE_CHARS: usize = 20;

/// Source of url bodies. The HTTP implementation is swapped out in tests.
pub trait UrlFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build url fetch client")?;
        Ok(Self { client })
    }
}

impl UrlFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to fetch {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("failed to fetch {url}: HTTP {status}"));
        }
        let is_html = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/html"));
        let body = resp
            .text()
            .with_context(|| format!("failed to read body of {url}"))?;
        if is_html || looks_like_html(&body) {
            Ok(html_to_text(&body))
        } else {
            Ok(body)
        }
    }
}

pub fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

fn looks_like_html(body: &str) -> bool {
    let lower: String = body
        .trim_start()
        .chars()
        .take(64)
        .collect::<String>()
        .to_ascii_lowercase();
    lower.starts_with("<!doctype html") || lower.starts_with("<html")
}

/// Visible text of an HTML document, one block per line. Script, style and
/// head content is dropped.
pub fn html_to_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut lines = Vec::new();
    for node in doc.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|el| matches!(el.name(), "script" | "style" | "noscript" | "head"))
        });
        if hidden {
            continue;
        }
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }
    lines.join("\n")
}

/// Short display name for a url: scheme and trailing slash removed, long
/// names keep their first and last 20 characters.
pub fn url_name(url: &str) -> String {
    let trimmed = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= MAX_URL_NAME_CHARS {
        return trimmed.to_string();
    }
    let head: String = chars[..URL_NAME_EDGE_CHARS].iter().collect();
    let tail: String = chars[chars.len() - URL_NAME_EDGE_CHARS..].iter().collect();
    format!("{head}⋯{tail}")
}
