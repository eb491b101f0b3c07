use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{info, warn};

use lotledger_common::{FetchMethod, ListingDocument};
use renderpool_client::RenderClient;

use crate::traits::PageFetcher;

/// Two-tier page fetcher: render pool first (listing pages are JS-heavy),
/// raw HTTP GET as fallback. Each tier is bounded by the configured timeout.
/// Total: every failure path degrades to `Ok(None)` so the caller can still
/// run identity/merge logic against prior data.
pub struct TieredFetcher {
    render: RenderClient,
    http: reqwest::Client,
}

impl TieredFetcher {
    pub fn new(render_base_url: &str, render_token: Option<&str>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("LotLedgerBot/1.0")
            .build()
            .expect("Failed to build HTTP client");

        Self {
            render: RenderClient::new(render_base_url, render_token, timeout),
            http,
        }
    }

    async fn fetch_raw(&self, url: &str) -> Result<String> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {status} for {url}");
        }
        Ok(resp.text().await?)
    }
}

#[async_trait]
impl PageFetcher for TieredFetcher {
    async fn fetch(&self, url: &str) -> Result<Option<ListingDocument>> {
        match self.render.render(url).await {
            Ok(page) if !page.html.trim().is_empty() => {
                info!(url, fetcher = "render_pool", bytes = page.html.len(), "Fetched listing page");
                let title = page.title.or_else(|| page_title(&page.html));
                return Ok(Some(ListingDocument {
                    url: url.to_string(),
                    html: page.html,
                    title,
                    fetch_method: FetchMethod::Rendered,
                }));
            }
            Ok(_) => warn!(url, fetcher = "render_pool", "Render pool returned empty HTML"),
            Err(e) if e.is_retryable() => {
                warn!(url, fetcher = "render_pool", error = %e, "Render pool unreachable, falling back to raw HTTP")
            }
            Err(e) => {
                warn!(url, fetcher = "render_pool", error = %e, "Render pool rejected the page, falling back to raw HTTP")
            }
        }

        match self.fetch_raw(url).await {
            Ok(html) if !html.trim().is_empty() => {
                info!(url, fetcher = "raw_http", bytes = html.len(), "Fetched listing page");
                let title = page_title(&html);
                Ok(Some(ListingDocument {
                    url: url.to_string(),
                    html,
                    title,
                    fetch_method: FetchMethod::RawHttp,
                }))
            }
            Ok(_) => {
                warn!(url, fetcher = "raw_http", "Raw fetch returned empty body");
                Ok(None)
            }
            Err(e) => {
                warn!(url, fetcher = "raw_http", error = %e, "All fetch tiers failed");
                Ok(None)
            }
        }
    }

    fn name(&self) -> &str {
        "tiered"
    }
}

/// Document title of a raw HTML page; entity decoding comes with the parse.
fn page_title(html: &str) -> Option<String> {
    let parsed = Html::parse_document(html);
    let selector = Selector::parse("title").expect("static selector");
    let element = parsed.select(&selector).next()?;
    let title = element.text().collect::<String>().trim().to_string();
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_extracted_and_decoded() {
        let html = "<html><head><title>1972 BMW 2002tii &amp; Parts</title></head></html>";
        assert_eq!(page_title(html), Some("1972 BMW 2002tii & Parts".to_string()));
    }

    #[test]
    fn title_tag_with_attributes_is_parsed() {
        let html = r#"<html><head><title id="page-title">Sold: 1990 Mazda MX-5</title></head></html>"#;
        assert_eq!(page_title(html), Some("Sold: 1990 Mazda MX-5".to_string()));
    }

    #[test]
    fn missing_title_is_none() {
        assert_eq!(page_title("<html><body>no title</body></html>"), None);
    }
}
