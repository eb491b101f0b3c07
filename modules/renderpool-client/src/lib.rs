pub mod error;

pub use error::{RenderError, Result};

use std::time::Duration;

use serde::Deserialize;

/// A page rendered by the pool. The pool reports the document title it saw
/// after scripts ran; `None` means the page never set one.
#[derive(Debug, Clone, Deserialize)]
pub struct RenderedPage {
    pub html: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Client for a headless-render pool. Listing pages are JS-heavy, so the
/// pool loads them in a real browser and hands back the settled DOM.
pub struct RenderClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl RenderClient {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            timeout,
        }
    }

    /// Render a URL through the pool's /render endpoint.
    ///
    /// A timeout surfaces as `RenderError::Timeout` so the caller can tell
    /// "pool is slow or down" apart from "pool looked at the page and gave
    /// up", which is reported as `Rejected`.
    pub async fn render(&self, url: &str) -> Result<RenderedPage> {
        let mut request = self
            .client
            .post(format!("{}/render", self.base_url))
            .json(&serde_json::json!({
                "url": url,
                "timeout_ms": self.timeout.as_millis() as u64,
            }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RenderError::Timeout(self.timeout)
            } else {
                RenderError::Transport(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RenderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<RenderedPage>()
            .await
            .map_err(RenderError::Transport)
    }
}
