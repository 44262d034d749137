//! HTTP transport: SSE streams and `sources_ref` follow-up fetches over reqwest.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Client;
use std::time::Duration;

use super::sse::decode_stream;
use super::traits::{FrameStream, SourcesResolver, StreamTransport};
use crate::config::ServerConfig;
use crate::events::{parse_sources, Source};

const MAX_API_ERROR_CHARS: usize = 200;

/// Placeholder replaced by the stream or sources reference in path templates.
pub const REF_PLACEHOLDER: &str = "{ref}";

/// Talks to the server that issued the stream references.
pub struct HttpTransport {
    base_url: String,
    stream_path: String,
    sources_path: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        stream_path: &str,
        sources_path: &str,
        api_key: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            stream_path: stream_path.to_string(),
            sources_path: sources_path.to_string(),
            api_key: api_key
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
            client,
        })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Self::new(
            &config.base_url,
            &config.stream_path,
            &config.sources_path,
            config.api_key.as_deref(),
            Duration::from_secs(config.connect_timeout_secs),
        )
    }

    pub fn stream_url(&self, stream_ref: &str) -> String {
        self.url_for(&self.stream_path, stream_ref)
    }

    pub fn sources_url(&self, reference: &str) -> String {
        self.url_for(&self.sources_path, reference)
    }

    fn url_for(&self, template: &str, reference: &str) -> String {
        let path = template.replace(REF_PLACEHOLDER, &encode_path_segment(reference));
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(&self, stream_ref: &str) -> Result<FrameStream> {
        let url = self.stream_url(stream_ref);
        let response = self
            .authorized(self.client.get(&url).header(ACCEPT, "text/event-stream"))
            .send()
            .await
            .with_context(|| format!("failed to connect to {url}"))?;

        if !response.status().is_success() {
            return Err(api_error("stream", response).await);
        }

        Ok(decode_stream(response.bytes_stream()))
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[async_trait]
impl SourcesResolver for HttpTransport {
    async fn resolve(&self, reference: &str) -> Result<Vec<Source>> {
        let url = self.sources_url(reference);
        let response = self
            .authorized(self.client.get(&url).header(ACCEPT, "application/json"))
            .send()
            .await
            .with_context(|| format!("failed to fetch sources from {url}"))?;

        if !response.status().is_success() {
            return Err(api_error("sources", response).await);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .context("sources response is not valid JSON")?;
        parse_sources(body)
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Percent-encode the characters that would change a path's structure.
fn encode_path_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if is_secret_char(c) {
            end = from + i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

/// Scrub bearer-token-like values from server error text.
pub fn scrub_secret_patterns(input: &str) -> String {
    const PREFIXES: [&str; 4] = ["Bearer ", "sk-", "token=", "api_key="];

    let mut scrubbed = input.to_string();

    for prefix in PREFIXES {
        let mut search_from = 0;
        loop {
            let Some(rel) = scrubbed[search_from..].find(prefix) else {
                break;
            };

            let start = search_from + rel;
            let content_start = start + prefix.len();
            let end = token_end(&scrubbed, content_start);

            if end == content_start {
                search_from = content_start;
                continue;
            }

            scrubbed.replace_range(content_start..end, "[REDACTED]");
            search_from = content_start + "[REDACTED]".len();
        }
    }

    scrubbed
}

/// Sanitize server error text by scrubbing secrets and truncating length.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input.trim());

    if scrubbed.chars().count() <= MAX_API_ERROR_CHARS {
        return scrubbed;
    }

    let mut end = MAX_API_ERROR_CHARS;
    while end > 0 && !scrubbed.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &scrubbed[..end])
}

/// Build a sanitized error from a failed HTTP response.
pub async fn api_error(what: &str, response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());
    let sanitized = sanitize_api_error(&body);
    if sanitized.is_empty() {
        anyhow::anyhow!("{what} request failed ({status})")
    } else {
        anyhow::anyhow!("{what} request failed ({status}): {sanitized}")
    }
}
