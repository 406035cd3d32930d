//! # HTTP Transport
//!
//! Range-capable transport over `reqwest`. A resume token records how many
//! bytes were written and the entity validator of the first response; resuming
//! sends `Range: bytes=<written>-` guarded by `If-Range`, so a changed entity
//! comes back as a full `200` body and the coordinator restarts from zero.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, IF_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::transport::{ResumeToken, TransferCheckpoint, TransferResponse, Transport};
use crate::config::TransportConfig;
use crate::error::{CacheError, Result};

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &TransportConfig) -> Result<Client> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    client_builder.build().map_err(CacheError::from)
}

#[derive(Debug, Serialize, Deserialize)]
struct HttpResumeState {
    written: u64,
    validator: Option<String>,
}

/// Transport backed by an HTTP client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn decode_token(token: &ResumeToken) -> Option<HttpResumeState> {
        match serde_json::from_slice(token.as_bytes()) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable resume token");
                None
            }
        }
    }

    fn header_str(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }
}

/// Parse `bytes <start>-<end>/<total>`, returning the start offset and total length
pub(crate) fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = range.split_once('/')?;
    let (start, _end) = span.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, resume), level = "debug")]
    async fn open(&self, url: &Url, resume: Option<&ResumeToken>) -> Result<TransferResponse> {
        let state = resume.and_then(Self::decode_token);

        let mut request = self.client.get(url.clone());
        if let Some(state) = &state {
            info!(url = %url, offset = state.written, "Resuming download");
            request = request.header(RANGE, format!("bytes={}-", state.written));
            if let Some(validator) = &state.validator {
                request = request.header(IF_RANGE, validator.as_str());
            }
        }

        let response = request.send().await?;
        let status = response.status();
        let content_type = Self::header_str(&response, CONTENT_TYPE);
        let validator = Self::header_str(&response, ETAG);
        let accepts_ranges = Self::header_str(&response, ACCEPT_RANGES)
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

        let (start_offset, total_length) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let content_range = Self::header_str(&response, CONTENT_RANGE)
                    .and_then(|v| parse_content_range(&v));
                match content_range {
                    Some((start, total)) => (start, total),
                    None => {
                        warn!(url = %url, "Partial response without a usable Content-Range");
                        return Err(CacheError::Status(status.as_u16()));
                    }
                }
            }
            s if s.is_success() => {
                if state.is_some() {
                    debug!(url = %url, "Server ignored the range request, restarting");
                }
                let length = Self::header_str(&response, CONTENT_LENGTH)
                    .and_then(|v| v.parse::<u64>().ok())
                    .or_else(|| response.content_length());
                (0, length)
            }
            s => {
                warn!(url = %url, status = %s, "Request failed");
                return Err(CacheError::Status(s.as_u16()));
            }
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(CacheError::from))
            .boxed();

        Ok(TransferResponse {
            start_offset,
            total_length,
            content_type,
            validator,
            // A 206 implies range support even without the header
            accepts_ranges: accepts_ranges || status == StatusCode::PARTIAL_CONTENT,
            body,
        })
    }

    fn resume_token(&self, url: &Url, checkpoint: &TransferCheckpoint) -> Option<ResumeToken> {
        if !checkpoint.accepts_ranges || checkpoint.written == 0 {
            debug!(url = %url, "Transfer cannot be resumed");
            return None;
        }
        let state = HttpResumeState {
            written: checkpoint.written,
            validator: checkpoint.validator.clone(),
        };
        serde_json::to_vec(&state).ok().map(ResumeToken::new)
    }
}
