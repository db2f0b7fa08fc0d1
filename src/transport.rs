//! Stream connectors and the run API client.
//!
//! A [`StreamConnector`] opens the one-shot live stream for a test and hands
//! back raw message payloads. The monitor never retries: if the stream drops,
//! the host's own refetch of persisted results is the fallback of record.

use std::fmt;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use url::Url;

use crate::error::{Error, Result};
use crate::sse;

/// Raw message payloads from a live stream. An `Err` item is a transport
/// failure; end of stream is `None`.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens a live progress stream for a test.
#[async_trait::async_trait]
pub trait StreamConnector: Send + Sync + fmt::Debug {
    /// Connect to the live stream of `test_id`.
    async fn connect(&self, test_id: &str) -> Result<MessageStream>;
}

/// Connector for the backend's `GET /api/tests/{id}/live` event stream.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpConnector {
    /// Create a connector against `base_url` (e.g. `http://localhost:8000`).
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        Self::with_client(base_url, reqwest::Client::new())
    }

    /// Create a connector with a custom reqwest client.
    pub fn with_client(base_url: impl AsRef<str>, http: reqwest::Client) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self { base_url, http })
    }

    /// URL of the live stream for `test_id`.
    pub fn stream_url(&self, test_id: &str) -> Result<Url> {
        run_endpoint(&self.base_url, test_id, "live")
    }
}

#[async_trait::async_trait]
impl StreamConnector for HttpConnector {
    async fn connect(&self, test_id: &str) -> Result<MessageStream> {
        let url = self.stream_url(test_id)?;
        tracing::debug!(%url, "Opening live stream");

        let response = self
            .http
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        let response = error_for_status(response).await?;

        let frames = sse::decode_frames(response.bytes_stream())
            .map(|frame| frame.map(|f| f.data));
        Ok(Box::pin(frames))
    }
}

/// Client for the run-control endpoints the monitor's host uses.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self {
            base_url,
            http: reqwest::Client::new(),
        })
    }

    /// Ask the backend to start a run of `test_id`.
    ///
    /// The run is created asynchronously on the backend; its live stream may
    /// not exist yet when this returns.
    pub async fn start_run(&self, test_id: &str) -> Result<serde_json::Value> {
        let url = run_endpoint(&self.base_url, test_id, "run")?;
        let response = self.http.post(url).send().await?;
        let body = error_for_status(response).await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// `{base}/api/tests/{test_id}/{leaf}`, keeping any path prefix of `base`.
/// The id is percent-encoded as a single segment.
fn run_endpoint(base: &Url, test_id: &str, leaf: &str) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| Error::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .pop_if_empty()
        .extend(["api", "tests", test_id, leaf]);
    Ok(url)
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".into());
    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}
