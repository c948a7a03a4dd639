use super::{Backend, ChatRequest, ChunkStream, TransportError};
use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde::Deserialize;
use tokio_stream::StreamExt;

/// Talks to the chat proxy over HTTP: one POST per turn, reply streamed back as the body.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpBackend {
    pub fn new(http: reqwest::Client, endpoint: &str) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid backend endpoint: {endpoint}"))?;
        Ok(Self { http, endpoint })
    }

    fn headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        h
    }
}

impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn open(
        &self,
        req: ChatRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ChunkStream, TransportError>> + Send>>
    {
        let this = self.clone();

        Box::pin(async move {
            tracing::debug!(endpoint = %this.endpoint, messages = req.messages.len(), "sending chat request");

            let resp = this
                .http
                .post(this.endpoint.clone())
                .headers(Self::headers())
                .json(&req)
                .send()
                .await
                .map_err(TransportError::Request)?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(TransportError::Status {
                    status,
                    message: error_message(&text),
                });
            }

            let chunks = resp
                .bytes_stream()
                .map(|item| item.map_err(|e| TransportError::Stream(e.to_string())));
            Ok(Box::pin(chunks) as ChunkStream)
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorField,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorField {
    Text(String),
    Detailed { message: String },
}

/// Pull a readable message out of an error response body.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: ErrorField::Text(m),
        })
        | Ok(ErrorBody {
            error: ErrorField::Detailed { message: m },
        }) => m,
        Err(_) => body.trim().to_string(),
    }
}
