pub mod http;
pub mod stub;

use crate::conversation::ChatMessage;
use bytes::Bytes;
use futures_core::stream::BoxStream;
use serde::Serialize;

/// Raw response body pieces, in arrival order.
pub type ChunkStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Body POSTed to the chat backend.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Optional sampling knobs forwarded with every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, opts: RequestOptions) -> Self {
        Self {
            messages,
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to send request: {0}")]
    Request(#[source] reqwest::Error),

    #[error("backend returned HTTP {status}: {message}")]
    Status {
        status: reqwest::StatusCode,
        message: String,
    },

    #[error("response stream failed: {0}")]
    Stream(String),
}

/// Backend interface: send the whole conversation, get the reply body as a byte stream.
pub trait Backend {
    fn name(&self) -> &'static str;

    fn open(
        &self,
        req: ChatRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ChunkStream, TransportError>> + Send>>;
}
