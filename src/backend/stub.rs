use super::{Backend, ChatRequest, ChunkStream, TransportError};
use crate::conversation::Role;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Offline backend: streams back a canned reply in deliberately awkward chunk sizes so the
/// decoder sees split records and split characters.
#[derive(Debug, Clone)]
pub struct StubBackend {
    chunk_size: usize,
    delay: std::time::Duration,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self {
            chunk_size: 7,
            delay: std::time::Duration::from_millis(15),
        }
    }
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn open(
        &self,
        req: ChatRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ChunkStream, TransportError>> + Send>>
    {
        let this = self.clone();

        Box::pin(async move {
            let body = render_reply(&req);
            let (tx, rx) = mpsc::channel::<Result<Bytes, TransportError>>(32);

            tokio::spawn(async move {
                for piece in body.as_bytes().chunks(this.chunk_size.max(1)) {
                    tokio::time::sleep(this.delay).await;
                    if tx.send(Ok(Bytes::copy_from_slice(piece))).await.is_err() {
                        break;
                    }
                }
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as ChunkStream)
        })
    }
}

/// The whole response body the stub streams for `req`.
fn render_reply(req: &ChatRequest) -> String {
    let last_user = req
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("");

    let reply = format!(
        "[stub backend] {} message(s) received.\n\nYou said: {last_user}",
        req.messages.len()
    );

    let mut out = String::new();
    push_record(&mut out, serde_json::json!({"role": "assistant", "content": ""}));
    for word in reply.split_inclusive(' ') {
        push_record(&mut out, serde_json::json!({"content": word}));
    }
    out.push_str("data: [DONE]\n\n");
    out
}

fn push_record(out: &mut String, delta: serde_json::Value) {
    let record = serde_json::json!({"choices": [{"index": 0, "delta": delta}]});
    out.push_str("data: ");
    out.push_str(&record.to_string());
    out.push_str("\n\n");
}
