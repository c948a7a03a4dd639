//! One chat session: owns the conversation and drives a single request at a time.
//!
//! A turn goes `Idle -> Sending -> Streaming -> Idle`. The reply body is pulled chunk by
//! chunk, decoded, applied to the conversation, persisted and handed to the renderer
//! after every batch. A [`ResetHandle`] can cancel a turn from another task; the turn then
//! clears the conversation instead of finishing.

use crate::backend::{Backend, ChatRequest, ChunkStream, RequestOptions, TransportError};
use crate::conversation::{ChatMessage, Conversation};
use crate::store::ConversationStore;
use crate::stream::{ConversationAssembler, ProtocolEvent, StreamDecoder};
use anyhow::Context;
use std::sync::{Arc, Mutex};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
}

/// How a completed reply ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Sentinel,
    EndOfTransport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed(Termination),
    /// The turn was cancelled by a reset and the conversation cleared.
    Reset,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("message is empty")]
    EmptyMessage,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("response contained no readable records ({malformed} malformed)")]
    Unreadable { malformed: usize },
}

/// Cancels whatever turn is in flight on the session it came from.
#[derive(Debug, Clone, Default)]
pub struct ResetHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl ResetHandle {
    /// Safe to call repeatedly and when nothing is streaming.
    pub fn reset(&self) {
        self.lock().cancel();
    }

    /// Token for a new turn. A token left cancelled by an earlier reset is replaced.
    fn arm(&self) -> CancellationToken {
        let mut token = self.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Session {
    conversation: Conversation,
    state: TurnState,
    backend: Box<dyn Backend + Send + Sync>,
    store: Box<dyn ConversationStore>,
    assembler: ConversationAssembler,
    options: RequestOptions,
    reset: ResetHandle,
}

impl Session {
    /// Build a session, restoring whatever conversation `store` holds.
    pub fn new(
        backend: Box<dyn Backend + Send + Sync>,
        store: Box<dyn ConversationStore>,
        assembler: ConversationAssembler,
        options: RequestOptions,
    ) -> anyhow::Result<Self> {
        let conversation = store
            .load()
            .with_context(|| format!("failed to load conversation from {} store", store.name()))?;
        tracing::debug!(
            backend = backend.name(),
            store = store.name(),
            messages = conversation.len(),
            "session ready"
        );

        Ok(Self {
            conversation,
            state: TurnState::Idle,
            backend,
            store,
            assembler,
            options,
            reset: ResetHandle::default(),
        })
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    #[cfg(test)]
    pub fn store(&self) -> &dyn ConversationStore {
        self.store.as_ref()
    }

    #[cfg_attr(not(feature = "tui"), allow(dead_code))]
    pub fn reset_handle(&self) -> ResetHandle {
        self.reset.clone()
    }

    /// Drop the conversation, in memory and in the store.
    #[cfg_attr(not(feature = "tui"), allow(dead_code))]
    pub fn reset(&mut self) {
        self.reset.reset();
        self.clear();
    }

    /// Send `text` with the whole history and stream the reply into the conversation.
    ///
    /// `render` sees the conversation after every change.
    pub async fn submit<F>(&mut self, text: &str, mut render: F) -> Result<TurnOutcome, SessionError>
    where
        F: FnMut(&Conversation),
    {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let cancel = self.reset.arm();

        self.conversation.push(ChatMessage::user(text));
        self.persist();
        render(&self.conversation);

        self.state = TurnState::Sending;
        let req = ChatRequest::new(self.conversation.messages().to_vec(), self.options);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = self.backend.open(req) => Some(res),
        };

        let chunks = match opened {
            None => return Ok(self.abort(&mut render)),
            Some(Ok(chunks)) => chunks,
            Some(Err(err)) => {
                self.state = TurnState::Idle;
                tracing::warn!(backend = self.backend.name(), error = %err, "chat request failed");
                return Err(err.into());
            }
        };

        self.state = TurnState::Streaming;
        self.stream_reply(chunks, &cancel, &mut render).await
    }

    async fn stream_reply<F>(
        &mut self,
        mut chunks: ChunkStream,
        cancel: &CancellationToken,
        render: &mut F,
    ) -> Result<TurnOutcome, SessionError>
    where
        F: FnMut(&Conversation),
    {
        let mut decoder = StreamDecoder::new();

        let termination = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = chunks.next() => Some(item),
            };

            let events = match next {
                None => {
                    drop(chunks);
                    return Ok(self.abort(render));
                }
                Some(Some(Ok(bytes))) => {
                    tracing::debug!(len = bytes.len(), "response chunk");
                    decoder.feed(&bytes)
                }
                Some(Some(Err(err))) => {
                    self.state = TurnState::Idle;
                    tracing::warn!(error = %err, "response stream broke off");
                    return Err(err.into());
                }
                Some(None) => {
                    let events = decoder.finish();
                    self.absorb(&events, render);
                    if events.contains(&ProtocolEvent::StreamEnd) {
                        break Termination::Sentinel;
                    }
                    break Termination::EndOfTransport;
                }
            };

            self.absorb(&events, render);
            if decoder.is_finished() {
                break Termination::Sentinel;
            }
        };

        self.state = TurnState::Idle;
        let stats = decoder.stats();
        if stats.payloads == 0 && stats.malformed > 0 {
            return Err(SessionError::Unreadable {
                malformed: stats.malformed,
            });
        }

        tracing::info!(
            ?termination,
            skipped = stats.malformed,
            messages = self.conversation.len(),
            reply_len = self.conversation.last().map_or(0, |m| m.content.len()),
            "reply complete"
        );
        Ok(TurnOutcome::Completed(termination))
    }

    /// Apply one batch of events, then persist and render if anything changed.
    fn absorb<F>(&mut self, events: &[ProtocolEvent], render: &mut F)
    where
        F: FnMut(&Conversation),
    {
        let conversation = std::mem::take(&mut self.conversation);
        self.conversation = self.assembler.apply_all(conversation, events);

        if events.iter().any(|e| *e != ProtocolEvent::StreamEnd) {
            self.persist();
            render(&self.conversation);
        }
    }

    fn abort<F>(&mut self, render: &mut F) -> TurnOutcome
    where
        F: FnMut(&Conversation),
    {
        tracing::info!("turn cancelled by reset");
        self.clear();
        render(&self.conversation);
        TurnOutcome::Reset
    }

    fn clear(&mut self) {
        self.conversation.clear();
        self.state = TurnState::Idle;
        if let Err(e) = self.store.clear() {
            tracing::warn!("failed to clear saved conversation: {e:#}");
        }
    }

    fn persist(&mut self) {
        if let Err(e) = self.store.save(&self.conversation) {
            tracing::warn!("failed to save conversation: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use crate::store::MemoryStore;
    use crate::stream::OrphanDeltaPolicy;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    enum Reply {
        Body(Vec<Vec<u8>>),
        Status(reqwest::StatusCode),
        BrokenAfter(Vec<Vec<u8>>),
        Channel(mpsc::Receiver<Result<Bytes, TransportError>>),
    }

    struct ScriptedBackend {
        replies: Mutex<VecDeque<Reply>>,
        requests: Arc<Mutex<Vec<ChatRequest>>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Arc::default(),
            }
        }
    }

    impl Backend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn open(
            &self,
            req: ChatRequest,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<ChunkStream, TransportError>> + Send>,
        > {
            self.requests.lock().unwrap().push(req);
            let reply = self.replies.lock().unwrap().pop_front().expect("unexpected request");

            Box::pin(async move {
                let ok = |chunks: Vec<Vec<u8>>| {
                    chunks
                        .into_iter()
                        .map(|c| Ok::<_, TransportError>(Bytes::from(c)))
                };
                match reply {
                    Reply::Body(chunks) => Ok(Box::pin(tokio_stream::iter(ok(chunks))) as ChunkStream),
                    Reply::Status(status) => Err(TransportError::Status {
                        status,
                        message: "upstream exploded".to_string(),
                    }),
                    Reply::BrokenAfter(chunks) => {
                        let items = ok(chunks).chain(std::iter::once(Err(TransportError::Stream(
                            "connection reset".to_string(),
                        ))));
                        Ok(Box::pin(tokio_stream::iter(items)) as ChunkStream)
                    }
                    Reply::Channel(rx) => Ok(Box::pin(ReceiverStream::new(rx)) as ChunkStream),
                }
            })
        }
    }

    fn record(delta: serde_json::Value) -> String {
        format!("data: {}\n\n", serde_json::json!({"choices": [{"delta": delta}]}))
    }

    fn reply_body(parts: &[&str]) -> String {
        let mut body = record(serde_json::json!({"role": "assistant"}));
        for p in parts {
            body.push_str(&record(serde_json::json!({"content": p})));
        }
        body
    }

    fn split(body: &str, size: usize) -> Vec<Vec<u8>> {
        body.as_bytes().chunks(size).map(<[u8]>::to_vec).collect()
    }

    fn session_with(backend: ScriptedBackend, store: MemoryStore) -> Session {
        Session::new(
            Box::new(backend),
            Box::new(store),
            ConversationAssembler::default(),
            RequestOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn streams_reply_into_conversation() {
        let body = reply_body(&["Hel", "lo"]) + "data: [DONE]\n\n";
        let backend = ScriptedBackend::new(vec![Reply::Body(split(&body, 5))]);
        let requests = backend.requests.clone();
        let mut session = session_with(backend, MemoryStore::new());

        let mut renders = 0;
        let outcome = session.submit("hi", |_| renders += 1).await.unwrap();

        assert_eq!(outcome, TurnOutcome::Completed(Termination::Sentinel));
        assert_eq!(
            session.conversation().messages(),
            [ChatMessage::user("hi"), ChatMessage::assistant("Hello")]
        );
        assert_eq!(session.state(), TurnState::Idle);
        assert!(renders >= 2);
        assert_eq!(session.store().load().unwrap(), *session.conversation());
        assert_eq!(requests.lock().unwrap()[0].messages, [ChatMessage::user("hi")]);
    }

    #[tokio::test]
    async fn request_carries_full_history() {
        let history = Conversation::from(vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("answer"),
        ]);
        let backend = ScriptedBackend::new(vec![Reply::Body(vec![
            (reply_body(&["ok"]) + "data: [DONE]\n").into_bytes(),
        ])]);
        let requests = backend.requests.clone();
        let mut session = session_with(backend, MemoryStore::with_conversation(history));

        session.submit("second", |_| {}).await.unwrap();

        let sent = &requests.lock().unwrap()[0].messages;
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2], ChatMessage::user("second"));
        assert_eq!(session.conversation().len(), 4);
    }

    #[tokio::test]
    async fn transport_failure_keeps_only_user_message() {
        let backend = ScriptedBackend::new(vec![Reply::Status(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        )]);
        let mut session = session_with(backend, MemoryStore::new());

        let err = session.submit("hi", |_| {}).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::Status { .. })
        ));
        assert_eq!(session.conversation().messages(), [ChatMessage::user("hi")]);
        assert_eq!(session.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn broken_stream_keeps_partial_reply() {
        let backend = ScriptedBackend::new(vec![Reply::BrokenAfter(vec![reply_body(&["par"])
            .into_bytes()])]);
        let mut session = session_with(backend, MemoryStore::new());

        let err = session.submit("hi", |_| {}).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::Stream(_))));
        assert_eq!(session.conversation().last(), Some(&ChatMessage::assistant("par")));
        assert_eq!(session.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn end_of_transport_without_sentinel_completes() {
        let body = reply_body(&["a"]) + r#"data: {"choices":[{"delta":{"content":"b"}}]}"#;
        let backend = ScriptedBackend::new(vec![Reply::Body(split(&body, 11))]);
        let mut session = session_with(backend, MemoryStore::new());

        let outcome = session.submit("hi", |_| {}).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Completed(Termination::EndOfTransport));
        assert_eq!(session.conversation().last(), Some(&ChatMessage::assistant("ab")));
    }

    #[tokio::test]
    async fn unterminated_sentinel_at_end_of_transport_counts_as_sentinel() {
        let body = reply_body(&["done"]) + "data: [DONE]";
        let backend = ScriptedBackend::new(vec![Reply::Body(split(&body, 9))]);
        let mut session = session_with(backend, MemoryStore::new());

        let outcome = session.submit("hi", |_| {}).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Completed(Termination::Sentinel));
        assert_eq!(session.conversation().last(), Some(&ChatMessage::assistant("done")));
    }

    #[tokio::test]
    async fn deltas_without_role_announce_open_assistant_message() {
        let body = record(serde_json::json!({"content": "Hi"})) + "data: [DONE]\n";
        let backend = ScriptedBackend::new(vec![Reply::Body(vec![body.into_bytes()])]);
        let mut session = session_with(backend, MemoryStore::new());

        session.submit("yo", |_| {}).await.unwrap();
        assert_eq!(
            session.conversation().messages(),
            [ChatMessage::user("yo"), ChatMessage::assistant("Hi")]
        );
    }

    #[tokio::test]
    async fn drop_policy_ignores_orphan_deltas() {
        let body = record(serde_json::json!({"content": "Hi"})) + "data: [DONE]\n";
        let backend = ScriptedBackend::new(vec![Reply::Body(vec![body.into_bytes()])]);
        let mut session = Session::new(
            Box::new(backend),
            Box::new(MemoryStore::new()),
            ConversationAssembler::new(OrphanDeltaPolicy::Drop),
            RequestOptions::default(),
        )
        .unwrap();

        session.submit("yo", |_| {}).await.unwrap();
        assert_eq!(session.conversation().messages(), [ChatMessage::user("yo")]);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let body = format!(
            "{}data: {{broken\n{}data: [DONE]\n",
            record(serde_json::json!({"role": "assistant", "content": "a"})),
            record(serde_json::json!({"content": "b"})),
        );
        let backend = ScriptedBackend::new(vec![Reply::Body(vec![body.into_bytes()])]);
        let mut session = session_with(backend, MemoryStore::new());

        session.submit("hi", |_| {}).await.unwrap();
        assert_eq!(session.conversation().last(), Some(&ChatMessage::assistant("ab")));
    }

    #[tokio::test]
    async fn only_malformed_records_is_an_error() {
        let body = "data: {nope\ndata: also nope\ndata: [DONE]\n";
        let backend = ScriptedBackend::new(vec![Reply::Body(vec![body.as_bytes().to_vec()])]);
        let mut session = session_with(backend, MemoryStore::new());

        let err = session.submit("hi", |_| {}).await.unwrap_err();
        assert!(matches!(err, SessionError::Unreadable { malformed: 2 }));
        assert_eq!(session.conversation().messages(), [ChatMessage::user("hi")]);
    }

    #[tokio::test]
    async fn blank_message_is_rejected_without_request() {
        let backend = ScriptedBackend::new(vec![]);
        let requests = backend.requests.clone();
        let mut session = session_with(backend, MemoryStore::new());

        let err = session.submit("  \n", |_| {}).await.unwrap_err();
        assert!(matches!(err, SessionError::EmptyMessage));
        assert!(session.conversation().is_empty());
        assert!(requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_while_idle_clears_memory_and_store() {
        let history = Conversation::from(vec![ChatMessage::user("old")]);
        let mut session = session_with(
            ScriptedBackend::new(vec![]),
            MemoryStore::with_conversation(history),
        );
        assert_eq!(session.conversation().len(), 1);

        session.reset();
        assert!(session.conversation().is_empty());
        assert!(session.store().load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_mid_stream_discards_the_stream() {
        let (tx, rx) = mpsc::channel(8);
        let backend = ScriptedBackend::new(vec![
            Reply::Channel(rx),
            Reply::Body(vec![(reply_body(&["fresh"]) + "data: [DONE]\n").into_bytes()]),
        ]);
        let requests = backend.requests.clone();
        let mut session = session_with(backend, MemoryStore::new());
        let handle = session.reset_handle();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Conversation>();
        let turn = tokio::spawn(async move {
            let outcome = session
                .submit("first", |c| {
                    let _ = seen_tx.send(c.clone());
                })
                .await;
            (session, outcome)
        });

        tx.send(Ok(Bytes::from(reply_body(&["partial"]))))
            .await
            .unwrap();
        loop {
            let conv = seen_rx.recv().await.unwrap();
            if conv.last().map(|m| m.content.as_str()) == Some("partial") {
                break;
            }
        }

        handle.reset();
        handle.reset();
        let _ = tx
            .send(Ok(Bytes::from(record(serde_json::json!({"content": " late"})))))
            .await;

        let (mut session, outcome) = turn.await.unwrap();
        assert_eq!(outcome.unwrap(), TurnOutcome::Reset);
        assert!(session.conversation().is_empty());
        assert!(session.store().load().unwrap().is_empty());
        while let Ok(conv) = seen_rx.try_recv() {
            assert!(conv.messages().iter().all(|m| !m.content.contains("late")));
        }

        let outcome = session.submit("second", |_| {}).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Completed(Termination::Sentinel));
        assert_eq!(
            session.conversation().messages(),
            [ChatMessage::user("second"), ChatMessage::assistant("fresh")]
        );
        assert_eq!(requests.lock().unwrap()[1].messages.len(), 1);
        assert_eq!(session.conversation().messages()[1].role, Role::Assistant);
    }
}
