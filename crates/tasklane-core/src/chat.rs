use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use tasklane_shared::{ChatRequest, ConversationDto, MessageDto, MessageRole, ToolCallDto};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ApiClient, message_id_text};
use crate::error::ApiError;
use crate::storage::CONVERSATION_KEY;

pub const ERROR_PLACEHOLDER: &str =
    "Sorry, I encountered an error processing your request. Please try again.";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("still waiting for the previous reply")]
    Busy,

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Message,
    ToolInvocation,
    ErrorPlaceholder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub id: String,
    pub role: MessageRole,
    pub kind: EntryKind,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl TranscriptEntry {
    fn from_message(message: &MessageDto) -> Self {
        Self {
            id: format!("{}-{}", message_id_text(&message.id), message.timestamp),
            role: message.role,
            kind: EntryKind::Message,
            content: message.content.clone(),
            timestamp: parse_timestamp(&message.timestamp),
        }
    }

    fn local(role: MessageRole, kind: EntryKind, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            kind,
            content,
            timestamp: Some(Utc::now()),
        }
    }

    fn tool_call(call: &ToolCallDto) -> Self {
        Self::local(
            MessageRole::Assistant,
            EntryKind::ToolInvocation,
            format!(
                "Tool call: {} with arguments {} resulted in {}",
                call.name, call.arguments, call.result
            ),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub conversations: Vec<ConversationDto>,
    pub selected: Option<i64>,
    pub transcript: Vec<TranscriptEntry>,
    pub is_sending: bool,
    pub is_loading_history: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct ChatState {
    view: ChatSnapshot,
    history_generation: u64,
    closed: bool,
}

/// Conversation list, selection and transcript for one user.
#[derive(Debug, Clone)]
pub struct ChatModel {
    api: ApiClient,
    user_id: Uuid,
    cancel: CancellationToken,
    state: Arc<Mutex<ChatState>>,
}

impl ChatModel {
    pub fn new(api: &ApiClient, user_id: Uuid) -> Self {
        let cancel = CancellationToken::new();
        Self {
            api: api.scoped(cancel.clone()),
            user_id,
            cancel,
            state: Arc::new(Mutex::new(ChatState::default())),
        }
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.state.lock().view.clone()
    }

    /// Restores the stored selection, loads the conversation list and the
    /// selected conversation's history.
    #[tracing::instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn mount(&self) {
        self.restore_selection();
        self.load_conversations().await;

        let (selected, list_error) = {
            let state = self.state.lock();
            (state.view.selected, state.view.error.clone())
        };
        if let Some(conversation_id) = selected {
            self.load_history(conversation_id).await;
            let mut state = self.state.lock();
            if !state.closed && state.view.error.is_none() {
                state.view.error = list_error;
            }
        }
    }

    /// Reads the persisted selection back into the model.
    pub fn restore_selection(&self) -> Option<i64> {
        let restored = self
            .api
            .storage()
            .get(CONVERSATION_KEY)
            .and_then(|raw| raw.trim().parse::<i64>().ok());
        debug!(?restored, "restoring conversation selection");
        self.state.lock().view.selected = restored;
        restored
    }

    /// Reloads the list. With nothing selected the most recently active
    /// conversation becomes the selection.
    pub async fn load_conversations(&self) {
        self.state.lock().view.error = None;
        let outcome = self.api.list_conversations(self.user_id).await;

        let auto_selected = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            match outcome {
                Ok(conversations) => {
                    let pick = match state.view.selected {
                        Some(_) => None,
                        None => most_recent(&conversations),
                    };
                    state.view.conversations = conversations;
                    if pick.is_some() {
                        state.view.selected = pick;
                    }
                    pick
                }
                Err(err) if err.is_cancelled() => None,
                Err(err) => {
                    warn!(error = %err, "failed to load conversations");
                    state.view.error = Some(format!("Failed to load conversations: {}", err.message()));
                    None
                }
            }
        };

        if let Some(conversation_id) = auto_selected {
            info!(conversation_id, "auto-selected most recent conversation");
            self.persist_selection(Some(conversation_id));
        }
    }

    pub async fn select(&self, conversation_id: i64) {
        self.state.lock().view.selected = Some(conversation_id);
        self.persist_selection(Some(conversation_id));
        self.load_history(conversation_id).await;
    }

    /// Replaces the transcript with the conversation's messages. A reply
    /// for a selection that has since changed is dropped.
    #[tracing::instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn load_history(&self, conversation_id: i64) {
        let generation = {
            let mut state = self.state.lock();
            state.history_generation += 1;
            state.view.is_loading_history = true;
            state.view.error = None;
            state.history_generation
        };

        let outcome = self
            .api
            .conversation_messages(self.user_id, conversation_id)
            .await;

        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.history_generation != generation || state.view.selected != Some(conversation_id) {
            debug!(conversation_id, "discarding history for a stale selection");
            return;
        }
        state.view.is_loading_history = false;
        match outcome {
            Ok(messages) => {
                state.view.transcript = messages.iter().map(TranscriptEntry::from_message).collect();
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                warn!(conversation_id, error = %err, "failed to load history");
                state.view.transcript.clear();
                state.view.error = Some(format!("Failed to load messages: {}", err.message()));
            }
        }
    }

    /// Sends one message. Blank input is ignored and a send while another
    /// is in flight is refused.
    #[tracing::instrument(skip(self, text), fields(user_id = %self.user_id))]
    pub async fn send(&self, text: &str) -> Result<(), ChatError> {
        let message = text.trim();
        if message.is_empty() {
            return Ok(());
        }

        let conversation_id = {
            let mut state = self.state.lock();
            if state.view.is_sending {
                return Err(ChatError::Busy);
            }
            state.view.is_sending = true;
            state.view.error = None;
            state.view.transcript.push(TranscriptEntry::local(
                MessageRole::User,
                EntryKind::Message,
                message.to_string(),
            ));
            state.view.selected
        };

        let request = ChatRequest {
            message: message.to_string(),
            conversation_id,
        };
        let outcome = self.api.send_chat(self.user_id, &request).await;

        let new_selection = {
            let mut state = self.state.lock();
            if state.closed {
                return outcome.map(|_| ()).map_err(ChatError::from);
            }
            state.view.is_sending = false;
            match &outcome {
                Ok(reply) => {
                    state.view.transcript.push(TranscriptEntry::local(
                        MessageRole::Assistant,
                        EntryKind::Message,
                        reply.response.clone(),
                    ));
                    state
                        .view
                        .transcript
                        .extend(reply.tool_calls.iter().map(TranscriptEntry::tool_call));
                    if let Some(id) = reply.conversation_id {
                        state.view.selected = Some(id);
                    }
                    reply.conversation_id
                }
                Err(err) if err.is_cancelled() => None,
                Err(err) => {
                    warn!(error = %err, "chat request failed");
                    state.view.transcript.push(TranscriptEntry::local(
                        MessageRole::Assistant,
                        EntryKind::ErrorPlaceholder,
                        ERROR_PLACEHOLDER.to_string(),
                    ));
                    None
                }
            }
        };

        if let Some(conversation_id) = new_selection {
            self.persist_selection(Some(conversation_id));
            self.load_conversations().await;
        }

        outcome.map(|_| ()).map_err(ChatError::from)
    }

    /// Clears the transcript and forgets the selection; the server assigns
    /// a new conversation id on the next send.
    pub fn new_conversation(&self) {
        {
            let mut state = self.state.lock();
            state.history_generation += 1;
            state.view.selected = None;
            state.view.transcript.clear();
            state.view.is_loading_history = false;
            state.view.error = None;
        }
        self.persist_selection(None);
    }

    pub fn teardown(&self) {
        self.state.lock().closed = true;
        self.cancel.cancel();
    }

    fn persist_selection(&self, conversation_id: Option<i64>) {
        let storage = self.api.storage();
        let result = match conversation_id {
            Some(id) => storage.set(CONVERSATION_KEY, &id.to_string()),
            None => storage.remove(CONVERSATION_KEY),
        };
        if let Err(err) = result {
            warn!(error = %err, "failed to persist conversation selection");
        }
    }
}

fn most_recent(conversations: &[ConversationDto]) -> Option<i64> {
    conversations
        .iter()
        .max_by_key(|conversation| parse_timestamp(&conversation.last_activity))
        .map(|conversation| conversation.id)
}

/// RFC 3339, or a naive ISO-8601 timestamp read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::Notify;
    use uuid::Uuid;

    use super::{ChatError, ChatModel, ERROR_PLACEHOLDER, EntryKind, parse_timestamp};
    use crate::api::scripted::ScriptedTransport;
    use crate::api::{ApiClient, HttpMethod};
    use crate::storage::{CONVERSATION_KEY, ClientStorage, MemoryStorage};

    struct Fixture {
        model: ChatModel,
        transport: Arc<ScriptedTransport>,
        storage: Arc<MemoryStorage>,
        user: Uuid,
    }

    impl Fixture {
        fn new() -> Self {
            let transport = Arc::new(ScriptedTransport::new());
            let storage = Arc::new(MemoryStorage::new());
            let api = ApiClient::new("http://api.test", transport.clone(), storage.clone());
            let user = Uuid::new_v4();
            Self {
                model: ChatModel::new(&api, user),
                transport,
                storage,
                user,
            }
        }

        fn conversations_path(&self) -> String {
            format!("/api/{}/conversations", self.user)
        }

        fn messages_path(&self, id: i64) -> String {
            format!("/api/{}/conversations/{id}/messages", self.user)
        }

        fn chat_path(&self) -> String {
            format!("/api/{}/chat", self.user)
        }

        fn two_conversations(&self) {
            self.transport.respond(
                HttpMethod::Get,
                &self.conversations_path(),
                200,
                json!([
                    { "id": 1, "last_activity": "2026-03-01T09:00:00" },
                    { "id": 2, "last_activity": "2026-03-02T09:00:00Z" }
                ]),
            );
        }
    }

    #[tokio::test]
    async fn mount_selects_most_recent_conversation() {
        let fixture = Fixture::new();
        fixture.two_conversations();
        fixture.transport.respond(
            HttpMethod::Get,
            &fixture.messages_path(2),
            200,
            json!([
                { "id": 7, "role": "user", "content": "hi", "timestamp": "2026-03-02T08:59:00" },
                { "id": 8, "sender_type": "assistant", "content": "hello", "timestamp": "2026-03-02T09:00:00" }
            ]),
        );

        fixture.model.mount().await;
        let snapshot = fixture.model.snapshot();
        assert_eq!(snapshot.selected, Some(2));
        assert_eq!(fixture.storage.get(CONVERSATION_KEY).as_deref(), Some("2"));
        assert_eq!(snapshot.transcript.len(), 2);
        assert_eq!(snapshot.transcript[0].id, "7-2026-03-02T08:59:00");
        assert_eq!(fixture.transport.count(HttpMethod::Get, &fixture.messages_path(1)), 0);
    }

    #[tokio::test]
    async fn mount_keeps_restored_selection() {
        let fixture = Fixture::new();
        fixture.storage.set(CONVERSATION_KEY, "1").expect("seed selection");
        fixture.two_conversations();
        fixture
            .transport
            .respond(HttpMethod::Get, &fixture.messages_path(1), 200, json!([]));

        fixture.model.mount().await;
        assert_eq!(fixture.model.snapshot().selected, Some(1));
        assert_eq!(fixture.transport.count(HttpMethod::Get, &fixture.messages_path(1)), 1);
    }

    #[tokio::test]
    async fn failed_history_clears_transcript() {
        let fixture = Fixture::new();
        fixture.transport.respond(
            HttpMethod::Get,
            &fixture.messages_path(1),
            200,
            json!([{ "id": 1, "role": "user", "content": "old", "timestamp": "" }]),
        );
        fixture.transport.respond(
            HttpMethod::Get,
            &fixture.messages_path(1),
            500,
            json!({ "message": "gone" }),
        );

        fixture.model.select(1).await;
        assert_eq!(fixture.model.snapshot().transcript.len(), 1);
        fixture.model.select(1).await;
        let snapshot = fixture.model.snapshot();
        assert!(snapshot.transcript.is_empty());
        assert!(snapshot.error.is_some());
    }

    #[tokio::test]
    async fn healthy_selection_clears_earlier_load_error() {
        let fixture = Fixture::new();
        fixture.transport.respond(
            HttpMethod::Get,
            &fixture.messages_path(1),
            500,
            json!({ "message": "gone" }),
        );
        fixture.transport.respond(
            HttpMethod::Get,
            &fixture.messages_path(2),
            200,
            json!([{ "id": 7, "role": "assistant", "content": "hi", "timestamp": "" }]),
        );

        fixture.model.select(1).await;
        assert!(fixture.model.snapshot().error.is_some());

        fixture.model.select(2).await;
        let snapshot = fixture.model.snapshot();
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.transcript.len(), 1);
    }

    #[tokio::test]
    async fn history_for_previous_selection_is_discarded() {
        let fixture = Fixture::new();
        let gate = Arc::new(Notify::new());
        fixture.transport.respond_after(
            HttpMethod::Get,
            &fixture.messages_path(1),
            gate.clone(),
            200,
            json!([{ "id": 1, "role": "user", "content": "from one", "timestamp": "" }]),
        );
        fixture.transport.respond(
            HttpMethod::Get,
            &fixture.messages_path(2),
            200,
            json!([{ "id": 2, "role": "user", "content": "from two", "timestamp": "" }]),
        );

        let model = fixture.model.clone();
        let first = tokio::spawn(async move { model.select(1).await });
        tokio::task::yield_now().await;
        fixture.model.select(2).await;
        gate.notify_one();
        first.await.expect("join");

        let transcript = fixture.model.snapshot().transcript;
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].content, "from two");
    }

    #[tokio::test]
    async fn reply_with_tool_calls_adds_entries_and_persists_conversation() {
        let fixture = Fixture::new();
        fixture.transport.respond(
            HttpMethod::Post,
            &fixture.chat_path(),
            200,
            json!({
                "response": "Added it.",
                "conversation_id": 9,
                "tool_calls": [
                    { "name": "add_task", "arguments": { "title": "Buy milk" }, "result": { "ok": true } }
                ]
            }),
        );
        fixture
            .transport
            .respond(HttpMethod::Get, &fixture.conversations_path(), 200, json!([{ "id": 9 }]));

        fixture.model.send("  add buy milk ").await.expect("send");

        let snapshot = fixture.model.snapshot();
        let kinds: Vec<EntryKind> = snapshot.transcript.iter().map(|entry| entry.kind).collect();
        assert_eq!(
            kinds,
            vec![EntryKind::Message, EntryKind::Message, EntryKind::ToolInvocation]
        );
        assert_eq!(snapshot.transcript[0].content, "add buy milk");
        assert_eq!(
            snapshot.transcript[2].content,
            r#"Tool call: add_task with arguments {"title":"Buy milk"} resulted in {"ok":true}"#
        );
        assert_eq!(snapshot.selected, Some(9));
        assert!(!snapshot.is_sending);
        assert_eq!(fixture.storage.get(CONVERSATION_KEY).as_deref(), Some("9"));
        assert_eq!(fixture.transport.count(HttpMethod::Get, &fixture.conversations_path()), 1);
        assert_eq!(
            fixture.transport.requests()[0].json_body(),
            Some(json!({ "message": "add buy milk" }))
        );
    }

    #[tokio::test]
    async fn failed_send_appends_placeholder() {
        let fixture = Fixture::new();
        fixture
            .transport
            .fail(HttpMethod::Post, &fixture.chat_path(), "connection refused");

        fixture.model.send("hello").await.expect_err("network failure");
        let transcript = fixture.model.snapshot().transcript;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].kind, EntryKind::ErrorPlaceholder);
        assert_eq!(transcript[1].content, ERROR_PLACEHOLDER);
    }

    #[tokio::test]
    async fn second_send_is_refused_while_waiting() {
        let fixture = Fixture::new();
        let gate = Arc::new(Notify::new());
        fixture.transport.respond_after(
            HttpMethod::Post,
            &fixture.chat_path(),
            gate.clone(),
            200,
            json!({ "response": "ok" }),
        );

        let model = fixture.model.clone();
        let first = tokio::spawn(async move { model.send("one").await });
        tokio::task::yield_now().await;
        assert!(fixture.model.snapshot().is_sending);

        let err = fixture.model.send("two").await.expect_err("busy");
        assert!(matches!(err, ChatError::Busy));

        fixture.model.send("   ").await.expect("blank is ignored");
        gate.notify_one();
        first.await.expect("join").expect("first send");
        assert_eq!(fixture.model.snapshot().transcript.len(), 2);
        assert_eq!(fixture.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn new_conversation_forgets_selection() {
        let fixture = Fixture::new();
        fixture
            .transport
            .respond(HttpMethod::Get, &fixture.messages_path(3), 200, json!([]));
        fixture.model.select(3).await;

        fixture.model.new_conversation();
        let snapshot = fixture.model.snapshot();
        assert_eq!(snapshot.selected, None);
        assert!(snapshot.transcript.is_empty());
        assert_eq!(fixture.storage.get(CONVERSATION_KEY), None);
    }

    #[test]
    fn naive_timestamps_read_as_utc() {
        let naive = parse_timestamp("2026-03-02T09:00:00").expect("naive");
        let zoned = parse_timestamp("2026-03-02T09:00:00+00:00").expect("rfc3339");
        assert_eq!(naive, zoned);
        assert!(parse_timestamp("").is_none());
    }
}
