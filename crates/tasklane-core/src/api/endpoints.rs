use serde_json::Value;
use tasklane_shared::{
    AuthResponse, ChatReply, ChatRequest, ConversationDto, LoginRequest, MessageDto,
    ProfileUpdate, RegisterRequest, TaskCreate, TaskDto, TaskPatch, TokenVerification, UserDto,
};
use uuid::Uuid;

use super::{ApiClient, HttpMethod};
use crate::error::ApiError;

const AUTH_PREFIX: &str = "/api/v1/auth";

fn tasks_path(user_id: Uuid) -> String {
    format!("/api/{user_id}/tasks")
}

fn task_path(user_id: Uuid, task_id: Uuid) -> String {
    format!("/api/{user_id}/tasks/{task_id}")
}

impl ApiClient {
    #[tracing::instrument(skip(self, request), fields(email = %request.email))]
    pub async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ApiError> {
        self.post(&format!("{AUTH_PREFIX}/login"), request).await
    }

    #[tracing::instrument(skip(self, request), fields(email = %request.email, username = %request.username))]
    pub async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, ApiError> {
        self.post(&format!("{AUTH_PREFIX}/register"), request).await
    }

    pub async fn current_user(&self) -> Result<UserDto, ApiError> {
        self.get(&format!("{AUTH_PREFIX}/me")).await
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        self.request(HttpMethod::Post, &format!("{AUTH_PREFIX}/logout"), None)
            .await
            .map(|_| ())
    }

    pub async fn verify_token(&self) -> Result<TokenVerification, ApiError> {
        self.get(&format!("{AUTH_PREFIX}/verify")).await
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserDto, ApiError> {
        self.put("/api/v1/users/me", update).await
    }

    /// `completed` narrows the list server-side when given.
    pub async fn list_tasks(
        &self,
        user_id: Uuid,
        completed: Option<bool>,
    ) -> Result<Vec<TaskDto>, ApiError> {
        self.get_with_query(
            &tasks_path(user_id),
            &[("is_completed", completed.map(|done| done.to_string()))],
        )
        .await
    }

    pub async fn create_task(&self, user_id: Uuid, task: &TaskCreate) -> Result<TaskDto, ApiError> {
        self.post(&tasks_path(user_id), task).await
    }

    pub async fn update_task(
        &self,
        user_id: Uuid,
        task_id: Uuid,
        patch: &TaskPatch,
    ) -> Result<TaskDto, ApiError> {
        self.put(&task_path(user_id, task_id), patch).await
    }

    pub async fn patch_task(
        &self,
        user_id: Uuid,
        task_id: Uuid,
        patch: &TaskPatch,
    ) -> Result<TaskDto, ApiError> {
        self.patch(&task_path(user_id, task_id), patch).await
    }

    pub async fn delete_task(&self, user_id: Uuid, task_id: Uuid) -> Result<(), ApiError> {
        self.delete(&task_path(user_id, task_id)).await
    }

    pub async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationDto>, ApiError> {
        self.get(&format!("/api/{user_id}/conversations")).await
    }

    pub async fn conversation_messages(
        &self,
        user_id: Uuid,
        conversation_id: i64,
    ) -> Result<Vec<MessageDto>, ApiError> {
        self.get(&format!(
            "/api/{user_id}/conversations/{conversation_id}/messages"
        ))
        .await
    }

    #[tracing::instrument(skip(self, request), fields(conversation_id = ?request.conversation_id))]
    pub async fn send_chat(&self, user_id: Uuid, request: &ChatRequest) -> Result<ChatReply, ApiError> {
        self.post(&format!("/api/{user_id}/chat"), request).await
    }
}

/// Server-assigned message ids arrive as numbers or strings.
pub fn message_id_text(id: &Value) -> String {
    match id {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tasklane_shared::{ChatRequest, LoginRequest, TaskPatch};
    use uuid::Uuid;

    use super::message_id_text;
    use crate::api::scripted::ScriptedTransport;
    use crate::api::{ApiClient, HttpMethod};
    use crate::storage::MemoryStorage;

    fn client(transport: &Arc<ScriptedTransport>) -> ApiClient {
        ApiClient::new(
            "http://api.test",
            transport.clone(),
            Arc::new(MemoryStorage::new()),
        )
    }

    #[tokio::test]
    async fn login_posts_credentials_to_auth_endpoint() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            HttpMethod::Post,
            "/api/v1/auth/login",
            200,
            json!({ "token": "t-1" }),
        );
        let api = client(&transport);

        let reply = api
            .login(&LoginRequest {
                email: "a@b.c".to_string(),
                password: "pw".to_string(),
            })
            .await
            .expect("login");
        assert_eq!(reply.bearer_token(), Some("t-1"));

        let sent = transport.requests()[0].json_body().expect("json body");
        assert_eq!(sent, json!({ "email": "a@b.c", "password": "pw" }));
    }

    #[tokio::test]
    async fn completion_goes_out_as_patch_and_edit_as_put() {
        let transport = Arc::new(ScriptedTransport::new());
        let user = Uuid::new_v4();
        let task = Uuid::new_v4();
        let path = format!("/api/{user}/tasks/{task}");
        let body = json!({
            "task_id": task,
            "user_id": user,
            "title": "t",
            "is_completed": true
        });
        transport.respond(HttpMethod::Patch, &path, 200, body.clone());
        transport.respond(HttpMethod::Put, &path, 200, body);
        let api = client(&transport);

        let done = TaskPatch {
            is_completed: Some(true),
            ..TaskPatch::default()
        };
        api.patch_task(user, task, &done).await.expect("patch");
        api.update_task(user, task, &done).await.expect("put");

        assert_eq!(transport.count(HttpMethod::Patch, &path), 1);
        assert_eq!(transport.count(HttpMethod::Put, &path), 1);
    }

    #[tokio::test]
    async fn list_tasks_passes_completion_filter() {
        let transport = Arc::new(ScriptedTransport::new());
        let user = Uuid::new_v4();
        transport.respond(
            HttpMethod::Get,
            &format!("/api/{user}/tasks?is_completed=false"),
            200,
            json!([]),
        );
        let api = client(&transport);

        let tasks = api.list_tasks(user, Some(false)).await.expect("list");
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn chat_without_conversation_omits_the_field() {
        let transport = Arc::new(ScriptedTransport::new());
        let user = Uuid::new_v4();
        transport.respond(
            HttpMethod::Post,
            &format!("/api/{user}/chat"),
            200,
            json!({ "response": "hi", "conversation_id": 3 }),
        );
        let api = client(&transport);

        let reply = api
            .send_chat(
                user,
                &ChatRequest {
                    message: "hello".to_string(),
                    conversation_id: None,
                },
            )
            .await
            .expect("chat");
        assert_eq!(reply.conversation_id, Some(3));
        assert_eq!(
            transport.requests()[0].json_body(),
            Some(json!({ "message": "hello" }))
        );
    }

    #[tokio::test]
    async fn logout_accepts_empty_reply() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(HttpMethod::Post, "/api/v1/auth/logout", 204, json!(null));
        client(&transport).logout().await.expect("logout");
    }

    #[test]
    fn message_ids_render_without_quotes() {
        assert_eq!(message_id_text(&json!(12)), "12");
        assert_eq!(message_id_text(&json!("m-1")), "m-1");
    }
}
